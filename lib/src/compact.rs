//! Online compaction: copy the live quads of the current generation into a
//! fresh one and switch the store over to it while readers keep running.

use crate::errors::{Result, StoreError};
use crate::generation::{current_generation, Generation, GenerationId};
use crate::index::TupleTable;
use crate::location::Location;
use crate::node::NodeTable;
use crate::options::OldGeneration;
use crate::params::StoreParams;
use crate::storage::{write_data_file, DiskStorage, MemoryStorage};
use crate::switchable::SwitchableGeneration;
use log::{debug, error, info, warn};
use oxigraph::model::Quad;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionState {
    Idle,
    Copying,
    Switching,
    /// The last attempt failed; the original generation is still current.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub from: GenerationId,
    pub to: GenerationId,
    pub quads: usize,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub old_removed: bool,
    pub elapsed: Duration,
}

/// Compaction driver of one location. At most one compaction runs at a time;
/// a concurrent request is rejected rather than queued.
pub struct Compactor {
    location: Location,
    exclusive_timeout: Duration,
    running: Mutex<()>,
    state: Mutex<CompactionState>,
}

impl Compactor {
    pub fn new(location: Location, exclusive_timeout: Duration) -> Self {
        Self {
            location,
            exclusive_timeout,
            running: Mutex::new(()),
            state: Mutex::new(CompactionState::Idle),
        }
    }

    pub fn state(&self) -> CompactionState {
        *self.state.lock()
    }

    fn set_state(&self, state: CompactionState) {
        debug!("compaction of {}: {state:?}", self.location);
        *self.state.lock() = state;
    }

    pub fn compact(
        &self,
        container: &SwitchableGeneration,
        old_generations: OldGeneration,
    ) -> Result<CompactionReport> {
        let _running = self
            .running
            .try_lock()
            .ok_or_else(|| StoreError::CompactionInProgress(self.location.to_string()))?;
        let started = Instant::now();
        let old = container.get();
        info!("Compacting {} from generation {}", self.location, old.id());

        self.set_state(CompactionState::Copying);
        let (new, quads) = match self.prepare(&old) {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.failed(e)),
        };

        self.set_state(CompactionState::Switching);
        if let Err(e) = self.switch(container, &old, &new) {
            return Err(self.failed(e));
        }

        let old_removed = match (old_generations, old.path()) {
            (OldGeneration::Delete, Some(dir)) => {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    let err = StoreError::Switchover(format!(
                        "generation {} is installed but {} could not be removed: {e}",
                        new.id(),
                        dir.display()
                    ));
                    return Err(self.failed(err));
                }
                info!("Removed superseded generation {}", dir.display());
                true
            }
            _ => false,
        };

        self.set_state(CompactionState::Idle);
        let report = CompactionReport {
            from: old.id(),
            to: new.id(),
            quads,
            nodes_before: old.nodes().len(),
            nodes_after: new.nodes().len(),
            old_removed,
            elapsed: started.elapsed(),
        };
        info!(
            "Compacted {} into generation {}: {} quad(s), {} -> {} node(s) in {:?}",
            self.location, report.to, report.quads, report.nodes_before, report.nodes_after,
            report.elapsed
        );
        Ok(report)
    }

    fn failed(&self, err: StoreError) -> StoreError {
        if err.is_fatal() {
            error!("Compaction of {} failed: {err}", self.location);
        } else {
            warn!("Compaction of {} abandoned: {err}", self.location);
        }
        self.set_state(CompactionState::Failed);
        err
    }

    /// Builds the next generation from the committed state of `old`. Writers
    /// on `old` stay blocked on success; on failure they are released and
    /// anything written for the new generation is removed.
    fn prepare(&self, old: &Arc<Generation>) -> Result<(Arc<Generation>, usize)> {
        match &self.location {
            Location::Directory(root) => self.prepare_disk(root, old),
            Location::Memory => {
                let next = old.id().next();
                old.coordinator().block_writers(self.exclusive_timeout)?;
                match copy_live(old, old.params(), None) {
                    Ok((nodes, table, quads)) => {
                        let new = Generation::from_parts(
                            next,
                            old.params().clone(),
                            nodes,
                            table,
                            0,
                            Box::new(MemoryStorage),
                        );
                        Ok((new, quads))
                    }
                    Err(e) => {
                        release_writers(old);
                        Err(e)
                    }
                }
            }
        }
    }

    fn prepare_disk(&self, root: &Path, old: &Arc<Generation>) -> Result<(Arc<Generation>, usize)> {
        let on_disk = current_generation(root)?;
        if on_disk != Some(old.id()) {
            return Err(StoreError::Compaction(format!(
                "{} holds generation {on_disk:?} but the store is serving {}",
                root.display(),
                old.id()
            )));
        }
        let old_dir = old
            .path()
            .ok_or_else(|| {
                StoreError::Compaction(format!("generation {} has no directory", old.id()))
            })?
            .to_path_buf();
        let next = old.id().next();
        let final_dir = root.join(next.dir_name());
        let staging = root.join(next.staging_dir_name());
        if final_dir.exists() {
            return Err(StoreError::Compaction(format!(
                "{} already exists",
                final_dir.display()
            )));
        }

        old.coordinator().block_writers(self.exclusive_timeout)?;
        let built = (|| -> Result<(Arc<Generation>, usize)> {
            std::fs::create_dir(&staging)?;
            StoreParams::copy_file(&old_dir, &staging)?;
            let (nodes, table, quads) = copy_live(old, old.params(), Some(&staging))?;
            std::fs::rename(&staging, &final_dir)?;
            sync_dir(root);
            let (storage, _) = DiskStorage::open(&final_dir, old.params().sync_commits)?;
            let new = Generation::from_parts(
                next,
                old.params().clone(),
                nodes,
                table,
                0,
                Box::new(storage),
            );
            Ok((new, quads))
        })();
        if built.is_err() {
            remove_partial(&[staging, final_dir]);
            release_writers(old);
        }
        built
    }

    /// Exclusive convoy (new, then old), swap, release new, retire old.
    fn switch(
        &self,
        container: &SwitchableGeneration,
        old: &Arc<Generation>,
        new: &Arc<Generation>,
    ) -> Result<()> {
        new.coordinator().take_over_from(old.coordinator());
        if let Err(e) = new.coordinator().enter_exclusive_mode(self.exclusive_timeout) {
            abandon(old, new);
            return Err(e);
        }
        if let Err(e) = old.coordinator().enter_exclusive_mode(self.exclusive_timeout) {
            let _ = new.coordinator().exit_exclusive_mode();
            abandon(old, new);
            return Err(e);
        }

        let swapped = container.change(old, new.clone());
        if !swapped {
            let previous = container.set(new.clone());
            error!(
                "Generation {} was replaced by {} during compaction; installed {} anyway",
                old.id(),
                previous.id(),
                new.id()
            );
        }
        new.coordinator().exit_exclusive_mode()?;
        old.coordinator().retire();
        if !swapped {
            return Err(StoreError::Switchover(format!(
                "generation {} was not current at switchover",
                old.id()
            )));
        }
        debug!("switched from generation {} to {}", old.id(), new.id());
        Ok(())
    }
}

/// Re-encodes every committed quad of `old` into fresh tables, optionally
/// writing them as the base snapshot of `staging`.
fn copy_live(
    old: &Generation,
    params: &StoreParams,
    staging: Option<&Path>,
) -> Result<(NodeTable, TupleTable, usize)> {
    let (_, snapshot) = old.coordinator().committed_snapshot();
    let nodes = NodeTable::with_capacity(params.node_cache_size);
    let mut table = TupleTable::new(&params.index_orders()?)?;
    let quads = snapshot.iter().map(|tuple| -> Result<Quad> {
        let quad = old.nodes().decode(&tuple)?;
        table.add(nodes.encode(quad.as_ref()));
        Ok(quad)
    });
    let count = match staging {
        Some(dir) => write_data_file(dir, quads)?,
        None => {
            let mut count = 0;
            for quad in quads {
                quad?;
                count += 1;
            }
            count
        }
    };
    Ok((nodes, table, count))
}

fn release_writers(old: &Generation) {
    if let Err(e) = old.coordinator().enable_writers() {
        error!("Could not re-enable writers on generation {}: {e}", old.id());
    }
}

fn abandon(old: &Generation, new: &Generation) {
    if let Some(dir) = new.path() {
        remove_partial(&[dir.to_path_buf()]);
    }
    release_writers(old);
}

fn remove_partial(paths: &[PathBuf]) {
    for path in paths {
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else if path.exists() {
            std::fs::remove_file(path)
        } else {
            continue;
        };
        match result {
            Ok(()) => info!("Removed partial generation {}", path.display()),
            Err(e) => warn!("Could not remove partial generation {}: {e}", path.display()),
        }
    }
}

fn sync_dir(dir: &Path) {
    // directory fsync makes the rename durable; not supported everywhere
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::TxnMode;
    use oxigraph::model::{GraphName, NamedNode};

    fn quad(i: usize) -> Quad {
        Quad::new(
            NamedNode::new_unchecked(format!("http://example.org/s{i}")),
            NamedNode::new_unchecked("http://example.org/p"),
            NamedNode::new_unchecked(format!("http://example.org/o{i}")),
            GraphName::DefaultGraph,
        )
    }

    fn memory_container() -> SwitchableGeneration {
        let generation =
            Generation::memory(GenerationId::FIRST, StoreParams::with_indexes(["SPOG", "POSG"]))
                .unwrap();
        SwitchableGeneration::new(generation)
    }

    #[test]
    fn memory_compaction_drops_dead_nodes() {
        let container = memory_container();
        let old = container.get();
        let mut txn = old.begin(TxnMode::Write).unwrap();
        for i in 0..10 {
            txn.add(&quad(i)).unwrap();
        }
        txn.commit().unwrap();
        txn.end().unwrap();
        let mut txn = old.begin(TxnMode::Write).unwrap();
        for i in 0..5 {
            txn.delete(&quad(i)).unwrap();
        }
        txn.commit().unwrap();
        txn.end().unwrap();

        let compactor = Compactor::new(Location::mem(), Duration::from_secs(1));
        let report = compactor
            .compact(&container, OldGeneration::Keep)
            .unwrap();
        assert_eq!(report.from, GenerationId::FIRST);
        assert_eq!(report.to, GenerationId::new(2));
        assert_eq!(report.quads, 5);
        assert!(report.nodes_after < report.nodes_before);
        assert_eq!(compactor.state(), CompactionState::Idle);

        let new = container.get();
        assert_eq!(new.id(), GenerationId::new(2));
        assert_eq!(new.len(), 5);
        assert_eq!(new.coordinator().data_version(), 2);
        assert!(old.coordinator().is_retired());
        assert!(!new.coordinator().is_exclusive());
    }

    #[test]
    fn stuck_writer_fails_compaction_without_switching() {
        let container = Arc::new(memory_container());
        let old = container.get();
        let (tx, rx) = std::sync::mpsc::channel();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let g = old.clone();
        let writer = std::thread::spawn(move || {
            let mut w = g.begin(TxnMode::Write).unwrap();
            tx.send(()).unwrap();
            go_rx.recv().unwrap();
            w.commit().unwrap();
        });
        rx.recv().unwrap();
        let compactor = Compactor::new(Location::mem(), Duration::from_millis(50));
        let err = compactor
            .compact(&container, OldGeneration::Keep)
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(compactor.state(), CompactionState::Failed);
        assert_eq!(container.get().id(), GenerationId::FIRST);
        go_tx.send(()).unwrap();
        writer.join().unwrap();

        // writers were released again
        let mut w = old.begin(TxnMode::Write).unwrap();
        w.add(&quad(1)).unwrap();
        w.commit().unwrap();
    }

    #[test]
    fn exclusive_timeout_abandons_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let params = StoreParams::with_indexes(["SPOG"]);
        let old_dir = dir.path().join(GenerationId::FIRST.dir_name());
        let new_dir = dir.path().join(GenerationId::new(2).dir_name());
        let old = Generation::create_disk(&old_dir, GenerationId::FIRST, params.clone()).unwrap();
        let new = Generation::create_disk(&new_dir, GenerationId::new(2), params).unwrap();
        let container = SwitchableGeneration::new(old.clone());

        old.coordinator()
            .block_writers(Duration::from_secs(1))
            .unwrap();
        // a writer the convoy cannot drain
        let stuck = new.begin(TxnMode::Write).unwrap();
        let compactor = Compactor::new(Location::dir(dir.path()), Duration::from_millis(50));
        let err = compactor.switch(&container, &old, &new).unwrap_err();
        assert!(matches!(err, StoreError::ExclusiveTimeout { .. }));
        assert!(err.is_fatal());
        drop(stuck);

        assert_eq!(container.get().id(), GenerationId::FIRST);
        assert!(!new_dir.exists());
        assert!(old_dir.exists());
        assert!(!old.coordinator().is_retired());
        assert!(!old.coordinator().is_exclusive());
        let mut w = old.try_begin(TxnMode::Write).unwrap().unwrap();
        w.add(&quad(1)).unwrap();
        w.commit().unwrap();
        w.end().unwrap();
        assert_eq!(old.len(), 1);
    }

    #[test]
    fn failed_removal_of_old_generation_is_fatal_but_keeps_switch() {
        let dir = tempfile::tempdir().unwrap();
        let old_dir = dir.path().join(GenerationId::FIRST.dir_name());
        let old = Generation::create_disk(
            &old_dir,
            GenerationId::FIRST,
            StoreParams::with_indexes(["SPOG"]),
        )
        .unwrap();
        let mut txn = old.begin(TxnMode::Write).unwrap();
        for i in 0..3 {
            txn.add(&quad(i)).unwrap();
        }
        txn.commit().unwrap();
        txn.end().unwrap();
        let container = SwitchableGeneration::new(old.clone());

        // the directory is already gone by the time it should be removed
        std::fs::remove_dir_all(&old_dir).unwrap();
        let compactor = Compactor::new(Location::mem(), Duration::from_secs(1));
        let err = compactor
            .compact(&container, OldGeneration::Delete)
            .unwrap_err();
        assert!(matches!(err, StoreError::Switchover(_)));
        assert!(err.is_fatal());
        assert_eq!(compactor.state(), CompactionState::Failed);

        let current = container.get();
        assert_eq!(current.id(), GenerationId::new(2));
        assert_eq!(current.len(), 3);
        assert!(old.coordinator().is_retired());
        assert!(!current.coordinator().is_exclusive());
    }
}

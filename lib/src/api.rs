//! The `Store` handle: opens a location, hands out transactions on the
//! current generation and drives compaction and backups.

use crate::backup::write_backup;
use crate::compact::{CompactionReport, CompactionState, Compactor};
use crate::config::StoreConfig;
use crate::consts::{LOG_ENV, MAX_SWITCH_RETRIES};
use crate::coordinator::CoordinatorStats;
use crate::errors::{Result, StoreError};
use crate::generation::{current_generation, list_generations, Generation, GenerationId};
use crate::location::{clean_location, Location, LocationLock};
use crate::options::{OldGeneration, Wait};
use crate::storage::write_nquads;
use crate::switchable::SwitchableGeneration;
use crate::txn::{Transaction, TxnMode};
use log::{debug, info, warn};
use oxigraph::io::{RdfFormat, RdfParser};
use oxigraph::model::GraphName;
use serde::Serialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Initializes logging for the genstore library.
///
/// If `GENSTORE_LOG` is set, its value is copied to `RUST_LOG`, so it takes
/// precedence. The logger itself (e.g. `env_logger::init()`) must be
/// initialized after calling this.
pub fn init_logging() {
    if let Ok(log_level) = std::env::var(LOG_ENV) {
        std::env::set_var("RUST_LOG", log_level);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub location: String,
    pub generation: String,
    pub storage: &'static str,
    pub quads: usize,
    pub nodes: usize,
    pub compaction: CompactionState,
    pub coordinator: CoordinatorStats,
}

struct StoreInner {
    config: StoreConfig,
    container: SwitchableGeneration,
    compactor: Compactor,
    // Released last.
    _lock: Option<LocationLock>,
}

/// Handle to an open location. Cheap to clone; all clones share the same
/// generation container and compactor.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (or creates) the location named by `config`.
    ///
    /// For a directory this takes the location lock, removes staging
    /// directories left by an interrupted compaction and opens the
    /// highest-numbered generation. An empty directory gets `Data-0001`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let (generation, lock) = match &config.location {
            Location::Directory(root) => {
                let lock = LocationLock::acquire(root)?;
                let removed = clean_location(root)?;
                if !removed.is_empty() {
                    info!("Removed {} incomplete generation(s)", removed.len());
                }
                let generation = Self::open_generation(&config, root)?;
                (generation, Some(lock))
            }
            Location::Memory => (
                Generation::memory(GenerationId::FIRST, config.params_or_default())?,
                None,
            ),
        };
        info!(
            "Opened store at {} on generation {} ({} quad(s))",
            config.location,
            generation.id(),
            generation.len()
        );
        let compactor = Compactor::new(config.location.clone(), config.exclusive_timeout);
        Ok(Self {
            inner: Arc::new(StoreInner {
                container: SwitchableGeneration::new(generation),
                compactor,
                config,
                _lock: lock,
            }),
        })
    }

    /// Opens a fresh in-memory store with default settings.
    pub fn open_mem() -> Result<Self> {
        Self::open(StoreConfig::memory()?)
    }

    fn open_generation(config: &StoreConfig, root: &Path) -> Result<Arc<Generation>> {
        match current_generation(root)? {
            Some(id) => {
                let dir = root.join(id.dir_name());
                let generation = Generation::open_disk(&dir, id)?;
                if let Some(params) = &config.params {
                    if params != generation.params() {
                        warn!(
                            "Ignoring supplied parameters; {} keeps the parameters it was created with",
                            dir.display()
                        );
                    }
                }
                Ok(generation)
            }
            None => {
                let id = GenerationId::FIRST;
                Generation::create_disk(&root.join(id.dir_name()), id, config.params_or_default())
            }
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn location(&self) -> &Location {
        &self.inner.config.location
    }

    /// The generation currently installed. Do not keep it across operations.
    pub fn current(&self) -> Arc<Generation> {
        self.inner.container.get()
    }

    pub fn current_generation(&self) -> GenerationId {
        self.current().id()
    }

    // Runs `op` on the current generation, re-resolving it when a switchover
    // retired the generation underneath.
    fn on_current<T>(&self, mut op: impl FnMut(&Arc<Generation>) -> Result<T>) -> Result<T> {
        let mut attempts = 0;
        loop {
            let generation = self.current();
            match op(&generation) {
                Err(StoreError::Retired(id)) if attempts < MAX_SWITCH_RETRIES => {
                    attempts += 1;
                    debug!("Generation {id} retired during begin, retrying ({attempts})");
                }
                other => return other,
            }
        }
    }

    /// Begins a transaction, blocking while the writer slot is taken.
    pub fn begin(&self, mode: TxnMode) -> Result<Transaction> {
        self.on_current(|generation| generation.begin(mode))
    }

    /// Begins a transaction, or returns `None` if that would block.
    pub fn try_begin(&self, mode: TxnMode) -> Result<Option<Transaction>> {
        self.begin_with(mode, Wait::NoWait)
    }

    pub fn begin_with(&self, mode: TxnMode, wait: Wait) -> Result<Option<Transaction>> {
        self.on_current(|generation| generation.begin_with(mode, wait))
    }

    pub fn begin_read(&self) -> Result<Transaction> {
        self.begin(TxnMode::Read)
    }

    pub fn begin_write(&self) -> Result<Transaction> {
        self.begin(TxnMode::Write)
    }

    /// Runs `f` in a read transaction.
    pub fn execute_read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut txn = self.begin_read()?;
        let result = f(&txn);
        match &result {
            Ok(_) => txn.commit()?,
            Err(_) => txn.abort()?,
        }
        txn.end()?;
        result
    }

    /// Runs `f` in a write transaction, committing when it succeeds and
    /// aborting when it fails.
    pub fn execute_write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut txn = self.begin_write()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                txn.end()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!("Abort after failed write transaction failed: {abort_err}");
                }
                txn.end()?;
                Err(e)
            }
        }
    }

    /// Parses RDF from `reader` and adds it in one write transaction.
    /// Triples land in `graph`, or the default graph when `None`. Returns
    /// the number of quads that were not already present.
    pub fn load<R: Read>(
        &self,
        reader: R,
        format: RdfFormat,
        graph: Option<GraphName>,
    ) -> Result<usize> {
        let mut parser = RdfParser::from_format(format);
        if let Some(graph) = graph {
            parser = parser.with_default_graph(graph);
        }
        self.execute_write(|txn| {
            let mut added = 0;
            for quad in parser.for_reader(reader) {
                if txn.add(&quad?)? {
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    /// Writes every committed quad as N-Quads. Returns the number written.
    pub fn dump<W: Write>(&self, writer: W) -> Result<usize> {
        self.execute_read(|txn| {
            let (mut writer, count) = write_nquads(writer, txn.quads()?)?;
            writer.flush()?;
            Ok(count)
        })
    }

    /// Compacts with the configured treatment of the old generation.
    pub fn compact(&self) -> Result<CompactionReport> {
        self.compact_with(self.inner.config.old_generations)
    }

    pub fn compact_with(&self, old_generations: OldGeneration) -> Result<CompactionReport> {
        self.inner
            .compactor
            .compact(&self.inner.container, old_generations)
    }

    pub fn compaction_state(&self) -> CompactionState {
        self.inner.compactor.state()
    }

    /// Writes a compressed dump of the latest committed state into
    /// `<location>/Backups`.
    pub fn backup(&self) -> Result<(PathBuf, usize)> {
        let root = self.root().ok_or_else(|| {
            StoreError::Config("in-memory stores cannot be backed up".to_string())
        })?;
        let mut txn = self.begin_read()?;
        let result = write_backup(&root, &txn);
        txn.end()?;
        result
    }

    /// Generations present at the location, oldest first.
    pub fn generations(&self) -> Result<Vec<GenerationId>> {
        match self.location() {
            Location::Directory(root) => list_generations(root),
            Location::Memory => Ok(vec![self.current_generation()]),
        }
    }

    pub fn stats(&self) -> StoreStats {
        let generation = self.current();
        StoreStats {
            location: self.location().to_string(),
            generation: generation.id().dir_name(),
            storage: generation.storage_type(),
            quads: generation.len(),
            nodes: generation.nodes().len(),
            compaction: self.compaction_state(),
            coordinator: generation.coordinator().stats(),
        }
    }

    /// Forces committed data of the current generation to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.current().storage().sync()
    }

    fn root(&self) -> Option<PathBuf> {
        self.location().path().map(Path::to_path_buf)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("location", self.location())
            .field("generation", &self.current_generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::{NamedNode, Quad};

    fn quad(s: &str) -> Quad {
        Quad::new(
            NamedNode::new_unchecked(format!("http://example.org/{s}")),
            NamedNode::new_unchecked("http://example.org/p"),
            NamedNode::new_unchecked("http://example.org/o"),
            GraphName::DefaultGraph,
        )
    }

    #[test]
    fn execute_write_commits_or_aborts() {
        let store = Store::open_mem().unwrap();
        store.execute_write(|txn| txn.add(&quad("a"))).unwrap();
        let failed: Result<()> = store.execute_write(|txn| {
            txn.add(&quad("b"))?;
            Err(StoreError::Conflict("rejected".into()))
        });
        assert!(failed.is_err());
        let present = store
            .execute_read(|txn| Ok((txn.contains(&quad("a"))?, txn.contains(&quad("b"))?)))
            .unwrap();
        assert_eq!(present, (true, false));
    }

    #[test]
    fn load_and_dump_turtle() {
        let store = Store::open_mem().unwrap();
        let ttl = "<http://example.org/s> <http://example.org/p> \"v\" .\n";
        let graph = GraphName::NamedNode(NamedNode::new_unchecked("http://example.org/g"));
        let added = store
            .load(ttl.as_bytes(), RdfFormat::Turtle, Some(graph))
            .unwrap();
        assert_eq!(added, 1);
        let mut out = Vec::new();
        assert_eq!(store.dump(&mut out).unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("<http://example.org/g>"));
    }

    #[test]
    fn memory_store_has_no_backups() {
        let store = Store::open_mem().unwrap();
        assert!(matches!(store.backup(), Err(StoreError::Config(_))));
        assert_eq!(store.generations().unwrap(), vec![GenerationId::FIRST]);
    }

    #[test]
    fn stats_track_commits() {
        let store = Store::open_mem().unwrap();
        store.execute_write(|txn| txn.add(&quad("a"))).unwrap();
        let stats = store.stats();
        assert_eq!(stats.quads, 1);
        assert_eq!(stats.generation, "Data-0001");
        assert_eq!(stats.coordinator.commits, 1);
        assert_eq!(stats.compaction, CompactionState::Idle);
    }
}

//! Generations: numbered, self-contained copies of a store's tables.
//!
//! On disk a generation is a directory `Data-NNNN` under the location root.
//! A compaction stages the next generation as `Data-NNNN-tmp` and renames it
//! into place once it is complete.

use crate::consts::{GENERATION_DIGITS, GENERATION_PREFIX, GENERATION_SEP, STAGING_SUFFIX};
use crate::coordinator::TransactionCoordinator;
use crate::errors::{Result, StoreError};
use crate::index::TupleTable;
use crate::journal::Change;
use crate::node::NodeTable;
use crate::options::Wait;
use crate::params::StoreParams;
use crate::storage::{read_data_file, DiskStorage, GenerationStorage, MemoryStorage};
use crate::txn::{Transaction, TxnMode};
use log::{debug, info};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(u32);

impl GenerationId {
    pub const FIRST: GenerationId = GenerationId(1);

    pub fn new(number: u32) -> Self {
        GenerationId(number)
    }

    pub fn number(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        GenerationId(self.0 + 1)
    }

    /// `Data-0007`
    pub fn dir_name(self) -> String {
        format!(
            "{GENERATION_PREFIX}{GENERATION_SEP}{:0width$}",
            self.0,
            width = GENERATION_DIGITS
        )
    }

    /// `Data-0007-tmp`
    pub fn staging_dir_name(self) -> String {
        format!("{}{STAGING_SUFFIX}", self.dir_name())
    }

    /// Parses a complete generation directory name.
    pub fn parse(name: &str) -> Option<Self> {
        let digits = name.strip_prefix(&generation_prefix())?;
        if digits.len() < GENERATION_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u32>().ok().map(GenerationId)
    }

    fn parse_staging(name: &str) -> Option<Self> {
        name.strip_suffix(STAGING_SUFFIX).and_then(Self::parse)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

fn generation_prefix() -> String {
    format!("{GENERATION_PREFIX}{GENERATION_SEP}")
}

/// Complete generations under `root`, in ascending order. Staging
/// directories are skipped; any other `Data-` entry that is not a
/// well-formed generation directory is an error. A missing root has none.
pub fn list_generations(root: &Path) -> Result<Vec<GenerationId>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let prefix = generation_prefix();
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || GenerationId::parse_staging(&name).is_some() {
            continue;
        }
        match GenerationId::parse(&name) {
            Some(id) if entry.file_type()?.is_dir() => ids.push(id),
            _ => {
                return Err(StoreError::Config(format!(
                    "unexpected entry {name:?} in {}",
                    root.display()
                )))
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Highest complete generation under `root`.
pub fn current_generation(root: &Path) -> Result<Option<GenerationId>> {
    Ok(list_generations(root)?.pop())
}

/// Staging directories left under `root`.
pub fn list_staging(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if GenerationId::parse_staging(&entry.file_name().to_string_lossy()).is_some() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// blake3 digest over the names and contents of every file in a generation
/// directory, in name order.
pub fn fingerprint(dir: &Path) -> Result<String> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    let mut hasher = blake3::Hasher::new();
    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        hasher.update(entry.file_name().to_string_lossy().as_bytes());
        hasher.update(&[0]);
        hasher.update(&std::fs::read(entry.path())?);
        hasher.update(&[0]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// One generation: its parameters, node table, durable storage and the
/// coordinator through which all of its transactions run.
pub struct Generation {
    id: GenerationId,
    params: StoreParams,
    nodes: NodeTable,
    storage: Box<dyn GenerationStorage>,
    coordinator: TransactionCoordinator,
}

impl Generation {
    /// Creates an empty generation directory holding only `params`.
    pub fn create_disk(dir: &Path, id: GenerationId, params: StoreParams) -> Result<Arc<Self>> {
        params.index_orders()?;
        std::fs::create_dir_all(dir)?;
        params.save_to_dir(dir)?;
        info!("Created generation {id} at {}", dir.display());
        Self::open_disk(dir, id)
    }

    /// Opens a generation directory: loads the base snapshot and replays the
    /// journal on top of it.
    pub fn open_disk(dir: &Path, id: GenerationId) -> Result<Arc<Self>> {
        let params = StoreParams::from_dir(dir)?.ok_or_else(|| {
            StoreError::Config(format!("{} has no store parameters", dir.display()))
        })?;
        let nodes = NodeTable::with_capacity(params.node_cache_size);
        let mut table = TupleTable::new(&params.index_orders()?)?;
        let base = read_data_file(dir, |quad| {
            table.add(nodes.encode(quad.as_ref()));
        })?;
        let (storage, replay) = DiskStorage::open(dir, params.sync_commits)?;
        for entry in &replay.entries {
            apply(&nodes, &mut table, &entry.changes);
        }
        let version = replay.last_version().unwrap_or(0);
        debug!(
            "Opened generation {id}: {base} base quad(s), {} journal commit(s), {} quad(s)",
            replay.entries.len(),
            table.len()
        );
        Ok(Self::from_parts(id, params, nodes, table, version, Box::new(storage)))
    }

    pub fn memory(id: GenerationId, params: StoreParams) -> Result<Arc<Self>> {
        let nodes = NodeTable::with_capacity(params.node_cache_size);
        let table = TupleTable::new(&params.index_orders()?)?;
        Ok(Self::from_parts(
            id,
            params,
            nodes,
            table,
            0,
            Box::new(MemoryStorage),
        ))
    }

    pub(crate) fn from_parts(
        id: GenerationId,
        params: StoreParams,
        nodes: NodeTable,
        table: TupleTable,
        data_version: u64,
        storage: Box<dyn GenerationStorage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            params,
            nodes,
            storage,
            coordinator: TransactionCoordinator::new(id, table, data_version),
        })
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn params(&self) -> &StoreParams {
        &self.params
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn storage(&self) -> &dyn GenerationStorage {
        self.storage.as_ref()
    }

    pub fn storage_type(&self) -> &'static str {
        self.storage.storage_type()
    }

    pub fn path(&self) -> Option<&Path> {
        self.storage.path()
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn begin(self: &Arc<Self>, mode: TxnMode) -> Result<Transaction> {
        let core = self.coordinator.begin(mode)?;
        Ok(Transaction::new(core, self.clone()))
    }

    pub fn try_begin(self: &Arc<Self>, mode: TxnMode) -> Result<Option<Transaction>> {
        self.begin_with(mode, Wait::NoWait)
    }

    pub fn begin_with(self: &Arc<Self>, mode: TxnMode, wait: Wait) -> Result<Option<Transaction>> {
        let core = match wait {
            Wait::Block => Some(self.coordinator.begin(mode)?),
            Wait::NoWait => self.coordinator.try_begin(mode)?,
        };
        Ok(core.map(|core| Transaction::new(core, self.clone())))
    }

    /// Number of quads in the latest committed state.
    pub fn len(&self) -> usize {
        self.coordinator.committed_snapshot().1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("storage", &self.storage.storage_type())
            .field("path", &self.storage.path())
            .finish()
    }
}

fn apply(nodes: &NodeTable, table: &mut TupleTable, changes: &[Change]) {
    for change in changes {
        match change {
            Change::Add(quad) => {
                table.add(nodes.encode(quad.as_ref()));
            }
            Change::Delete(quad) => {
                if let Some(tuple) = nodes.lookup(quad.as_ref()) {
                    table.delete(&tuple);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn naming() {
        assert_eq!(GenerationId::FIRST.dir_name(), "Data-0001");
        assert_eq!(GenerationId::new(42).staging_dir_name(), "Data-0042-tmp");
        assert_eq!(GenerationId::new(12345).dir_name(), "Data-12345");
        assert_eq!(GenerationId::parse("Data-0042"), Some(GenerationId::new(42)));
        assert_eq!(GenerationId::parse("Data-12345"), Some(GenerationId::new(12345)));
        assert_eq!(GenerationId::parse("Data-0042-tmp"), None);
        assert_eq!(GenerationId::parse("Data-"), None);
        assert_eq!(GenerationId::parse("Data-12"), None);
        assert_eq!(GenerationId::parse("Data-+123"), None);
        assert_eq!(GenerationId::parse("Backups"), None);
        assert_eq!(GenerationId::FIRST.next(), GenerationId::new(2));
    }

    #[test]
    fn list_sorts_and_skips() {
        let dir = tempdir().unwrap();
        for name in ["Data-0010", "Data-0002", "Data-0003-tmp", "Backups"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("store.lock"), b"").unwrap();
        assert_eq!(
            list_generations(dir.path()).unwrap(),
            vec![GenerationId::new(2), GenerationId::new(10)]
        );
        assert_eq!(
            current_generation(dir.path()).unwrap(),
            Some(GenerationId::new(10))
        );
        assert_eq!(list_staging(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn malformed_generation_entry_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Data-00x1")).unwrap();
        assert!(list_generations(dir.path()).is_err());

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Data-0001"), b"not a directory").unwrap();
        assert!(list_generations(dir.path()).is_err());
    }

    #[test]
    fn missing_root_has_no_generations() {
        let dir = tempdir().unwrap();
        assert!(list_generations(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"one").unwrap();
        let before = fingerprint(dir.path()).unwrap();
        assert_eq!(before, fingerprint(dir.path()).unwrap());
        std::fs::write(dir.path().join("a"), b"two").unwrap();
        assert_ne!(before, fingerprint(dir.path()).unwrap());
    }

    #[test]
    fn disk_generation_survives_reopen() {
        let dir = tempdir().unwrap();
        let gen_dir = dir.path().join(GenerationId::FIRST.dir_name());
        let quad = oxigraph::model::Quad::new(
            oxigraph::model::NamedNode::new_unchecked("http://example.org/s"),
            oxigraph::model::NamedNode::new_unchecked("http://example.org/p"),
            oxigraph::model::Literal::new_simple_literal("o"),
            oxigraph::model::GraphName::DefaultGraph,
        );
        {
            let generation =
                Generation::create_disk(&gen_dir, GenerationId::FIRST, StoreParams::default())
                    .unwrap();
            let mut txn = generation.begin(TxnMode::Write).unwrap();
            assert!(txn.add(&quad).unwrap());
            txn.commit().unwrap();
            txn.end().unwrap();
            let mut txn = generation.begin(TxnMode::Write).unwrap();
            txn.delete(&quad).unwrap();
            txn.abort().unwrap();
        }
        let generation = Generation::open_disk(&gen_dir, GenerationId::FIRST).unwrap();
        assert_eq!(generation.len(), 1);
        assert_eq!(generation.coordinator().data_version(), 1);
        let txn = generation.begin(TxnMode::Read).unwrap();
        assert!(txn.contains(&quad).unwrap());
    }
}

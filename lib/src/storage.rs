//! Durable backing of one generation.
//!
//! A disk generation is a directory with the parameters file, a base
//! snapshot (`data.nq`, written by compaction) and the commit journal. A
//! memory generation keeps nothing outside the process.

use crate::consts::{DATA_FILE, JOURNAL_FILE};
use crate::errors::Result;
use crate::journal::{Change, Journal, Replay};
use log::debug;
use oxigraph::io::{RdfFormat, RdfParser, RdfSerializer};
use oxigraph::model::Quad;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub trait GenerationStorage: Send + Sync {
    fn storage_type(&self) -> &'static str;

    fn path(&self) -> Option<&Path>;

    /// Makes a commit durable before it becomes visible.
    fn persist(&self, version: u64, changes: &[Change]) -> Result<()>;

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

pub struct DiskStorage {
    dir: PathBuf,
    journal: Journal,
}

impl DiskStorage {
    /// Opens the journal of the generation at `dir`, returning the commits it
    /// holds so the caller can rebuild its tables.
    pub fn open(dir: &Path, sync_commits: bool) -> Result<(Self, Replay)> {
        let (journal, replay) = Journal::open(&dir.join(JOURNAL_FILE), sync_commits)?;
        Ok((
            Self {
                dir: dir.to_path_buf(),
                journal,
            },
            replay,
        ))
    }

    pub fn data_file(dir: &Path) -> PathBuf {
        dir.join(DATA_FILE)
    }
}

impl GenerationStorage for DiskStorage {
    fn storage_type(&self) -> &'static str {
        "disk"
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.dir)
    }

    fn persist(&self, version: u64, changes: &[Change]) -> Result<()> {
        self.journal.append(version, changes)?;
        debug!(
            "Journaled {} change(s) at version {version} in {}",
            changes.len(),
            self.journal.path().display()
        );
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.journal.sync()
    }
}

#[derive(Default)]
pub struct MemoryStorage;

impl GenerationStorage for MemoryStorage {
    fn storage_type(&self) -> &'static str {
        "memory"
    }

    fn path(&self) -> Option<&Path> {
        None
    }

    fn persist(&self, _version: u64, _changes: &[Change]) -> Result<()> {
        Ok(())
    }
}

/// Streams the base snapshot of a generation directory, if it has one.
pub fn read_data_file(dir: &Path, mut on_quad: impl FnMut(Quad)) -> Result<usize> {
    let path = DiskStorage::data_file(dir);
    if !path.exists() {
        return Ok(0);
    }
    let reader = BufReader::new(File::open(&path)?);
    let mut count = 0;
    for quad in RdfParser::from_format(RdfFormat::NQuads).for_reader(reader) {
        on_quad(quad?);
        count += 1;
    }
    Ok(count)
}

/// Writes quads as N-Quads to any writer and returns the writer.
pub fn write_nquads<W, I>(writer: W, quads: I) -> Result<(W, usize)>
where
    W: Write,
    I: IntoIterator<Item = Result<Quad>>,
{
    let mut serializer = RdfSerializer::from_format(RdfFormat::NQuads).for_writer(writer);
    let mut count = 0;
    for quad in quads {
        serializer.serialize_quad(quad?.as_ref())?;
        count += 1;
    }
    Ok((serializer.finish()?, count))
}

/// Writes and syncs the base snapshot file of a generation directory.
pub fn write_data_file<I>(dir: &Path, quads: I) -> Result<usize>
where
    I: IntoIterator<Item = Result<Quad>>,
{
    let file = File::create(DiskStorage::data_file(dir))?;
    let (writer, count) = write_nquads(BufWriter::new(file), quads)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::{GraphName, Literal, NamedNode};
    use tempfile::tempdir;

    fn quad(i: usize) -> Quad {
        Quad::new(
            NamedNode::new_unchecked(format!("http://example.org/s{i}")),
            NamedNode::new_unchecked("http://example.org/p"),
            Literal::from(i as i64),
            GraphName::NamedNode(NamedNode::new_unchecked("http://example.org/g")),
        )
    }

    #[test]
    fn data_file_round_trip() {
        let dir = tempdir().unwrap();
        let quads: Vec<Quad> = (0..10).map(quad).collect();
        let written = write_data_file(dir.path(), quads.iter().cloned().map(Ok)).unwrap();
        assert_eq!(written, 10);
        let mut read = Vec::new();
        assert_eq!(read_data_file(dir.path(), |q| read.push(q)).unwrap(), 10);
        assert_eq!(read, quads);
    }

    #[test]
    fn missing_data_file_is_empty() {
        let dir = tempdir().unwrap();
        assert_eq!(read_data_file(dir.path(), |_| {}).unwrap(), 0);
    }

    #[test]
    fn disk_storage_persists_to_journal() {
        let dir = tempdir().unwrap();
        let (storage, replay) = DiskStorage::open(dir.path(), true).unwrap();
        assert!(replay.entries.is_empty());
        storage.persist(7, &[Change::Add(quad(1))]).unwrap();
        drop(storage);
        let (_, replay) = DiskStorage::open(dir.path(), true).unwrap();
        assert_eq!(replay.last_version(), Some(7));
        assert_eq!(replay.entries[0].changes[0].quad(), &quad(1));
    }
}

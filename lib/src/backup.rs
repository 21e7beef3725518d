//! Compressed N-Quads dumps of a committed snapshot under `<root>/Backups`.

use crate::consts::{
    BACKUPS_DIR, BACKUP_ATTEMPTS, BACKUP_BASENAME, BACKUP_COMPRESSION_LEVEL, BACKUP_EXT,
};
use crate::errors::{Result, StoreError};
use crate::storage::write_nquads;
use crate::txn::Transaction;
use chrono::Local;
use log::info;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

/// Writes every quad visible to `txn` into a new, uniquely named file in
/// `<root>/Backups`. Returns the file path and the number of quads written.
pub fn write_backup(root: &Path, txn: &Transaction) -> Result<(PathBuf, usize)> {
    let dir = root.join(BACKUPS_DIR);
    std::fs::create_dir_all(&dir)?;
    let stamp = Local::now().format("%Y-%m-%d_%H%M%S").to_string();
    let (path, file) = create_unique(&dir, &format!("{BACKUP_BASENAME}_{stamp}"))?;
    let encoder = zstd::Encoder::new(BufWriter::new(file), BACKUP_COMPRESSION_LEVEL)?;
    let (encoder, count) = write_nquads(encoder, txn.quads()?)?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    info!("Wrote backup of {count} quad(s) to {}", path.display());
    Ok((path, count))
}

/// Opens a backup for reading, transparently decompressing `.zst` files.
pub fn open_backup(path: &Path) -> Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    if path.extension().is_some_and(|e| e == "zst") {
        Ok(Box::new(zstd::Decoder::with_buffer(file)?))
    } else {
        Ok(Box::new(file))
    }
}

/// Backups present under `<root>/Backups`, oldest first.
pub fn list_backups(root: &Path) -> Result<Vec<PathBuf>> {
    let dir = root.join(BACKUPS_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_backup = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(BACKUP_BASENAME) && n.ends_with(BACKUP_EXT));
        if is_backup {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// `base.ext`, then `base_1.ext` .. `base_4.ext`; never overwrites.
fn create_unique(dir: &Path, base: &str) -> Result<(PathBuf, File)> {
    for attempt in 0..BACKUP_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{base}.{BACKUP_EXT}")
        } else {
            format!("{base}_{attempt}.{BACKUP_EXT}")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Config(format!(
        "could not find a free backup file name for {base} in {}",
        dir.display()
    )))
}

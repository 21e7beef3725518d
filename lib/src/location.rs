//! Where a store lives: a root directory holding numbered generations, or a
//! purely in-memory location. Also owns the inter-process lock on a directory
//! location and the open-time cleanup of interrupted compactions.

use crate::consts::LOCK_FILE;
use crate::errors::{Result, StoreError};
use crate::generation::{list_staging, GenerationId};
use fs2::FileExt;
use log::{info, warn};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Directory(PathBuf),
    Memory,
}

impl Location {
    pub fn dir<P: Into<PathBuf>>(path: P) -> Self {
        Location::Directory(path.into())
    }

    pub fn mem() -> Self {
        Location::Memory
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Location::Directory(p) => Some(p.as_path()),
            Location::Memory => None,
        }
    }

    /// Directory of the given generation, for directory locations.
    pub fn generation_dir(&self, id: GenerationId) -> Option<PathBuf> {
        self.path().map(|p| p.join(id.dir_name()))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Directory(p) => write!(f, "{}", p.display()),
            Location::Memory => write!(f, "<memory>"),
        }
    }
}

/// Exclusive advisory lock on `<root>/store.lock`, held for the life of a
/// [`crate::api::Store`].
#[derive(Debug)]
pub struct LocationLock {
    file: File,
    path: PathBuf,
}

impl LocationLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            return Err(StoreError::Locked(format!("{} ({e})", path.display())));
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Removes staging directories left behind by a compaction that never
/// reached its rename. Returns the removed paths.
pub fn clean_location(root: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for dir in list_staging(root)? {
        info!("Removing incomplete generation {}", dir.display());
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!("Could not remove {}: {e}", dir.display());
            return Err(e.into());
        }
        removed.push(dir);
    }
    Ok(removed)
}

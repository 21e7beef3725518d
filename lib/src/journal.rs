//! Per-generation commit log.
//!
//! Each committed write appends one block: `A <n-quad>` / `D <n-quad>` lines
//! followed by a `C <version>` marker. On open, complete blocks are replayed in
//! order; a trailing block without its marker is a write that never committed
//! and is truncated away.

use crate::errors::{Result, StoreError};
use log::{debug, error, warn};
use oxigraph::io::{RdfFormat, RdfParser, RdfSerializer};
use oxigraph::model::{Quad, QuadRef};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Add(Quad),
    Delete(Quad),
}

impl Change {
    pub fn quad(&self) -> &Quad {
        match self {
            Change::Add(q) | Change::Delete(q) => q,
        }
    }
}

/// One replayed commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub version: u64,
    pub changes: Vec<Change>,
}

#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<JournalEntry>,
    /// Byte length of the journal up to the last commit marker.
    pub valid_len: u64,
    /// Number of uncommitted change lines dropped from the tail.
    pub discarded: usize,
}

impl Replay {
    pub fn last_version(&self) -> Option<u64> {
        self.entries.last().map(|e| e.version)
    }
}

struct Tail {
    file: File,
    /// Length up to the last commit marker this journal wrote or replayed.
    committed_len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

pub struct Journal {
    path: PathBuf,
    tail: Mutex<Tail>,
    sync: bool,
}

impl Journal {
    /// Opens (creating if needed) the journal for appending and returns the
    /// commits it already holds. A torn tail is cut off before appending.
    pub fn open(path: &Path, sync: bool) -> Result<(Self, Replay)> {
        let replay = if path.exists() {
            Self::replay(path)?
        } else {
            Replay::default()
        };
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        if replay.discarded > 0 || file.metadata()?.len() != replay.valid_len {
            warn!(
                "Discarding {} uncommitted journal line(s) in {}",
                replay.discarded,
                path.display()
            );
            file.set_len(replay.valid_len)?;
        }
        debug!(
            "Opened journal {} with {} committed block(s)",
            path.display(),
            replay.entries.len()
        );
        Ok((
            Self {
                path: path.to_path_buf(),
                tail: Mutex::new(Tail {
                    file,
                    committed_len: replay.valid_len,
                    poisoned: false,
                }),
                sync,
            },
            replay,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, version: u64, changes: &[Change]) -> Result<()> {
        let mut block = String::new();
        for change in changes {
            let (tag, quad) = match change {
                Change::Add(q) => ('A', q),
                Change::Delete(q) => ('D', q),
            };
            block.push(tag);
            block.push(' ');
            block.push_str(&encode_quad(quad.as_ref())?);
            block.push('\n');
        }
        block.push_str(&format!("C {version}\n"));

        let mut tail = self.tail.lock();
        if tail.poisoned {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "journal {} has an unrecoverable partial write",
                    self.path.display()
                ),
            )));
        }
        // Anything past the last marker belongs to no commit and must not be
        // folded into this block on replay.
        let actual_len = tail.file.metadata()?.len();
        if actual_len != tail.committed_len {
            warn!(
                "Dropping {} stray byte(s) after the last commit in {}",
                actual_len.saturating_sub(tail.committed_len),
                self.path.display()
            );
            tail.file.set_len(tail.committed_len)?;
        }
        match write_block(&mut tail.file, block.as_bytes(), self.sync) {
            Ok(()) => {
                tail.committed_len += block.len() as u64;
                Ok(())
            }
            Err(e) => {
                let committed_len = tail.committed_len;
                if let Err(truncate) = tail.file.set_len(committed_len) {
                    error!(
                        "Cannot roll back partial commit in {}: {truncate}",
                        self.path.display()
                    );
                    tail.poisoned = true;
                }
                Err(e.into())
            }
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.tail.lock().file.sync_all()?;
        Ok(())
    }

    pub fn replay(path: &Path) -> Result<Replay> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut replay = Replay::default();
        let mut pending = Vec::new();
        let mut offset = 0u64;
        let mut line = String::new();
        let mut lineno = 0usize;
        let mut torn = false;
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            lineno += 1;
            offset += read as u64;
            if !line.ends_with('\n') {
                // partial final line: the write that produced it never finished
                torn = true;
                break;
            }
            let text = line.trim_end();
            if text.is_empty() {
                continue;
            }
            let (tag, rest) = text.split_once(' ').unwrap_or((text, ""));
            match tag {
                "A" => pending.push(Change::Add(decode_quad(rest, path, lineno)?)),
                "D" => pending.push(Change::Delete(decode_quad(rest, path, lineno)?)),
                "C" => {
                    let version = rest.parse::<u64>().map_err(|e| {
                        StoreError::Parse(format!(
                            "{}:{lineno}: bad commit marker {rest:?}: {e}",
                            path.display()
                        ))
                    })?;
                    replay.entries.push(JournalEntry {
                        version,
                        changes: std::mem::take(&mut pending),
                    });
                    replay.valid_len = offset;
                }
                other => {
                    return Err(StoreError::Parse(format!(
                        "{}:{lineno}: unknown journal record {other:?}",
                        path.display()
                    )))
                }
            }
        }
        replay.discarded = pending.len() + usize::from(torn);
        Ok(replay)
    }
}

fn write_block(file: &mut File, block: &[u8], sync: bool) -> std::io::Result<()> {
    file.write_all(block)?;
    file.flush()?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

/// Serializes one quad as a single N-Quads line, without the trailing newline.
pub fn encode_quad(quad: QuadRef<'_>) -> Result<String> {
    let mut serializer = RdfSerializer::from_format(RdfFormat::NQuads).for_writer(Vec::new());
    serializer.serialize_quad(quad)?;
    let bytes = serializer.finish()?;
    let text = String::from_utf8(bytes).map_err(|e| StoreError::Parse(e.to_string()))?;
    Ok(text.trim_end().to_string())
}

fn decode_quad(text: &str, path: &Path, lineno: usize) -> Result<Quad> {
    let mut quads = RdfParser::from_format(RdfFormat::NQuads).for_reader(text.as_bytes());
    match quads.next() {
        Some(Ok(quad)) => Ok(quad),
        Some(Err(e)) => Err(StoreError::Parse(format!(
            "{}:{lineno}: {e}",
            path.display()
        ))),
        None => Err(StoreError::Parse(format!(
            "{}:{lineno}: empty journal record",
            path.display()
        ))),
    }
}

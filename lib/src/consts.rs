//! File names, directory naming conventions and defaults used across a store
//! location.

use std::time::Duration;

/// Prefix of generation directories (`Data-0001`, `Data-0002`, ...).
pub const GENERATION_PREFIX: &str = "Data";
pub const GENERATION_SEP: &str = "-";
/// Suffix of a generation directory still being written by compaction.
pub const STAGING_SUFFIX: &str = "-tmp";
/// Minimum number of digits in a generation number.
pub const GENERATION_DIGITS: usize = 4;

pub const PARAMS_FILE: &str = "store.json";
pub const DATA_FILE: &str = "data.nq";
pub const JOURNAL_FILE: &str = "journal.log";
pub const LOCK_FILE: &str = "store.lock";

pub const BACKUPS_DIR: &str = "Backups";
pub const BACKUP_BASENAME: &str = "backup";
pub const BACKUP_EXT: &str = "nq.zst";
pub const BACKUP_ATTEMPTS: usize = 5;
pub const BACKUP_COMPRESSION_LEVEL: i32 = 3;

/// Quad index layouts created when no parameters are supplied.
pub const DEFAULT_QUAD_INDEXES: [&str; 6] = ["SPOG", "POSG", "OSPG", "GSPO", "GPOS", "GOSP"];
pub const DEFAULT_NODE_CACHE_SIZE: usize = 10_000;

pub const DEFAULT_EXCLUSIVE_TIMEOUT: Duration = Duration::from_secs(30);
/// How many times a begin re-resolves the current generation after losing a
/// race with a switchover.
pub const MAX_SWITCH_RETRIES: usize = 8;

/// Environment variable that overrides `RUST_LOG` for this crate's binaries.
pub const LOG_ENV: &str = "GENSTORE_LOG";

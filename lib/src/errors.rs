//! Error type shared by every component of the store, plus the coarse
//! classification callers use to decide whether to retry.

use crate::generation::GenerationId;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Misuse of the transaction protocol (double begin, double abort, commit
    /// after end, running a deferred transaction twice).
    #[error("transaction protocol violation: {0}")]
    ProtocolViolation(String),

    /// A promote was denied because another write committed or is active.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("compaction failed: {0}")]
    Compaction(String),

    #[error("a compaction is already running for {0}")]
    CompactionInProgress(String),

    #[error("switchover failure: {0}")]
    Switchover(String),

    /// The generation was superseded by a compaction; re-resolve the store.
    #[error("generation {0} has been retired")]
    Retired(GenerationId),

    #[error("timed out after {timeout_ms}ms waiting for the active writer on generation {generation} to finish")]
    ExclusiveTimeout {
        generation: GenerationId,
        timeout_ms: u128,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("location {0} is locked by another store")]
    Locked(String),

    #[error("deferred transaction worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    ProtocolViolation,
    Conflict,
    Io,
    Switchover,
    Other,
}

impl StoreError {
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Other(anyhow::Error::new(err))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::Io(_)
            | StoreError::Compaction(_)
            | StoreError::CompactionInProgress(_)
            | StoreError::Locked(_) => ErrorKind::Io,
            StoreError::Switchover(_)
            | StoreError::Retired(_)
            | StoreError::ExclusiveTimeout { .. } => ErrorKind::Switchover,
            StoreError::Parse(_)
            | StoreError::Config(_)
            | StoreError::Worker(_)
            | StoreError::Other(_) => ErrorKind::Other,
        }
    }

    /// Errors after which the same operation may reasonably be attempted again.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Io)
    }

    /// Errors that leave the store in a state needing operator attention.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Switchover
    }
}

impl From<oxigraph::io::RdfParseError> for StoreError {
    fn from(err: oxigraph::io::RdfParseError) -> Self {
        StoreError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StoreError::Conflict("x".into()).is_retriable());
        assert!(!StoreError::Conflict("x".into()).is_fatal());
        assert!(StoreError::Compaction("disk full".into()).is_retriable());
        assert!(StoreError::Switchover("x".into()).is_fatal());
        assert!(StoreError::Retired(GenerationId::FIRST).is_fatal());
        assert!(!StoreError::ProtocolViolation("x".into()).is_retriable());
        assert_eq!(
            StoreError::ProtocolViolation("x".into()).kind(),
            ErrorKind::ProtocolViolation
        );
        let io: StoreError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(io.kind(), ErrorKind::Io);
    }
}

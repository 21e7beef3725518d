//! Shared option types that replace boolean flag parameters in the Rust API.

/// What compaction does with the superseded generation directory.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum OldGeneration {
    /// Leave the old directory on disk, untouched.
    #[default]
    Keep,
    /// Remove the old directory once the new generation is installed.
    Delete,
}

impl OldGeneration {
    pub fn should_delete(self) -> bool {
        matches!(self, OldGeneration::Delete)
    }
}

impl From<bool> for OldGeneration {
    fn from(value: bool) -> Self {
        if value {
            OldGeneration::Delete
        } else {
            OldGeneration::Keep
        }
    }
}

impl From<OldGeneration> for bool {
    fn from(value: OldGeneration) -> Self {
        value.should_delete()
    }
}

/// How a read transaction is upgraded to a write transaction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum PromoteMode {
    /// Fail if any write committed since the transaction began.
    #[default]
    Isolated,
    /// Wait for the writer slot and move the view forward to the latest
    /// committed state.
    ReadCommitted,
}

/// Whether `begin` waits for a busy writer slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Wait {
    Block,
    NoWait,
}

impl From<bool> for Wait {
    fn from(value: bool) -> Self {
        if value {
            Wait::Block
        } else {
            Wait::NoWait
        }
    }
}

use thiserror::Error;

use crate::common::{BlockNumber, Oid, OffsetNumber, TransactionId};

/// Storage engine error.
///
/// Variants group into the error kinds the engine distinguishes:
/// transient I/O, contention, user mistakes, corruption, and fatal
/// conditions. Contention errors (`Deadlock`, `LockNotAvailable`,
/// `BeingUpdated`) are expected during normal concurrent operation and are
/// handled by the caller's transaction machinery; corruption errors are
/// reported but never silently swallowed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page checksum mismatch: relation {relation} block {block}")]
    ChecksumMismatch { relation: Oid, block: BlockNumber },

    #[error("invalid item id {offset} in block {block}")]
    InvalidItemId {
        block: BlockNumber,
        offset: OffsetNumber,
    },

    #[error("tuple is too big: size {size}, max size {max}")]
    TupleTooBig { size: usize, max: usize },

    #[error("deadlock detected")]
    Deadlock,

    #[error("lock not available")]
    LockNotAvailable,

    #[error("tuple is being updated by transaction {0}")]
    BeingUpdated(TransactionId),

    #[error("buffer is marked invalid: relation {relation} block {block}")]
    BadBuffer { relation: Oid, block: BlockNumber },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown relation {0}")]
    UnknownRelation(Oid),

    #[error("transaction log block {0} out of range")]
    LogBlockOutOfRange(BlockNumber),

    #[error("lock table corrupted: {0}")]
    LockTableCorrupted(String),

    #[error("environment is owned by another thread")]
    EnvironmentBusy,

    #[error("too many connections: limit is {0}")]
    BackendLimit(usize),

    #[error("system is shutting down")]
    ShutdownInProgress,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// True for errors that signal contention rather than failure; the
    /// surrounding transaction may retry after rolling back.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StoreError::Deadlock | StoreError::LockNotAvailable | StoreError::BeingUpdated(_)
        )
    }

    /// True for errors that indicate on-disk or in-memory structure damage.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::ChecksumMismatch { .. }
                | StoreError::InvalidItemId { .. }
                | StoreError::LogBlockOutOfRange(_)
                | StoreError::LockTableCorrupted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(StoreError::Deadlock.is_contention());
        assert!(StoreError::BeingUpdated(7).is_contention());
        assert!(!StoreError::Deadlock.is_corruption());
        assert!(StoreError::ChecksumMismatch {
            relation: 1,
            block: 2
        }
        .is_corruption());
    }

    #[test]
    fn test_error_display() {
        let e = StoreError::TupleTooBig {
            size: 9000,
            max: 8104,
        };
        assert_eq!(e.to_string(), "tuple is too big: size 9000, max size 8104");
    }
}

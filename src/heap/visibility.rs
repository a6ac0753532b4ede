// Visibility oracle for tuple updates.
//
// The heap consults the oracle before locking a tuple for update; the
// default implementation derives everything from the transaction status
// log. Snapshots carry the asking transaction's identity and the nowait
// request bit; the special snapshot kinds bypass the nowait conversion.

use std::sync::Arc;

use crate::common::{CommandId, TransactionId, INVALID_TRANSACTION_ID};
use crate::error::Result;
use crate::heap::{HeapTuple, TUPLE_DELETED};
use crate::txlog::{TransactionLog, XidStatus};

/// Outcome of asking whether a tuple may be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    MayBeUpdated,
    BeingUpdated,
    Invisible,
    Updated,
    SelfUpdated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// See current committed state.
    Now,
    /// See everything, committed or not.
    Any,
    /// See the transaction's own writes.
    SelfVisible,
    /// Ordinary transactional snapshot.
    Standard,
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub kind: SnapshotKind,
    /// Convert waits on in-progress writers into `BeingUpdated` returns.
    /// Only meaningful for standard snapshots.
    pub nowait: bool,
    pub xid: TransactionId,
    pub cid: CommandId,
}

impl Snapshot {
    pub fn standard(xid: TransactionId, cid: CommandId) -> Self {
        Self {
            kind: SnapshotKind::Standard,
            nowait: false,
            xid,
            cid,
        }
    }

    pub fn standard_nowait(xid: TransactionId, cid: CommandId) -> Self {
        Self {
            nowait: true,
            ..Self::standard(xid, cid)
        }
    }

    pub fn now() -> Self {
        Self {
            kind: SnapshotKind::Now,
            nowait: false,
            xid: INVALID_TRANSACTION_ID,
            cid: 0,
        }
    }

    /// Whether a would-be wait is converted into a `BeingUpdated` return.
    pub fn is_nowait(&self) -> bool {
        self.kind == SnapshotKind::Standard && self.nowait
    }
}

pub trait VisibilityOracle: Send + Sync {
    fn satisfies_update(&self, tuple: &HeapTuple, snapshot: &Snapshot) -> Result<UpdateStatus>;
}

/// Default oracle: tuple visibility from the status log.
pub struct LogVisibility {
    log: Arc<TransactionLog>,
}

impl LogVisibility {
    pub fn new(log: Arc<TransactionLog>) -> Self {
        Self { log }
    }
}

impl VisibilityOracle for LogVisibility {
    fn satisfies_update(&self, tuple: &HeapTuple, snapshot: &Snapshot) -> Result<UpdateStatus> {
        if tuple.xmin == INVALID_TRANSACTION_ID {
            return Ok(UpdateStatus::Invisible);
        }

        // The inserting transaction must be visible to us.
        if tuple.xmin != snapshot.xid {
            match self.log.status_of(tuple.xmin)? {
                XidStatus::InProgress if snapshot.kind != SnapshotKind::Any => {
                    return Ok(UpdateStatus::Invisible);
                }
                XidStatus::Aborted => return Ok(UpdateStatus::Invisible),
                _ => {}
            }
        }

        // Nobody has touched the tuple since.
        if tuple.xmax == INVALID_TRANSACTION_ID {
            return Ok(UpdateStatus::MayBeUpdated);
        }
        if tuple.xmax == snapshot.xid {
            return Ok(UpdateStatus::SelfUpdated);
        }

        match self.log.status_of(tuple.xmax)? {
            XidStatus::InProgress => Ok(UpdateStatus::BeingUpdated),
            XidStatus::Aborted => Ok(UpdateStatus::MayBeUpdated),
            XidStatus::SoftCommit | XidStatus::Committed => {
                if tuple.has_flag(TUPLE_DELETED) {
                    Ok(UpdateStatus::Deleted)
                } else {
                    Ok(UpdateStatus::Updated)
                }
            }
        }
    }
}

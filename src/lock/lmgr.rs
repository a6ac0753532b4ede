// High-level lock manager API over the partitioned lock tables:
// relation, page, and transaction-id locks for the default method, plus
// non-blocking user (advisory) locks sharing the same infrastructure.

use std::thread::ThreadId;
use std::time::Duration;

use crate::catalog::Relation;
use crate::common::{BlockNumber, Oid, TransactionId, INVALID_OID};
use crate::error::{Result, StoreError};
use crate::lock::mode::LockMode;
use crate::lock::table::{LockMethod, LockObject, LockTable, LockTag};

/// Pseudo relation oid for transaction-id lock objects; transaction ids
/// are globally unique so these always land in partition zero.
const XACT_LOCK_REL: Oid = INVALID_OID;

pub struct LockManager {
    table: LockTable,
}

impl LockManager {
    pub fn new(partitions: usize, deadlock_interval: Duration) -> Self {
        Self {
            table: LockTable::new(partitions, deadlock_interval),
        }
    }

    /// Disable or re-enable locking; used during bootstrap.
    pub fn disable(&self, value: bool) {
        self.table.disable(value);
    }

    pub fn table(&self) -> &LockTable {
        &self.table
    }

    fn relation_tag(rel: &Relation) -> LockTag {
        LockTag {
            method: LockMethod::Default,
            db: rel.db,
            rel: rel.oid,
            object: LockObject::Relation,
        }
    }

    pub fn lock_relation(&self, rel: &Relation, xid: TransactionId, mode: LockMode) -> Result<()> {
        self.table.acquire(Self::relation_tag(rel), xid, mode, false)
    }

    /// Failfast relation lock: `Ok(false)` when the lock is busy.
    pub fn nowait_lock_relation(
        &self,
        rel: &Relation,
        xid: TransactionId,
        mode: LockMode,
    ) -> Result<bool> {
        match self.table.acquire(Self::relation_tag(rel), xid, mode, true) {
            Ok(()) => Ok(true),
            Err(StoreError::LockNotAvailable) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn unlock_relation(
        &self,
        rel: &Relation,
        xid: TransactionId,
        mode: LockMode,
    ) -> Result<()> {
        self.table.release(Self::relation_tag(rel), xid, mode)
    }

    fn page_tag(rel: &Relation, blk: BlockNumber) -> LockTag {
        LockTag {
            method: LockMethod::Default,
            db: rel.db,
            rel: rel.oid,
            object: LockObject::Page(blk),
        }
    }

    pub fn lock_page(
        &self,
        rel: &Relation,
        blk: BlockNumber,
        xid: TransactionId,
        mode: LockMode,
    ) -> Result<()> {
        self.table.acquire(Self::page_tag(rel, blk), xid, mode, false)
    }

    pub fn unlock_page(
        &self,
        rel: &Relation,
        blk: BlockNumber,
        xid: TransactionId,
        mode: LockMode,
    ) -> Result<()> {
        self.table.release(Self::page_tag(rel, blk), xid, mode)
    }

    fn xact_tag(xid: TransactionId) -> LockTag {
        LockTag {
            method: LockMethod::Default,
            db: INVALID_OID,
            rel: XACT_LOCK_REL,
            object: LockObject::Transaction(xid),
        }
    }

    /// Every transaction takes an exclusive lock on its own id at start;
    /// waiters on that id sleep until the transaction completes.
    pub fn xact_lock_insert(&self, xid: TransactionId) -> Result<()> {
        self.table
            .acquire(Self::xact_tag(xid), xid, LockMode::Exclusive, false)
    }

    /// Block until the transaction owning `wait_for` releases its id lock,
    /// then let go of the share lock immediately.
    pub fn xact_lock_wait(&self, wait_for: TransactionId, my_xid: TransactionId) -> Result<()> {
        let tag = Self::xact_tag(wait_for);
        self.table.acquire(tag, my_xid, LockMode::Share, false)?;
        self.table.release(tag, my_xid, LockMode::Share)
    }

    fn user_tag(db: Oid, key1: u32, key2: u32) -> LockTag {
        LockTag {
            method: LockMethod::User,
            db,
            rel: INVALID_OID,
            object: LockObject::User { key1, key2 },
        }
    }

    /// Application-level advisory lock; never blocks. `Ok(false)` when a
    /// conflicting holder exists.
    pub fn user_lock(&self, db: Oid, key1: u32, key2: u32, mode: LockMode) -> Result<bool> {
        match self.table.acquire(Self::user_tag(db, key1, key2), 0, mode, false) {
            Ok(()) => Ok(true),
            Err(StoreError::LockNotAvailable) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn user_unlock(&self, db: Oid, key1: u32, key2: u32, mode: LockMode) -> Result<()> {
        self.table.release(Self::user_tag(db, key1, key2), 0, mode)
    }

    /// Release everything a thread holds: transactional locks for one
    /// transaction (or all of them), then any user locks it left behind.
    pub fn release_all(&self, thread: ThreadId, xid: Option<TransactionId>) -> Result<()> {
        self.table.release_all(LockMethod::Default, thread, xid)?;
        if xid.is_none() {
            self.table.release_all(LockMethod::User, thread, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RelKind;
    use std::sync::Arc;

    fn manager() -> Arc<LockManager> {
        Arc::new(LockManager::new(4, Duration::from_millis(50)))
    }

    fn relation(oid: Oid) -> Relation {
        Relation {
            oid,
            db: 1,
            name: format!("rel{oid}"),
            kind: RelKind::Regular,
            has_blob_attr: false,
        }
    }

    #[test]
    fn test_relation_lock_round_trip() {
        let lm = manager();
        let rel = relation(50);
        lm.lock_relation(&rel, 100, LockMode::RowExclusive).unwrap();
        lm.unlock_relation(&rel, 100, LockMode::RowExclusive).unwrap();
    }

    #[test]
    fn test_nowait_refuses_busy_relation() {
        let lm = manager();
        let rel = relation(51);
        lm.lock_relation(&rel, 100, LockMode::AccessExclusive).unwrap();

        let lm2 = Arc::clone(&lm);
        let rel2 = relation(51);
        let got = std::thread::spawn(move || {
            lm2.nowait_lock_relation(&rel2, 200, LockMode::AccessShare)
                .unwrap()
        })
        .join()
        .unwrap();
        assert!(!got);
        lm.unlock_relation(&rel, 100, LockMode::AccessExclusive)
            .unwrap();
    }

    #[test]
    fn test_xact_lock_wait_blocks_until_release() {
        let lm = manager();
        lm.xact_lock_insert(700).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = std::thread::spawn(move || lm2.xact_lock_wait(700, 701));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        // Transaction 700 completes; its locks go away and the waiter runs.
        lm.release_all(std::thread::current().id(), Some(700)).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_page_locks_are_independent_objects() {
        let lm = manager();
        let rel = relation(52);
        lm.lock_page(&rel, 0, 100, LockMode::Exclusive).unwrap();

        // A different page of the same relation does not conflict.
        let lm2 = Arc::clone(&lm);
        let rel2 = relation(52);
        std::thread::spawn(move || {
            lm2.lock_page(&rel2, 1, 200, LockMode::Exclusive).unwrap();
            lm2.unlock_page(&rel2, 1, 200, LockMode::Exclusive).unwrap();
        })
        .join()
        .unwrap();

        lm.unlock_page(&rel, 0, 100, LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_user_locks_do_not_mix_with_relation_locks() {
        let lm = manager();
        let rel = relation(0);
        lm.lock_relation(&rel, 100, LockMode::AccessExclusive).unwrap();
        // User lock on unrelated keys in the same partition still succeeds.
        assert!(lm.user_lock(1, 0, 0, LockMode::Exclusive).unwrap());
        lm.user_unlock(1, 0, 0, LockMode::Exclusive).unwrap();
        lm.unlock_relation(&rel, 100, LockMode::AccessExclusive)
            .unwrap();
    }
}

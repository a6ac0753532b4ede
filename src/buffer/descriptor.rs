// Buffer descriptors.
//
// A descriptor is the control block for one cached page. All descriptor
// fields live behind the descriptor's own mutex; the condition variable
// handles exclusive-lock and page-access handoff. The page image itself
// sits in a separate rwlock that is only ever held for the duration of a
// byte copy; the long-lived page lock protocol (SHARE / EXCLUSIVE and
// friends) is carried in the descriptor state.
//
// Lock ordering: free-list guard, then descriptor vector, then descriptor
// state, then the page image lock. Two descriptor states are never held at
// once except through try_lock (nearest-neighbor removal).

use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::common::{BlockNumber, RelKind};
use crate::storage::{Page, RelFileNode};

pub type BufferId = usize;

/// Free-list link value: not on any list, eligible for insertion.
pub const FREE_NEXT_INVALID: i64 = -1;
/// Free-list link value: removed from a list, insertion pending.
pub const FREE_NEXT_DETACHED: i64 = -2;

pub const BM_VALID: u32 = 1 << 0;
pub const BM_USED: u32 = 1 << 1;
pub const BM_FREE: u32 = 1 << 2;
pub const BM_EXCLUSIVE: u32 = 1 << 3;
pub const BM_RETIRED: u32 = 1 << 4;
pub const BM_READONLY: u32 = 1 << 5;
pub const BM_DIRTY: u32 = 1 << 6;
pub const BM_ERROR: u32 = 1 << 7;

/// Identity of a cached page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub node: RelFileNode,
    pub block: BlockNumber,
}

impl BufferTag {
    pub fn new(node: RelFileNode, block: BlockNumber) -> Self {
        Self { node, block }
    }
}

/// Mutable descriptor state, guarded by [`BufferDesc::state`].
pub struct BufState {
    pub tag: Option<BufferTag>,
    pub kind: RelKind,
    pub flags: u32,
    pub ref_count: u32,
    /// Pins that also exclude page-exclusive lockers.
    pub page_access: u32,
    /// Eviction skip counter, decremented once per free-list pass.
    pub bias: u32,
    pub free_next: i64,

    // Page lock protocol.
    pub share_count: u32,
    pub read_exclusive_owner: Option<ThreadId>,
    pub exclusive_owner: Option<ThreadId>,
    /// Waiters for the exclusive page lock.
    pub e_waiting: u32,
    /// Page-access pinners sleeping on an active exclusive lock.
    pub p_waiting: u32,
}

impl BufState {
    pub fn flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }
}

/// Control block for one cached page.
pub struct BufferDesc {
    pub id: BufferId,
    pub state: Mutex<BufState>,
    pub gate: Condvar,
    pub page: RwLock<Page>,
}

impl BufferDesc {
    pub fn new(id: BufferId, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(BufState {
                tag: None,
                kind: RelKind::Regular,
                flags: 0,
                ref_count: 0,
                page_access: 0,
                bias: 0,
                free_next: FREE_NEXT_INVALID,
                share_count: 0,
                read_exclusive_owner: None,
                exclusive_owner: None,
                e_waiting: 0,
                p_waiting: 0,
            }),
            gate: Condvar::new(),
            page: RwLock::new(Page::new(page_size)),
        })
    }

    /// Copy the page image out under a brief read lock.
    pub fn with_page<T>(&self, f: impl FnOnce(&Page) -> T) -> T {
        f(&self.page.read())
    }

    pub fn with_page_mut<T>(&self, f: impl FnOnce(&mut Page) -> T) -> T {
        f(&mut self.page.write())
    }
}

/// Page lock modes for `lock_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLockMode {
    Unlock,
    /// Concurrent readers; excluded by any exclusive holder.
    Share,
    /// Excludes readers, writers, and waits for page-access pins to drain
    /// down to the exclusive waiters themselves.
    Exclusive,
    /// Exclusive against lock holders only; does not wait for page-access
    /// pins. Used by identity changes on buffers the pool already owns.
    RefExclusive,
    /// Excludes writers but admits concurrent share readers.
    ReadExclusive,
}

impl BufferDesc {
    /// Acquire or release the page lock. See [`BufferLockMode`].
    pub fn lock(&self, mode: BufferLockMode) {
        let me = std::thread::current().id();
        let mut st = self.state.lock();
        match mode {
            BufferLockMode::Share => {
                while st.flag(BM_EXCLUSIVE) {
                    self.gate.wait(&mut st);
                }
                st.share_count += 1;
            }
            BufferLockMode::ReadExclusive => {
                while st.flag(BM_EXCLUSIVE) || st.read_exclusive_owner.is_some() {
                    self.gate.wait(&mut st);
                }
                st.read_exclusive_owner = Some(me);
            }
            BufferLockMode::Exclusive => {
                st.e_waiting += 1;
                while st.flag(BM_EXCLUSIVE)
                    || st.read_exclusive_owner.is_some()
                    || st.share_count > 0
                    || st.page_access > st.e_waiting
                {
                    self.gate.wait(&mut st);
                }
                st.e_waiting -= 1;
                st.flags |= BM_EXCLUSIVE;
                st.exclusive_owner = Some(me);
            }
            BufferLockMode::RefExclusive => {
                while st.flag(BM_EXCLUSIVE)
                    || st.read_exclusive_owner.is_some()
                    || st.share_count > 0
                {
                    self.gate.wait(&mut st);
                }
                st.flags |= BM_EXCLUSIVE;
                st.exclusive_owner = Some(me);
            }
            BufferLockMode::Unlock => {
                if st.flag(BM_EXCLUSIVE) && st.exclusive_owner == Some(me) {
                    st.flags &= !BM_EXCLUSIVE;
                    st.exclusive_owner = None;
                } else if st.read_exclusive_owner == Some(me) {
                    st.read_exclusive_owner = None;
                } else {
                    debug_assert!(st.share_count > 0, "unlocking an unlocked buffer");
                    st.share_count = st.share_count.saturating_sub(1);
                }
                self.gate.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_share_locks_coexist() {
        let desc = BufferDesc::new(0, 1024);
        desc.lock(BufferLockMode::Share);
        desc.lock(BufferLockMode::Share);
        assert_eq!(desc.state.lock().share_count, 2);
        desc.lock(BufferLockMode::Unlock);
        desc.lock(BufferLockMode::Unlock);
        assert_eq!(desc.state.lock().share_count, 0);
    }

    #[test]
    fn test_exclusive_blocks_share() {
        let desc = BufferDesc::new(0, 1024);
        desc.lock(BufferLockMode::Exclusive);

        let d2 = Arc::clone(&desc);
        let reader = std::thread::spawn(move || {
            d2.lock(BufferLockMode::Share);
            d2.lock(BufferLockMode::Unlock);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());

        desc.lock(BufferLockMode::Unlock);
        reader.join().unwrap();
    }

    #[test]
    fn test_read_exclusive_admits_readers() {
        let desc = BufferDesc::new(0, 1024);
        desc.lock(BufferLockMode::ReadExclusive);
        desc.lock(BufferLockMode::Share);
        assert_eq!(desc.state.lock().share_count, 1);
        desc.lock(BufferLockMode::Unlock); // releases read-exclusive first
        assert!(desc.state.lock().read_exclusive_owner.is_none());
        desc.lock(BufferLockMode::Unlock); // then the share count
        assert_eq!(desc.state.lock().share_count, 0);
    }

    #[test]
    fn test_exclusive_waits_for_page_access_drain() {
        let desc = BufferDesc::new(0, 1024);
        {
            let mut st = desc.state.lock();
            st.ref_count = 2;
            st.page_access = 2;
        }

        let d2 = Arc::clone(&desc);
        let writer = std::thread::spawn(move || {
            // This thread holds one of the two page-access pins.
            d2.lock(BufferLockMode::Exclusive);
            d2.lock(BufferLockMode::Unlock);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        // Drain the other page-access pin; the writer may proceed.
        {
            let mut st = desc.state.lock();
            st.ref_count -= 1;
            st.page_access -= 1;
            if st.e_waiting > 0 && st.page_access == st.e_waiting {
                desc.gate.notify_all();
            }
        }
        writer.join().unwrap();
    }
}

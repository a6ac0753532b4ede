// Partitioned lock tables.
//
// Locks and holders live in hash tables partitioned by relation oid, each
// partition under its own mutex. A lock entry carries the requested and
// active per-mode counts, the conflict and wait masks, and a waiter queue
// ordered by mode priority; a holder entry counts one (lock, thread,
// transaction) relationship. Waiters sleep on their own condvar and are
// granted by the releasing thread, strictly in queue order except where a
// holder already owns a compatible mode.
//
// The deadlock detector (`deadlock.rs`) reads the same tables through the
// wait registry; on a confirmed cycle it rolls the sleeper's request back
// and fails the acquisition.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::common::{BlockNumber, Oid, TransactionId};
use crate::error::{Result, StoreError};
use crate::lock::mode::{LockMask, LockMode, ALL_MODES, NUM_LOCK_MODES};

/// Lock methods: transactional locks block; user (advisory) locks share
/// the table infrastructure but never block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMethod {
    Default,
    User,
}

/// The object a lock covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockObject {
    Relation,
    Page(BlockNumber),
    Transaction(TransactionId),
    User { key1: u32, key2: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTag {
    pub method: LockMethod,
    pub db: Oid,
    pub rel: Oid,
    pub object: LockObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderTag {
    pub tag: LockTag,
    pub thread: ThreadId,
    pub xid: TransactionId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum WaitOutcome {
    Pending,
    Granted,
    Deadlocked,
    Cancelled,
}

/// One sleeping acquisition.
pub(crate) struct Waiter {
    pub thread: ThreadId,
    pub xid: TransactionId,
    pub tag: LockTag,
    pub mode: LockMode,
    /// Modes the sleeping thread holds on this lock, for cycle analysis.
    pub hold_mask: LockMask,
    pub state: Mutex<WaitOutcome>,
    pub cond: Condvar,
}

impl Waiter {
    pub(crate) fn is_pending(&self) -> bool {
        *self.state.lock() == WaitOutcome::Pending
    }
}

#[derive(Default)]
pub(crate) struct LockEntry {
    /// Modes with at least one active holder.
    pub mask: LockMask,
    /// Modes some waiter is sleeping for.
    pub wait_mask: LockMask,
    /// Holders either holding or waiting, total and per mode.
    pub n_holding: i32,
    pub holders: [i32; NUM_LOCK_MODES],
    /// Granted holders, total and per mode.
    pub n_active: i32,
    pub active_holders: [i32; NUM_LOCK_MODES],
    pub waiters: Vec<Arc<Waiter>>,
}

#[derive(Default)]
pub(crate) struct HolderEntry {
    pub counts: [i32; NUM_LOCK_MODES],
    pub n_holding: i32,
}

#[derive(Default)]
pub(crate) struct Partition {
    pub locks: HashMap<LockTag, LockEntry>,
    pub holders: HashMap<HolderTag, HolderEntry>,
}

#[derive(Debug, PartialEq)]
enum Resolve {
    Ok,
    Found,
}

pub struct LockTable {
    partitions: Vec<Mutex<Partition>>,
    /// Every holder tag a thread owns, for release-all and diagnostics.
    thread_locks: DashMap<ThreadId, HashSet<HolderTag>>,
    /// Threads currently sleeping on a lock.
    pub(crate) wait_table: DashMap<ThreadId, Arc<Waiter>>,
    /// Serializes deadlock detection runs: two halves of one cycle must
    /// not both elect themselves victim.
    detect_lock: Mutex<()>,
    /// How long a waiter sleeps before re-running deadlock detection.
    deadlock_interval: Duration,
    disabled: AtomicBool,
}

impl LockTable {
    pub fn new(partitions: usize, deadlock_interval: Duration) -> Self {
        let partitions = partitions.max(1);
        Self {
            partitions: (0..partitions).map(|_| Mutex::new(Partition::default())).collect(),
            thread_locks: DashMap::new(),
            wait_table: DashMap::new(),
            detect_lock: Mutex::new(()),
            deadlock_interval,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn disable(&self, value: bool) {
        self.disabled.store(value, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub(crate) fn partition_of(&self, tag: &LockTag) -> usize {
        tag.rel as usize % self.partitions.len()
    }

    pub(crate) fn partition_guard(&self, index: usize) -> MutexGuard<'_, Partition> {
        self.partitions[index].lock()
    }

    fn register_holder(&self, htag: HolderTag) {
        self.thread_locks.entry(htag.thread).or_default().insert(htag);
    }

    fn unregister_holder(&self, htag: &HolderTag) {
        if let Some(mut set) = self.thread_locks.get_mut(&htag.thread) {
            set.remove(htag);
        }
    }

    /// Sum of the calling thread's held modes on one lock, across all of
    /// its transaction ids.
    pub(crate) fn count_my_locks(
        part: &Partition,
        tag: &LockTag,
        thread: ThreadId,
    ) -> [i32; NUM_LOCK_MODES] {
        let mut my = [0i32; NUM_LOCK_MODES];
        for (htag, holder) in &part.holders {
            if htag.tag == *tag && htag.thread == thread {
                for (i, count) in holder.counts.iter().enumerate() {
                    my[i] += count;
                }
            }
        }
        my
    }

    fn mask_of(counts: &[i32; NUM_LOCK_MODES]) -> LockMask {
        let mut mask = 0;
        for mode in ALL_MODES {
            if counts[mode.index()] > 0 {
                mask |= mode.bit();
            }
        }
        mask
    }

    /// Conflict resolution: a request is granted unless a mode held by
    /// *another* thread conflicts with it. One thread's own locks never
    /// conflict with one another.
    fn resolve(entry: &LockEntry, mode: LockMode, my: &[i32; NUM_LOCK_MODES]) -> Resolve {
        if mode.conflicts() & entry.mask == 0 {
            return Resolve::Ok;
        }
        let mut others = 0;
        for m in ALL_MODES {
            if entry.active_holders[m.index()] != my[m.index()] {
                others |= m.bit();
            }
        }
        if mode.conflicts() & others == 0 {
            Resolve::Ok
        } else {
            Resolve::Found
        }
    }

    fn grant(entry: &mut LockEntry, holder: &mut HolderEntry, mode: LockMode) {
        entry.n_active += 1;
        entry.active_holders[mode.index()] += 1;
        entry.mask |= mode.bit();
        holder.counts[mode.index()] += 1;
        holder.n_holding += 1;
        debug_assert!(entry.n_active <= entry.n_holding);
        debug_assert!(entry.active_holders[mode.index()] <= entry.holders[mode.index()]);
    }

    fn recompute_wait_mask(entry: &mut LockEntry) {
        entry.wait_mask = entry.waiters.iter().fold(0, |m, w| m | w.mode.bit());
    }

    fn gc_lock(part: &mut Partition, tag: &LockTag) {
        if let Some(entry) = part.locks.get(tag) {
            if entry.n_holding == 0 && entry.waiters.is_empty() {
                part.locks.remove(tag);
            }
        }
    }

    /// Acquire a lock, sleeping on conflict unless `failfast` is set or the
    /// tag belongs to the user method (user locks never block).
    pub fn acquire(
        &self,
        tag: LockTag,
        xid: TransactionId,
        mode: LockMode,
        failfast: bool,
    ) -> Result<()> {
        if self.is_disabled() {
            return Ok(());
        }
        let thread = std::thread::current().id();
        let htag = HolderTag { tag, thread, xid };
        let pi = self.partition_of(&tag);

        let waiter = {
            let mut guard = self.partition_guard(pi);
            let part = &mut *guard;

            {
                let entry = part.locks.entry(tag).or_default();
                entry.n_holding += 1;
                entry.holders[mode.index()] += 1;
            }
            if !part.holders.contains_key(&htag) {
                part.holders.insert(htag, HolderEntry::default());
                self.register_holder(htag);
            }

            // Fast paths: sole holder of anything on this lock, or already
            // holding the requested mode under this xid.
            {
                let holder = part.holders.get(&htag).unwrap();
                let entry = part.locks.get(&tag).unwrap();
                if holder.n_holding == entry.n_active || holder.counts[mode.index()] > 0 {
                    let entry = part.locks.get_mut(&tag).unwrap();
                    let holder = part.holders.get_mut(&htag).unwrap();
                    Self::grant(entry, holder, mode);
                    return Ok(());
                }
            }

            // Locks held by this thread under any xid never conflict.
            let my = Self::count_my_locks(part, &tag, thread);
            if my[mode.index()] > 0 {
                let entry = part.locks.get_mut(&tag).unwrap();
                let holder = part.holders.get_mut(&htag).unwrap();
                Self::grant(entry, holder, mode);
                return Ok(());
            }

            let status = {
                let entry = part.locks.get(&tag).unwrap();
                if mode.conflicts() & entry.wait_mask != 0 {
                    // Earlier waiters want conflicting modes. Unless one of
                    // my held modes conflicts with them, queue behind so
                    // they are not starved.
                    let i_block_waiters = ALL_MODES.iter().any(|m| {
                        my[m.index()] > 0 && m.conflicts() & entry.wait_mask != 0
                    });
                    if i_block_waiters {
                        Self::resolve(entry, mode, &my)
                    } else {
                        Resolve::Found
                    }
                } else {
                    Self::resolve(entry, mode, &my)
                }
            };

            if status == Resolve::Ok {
                let entry = part.locks.get_mut(&tag).unwrap();
                let holder = part.holders.get_mut(&htag).unwrap();
                Self::grant(entry, holder, mode);
                return Ok(());
            }

            // Conflict found.
            if failfast || tag.method == LockMethod::User {
                self.rollback_request(part, &tag, &htag, mode);
                return Err(StoreError::LockNotAvailable);
            }

            // Enqueue ordered by priority, FIFO within equal priority, and
            // go to sleep.
            let waiter = Arc::new(Waiter {
                thread,
                xid,
                tag,
                mode,
                hold_mask: Self::mask_of(&my),
                state: Mutex::new(WaitOutcome::Pending),
                cond: Condvar::new(),
            });
            let entry = part.locks.get_mut(&tag).unwrap();
            let pos = entry
                .waiters
                .iter()
                .position(|w| w.mode.priority() < mode.priority())
                .unwrap_or(entry.waiters.len());
            entry.waiters.insert(pos, Arc::clone(&waiter));
            entry.wait_mask |= mode.bit();
            self.wait_table.insert(thread, Arc::clone(&waiter));
            waiter
        };

        let outcome = self.sleep_on(&waiter);
        self.wait_table.remove(&thread);
        match outcome {
            WaitOutcome::Granted => Ok(()),
            WaitOutcome::Deadlocked => Err(StoreError::Deadlock),
            WaitOutcome::Cancelled => Err(StoreError::Cancelled),
            WaitOutcome::Pending => Err(StoreError::Internal(
                "lock waiter woke without an outcome".into(),
            )),
        }
    }

    /// Take back the count increments of a failed or abandoned request and
    /// garbage-collect empty entries.
    fn rollback_request(
        &self,
        part: &mut Partition,
        tag: &LockTag,
        htag: &HolderTag,
        mode: LockMode,
    ) {
        if let Some(entry) = part.locks.get_mut(tag) {
            entry.n_holding -= 1;
            entry.holders[mode.index()] -= 1;
            debug_assert!(entry.n_holding >= 0 && entry.holders[mode.index()] >= 0);
        }
        let empty = part
            .holders
            .get(htag)
            .map(|h| h.n_holding == 0)
            .unwrap_or(false);
        if empty {
            part.holders.remove(htag);
            self.unregister_holder(htag);
        }
        Self::gc_lock(part, tag);
    }

    fn sleep_on(&self, waiter: &Arc<Waiter>) -> WaitOutcome {
        let mut state = waiter.state.lock();
        loop {
            match *state {
                WaitOutcome::Pending => {}
                outcome => return outcome,
            }
            let timed_out = waiter
                .cond
                .wait_for(&mut state, self.deadlock_interval)
                .timed_out();
            if timed_out && *state == WaitOutcome::Pending {
                drop(state);
                if self.deadlock_check(waiter) {
                    return WaitOutcome::Deadlocked;
                }
                // The wait is untimed, but the owning environment can pull
                // the plug on it.
                let cancelled = crate::session::EnvManager::current_env()
                    .map(|env| env.is_cancelled())
                    .unwrap_or(false);
                if cancelled && self.withdraw(waiter) {
                    return WaitOutcome::Cancelled;
                }
                state = waiter.state.lock();
            }
        }
    }

    /// Pull a still-pending waiter out of its queue and take back its
    /// request. Returns false when a grant beat the withdrawal.
    fn withdraw(&self, waiter: &Arc<Waiter>) -> bool {
        let pi = self.partition_of(&waiter.tag);
        let mut guard = self.partition_guard(pi);
        let part = &mut *guard;
        let mut state = waiter.state.lock();
        if *state != WaitOutcome::Pending {
            return false;
        }
        let htag = HolderTag {
            tag: waiter.tag,
            thread: waiter.thread,
            xid: waiter.xid,
        };
        if let Some(entry) = part.locks.get_mut(&waiter.tag) {
            entry.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
            entry.n_holding -= 1;
            entry.holders[waiter.mode.index()] -= 1;
            Self::recompute_wait_mask(entry);
        }
        let empty = part
            .holders
            .get(&htag)
            .map(|h| h.n_holding == 0)
            .unwrap_or(false);
        if empty {
            part.holders.remove(&htag);
            self.unregister_holder(&htag);
        }
        Self::gc_lock(part, &waiter.tag);
        *state = WaitOutcome::Cancelled;
        true
    }

    /// Release one mode of one lock. Unblocked waiters are granted in
    /// queue order.
    pub fn release(&self, tag: LockTag, xid: TransactionId, mode: LockMode) -> Result<()> {
        if self.is_disabled() {
            return Ok(());
        }
        let thread = std::thread::current().id();
        let htag = HolderTag { tag, thread, xid };
        let pi = self.partition_of(&tag);
        let mut guard = self.partition_guard(pi);
        let part = &mut *guard;

        if !part.locks.contains_key(&tag) {
            warn!(?tag, "release of an unknown lock");
            return Err(StoreError::LockTableCorrupted(
                "release of an unknown lock".into(),
            ));
        }
        let holder = match part.holders.get_mut(&htag) {
            Some(h) => h,
            None => {
                warn!(?tag, "release by a non-holder");
                return Err(StoreError::LockTableCorrupted(
                    "release by a non-holder".into(),
                ));
            }
        };
        if holder.counts[mode.index()] <= 0 {
            warn!(?tag, %mode, "releasing a mode that is not held");
            return Err(StoreError::LockTableCorrupted(
                "releasing a mode that is not held".into(),
            ));
        }

        holder.counts[mode.index()] -= 1;
        holder.n_holding -= 1;
        if holder.n_holding == 0 {
            part.holders.remove(&htag);
            self.unregister_holder(&htag);
        }

        let entry = part.locks.get_mut(&tag).unwrap();
        entry.n_holding -= 1;
        entry.holders[mode.index()] -= 1;
        entry.n_active -= 1;
        entry.active_holders[mode.index()] -= 1;
        if entry.active_holders[mode.index()] == 0 {
            entry.mask &= !mode.bit();
        }
        debug_assert!(entry.n_active >= 0 && entry.n_holding >= 0);

        self.wakeup(part, &tag);
        Self::gc_lock(part, &tag);
        Ok(())
    }

    /// Grant as many waiters as compatibility permits: a waiter is granted
    /// iff its mode conflicts neither with the active mask nor with the
    /// modes requested by waiters ahead of it.
    pub(crate) fn wakeup(&self, part: &mut Partition, tag: &LockTag) {
        let mut ahead: LockMask = 0;
        let mut index = 0;
        loop {
            let decision = {
                let entry = match part.locks.get(tag) {
                    Some(e) => e,
                    None => return,
                };
                if index >= entry.waiters.len() {
                    break;
                }
                let w = &entry.waiters[index];
                if w.mode.conflicts() & ahead != 0 {
                    None
                } else {
                    let my = Self::count_my_locks(part, tag, w.thread);
                    match Self::resolve(entry, w.mode, &my) {
                        Resolve::Ok => Some(()),
                        Resolve::Found => None,
                    }
                }
            };
            match decision {
                Some(()) => {
                    let entry = part.locks.get_mut(tag).unwrap();
                    let w = entry.waiters.remove(index);
                    let whtag = HolderTag {
                        tag: *tag,
                        thread: w.thread,
                        xid: w.xid,
                    };
                    if !part.holders.contains_key(&whtag) {
                        part.holders.insert(whtag, HolderEntry::default());
                        self.register_holder(whtag);
                    }
                    let entry = part.locks.get_mut(tag).unwrap();
                    let holder = part.holders.get_mut(&whtag).unwrap();
                    Self::grant(entry, holder, w.mode);
                    *w.state.lock() = WaitOutcome::Granted;
                    w.cond.notify_one();
                }
                None => {
                    let entry = part.locks.get(tag).unwrap();
                    ahead |= entry.waiters[index].mode.bit();
                    index += 1;
                }
            }
        }
        let entry = part.locks.get_mut(tag).unwrap();
        Self::recompute_wait_mask(entry);
    }

    /// Release every lock a thread holds for the given method, either for
    /// one transaction id or across all of them. Empty locks are collected.
    pub fn release_all(
        &self,
        method: LockMethod,
        thread: ThreadId,
        xid: Option<TransactionId>,
    ) -> Result<()> {
        if self.is_disabled() {
            return Ok(());
        }
        let tags: Vec<HolderTag> = self
            .thread_locks
            .get(&thread)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        for htag in tags {
            if htag.tag.method != method {
                continue;
            }
            if let Some(xid) = xid {
                if htag.xid != xid {
                    continue;
                }
            }
            let pi = self.partition_of(&htag.tag);
            let mut guard = self.partition_guard(pi);
            let part = &mut *guard;
            let holder = match part.holders.remove(&htag) {
                Some(h) => h,
                None => continue,
            };
            self.unregister_holder(&htag);

            if let Some(entry) = part.locks.get_mut(&htag.tag) {
                for mode in ALL_MODES {
                    let held = holder.counts[mode.index()];
                    if held > 0 {
                        entry.holders[mode.index()] -= held;
                        entry.active_holders[mode.index()] -= held;
                        if entry.active_holders[mode.index()] == 0 {
                            entry.mask &= !mode.bit();
                        }
                    }
                }
                entry.n_holding -= holder.n_holding;
                entry.n_active -= holder.n_holding;
                debug_assert!(entry.n_active >= 0 && entry.n_holding >= 0);
                debug_assert!(entry.n_active <= entry.n_holding);
            }
            self.wakeup(part, &htag.tag);
            Self::gc_lock(part, &htag.tag);
        }
        debug!(?thread, "released all locks");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deadlock handling; the graph walk itself lives in deadlock.rs.
    // ------------------------------------------------------------------

    /// Run the detector for a sleeping waiter. Returns true when a genuine
    /// deadlock was confirmed; in that case the waiter's request has been
    /// rolled back and its outcome set.
    fn deadlock_check(&self, waiter: &Arc<Waiter>) -> bool {
        let _detect = self.detect_lock.lock();
        if !crate::lock::deadlock::wait_cycle_exists(self, waiter) {
            return false;
        }

        let pi = self.partition_of(&waiter.tag);
        let mut guard = self.partition_guard(pi);
        let part = &mut *guard;
        let htag = HolderTag {
            tag: waiter.tag,
            thread: waiter.thread,
            xid: waiter.xid,
        };

        {
            let mut state = waiter.state.lock();
            if *state != WaitOutcome::Pending {
                // A release granted this waiter while the detector ran.
                return false;
            }

            // Last chance: re-run conflict resolution in case a release
            // slipped in while the graph was being walked.
            if part.locks.contains_key(&waiter.tag) {
                let my = Self::count_my_locks(part, &waiter.tag, waiter.thread);
                let ok = {
                    let entry = part.locks.get(&waiter.tag).unwrap();
                    Self::resolve(entry, waiter.mode, &my) == Resolve::Ok
                };
                if ok {
                    let entry = part.locks.get_mut(&waiter.tag).unwrap();
                    entry.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
                    Self::recompute_wait_mask(entry);
                    let holder = part.holders.get_mut(&htag).unwrap();
                    let entry = part.locks.get_mut(&waiter.tag).unwrap();
                    Self::grant(entry, holder, waiter.mode);
                    *state = WaitOutcome::Granted;
                    return false;
                }
            }
        }

        // Anti-starvation: wake any waiter blocked only by implicit
        // queueing before declaring the deadlock final.
        self.anti_starve(part, &waiter.tag, waiter);
        {
            let mut state = waiter.state.lock();
            if *state != WaitOutcome::Pending {
                return false;
            }
            let my = Self::count_my_locks(part, &waiter.tag, waiter.thread);
            if let Some(entry) = part.locks.get(&waiter.tag) {
                if Self::resolve(entry, waiter.mode, &my) == Resolve::Ok {
                    let entry = part.locks.get_mut(&waiter.tag).unwrap();
                    entry.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
                    Self::recompute_wait_mask(entry);
                    let holder = part.holders.get_mut(&htag).unwrap();
                    let entry = part.locks.get_mut(&waiter.tag).unwrap();
                    Self::grant(entry, holder, waiter.mode);
                    *state = WaitOutcome::Granted;
                    return false;
                }
            }

            // Confirmed: withdraw the request.
            warn!(
                tag = ?waiter.tag,
                mode = %waiter.mode,
                held = waiter.hold_mask,
                "deadlock detected"
            );
            if let Some(entry) = part.locks.get_mut(&waiter.tag) {
                entry.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
                entry.n_holding -= 1;
                entry.holders[waiter.mode.index()] -= 1;
                Self::recompute_wait_mask(entry);
            }
            let empty = part
                .holders
                .get(&htag)
                .map(|h| h.n_holding == 0)
                .unwrap_or(false);
            if empty {
                part.holders.remove(&htag);
                self.unregister_holder(&htag);
            }
            Self::gc_lock(part, &waiter.tag);
            *state = WaitOutcome::Deadlocked;
        }
        true
    }

    /// Grant any waiter whose mode is compatible with the active holders,
    /// ignoring queue order. Used only from the deadlock path.
    fn anti_starve(&self, part: &mut Partition, tag: &LockTag, skip: &Arc<Waiter>) {
        let mut index = 0;
        loop {
            let decision = {
                let entry = match part.locks.get(tag) {
                    Some(e) => e,
                    None => return,
                };
                if index >= entry.waiters.len() {
                    break;
                }
                let w = &entry.waiters[index];
                if Arc::ptr_eq(w, skip) {
                    None
                } else {
                    let my = Self::count_my_locks(part, tag, w.thread);
                    match Self::resolve(entry, w.mode, &my) {
                        Resolve::Ok => Some(()),
                        Resolve::Found => None,
                    }
                }
            };
            match decision {
                Some(()) => {
                    let entry = part.locks.get_mut(tag).unwrap();
                    let w = entry.waiters.remove(index);
                    let whtag = HolderTag {
                        tag: *tag,
                        thread: w.thread,
                        xid: w.xid,
                    };
                    if !part.holders.contains_key(&whtag) {
                        part.holders.insert(whtag, HolderEntry::default());
                        self.register_holder(whtag);
                    }
                    let entry = part.locks.get_mut(tag).unwrap();
                    let holder = part.holders.get_mut(&whtag).unwrap();
                    Self::grant(entry, holder, w.mode);
                    *w.state.lock() = WaitOutcome::Granted;
                    w.cond.notify_one();
                }
                None => index += 1,
            }
        }
        let entry = part.locks.get_mut(tag).unwrap();
        Self::recompute_wait_mask(entry);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Check the counting invariants of one lock entry, when present.
    pub fn check_lock_invariants(&self, tag: &LockTag) -> bool {
        let guard = self.partition_guard(self.partition_of(tag));
        match guard.locks.get(tag) {
            None => true,
            Some(entry) => {
                let mut ok = entry.n_active <= entry.n_holding && entry.n_active >= 0;
                for mode in ALL_MODES {
                    let i = mode.index();
                    ok &= 0 <= entry.active_holders[i]
                        && entry.active_holders[i] <= entry.holders[i]
                        && entry.holders[i] <= entry.n_holding;
                    ok &= (entry.mask & mode.bit() != 0) == (entry.active_holders[i] > 0);
                }
                let expected_wait_mask =
                    entry.waiters.iter().fold(0, |m, w| m | w.mode.bit());
                ok && entry.wait_mask == expected_wait_mask
            }
        }
    }

    /// Sum-of-modes check for every holder of a thread.
    pub fn check_holder_invariants(&self, thread: ThreadId) -> bool {
        let tags: Vec<HolderTag> = self
            .thread_locks
            .get(&thread)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        tags.iter().all(|htag| {
            let guard = self.partition_guard(self.partition_of(&htag.tag));
            match guard.holders.get(htag) {
                None => true,
                Some(h) => h.counts.iter().sum::<i32>() == h.n_holding,
            }
        })
    }

    /// Number of modes a thread actively holds on a lock, for tests.
    pub fn held_count(&self, tag: &LockTag, xid: TransactionId) -> i32 {
        let thread = std::thread::current().id();
        let guard = self.partition_guard(self.partition_of(tag));
        guard
            .holders
            .get(&HolderTag {
                tag: *tag,
                thread,
                xid,
            })
            .map(|h| h.n_holding)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table() -> Arc<LockTable> {
        Arc::new(LockTable::new(4, Duration::from_millis(100)))
    }

    fn rel_tag(rel: Oid) -> LockTag {
        LockTag {
            method: LockMethod::Default,
            db: 1,
            rel,
            object: LockObject::Relation,
        }
    }

    #[test]
    fn test_grant_and_release() {
        let t = table();
        let tag = rel_tag(10);
        t.acquire(tag, 100, LockMode::AccessShare, false).unwrap();
        assert_eq!(t.held_count(&tag, 100), 1);
        assert!(t.check_lock_invariants(&tag));
        t.release(tag, 100, LockMode::AccessShare).unwrap();
        assert_eq!(t.held_count(&tag, 100), 0);
        assert!(t.check_lock_invariants(&tag));
    }

    #[test]
    fn test_reacquire_same_mode_is_fast_path() {
        let t = table();
        let tag = rel_tag(10);
        t.acquire(tag, 100, LockMode::RowExclusive, false).unwrap();
        t.acquire(tag, 100, LockMode::RowExclusive, false).unwrap();
        assert_eq!(t.held_count(&tag, 100), 2);
        t.release(tag, 100, LockMode::RowExclusive).unwrap();
        t.release(tag, 100, LockMode::RowExclusive).unwrap();
        assert!(t.check_lock_invariants(&tag));
    }

    #[test]
    fn test_own_locks_do_not_conflict() {
        let t = table();
        let tag = rel_tag(10);
        // Same thread, different transaction ids: no self-conflict.
        t.acquire(tag, 100, LockMode::Exclusive, false).unwrap();
        t.acquire(tag, 101, LockMode::Exclusive, false).unwrap();
        t.release(tag, 100, LockMode::Exclusive).unwrap();
        t.release(tag, 101, LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_failfast_conflict_returns_immediately() {
        let t = table();
        let tag = rel_tag(10);
        t.acquire(tag, 100, LockMode::Exclusive, false).unwrap();

        let t2 = Arc::clone(&t);
        let other = std::thread::spawn(move || {
            t2.acquire(tag, 200, LockMode::Exclusive, true)
        });
        let err = other.join().unwrap().unwrap_err();
        assert!(matches!(err, StoreError::LockNotAvailable));
        assert!(t.check_lock_invariants(&tag));
        t.release(tag, 100, LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_user_locks_never_block() {
        let t = table();
        let tag = LockTag {
            method: LockMethod::User,
            db: 1,
            rel: 0,
            object: LockObject::User { key1: 7, key2: 9 },
        };
        t.acquire(tag, 0, LockMode::Exclusive, false).unwrap();

        let t2 = Arc::clone(&t);
        let other = std::thread::spawn(move || t2.acquire(tag, 0, LockMode::Exclusive, false));
        let err = other.join().unwrap().unwrap_err();
        assert!(matches!(err, StoreError::LockNotAvailable));
        t.release(tag, 0, LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_blocking_wait_granted_on_release() {
        let t = table();
        let tag = rel_tag(11);
        t.acquire(tag, 100, LockMode::Exclusive, false).unwrap();

        let t2 = Arc::clone(&t);
        let other = std::thread::spawn(move || {
            t2.acquire(tag, 200, LockMode::Exclusive, false).unwrap();
            t2.release(tag, 200, LockMode::Exclusive).unwrap();
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!other.is_finished());

        t.release(tag, 100, LockMode::Exclusive).unwrap();
        other.join().unwrap();
        assert!(t.check_lock_invariants(&tag));
    }

    #[test]
    fn test_waiting_writer_blocks_later_reader() {
        let t = table();
        let tag = rel_tag(12);
        // Holder: share lock. Writer queues. A later share request must not
        // jump the queue, even though it is compatible with the holder.
        t.acquire(tag, 100, LockMode::Share, false).unwrap();

        let t2 = Arc::clone(&t);
        let writer = std::thread::spawn(move || {
            t2.acquire(tag, 200, LockMode::Exclusive, false).unwrap();
            t2.release(tag, 200, LockMode::Exclusive).unwrap();
        });
        std::thread::sleep(Duration::from_millis(50));

        let t3 = Arc::clone(&t);
        let reader = std::thread::spawn(move || {
            t3.acquire(tag, 300, LockMode::Share, false).unwrap();
            t3.release(tag, 300, LockMode::Share).unwrap();
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        assert!(!reader.is_finished());

        t.release(tag, 100, LockMode::Share).unwrap();
        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn test_release_all_frees_waiters() {
        let t = table();
        let a = rel_tag(13);
        let b = rel_tag(14);
        t.acquire(a, 100, LockMode::Exclusive, false).unwrap();
        t.acquire(b, 100, LockMode::Exclusive, false).unwrap();

        let t2 = Arc::clone(&t);
        let other = std::thread::spawn(move || {
            t2.acquire(a, 200, LockMode::Exclusive, false).unwrap();
            t2.acquire(b, 200, LockMode::Exclusive, false).unwrap();
            t2.release_all(LockMethod::Default, std::thread::current().id(), None)
                .unwrap();
        });
        std::thread::sleep(Duration::from_millis(50));

        t.release_all(LockMethod::Default, std::thread::current().id(), None)
            .unwrap();
        other.join().unwrap();
        assert!(t.check_lock_invariants(&a));
        assert!(t.check_lock_invariants(&b));
    }

    #[test]
    fn test_release_of_unheld_mode_is_reported() {
        let t = table();
        let tag = rel_tag(15);
        t.acquire(tag, 100, LockMode::Share, false).unwrap();
        let err = t.release(tag, 100, LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, StoreError::LockTableCorrupted(_)));
        t.release(tag, 100, LockMode::Share).unwrap();
    }
}

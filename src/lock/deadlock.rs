// Deadlock detection.
//
// The waits-for relation is kept explicit: the wait registry maps a
// sleeping thread to its pending request, and each lock's holder and
// waiter tables yield the threads that request blocks on. Detection is a
// bounded depth-first search with a visited set, run by the sleeping
// thread itself on each wait timeout. A cycle is only reported when it
// closes back on the sleeper; the caller then gets a last chance to
// self-wake before the request is withdrawn.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::ThreadId;

use tracing::trace;

use crate::lock::mode::ALL_MODES;
use crate::lock::table::{LockTable, Waiter};

/// Upper bound on threads examined in one detection run.
const MAX_VISITED: usize = 1024;

/// True when the sleeping request participates in a waits-for cycle that
/// returns to the sleeper.
pub(crate) fn wait_cycle_exists(table: &LockTable, origin: &Arc<Waiter>) -> bool {
    let mut visited: HashSet<ThreadId> = HashSet::new();
    let mut stack = blockers_of(table, origin);

    while let Some(thread) = stack.pop() {
        if thread == origin.thread {
            trace!(tag = ?origin.tag, "waits-for cycle found");
            return true;
        }
        if !visited.insert(thread) || visited.len() >= MAX_VISITED {
            continue;
        }
        // Follow the edge only while that thread is itself still asleep;
        // a waiter already granted or aborted no longer blocks anyone.
        let waiter = table
            .wait_table
            .get(&thread)
            .map(|entry| Arc::clone(&*entry));
        if let Some(waiter) = waiter {
            if waiter.is_pending() {
                stack.extend(blockers_of(table, &waiter));
            }
        }
    }
    false
}

/// Threads a pending request waits for: holders of conflicting modes on
/// the lock, plus earlier waiters whose requested mode conflicts.
fn blockers_of(table: &LockTable, waiter: &Arc<Waiter>) -> Vec<ThreadId> {
    let guard = table.partition_guard(table.partition_of(&waiter.tag));
    let mut blockers = Vec::new();

    let entry = match guard.locks.get(&waiter.tag) {
        Some(entry) => entry,
        None => return blockers,
    };

    for (htag, holder) in &guard.holders {
        if htag.tag != waiter.tag || htag.thread == waiter.thread {
            continue;
        }
        let conflicting = ALL_MODES
            .iter()
            .any(|m| holder.counts[m.index()] > 0 && waiter.mode.conflicts_with(*m));
        if conflicting {
            blockers.push(htag.thread);
        }
    }

    for other in &entry.waiters {
        if Arc::ptr_eq(other, waiter) {
            break;
        }
        if other.thread != waiter.thread && waiter.mode.conflicts_with(other.mode) {
            blockers.push(other.thread);
        }
    }

    blockers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Oid;
    use crate::error::StoreError;
    use crate::lock::mode::LockMode;
    use crate::lock::table::{LockMethod, LockObject, LockTag};
    use std::time::Duration;

    fn rel_tag(rel: Oid) -> LockTag {
        LockTag {
            method: LockMethod::Default,
            db: 1,
            rel,
            object: LockObject::Relation,
        }
    }

    #[test]
    fn test_two_thread_deadlock_is_broken() {
        let table = Arc::new(LockTable::new(4, Duration::from_millis(50)));
        let a = rel_tag(1);
        let b = rel_tag(2);

        let t1 = Arc::clone(&table);
        let t2 = Arc::clone(&table);

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let b1 = Arc::clone(&barrier);
        let b2 = Arc::clone(&barrier);

        let h1 = std::thread::spawn(move || {
            t1.acquire(a, 100, LockMode::Exclusive, false).unwrap();
            b1.wait();
            let second = t1.acquire(b, 100, LockMode::Exclusive, false);
            // The victim rolls back; the survivor finishes and releases.
            t1.release_all(LockMethod::Default, std::thread::current().id(), None)
                .unwrap();
            second.is_err()
        });
        let h2 = std::thread::spawn(move || {
            t2.acquire(b, 200, LockMode::Exclusive, false).unwrap();
            b2.wait();
            let second = t2.acquire(a, 200, LockMode::Exclusive, false);
            t2.release_all(LockMethod::Default, std::thread::current().id(), None)
                .unwrap();
            second.is_err()
        });

        let d1 = h1.join().unwrap();
        let d2 = h2.join().unwrap();
        // Exactly one side is aborted; the survivor acquires both locks.
        assert!(d1 ^ d2, "exactly one thread must lose the deadlock");
        assert!(table.check_lock_invariants(&a));
        assert!(table.check_lock_invariants(&b));
    }

    #[test]
    fn test_no_false_deadlock_on_plain_contention() {
        let table = Arc::new(LockTable::new(4, Duration::from_millis(20)));
        let tag = rel_tag(3);
        table.acquire(tag, 100, LockMode::Exclusive, false).unwrap();

        let t2 = Arc::clone(&table);
        let waiter = std::thread::spawn(move || t2.acquire(tag, 200, LockMode::Exclusive, false));

        // Keep the waiter sleeping across several detection intervals; the
        // detector must not invent a cycle out of simple contention.
        std::thread::sleep(Duration::from_millis(120));
        assert!(!waiter.is_finished());

        table.release(tag, 100, LockMode::Exclusive).unwrap();
        assert!(waiter.join().unwrap().is_ok());
        let t3 = Arc::clone(&table);
        std::thread::spawn(move || t3.release(tag, 200, LockMode::Exclusive))
            .join()
            .unwrap()
            .ok();
    }

    #[test]
    fn test_three_thread_cycle_detected() {
        let table = Arc::new(LockTable::new(4, Duration::from_millis(50)));
        let tags = [rel_tag(10), rel_tag(11), rel_tag(12)];
        let barrier = Arc::new(std::sync::Barrier::new(3));

        let mut handles = Vec::new();
        for i in 0..3 {
            let t = Arc::clone(&table);
            let bar = Arc::clone(&barrier);
            let own = tags[i];
            let next = tags[(i + 1) % 3];
            let xid = 100 + i as u64;
            handles.push(std::thread::spawn(move || {
                t.acquire(own, xid, LockMode::Exclusive, false).unwrap();
                bar.wait();
                let second = t.acquire(next, xid, LockMode::Exclusive, false);
                let lost = matches!(second, Err(StoreError::Deadlock));
                t.release_all(LockMethod::Default, std::thread::current().id(), None)
                    .unwrap();
                lost
            }));
        }
        let losses: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(
            losses.iter().any(|&l| l),
            "at least one thread must be chosen as the deadlock victim"
        );
        for tag in &tags {
            assert!(table.check_lock_invariants(tag));
        }
    }
}

// Process-wide master lock.
//
// Three compatible hold kinds: readers and transactions coexist with each
// other; a writer excludes both. A waiting writer sets `blocked`, which
// turns away new readers and transactions until it gets its turn. Each
// environment records which kinds it holds in its master bits; all state
// transitions that can unblock a waiter broadcast the gate.

use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};

use crate::session::Environment;

pub const MASTER_TRANSACTION: u8 = 0x01;
pub const MASTER_READ: u8 = 0x02;
pub const MASTER_WRITE: u8 = 0x04;

struct MasterState {
    readers: u32,
    transactions: u32,
    waiting: u32,
    writer: bool,
    /// A writer is queued; new readers and transactions hold back.
    blocked: bool,
    owner: Option<ThreadId>,
}

pub struct MasterLock {
    state: Mutex<MasterState>,
    gate: Condvar,
}

impl MasterLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MasterState {
                readers: 0,
                transactions: 0,
                waiting: 0,
                writer: false,
                blocked: false,
                owner: None,
            }),
            gate: Condvar::new(),
        }
    }

    /// Acquire the writer hold, converting any read hold this environment
    /// already has. A transaction hold is suspended for the wait and
    /// restored once the writer hold is granted.
    pub fn write_lock(&self, env: &Environment) -> u8 {
        let bits = env.master_bits();
        if bits & MASTER_WRITE != 0 {
            return bits;
        }
        let mut st = self.state.lock();
        let mut bits = bits;
        if bits & MASTER_READ != 0 {
            st.readers -= 1;
            bits &= !MASTER_READ;
        }
        if bits & MASTER_TRANSACTION != 0 {
            st.transactions -= 1;
        }
        while st.readers > 0 || st.transactions > 0 || st.writer {
            st.waiting += 1;
            st.blocked = true;
            self.gate.wait(&mut st);
            st.blocked = false;
            st.waiting -= 1;
        }
        if bits & MASTER_TRANSACTION != 0 {
            st.transactions += 1;
        }
        st.writer = true;
        st.owner = Some(std::thread::current().id());
        drop(st);

        bits |= MASTER_WRITE;
        env.set_master_bits(bits);
        bits
    }

    /// Acquire a reader hold, releasing a writer hold first when present.
    pub fn read_lock(&self, env: &Environment) -> u8 {
        let mut bits = env.master_bits();
        let mut st = self.state.lock();
        if bits & MASTER_WRITE != 0 {
            st.writer = false;
            st.owner = None;
            if st.waiting > 0 {
                self.gate.notify_all();
            }
            bits &= !MASTER_WRITE;
        }
        if bits & MASTER_READ != 0 {
            st.readers -= 1;
            bits &= !MASTER_READ;
        }
        while st.writer || st.blocked {
            st.waiting += 1;
            self.gate.wait(&mut st);
            st.waiting -= 1;
        }
        st.readers += 1;
        drop(st);

        bits |= MASTER_READ;
        env.set_master_bits(bits);
        bits
    }

    /// Drop writer and reader holds; the transaction hold survives.
    pub fn unlock(&self, env: &Environment) -> u8 {
        let mut bits = env.master_bits();
        let mut st = self.state.lock();
        if bits & MASTER_WRITE != 0 {
            st.owner = None;
            st.writer = false;
            if st.waiting > 0 {
                self.gate.notify_all();
            }
            bits &= !MASTER_WRITE;
        }
        if bits & MASTER_READ != 0 {
            st.readers -= 1;
            if st.readers == 0 && st.transactions == 0 && !st.writer && st.waiting > 0 {
                self.gate.notify_all();
            }
            bits &= !MASTER_READ;
        }
        drop(st);
        env.set_master_bits(bits);
        bits
    }

    /// Take a transaction hold. Idempotent; blocks while a writer is
    /// active or queued, unless this environment is the writer.
    pub fn transaction_lock(&self, env: &Environment) -> u8 {
        let mut bits = env.master_bits();
        if bits & MASTER_TRANSACTION == 0 {
            let mut st = self.state.lock();
            while (st.blocked || st.writer) && bits & MASTER_WRITE == 0 {
                st.waiting += 1;
                self.gate.wait(&mut st);
                st.waiting -= 1;
            }
            st.transactions += 1;
            drop(st);
            bits |= MASTER_TRANSACTION;
            env.set_master_bits(bits);
        }
        env.set_in_transaction(true);
        bits
    }

    pub fn transaction_unlock(&self, env: &Environment) -> u8 {
        env.set_in_transaction(false);
        let mut bits = env.master_bits();
        if bits & MASTER_TRANSACTION != 0 {
            let mut st = self.state.lock();
            st.transactions -= 1;
            if st.transactions == 0 && st.readers == 0 && !st.writer && st.waiting > 0 {
                self.gate.notify_all();
            }
            drop(st);
            bits &= !MASTER_TRANSACTION;
            env.set_master_bits(bits);
        }
        bits
    }

    /// Step the hold up one level: transaction to read, read to write.
    pub fn upgrade(&self, env: &Environment) -> u8 {
        let bits = env.master_bits();
        if bits & MASTER_WRITE != 0 {
            bits
        } else if bits & MASTER_READ != 0 {
            self.write_lock(env)
        } else {
            self.read_lock(env)
        }
    }

    /// Step the hold back down: write to read, read to none, transaction
    /// released last.
    pub fn downgrade(&self, env: &Environment) -> u8 {
        let bits = env.master_bits();
        if bits & MASTER_WRITE != 0 {
            self.read_lock(env)
        } else if bits & MASTER_READ != 0 {
            self.unlock(env)
        } else {
            self.transaction_unlock(env)
        }
    }

    /// Master-lock counter invariant: an active writer implies no readers
    /// and no foreign transactions. The writer's own transaction hold is
    /// restored after the grant, so at most one may remain counted.
    pub fn check_invariants(&self) -> bool {
        let st = self.state.lock();
        if st.writer {
            st.readers == 0 && st.transactions <= 1 && st.owner.is_some()
        } else {
            st.owner.is_none()
        }
    }
}

impl Default for MasterLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EnvManager;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<EnvManager>, Arc<MasterLock>) {
        (Arc::new(EnvManager::new(8, true)), Arc::new(MasterLock::new()))
    }

    #[test]
    fn test_readers_and_transactions_coexist() {
        let (envs, master) = setup();
        let e1 = envs.create_env(None).unwrap();
        let e2 = envs.create_env(None).unwrap();
        master.read_lock(&e1);
        master.transaction_lock(&e2);
        assert!(master.check_invariants());
        master.unlock(&e1);
        master.transaction_unlock(&e2);
    }

    #[test]
    fn test_writer_excludes_everyone() {
        let (envs, master) = setup();
        let writer_env = envs.create_env(None).unwrap();
        master.write_lock(&writer_env);
        assert!(master.check_invariants());

        let envs2 = Arc::clone(&envs);
        let master2 = Arc::clone(&master);
        let reader = std::thread::spawn(move || {
            let e = envs2.create_env(None).unwrap();
            master2.read_lock(&e);
            master2.unlock(&e);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());

        master.unlock(&writer_env);
        reader.join().unwrap();
        assert!(master.check_invariants());
    }

    #[test]
    fn test_pending_writer_blocks_new_readers() {
        let (envs, master) = setup();
        let r1 = envs.create_env(None).unwrap();
        let r2 = envs.create_env(None).unwrap();
        master.read_lock(&r1);
        master.read_lock(&r2);

        let envs_w = Arc::clone(&envs);
        let master_w = Arc::clone(&master);
        let writer = std::thread::spawn(move || {
            let e = envs_w.create_env(None).unwrap();
            master_w.write_lock(&e);
            let granted_at = std::time::Instant::now();
            // Hold briefly so the late reader observably waits behind us.
            std::thread::sleep(Duration::from_millis(50));
            master_w.unlock(&e);
            granted_at
        });
        std::thread::sleep(Duration::from_millis(50));

        let envs_r = Arc::clone(&envs);
        let master_r = Arc::clone(&master);
        let late_reader = std::thread::spawn(move || {
            let e = envs_r.create_env(None).unwrap();
            master_r.read_lock(&e);
            let at = std::time::Instant::now();
            master_r.unlock(&e);
            at
        });
        std::thread::sleep(Duration::from_millis(50));
        // The late reader queues behind the pending writer.
        assert!(!late_reader.is_finished());

        master.unlock(&r1);
        master.unlock(&r2);
        let writer_granted = writer.join().unwrap();
        let reader_granted = late_reader.join().unwrap();
        // The reader only gets in after the writer's full hold.
        assert!(
            reader_granted >= writer_granted + Duration::from_millis(50),
            "writer must win over the late reader"
        );
        assert!(master.check_invariants());
    }

    #[test]
    fn test_upgrade_downgrade_chain() {
        let (envs, master) = setup();
        let e = envs.create_env(None).unwrap();

        master.transaction_lock(&e);
        assert_eq!(e.master_bits(), MASTER_TRANSACTION);
        master.upgrade(&e);
        assert_eq!(e.master_bits(), MASTER_TRANSACTION | MASTER_READ);
        master.upgrade(&e);
        assert_eq!(e.master_bits(), MASTER_TRANSACTION | MASTER_WRITE);
        assert!(master.check_invariants());

        master.downgrade(&e);
        assert_eq!(e.master_bits(), MASTER_TRANSACTION | MASTER_READ);
        master.downgrade(&e);
        assert_eq!(e.master_bits(), MASTER_TRANSACTION);
        master.downgrade(&e);
        assert_eq!(e.master_bits(), 0);
        assert!(master.check_invariants());
    }

    #[test]
    fn test_writer_keeps_transaction_hold() {
        let (envs, master) = setup();
        let e = envs.create_env(None).unwrap();
        master.transaction_lock(&e);
        master.write_lock(&e);
        assert_eq!(e.master_bits(), MASTER_TRANSACTION | MASTER_WRITE);
        master.unlock(&e);
        assert_eq!(e.master_bits(), MASTER_TRANSACTION);
        master.transaction_unlock(&e);
        assert!(master.check_invariants());
    }
}

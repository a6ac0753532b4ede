// Session environments.
//
// An environment is the per-connection state block: owner thread, user and
// database identity, transaction state, durability requests, master-lock
// hold bits, and a per-section table where modules stash connection-scoped
// state. An environment is bound to at most one thread at a time; child
// environments share the parent's lifetime and may not migrate threads, so
// the parent can always join them.

pub mod master_lock;
pub mod shutdown;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{CommandId, Oid, TransactionId, INVALID_OID};
use crate::error::{Result, StoreError};

pub use master_lock::{MasterLock, MASTER_READ, MASTER_TRANSACTION, MASTER_WRITE};
pub use shutdown::ShutdownCallbacks;

/// Commit durability modes, weakest to strictest. `Default` defers to the
/// next setting in the {system request, user request, process default}
/// chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitType {
    Default,
    /// Status written, buffers dirty; no intra-transaction friendliness.
    FastSoft,
    /// Status written, buffers left dirty.
    Soft,
    /// Buffers flushed at commit; no intra-transaction friendliness.
    FastCareful,
    /// Buffers flushed at commit.
    Careful,
    /// Fully fsynced.
    Synced,
}

impl CommitType {
    fn strictness(self) -> u8 {
        match self {
            CommitType::Default => 0,
            CommitType::FastSoft => 1,
            CommitType::Soft => 2,
            CommitType::FastCareful => 3,
            CommitType::Careful => 4,
            CommitType::Synced => 5,
        }
    }
}

/// Who is asking for a durability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitScope {
    /// Explicit user request; replaces any previous user request.
    User,
    /// Internal request; only ever ratchets the mode up.
    System,
    /// The process-wide default.
    ProcessDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessingMode {
    Init = 0,
    Bootstrap = 1,
    Normal = 2,
    Shutdown = 3,
}

/// Section identifier for per-environment module state.
pub type SectionId = u32;

struct EnvCore {
    owner: Option<ThreadId>,
    user: Option<String>,
    db: Oid,
    current_xid: Option<TransactionId>,
    current_cid: CommandId,
    user_type: CommitType,
    system_type: CommitType,
    master_bits: u8,
    sections: HashMap<SectionId, Box<dyn Any + Send>>,
    pending_error: Option<String>,
}

pub struct Environment {
    id: usize,
    parent: Option<Arc<Environment>>,
    core: Mutex<EnvCore>,
    cancelled: AtomicBool,
    in_transaction: AtomicBool,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").field("id", &self.id).finish()
    }
}

impl Environment {
    fn new(id: usize, parent: Option<Arc<Environment>>) -> Self {
        Self {
            id,
            parent,
            core: Mutex::new(EnvCore {
                owner: None,
                user: None,
                db: INVALID_OID,
                current_xid: None,
                current_cid: 0,
                user_type: CommitType::Default,
                system_type: CommitType::Default,
                master_bits: 0,
                sections: HashMap::new(),
                pending_error: None,
            }),
            cancelled: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<Environment>> {
        self.parent.as_ref()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.core.lock().owner
    }

    pub fn set_identity(&self, user: &str, db: Oid) {
        let mut core = self.core.lock();
        core.user = Some(user.to_string());
        core.db = db;
    }

    pub fn database(&self) -> Oid {
        self.core.lock().db
    }

    pub fn user(&self) -> Option<String> {
        self.core.lock().user.clone()
    }

    pub fn assign_xid(&self, xid: TransactionId) {
        let mut core = self.core.lock();
        core.current_xid = Some(xid);
        core.current_cid = 0;
    }

    pub fn clear_xid(&self) {
        self.core.lock().current_xid = None;
    }

    pub fn current_xid(&self) -> Option<TransactionId> {
        self.core.lock().current_xid
    }

    /// Bump and return the command counter within the current transaction.
    pub fn next_command_id(&self) -> CommandId {
        let mut core = self.core.lock();
        core.current_cid += 1;
        core.current_cid
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn clear_error(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.core.lock().pending_error = None;
    }

    pub fn set_pending_error(&self, message: &str) {
        self.core.lock().pending_error = Some(message.to_string());
    }

    pub fn pending_error(&self) -> Option<String> {
        self.core.lock().pending_error.clone()
    }

    pub fn set_in_transaction(&self, value: bool) {
        self.in_transaction.store(value, Ordering::SeqCst);
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    pub fn master_bits(&self) -> u8 {
        self.core.lock().master_bits
    }

    pub fn set_master_bits(&self, bits: u8) {
        self.core.lock().master_bits = bits;
    }

    /// Store a module's per-connection state under its section id.
    pub fn set_section(&self, id: SectionId, value: Box<dyn Any + Send>) {
        self.core.lock().sections.insert(id, value);
    }

    /// Run a closure against a typed section, when present and of the
    /// expected type.
    pub fn with_section<T: 'static, R>(
        &self,
        id: SectionId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut core = self.core.lock();
        core.sections
            .get_mut(&id)
            .and_then(|boxed| boxed.downcast_mut::<T>())
            .map(f)
    }
}

thread_local! {
    static CURRENT_ENV: RefCell<Option<Arc<Environment>>> = const { RefCell::new(None) };
}

/// The environment map: bounded by `max_backends`, the source of session
/// handles and the holder of process-wide session settings.
pub struct EnvManager {
    slots: Mutex<Vec<Option<Arc<Environment>>>>,
    default_commit: Mutex<CommitType>,
    mode: AtomicU8,
    multiuser: bool,
}

impl EnvManager {
    pub fn new(max_backends: usize, multiuser: bool) -> Self {
        Self {
            slots: Mutex::new(vec![None; max_backends]),
            default_commit: Mutex::new(CommitType::Soft),
            mode: AtomicU8::new(ProcessingMode::Init as u8),
            multiuser,
        }
    }

    pub fn is_multiuser(&self) -> bool {
        self.multiuser
    }

    pub fn set_processing_mode(&self, mode: ProcessingMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        match self.mode.load(Ordering::SeqCst) {
            0 => ProcessingMode::Init,
            1 => ProcessingMode::Bootstrap,
            3 => ProcessingMode::Shutdown,
            _ => ProcessingMode::Normal,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.processing_mode() == ProcessingMode::Shutdown
    }

    /// Create an environment, optionally as a child of an existing one.
    pub fn create_env(&self, parent: Option<&Arc<Environment>>) -> Result<Arc<Environment>> {
        let mut slots = self.slots.lock();
        let free = slots.iter().position(|s| s.is_none());
        match free {
            Some(id) => {
                let env = Arc::new(Environment::new(id, parent.map(Arc::clone)));
                slots[id] = Some(Arc::clone(&env));
                debug!(env = id, "environment created");
                Ok(env)
            }
            None => Err(StoreError::BackendLimit(slots.len())),
        }
    }

    /// Remove an environment from the map. The caller must have unbound it
    /// from its thread first.
    pub fn destroy_env(&self, env: &Arc<Environment>) -> Result<()> {
        if env.owner().is_some() {
            return Err(StoreError::EnvironmentBusy);
        }
        let mut slots = self.slots.lock();
        slots[env.id()] = None;
        debug!(env = env.id(), "environment destroyed");
        Ok(())
    }

    pub fn env_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Bind an environment to the calling thread, enforcing single
    /// ownership. Passing `None` unbinds the current environment; a child
    /// environment stays bound to its owner so the parent can join it.
    pub fn set_env(&self, env: Option<&Arc<Environment>>) -> Result<()> {
        match env {
            Some(env) => {
                let me = std::thread::current().id();
                {
                    let mut core = env.core.lock();
                    match core.owner {
                        Some(owner) if owner != me => {
                            return Err(StoreError::EnvironmentBusy);
                        }
                        _ => core.owner = Some(me),
                    }
                }
                CURRENT_ENV.with(|current| {
                    *current.borrow_mut() = Some(Arc::clone(env));
                });
                Ok(())
            }
            None => {
                let current = Self::current_env();
                if let Some(env) = current {
                    if env.parent.is_none() {
                        env.core.lock().owner = None;
                    }
                }
                CURRENT_ENV.with(|current| {
                    *current.borrow_mut() = None;
                });
                Ok(())
            }
        }
    }

    /// The environment bound to the calling thread, if any.
    pub fn current_env() -> Option<Arc<Environment>> {
        CURRENT_ENV.with(|current| current.borrow().clone())
    }

    /// Flag a busy environment cancelled and report its owner thread so
    /// the caller can join it.
    pub fn cancel_env(&self, env: &Arc<Environment>) -> Option<ThreadId> {
        if env.in_transaction() {
            env.cancel();
        }
        env.owner()
    }

    /// True when the caller should abandon its work: the process is
    /// shutting down, the environment was cancelled, or (for a child) the
    /// parent is cancelled or no longer in a transaction.
    pub fn check_for_cancel(&self, env: &Environment) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        if env.is_cancelled() {
            return true;
        }
        if let Some(parent) = env.parent() {
            return parent.is_cancelled() || !parent.in_transaction();
        }
        false
    }

    // ------------------------------------------------------------------
    // Commit durability
    // ------------------------------------------------------------------

    pub fn set_commit_type(&self, env: &Environment, scope: CommitScope, value: CommitType) {
        match scope {
            CommitScope::User => {
                env.core.lock().user_type = value;
            }
            CommitScope::System => {
                let mut core = env.core.lock();
                if value.strictness() > core.system_type.strictness() {
                    core.system_type = value;
                }
            }
            CommitScope::ProcessDefault => {
                if value != CommitType::Default {
                    *self.default_commit.lock() = value;
                }
            }
        }
    }

    pub fn reset_system_commit_type(&self, env: &Environment) {
        env.core.lock().system_type = CommitType::Default;
    }

    /// The effective durability mode: the strictest of the system request,
    /// the user request, and the process default.
    pub fn commit_type(&self, env: &Environment) -> CommitType {
        let (system, user) = {
            let core = env.core.lock();
            (core.system_type, core.user_type)
        };
        let default = *self.default_commit.lock();
        [system, user, default]
            .into_iter()
            .max_by_key(|t| t.strictness())
            .unwrap_or(default)
    }

    /// Whether commit must force dirty buffers out. Single-user mode is
    /// always careful.
    pub fn is_transaction_careful(&self, env: &Environment) -> bool {
        if !self.multiuser {
            return true;
        }
        matches!(
            self.commit_type(env),
            CommitType::Careful | CommitType::FastCareful | CommitType::Synced
        )
    }

    /// Whether commits go through the status log rather than a full sync.
    pub fn is_loggable(&self, env: &Environment) -> bool {
        if !self.multiuser {
            return false;
        }
        self.commit_type(env) != CommitType::Synced
    }

    /// Whether intra-transaction friendliness (yielding to concurrent
    /// readers) is preserved.
    pub fn is_transaction_friendly(&self, env: &Environment) -> bool {
        if !self.multiuser {
            return false;
        }
        !matches!(
            self.commit_type(env),
            CommitType::FastSoft | CommitType::FastCareful
        )
    }
}

// The engine root: one value owning every piece of global state, with
// explicit construction and teardown. Components reach each other only
// through the handles wired up here.

use std::sync::Arc;

use tracing::info;

use crate::buffer::BufferPool;
use crate::catalog::{RelationCache, RelationRef};
use crate::common::{Oid, RelKind, TransactionId};
use crate::error::{Result, StoreError};
use crate::heap::{FreeSpaceDirectory, Heap, LogVisibility};
use crate::lock::LockManager;
use crate::session::{
    CommitScope, CommitType, EnvManager, Environment, MasterLock, ProcessingMode,
    ShutdownCallbacks,
};
use crate::storage::FileStorage;
use crate::txlog::{TransactionLog, XidStatus};
use crate::EngineConfig;

/// Database oid that owns the engine's own relations.
pub const SYSTEM_DB: Oid = 1;
/// Relation oid of the transaction status log.
pub const LOG_RELATION: Oid = 2;
/// Relation oid of the transaction control page.
pub const CONTROL_RELATION: Oid = 3;

pub struct System {
    config: EngineConfig,
    smgr: Arc<FileStorage>,
    pool: Arc<BufferPool>,
    catalog: RelationCache,
    freespace: Arc<FreeSpaceDirectory>,
    txlog: Arc<TransactionLog>,
    locks: Arc<LockManager>,
    heap: Heap,
    envs: EnvManager,
    master: MasterLock,
    shutdown_callbacks: ShutdownCallbacks,
}

impl System {
    /// Bring the engine up: storage manager, buffer pool, status log, lock
    /// tables, and the session layer, in dependency order.
    pub fn init(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let smgr = Arc::new(FileStorage::new(&config.data_dir, config.page_size)?);
        let pool = BufferPool::new(Arc::clone(&smgr), &config);
        let catalog = RelationCache::new();

        let log_rel = catalog.define(LOG_RELATION, SYSTEM_DB, "xid_status", RelKind::System, false);
        let control_rel = catalog.define(
            CONTROL_RELATION,
            SYSTEM_DB,
            "xid_control",
            RelKind::System,
            false,
        );
        let txlog = Arc::new(TransactionLog::open(
            log_rel,
            control_rel,
            Arc::clone(&pool),
            Arc::clone(&smgr),
            config.multiuser,
        )?);

        let locks = Arc::new(LockManager::new(
            config.lock_partitions,
            std::time::Duration::from_millis(config.deadlock_interval_ms),
        ));
        let freespace = Arc::new(FreeSpaceDirectory::new());
        let heap = Heap::new(
            Arc::clone(&pool),
            Arc::clone(&freespace),
            Arc::clone(&locks),
            Arc::new(LogVisibility::new(Arc::clone(&txlog))),
            config.page_size,
        );

        let envs = EnvManager::new(config.max_backends, config.multiuser);
        envs.set_processing_mode(ProcessingMode::Normal);

        let shutdown_callbacks = ShutdownCallbacks::new();
        {
            let pool = Arc::clone(&pool);
            shutdown_callbacks.register("flush buffer pool", move || {
                let _ = pool.flush_dirty(true);
            });
        }

        info!(
            buffers = config.buffers,
            partitions = config.lock_partitions,
            "storage engine initialized"
        );
        Ok(Arc::new(Self {
            config,
            smgr,
            pool,
            catalog,
            freespace,
            txlog,
            locks,
            heap,
            envs,
            master: MasterLock::new(),
            shutdown_callbacks,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn smgr(&self) -> &Arc<FileStorage> {
        &self.smgr
    }

    pub fn catalog(&self) -> &RelationCache {
        &self.catalog
    }

    pub fn freespace(&self) -> &Arc<FreeSpaceDirectory> {
        &self.freespace
    }

    pub fn txlog(&self) -> &Arc<TransactionLog> {
        &self.txlog
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn envs(&self) -> &EnvManager {
        &self.envs
    }

    pub fn master(&self) -> &MasterLock {
        &self.master
    }

    pub fn shutdown_callbacks(&self) -> &ShutdownCallbacks {
        &self.shutdown_callbacks
    }

    /// Register a user relation in the catalog.
    pub fn define_relation(
        &self,
        oid: Oid,
        db: Oid,
        name: &str,
        kind: RelKind,
        has_blob_attr: bool,
    ) -> RelationRef {
        self.catalog.define(oid, db, name, kind, has_blob_attr)
    }

    /// Invalidate everything cached for a database before it is dropped.
    /// The caller holds the master write lock.
    pub fn drop_database(&self, db: Oid) {
        self.pool.drop_buffers(db);
        self.catalog.forget_db(db);
    }

    // ------------------------------------------------------------------
    // Session plumbing
    // ------------------------------------------------------------------

    pub fn create_env(&self, parent: Option<&Arc<Environment>>) -> Result<Arc<Environment>> {
        self.envs.create_env(parent)
    }

    pub fn destroy_env(&self, env: &Arc<Environment>) -> Result<()> {
        self.envs.destroy_env(env)
    }

    pub fn set_env(&self, env: Option<&Arc<Environment>>) -> Result<()> {
        self.envs.set_env(env)
    }

    pub fn check_for_cancel(&self, env: &Environment) -> bool {
        self.envs.check_for_cancel(env)
    }

    pub fn set_commit_type(&self, env: &Environment, scope: CommitScope, value: CommitType) {
        self.envs.set_commit_type(env, scope, value)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Start a transaction: take the master transaction hold, allocate an
    /// id, and insert the transaction's own id lock.
    pub fn begin_transaction(&self, env: &Environment) -> Result<TransactionId> {
        if self.envs.is_shutting_down() {
            return Err(StoreError::ShutdownInProgress);
        }
        self.master.transaction_lock(env);
        let xid = self.txlog.allocate_xid()?;
        env.assign_xid(xid);
        self.locks.xact_lock_insert(xid)?;
        Ok(xid)
    }

    /// Commit: record the status at the durability the session asked for,
    /// then release locks and the master hold.
    pub fn commit_transaction(&self, env: &Environment) -> Result<()> {
        let xid = env
            .current_xid()
            .ok_or_else(|| StoreError::Internal("commit outside a transaction".into()))?;

        if self.envs.is_transaction_careful(env) {
            self.txlog.set_status(xid, XidStatus::SoftCommit)?;
            let synced = !self.envs.is_loggable(env);
            self.pool.flush_dirty(synced)?;
            self.txlog.set_status(xid, XidStatus::Committed)?;
            if synced {
                self.txlog.flush()?;
            }
        } else {
            self.txlog.set_status(xid, XidStatus::SoftCommit)?;
        }

        self.finish_transaction(env, xid)
    }

    /// Abort: record the status and release everything.
    pub fn abort_transaction(&self, env: &Environment) -> Result<()> {
        let xid = env
            .current_xid()
            .ok_or_else(|| StoreError::Internal("abort outside a transaction".into()))?;
        self.txlog.set_status(xid, XidStatus::Aborted)?;
        self.finish_transaction(env, xid)
    }

    fn finish_transaction(&self, env: &Environment, xid: TransactionId) -> Result<()> {
        env.clear_xid();
        self.locks
            .release_all(std::thread::current().id(), Some(xid))?;
        self.master.transaction_unlock(env);
        self.envs.reset_system_commit_type(env);
        Ok(())
    }

    /// Tear the engine down: flip into shutdown mode, then run the
    /// registered callbacks in reverse registration order.
    pub fn shutdown(&self) {
        self.envs.set_processing_mode(ProcessingMode::Shutdown);
        self.shutdown_callbacks.run_all();
        info!("storage engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn system_fixture() -> (tempfile::TempDir, Arc<System>) {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            buffers: 16,
            max_buffers: 64,
            ..EngineConfig::default()
        };
        (dir, System::init(config).unwrap())
    }

    #[test]
    fn test_transaction_life_cycle() {
        let (_dir, system) = system_fixture();
        let env = system.create_env(None).unwrap();

        let xid = system.begin_transaction(&env).unwrap();
        assert!(system.txlog().is_in_progress(xid).unwrap());
        assert!(env.in_transaction());

        system.commit_transaction(&env).unwrap();
        assert!(system.txlog().did_commit(xid).unwrap());
        assert!(!env.in_transaction());
        assert!(env.current_xid().is_none());
    }

    #[test]
    fn test_abort_records_aborted() {
        let (_dir, system) = system_fixture();
        let env = system.create_env(None).unwrap();
        let xid = system.begin_transaction(&env).unwrap();
        system.abort_transaction(&env).unwrap();
        assert!(system.txlog().did_abort(xid).unwrap());
    }

    #[test]
    fn test_careful_commit_hardens_status() {
        let (_dir, system) = system_fixture();
        let env = system.create_env(None).unwrap();
        system.set_commit_type(&env, CommitScope::User, CommitType::Careful);
        let xid = system.begin_transaction(&env).unwrap();
        system.commit_transaction(&env).unwrap();
        assert_eq!(
            system.txlog().status_of(xid).unwrap(),
            XidStatus::Committed
        );
    }

    #[test]
    fn test_soft_commit_stays_soft() {
        let (_dir, system) = system_fixture();
        let env = system.create_env(None).unwrap();
        let xid = system.begin_transaction(&env).unwrap();
        system.commit_transaction(&env).unwrap();
        assert_eq!(
            system.txlog().status_of(xid).unwrap(),
            XidStatus::SoftCommit
        );
    }

    #[test]
    fn test_begin_after_shutdown_refused() {
        let (_dir, system) = system_fixture();
        let env = system.create_env(None).unwrap();
        system.shutdown();
        let err = system.begin_transaction(&env).unwrap_err();
        assert!(matches!(err, StoreError::ShutdownInProgress));
    }
}

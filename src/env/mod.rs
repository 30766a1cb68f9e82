//! Environment Module
//!
//! The environment owns everything databases share: the buffer pool, the
//! log, the lock table, the transaction table and the catalog of open
//! database files.
//!
//! ## Concurrency Model
//!
//! Locks are always taken in this order:
//! ```text
//!   transaction lock ─► gate (read) ─► tree latch ─► buffer pool ─► log
//! ```
//! - **gate**: every page mutation holds it for reading; a checkpoint takes
//!   it for writing, which quiesces mutation but not transaction starts
//! - Transaction locks are never waited on while a latch or the gate is held
//!
//! Exactly one environment may be open per home directory in a process.

mod checkpoint;
mod recovery;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::btree::{BTree, KeyOrder};
use crate::config::{DbConfig, EnvConfig, TxnConfig};
use crate::db::{Database, DbShared};
use crate::error::{EmberError, Result};
use crate::lock::{LockManager, LockStats};
use crate::storage::{BufferPool, DbId, MetaPage, PageFile, PoolStats, META_PAGE};
use crate::txn::{Transaction, TxnInner, TxnManager, NO_TXN};
use crate::wal::{LogManager, LogRecord, Lsn, WalRecovery};
use crate::worker::{Completion, WorkerPool};

pub(crate) use checkpoint::CheckpointState;
pub use recovery::RecoveryStats;

/// Canonical homes of every environment open in this process
static OPEN_HOMES: Mutex<BTreeSet<PathBuf>> = parking_lot::const_mutex(BTreeSet::new());

// =============================================================================
// Catalog
// =============================================================================

/// Databases attached to the environment, by id
pub(crate) struct Catalog {
    databases: BTreeMap<DbId, Arc<DbShared>>,
    next_id: DbId,
}

impl Catalog {
    fn new() -> Self {
        Self {
            databases: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn find(&self, name: &str) -> Option<Arc<DbShared>> {
        self.databases.values().find(|db| db.name() == name).cloned()
    }

    /// Keep future ids above one found in the log
    fn reserve(&mut self, id: DbId) {
        self.next_id = self.next_id.max(id + 1);
    }

    fn allocate(&mut self) -> DbId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn databases(&self) -> impl Iterator<Item = &Arc<DbShared>> {
        self.databases.values()
    }
}

// =============================================================================
// Shared environment state
// =============================================================================

pub(crate) struct EnvShared {
    config: EnvConfig,
    home: PathBuf,
    pool: BufferPool,
    wal: Option<Arc<LogManager>>,
    locks: Option<LockManager>,
    txns: TxnManager,
    catalog: Mutex<Catalog>,
    gate: RwLock<()>,
    checkpoint: Mutex<CheckpointState>,
    recovery: Mutex<Option<RecoveryStats>>,
    needs_recovery: AtomicBool,
    closed: AtomicBool,
    killed: AtomicBool,
    /// This instance still owns its entry in `OPEN_HOMES`
    registered: AtomicBool,
    workers: WorkerPool,
}

impl EnvShared {
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn wal(&self) -> Option<&Arc<LogManager>> {
        self.wal.as_ref()
    }

    pub fn locks(&self) -> Option<&LockManager> {
        self.locks.as_ref()
    }

    pub fn txns(&self) -> &TxnManager {
        &self.txns
    }

    pub fn gate(&self) -> &RwLock<()> {
        &self.gate
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Fail if the environment was closed, killed or needs recovery
    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.killed.load(Ordering::Acquire) {
            return Err(EmberError::InvalidArgument(format!(
                "environment {} is closed",
                self.home.display()
            )));
        }
        if self.needs_recovery.load(Ordering::Acquire) {
            return Err(EmberError::RunRecovery(format!(
                "environment {} must be reopened",
                self.home.display()
            )));
        }
        Ok(())
    }

    pub fn set_needs_recovery(&self, reason: &str) {
        tracing::error!("environment {} needs recovery: {}", self.home.display(), reason);
        self.needs_recovery.store(true, Ordering::Release);
    }

    pub fn database(&self, id: DbId) -> Option<Arc<DbShared>> {
        self.catalog.lock().databases.get(&id).cloned()
    }

    /// Register a new transaction with the transaction and lock tables
    pub fn begin_inner(&self, parent: Option<Arc<TxnInner>>, config: TxnConfig) -> Result<Arc<TxnInner>> {
        self.check_open()?;
        if !self.config.transactions {
            return Err(EmberError::InvalidArgument(
                "transactions are disabled in this environment".to_string(),
            ));
        }

        let parent_id = parent.as_ref().map(|p| p.id);
        let inner = self.txns.begin(parent, config, self.config.isolation)?;
        if let Some(locks) = &self.locks {
            if let Err(e) = locks.register(inner.id, parent_id) {
                crate::txn::abort_inner(self, &inner)?;
                return Err(e);
            }
        }
        tracing::trace!("transaction {} begun (parent {:?})", inner.id, parent_id);
        Ok(inner)
    }

    /// Build the shared state of one database file and add it to the catalog
    fn attach(
        &self,
        catalog: &mut Catalog,
        id: DbId,
        name: String,
        file: Arc<PageFile>,
        meta: &MetaPage,
    ) -> Result<Arc<DbShared>> {
        let comparator = match &meta.comparator {
            Some(cmp) => Some(self.config.comparators.get(cmp).ok_or_else(|| {
                EmberError::Config(format!("database {} needs unregistered comparator {}", name, cmp))
            })?),
            None => None,
        };
        let order = KeyOrder::new(meta.access_method, meta.duplicates, comparator);
        let tree = BTree::new(id, self.config.page_size, order);

        self.pool.register_file(id, file.clone());
        if let Some(wal) = &self.wal {
            // The file may have been written under a log that was since removed
            wal.advance_to(self.pool.read(id, META_PAGE)?.lsn);
        }
        let db = Arc::new(DbShared::new(
            id,
            name,
            tree,
            file,
            meta.access_method,
            meta.duplicates,
            meta.comparator.clone(),
        ));
        catalog.reserve(id);
        catalog.databases.insert(id, db.clone());
        Ok(db)
    }

    /// Open or create a database file that is not attached yet
    fn load(&self, catalog: &mut Catalog, config: &DbConfig) -> Result<Arc<DbShared>> {
        let path = self.home.join(&config.file);
        let exists = path.exists();
        if exists && config.exclusive {
            return Err(EmberError::InvalidArgument(format!(
                "database {} already exists",
                config.file
            )));
        }
        if !exists && !config.create {
            return Err(EmberError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database {} does not exist", config.file),
            )));
        }

        let mode = Some(config.file_mode.unwrap_or(self.config.file_mode));
        let file = Arc::new(PageFile::open(&path, self.config.page_size, !exists, mode)?);
        let meta = if exists {
            let meta = BTree::read_meta(&file)?;
            if meta.page_size as usize != self.config.page_size {
                return Err(EmberError::InvalidArgument(format!(
                    "database {} uses {} byte pages, environment uses {}",
                    config.file, meta.page_size, self.config.page_size
                )));
            }
            meta
        } else {
            let meta = MetaPage::new(
                self.config.page_size,
                config.access_method,
                config.duplicates,
                config.comparator.clone(),
            );
            BTree::create_file(&file, meta.clone())?;
            tracing::info!("created database {} ({:?}, {:?})", config.file, config.access_method, config.duplicates);
            meta
        };

        let id = catalog.allocate();
        if let Some(wal) = &self.wal {
            let lsn = wal.append(
                NO_TXN,
                LogRecord::OpenDatabase {
                    db: id,
                    file: config.file.clone(),
                    access_method: meta.access_method,
                    duplicates: meta.duplicates,
                    comparator: meta.comparator.clone(),
                },
            )?;
            wal.flush(lsn)?;
        }
        self.attach(catalog, id, config.file.clone(), file, &meta)
    }

    /// Abort leftovers, take the final checkpoint and release the home
    fn shutdown(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.killed.load(Ordering::Acquire) {
            return Ok(());
        }

        // Children first, so parents find no unfinished children
        for inner in self.txns.active().into_iter().rev() {
            tracing::warn!("aborting transaction {} left open at close", inner.id);
            if let Err(e) = crate::txn::abort_inner(self, &inner) {
                tracing::warn!("abort of transaction {} failed: {}", inner.id, e);
            }
        }

        let result = if self.needs_recovery.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.checkpoint().map(|_| ())
        };

        self.closed.store(true, Ordering::Release);
        self.workers.shutdown();
        self.release_home();
        tracing::info!("environment {} closed", self.home.display());
        result
    }

    fn release_home(&self) {
        if self.registered.swap(false, Ordering::AcqRel) {
            OPEN_HOMES.lock().remove(&self.home);
        }
    }
}

impl Drop for EnvShared {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("closing environment {} on drop failed: {}", self.home.display(), e);
        }
        self.release_home();
    }
}

// =============================================================================
// Public handle
// =============================================================================

/// Snapshot of environment statistics
#[derive(Debug, Clone)]
pub struct EnvStat {
    pub pool: PoolStats,
    pub locks: Option<LockStats>,
    pub active_transactions: usize,
    pub last_lsn: Lsn,
    pub durable_lsn: Lsn,
    pub checkpoints: u64,
    pub last_checkpoint_lsn: Lsn,
    pub databases: Vec<(DbId, String)>,
}

/// An open environment
///
/// Handles are cheap to clone. The environment closes (with a final
/// checkpoint) on [`Environment::close`] or when the last handle, database
/// or transaction referring to it is dropped.
#[derive(Clone)]
pub struct Environment {
    shared: Arc<EnvShared>,
}

impl Environment {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const WAL_FILENAME: &'static str = "wal.log";

    /// Open or create an environment
    ///
    /// On startup:
    /// 1. Validate the configuration
    /// 2. Create and claim the home directory
    /// 3. Repair a torn log tail and open the log
    /// 4. Attach every database the log names, then redo and undo
    /// 5. Checkpoint so the next open starts from a clean log
    pub fn open(config: EnvConfig) -> Result<Self> {
        // Step 1: Reject bad settings before touching the disk
        config.validate()?;

        // Step 2: Home directory, claimed for this process
        if !config.home.exists() {
            if !config.create {
                return Err(EmberError::Config(format!(
                    "home {} does not exist",
                    config.home.display()
                )));
            }
            fs::create_dir_all(&config.home)?;
        }
        let home = fs::canonicalize(&config.home)?;
        if !OPEN_HOMES.lock().insert(home.clone()) {
            return Err(EmberError::InvalidArgument(format!(
                "environment {} is already open in this process",
                home.display()
            )));
        }

        match Self::open_claimed(config, home.clone()) {
            Ok(env) => Ok(env),
            Err(e) => {
                OPEN_HOMES.lock().remove(&home);
                Err(e)
            }
        }
    }

    /// Open with default settings in `path`
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(EnvConfig::builder().home(path).build())
    }

    fn open_claimed(config: EnvConfig, home: PathBuf) -> Result<Self> {
        // Step 3: Log file (torn tails are cut before anything reads it)
        let wal = if config.logging {
            let wal_path = home.join(Self::WAL_FILENAME);
            if wal_path.exists() {
                let (_, result) = WalRecovery::recover(&wal_path)?;
                if result.entries_recovered > 0 || result.entries_corrupted > 0 {
                    tracing::info!(
                        "WAL scan: {} entries, {} corrupted, last_lsn={}",
                        result.entries_recovered,
                        result.entries_corrupted,
                        result.last_lsn
                    );
                }
            }
            Some(Arc::new(LogManager::open(
                &wal_path,
                config.wal_sync_strategy,
                Some(config.file_mode),
            )?))
        } else {
            None
        };

        let locks = config.locking.then(|| {
            LockManager::new(
                config.max_lockers,
                config.max_lock_objects,
                config.lock_timeout,
                config.deadlock_policy.clone(),
            )
        });
        let pool = BufferPool::new(config.page_size, config.cache_pages(), wal.clone());
        let workers = WorkerPool::new(config.worker_threads)?;
        let txns = TxnManager::new(config.max_transactions);
        let recover = config.recovery;

        let shared = Arc::new(EnvShared {
            config,
            home,
            pool,
            wal,
            locks,
            txns,
            catalog: Mutex::new(Catalog::new()),
            gate: RwLock::new(()),
            checkpoint: Mutex::new(CheckpointState::new()),
            recovery: Mutex::new(None),
            needs_recovery: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            registered: AtomicBool::new(true),
            workers,
        });

        // Step 4: Catalog, redo, undo
        let entries = match shared.wal() {
            Some(wal) => wal.iterate(0)?,
            None => Vec::new(),
        };
        let stats = recovery::run(&shared, entries, recover)?;

        // Step 5: Start from a clean log
        if recover {
            shared.checkpoint()?;
        }
        *shared.recovery.lock() = Some(stats);

        tracing::info!(
            "environment {} open ({} byte pages, {} cache pages)",
            shared.home.display(),
            shared.config.page_size,
            shared.config.cache_pages()
        );
        Ok(Self { shared })
    }

    pub fn home(&self) -> &Path {
        self.shared.home()
    }

    pub fn config(&self) -> &EnvConfig {
        self.shared.config()
    }

    /// What recovery found and did when this environment opened
    pub fn recovery_stats(&self) -> Option<RecoveryStats> {
        self.shared.recovery.lock().clone()
    }

    // =========================================================================
    // Databases
    // =========================================================================

    /// Open (or create) a database file in the home directory
    pub fn open_database(&self, config: DbConfig) -> Result<Database> {
        let shared = &self.shared;
        shared.check_open()?;
        config.validate()?;
        if let Some(name) = &config.comparator {
            if shared.config.comparators.get(name).is_none() {
                return Err(EmberError::Config(format!("comparator {} is not registered", name)));
            }
        }

        let db = {
            let mut catalog = shared.catalog.lock();
            match catalog.find(&config.file) {
                Some(existing) if config.exclusive => {
                    return Err(EmberError::InvalidArgument(format!(
                        "database {} already exists",
                        existing.name()
                    )))
                }
                Some(existing) => existing,
                None => shared.load(&mut catalog, &config)?,
            }
        };

        if db.access_method() != config.access_method
            || db.duplicates() != config.duplicates
            || db.comparator() != config.comparator.as_deref()
        {
            return Err(EmberError::InvalidArgument(format!(
                "database {} was created as {:?}/{:?}/{:?}, opened as {:?}/{:?}/{:?}",
                config.file,
                db.access_method(),
                db.duplicates(),
                db.comparator(),
                config.access_method,
                config.duplicates,
                config.comparator
            )));
        }
        db.bind_granularity(config.lock_granularity)?;

        tracing::debug!("database {} open as id {}", db.name(), db.id());
        Ok(Database::new(db, shared.clone(), config.auto_commit, config.read_only))
    }

    /// Open an existing database in whatever shape it was created with
    pub fn open_existing(&self, file: &str) -> Result<Database> {
        let shared = &self.shared;
        shared.check_open()?;
        let attached = shared.catalog.lock().find(file);
        let (access_method, duplicates, comparator) = match attached {
            Some(db) => (db.access_method(), db.duplicates(), db.comparator().map(str::to_string)),
            None => {
                let path = shared.home.join(file);
                if !path.exists() {
                    return Err(EmberError::NotFound);
                }
                let meta = BTree::read_meta(&PageFile::open(&path, shared.config.page_size, false, None)?)?;
                (meta.access_method, meta.duplicates, meta.comparator)
            }
        };

        let mut config = DbConfig::builder(file)
            .access_method(access_method)
            .duplicates(duplicates)
            .create(false)
            .build();
        config.comparator = comparator;
        self.open_database(config)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin(&self, config: TxnConfig) -> Result<Transaction> {
        let inner = self.shared.begin_inner(None, config)?;
        Ok(Transaction::new(inner, self.shared.clone()))
    }

    /// Begin a transaction nested in `parent`
    pub fn begin_child(&self, parent: &Transaction, config: TxnConfig) -> Result<Transaction> {
        if !Arc::ptr_eq(&parent.env, &self.shared) {
            return Err(EmberError::InvalidArgument(
                "parent transaction belongs to another environment".to_string(),
            ));
        }
        parent.begin_child(config)
    }

    /// Run `f` in a transaction, committing on success
    ///
    /// A deadlock aborts and re-runs `f` up to `deadlock_retries` times.
    pub fn run_in_txn<T>(&self, config: TxnConfig, f: impl Fn(&Transaction) -> Result<T>) -> Result<T> {
        let retries = self.shared.config.deadlock_retries;
        let mut attempt = 0;
        loop {
            let txn = self.begin(config)?;
            match f(&txn) {
                Ok(value) => {
                    txn.commit()?;
                    return Ok(value);
                }
                Err(e) => {
                    txn.abort()?;
                    if matches!(e, EmberError::Deadlock(_)) && attempt < retries {
                        attempt += 1;
                        tracing::debug!("transaction retry {}/{} after deadlock", attempt, retries);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Force a checkpoint
    pub fn checkpoint(&self) -> Result<()> {
        self.shared.checkpoint().map(|_| ())
    }

    /// Checkpoint if `kbytes` of log were written or `minutes` passed since
    /// the last one; both zero forces it. Returns whether one was taken.
    pub fn checkpoint_if(&self, kbytes: u64, minutes: u64) -> Result<bool> {
        self.shared.checkpoint_if(kbytes, minutes)
    }

    pub fn stat(&self) -> Result<EnvStat> {
        let shared = &self.shared;
        shared.check_open()?;
        let databases = shared
            .catalog
            .lock()
            .databases()
            .map(|db| (db.id(), db.name().to_string()))
            .collect();
        let (checkpoints, last_checkpoint_lsn) = {
            let state = shared.checkpoint.lock();
            (state.count(), state.last_lsn())
        };
        Ok(EnvStat {
            pool: shared.pool.stats(),
            locks: shared.locks.as_ref().map(LockManager::stats),
            active_transactions: shared.txns.count(),
            last_lsn: shared.wal.as_ref().map_or(0, |w| w.last_lsn()),
            durable_lsn: shared.wal.as_ref().map_or(0, |w| w.durable_lsn()),
            checkpoints,
            last_checkpoint_lsn,
            databases,
        })
    }

    /// Abort open transactions, checkpoint and release the home
    pub fn close(&self) -> Result<()> {
        self.shared.shutdown()
    }

    /// Tear down without syncing, as if the process crashed
    ///
    /// Log records already handed to the OS survive; dirty cache pages do
    /// not. The next open runs recovery.
    pub fn kill(&self) {
        let shared = &self.shared;
        if shared.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(wal) = &shared.wal {
            if let Err(e) = wal.flush_buffer() {
                tracing::warn!("environment {}: final log flush on kill failed: {}", shared.home.display(), e);
            }
        }
        shared.release_home();
        tracing::warn!("environment {} killed", shared.home.display());
    }

    // =========================================================================
    // Non-blocking variants
    // =========================================================================

    pub fn begin_async(&self, config: TxnConfig) -> Completion<Transaction> {
        let env = self.clone();
        self.shared.workers.submit(move || env.begin(config))
    }

    pub fn commit_async(&self, txn: Transaction) -> Completion<()> {
        self.shared.workers.submit(move || txn.commit())
    }

    pub fn abort_async(&self, txn: Transaction) -> Completion<()> {
        self.shared.workers.submit(move || txn.abort())
    }

    pub fn checkpoint_async(&self) -> Completion<()> {
        let env = self.clone();
        self.shared.workers.submit(move || env.checkpoint())
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("home", &self.shared.home)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}

//! Configuration for EmberDB
//!
//! Environment, database and transaction settings with sensible defaults.
//! Every flag the engine understands is a named field here; `validate()`
//! rejects inconsistent combinations before anything touches the disk.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EmberError, Result};
use crate::lock::{DeadlockPolicy, DetectPolicy};

/// User-supplied key ordering
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

// =============================================================================
// Environment Configuration
// =============================================================================

/// Main configuration for an EmberDB environment
#[derive(Debug, Clone)]
pub struct EnvConfig {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Home directory for all files of this environment
    /// Internal structure:
    ///   {home}/
    ///     ├── wal.log          (write-ahead log)
    ///     └── *.db             (one page file per database)
    pub home: PathBuf,

    /// Create the home directory if it does not exist
    pub create: bool,

    /// Unix permission bits for files the environment creates
    pub file_mode: u32,

    /// Page size in bytes (power of two, 512..=65536)
    pub page_size: usize,

    /// Buffer cache size in bytes
    pub cache_size: usize,

    // -------------------------------------------------------------------------
    // Subsystems
    // -------------------------------------------------------------------------
    /// Enable the lock manager
    pub locking: bool,

    /// Enable the write-ahead log
    pub logging: bool,

    /// Enable transactions (requires locking and logging)
    pub transactions: bool,

    /// Run crash recovery on open
    pub recovery: bool,

    // -------------------------------------------------------------------------
    // Locking Configuration
    // -------------------------------------------------------------------------
    /// Maximum number of concurrent lockers (transactions + auto-commit ops)
    pub max_lockers: usize,

    /// Maximum number of distinct locked resources
    pub max_lock_objects: usize,

    /// Maximum time a lock request may wait (None = wait forever)
    pub lock_timeout: Option<Duration>,

    /// Victim selection when a wait-for cycle is found
    pub deadlock_policy: Arc<dyn DeadlockPolicy>,

    /// Internal retries of a single auto-commit operation chosen as victim
    pub deadlock_retries: u32,

    /// Default isolation for transactions
    pub isolation: Isolation,

    // -------------------------------------------------------------------------
    // Transaction / WAL Configuration
    // -------------------------------------------------------------------------
    /// Maximum number of concurrently active transactions
    pub max_transactions: usize,

    /// Sync strategy: how often to fsync the WAL
    pub wal_sync_strategy: WalSyncStrategy,

    /// Checkpoint once this many kilobytes were logged (0 = disabled)
    pub checkpoint_kbytes: u64,

    /// Checkpoint once this much time elapsed (None = disabled)
    pub checkpoint_interval: Option<Duration>,

    // -------------------------------------------------------------------------
    // Misc
    // -------------------------------------------------------------------------
    /// Threads serving the non-blocking operation variants
    pub worker_threads: usize,

    /// Named comparators databases may select
    pub comparators: ComparatorRegistry,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync on every commit (safest, slowest)
    EveryCommit,

    /// fsync after N appended entries; commits only reach the OS buffer
    EveryNEntries { count: usize },
}

/// Isolation level for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Read locks are released when the operation returns
    #[default]
    ReadCommitted,

    /// Read locks are held until the transaction ends
    Serializable,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("./emberdb_data"),
            create: true,
            file_mode: 0o660,
            page_size: 4096,
            cache_size: 8 * 1024 * 1024, // 8 MB
            locking: true,
            logging: true,
            transactions: true,
            recovery: true,
            max_lockers: 1000,
            max_lock_objects: 100_000,
            lock_timeout: None,
            deadlock_policy: Arc::new(DetectPolicy::Default),
            deadlock_retries: 3,
            isolation: Isolation::ReadCommitted,
            max_transactions: 1000,
            wal_sync_strategy: WalSyncStrategy::EveryCommit,
            checkpoint_kbytes: 0,
            checkpoint_interval: None,
            worker_threads: 4,
            comparators: ComparatorRegistry::default(),
        }
    }
}

impl EnvConfig {
    /// Create a new config builder
    pub fn builder() -> EnvConfigBuilder {
        EnvConfigBuilder::default()
    }

    /// Number of page frames the buffer cache holds
    pub fn cache_pages(&self) -> usize {
        self.cache_size / self.page_size.max(1)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(512..=65536).contains(&self.page_size) {
            return Err(EmberError::Config(format!(
                "page_size must be a power of two in 512..=65536, got {}",
                self.page_size
            )));
        }
        if self.cache_pages() < 16 {
            return Err(EmberError::Config(format!(
                "cache_size {} holds fewer than 16 pages",
                self.cache_size
            )));
        }
        if self.transactions && !(self.logging && self.locking) {
            return Err(EmberError::Config(
                "transactions require both logging and locking".to_string(),
            ));
        }
        if self.recovery && !self.logging {
            return Err(EmberError::Config("recovery requires logging".to_string()));
        }
        if self.max_lockers == 0 || self.max_lock_objects == 0 || self.max_transactions == 0 {
            return Err(EmberError::Config(
                "max_lockers, max_lock_objects and max_transactions must be non-zero".to_string(),
            ));
        }
        if let WalSyncStrategy::EveryNEntries { count: 0 } = self.wal_sync_strategy {
            return Err(EmberError::Config("EveryNEntries count must be non-zero".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(EmberError::Config("worker_threads must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Builder for EnvConfig
#[derive(Default)]
pub struct EnvConfigBuilder {
    config: EnvConfig,
}

impl EnvConfigBuilder {
    /// Set the home directory (root for all storage)
    pub fn home(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.home = path.into();
        self
    }

    /// Create the home directory if missing
    pub fn create(mut self, create: bool) -> Self {
        self.config.create = create;
        self
    }

    /// Set the permission bits for created files
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.config.file_mode = mode;
        self
    }

    /// Set the page size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the buffer cache size (in bytes)
    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache_size = size;
        self
    }

    /// Enable or disable the lock manager
    pub fn locking(mut self, enabled: bool) -> Self {
        self.config.locking = enabled;
        self
    }

    /// Enable or disable the write-ahead log
    pub fn logging(mut self, enabled: bool) -> Self {
        self.config.logging = enabled;
        self
    }

    /// Enable or disable transactions
    pub fn transactions(mut self, enabled: bool) -> Self {
        self.config.transactions = enabled;
        self
    }

    /// Enable or disable recovery on open
    pub fn recovery(mut self, enabled: bool) -> Self {
        self.config.recovery = enabled;
        self
    }

    /// Set the maximum number of lockers
    pub fn max_lockers(mut self, count: usize) -> Self {
        self.config.max_lockers = count;
        self
    }

    /// Set the maximum number of locked objects
    pub fn max_lock_objects(mut self, count: usize) -> Self {
        self.config.max_lock_objects = count;
        self
    }

    /// Set the lock wait timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = Some(timeout);
        self
    }

    /// Set the deadlock victim policy
    pub fn deadlock_policy(mut self, policy: impl DeadlockPolicy + 'static) -> Self {
        self.config.deadlock_policy = Arc::new(policy);
        self
    }

    /// Set the internal retry count for auto-commit operations
    pub fn deadlock_retries(mut self, retries: u32) -> Self {
        self.config.deadlock_retries = retries;
        self
    }

    /// Set the default isolation level
    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.config.isolation = isolation;
        self
    }

    /// Set the maximum number of active transactions
    pub fn max_transactions(mut self, count: usize) -> Self {
        self.config.max_transactions = count;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Checkpoint after this many kilobytes of log
    pub fn checkpoint_kbytes(mut self, kbytes: u64) -> Self {
        self.config.checkpoint_kbytes = kbytes;
        self
    }

    /// Checkpoint after this much time
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint_interval = Some(interval);
        self
    }

    /// Set the worker thread count for non-blocking operations
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    /// Register a named comparator
    pub fn comparator(
        mut self,
        name: impl Into<String>,
        cmp: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.config.comparators.register(name, Arc::new(cmp));
        self
    }

    pub fn build(self) -> EnvConfig {
        self.config
    }
}

/// Named comparators, resolved by databases at open and during recovery
#[derive(Clone, Default)]
pub struct ComparatorRegistry {
    entries: HashMap<String, Comparator>,
}

impl ComparatorRegistry {
    pub fn register(&mut self, name: impl Into<String>, cmp: Comparator) {
        self.entries.insert(name.into(), cmp);
    }

    pub fn get(&self, name: &str) -> Option<Comparator> {
        self.entries.get(name).cloned()
    }
}

impl fmt::Debug for ComparatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Access method, fixed when the database file is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMethod {
    /// Ordered tree (byte-lexicographic or custom comparator)
    BTree,

    /// Entries ordered by key hash; iteration order is unspecified
    Hash,
}

/// Duplicate-key policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Duplicates {
    /// One value per key
    Unique,

    /// Many values per key, ordered by value bytes
    Sorted,
}

/// Resource that transaction locks address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGranularity {
    Key,
    Page,
}

/// Configuration for one database
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// File name, relative to the environment home
    pub file: String,

    /// Access method used when creating the file
    pub access_method: AccessMethod,

    /// Duplicate policy used when creating the file
    pub duplicates: Duplicates,

    /// Name of a comparator registered on the environment
    pub comparator: Option<String>,

    /// Create the file if missing
    pub create: bool,

    /// Fail if the file already exists
    pub exclusive: bool,

    /// Wrap transaction-less writes in an internal transaction
    pub auto_commit: bool,

    /// Reject every write
    pub read_only: bool,

    /// Unix permission bits for the created file (None = environment default)
    pub file_mode: Option<u32>,

    /// Lock keys or leaf pages
    pub lock_granularity: LockGranularity,
}

impl DbConfig {
    /// Create a config builder for the given file
    pub fn builder(file: impl Into<String>) -> DbConfigBuilder {
        DbConfigBuilder {
            config: DbConfig {
                file: file.into(),
                access_method: AccessMethod::BTree,
                duplicates: Duplicates::Unique,
                comparator: None,
                create: true,
                exclusive: false,
                auto_commit: true,
                read_only: false,
                file_mode: None,
                lock_granularity: LockGranularity::Key,
            },
        }
    }

    /// Reject malformed settings
    pub fn validate(&self) -> Result<()> {
        if self.file.is_empty() {
            return Err(EmberError::InvalidArgument("database file name is required".to_string()));
        }
        if self.file.contains("..") || self.file.starts_with('/') {
            return Err(EmberError::InvalidArgument(format!(
                "database file must be relative to the home: {}",
                self.file
            )));
        }
        if self.access_method == AccessMethod::Hash && self.comparator.is_some() {
            return Err(EmberError::InvalidArgument(
                "hash databases do not take a comparator".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for DbConfig
pub struct DbConfigBuilder {
    config: DbConfig,
}

impl DbConfigBuilder {
    pub fn access_method(mut self, method: AccessMethod) -> Self {
        self.config.access_method = method;
        self
    }

    pub fn duplicates(mut self, duplicates: Duplicates) -> Self {
        self.config.duplicates = duplicates;
        self
    }

    pub fn comparator(mut self, name: impl Into<String>) -> Self {
        self.config.comparator = Some(name.into());
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.config.create = create;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.config.exclusive = exclusive;
        self
    }

    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.config.auto_commit = auto_commit;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn file_mode(mut self, mode: u32) -> Self {
        self.config.file_mode = Some(mode);
        self
    }

    pub fn lock_granularity(mut self, granularity: LockGranularity) -> Self {
        self.config.lock_granularity = granularity;
        self
    }

    pub fn build(self) -> DbConfig {
        self.config
    }
}

// =============================================================================
// Transaction Configuration
// =============================================================================

/// Commit durability override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitSync {
    /// Follow the environment's WAL sync strategy
    #[default]
    Default,

    /// Always fsync the log at commit
    Sync,

    /// Never fsync at commit (durable at the next flush)
    NoSync,
}

/// Per-transaction settings
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnConfig {
    /// Isolation override (None = environment default)
    pub isolation: Option<Isolation>,

    /// Commit durability
    pub sync: CommitSync,

    /// Fail lock requests immediately instead of waiting
    pub no_wait: bool,
}

impl TxnConfig {
    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn sync(mut self, sync: CommitSync) -> Self {
        self.sync = sync;
        self
    }

    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }
}

//! Database Module
//!
//! Handles to one database file inside an environment, and the shared
//! read / write paths every access takes.
//!
//! ## Write path
//! ```text
//!   lock (key or leaf page)
//!     └─► gate.read ─► latch.write
//!           ├─ read current values
//!           ├─ compute new values (flags, compare-and-swap, undo)
//!           ├─ stage changed pages into a batch
//!           ├─ pin the batch, append Update / Compensation
//!           └─ install pages with that LSN, push undo
//! ```
//! Every logical write is "replace the values of one key", so put, delete,
//! compare-and-swap, cursor writes and rollback all share this path.

mod cursor;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree::{BTree, TreeStat};
use crate::config::{AccessMethod, Duplicates, Isolation, LockGranularity, TxnConfig};
use crate::env::EnvShared;
use crate::error::{EmberError, Result};
use crate::lock::{Grant, LockMode, LockerId, ResourceId};
use crate::storage::{BufferPool, DbId, PageFile, PageId};
use crate::txn::{abort_inner, commit_inner, Transaction, TxnId, TxnInner, TxnState, UndoRecord, NO_TXN};
use crate::wal::{LogRecord, Lsn};
use crate::worker::Completion;

pub use cursor::{Cursor, CursorPut, SeekMode};

/// How `put` treats an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutFlags {
    /// Replace the value (unique) or add it to the set (sorted duplicates)
    #[default]
    Overwrite,

    /// Fail with `KeyExists` if the key has any value
    NoOverwrite,

    /// Fail with `KeyExists` if this exact key/value pair exists
    NoDupData,

    /// The key must sort after every key in the database
    Append,
}

/// Who performs an access
#[derive(Clone, Copy)]
pub(crate) enum Actor<'a> {
    Txn(&'a Arc<TxnInner>),
    /// Non-transactional access under a short-lived locker
    Bare(LockerId),
}

impl Actor<'_> {
    fn locker(&self) -> LockerId {
        match self {
            Actor::Txn(inner) => inner.id,
            Actor::Bare(locker) => *locker,
        }
    }

    fn txn_id(&self) -> TxnId {
        match self {
            Actor::Txn(inner) => inner.id,
            Actor::Bare(_) => NO_TXN,
        }
    }

    fn no_wait(&self) -> bool {
        matches!(self, Actor::Txn(inner) if inner.no_wait)
    }

    fn holds_reads(&self) -> bool {
        matches!(self, Actor::Txn(inner) if inner.isolation == Isolation::Serializable)
    }

    fn check_active(&self) -> Result<()> {
        match self {
            Actor::Txn(inner) => match inner.state() {
                TxnState::Active => Ok(()),
                state => Err(EmberError::TxnState(format!(
                    "transaction {} is {:?}",
                    inner.id, state
                ))),
            },
            Actor::Bare(_) => Ok(()),
        }
    }
}

/// Kind of log record a change produces
#[derive(Debug, Clone, Copy)]
pub(crate) enum Change {
    Update,
    Compensation(Lsn),
}

/// What a write operation sees of the key it changes
pub(crate) struct WriteView<'a> {
    pub current: Vec<Vec<u8>>,
    tree: &'a BTree,
    pool: &'a BufferPool,
}

impl WriteView<'_> {
    pub fn last_key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.last(self.pool)?.map(|located| located.key))
    }
}

/// Computes the new value set from the current one; `None` changes nothing
pub(crate) type WriteOp<'a> = dyn Fn(&WriteView<'_>) -> Result<Option<Vec<Vec<u8>>>> + 'a;

// =============================================================================
// Shared database state
// =============================================================================

/// One open database file, shared by every handle on it
pub(crate) struct DbShared {
    id: DbId,
    name: String,
    tree: BTree,
    file: Arc<PageFile>,
    access_method: AccessMethod,
    duplicates: Duplicates,
    comparator: Option<String>,
    /// Fixed by the first handle opened on this database
    granularity: Mutex<Option<LockGranularity>>,
}

impl DbShared {
    pub fn new(
        id: DbId,
        name: String,
        tree: BTree,
        file: Arc<PageFile>,
        access_method: AccessMethod,
        duplicates: Duplicates,
        comparator: Option<String>,
    ) -> Self {
        Self {
            id,
            name,
            tree,
            file,
            access_method,
            duplicates,
            comparator,
            granularity: Mutex::new(None),
        }
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    pub fn file(&self) -> &Arc<PageFile> {
        &self.file
    }

    pub fn access_method(&self) -> AccessMethod {
        self.access_method
    }

    pub fn duplicates(&self) -> Duplicates {
        self.duplicates
    }

    pub fn comparator(&self) -> Option<&str> {
        self.comparator.as_deref()
    }

    /// Bind the lock granularity, or check it against the bound one
    pub fn bind_granularity(&self, wanted: LockGranularity) -> Result<()> {
        let mut granularity = self.granularity.lock();
        match *granularity {
            Some(bound) if bound != wanted => Err(EmberError::InvalidArgument(format!(
                "database {} is already open with {:?} locking",
                self.name, bound
            ))),
            _ => {
                *granularity = Some(wanted);
                Ok(())
            }
        }
    }

    fn granularity(&self) -> LockGranularity {
        self.granularity.lock().unwrap_or(LockGranularity::Key)
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Run `f` under the tree latch with `key` locked in `mode`
    ///
    /// Exclusive access also enters the checkpoint gate and takes the latch
    /// for writing. With page locks the leaf is looked up, locked, and then
    /// checked again under the latch since a split may have moved the key.
    fn locked<T>(
        &self,
        env: &EnvShared,
        actor: Actor<'_>,
        key: &[u8],
        mode: LockMode,
        mut f: impl FnMut() -> Result<T>,
    ) -> Result<(T, Option<(ResourceId, Grant)>)> {
        let Some(locks) = env.locks() else {
            return Ok((self.latched(env, mode, &mut f)?, None));
        };

        match self.granularity() {
            LockGranularity::Key => {
                let resource = ResourceId::Key {
                    db: self.id,
                    key: key.to_vec(),
                };
                let grant = locks.acquire(actor.locker(), &resource, mode, actor.no_wait())?;
                match self.latched(env, mode, &mut f) {
                    Ok(value) => Ok((value, Some((resource, grant)))),
                    Err(e) => {
                        self.release_read(env, actor, mode, Some((resource, grant)));
                        Err(e)
                    }
                }
            }
            LockGranularity::Page => loop {
                let leaf = {
                    let _latch = self.tree.latch().read();
                    self.tree.leaf_for(env.pool(), key)?
                };
                let resource = ResourceId::Page {
                    db: self.id,
                    page: leaf,
                };
                let grant = locks.acquire(actor.locker(), &resource, mode, actor.no_wait())?;

                let outcome = self.latched(env, mode, &mut || {
                    if self.tree.leaf_for(env.pool(), key)? != leaf {
                        return Ok(None);
                    }
                    f().map(Some)
                });
                match outcome {
                    Ok(Some(value)) => return Ok((value, Some((resource, grant)))),
                    Ok(None) => {
                        if grant == Grant::Granted {
                            locks.release(actor.locker(), &resource);
                        }
                    }
                    Err(e) => {
                        self.release_read(env, actor, mode, Some((resource, grant)));
                        return Err(e);
                    }
                }
            },
        }
    }

    fn latched<T>(&self, env: &EnvShared, mode: LockMode, f: &mut impl FnMut() -> Result<T>) -> Result<T> {
        match mode {
            LockMode::Exclusive => {
                let _gate = env.gate().read();
                let _latch = self.tree.latch().write();
                f()
            }
            LockMode::Shared => {
                let _latch = self.tree.latch().read();
                f()
            }
        }
    }

    /// Lock an explicit resource (cursor reads)
    fn lock_resource(
        &self,
        env: &EnvShared,
        actor: Actor<'_>,
        resource: ResourceId,
        mode: LockMode,
    ) -> Result<Option<(ResourceId, Grant)>> {
        match env.locks() {
            Some(locks) => {
                let grant = locks.acquire(actor.locker(), &resource, mode, actor.no_wait())?;
                Ok(Some((resource, grant)))
            }
            None => Ok(None),
        }
    }

    /// Drop a read lock taken by this operation unless the isolation level keeps it
    fn release_read(
        &self,
        env: &EnvShared,
        actor: Actor<'_>,
        mode: LockMode,
        lock: Option<(ResourceId, Grant)>,
    ) {
        let (Some(locks), Some((resource, Grant::Granted))) = (env.locks(), lock) else {
            return;
        };
        if mode == LockMode::Shared && !actor.holds_reads() {
            locks.release(actor.locker(), &resource);
        }
    }

    /// Whether a leaf page may be modified or allocated by `locker`
    fn claim(&self, env: &EnvShared, locker: LockerId, page: PageId) -> bool {
        match (self.granularity(), env.locks()) {
            (LockGranularity::Page, Some(locks)) => locks
                .try_acquire(
                    locker,
                    &ResourceId::Page { db: self.id, page },
                    LockMode::Exclusive,
                )
                .unwrap_or(false),
            _ => true,
        }
    }

    // =========================================================================
    // Reads and writes
    // =========================================================================

    pub(crate) fn read(&self, env: &EnvShared, actor: Actor<'_>, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        actor.check_active()?;
        let (values, lock) = self.locked(env, actor, key, LockMode::Shared, || {
            self.tree.values(env.pool(), key)
        })?;
        self.release_read(env, actor, LockMode::Shared, lock);
        Ok(values)
    }

    pub(crate) fn write(&self, env: &EnvShared, actor: Actor<'_>, key: &[u8], op: &WriteOp<'_>) -> Result<()> {
        actor.check_active()?;
        self.locked(env, actor, key, LockMode::Exclusive, || {
            let view = WriteView {
                current: self.tree.values(env.pool(), key)?,
                tree: &self.tree,
                pool: env.pool(),
            };
            let Some(after) = op(&view)? else {
                return Ok(());
            };
            let before = view.current;
            if after == before {
                return Ok(());
            }

            if let Actor::Txn(inner) = actor {
                log_begin(env, inner)?;
            }
            let claim = |page: PageId| self.claim(env, actor.locker(), page);
            let lsn = self.apply(env, actor.txn_id(), key, &before, &after, &claim, Change::Update)?;
            if let Actor::Txn(inner) = actor {
                inner.status.lock().undo.push(UndoRecord {
                    db: self.id,
                    key: key.to_vec(),
                    before,
                    lsn,
                });
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Restore one key for a rolling-back transaction
    pub(crate) fn undo(&self, env: &EnvShared, inner: &Arc<TxnInner>, record: &UndoRecord) -> Result<()> {
        let actor = Actor::Txn(inner);
        self.locked(env, actor, &record.key, LockMode::Exclusive, || {
            let current = self.tree.values(env.pool(), &record.key)?;
            if current == record.before {
                return Ok(());
            }
            let claim = |page: PageId| self.claim(env, inner.id, page);
            self.apply(
                env,
                inner.id,
                &record.key,
                &current,
                &record.before,
                &claim,
                Change::Compensation(record.lsn),
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Stage, log and install one change (caller holds the latch for writing)
    pub(crate) fn apply(
        &self,
        env: &EnvShared,
        txn: TxnId,
        key: &[u8],
        before: &[Vec<u8>],
        after: &[Vec<u8>],
        claim: &dyn Fn(PageId) -> bool,
        change: Change,
    ) -> Result<Lsn> {
        let pool = env.pool();
        let batch = self.tree.replace_all(pool, key, before, after, claim)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let guards = batch.pin(pool)?;
        let lsn = match env.wal() {
            Some(wal) => {
                let images = batch.images();
                let record = match change {
                    Change::Update => LogRecord::Update {
                        db: self.id,
                        key: key.to_vec(),
                        before: before.to_vec(),
                        after: after.to_vec(),
                        images,
                    },
                    Change::Compensation(compensates) => LogRecord::Compensation {
                        db: self.id,
                        key: key.to_vec(),
                        compensates,
                        images,
                    },
                };
                wal.append(txn, record)?
            }
            None => 0,
        };
        tracing::trace!(
            "database {}: {:?} by {} touched {} pages at LSN {}",
            self.id,
            change,
            txn,
            batch.len(),
            lsn
        );
        batch.install(guards, lsn);
        Ok(lsn)
    }
}

/// Write `Begin` before a transaction's first change
fn log_begin(env: &EnvShared, inner: &Arc<TxnInner>) -> Result<()> {
    let Some(wal) = env.wal() else {
        return Ok(());
    };
    let mut status = inner.status.lock();
    if !status.logged {
        wal.append(
            inner.id,
            LogRecord::Begin {
                parent: inner.parent.as_ref().map(|p| p.id),
            },
        )?;
        status.logged = true;
    }
    Ok(())
}

// =============================================================================
// Public handle
// =============================================================================

/// Handle on an open database
///
/// Handles are cheap to clone; every clone shares the same tree.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DbShared>,
    env: Arc<EnvShared>,
    auto_commit: bool,
    read_only: bool,
}

impl Database {
    pub(crate) fn new(shared: Arc<DbShared>, env: Arc<EnvShared>, auto_commit: bool, read_only: bool) -> Self {
        Self {
            shared,
            env,
            auto_commit,
            read_only,
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn id(&self) -> DbId {
        self.shared.id()
    }

    pub fn access_method(&self) -> AccessMethod {
        self.shared.access_method()
    }

    pub fn duplicates(&self) -> Duplicates {
        self.shared.duplicates()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Value stored under `key` (the smallest one in sorted-duplicate databases)
    pub fn get(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.txn_inner(txn)?;
        Ok(self.get_values(txn, key)?.into_iter().next())
    }

    /// Every value stored under `key`, in order
    pub fn get_all(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let txn = self.txn_inner(txn)?;
        self.get_values(txn, key)
    }

    pub(crate) fn get_values(&self, txn: Option<&Arc<TxnInner>>, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.env.check_open()?;
        self.shared.tree.check_key(key)?;
        match txn {
            Some(inner) => self.shared.read(&self.env, Actor::Txn(inner), key),
            None => self.bare(|actor| self.shared.read(&self.env, actor, key)),
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn put(&self, txn: Option<&Transaction>, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        let txn = self.txn_inner(txn)?;
        self.put_inner(txn, key, value, flags)
    }

    pub(crate) fn put_inner(
        &self,
        txn: Option<&Arc<TxnInner>>,
        key: &[u8],
        value: &[u8],
        flags: PutFlags,
    ) -> Result<()> {
        let sorted = self.shared.tree.order().sorted_dups();
        match flags {
            PutFlags::NoDupData if !sorted => {
                return Err(EmberError::InvalidArgument(
                    "NoDupData requires a sorted-duplicate database".to_string(),
                ))
            }
            PutFlags::Append if self.shared.access_method == AccessMethod::Hash => {
                return Err(EmberError::InvalidArgument(
                    "Append is not supported by hash databases".to_string(),
                ))
            }
            _ => {}
        }
        self.shared.tree.check_value(value)?;

        let order = self.shared.tree.order();
        let op = |view: &WriteView<'_>| -> Result<Option<Vec<Vec<u8>>>> {
            match flags {
                PutFlags::NoOverwrite if !view.current.is_empty() => return Err(EmberError::KeyExists),
                PutFlags::NoDupData if view.current.iter().any(|v| v.as_slice() == value) => {
                    return Err(EmberError::KeyExists)
                }
                PutFlags::Append => {
                    if let Some(last) = view.last_key()? {
                        if order.cmp_keys(&last, key) != Ordering::Less {
                            return Err(EmberError::InvalidArgument(
                                "appended key must sort after every stored key".to_string(),
                            ));
                        }
                    }
                }
                _ => {}
            }
            Ok(Some(if sorted {
                with_value(&view.current, value)
            } else {
                vec![value.to_vec()]
            }))
        };
        self.write(txn, key, &op)
    }

    /// Remove `key` and all its values; `NotFound` if absent
    pub fn delete(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<()> {
        let txn = self.txn_inner(txn)?;
        self.delete_inner(txn, key)
    }

    pub(crate) fn delete_inner(&self, txn: Option<&Arc<TxnInner>>, key: &[u8]) -> Result<()> {
        let op = |view: &WriteView<'_>| -> Result<Option<Vec<Vec<u8>>>> {
            if view.current.is_empty() {
                return Err(EmberError::NotFound);
            }
            Ok(Some(Vec::new()))
        };
        self.write(txn, key, &op)
    }

    /// Store `new` only if the key currently holds `expected`
    ///
    /// `expected = None` means the key must be absent. A mismatch fails with
    /// `Conflict` and changes nothing.
    pub fn put_if(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        new: &[u8],
        expected: Option<&[u8]>,
    ) -> Result<()> {
        let txn = self.txn_inner(txn)?;
        self.put_if_inner(txn, key, new, expected)
    }

    pub(crate) fn put_if_inner(
        &self,
        txn: Option<&Arc<TxnInner>>,
        key: &[u8],
        new: &[u8],
        expected: Option<&[u8]>,
    ) -> Result<()> {
        self.shared.tree.check_value(new)?;
        let sorted = self.shared.tree.order().sorted_dups();
        let op = |view: &WriteView<'_>| -> Result<Option<Vec<Vec<u8>>>> {
            match expected {
                None if view.current.is_empty() => Ok(Some(vec![new.to_vec()])),
                None => Err(EmberError::Conflict),
                Some(old) if sorted => {
                    if !view.current.iter().any(|v| v.as_slice() == old) {
                        return Err(EmberError::Conflict);
                    }
                    Ok(Some(with_value(&without_value(&view.current, old), new)))
                }
                Some(old) => match view.current.first() {
                    Some(stored) if stored.as_slice() == old => Ok(Some(vec![new.to_vec()])),
                    _ => Err(EmberError::Conflict),
                },
            }
        };
        self.write(txn, key, &op)
    }

    pub(crate) fn write(&self, txn: Option<&Arc<TxnInner>>, key: &[u8], op: &WriteOp<'_>) -> Result<()> {
        self.env.check_open()?;
        if self.read_only {
            return Err(EmberError::InvalidArgument(format!(
                "database {} is read-only",
                self.name()
            )));
        }
        self.shared.tree.check_key(key)?;

        match txn {
            Some(inner) => self.shared.write(&self.env, Actor::Txn(inner), key, op),
            None if self.auto_commit && self.env.config().transactions => {
                self.auto(|actor| self.shared.write(&self.env, actor, key, op))
            }
            None => self.bare(|actor| self.shared.write(&self.env, actor, key, op)),
        }
    }

    // -------------------------------------------------------------------------
    // Cursors, statistics, lifecycle
    // -------------------------------------------------------------------------

    /// Open a cursor, optionally bound to a transaction
    pub fn cursor(&self, txn: Option<&Transaction>) -> Result<Cursor> {
        self.env.check_open()?;
        let txn = self.txn_inner(txn)?.cloned();
        Ok(Cursor::new(self.clone(), txn))
    }

    pub fn stat(&self) -> Result<TreeStat> {
        self.env.check_open()?;
        let _latch = self.shared.tree.latch().read();
        self.shared.tree.stat(self.env.pool())
    }

    /// Write this database's dirty pages (after the log) and fsync the file
    pub fn sync(&self) -> Result<()> {
        self.env.check_open()?;
        if let Some(wal) = self.env.wal() {
            wal.flush_all()?;
        }
        self.env.pool().flush_file(self.id())
    }

    /// Sync and release this handle
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    // -------------------------------------------------------------------------
    // Non-blocking variants
    // -------------------------------------------------------------------------

    pub fn get_async(&self, txn: Option<&Transaction>, key: impl Into<Vec<u8>>) -> Completion<Option<Vec<u8>>> {
        let key = key.into();
        self.spawn(txn, move |db, txn| {
            Ok(db.get_values(txn, &key)?.into_iter().next())
        })
    }

    pub fn put_async(
        &self,
        txn: Option<&Transaction>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        flags: PutFlags,
    ) -> Completion<()> {
        let (key, value) = (key.into(), value.into());
        self.spawn(txn, move |db, txn| db.put_inner(txn, &key, &value, flags))
    }

    pub fn delete_async(&self, txn: Option<&Transaction>, key: impl Into<Vec<u8>>) -> Completion<()> {
        let key = key.into();
        self.spawn(txn, move |db, txn| db.delete_inner(txn, &key))
    }

    pub fn put_if_async(
        &self,
        txn: Option<&Transaction>,
        key: impl Into<Vec<u8>>,
        new: impl Into<Vec<u8>>,
        expected: Option<Vec<u8>>,
    ) -> Completion<()> {
        let (key, new) = (key.into(), new.into());
        self.spawn(txn, move |db, txn| {
            db.put_if_inner(txn, &key, &new, expected.as_deref())
        })
    }

    fn spawn<T: Send + 'static>(
        &self,
        txn: Option<&Transaction>,
        job: impl FnOnce(&Database, Option<&Arc<TxnInner>>) -> Result<T> + Send + 'static,
    ) -> Completion<T> {
        let txn = match self.txn_inner(txn) {
            Ok(txn) => txn.cloned(),
            Err(e) => return Completion::ready(Err(e)),
        };
        let db = self.clone();
        self.env.workers().submit(move || job(&db, txn.as_ref()))
    }

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    pub(crate) fn shared(&self) -> &Arc<DbShared> {
        &self.shared
    }

    pub(crate) fn env(&self) -> &Arc<EnvShared> {
        &self.env
    }

    fn txn_inner<'t>(&self, txn: Option<&'t Transaction>) -> Result<Option<&'t Arc<TxnInner>>> {
        match txn {
            Some(txn) if !Arc::ptr_eq(&txn.env, &self.env) => Err(EmberError::InvalidArgument(
                "transaction belongs to another environment".to_string(),
            )),
            Some(txn) => Ok(Some(&txn.inner)),
            None => Ok(None),
        }
    }

    /// Run a write in its own transaction, retrying when chosen as deadlock victim
    pub(crate) fn auto<T>(&self, f: impl Fn(Actor<'_>) -> Result<T>) -> Result<T> {
        let retries = self.env.config().deadlock_retries;
        let mut attempt = 0;
        loop {
            let inner = self.env.begin_inner(None, TxnConfig::default())?;
            match f(Actor::Txn(&inner)) {
                Ok(value) => {
                    if let Err(e) = commit_inner(&self.env, &inner, inner.sync) {
                        if let Err(abort_err) = abort_inner(&self.env, &inner) {
                            tracing::warn!(
                                "database {}: abort of auto-commit txn {} after failed commit: {}",
                                self.name(),
                                inner.id,
                                abort_err
                            );
                            self.env.set_needs_recovery("auto-commit abort failed after commit error");
                        }
                        return Err(e);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    abort_inner(&self.env, &inner)?;
                    if matches!(e, EmberError::Deadlock(_)) && attempt < retries {
                        attempt += 1;
                        tracing::debug!(
                            "database {}: auto-commit write retrying after deadlock ({}/{})",
                            self.name(),
                            attempt,
                            retries
                        );
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run an access under a short-lived locker
    pub(crate) fn bare<T>(&self, f: impl FnOnce(Actor<'_>) -> Result<T>) -> Result<T> {
        let locker = self.env.txns().next_id();
        let result = f(Actor::Bare(locker));
        if let Some(locks) = self.env.locks() {
            locks.release_all(locker);
        }
        result
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("access_method", &self.shared.access_method)
            .field("duplicates", &self.shared.duplicates)
            .finish()
    }
}

/// `current` plus `value`, kept sorted and without repeats
pub(crate) fn with_value(current: &[Vec<u8>], value: &[u8]) -> Vec<Vec<u8>> {
    let mut values = current.to_vec();
    if let Err(at) = values.binary_search_by(|v| v.as_slice().cmp(value)) {
        values.insert(at, value.to_vec());
    }
    values
}

pub(crate) fn without_value(current: &[Vec<u8>], value: &[u8]) -> Vec<Vec<u8>> {
    current.iter().filter(|v| v.as_slice() != value).cloned().collect()
}

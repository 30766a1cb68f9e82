//! Cursors
//!
//! A cursor remembers the `(key, dup)` identity of its entry plus a
//! page/slot hint. The hint is only trusted after checking the slot still
//! holds that identity; otherwise the entry is found again by key.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::btree::{BTree, Located};
use crate::config::LockGranularity;
use crate::error::{EmberError, Result};
use crate::lock::{LockMode, LockerId, ResourceId};
use crate::storage::{BufferPool, PageId};
use crate::txn::{TxnInner, TxnState};

use super::{with_value, without_value, Actor, Database, WriteView};

/// Where `Cursor::position` lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// First entry whose key equals the given key
    Exact,
    /// First entry at or after the given key
    AtOrAfter,
    First,
    Last,
}

/// How `Cursor::put` places the value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPut {
    /// Replace the value of the current entry
    Current,
    /// New duplicate of the current key that sorts just before the current one
    Before,
    /// New duplicate of the current key that sorts just after the current one
    After,
    KeyFirst,
    KeyLast,
}

#[derive(Debug, Clone)]
struct Position {
    key: Vec<u8>,
    dup: Option<Vec<u8>>,
    hint: Option<(PageId, usize)>,
}

impl Position {
    fn at(located: &Located) -> Self {
        Self {
            key: located.key.clone(),
            dup: located.dup.clone(),
            hint: Some((located.page, located.index)),
        }
    }
}

/// Positioned iterator over one database
pub struct Cursor {
    db: Database,
    txn: Option<Arc<TxnInner>>,
    /// Locker used when no transaction is bound
    locker: LockerId,
    position: Option<Position>,
}

type Pair = (Vec<u8>, Vec<u8>);

impl Cursor {
    pub(crate) fn new(db: Database, txn: Option<Arc<TxnInner>>) -> Self {
        let locker = match &txn {
            Some(inner) => inner.id,
            None => db.env().txns().next_id(),
        };
        Self {
            db,
            txn,
            locker,
            position: None,
        }
    }

    pub fn is_positioned(&self) -> bool {
        self.position.is_some()
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Move to `key` according to `mode`; `NotFound` leaves the cursor where it was
    pub fn position(&mut self, key: &[u8], mode: SeekMode) -> Result<Pair> {
        let found = match mode {
            SeekMode::Exact => {
                let order = self.db.shared().tree().order().clone();
                self.step(|tree, pool| {
                    Ok(tree
                        .seek_entry(pool, key, None)?
                        .filter(|l| order.cmp_keys(&l.key, key) == Ordering::Equal))
                })?
            }
            SeekMode::AtOrAfter => self.step(|tree, pool| tree.seek_entry(pool, key, None))?,
            SeekMode::First => self.step(|tree, pool| tree.first(pool))?,
            SeekMode::Last => self.step(|tree, pool| tree.last(pool))?,
        };
        self.land(found, EmberError::NotFound)
    }

    pub fn first(&mut self) -> Result<Pair> {
        self.position(&[], SeekMode::First)
    }

    pub fn last(&mut self) -> Result<Pair> {
        self.position(&[], SeekMode::Last)
    }

    /// Advance; an unpositioned cursor starts at the first entry
    pub fn next(&mut self) -> Result<Pair> {
        let found = match self.position.clone() {
            Some(pos) => self.step(|tree, pool| tree.entry_after(pool, &pos.key, pos.dup.as_deref()))?,
            None => self.step(|tree, pool| tree.first(pool))?,
        };
        self.land(found, EmberError::EndOfSequence)
    }

    /// Step back; an unpositioned cursor starts at the last entry
    pub fn prev(&mut self) -> Result<Pair> {
        let found = match self.position.clone() {
            Some(pos) => self.step(|tree, pool| tree.entry_before(pool, &pos.key, pos.dup.as_deref()))?,
            None => self.step(|tree, pool| tree.last(pool))?,
        };
        self.land(found, EmberError::EndOfSequence)
    }

    /// Entry under the cursor
    pub fn get(&mut self) -> Result<Pair> {
        let pos = self.positioned()?;
        let order = self.db.shared().tree().order().clone();
        let found = self.step(|tree, pool| {
            if let Some((page, index)) = pos.hint {
                if let Some(hit) = tree.entry_at(pool, page, index, &pos.key, pos.dup.as_deref())? {
                    return Ok(Some(hit));
                }
            }
            Ok(tree
                .seek_entry(pool, &pos.key, pos.dup.as_deref())?
                .filter(|l| order.cmp((&l.key, l.dup.as_deref()), (&pos.key, pos.dup.as_deref())) == Ordering::Equal))
        })?;
        match found {
            Some(located) => {
                self.position = Some(Position::at(&located));
                Ok((located.key, located.value))
            }
            None => Err(EmberError::NotFound),
        }
    }

    /// Every remaining pair after the current position
    pub fn collect(&mut self) -> Result<Vec<Pair>> {
        let mut pairs = Vec::new();
        loop {
            match self.next() {
                Ok(pair) => pairs.push(pair),
                Err(EmberError::EndOfSequence) => return Ok(pairs),
                Err(e) => return Err(e),
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn put(&mut self, key: &[u8], value: &[u8], how: CursorPut) -> Result<()> {
        self.check_txn()?;
        let sorted = self.db.shared().tree().order().sorted_dups();

        match how {
            CursorPut::Current => {
                let pos = self.positioned()?;
                if let Some(dup) = &pos.dup {
                    if dup.as_slice() != value {
                        return Err(EmberError::InvalidArgument(
                            "sorted duplicates cannot be replaced in place".to_string(),
                        ));
                    }
                    return Ok(());
                }
                self.db.shared().tree().check_value(value)?;
                let op = |view: &WriteView<'_>| -> Result<Option<Vec<Vec<u8>>>> {
                    if view.current.is_empty() {
                        return Err(EmberError::NotFound);
                    }
                    Ok(Some(vec![value.to_vec()]))
                };
                self.db.write(self.txn.as_ref(), &pos.key, &op)?;
                self.position = Some(Position { hint: None, ..pos });
                Ok(())
            }
            CursorPut::Before | CursorPut::After => {
                if !sorted {
                    return Err(EmberError::InvalidArgument(
                        "Before/After require a sorted-duplicate database".to_string(),
                    ));
                }
                let pos = self.positioned()?;
                if pos.key.as_slice() != key {
                    return Err(EmberError::InvalidArgument(
                        "Before/After insert a duplicate of the current key".to_string(),
                    ));
                }
                let dup = pos.dup.clone().unwrap_or_default();
                let wanted = if how == CursorPut::Before { Ordering::Less } else { Ordering::Greater };
                if value.cmp(dup.as_slice()) != wanted {
                    return Err(EmberError::InvalidArgument(format!(
                        "value does not sort {} the current duplicate",
                        if how == CursorPut::Before { "before" } else { "after" }
                    )));
                }
                self.db.shared().tree().check_value(value)?;
                let op = |view: &WriteView<'_>| -> Result<Option<Vec<Vec<u8>>>> {
                    if view.current.iter().any(|v| v.as_slice() == value) {
                        return Err(EmberError::KeyExists);
                    }
                    Ok(Some(with_value(&view.current, value)))
                };
                self.db.write(self.txn.as_ref(), key, &op)?;
                self.position = Some(Position {
                    key: key.to_vec(),
                    dup: Some(value.to_vec()),
                    hint: None,
                });
                Ok(())
            }
            CursorPut::KeyFirst | CursorPut::KeyLast => {
                self.db.put_inner(self.txn.as_ref(), key, value, super::PutFlags::Overwrite)?;
                self.position = Some(Position {
                    key: key.to_vec(),
                    dup: sorted.then(|| value.to_vec()),
                    hint: None,
                });
                Ok(())
            }
        }
    }

    /// Remove the current entry; the cursor moves to the following entry
    pub fn delete(&mut self) -> Result<()> {
        self.check_txn()?;
        let pos = self.positioned()?;
        let op = |view: &WriteView<'_>| -> Result<Option<Vec<Vec<u8>>>> {
            match &pos.dup {
                Some(dup) if view.current.contains(dup) => Ok(Some(without_value(&view.current, dup))),
                None if !view.current.is_empty() => Ok(Some(Vec::new())),
                _ => Err(EmberError::NotFound),
            }
        };
        self.db.write(self.txn.as_ref(), &pos.key, &op)?;

        let following = self.step(|tree, pool| tree.entry_after(pool, &pos.key, pos.dup.as_deref()))?;
        self.position = following.as_ref().map(Position::at);
        Ok(())
    }

    /// Release the cursor
    pub fn close(self) {}

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_txn(&self) -> Result<()> {
        self.db.env().check_open()?;
        match &self.txn {
            Some(inner) if inner.state() != TxnState::Active => Err(EmberError::InvalidCursor),
            _ => Ok(()),
        }
    }

    fn actor(&self) -> Actor<'_> {
        match &self.txn {
            Some(inner) => Actor::Txn(inner),
            None => Actor::Bare(self.locker),
        }
    }

    fn positioned(&self) -> Result<Position> {
        self.position
            .clone()
            .ok_or_else(|| EmberError::InvalidArgument("cursor is not positioned".to_string()))
    }

    fn land(&mut self, found: Option<Located>, missing: EmberError) -> Result<Pair> {
        match found {
            Some(located) => {
                self.position = Some(Position::at(&located));
                Ok((located.key, located.value))
            }
            None => Err(missing),
        }
    }

    /// Find an entry, lock it, and confirm it did not move meanwhile
    fn step(&self, find: impl Fn(&BTree, &BufferPool) -> Result<Option<Located>>) -> Result<Option<Located>> {
        self.check_txn()?;
        let shared = self.db.shared();
        let env = self.db.env();
        let tree = shared.tree();
        let actor = self.actor();
        let page_locks = shared.granularity() == LockGranularity::Page;

        loop {
            let candidate = {
                let _latch = tree.latch().read();
                find(tree, env.pool())?
            };
            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let resource = if page_locks {
                ResourceId::Page {
                    db: shared.id(),
                    page: candidate.page,
                }
            } else {
                ResourceId::Key {
                    db: shared.id(),
                    key: candidate.key.clone(),
                }
            };
            let lock = shared.lock_resource(env, actor, resource, LockMode::Shared)?;

            let current = {
                let _latch = tree.latch().read();
                find(tree, env.pool())?
            };
            shared.release_read(env, actor, LockMode::Shared, lock);

            let stable = current.as_ref().map_or(false, |c| {
                c.key == candidate.key && c.dup == candidate.dup && (!page_locks || c.page == candidate.page)
            });
            if stable {
                return Ok(current);
            }
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("database", &self.db.name())
            .field("txn", &self.txn.as_ref().map(|t| t.id))
            .field("positioned", &self.position.is_some())
            .finish()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.txn.is_none() {
            if let Some(locks) = self.db.env().locks() {
                locks.release_all(self.locker);
            }
        }
    }
}

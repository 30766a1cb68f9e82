//! Transaction handle and the commit / abort / prepare protocols

use std::fmt;
use std::sync::Arc;

use crate::config::{CommitSync, Isolation, TxnConfig, WalSyncStrategy};
use crate::env::EnvShared;
use crate::error::{EmberError, Result};
use crate::wal::{LogManager, LogRecord, Lsn};

use super::{TxnId, TxnInner, TxnState, UndoRecord};

/// A transaction begun on an [`crate::Environment`]
///
/// Dropping a transaction that is still active aborts it.
pub struct Transaction {
    pub(crate) inner: Arc<TxnInner>,
    pub(crate) env: Arc<EnvShared>,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<TxnInner>, env: Arc<EnvShared>) -> Self {
        Self { inner, env }
    }

    pub fn id(&self) -> TxnId {
        self.inner.id
    }

    pub fn state(&self) -> TxnState {
        self.inner.state()
    }

    pub fn isolation(&self) -> Isolation {
        self.inner.isolation
    }

    pub fn parent_id(&self) -> Option<TxnId> {
        self.inner.parent.as_ref().map(|p| p.id)
    }

    /// Commit with the durability chosen at begin
    pub fn commit(&self) -> Result<()> {
        commit_inner(&self.env, &self.inner, self.inner.sync)
    }

    pub fn commit_with(&self, sync: CommitSync) -> Result<()> {
        commit_inner(&self.env, &self.inner, sync)
    }

    /// Roll back every change; aborting twice is a no-op
    pub fn abort(&self) -> Result<()> {
        abort_inner(&self.env, &self.inner)
    }

    /// First phase of two-phase commit; only commit or abort may follow
    pub fn prepare(&self) -> Result<()> {
        prepare_inner(&self.env, &self.inner)
    }

    /// Begin a nested transaction whose locks never conflict with this one
    pub fn begin_child(&self, config: TxnConfig) -> Result<Transaction> {
        let inner = self.env.begin_inner(Some(self.inner.clone()), config)?;
        Ok(Transaction::new(inner, self.env.clone()))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("parent", &self.parent_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !matches!(self.inner.state(), TxnState::Active | TxnState::Prepared) {
            return;
        }
        if self.env.is_killed() {
            return;
        }
        tracing::warn!("transaction {} dropped while active, aborting", self.inner.id);
        if let Err(e) = abort_inner(&self.env, &self.inner) {
            tracing::warn!("abort of dropped transaction {} failed: {}", self.inner.id, e);
        }
    }
}

// =============================================================================
// Protocols
// =============================================================================

pub(crate) fn commit_inner(env: &EnvShared, inner: &Arc<TxnInner>, sync: CommitSync) -> Result<()> {
    env.check_open()?;
    {
        let status = inner.status.lock();
        match status.state {
            TxnState::Active | TxnState::Prepared => {}
            state => {
                return Err(EmberError::TxnState(format!(
                    "cannot commit transaction {} in state {:?}",
                    inner.id, state
                )))
            }
        }
        if status.children > 0 {
            return Err(EmberError::InvalidArgument(format!(
                "transaction {} has {} unfinished child transactions",
                inner.id, status.children
            )));
        }
    }

    match &inner.parent {
        Some(parent) => commit_child(env, inner, parent),
        None => commit_top(env, inner, sync),
    }
}

fn commit_top(env: &EnvShared, inner: &Arc<TxnInner>, sync: CommitSync) -> Result<()> {
    if let (true, Some(wal)) = (inner.has_writes(), env.wal()) {
        let lsn = wal.append(inner.id, LogRecord::Commit)?;
        if let Err(e) = flush_commit(wal, lsn, sync) {
            env.set_needs_recovery(&format!("commit of transaction {} not durable: {}", inner.id, e));
            finish(env, inner, TxnState::Aborted);
            return Err(e);
        }
    }

    finish(env, inner, TxnState::Committed);
    tracing::trace!("transaction {} committed", inner.id);
    env.maybe_checkpoint();
    Ok(())
}

fn flush_commit(wal: &LogManager, lsn: Lsn, sync: CommitSync) -> Result<()> {
    match sync {
        CommitSync::Sync => wal.flush(lsn),
        CommitSync::NoSync => Ok(()),
        CommitSync::Default => match wal.sync_strategy() {
            WalSyncStrategy::EveryCommit => wal.flush(lsn),
            WalSyncStrategy::EveryNEntries { .. } => wal.flush_buffer(),
        },
    }
}

fn commit_child(env: &EnvShared, inner: &Arc<TxnInner>, parent: &Arc<TxnInner>) -> Result<()> {
    if let (true, Some(wal)) = (inner.has_writes(), env.wal()) {
        wal.append(inner.id, LogRecord::ChildCommit { parent: parent.id })?;
    }

    let undo = std::mem::take(&mut inner.status.lock().undo);
    parent.status.lock().undo.extend(undo);
    if let Some(locks) = env.locks() {
        locks.inherit(inner.id, parent.id)?;
    }

    finish(env, inner, TxnState::Committed);
    tracing::trace!("transaction {} folded into {}", inner.id, parent.id);
    Ok(())
}

pub(crate) fn abort_inner(env: &EnvShared, inner: &Arc<TxnInner>) -> Result<()> {
    match inner.state() {
        TxnState::Aborted => return Ok(()),
        TxnState::Committed => {
            return Err(EmberError::TxnState(format!(
                "transaction {} already committed",
                inner.id
            )))
        }
        TxnState::Active | TxnState::Prepared => {}
    }

    let children: Vec<_> = env
        .txns()
        .active()
        .into_iter()
        .filter(|t| t.parent.as_ref().map(|p| p.id) == Some(inner.id))
        .collect();
    for child in &children {
        abort_inner(env, child)?;
    }

    if env.check_open().is_err() {
        finish(env, inner, TxnState::Aborted);
        return Ok(());
    }

    let wrote = inner.has_writes();
    let undo = std::mem::take(&mut inner.status.lock().undo);
    if let Err(e) = rollback(env, inner, &undo) {
        env.set_needs_recovery(&format!("rollback of transaction {} failed: {}", inner.id, e));
        finish(env, inner, TxnState::Aborted);
        return Err(e);
    }

    if let (true, Some(wal)) = (wrote, env.wal()) {
        wal.append(inner.id, LogRecord::Abort)?;
    }
    finish(env, inner, TxnState::Aborted);
    tracing::debug!("transaction {} aborted ({} undo records)", inner.id, undo.len());
    Ok(())
}

fn rollback(env: &EnvShared, inner: &Arc<TxnInner>, undo: &[UndoRecord]) -> Result<()> {
    for record in undo.iter().rev() {
        let db = env.database(record.db).ok_or_else(|| {
            EmberError::Corruption(format!("undo record names unknown database {}", record.db))
        })?;
        db.undo(env, inner, record)?;
    }
    Ok(())
}

pub(crate) fn prepare_inner(env: &EnvShared, inner: &Arc<TxnInner>) -> Result<()> {
    env.check_open()?;
    if inner.parent.is_some() {
        return Err(EmberError::InvalidArgument(
            "only top-level transactions can be prepared".to_string(),
        ));
    }
    {
        let status = inner.status.lock();
        if status.state != TxnState::Active {
            return Err(EmberError::TxnState(format!(
                "cannot prepare transaction {} in state {:?}",
                inner.id, status.state
            )));
        }
        if status.children > 0 {
            return Err(EmberError::InvalidArgument(format!(
                "transaction {} has unfinished child transactions",
                inner.id
            )));
        }
    }

    if let Some(wal) = env.wal() {
        let lsn = wal.append(inner.id, LogRecord::Prepare)?;
        wal.flush(lsn)?;
    }
    let mut status = inner.status.lock();
    status.state = TxnState::Prepared;
    status.logged = true;
    Ok(())
}

/// Settle a transaction: final state, locks released, table entry removed
fn finish(env: &EnvShared, inner: &Arc<TxnInner>, state: TxnState) {
    {
        let mut status = inner.status.lock();
        status.state = state;
        status.undo.clear();
    }
    if let Some(parent) = &inner.parent {
        let mut status = parent.status.lock();
        status.children = status.children.saturating_sub(1);
    }
    if state == TxnState::Aborted || inner.parent.is_none() {
        if let Some(locks) = env.locks() {
            locks.release_all(inner.id);
        }
    }
    env.txns().finish(inner.id);
}

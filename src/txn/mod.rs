//! Transaction Module
//!
//! Transaction table, undo lists and the public [`Transaction`] handle.
//!
//! ## Lifecycle
//! ```text
//!   begin ──► Active ──► (Prepared) ──► Committed
//!                │            │
//!                └────────────┴───────► Aborted
//! ```
//!
//! A transaction logs nothing until its first write; that write is preceded
//! by a `Begin` record. Every write pushes an [`UndoRecord`] holding the
//! key's values before the change, and abort replays them newest first.

mod manager;
mod transaction;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{CommitSync, Isolation};
use crate::storage::DbId;
use crate::wal::Lsn;

pub(crate) use manager::TxnManager;
pub use transaction::Transaction;
pub(crate) use transaction::{abort_inner, commit_inner};

/// Transaction identifier (also used as the lock-table locker id)
pub type TxnId = u64;

/// Owner of non-transactional log records
pub const NO_TXN: TxnId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Prepared,
    Committed,
    Aborted,
}

/// How to restore one key if the transaction aborts
#[derive(Debug, Clone)]
pub(crate) struct UndoRecord {
    pub db: DbId,
    pub key: Vec<u8>,
    pub before: Vec<Vec<u8>>,
    /// LSN of the update being undone
    pub lsn: Lsn,
}

#[derive(Debug)]
pub(crate) struct TxnStatus {
    pub state: TxnState,
    pub undo: Vec<UndoRecord>,
    /// `Begin` has been written
    pub logged: bool,
    /// Children that are neither committed nor aborted
    pub children: usize,
}

/// Shared state of one transaction
#[derive(Debug)]
pub(crate) struct TxnInner {
    pub id: TxnId,
    pub parent: Option<Arc<TxnInner>>,
    pub isolation: Isolation,
    pub sync: CommitSync,
    pub no_wait: bool,
    pub status: Mutex<TxnStatus>,
}

impl TxnInner {
    pub fn state(&self) -> TxnState {
        self.status.lock().state
    }

    /// Whether anything this transaction did reached the log
    pub fn has_writes(&self) -> bool {
        let status = self.status.lock();
        status.logged || !status.undo.is_empty()
    }
}

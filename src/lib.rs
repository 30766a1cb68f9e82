//! # EmberDB
//!
//! An embedded, transactional key-value engine with:
//! - B-tree (and hash-ordered) databases on fixed-size pages
//! - A shared buffer pool with write-ahead-log ordering
//! - Key or page granularity two-phase locking with deadlock detection
//! - Nested transactions, two-phase commit preparation and crash recovery
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Environment                             │
//! │        (catalog, checkpoints, recovery, worker pool)         │
//! └──────────┬──────────────────┬───────────────────┬───────────┘
//!            │                  │                   │
//!            ▼                  ▼                   ▼
//!   ┌─────────────────┐ ┌───────────────┐  ┌────────────────┐
//!   │ Database/Cursor │ │  Transaction  │  │  Lock Manager  │
//!   │  (write path)   │ │ (undo, nest)  │  │ (waits-for)    │
//!   └────────┬────────┘ └───────┬───────┘  └────────────────┘
//!            │                  │
//!            ▼                  ▼
//!   ┌─────────────────┐ ┌───────────────┐
//!   │     B-tree      │ │      WAL      │
//!   │ (latch, pages)  │ │   (append)    │
//!   └────────┬────────┘ └───────▲───────┘
//!            │                  │ flush before write-back
//!            ▼                  │
//!   ┌─────────────────────────────────────┐
//!   │            Buffer Pool              │
//!   │   (pinned frames, LRU, page files)  │
//!   └─────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod status;

pub mod storage;
pub mod wal;
pub mod lock;

mod btree;
mod txn;
mod db;
mod env;
mod worker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use btree::TreeStat;
pub use config::{
    AccessMethod, CommitSync, Comparator, DbConfig, Duplicates, EnvConfig, Isolation,
    LockGranularity, TxnConfig, WalSyncStrategy,
};
pub use db::{Cursor, CursorPut, Database, PutFlags, SeekMode};
pub use env::{EnvStat, Environment, RecoveryStats};
pub use error::{EmberError, Result};
pub use status::{OpResult, Status};
pub use txn::{Transaction, TxnId, TxnState, NO_TXN};
pub use worker::Completion;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of EmberDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Recovery
//!
//! Runs once while an environment opens, before any handle exists:
//! 1. Analysis: catalog, winners (committed, directly or through parents),
//!    updates already compensated, and where redo starts
//! 2. Redo: install each logged page image newer than the page on disk
//! 3. Undo: roll back loser updates newest first, logging compensations,
//!    then close each loser with `Abort`
//!
//! Prepared transactions that never committed are treated as losers.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::btree::BTree;
use crate::config::{AccessMethod, Duplicates};
use crate::db::Change;
use crate::error::Result;
use crate::storage::{DbId, PageFile};
use crate::txn::{TxnId, NO_TXN};
use crate::wal::{LogRecord, Lsn, WalEntry};

use super::EnvShared;

/// What recovery found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Log records read
    pub records: usize,
    /// Databases attached from the log
    pub databases: usize,
    /// Page images installed during redo
    pub redone_pages: usize,
    /// Loser updates rolled back
    pub undone_updates: usize,
    /// Transactions committed at crash time
    pub winners: usize,
    /// Transactions rolled back
    pub losers: usize,
}

struct CatalogEntry {
    file: String,
    access_method: AccessMethod,
    duplicates: Duplicates,
    comparator: Option<String>,
}

#[derive(Default)]
struct Analysis {
    catalog: BTreeMap<DbId, CatalogEntry>,
    committed: HashSet<TxnId>,
    /// Child folded into parent by `ChildCommit`
    folded: HashMap<TxnId, TxnId>,
    aborted: HashSet<TxnId>,
    compensated: HashSet<Lsn>,
    /// Transactions that wrote something
    writers: BTreeSet<TxnId>,
    redo_from: Lsn,
    max_txn: TxnId,
}

impl Analysis {
    fn scan(entries: &[WalEntry]) -> Self {
        let mut analysis = Analysis::default();
        for entry in entries {
            analysis.max_txn = analysis.max_txn.max(entry.txn);
            match &entry.record {
                LogRecord::OpenDatabase {
                    db,
                    file,
                    access_method,
                    duplicates,
                    comparator,
                } => {
                    analysis.catalog.insert(
                        *db,
                        CatalogEntry {
                            file: file.clone(),
                            access_method: *access_method,
                            duplicates: *duplicates,
                            comparator: comparator.clone(),
                        },
                    );
                }
                LogRecord::Update { .. } => {
                    analysis.writers.insert(entry.txn);
                }
                LogRecord::Compensation { compensates, .. } => {
                    analysis.compensated.insert(*compensates);
                }
                LogRecord::Commit => {
                    analysis.committed.insert(entry.txn);
                }
                LogRecord::ChildCommit { parent } => {
                    analysis.folded.insert(entry.txn, *parent);
                }
                LogRecord::Abort => {
                    analysis.aborted.insert(entry.txn);
                }
                LogRecord::Checkpoint { .. } => analysis.redo_from = entry.lsn,
                LogRecord::Begin { .. } | LogRecord::Prepare => {}
            }
        }
        analysis
    }

    /// Whether `txn`'s updates survive: committed itself or folded into a winner
    fn is_winner(&self, txn: TxnId) -> bool {
        if txn == NO_TXN || self.committed.contains(&txn) {
            return true;
        }
        match self.folded.get(&txn) {
            Some(parent) => self.is_winner(*parent),
            None => false,
        }
    }
}

/// Attach the logged catalog and, when `recover` is set, redo and undo
pub(super) fn run(env: &Arc<EnvShared>, entries: Vec<WalEntry>, recover: bool) -> Result<RecoveryStats> {
    let analysis = Analysis::scan(&entries);
    let mut stats = RecoveryStats {
        records: entries.len(),
        ..Default::default()
    };

    // Step 1: Catalog
    {
        let mut catalog = env.catalog.lock();
        for (id, logged) in &analysis.catalog {
            catalog.reserve(*id);
            if catalog.find(&logged.file).is_some() {
                continue;
            }
            let path = env.home.join(&logged.file);
            if !path.exists() {
                tracing::warn!("database {} ({}) named in the log is missing", id, logged.file);
                continue;
            }
            let file = Arc::new(PageFile::open(&path, env.config.page_size, false, None)?);
            let meta = BTree::read_meta(&file)?;
            if meta.access_method != logged.access_method
                || meta.duplicates != logged.duplicates
                || meta.comparator != logged.comparator
            {
                tracing::warn!("database {} metadata differs from its log record, using the file", logged.file);
            }
            env.attach(&mut catalog, *id, logged.file.clone(), file, &meta)?;
            stats.databases += 1;
        }
    }
    env.txns.set_next_id(analysis.max_txn + 1);

    if !recover {
        return Ok(stats);
    }

    // Step 2: Redo
    for entry in entries.iter().filter(|e| e.lsn >= analysis.redo_from) {
        let Some((db, images)) = entry.record.images() else {
            continue;
        };
        if env.database(db).is_none() {
            continue;
        }
        for image in images {
            let mut guard = env.pool.fetch_allow_missing(db, image.page)?;
            if guard.page().lsn < entry.lsn {
                guard.install(image.node.clone(), entry.lsn);
                stats.redone_pages += 1;
            }
        }
    }

    // Step 3: Undo, newest first
    let losers: BTreeSet<TxnId> = analysis
        .writers
        .iter()
        .copied()
        .filter(|txn| !analysis.is_winner(*txn) && !analysis.aborted.contains(txn))
        .collect();
    stats.winners = analysis.writers.iter().filter(|txn| analysis.is_winner(**txn)).count();

    for entry in entries.iter().rev() {
        let LogRecord::Update { db, key, before, .. } = &entry.record else {
            continue;
        };
        if !losers.contains(&entry.txn) || analysis.compensated.contains(&entry.lsn) {
            continue;
        }
        let Some(shared) = env.database(*db) else {
            tracing::warn!("cannot undo LSN {}: database {} is missing", entry.lsn, db);
            continue;
        };

        let tree = shared.tree();
        let _latch = tree.latch().write();
        let current = tree.values(&env.pool, key)?;
        if &current != before {
            shared.apply(env, entry.txn, key, &current, before, &|_| true, Change::Compensation(entry.lsn))?;
        }
        stats.undone_updates += 1;
    }

    // Step 4: Close out the losers
    if let Some(wal) = &env.wal {
        for txn in &losers {
            wal.append(*txn, LogRecord::Abort)?;
        }
        wal.flush_all()?;
    }
    stats.losers = losers.len();

    if stats.redone_pages > 0 || stats.undone_updates > 0 {
        tracing::info!(
            "recovery: {} records, {} pages redone, {} updates undone across {} losers",
            stats.records,
            stats.redone_pages,
            stats.undone_updates,
            stats.losers
        );
    }
    Ok(stats)
}

//! Transaction table
//!
//! Hands out transaction and locker ids from one counter and tracks every
//! transaction that has not finished.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{Isolation, TxnConfig};
use crate::error::{EmberError, Result};

use super::{TxnId, TxnInner, TxnState, TxnStatus, NO_TXN};

pub(crate) struct TxnManager {
    next_id: AtomicU64,
    active: Mutex<HashMap<TxnId, Arc<TxnInner>>>,
    max: usize,
}

impl TxnManager {
    pub fn new(max: usize) -> Self {
        Self {
            next_id: AtomicU64::new(NO_TXN + 1),
            active: Mutex::new(HashMap::new()),
            max,
        }
    }

    /// Register a new transaction
    pub fn begin(
        &self,
        parent: Option<Arc<TxnInner>>,
        config: TxnConfig,
        default_isolation: Isolation,
    ) -> Result<Arc<TxnInner>> {
        let mut active = self.active.lock();
        if active.len() >= self.max {
            return Err(EmberError::CapacityExceeded(format!(
                "{} transactions already active",
                self.max
            )));
        }

        if let Some(parent) = &parent {
            let mut status = parent.status.lock();
            if status.state != TxnState::Active {
                return Err(EmberError::TxnState(format!(
                    "parent transaction {} is {:?}",
                    parent.id, status.state
                )));
            }
            status.children += 1;
        }

        let id = self.next_id();
        let isolation = config
            .isolation
            .or_else(|| parent.as_ref().map(|p| p.isolation))
            .unwrap_or(default_isolation);
        let inner = Arc::new(TxnInner {
            id,
            parent,
            isolation,
            sync: config.sync,
            no_wait: config.no_wait,
            status: Mutex::new(TxnStatus {
                state: TxnState::Active,
                undo: Vec::new(),
                logged: false,
                children: 0,
            }),
        });
        active.insert(id, inner.clone());
        Ok(inner)
    }

    /// Fresh id for a transaction or a short-lived locker
    pub fn next_id(&self) -> TxnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Continue numbering after ids found in the log
    pub fn set_next_id(&self, next: TxnId) {
        self.next_id.fetch_max(next.max(NO_TXN + 1), Ordering::Relaxed);
    }

    pub fn finish(&self, id: TxnId) {
        self.active.lock().remove(&id);
    }

    pub fn get(&self, id: TxnId) -> Option<Arc<TxnInner>> {
        self.active.lock().get(&id).cloned()
    }

    pub fn active(&self) -> Vec<Arc<TxnInner>> {
        let mut list: Vec<_> = self.active.lock().values().cloned().collect();
        list.sort_by_key(|t| t.id);
        list
    }

    pub fn active_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<_> = self.active.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// True when some unfinished transaction has records in the log
    pub fn any_logged(&self) -> bool {
        self.active.lock().values().any(|t| t.has_writes())
    }

    pub fn count(&self) -> usize {
        self.active.lock().len()
    }
}

//! Lock Module
//!
//! Transaction lock table with FIFO waiters and deadlock detection.
//!
//! ## Compatibility
//! ```text
//!            held S   held X
//! want S       ✓        ✗
//! want X       ✗        ✗
//! ```
//! Locks held by an ancestor of the requester (nested transactions) never
//! conflict with it.
//!
//! ## Deadlocks
//! Every request that has to wait triggers a search of the wait-for graph.
//! When the new edge closes a cycle, a [`DeadlockPolicy`] picks the victim,
//! whose pending request fails with `EmberError::Deadlock`.

mod deadlock;
mod table;

use std::fmt;

use crate::storage::{DbId, PageId};

pub use table::{Grant, LockManager, LockStats};

/// Identifies a lock holder (transaction id or a short-lived locker)
pub type LockerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn compatible(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// Lockable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Key { db: DbId, key: Vec<u8> },
    Page { db: DbId, page: PageId },
}

/// What a policy knows about each locker in a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimCandidate {
    pub locker: LockerId,
    /// Registration order; lower is older
    pub started: u64,
    /// Sequence number of this locker's most recent lock request
    pub last_request: u64,
    pub locks_held: usize,
    pub write_locks: usize,
}

/// Chooses which locker in a wait-for cycle to abort
pub trait DeadlockPolicy: Send + Sync + fmt::Debug {
    /// `cycle` is never empty; the returned id must be one of its lockers
    fn select_victim(&self, cycle: &[VictimCandidate]) -> LockerId;
}

/// Built-in victim selection rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectPolicy {
    /// The locker that most recently requested a lock
    #[default]
    Default,
    Youngest,
    Oldest,
    MinLocks,
    MaxLocks,
    MinWrite,
    MaxWrite,
}

impl DeadlockPolicy for DetectPolicy {
    fn select_victim(&self, cycle: &[VictimCandidate]) -> LockerId {
        // Ties go to the youngest locker
        let key = |c: &VictimCandidate| -> (i128, u64) {
            let score = match self {
                DetectPolicy::Default => c.last_request as i128,
                DetectPolicy::Youngest => c.started as i128,
                DetectPolicy::Oldest => -(c.started as i128),
                DetectPolicy::MinLocks => -(c.locks_held as i128),
                DetectPolicy::MaxLocks => c.locks_held as i128,
                DetectPolicy::MinWrite => -(c.write_locks as i128),
                DetectPolicy::MaxWrite => c.write_locks as i128,
            };
            (score, c.started)
        };

        cycle
            .iter()
            .max_by_key(|c| key(c))
            .map(|c| c.locker)
            .unwrap_or_default()
    }
}

//! Lock table
//!
//! ## Concurrency:
//! - All bookkeeping lives behind one mutex
//! - Blocked requests sleep on a shared condvar and re-check on every change

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{EmberError, Result};

use super::deadlock::WaitForGraph;
use super::{DeadlockPolicy, LockMode, LockerId, ResourceId, VictimCandidate};

/// Outcome of a successful request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// The lock (or a stronger one) was already held
    AlreadyHeld,
    /// Newly granted or promoted
    Granted,
}

/// Snapshot of the lock table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    pub lockers: usize,
    pub objects: usize,
    pub held: usize,
    pub waiting: usize,
    pub deadlocks: u64,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    locker: LockerId,
    mode: LockMode,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    locker: LockerId,
    mode: LockMode,
    /// S→X promotion; ignores waiters queued behind the current holders
    upgrade: bool,
}

#[derive(Debug, Default)]
struct LockObject {
    holders: Vec<Holder>,
    waiters: VecDeque<Waiter>,
}

impl LockObject {
    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

#[derive(Debug)]
struct LockerInfo {
    parent: Option<LockerId>,
    started: u64,
    last_request: u64,
    held: HashMap<ResourceId, LockMode>,
    victim: bool,
}

#[derive(Debug, Default)]
struct LockState {
    objects: HashMap<ResourceId, LockObject>,
    lockers: HashMap<LockerId, LockerInfo>,
    seq: u64,
    deadlocks: u64,
}

/// Environment-wide lock manager
pub struct LockManager {
    state: Mutex<LockState>,
    cond: Condvar,
    policy: Arc<dyn DeadlockPolicy>,
    max_lockers: usize,
    max_objects: usize,
    timeout: Option<Duration>,
}

impl LockManager {
    pub fn new(
        max_lockers: usize,
        max_objects: usize,
        timeout: Option<Duration>,
        policy: Arc<dyn DeadlockPolicy>,
    ) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            policy,
            max_lockers,
            max_objects,
            timeout,
        }
    }

    /// Register a locker, optionally as the child of another
    pub fn register(&self, locker: LockerId, parent: Option<LockerId>) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_locker(&mut state, locker)?;
        if let Some(info) = state.lockers.get_mut(&locker) {
            info.parent = parent;
        }
        Ok(())
    }

    /// Acquire a lock, blocking until granted, deadlocked or timed out
    ///
    /// With `no_wait` a request that cannot be granted at once fails with
    /// `LockTimeout` instead of queueing.
    pub fn acquire(
        &self,
        locker: LockerId,
        resource: &ResourceId,
        mode: LockMode,
        no_wait: bool,
    ) -> Result<Grant> {
        let mut state = self.state.lock();
        self.ensure_locker(&mut state, locker)?;
        state.seq += 1;
        let seq = state.seq;

        let held = match state.lockers.get_mut(&locker) {
            Some(info) => {
                info.last_request = seq;
                info.held.get(resource).copied()
            }
            None => None,
        };
        if matches!(held, Some(h) if h >= mode) {
            return Ok(Grant::AlreadyHeld);
        }
        let upgrade = held.is_some();

        if !state.objects.contains_key(resource) && state.objects.len() >= self.max_objects {
            return Err(EmberError::CapacityExceeded(format!(
                "lock table holds {} objects",
                self.max_objects
            )));
        }

        let queued = state.objects.get(resource).map_or(0, |o| o.waiters.len());
        if Self::grantable(&state, resource, locker, mode, upgrade, queued) {
            Self::grant(&mut state, locker, resource, mode);
            return Ok(Grant::Granted);
        }
        if no_wait {
            return Err(EmberError::LockTimeout);
        }

        let waiter = Waiter {
            locker,
            mode,
            upgrade,
        };
        let object = state.objects.entry(resource.clone()).or_default();
        if upgrade {
            object.waiters.push_front(waiter);
        } else {
            object.waiters.push_back(waiter);
        }

        if let Some(victim) = self.detect(&state, locker) {
            state.deadlocks += 1;
            if victim == locker {
                tracing::debug!("locker {} is the deadlock victim", locker);
                Self::dequeue(&mut state, locker, resource);
                self.cond.notify_all();
                return Err(EmberError::Deadlock(locker));
            }
            tracing::debug!("locker {} chosen as deadlock victim by {}", victim, locker);
            if let Some(info) = state.lockers.get_mut(&victim) {
                info.victim = true;
            }
            self.cond.notify_all();
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            let timed_out = match deadline {
                Some(deadline) => self.cond.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.cond.wait(&mut state);
                    false
                }
            };

            let victim = state.lockers.get(&locker).map_or(false, |info| info.victim);
            if victim {
                if let Some(info) = state.lockers.get_mut(&locker) {
                    info.victim = false;
                }
                Self::dequeue(&mut state, locker, resource);
                self.cond.notify_all();
                return Err(EmberError::Deadlock(locker));
            }

            let position = state
                .objects
                .get(resource)
                .and_then(|o| o.waiters.iter().position(|w| w.locker == locker))
                .unwrap_or(0);
            if Self::grantable(&state, resource, locker, mode, upgrade, position) {
                Self::dequeue(&mut state, locker, resource);
                Self::grant(&mut state, locker, resource, mode);
                self.cond.notify_all();
                return Ok(Grant::Granted);
            }

            if timed_out {
                Self::dequeue(&mut state, locker, resource);
                self.cond.notify_all();
                return Err(EmberError::LockTimeout);
            }
        }
    }

    /// Acquire only if it can be granted immediately
    pub fn try_acquire(&self, locker: LockerId, resource: &ResourceId, mode: LockMode) -> Result<bool> {
        match self.acquire(locker, resource, mode, true) {
            Ok(_) => Ok(true),
            Err(EmberError::LockTimeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn release(&self, locker: LockerId, resource: &ResourceId) {
        let mut state = self.state.lock();
        if let Some(info) = state.lockers.get_mut(&locker) {
            info.held.remove(resource);
        }
        Self::drop_holder(&mut state, locker, resource);
        self.cond.notify_all();
    }

    /// Release every lock of `locker` and forget it
    pub fn release_all(&self, locker: LockerId) {
        let mut state = self.state.lock();
        let Some(info) = state.lockers.remove(&locker) else {
            return;
        };
        for resource in info.held.keys() {
            Self::drop_holder(&mut state, locker, resource);
        }
        self.cond.notify_all();
    }

    /// Transfer every lock of `child` to `parent` and forget the child
    pub fn inherit(&self, child: LockerId, parent: LockerId) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_locker(&mut state, parent)?;
        let Some(info) = state.lockers.remove(&child) else {
            return Ok(());
        };

        for (resource, mode) in info.held {
            if let Some(object) = state.objects.get_mut(&resource) {
                object.holders.retain(|h| h.locker != child);
                match object.holders.iter_mut().find(|h| h.locker == parent) {
                    Some(holder) => holder.mode = holder.mode.max(mode),
                    None => object.holders.push(Holder {
                        locker: parent,
                        mode,
                    }),
                }
            }
            if let Some(parent_info) = state.lockers.get_mut(&parent) {
                let entry = parent_info.held.entry(resource).or_insert(mode);
                *entry = (*entry).max(mode);
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Mode `locker` holds on `resource`, if any
    pub fn held_mode(&self, locker: LockerId, resource: &ResourceId) -> Option<LockMode> {
        let state = self.state.lock();
        state
            .lockers
            .get(&locker)
            .and_then(|info| info.held.get(resource).copied())
    }

    pub fn stats(&self) -> LockStats {
        let state = self.state.lock();
        LockStats {
            lockers: state.lockers.len(),
            objects: state.objects.len(),
            held: state.objects.values().map(|o| o.holders.len()).sum(),
            waiting: state.objects.values().map(|o| o.waiters.len()).sum(),
            deadlocks: state.deadlocks,
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_locker(&self, state: &mut LockState, locker: LockerId) -> Result<()> {
        if state.lockers.contains_key(&locker) {
            return Ok(());
        }
        if state.lockers.len() >= self.max_lockers {
            return Err(EmberError::CapacityExceeded(format!(
                "lock table holds {} lockers",
                self.max_lockers
            )));
        }
        state.seq += 1;
        let started = state.seq;
        state.lockers.insert(
            locker,
            LockerInfo {
                parent: None,
                started,
                last_request: started,
                held: HashMap::new(),
                victim: false,
            },
        );
        Ok(())
    }

    /// True if `ancestor` is a (transitive) parent of `locker`
    fn is_ancestor(state: &LockState, ancestor: LockerId, locker: LockerId) -> bool {
        let mut current = state.lockers.get(&locker).and_then(|i| i.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = state.lockers.get(&id).and_then(|i| i.parent);
        }
        false
    }

    fn conflicts(
        state: &LockState,
        locker: LockerId,
        mode: LockMode,
        other: LockerId,
        other_mode: LockMode,
    ) -> bool {
        other != locker && !Self::is_ancestor(state, other, locker) && !mode.compatible(other_mode)
    }

    /// Can `locker` take `mode` while `ahead` waiters are queued before it?
    fn grantable(
        state: &LockState,
        resource: &ResourceId,
        locker: LockerId,
        mode: LockMode,
        upgrade: bool,
        ahead: usize,
    ) -> bool {
        let Some(object) = state.objects.get(resource) else {
            return true;
        };
        if object
            .holders
            .iter()
            .any(|h| Self::conflicts(state, locker, mode, h.locker, h.mode))
        {
            return false;
        }
        if upgrade {
            return true;
        }
        !object
            .waiters
            .iter()
            .take(ahead)
            .any(|w| Self::conflicts(state, locker, mode, w.locker, w.mode))
    }

    fn grant(state: &mut LockState, locker: LockerId, resource: &ResourceId, mode: LockMode) {
        let object = state.objects.entry(resource.clone()).or_default();
        match object.holders.iter_mut().find(|h| h.locker == locker) {
            Some(holder) => holder.mode = holder.mode.max(mode),
            None => object.holders.push(Holder { locker, mode }),
        }
        if let Some(info) = state.lockers.get_mut(&locker) {
            let entry = info.held.entry(resource.clone()).or_insert(mode);
            *entry = (*entry).max(mode);
        }
    }

    fn dequeue(state: &mut LockState, locker: LockerId, resource: &ResourceId) {
        if let Some(object) = state.objects.get_mut(resource) {
            object.waiters.retain(|w| w.locker != locker);
            if object.is_idle() {
                state.objects.remove(resource);
            }
        }
    }

    fn drop_holder(state: &mut LockState, locker: LockerId, resource: &ResourceId) {
        if let Some(object) = state.objects.get_mut(resource) {
            object.holders.retain(|h| h.locker != locker);
            if object.is_idle() {
                state.objects.remove(resource);
            }
        }
    }

    /// Victim for a cycle through `requester`, if one exists
    fn detect(&self, state: &LockState, requester: LockerId) -> Option<LockerId> {
        let mut graph = WaitForGraph::default();
        for object in state.objects.values() {
            for (index, waiter) in object.waiters.iter().enumerate() {
                if state.lockers.get(&waiter.locker).map_or(false, |i| i.victim) {
                    continue;
                }
                for holder in &object.holders {
                    if Self::conflicts(state, waiter.locker, waiter.mode, holder.locker, holder.mode) {
                        graph.add_edge(waiter.locker, holder.locker);
                    }
                }
                if waiter.upgrade {
                    continue;
                }
                for ahead in object.waiters.iter().take(index) {
                    if Self::conflicts(state, waiter.locker, waiter.mode, ahead.locker, ahead.mode) {
                        graph.add_edge(waiter.locker, ahead.locker);
                    }
                }
            }
        }

        let cycle = graph.cycle_through(requester)?;
        let candidates: Vec<VictimCandidate> = cycle
            .iter()
            .filter_map(|id| {
                state.lockers.get(id).map(|info| VictimCandidate {
                    locker: *id,
                    started: info.started,
                    last_request: info.last_request,
                    locks_held: info.held.len(),
                    write_locks: info
                        .held
                        .values()
                        .filter(|m| **m == LockMode::Exclusive)
                        .count(),
                })
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let victim = self.policy.select_victim(&candidates);
        if candidates.iter().any(|c| c.locker == victim) {
            Some(victim)
        } else {
            Some(requester)
        }
    }
}

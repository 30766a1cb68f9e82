//! Checkpoints
//!
//! A checkpoint quiesces page mutation through the gate, forces the log,
//! writes every dirty page and records a `Checkpoint`. When no transaction
//! has logged anything the log is cut back to just that record plus the
//! catalog, so recovery never replays what is already on disk.

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::txn::NO_TXN;
use crate::wal::{LogRecord, Lsn};

use super::EnvShared;

pub(crate) struct CheckpointState {
    last: Instant,
    count: u64,
    last_lsn: Lsn,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            count: 0,
            last_lsn: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }
}

impl EnvShared {
    /// Take a checkpoint now; returns the LSN of its record
    pub(crate) fn checkpoint(&self) -> Result<Lsn> {
        self.check_open()?;
        let mut state = self.checkpoint.lock();
        self.checkpoint_locked(&mut state)
    }

    /// Checkpoint when enough log or time has accumulated
    pub(crate) fn checkpoint_if(&self, kbytes: u64, minutes: u64) -> Result<bool> {
        self.check_open()?;
        let interval = (minutes > 0).then(|| Duration::from_secs(minutes * 60));
        let mut state = self.checkpoint.lock();
        if (kbytes > 0 || interval.is_some()) && !self.due(&state, kbytes, interval) {
            return Ok(false);
        }
        self.checkpoint_locked(&mut state)?;
        Ok(true)
    }

    /// Checkpoint per the configured thresholds, if nobody else is already
    pub(crate) fn maybe_checkpoint(&self) {
        let kbytes = self.config.checkpoint_kbytes;
        let interval = self.config.checkpoint_interval;
        if kbytes == 0 && interval.is_none() {
            return;
        }
        let Some(mut state) = self.checkpoint.try_lock() else {
            return;
        };
        if !self.due(&state, kbytes, interval) {
            return;
        }
        if let Err(e) = self.checkpoint_locked(&mut state) {
            tracing::warn!("automatic checkpoint failed: {}", e);
        }
    }

    fn due(&self, state: &CheckpointState, kbytes: u64, interval: Option<Duration>) -> bool {
        let by_size = kbytes > 0
            && self
                .wal
                .as_ref()
                .map_or(false, |wal| wal.bytes_since_checkpoint() >= kbytes * 1024);
        let by_time = interval.map_or(false, |interval| state.last.elapsed() >= interval);
        by_size || by_time
    }

    fn checkpoint_locked(&self, state: &mut CheckpointState) -> Result<Lsn> {
        let _gate = self.gate.write();

        // Step 1: Log before pages
        if let Some(wal) = &self.wal {
            wal.flush_all()?;
        }

        // Step 2: Every dirty page, each file synced
        let written = self.pool.flush_all()?;

        // Step 3: Record it, cutting the log when nothing depends on it
        let mut truncated = false;
        let lsn = match &self.wal {
            Some(wal) if !self.txns.any_logged() => {
                let mut records = vec![LogRecord::Checkpoint { active: Vec::new() }];
                records.extend(self.catalog.lock().databases().map(|db| LogRecord::OpenDatabase {
                    db: db.id(),
                    file: db.name().to_string(),
                    access_method: db.access_method(),
                    duplicates: db.duplicates(),
                    comparator: db.comparator().map(str::to_string),
                }));
                truncated = true;
                wal.truncate_with(NO_TXN, records)?
            }
            Some(wal) => {
                let lsn = wal.append(
                    NO_TXN,
                    LogRecord::Checkpoint {
                        active: self.txns.active_ids(),
                    },
                )?;
                wal.flush(lsn)?;
                lsn
            }
            None => 0,
        };
        if let Some(wal) = &self.wal {
            wal.reset_checkpoint_bytes();
        }

        state.last = Instant::now();
        state.count += 1;
        state.last_lsn = lsn;
        tracing::info!(
            "checkpoint at LSN {}: {} pages written{}",
            lsn,
            written,
            if truncated { ", log truncated" } else { "" }
        );
        Ok(lsn)
    }
}

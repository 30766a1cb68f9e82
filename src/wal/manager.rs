//! Log Manager
//!
//! Environment-wide handle on the WAL: serialized appends, group flushes
//! and the durable-LSN watermark the buffer pool consults before evicting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::WalSyncStrategy;
use crate::error::{EmberError, Result};
use crate::txn::TxnId;

use super::{LogRecord, Lsn, WalEntry, WalReader, WalWriter};

/// Shared write-ahead log
pub struct LogManager {
    path: PathBuf,

    /// Exclusive access for appends and fsync
    writer: Mutex<WalWriter>,

    /// Mirror of the writer's durable LSN, readable without the mutex
    durable_lsn: AtomicU64,

    /// Set once a flush failed; durability can no longer be promised
    failed: AtomicBool,
}

impl LogManager {
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy, mode: Option<u32>) -> Result<Self> {
        let writer = WalWriter::open_with_mode(path, sync_strategy, mode)?;
        let durable = writer.durable_lsn();
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            durable_lsn: AtomicU64::new(durable),
            failed: AtomicBool::new(false),
        })
    }

    /// Append a record; returns its LSN
    pub fn append(&self, txn: TxnId, record: LogRecord) -> Result<Lsn> {
        self.check_healthy()?;
        let mut writer = self.writer.lock();
        let lsn = writer.append(txn, record)?;
        self.durable_lsn.store(writer.durable_lsn(), Ordering::Release);
        Ok(lsn)
    }

    /// Make every record up to `upto` durable
    ///
    /// Callers racing on the mutex piggyback on whichever flush lands first.
    pub fn flush(&self, upto: Lsn) -> Result<()> {
        if self.durable_lsn.load(Ordering::Acquire) >= upto {
            return Ok(());
        }
        self.check_healthy()?;

        let mut writer = self.writer.lock();
        if writer.durable_lsn() >= upto {
            return Ok(());
        }
        match writer.sync() {
            Ok(()) => {
                self.durable_lsn.store(writer.durable_lsn(), Ordering::Release);
                Ok(())
            }
            Err(e) => {
                tracing::error!("WAL flush up to LSN {} failed: {}", upto, e);
                self.failed.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Flush everything appended so far
    pub fn flush_all(&self) -> Result<()> {
        let last = self.last_lsn();
        self.flush(last)
    }

    /// Push buffered records to the OS (commit under a non-syncing strategy)
    pub fn flush_buffer(&self) -> Result<()> {
        self.writer.lock().flush_buffer()
    }

    /// Records with LSN >= `from`, in order
    pub fn iterate(&self, from: Lsn) -> Result<Vec<WalEntry>> {
        self.writer.lock().flush_buffer()?;

        let mut reader = WalReader::open(&self.path)?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry()? {
            if entry.lsn >= from {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Empty the log and re-seed it with `records` (LSNs keep increasing)
    ///
    /// Returns the LSN of the first record written.
    pub fn truncate_with(&self, txn: TxnId, records: Vec<LogRecord>) -> Result<Lsn> {
        self.check_healthy()?;
        let mut writer = self.writer.lock();
        writer.sync()?;
        writer.truncate()?;
        let first = writer.current_lsn();
        for record in records {
            writer.append(txn, record)?;
        }
        writer.sync()?;
        self.durable_lsn.store(writer.durable_lsn(), Ordering::Release);
        Ok(first)
    }

    /// Ensure future LSNs exceed `lsn` (pages on disk may be ahead of a reset log)
    pub fn advance_to(&self, lsn: Lsn) {
        self.writer.lock().advance_to(lsn);
    }

    pub fn last_lsn(&self) -> Lsn {
        self.writer.lock().last_lsn()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    pub fn sync_strategy(&self) -> WalSyncStrategy {
        self.writer.lock().sync_strategy()
    }

    /// Bytes appended since the last checkpoint
    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.writer.lock().bytes_written()
    }

    pub fn reset_checkpoint_bytes(&self) {
        self.writer.lock().reset_bytes_written();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_healthy(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(EmberError::RunRecovery(
                "a previous log flush failed".to_string(),
            ));
        }
        Ok(())
    }
}

//! WAL Writer
//!
//! Handles appending entries to the WAL file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::WalSyncStrategy;
use crate::error::{EmberError, Result};
use crate::storage::set_mode;
use crate::txn::TxnId;

use super::{LogRecord, Lsn, WalEntry, WalReader};

/// Writes entries to the WAL file
pub struct WalWriter {
    path: PathBuf,

    /// Buffered writer positioned at the end of the valid log
    file: BufWriter<File>,

    /// LSN the next append will receive
    next_lsn: Lsn,

    /// Highest LSN known to be on stable storage
    durable_lsn: Lsn,

    sync_strategy: WalSyncStrategy,

    /// Entries appended since the last fsync
    unsynced_entries: usize,

    /// Bytes appended since the last `reset_bytes_written`
    bytes_written: u64,
}

impl WalWriter {
    /// Open or create a WAL file
    ///
    /// Existing entries are scanned so LSNs continue where the log left off;
    /// a torn tail is cut before appending.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        Self::open_with_mode(path, sync_strategy, None)
    }

    /// Open or create a WAL file with explicit permission bits
    pub fn open_with_mode(
        path: &Path,
        sync_strategy: WalSyncStrategy,
        mode: Option<u32>,
    ) -> Result<Self> {
        let mut last_lsn = 0;
        let mut valid_end = 0;

        if path.exists() {
            let mut reader = WalReader::open(path)?;
            loop {
                match reader.next_entry() {
                    Ok(Some(entry)) if entry.lsn > last_lsn => {
                        last_lsn = entry.lsn;
                        valid_end = reader.position();
                    }
                    Ok(Some(_)) | Ok(None) | Err(EmberError::WalCorruption(_)) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true);
        set_mode(&mut options, mode);

        let mut file = options.open(path)?;
        if file.metadata()?.len() > valid_end {
            file.set_len(valid_end)?;
        }
        file.seek(SeekFrom::Start(valid_end))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            next_lsn: last_lsn + 1,
            durable_lsn: last_lsn,
            sync_strategy,
            unsynced_entries: 0,
            bytes_written: 0,
        })
    }

    /// Append a record to the WAL, returning its LSN
    pub fn append(&mut self, txn: TxnId, record: LogRecord) -> Result<Lsn> {
        let lsn = self.next_lsn;
        let entry = WalEntry::new(lsn, txn, record);
        let bytes = entry.serialize()?;

        self.file.write_all(&bytes)?;
        self.next_lsn += 1;
        self.unsynced_entries += 1;
        self.bytes_written += bytes.len() as u64;

        if let WalSyncStrategy::EveryNEntries { count } = self.sync_strategy {
            if self.unsynced_entries >= count {
                self.sync()?;
            }
        }

        Ok(lsn)
    }

    /// Push buffered entries to the OS without fsync
    pub fn flush_buffer(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.durable_lsn = self.next_lsn - 1;
        self.unsynced_entries = 0;
        Ok(())
    }

    /// Discard every entry; LSNs keep increasing
    pub fn truncate(&mut self) -> Result<()> {
        self.file.flush()?;
        let file = self.file.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_all()?;
        self.unsynced_entries = 0;
        Ok(())
    }

    /// Get the LSN the next append will receive
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// LSN of the last appended entry (0 if none)
    pub fn last_lsn(&self) -> Lsn {
        self.next_lsn - 1
    }

    /// Highest LSN on stable storage
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn
    }

    /// Never hand out an LSN at or below `lsn`
    pub fn advance_to(&mut self, lsn: Lsn) {
        if self.next_lsn <= lsn {
            self.next_lsn = lsn + 1;
        }
    }

    pub fn sync_strategy(&self) -> WalSyncStrategy {
        self.sync_strategy
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn reset_bytes_written(&mut self) {
        self.bytes_written = 0;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

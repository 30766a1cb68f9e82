//! WAL Recovery
//!
//! Scans the WAL after a crash, keeping the longest valid prefix.

use std::fs::OpenOptions;
use std::path::Path;

use crate::error::{EmberError, Result};

use super::{Lsn, WalEntry, WalReader};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted entries found (everything after them is dropped)
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: Lsn,

    /// Whether the WAL was truncated (partial writes removed)
    pub was_truncated: bool,
}

impl WalRecovery {
    /// Recover entries from a WAL file
    ///
    /// This will:
    /// 1. Read all valid entries
    /// 2. Stop at the first torn, corrupted or out-of-order entry
    /// 3. Truncate the file to the valid prefix
    /// 4. Return all valid entries in order
    pub fn recover(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let (entries, valid_end, result) = Self::scan(path)?;

        if result.was_truncated {
            tracing::warn!(
                "WAL tail truncated at offset {} after LSN {}",
                valid_end,
                result.last_lsn
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        Ok((entries, result))
    }

    /// Verify integrity of a WAL file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let (_, _, result) = Self::scan(path)?;
        Ok(result)
    }

    fn scan(path: &Path) -> Result<(Vec<WalEntry>, u64, RecoveryResult)> {
        let file_len = std::fs::metadata(path)?.len();
        let mut reader = WalReader::open(path)?;
        let mut entries = Vec::new();
        let mut result = RecoveryResult::default();
        let mut valid_end = 0u64;

        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    if entry.lsn <= result.last_lsn {
                        tracing::warn!(
                            "WAL LSN went backwards ({} after {}), treating as corruption",
                            entry.lsn,
                            result.last_lsn
                        );
                        result.entries_corrupted += 1;
                        break;
                    }
                    result.last_lsn = entry.lsn;
                    result.entries_recovered += 1;
                    valid_end = reader.position();
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(EmberError::WalCorruption(msg)) => {
                    tracing::warn!("WAL corruption: {}", msg);
                    result.entries_corrupted += 1;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        result.was_truncated = valid_end < file_len;

        Ok((entries, valid_end, result))
    }
}

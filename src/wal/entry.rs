//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their framing.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::{AccessMethod, Duplicates};
use crate::error::{EmberError, Result};
use crate::storage::{DbId, Node, PageId};
use crate::txn::TxnId;

use super::Lsn;

/// Frame header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Largest payload a frame may claim (guards against garbage lengths)
pub const MAX_PAYLOAD_SIZE: u32 = 256 * 1024 * 1024;

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: Lsn,

    /// Owning transaction (`NO_TXN` for non-transactional records)
    pub txn: TxnId,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,

    /// The logged event
    pub record: LogRecord,
}

/// After-image of one page touched by an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageImage {
    pub page: PageId,
    pub node: Node,
}

/// Events that can be logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// First write of a transaction
    Begin { parent: Option<TxnId> },

    /// Logical change of one key plus the page images it produced
    Update {
        db: DbId,
        key: Vec<u8>,
        before: Vec<Vec<u8>>,
        after: Vec<Vec<u8>>,
        images: Vec<PageImage>,
    },

    /// Undo of an earlier update; redo-only
    Compensation {
        db: DbId,
        key: Vec<u8>,
        compensates: Lsn,
        images: Vec<PageImage>,
    },

    Commit,

    /// Nested transaction folded into its parent
    ChildCommit { parent: TxnId },

    Prepare,

    Abort,

    /// All pages dirtied before this record are on disk
    Checkpoint { active: Vec<TxnId> },

    /// Binds a database id to its file for the rest of the log
    OpenDatabase {
        db: DbId,
        file: String,
        access_method: AccessMethod,
        duplicates: Duplicates,
        comparator: Option<String>,
    },
}

impl LogRecord {
    /// Page images carried by the record, if any
    pub fn images(&self) -> Option<(DbId, &[PageImage])> {
        match self {
            LogRecord::Update { db, images, .. } | LogRecord::Compensation { db, images, .. } => {
                Some((*db, images.as_slice()))
            }
            _ => None,
        }
    }

    /// Short name for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Begin { .. } => "begin",
            LogRecord::Update { .. } => "update",
            LogRecord::Compensation { .. } => "compensation",
            LogRecord::Commit => "commit",
            LogRecord::ChildCommit { .. } => "child-commit",
            LogRecord::Prepare => "prepare",
            LogRecord::Abort => "abort",
            LogRecord::Checkpoint { .. } => "checkpoint",
            LogRecord::OpenDatabase { .. } => "open-database",
        }
    }
}

impl WalEntry {
    /// Create an entry stamped with the current time
    pub fn new(lsn: Lsn, txn: TxnId, record: LogRecord) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            lsn,
            txn,
            timestamp,
            record,
        }
    }

    /// Encode as `[LSN][CRC][LEN][payload]`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(EmberError::InvalidArgument(format!(
                "WAL record of {} bytes exceeds the frame limit",
                payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u64_le(self.lsn);
        buf.put_u32_le(crc32fast::hash(&payload));
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.to_vec())
    }

    /// Decode one frame, verifying length, checksum and LSN
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (lsn, crc, len) = Self::parse_header(bytes)?;

        let end = HEADER_SIZE + len as usize;
        if bytes.len() < end {
            return Err(EmberError::WalCorruption(format!(
                "truncated payload: need {} bytes, have {}",
                end,
                bytes.len()
            )));
        }

        let payload = &bytes[HEADER_SIZE..end];
        let actual = crc32fast::hash(payload);
        if actual != crc {
            return Err(EmberError::WalCorruption(format!(
                "CRC mismatch at LSN {}: expected {:08x}, got {:08x}",
                lsn, crc, actual
            )));
        }

        let entry: WalEntry = bincode::deserialize(payload)
            .map_err(|e| EmberError::WalCorruption(format!("undecodable payload: {}", e)))?;

        if entry.lsn != lsn {
            return Err(EmberError::WalCorruption(format!(
                "header LSN {} disagrees with payload LSN {}",
                lsn, entry.lsn
            )));
        }

        Ok(entry)
    }

    /// Parse `(lsn, crc, payload_len)` from the first HEADER_SIZE bytes
    pub fn parse_header(bytes: &[u8]) -> Result<(Lsn, u32, u32)> {
        if bytes.len() < HEADER_SIZE {
            return Err(EmberError::WalCorruption(format!(
                "truncated header: {} bytes",
                bytes.len()
            )));
        }

        let mut header = &bytes[..HEADER_SIZE];
        let lsn = header.get_u64_le();
        let crc = header.get_u32_le();
        let len = header.get_u32_le();

        if len > MAX_PAYLOAD_SIZE {
            return Err(EmberError::WalCorruption(format!(
                "implausible payload length {} at LSN {}",
                len, lsn
            )));
        }

        Ok((lsn, crc, len))
    }
}

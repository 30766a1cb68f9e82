//! Tests for WAL Entry
//!
//! These tests verify:
//! - Frame layout `[LSN][CRC][LEN][payload]`
//! - Checksum and length validation on decode
//! - Record helpers (page images, kind names)

use emberdb::storage::{LeafNode, Node};
use emberdb::wal::{LogRecord, PageImage, WalEntry, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use emberdb::{EmberError, NO_TXN};

// =============================================================================
// Helper Functions
// =============================================================================

fn update(key: &[u8], value: &[u8]) -> LogRecord {
    LogRecord::Update {
        db: 1,
        key: key.to_vec(),
        before: Vec::new(),
        after: vec![value.to_vec()],
        images: Vec::new(),
    }
}

// =============================================================================
// Framing Tests
// =============================================================================

#[test]
fn test_header_carries_lsn_and_length() {
    let entry = WalEntry::new(42, 7, update(b"key", b"value"));
    let bytes = entry.serialize().unwrap();

    let (lsn, _crc, len) = WalEntry::parse_header(&bytes).unwrap();
    assert_eq!(lsn, 42);
    assert_eq!(len as usize, bytes.len() - HEADER_SIZE);
}

#[test]
fn test_decode_returns_same_entry() {
    let entry = WalEntry::new(3, 9, LogRecord::Begin { parent: Some(2) });
    let decoded = WalEntry::deserialize(&entry.serialize().unwrap()).unwrap();

    assert_eq!(decoded, entry);
    assert_eq!(decoded.txn, 9);
}

#[test]
fn test_entry_records_timestamp() {
    let entry = WalEntry::new(1, NO_TXN, LogRecord::Commit);
    assert!(entry.timestamp > 0);
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_flipped_payload_byte_fails_crc() {
    let mut bytes = WalEntry::new(1, 1, update(b"k", b"v")).serialize().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    let err = WalEntry::deserialize(&bytes).unwrap_err();
    assert!(matches!(err, EmberError::WalCorruption(_)));
}

#[test]
fn test_short_header_rejected() {
    let err = WalEntry::parse_header(&[0u8; HEADER_SIZE - 1]).unwrap_err();
    assert!(matches!(err, EmberError::WalCorruption(_)));
}

#[test]
fn test_truncated_payload_rejected() {
    let mut bytes = WalEntry::new(1, 1, update(b"key", b"value")).serialize().unwrap();
    bytes.truncate(HEADER_SIZE + 2);

    let err = WalEntry::deserialize(&bytes).unwrap_err();
    assert!(matches!(err, EmberError::WalCorruption(_)));
}

#[test]
fn test_implausible_length_rejected() {
    let mut bytes = WalEntry::new(1, 1, LogRecord::Commit).serialize().unwrap();
    bytes[12..16].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_le_bytes());

    let err = WalEntry::parse_header(&bytes).unwrap_err();
    assert!(matches!(err, EmberError::WalCorruption(_)));
}

#[test]
fn test_header_lsn_must_match_payload() {
    let mut bytes = WalEntry::new(5, 1, LogRecord::Abort).serialize().unwrap();
    bytes[0..8].copy_from_slice(&6u64.to_le_bytes());

    let err = WalEntry::deserialize(&bytes).unwrap_err();
    assert!(matches!(err, EmberError::WalCorruption(_)));
}

// =============================================================================
// Record Helper Tests
// =============================================================================

#[test]
fn test_images_only_on_page_changing_records() {
    let image = PageImage {
        page: 3,
        node: Node::Leaf(LeafNode::default()),
    };
    let record = LogRecord::Compensation {
        db: 2,
        key: b"k".to_vec(),
        compensates: 10,
        images: vec![image.clone()],
    };

    let (db, images) = record.images().unwrap();
    assert_eq!(db, 2);
    assert_eq!(images, &[image]);

    assert!(LogRecord::Commit.images().is_none());
    assert!(LogRecord::Checkpoint { active: vec![1] }.images().is_none());
}

#[test]
fn test_kind_names() {
    assert_eq!(update(b"k", b"v").kind(), "update");
    assert_eq!(LogRecord::ChildCommit { parent: 1 }.kind(), "child-commit");
    assert_eq!(LogRecord::Prepare.kind(), "prepare");
}

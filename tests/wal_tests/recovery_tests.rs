//! Tests for WAL Recovery
//!
//! These tests verify:
//! - Recovery from a clean WAL (no corruption)
//! - Recovery from an empty WAL
//! - Recovery with partial writes (truncated tail)
//! - Recovery with corrupted entries (CRC mismatch)
//! - Verify mode (stats only, file untouched)

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use emberdb::config::WalSyncStrategy;
use emberdb::wal::{LogRecord, WalEntry, WalRecovery, WalWriter};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("test.wal");
    (temp_dir, wal_path)
}

/// Write entries using WalWriter (produces a well-formed WAL)
fn write_entries_via_writer(path: &PathBuf, count: usize) {
    let mut writer = WalWriter::open(path, WalSyncStrategy::EveryCommit).unwrap();
    for i in 0..count {
        writer
            .append(
                1,
                LogRecord::Update {
                    db: 1,
                    key: format!("key{}", i).into_bytes(),
                    before: Vec::new(),
                    after: vec![format!("value{}", i).into_bytes()],
                    images: Vec::new(),
                },
            )
            .unwrap();
    }
    writer.sync().unwrap();
}

/// Write raw serialized entries directly to a file (for crafting corruption)
fn write_raw(path: &PathBuf, chunks: &[Vec<u8>]) {
    let mut file = File::create(path).unwrap();
    for chunk in chunks {
        file.write_all(chunk).unwrap();
    }
    file.sync_all().unwrap();
}

fn frame(lsn: u64) -> Vec<u8> {
    WalEntry::new(lsn, 1, LogRecord::Commit).serialize().unwrap()
}

// =============================================================================
// Recover: Clean WAL Tests
// =============================================================================

#[test]
fn test_recover_empty_file() {
    let (_temp, wal_path) = setup_temp_wal();
    File::create(&wal_path).unwrap();

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result.entries_recovered, 0);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(result.last_lsn, 0);
    assert!(!result.was_truncated);
}

#[test]
fn test_recover_multiple_entries() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 10);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert_eq!(entries.len(), 10);
    assert_eq!(result.entries_recovered, 10);
    assert_eq!(result.last_lsn, 10);
    assert!(!result.was_truncated);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.lsn, (i + 1) as u64);
        assert_eq!(entry.record.kind(), "update");
    }
}

// =============================================================================
// Recover: Partial Write Tests (was_truncated = true)
// =============================================================================

#[test]
fn test_recover_partial_header_at_tail() {
    let (_temp, wal_path) = setup_temp_wal();
    write_raw(&wal_path, &[frame(1), vec![0u8; 8]]);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(result.last_lsn, 1);
    assert!(result.was_truncated);
    assert_eq!(
        std::fs::metadata(&wal_path).unwrap().len(),
        frame(1).len() as u64
    );
}

#[test]
fn test_recover_partial_data_at_tail() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut torn = frame(2);
    torn.truncate(20);
    write_raw(&wal_path, &[frame(1), torn]);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(result.entries_recovered, 1);
    assert!(result.was_truncated);
}

// =============================================================================
// Recover: Corruption Tests
// =============================================================================

#[test]
fn test_recover_corrupted_entry_drops_suffix() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut bad = frame(2);
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    write_raw(&wal_path, &[frame(1), bad, frame(3)]);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    // Everything after the damaged frame is dropped, even if it looks valid
    assert_eq!(entries.len(), 1);
    assert_eq!(result.entries_corrupted, 1);
    assert_eq!(result.last_lsn, 1);
    assert!(result.was_truncated);
}

#[test]
fn test_recover_lsn_going_backwards_is_corruption() {
    let (_temp, wal_path) = setup_temp_wal();
    write_raw(&wal_path, &[frame(1), frame(2), frame(2)]);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(result.entries_corrupted, 1);
    assert!(result.was_truncated);
}

#[test]
fn test_recover_twice_is_stable() {
    let (_temp, wal_path) = setup_temp_wal();
    write_raw(&wal_path, &[frame(1), frame(2), vec![0xEE; 5]]);

    let (_, first) = WalRecovery::recover(&wal_path).unwrap();
    let (entries, second) = WalRecovery::recover(&wal_path).unwrap();

    assert!(first.was_truncated);
    assert!(!second.was_truncated);
    assert_eq!(entries.len(), 2);
}

// =============================================================================
// Verify Tests
// =============================================================================

#[test]
fn test_verify_does_not_modify_file() {
    let (_temp, wal_path) = setup_temp_wal();
    write_raw(&wal_path, &[frame(1), vec![0u8; 3]]);
    let before = std::fs::metadata(&wal_path).unwrap().len();

    let result = WalRecovery::verify(&wal_path).unwrap();

    assert_eq!(result.entries_recovered, 1);
    assert!(result.was_truncated);
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), before);
}

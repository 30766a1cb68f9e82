//! Tests for WAL Writer
//!
//! These tests verify:
//! - LSN generation and sequencing
//! - Sync strategies (EveryCommit, EveryNEntries)
//! - Reopen continues the LSN sequence and cuts torn tails
//! - Truncation keeps LSNs increasing

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use emberdb::config::WalSyncStrategy;
use emberdb::wal::{LogRecord, WalReader, WalWriter};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("test.wal");
    (temp_dir, wal_path)
}

fn read_all(path: &PathBuf) -> Vec<emberdb::wal::WalEntry> {
    WalReader::open(path)
        .unwrap()
        .entries()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

// =============================================================================
// Basic Writing Tests
// =============================================================================

#[test]
fn test_write_single_entry() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
    let lsn = writer.append(1, LogRecord::Begin { parent: None }).unwrap();

    assert_eq!(lsn, 1);
    assert_eq!(writer.current_lsn(), 2);
    assert_eq!(writer.last_lsn(), 1);
}

#[test]
fn test_lsn_sequential() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
    for expected in 1..=50 {
        assert_eq!(writer.append(1, LogRecord::Commit).unwrap(), expected);
    }
}

#[test]
fn test_entries_keep_owner() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
        writer.append(4, LogRecord::Begin { parent: None }).unwrap();
        writer.append(5, LogRecord::Begin { parent: Some(4) }).unwrap();
        writer.append(5, LogRecord::ChildCommit { parent: 4 }).unwrap();
        writer.sync().unwrap();
    }

    let entries = read_all(&wal_path);
    let owners: Vec<_> = entries.iter().map(|e| e.txn).collect();
    assert_eq!(owners, vec![4, 5, 5]);
    assert_eq!(entries[2].record, LogRecord::ChildCommit { parent: 4 });
}

// =============================================================================
// Sync Strategy Tests
// =============================================================================

#[test]
fn test_sync_advances_durable_lsn() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
    writer.append(1, LogRecord::Commit).unwrap();
    writer.append(1, LogRecord::Commit).unwrap();
    assert_eq!(writer.durable_lsn(), 0);

    writer.sync().unwrap();
    assert_eq!(writer.durable_lsn(), 2);
}

#[test]
fn test_every_n_entries_syncs_automatically() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer =
        WalWriter::open(&wal_path, WalSyncStrategy::EveryNEntries { count: 3 }).unwrap();
    writer.append(1, LogRecord::Commit).unwrap();
    writer.append(1, LogRecord::Commit).unwrap();
    assert_eq!(writer.durable_lsn(), 0);

    writer.append(1, LogRecord::Commit).unwrap();
    assert_eq!(writer.durable_lsn(), 3);
}

#[test]
fn test_bytes_written_counter() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
    assert_eq!(writer.bytes_written(), 0);
    writer.append(1, LogRecord::Commit).unwrap();
    assert!(writer.bytes_written() > 0);

    writer.reset_bytes_written();
    assert_eq!(writer.bytes_written(), 0);
}

// =============================================================================
// Reopen Tests
// =============================================================================

#[test]
fn test_reopen_continues_lsn() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
        for _ in 0..5 {
            writer.append(1, LogRecord::Commit).unwrap();
        }
        writer.sync().unwrap();
    }

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
    assert_eq!(writer.durable_lsn(), 5);
    assert_eq!(writer.append(1, LogRecord::Commit).unwrap(), 6);
}

#[test]
fn test_reopen_cuts_torn_tail() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
        writer.append(1, LogRecord::Commit).unwrap();
        writer.sync().unwrap();
    }
    {
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[0xAB; 11]).unwrap();
    }

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
    writer.append(2, LogRecord::Abort).unwrap();
    writer.sync().unwrap();

    let entries = read_all(&wal_path);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].lsn, 2);
    assert_eq!(entries[1].record, LogRecord::Abort);
}

// =============================================================================
// Truncation Tests
// =============================================================================

#[test]
fn test_truncate_empties_file_but_not_lsns() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
    for _ in 0..3 {
        writer.append(1, LogRecord::Commit).unwrap();
    }
    writer.truncate().unwrap();
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);

    assert_eq!(writer.append(1, LogRecord::Commit).unwrap(), 4);
    writer.sync().unwrap();

    let entries = read_all(&wal_path);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].lsn, 4);
}

#[test]
fn test_advance_to_skips_lsns() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryCommit).unwrap();
    writer.advance_to(100);
    assert_eq!(writer.append(1, LogRecord::Commit).unwrap(), 101);

    // Never moves backwards
    writer.advance_to(10);
    assert_eq!(writer.append(1, LogRecord::Commit).unwrap(), 102);
}

//! Tests for Environment lifecycle
//!
//! These tests verify:
//! - Open creates the home and log, configuration is validated
//! - One open handle per home per process
//! - Checkpoints (forced, conditional, log truncation)
//! - Statistics and lock granularity binding
//! - Operations after close fail cleanly

use std::fs;

use emberdb::{
    DbConfig, EmberError, EnvConfig, Environment, LockGranularity, PutFlags, TxnConfig,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &TempDir) -> EnvConfig {
    EnvConfig::builder().home(dir.path()).build()
}

// =============================================================================
// Open / Close Tests
// =============================================================================

#[test]
fn test_open_creates_home_and_log() {
    let temp_dir = TempDir::new().unwrap();
    let home = temp_dir.path().join("env");

    let env = Environment::open(EnvConfig::builder().home(&home).build()).unwrap();
    env.open_database(DbConfig::builder("a.db").build()).unwrap();

    assert!(home.join("wal.log").exists());
    assert!(home.join("a.db").exists());
    env.close().unwrap();
}

#[test]
fn test_missing_home_without_create() {
    let temp_dir = TempDir::new().unwrap();
    let config = EnvConfig::builder()
        .home(temp_dir.path().join("absent"))
        .create(false)
        .build();

    assert!(matches!(Environment::open(config), Err(EmberError::Config(_))));
}

#[test]
fn test_invalid_configuration() {
    let temp_dir = TempDir::new().unwrap();
    let bad_page = EnvConfig::builder().home(temp_dir.path()).page_size(1000).build();
    assert!(matches!(Environment::open(bad_page), Err(EmberError::Config(_))));

    let no_log = EnvConfig::builder()
        .home(temp_dir.path())
        .logging(false)
        .build();
    assert!(matches!(Environment::open(no_log), Err(EmberError::Config(_))));
}

#[test]
fn test_second_open_of_same_home_fails() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();

    assert!(matches!(
        Environment::open(config(&temp_dir)),
        Err(EmberError::InvalidArgument(_))
    ));

    env.close().unwrap();
    Environment::open(config(&temp_dir)).unwrap();
}

#[test]
fn test_close_aborts_open_transactions() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::open(config(&temp_dir)).unwrap();
        let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
        db.put(None, b"kept", b"v", PutFlags::Overwrite).unwrap();
        let txn = env.begin(TxnConfig::default()).unwrap();
        db.put(Some(&txn), b"lost", b"v", PutFlags::Overwrite).unwrap();

        env.close().unwrap();
        assert!(matches!(
            db.put(None, b"k", b"v", PutFlags::Overwrite),
            Err(EmberError::InvalidArgument(_))
        ));
        assert!(matches!(env.begin(TxnConfig::default()), Err(EmberError::InvalidArgument(_))));
    }

    let env = Environment::open(config(&temp_dir)).unwrap();
    let db = env.open_existing("a.db").unwrap();
    assert_eq!(db.get(None, b"kept").unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.get(None, b"lost").unwrap(), None);
}

#[test]
fn test_reopen_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::open(config(&temp_dir)).unwrap();
        let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
        for i in 0..500u32 {
            db.put(None, format!("k{}", i).as_bytes(), b"v", PutFlags::Overwrite).unwrap();
        }
        env.close().unwrap();
    }

    let env = Environment::open(config(&temp_dir)).unwrap();
    let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
    assert_eq!(db.stat().unwrap().entries, 500);
    assert_eq!(env.recovery_stats().unwrap().losers, 0);
}

// =============================================================================
// Database Open Tests
// =============================================================================

#[test]
fn test_exclusive_open() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();
    env.open_database(DbConfig::builder("a.db").exclusive(true).build()).unwrap();

    assert!(matches!(
        env.open_database(DbConfig::builder("a.db").exclusive(true).build()),
        Err(EmberError::InvalidArgument(_))
    ));
}

#[test]
fn test_open_without_create() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();

    assert!(env
        .open_database(DbConfig::builder("absent.db").create(false).build())
        .is_err());
    assert!(matches!(env.open_existing("absent.db"), Err(EmberError::NotFound)));
}

#[test]
fn test_invalid_database_name() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();

    assert!(matches!(
        env.open_database(DbConfig::builder("../escape.db").build()),
        Err(EmberError::InvalidArgument(_))
    ));
}

#[test]
fn test_granularity_bound_by_first_open() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();
    let db = env
        .open_database(
            DbConfig::builder("page.db")
                .lock_granularity(LockGranularity::Page)
                .build(),
        )
        .unwrap();

    for i in 0..300u32 {
        db.put(None, format!("k{:04}", i).as_bytes(), b"value", PutFlags::Overwrite)
            .unwrap();
    }
    assert_eq!(db.cursor(None).unwrap().collect().unwrap().len(), 300);

    assert!(matches!(
        env.open_database(DbConfig::builder("page.db").build()),
        Err(EmberError::InvalidArgument(_))
    ));
}

#[test]
fn test_page_locks_cover_neighbours() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();
    let db = env
        .open_database(
            DbConfig::builder("page.db")
                .lock_granularity(LockGranularity::Page)
                .build(),
        )
        .unwrap();
    db.put(None, b"a", b"1", PutFlags::Overwrite).unwrap();
    db.put(None, b"b", b"1", PutFlags::Overwrite).unwrap();

    let first = env.begin(TxnConfig::default()).unwrap();
    db.put(Some(&first), b"a", b"2", PutFlags::Overwrite).unwrap();

    // Both keys live on the single root leaf
    let second = env.begin(TxnConfig::default().no_wait(true)).unwrap();
    assert!(matches!(
        db.put(Some(&second), b"b", b"2", PutFlags::Overwrite),
        Err(EmberError::LockTimeout)
    ));
    second.abort().unwrap();
    first.commit().unwrap();
}

// =============================================================================
// Checkpoint Tests
// =============================================================================

#[test]
fn test_checkpoint_truncates_idle_log() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();
    let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
    for i in 0..200u32 {
        db.put(None, format!("k{}", i).as_bytes(), &[7u8; 100], PutFlags::Overwrite)
            .unwrap();
    }
    let grown = fs::metadata(temp_dir.path().join("wal.log")).unwrap().len();

    env.checkpoint().unwrap();

    let cut = fs::metadata(temp_dir.path().join("wal.log")).unwrap().len();
    assert!(cut < grown);
    let stat = env.stat().unwrap();
    assert!(stat.checkpoints >= 2);
    assert!(stat.last_checkpoint_lsn > 0);
    assert_eq!(db.get(None, b"k42").unwrap(), Some(vec![7u8; 100]));
}

#[test]
fn test_checkpoint_with_active_transaction_keeps_log() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();
    let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
    let txn = env.begin(TxnConfig::default()).unwrap();
    db.put(Some(&txn), b"k", b"v", PutFlags::Overwrite).unwrap();
    let before = env.stat().unwrap().last_lsn;

    env.checkpoint().unwrap();

    let stat = env.stat().unwrap();
    assert!(stat.last_checkpoint_lsn > before);
    txn.commit().unwrap();
}

#[test]
fn test_conditional_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();
    let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
    let count = || env.stat().unwrap().checkpoints;
    let start = count();

    // Nothing logged, an hour not passed
    assert!(!env.checkpoint_if(1024, 60).unwrap());
    assert_eq!(count(), start);

    for i in 0..50u32 {
        db.put(None, format!("k{}", i).as_bytes(), &[1u8; 200], PutFlags::Overwrite)
            .unwrap();
    }
    assert!(env.checkpoint_if(1, 0).unwrap());

    // Both zero forces one
    assert!(env.checkpoint_if(0, 0).unwrap());
    assert_eq!(count(), start + 2);

    env.checkpoint_async().wait().unwrap();
    assert_eq!(count(), start + 3);
}

#[test]
fn test_automatic_checkpoint_by_size() {
    let temp_dir = TempDir::new().unwrap();
    let config = EnvConfig::builder()
        .home(temp_dir.path())
        .checkpoint_kbytes(16)
        .build();
    let env = Environment::open(config).unwrap();
    let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
    let start = env.stat().unwrap().checkpoints;

    for i in 0..200u32 {
        db.put(None, format!("k{}", i).as_bytes(), &[3u8; 256], PutFlags::Overwrite)
            .unwrap();
    }

    assert!(env.stat().unwrap().checkpoints > start);
}

// =============================================================================
// Statistics Tests
// =============================================================================

#[test]
fn test_stat_reports_databases_and_locks() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(config(&temp_dir)).unwrap();
    let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
    env.open_database(DbConfig::builder("b.db").build()).unwrap();

    let txn = env.begin(TxnConfig::default()).unwrap();
    db.put(Some(&txn), b"k", b"v", PutFlags::Overwrite).unwrap();

    let stat = env.stat().unwrap();
    let names: Vec<_> = stat.databases.iter().map(|(_, name)| name.as_str()).collect();
    assert_eq!(names, vec!["a.db", "b.db"]);
    assert_eq!(stat.active_transactions, 1);
    let locks = stat.locks.unwrap();
    assert_eq!(locks.lockers, 1);
    assert_eq!(locks.held, 1);
    assert!(stat.last_lsn >= stat.durable_lsn);

    txn.commit().unwrap();
    let locks = env.stat().unwrap().locks.unwrap();
    assert_eq!((locks.lockers, locks.held), (0, 0));
}

//! Tests for crash recovery
//!
//! These tests verify:
//! - Committed transactions survive a kill, uncommitted ones are rolled back
//! - Nested and prepared transactions are resolved through their top-level outcome
//! - Pages never written back are rebuilt from the log
//! - Recovery is idempotent across repeated crashes
//! - A killed environment's handles become inert

use emberdb::{
    AccessMethod, CommitSync, DbConfig, Duplicates, EmberError, EnvConfig, Environment, PutFlags,
    TxnConfig,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &TempDir) -> EnvConfig {
    EnvConfig::builder().home(dir.path()).build()
}

fn open(dir: &TempDir) -> Environment {
    Environment::open(config(dir)).unwrap()
}

// =============================================================================
// Winner / Loser Tests
// =============================================================================

#[test]
fn test_kill_keeps_committed_drops_uncommitted() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();

        let committed = env.begin(TxnConfig::default()).unwrap();
        db.put(Some(&committed), b"winner", b"kept", PutFlags::Overwrite).unwrap();
        committed.commit().unwrap();

        let loser = env.begin(TxnConfig::default()).unwrap();
        db.put(Some(&loser), b"loser", b"gone", PutFlags::Overwrite).unwrap();
        db.put(Some(&loser), b"winner", b"clobbered", PutFlags::Overwrite).unwrap();

        env.kill();
    }

    let env = open(&temp_dir);
    let db = env.open_existing("a.db").unwrap();
    assert_eq!(db.get(None, b"winner").unwrap(), Some(b"kept".to_vec()));
    assert_eq!(db.get(None, b"loser").unwrap(), None);

    let stats = env.recovery_stats().unwrap();
    assert_eq!(stats.losers, 1);
    assert!(stats.winners >= 1);
    assert!(stats.undone_updates >= 1);
}

#[test]
fn test_uncommitted_overwrite_restores_prior_value() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
        db.put(None, b"key", b"before", PutFlags::Overwrite).unwrap();

        let loser = env.begin(TxnConfig::default()).unwrap();
        db.put(Some(&loser), b"key", b"after", PutFlags::Overwrite).unwrap();
        db.delete(Some(&loser), b"key").unwrap();
        db.put(Some(&loser), b"key", b"again", PutFlags::Overwrite).unwrap();
        env.kill();
    }

    let env = open(&temp_dir);
    let db = env.open_existing("a.db").unwrap();
    assert_eq!(db.get(None, b"key").unwrap(), Some(b"before".to_vec()));
}

#[test]
fn test_unsynced_pages_rebuilt_from_log() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        let db = env
            .open_database(DbConfig::builder("dups.db").duplicates(Duplicates::Sorted).build())
            .unwrap();
        for i in 0..1000u32 {
            db.put(None, format!("k{:04}", i % 100).as_bytes(), &i.to_be_bytes(), PutFlags::Overwrite)
                .unwrap();
        }
        env.kill();
    }

    let env = open(&temp_dir);
    let db = env.open_existing("dups.db").unwrap();
    assert_eq!(db.duplicates(), Duplicates::Sorted);
    assert_eq!(db.stat().unwrap().entries, 1000);
    assert_eq!(db.get_all(None, b"k0007").unwrap().len(), 10);
    assert!(env.recovery_stats().unwrap().redone_pages > 0);
}

#[test]
fn test_nested_outcome_follows_parent() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();

        let parent = env.begin(TxnConfig::default()).unwrap();
        let child = parent.begin_child(TxnConfig::default()).unwrap();
        db.put(Some(&child), b"committed-child", b"v", PutFlags::Overwrite).unwrap();
        child.commit().unwrap();
        parent.commit().unwrap();

        let open_parent = env.begin(TxnConfig::default()).unwrap();
        let child = open_parent.begin_child(TxnConfig::default()).unwrap();
        db.put(Some(&child), b"orphan-child", b"v", PutFlags::Overwrite).unwrap();
        child.commit().unwrap();

        env.kill();
    }

    let env = open(&temp_dir);
    let db = env.open_existing("a.db").unwrap();
    assert_eq!(db.get(None, b"committed-child").unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.get(None, b"orphan-child").unwrap(), None);
}

#[test]
fn test_prepared_without_commit_rolls_back() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
        let txn = env.begin(TxnConfig::default()).unwrap();
        db.put(Some(&txn), b"k", b"v", PutFlags::Overwrite).unwrap();
        txn.prepare().unwrap();
        env.kill();
    }

    let env = open(&temp_dir);
    let db = env.open_existing("a.db").unwrap();
    assert_eq!(db.get(None, b"k").unwrap(), None);
}

#[test]
fn test_aborted_before_crash_stays_aborted() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
        db.put(None, b"k", b"original", PutFlags::Overwrite).unwrap();
        let txn = env.begin(TxnConfig::default()).unwrap();
        db.put(Some(&txn), b"k", b"changed", PutFlags::Overwrite).unwrap();
        txn.abort().unwrap();
        env.kill();
    }

    let env = open(&temp_dir);
    let db = env.open_existing("a.db").unwrap();
    assert_eq!(db.get(None, b"k").unwrap(), Some(b"original".to_vec()));
    assert_eq!(env.recovery_stats().unwrap().losers, 0);
}

#[test]
fn test_nosync_commit_survives_kill() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        let db = env
            .open_database(DbConfig::builder("h.db").access_method(AccessMethod::Hash).build())
            .unwrap();
        let txn = env.begin(TxnConfig::default().sync(CommitSync::NoSync)).unwrap();
        db.put(Some(&txn), b"k", b"v", PutFlags::Overwrite).unwrap();
        txn.commit().unwrap();
        // kill hands buffered records to the OS, like a process crash
        env.kill();
    }

    let env = open(&temp_dir);
    let db = env.open_existing("h.db").unwrap();
    assert_eq!(db.access_method(), AccessMethod::Hash);
    assert_eq!(db.get(None, b"k").unwrap(), Some(b"v".to_vec()));
}

// =============================================================================
// Repeated Crash Tests
// =============================================================================

#[test]
fn test_recovery_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
        db.put(None, b"a", b"1", PutFlags::Overwrite).unwrap();
        let loser = env.begin(TxnConfig::default()).unwrap();
        db.put(Some(&loser), b"b", b"2", PutFlags::Overwrite).unwrap();
        env.kill();
    }

    // Crash again straight after recovery
    {
        let env = open(&temp_dir);
        env.kill();
    }

    let env = open(&temp_dir);
    let db = env.open_existing("a.db").unwrap();
    assert_eq!(db.get(None, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(None, b"b").unwrap(), None);
    assert_eq!(env.recovery_stats().unwrap().losers, 0);
}

#[test]
fn test_recovery_disabled_skips_undo() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = open(&temp_dir);
        env.open_database(DbConfig::builder("a.db").build()).unwrap();
        env.close().unwrap();
    }

    let config = EnvConfig::builder()
        .home(temp_dir.path())
        .recovery(false)
        .build();
    let env = Environment::open(config).unwrap();
    let stats = env.recovery_stats().unwrap();
    assert_eq!(stats.databases, 1);
    assert_eq!(stats.redone_pages, 0);
    assert!(env.open_existing("a.db").is_ok());
}

// =============================================================================
// Killed Handle Tests
// =============================================================================

#[test]
fn test_killed_handles_are_inert() {
    let temp_dir = TempDir::new().unwrap();
    let env = open(&temp_dir);
    let db = env.open_database(DbConfig::builder("a.db").build()).unwrap();
    db.put(None, b"k", b"v", PutFlags::Overwrite).unwrap();

    env.kill();

    assert!(matches!(db.get(None, b"k"), Err(EmberError::InvalidArgument(_))));
    assert!(env.stat().is_err());

    // The home is free again while the old handles still exist
    let reopened = open(&temp_dir);
    let db2 = reopened.open_existing("a.db").unwrap();
    assert_eq!(db2.get(None, b"k").unwrap(), Some(b"v".to_vec()));

    drop(db);
    drop(env);
    // Dropping the killed instance must not release the new one's claim
    assert!(matches!(
        Environment::open(config(&temp_dir)),
        Err(EmberError::InvalidArgument(_))
    ));
}

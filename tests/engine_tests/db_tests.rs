//! Tests for Database access
//!
//! These tests verify:
//! - Basic get/put/delete operations and put flags
//! - Compare-and-swap (`put_if`)
//! - Sorted duplicates, hash ordering and custom comparators
//! - Large values, splits and tree statistics
//! - Internal splits that stay within a page when key sizes vary widely
//! - Non-blocking variants

use emberdb::{
    AccessMethod, DbConfig, Duplicates, EmberError, EnvConfig, Environment, PutFlags, Status,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(EnvConfig::builder().home(temp_dir.path()).build()).unwrap();
    (temp_dir, env)
}

fn setup_db(config: DbConfig) -> (TempDir, Environment, emberdb::Database) {
    let (temp_dir, env) = setup_env();
    let db = env.open_database(config).unwrap();
    (temp_dir, env, db)
}

fn plain() -> DbConfig {
    DbConfig::builder("test.db").build()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_put_get() {
    let (_temp, _env, db) = setup_db(plain());

    db.put(None, b"hello", b"world", PutFlags::Overwrite).unwrap();

    assert_eq!(db.get(None, b"hello").unwrap(), Some(b"world".to_vec()));
    assert_eq!(db.get(None, b"missing").unwrap(), None);
}

#[test]
fn test_overwrite_replaces_value() {
    let (_temp, _env, db) = setup_db(plain());

    db.put(None, b"key", b"v1", PutFlags::Overwrite).unwrap();
    db.put(None, b"key", b"v2", PutFlags::Overwrite).unwrap();

    assert_eq!(db.get_all(None, b"key").unwrap(), vec![b"v2".to_vec()]);
}

#[test]
fn test_delete_then_not_found() {
    let (_temp, _env, db) = setup_db(plain());

    db.put(None, b"key", b"value", PutFlags::Overwrite).unwrap();
    db.delete(None, b"key").unwrap();

    assert_eq!(db.get(None, b"key").unwrap(), None);
    assert!(matches!(db.delete(None, b"key"), Err(EmberError::NotFound)));
}

#[test]
fn test_empty_key_and_value() {
    let (_temp, _env, db) = setup_db(plain());

    db.put(None, b"", b"", PutFlags::Overwrite).unwrap();
    assert_eq!(db.get(None, b"").unwrap(), Some(Vec::new()));
}

#[test]
fn test_oversized_key_rejected() {
    let (_temp, _env, db) = setup_db(plain());
    let key = vec![b'k'; 4096];

    assert!(matches!(
        db.put(None, &key, b"v", PutFlags::Overwrite),
        Err(EmberError::InvalidArgument(_))
    ));
}

#[test]
fn test_read_only_rejects_writes() {
    let (_temp, env, db) = setup_db(plain());
    db.put(None, b"key", b"value", PutFlags::Overwrite).unwrap();

    let reader = env
        .open_database(DbConfig::builder("test.db").read_only(true).build())
        .unwrap();
    assert_eq!(reader.get(None, b"key").unwrap(), Some(b"value".to_vec()));
    assert!(matches!(
        reader.put(None, b"key", b"other", PutFlags::Overwrite),
        Err(EmberError::InvalidArgument(_))
    ));
}

// =============================================================================
// Put Flag Tests
// =============================================================================

#[test]
fn test_no_overwrite() {
    let (_temp, _env, db) = setup_db(plain());

    db.put(None, b"key", b"first", PutFlags::NoOverwrite).unwrap();
    assert!(matches!(
        db.put(None, b"key", b"second", PutFlags::NoOverwrite),
        Err(EmberError::KeyExists)
    ));
    assert_eq!(db.get(None, b"key").unwrap(), Some(b"first".to_vec()));
}

#[test]
fn test_append_requires_increasing_keys() {
    let (_temp, _env, db) = setup_db(plain());

    db.put(None, b"a", b"1", PutFlags::Append).unwrap();
    db.put(None, b"b", b"2", PutFlags::Append).unwrap();

    assert!(matches!(
        db.put(None, b"aa", b"3", PutFlags::Append),
        Err(EmberError::InvalidArgument(_))
    ));
    assert_eq!(db.get(None, b"aa").unwrap(), None);
}

#[test]
fn test_no_dup_data_needs_sorted_duplicates() {
    let (_temp, _env, db) = setup_db(plain());

    assert!(matches!(
        db.put(None, b"key", b"v", PutFlags::NoDupData),
        Err(EmberError::InvalidArgument(_))
    ));
}

// =============================================================================
// Compare-and-swap Tests
// =============================================================================

#[test]
fn test_put_if_absent() {
    let (_temp, _env, db) = setup_db(plain());

    db.put_if(None, b"key", b"v1", None).unwrap();
    assert!(matches!(db.put_if(None, b"key", b"v2", None), Err(EmberError::Conflict)));
    assert_eq!(db.get(None, b"key").unwrap(), Some(b"v1".to_vec()));
}

#[test]
fn test_put_if_expected_value() {
    let (_temp, _env, db) = setup_db(plain());
    db.put(None, b"key", b"v1", PutFlags::Overwrite).unwrap();

    assert!(matches!(
        db.put_if(None, b"key", b"v3", Some(b"wrong")),
        Err(EmberError::Conflict)
    ));
    db.put_if(None, b"key", b"v2", Some(b"v1")).unwrap();

    assert_eq!(db.get(None, b"key").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_put_if_on_missing_key_conflicts() {
    let (_temp, _env, db) = setup_db(plain());

    let result = db.put_if(None, b"key", b"v", Some(b"old"));
    assert!(matches!(result, Err(EmberError::Conflict)));
    assert_eq!(emberdb::OpResult::from(result).status, Status::Conflict);
}

// =============================================================================
// Duplicate Tests
// =============================================================================

fn dups() -> DbConfig {
    DbConfig::builder("dups.db").duplicates(Duplicates::Sorted).build()
}

#[test]
fn test_sorted_duplicates_ordered_by_value() {
    let (_temp, _env, db) = setup_db(dups());

    for value in [b"v2", b"v3", b"v1"] {
        db.put(None, b"key", value, PutFlags::Overwrite).unwrap();
    }

    assert_eq!(
        db.get_all(None, b"key").unwrap(),
        vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]
    );
    assert_eq!(db.get(None, b"key").unwrap(), Some(b"v1".to_vec()));
}

#[test]
fn test_no_dup_data_rejects_identical_pair() {
    let (_temp, _env, db) = setup_db(dups());

    db.put(None, b"key", b"v1", PutFlags::NoDupData).unwrap();
    db.put(None, b"key", b"v2", PutFlags::NoDupData).unwrap();
    assert!(matches!(
        db.put(None, b"key", b"v1", PutFlags::NoDupData),
        Err(EmberError::KeyExists)
    ));
}

#[test]
fn test_delete_removes_every_duplicate() {
    let (_temp, _env, db) = setup_db(dups());
    db.put(None, b"key", b"v1", PutFlags::Overwrite).unwrap();
    db.put(None, b"key", b"v2", PutFlags::Overwrite).unwrap();

    db.delete(None, b"key").unwrap();
    assert!(db.get_all(None, b"key").unwrap().is_empty());
}

#[test]
fn test_put_if_swaps_one_duplicate() {
    let (_temp, _env, db) = setup_db(dups());
    db.put(None, b"key", b"a", PutFlags::Overwrite).unwrap();
    db.put(None, b"key", b"b", PutFlags::Overwrite).unwrap();

    db.put_if(None, b"key", b"c", Some(b"a")).unwrap();
    assert_eq!(
        db.get_all(None, b"key").unwrap(),
        vec![b"b".to_vec(), b"c".to_vec()]
    );
}

#[test]
fn test_reopen_with_different_shape_fails() {
    let (_temp, env, _db) = setup_db(dups());

    assert!(matches!(
        env.open_database(DbConfig::builder("dups.db").build()),
        Err(EmberError::InvalidArgument(_))
    ));
    // The stored shape is picked up without restating it
    assert_eq!(env.open_existing("dups.db").unwrap().duplicates(), Duplicates::Sorted);
}

// =============================================================================
// Hash And Comparator Tests
// =============================================================================

#[test]
fn test_hash_database() {
    let (_temp, _env, db) = setup_db(
        DbConfig::builder("hash.db")
            .access_method(AccessMethod::Hash)
            .build(),
    );

    for i in 0..200u32 {
        db.put(None, format!("key{}", i).as_bytes(), &i.to_le_bytes(), PutFlags::Overwrite)
            .unwrap();
    }
    for i in 0..200u32 {
        assert_eq!(
            db.get(None, format!("key{}", i).as_bytes()).unwrap(),
            Some(i.to_le_bytes().to_vec())
        );
    }

    let mut cursor = db.cursor(None).unwrap();
    assert_eq!(cursor.collect().unwrap().len(), 200);
    assert!(matches!(
        db.put(None, b"zzz", b"v", PutFlags::Append),
        Err(EmberError::InvalidArgument(_))
    ));
}

#[test]
fn test_custom_comparator() {
    let temp_dir = TempDir::new().unwrap();
    let config = EnvConfig::builder()
        .home(temp_dir.path())
        .comparator("reverse", |a: &[u8], b: &[u8]| b.cmp(a))
        .build();
    let env = Environment::open(config).unwrap();
    let db = env
        .open_database(DbConfig::builder("rev.db").comparator("reverse").build())
        .unwrap();

    for key in [b"a", b"c", b"b"] {
        db.put(None, key, b"v", PutFlags::Overwrite).unwrap();
    }

    let keys: Vec<_> = db
        .cursor(None)
        .unwrap()
        .collect()
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
}

#[test]
fn test_unregistered_comparator() {
    let (_temp, env) = setup_env();

    let result = env.open_database(DbConfig::builder("x.db").comparator("nope").build());
    assert!(matches!(result, Err(EmberError::Config(_))));
}

// =============================================================================
// Tree Shape Tests
// =============================================================================

#[test]
fn test_many_keys_split_the_root() {
    let (_temp, _env, db) = setup_db(plain());

    for i in 0..3000u32 {
        let key = format!("key{:06}", i);
        db.put(None, key.as_bytes(), b"some value bytes", PutFlags::Overwrite)
            .unwrap();
    }

    let stat = db.stat().unwrap();
    assert_eq!(stat.entries, 3000);
    assert!(stat.height > 1);
    assert!(stat.internal_pages >= 1);
    assert_eq!(db.get(None, b"key001234").unwrap(), Some(b"some value bytes".to_vec()));
}

#[test]
fn test_deletes_shrink_the_tree() {
    let (_temp, _env, db) = setup_db(plain());

    for i in 0..3000u32 {
        db.put(None, format!("key{:06}", i).as_bytes(), b"value", PutFlags::Overwrite)
            .unwrap();
    }
    let grown = db.stat().unwrap();

    for i in 0..3000u32 {
        db.delete(None, format!("key{:06}", i).as_bytes()).unwrap();
    }

    let shrunk = db.stat().unwrap();
    assert_eq!(shrunk.entries, 0);
    assert!(shrunk.height < grown.height);
    assert!(shrunk.free_pages > 0);
}

fn max_size_key(prefix: char, i: u32, len: usize) -> Vec<u8> {
    let mut key = format!("{}{:04}", prefix, i).into_bytes();
    key.resize(len, b'x');
    key
}

#[test]
fn test_max_size_keys_mixed_with_tiny_keys_stay_writable() {
    let temp_dir = TempDir::new().unwrap();
    let config = || EnvConfig::builder().home(temp_dir.path()).page_size(4096).build();
    let key_len = 4096 / 8;
    let value = vec![b'v'; 200];

    {
        let env = Environment::open(config()).unwrap();
        let db = env.open_database(plain()).unwrap();

        // Small separators fill the internal nodes first
        for i in 0..100u32 {
            db.put(None, format!("b{:04}", i).as_bytes(), &value, PutFlags::Overwrite)
                .unwrap();
            env.checkpoint().unwrap();
        }
        // Then large ones arrive, interleaved with more small ones
        for i in 0..120u32 {
            db.put(None, &max_size_key('a', i, key_len), &value, PutFlags::Overwrite)
                .unwrap();
            db.put(None, format!("c{:04}", i).as_bytes(), &value, PutFlags::Overwrite)
                .unwrap();
            env.checkpoint().unwrap();
        }

        let grown = db.stat().unwrap();
        assert_eq!(grown.entries, 100 + 120 * 2);
        assert!(grown.height >= 3);

        // Drain most of the large keys so internal nodes merge and redistribute
        for i in (0..120u32).filter(|i| i % 4 != 0) {
            db.delete(None, &max_size_key('a', i, key_len)).unwrap();
            if i % 8 == 1 {
                env.checkpoint().unwrap();
            }
        }
        env.checkpoint().unwrap();
        env.close().unwrap();
    }

    let env = Environment::open(config()).unwrap();
    let db = env.open_existing("test.db").unwrap();
    assert_eq!(db.stat().unwrap().entries, 100 + 120 + 30);
    for i in 0..120u32 {
        let expected = if i % 4 == 0 { Some(value.clone()) } else { None };
        assert_eq!(db.get(None, &max_size_key('a', i, key_len)).unwrap(), expected);
        assert_eq!(db.get(None, format!("c{:04}", i).as_bytes()).unwrap(), Some(value.clone()));
    }
    assert_eq!(db.get(None, b"b0042").unwrap(), Some(value));
    env.close().unwrap();
}

#[test]
fn test_large_value_uses_overflow_pages() {
    let (_temp, _env, db) = setup_db(plain());
    let value: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    db.put(None, b"big", &value, PutFlags::Overwrite).unwrap();

    assert_eq!(db.get(None, b"big").unwrap(), Some(value));
    assert!(db.stat().unwrap().overflow_pages >= 4);

    db.delete(None, b"big").unwrap();
    assert_eq!(db.stat().unwrap().overflow_pages, 0);
}

// =============================================================================
// Non-blocking Variant Tests
// =============================================================================

#[test]
fn test_async_operations() {
    let (_temp, _env, db) = setup_db(plain());

    db.put_async(None, "key", "v1", PutFlags::Overwrite).wait().unwrap();
    assert_eq!(db.get_async(None, "key").wait().unwrap(), Some(b"v1".to_vec()));

    db.put_if_async(None, "key", "v2", Some(b"v1".to_vec())).wait().unwrap();
    assert!(matches!(
        db.put_if_async(None, "key", "v3", None).wait(),
        Err(EmberError::Conflict)
    ));

    db.delete_async(None, "key").wait().unwrap();
    assert!(matches!(db.delete_async(None, "key").wait(), Err(EmberError::NotFound)));
}

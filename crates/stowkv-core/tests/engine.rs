//! Integration tests: transactions, locking and recovery through the public
//! Environment -> Store -> Cursor API.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use tempfile::TempDir;

use stowkv_core::{
    Config, Environment, IndexDefinition, KeyComparator, StoreError, StoreOptions,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_env() -> (Environment, TempDir) {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), Config::testing()).unwrap();
    (env, dir)
}

/// Orders keys by length first, then bytes
struct ShortFirst;

impl KeyComparator for ShortFirst {
    fn name(&self) -> &str {
        "short-first"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

fn collect_keys(env: &Environment, name: &str, options: StoreOptions) -> Vec<Vec<u8>> {
    let store = env.open_store(name, options).unwrap();
    let mut cursor = store.cursor(None).unwrap();
    let mut keys = Vec::new();
    while let Some((key, _)) = cursor.next().unwrap() {
        keys.push(key);
    }
    keys
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

#[test]
fn test_conflicting_writers_one_victim() {
    let (env, _dir) = test_env();
    let store = env.open_store("accounts", StoreOptions::create()).unwrap();
    store.put(None, b"a", b"0").unwrap();
    store.put(None, b"b", b"0").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [(b"a", b"b"), (b"b", b"a")]
        .into_iter()
        .map(|(first, second)| {
            let env = env.clone();
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let txn = env.begin().unwrap();
                store.put(Some(&txn), first, b"1").unwrap();
                barrier.wait();
                match store.put(Some(&txn), second, b"1") {
                    Ok(_) => {
                        txn.commit().unwrap();
                        false
                    }
                    Err(e) => {
                        assert!(e.is_deadlock(), "unexpected error: {e}");
                        txn.abort().unwrap();
                        true
                    }
                }
            })
        })
        .collect();

    let victims = handles.into_iter().map(|h| h.join().unwrap()).filter(|v| *v).count();
    assert_eq!(victims, 1);
    assert_eq!(env.active_transactions(), 0);
}

#[test]
fn test_uncommitted_write_blocks_reader_until_commit() {
    let (env, _dir) = test_env();
    let store = env.open_store("s", StoreOptions::create()).unwrap();
    let txn = env.begin().unwrap();
    store.put(Some(&txn), b"k", b"pending").unwrap();

    let reader = {
        let store = store.clone();
        thread::spawn(move || store.get(None, b"k").unwrap())
    };
    thread::sleep(Duration::from_millis(30));
    txn.commit().unwrap();

    assert_eq!(reader.join().unwrap(), Some(b"pending".to_vec()));
}

#[test]
fn test_lock_timeout_is_not_deadlock() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::testing();
    config.lock_timeout = Duration::from_millis(30);
    let env = Environment::open(dir.path(), config).unwrap();
    let store = env.open_store("s", StoreOptions::create()).unwrap();

    let txn = env.begin().unwrap();
    store.put(Some(&txn), b"k", b"v").unwrap();
    let err = store.put(None, b"k", b"other").unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout { .. }));
    assert!(!err.is_deadlock());
    txn.abort().unwrap();
}

// ---------------------------------------------------------------------------
// Ordering and recovery
// ---------------------------------------------------------------------------

#[test]
fn test_comparator_installed_after_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), Config::testing()).unwrap();
        let store = env
            .open_store("s", StoreOptions::create().with_comparator(Arc::new(ShortFirst)))
            .unwrap();
        for key in [&b"ccc"[..], b"aa", b"b"] {
            store.put(None, key, b"v").unwrap();
        }
    }

    let env = Environment::open(dir.path(), Config::testing()).unwrap();
    let keys = collect_keys(&env, "s", StoreOptions::default().with_comparator(Arc::new(ShortFirst)));
    // Raw byte order would put "aa" first
    assert_eq!(keys, vec![b"b".to_vec(), b"aa".to_vec(), b"ccc".to_vec()]);

    let err = env.open_store("s", StoreOptions::default()).unwrap_err();
    assert!(matches!(err, StoreError::ComparatorMismatch { .. }));
}

#[test]
fn test_index_rebuilt_after_recovery() {
    let dir = TempDir::new().unwrap();
    let definition = || {
        IndexDefinition::new("by-value", Arc::new(|_k: &[u8], v: &[u8]| Ok::<_, String>(Some(v.to_vec()))))
    };
    {
        let env = Environment::open(dir.path(), Config::testing()).unwrap();
        let store = env.open_store("s", StoreOptions::create()).unwrap();
        store.associate(definition()).unwrap();
        store.put(None, b"1", b"red").unwrap();
        store.put(None, b"2", b"red").unwrap();
        store.put(None, b"3", b"blue").unwrap();
    }

    let env = Environment::open(dir.path(), Config::testing()).unwrap();
    let store = env.open_store("s", StoreOptions::default()).unwrap();
    let (index, created) = store.associate(definition()).unwrap();
    assert!(created);

    let mut cursor = index.cursor(None).unwrap();
    cursor.seek_exact(b"red").unwrap().unwrap();
    assert_eq!(cursor.count_duplicates().unwrap(), 2);
}

#[test]
fn test_checkpoint_then_more_writes_then_recover() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), Config::testing()).unwrap();
        let store = env.open_store("s", StoreOptions::create()).unwrap();
        store.put(None, b"a", b"1").unwrap();
        env.checkpoint().unwrap();
        store.delete(None, b"a").unwrap();
        store.put(None, b"b", b"2").unwrap();
        env.checkpoint().unwrap();
        store.put(None, b"c", b"3").unwrap();
    }

    let env = Environment::open(dir.path(), Config::testing()).unwrap();
    let keys = collect_keys(&env, "s", StoreOptions::default());
    assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
}

// ---------------------------------------------------------------------------
// Model check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u8),
    Delete(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<u8>()).prop_map(|(k, v)| Op::Put(k % 32, v)),
        any::<u8>().prop_map(|k| Op::Delete(k % 32)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_store_matches_btreemap(ops in proptest::collection::vec(op(), 1..64), probe in any::<u8>()) {
        let (env, _dir) = test_env();
        let store = env.open_store("s", StoreOptions::create()).unwrap();
        let mut model = BTreeMap::new();

        for op in &ops {
            match *op {
                Op::Put(k, v) => {
                    prop_assert_eq!(store.put(None, &[k], &[v]).unwrap(), model.insert(vec![k], vec![v]));
                }
                Op::Delete(k) => {
                    prop_assert_eq!(store.delete(None, &[k]).unwrap(), model.remove(&vec![k]));
                }
            }
        }

        let probe = vec![probe % 40];
        let mut cursor = store.cursor(None).unwrap();
        let expected = model.range(probe.clone()..).next().map(|(k, v)| (k.clone(), v.clone()));
        prop_assert_eq!(cursor.seek_ge(&probe).unwrap(), expected);

        let mut backwards = Vec::new();
        let mut cursor = store.cursor(None).unwrap();
        while let Some((key, _)) = cursor.prev().unwrap() {
            backwards.push(key);
        }
        let mut expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        expected.reverse();
        prop_assert_eq!(backwards, expected);
    }
}

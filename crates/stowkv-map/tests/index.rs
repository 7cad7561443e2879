//! Integration tests: secondary indices, index views and index-set
//! migration.

use std::sync::Arc;

use tempfile::TempDir;

use stowkv_core::Config;
use stowkv_map::{
    Connection, Database, IndexGroup, IndexSpec, MapError, MapOptions, MapResult, OrderedU32, PrimaryMap, Utf8,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_db() -> (Database, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), Config::testing()).unwrap();
    (db, dir)
}

/// Secondary key: string length
fn by_len() -> IndexSpec<u32, String> {
    IndexSpec::new("by_len", OrderedU32, |value: &String| Some(value.len() as u32)).ordered()
}

/// Only words starting with a vowel are indexed, by first letter
fn by_vowel() -> IndexSpec<String, String> {
    IndexSpec::new("by_vowel", Utf8, |value: &String| {
        value.chars().next().filter(|c| "aeiou".contains(*c)).map(String::from)
    })
}

fn words(conn: &Connection) -> PrimaryMap<u32, String> {
    conn.open_map(
        "words",
        MapOptions::new(OrderedU32, Utf8).ordered().create(true).index(by_len()).index(by_vowel()),
    )
    .unwrap()
}

fn primary_keys(group: &IndexGroup<u32, u32, String>) -> Vec<u32> {
    group.entries.iter().map(|entry| *entry.key().unwrap()).collect()
}

fn entry_keys<I: Iterator<Item = MapResult<stowkv_map::Entry<u32, String>>>>(iter: I) -> Vec<u32> {
    iter.map(|entry| entry.unwrap().into_key().unwrap()).collect()
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

#[test]
fn test_string_length_index() {
    let (db, _dir) = test_db();
    let map = words(&db.connect());
    map.put(&1, &"x".to_string()).unwrap();
    map.put(&2, &"yy".to_string()).unwrap();
    map.put(&3, &"zz".to_string()).unwrap();

    let index = map.index(&by_len()).unwrap();
    assert_eq!(index.count(&2).unwrap(), 2);
    assert_eq!(index.count(&5).unwrap(), 0);
    assert!(index.contains_key(&1).unwrap());

    let found: Vec<(u32, String)> = index.find(&2, true).unwrap().map(|e| e.unwrap().into_pair().unwrap()).collect();
    assert_eq!(found, vec![(2, "yy".to_string()), (3, "zz".to_string())]);
    assert!(found.iter().all(|(_, value)| value.len() == 2));

    // Without only_duplicates the walk carries on past the run
    assert_eq!(entry_keys(index.find(&1, false).unwrap()), vec![1, 2, 3]);
    assert_eq!(entry_keys(index.find(&1, true).unwrap()), vec![1]);
    assert!(entry_keys(index.find(&9, true).unwrap()).is_empty());
}

#[test]
fn test_index_follows_primary_writes() {
    let (db, _dir) = test_db();
    let map = words(&db.connect());
    map.put(&1, &"ab".to_string()).unwrap();
    map.put(&2, &"cd".to_string()).unwrap();
    let index = map.index(&by_len()).unwrap();
    assert_eq!(index.count(&2).unwrap(), 2);

    map.put(&2, &"cde".to_string()).unwrap();
    assert_eq!(index.count(&2).unwrap(), 1);
    assert_eq!(primary_keys(&index.get(&3).unwrap().unwrap()), vec![2]);

    map.remove(&1).unwrap();
    assert!(index.get(&2).unwrap().is_none());
}

#[test]
fn test_extractor_none_leaves_record_out() {
    let (db, _dir) = test_db();
    let map = words(&db.connect());
    map.put(&1, &"apple".to_string()).unwrap();
    map.put(&2, &"banana".to_string()).unwrap();
    map.put(&3, &"avocado".to_string()).unwrap();

    let vowels = map.index(&by_vowel()).unwrap();
    assert_eq!(vowels.count(&"a".to_string()).unwrap(), 2);
    assert_eq!(vowels.count(&"b".to_string()).unwrap(), 0);
    // Unordered index: lookups work, views do not
    assert!(matches!(vowels.view(), Err(MapError::UnsupportedOrdering { .. })));
}

#[test]
fn test_index_iterators_are_read_only() {
    let (db, _dir) = test_db();
    let conn = db.connect();
    let map = words(&conn);
    map.put(&1, &"a".to_string()).unwrap();

    conn.begin().unwrap();
    let mut iter = map.index(&by_len()).unwrap().find(&1, true).unwrap();
    let mut entry = iter.next_entry().unwrap();
    assert!(matches!(iter.remove(), Err(MapError::Unsupported(_))));
    assert!(matches!(iter.set_value(&"b".to_string()), Err(MapError::Unsupported(_))));
    assert!(matches!(entry.set_value("b".to_string()), Err(MapError::Unsupported(_))));
    iter.close();
    conn.commit().unwrap();
}

#[test]
fn test_unknown_index_is_an_engine_error() {
    let (db, _dir) = test_db();
    let map = db.connect().open_map("bare", MapOptions::new(OrderedU32, Utf8).create(true)).unwrap();
    assert!(matches!(map.index(&by_len()), Err(MapError::Engine { .. })));
}

// ---------------------------------------------------------------------------
// Index views
// ---------------------------------------------------------------------------

fn lengths(map: &PrimaryMap<u32, String>) {
    for (key, word) in [(1, "a"), (2, "bb"), (3, "cc"), (4, "dddd"), (5, "ee"), (6, "ffff")] {
        map.put(&key, &word.to_string()).unwrap();
    }
}

#[test]
fn test_index_view_searches() {
    let (db, _dir) = test_db();
    let map = words(&db.connect());
    lengths(&map);
    let view = map.index(&by_len()).unwrap().view().unwrap();

    assert_eq!(view.first_key().unwrap(), 1);
    assert_eq!(view.last_key().unwrap(), 4);

    let ceiling = view.ceiling_group(&3).unwrap().unwrap();
    assert_eq!(ceiling.key, 4);
    assert_eq!(primary_keys(&ceiling), vec![4, 6]);

    let floor = view.floor_group(&3).unwrap().unwrap();
    assert_eq!(floor.key, 2);
    assert_eq!(primary_keys(&floor), vec![2, 3, 5]);

    assert_eq!(view.lower_group(&2).unwrap().unwrap().key, 1);
    assert_eq!(view.higher_group(&2).unwrap().unwrap().key, 4);
    assert!(view.higher_group(&4).unwrap().is_none());
    assert!(view.lower_group(&1).unwrap().is_none());
}

#[test]
fn test_index_view_groups_in_both_directions() {
    let (db, _dir) = test_db();
    let map = words(&db.connect());
    lengths(&map);
    let index = map.index(&by_len()).unwrap();

    let groups: Vec<(u32, Vec<u32>)> = index
        .view()
        .unwrap()
        .groups()
        .unwrap()
        .map(|g| {
            let g = g.unwrap();
            let keys = primary_keys(&g);
            (g.key, keys)
        })
        .collect();
    assert_eq!(groups, vec![(1, vec![1]), (2, vec![2, 3, 5]), (4, vec![4, 6])]);

    let desc = index.descending_view().unwrap();
    let mut iter = desc.groups().unwrap();
    let first = iter.next_group().unwrap().unwrap();
    assert_eq!(first.key, 4);
    assert_eq!(primary_keys(&first), vec![4, 6]);
    assert_eq!(iter.next_group().unwrap().unwrap().key, 2);
    iter.close();

    assert_eq!(entry_keys(desc.entries().unwrap()), vec![6, 4, 5, 3, 2, 1]);

    let back = desc.descending_view().unwrap();
    assert!(Arc::ptr_eq(&back, &desc.descending_view().unwrap()));
    assert_eq!(entry_keys(back.entries().unwrap()), vec![1, 2, 3, 5, 4, 6]);
}

#[test]
fn test_index_sub_views() {
    let (db, _dir) = test_db();
    let map = words(&db.connect());
    lengths(&map);
    let index = map.index(&by_len()).unwrap();

    let tail = index.tail_view(&2, false).unwrap();
    assert_eq!(tail.first_key().unwrap(), 4);
    assert!(tail.get(&2).unwrap().is_none());
    assert!(tail.contains_key(&4).unwrap());

    let sub = index.sub_view(&1, false, &4, false).unwrap();
    assert_eq!(entry_keys(sub.entries().unwrap()), vec![2, 3, 5]);
    assert!(matches!(sub.head_view(&4, true), Err(MapError::InvalidRange { .. })));
    assert!(matches!(index.sub_view(&4, true, &1, true), Err(MapError::InvalidRange { .. })));

    let head = index.descending_view().unwrap().head_view(&2, true).unwrap();
    assert_eq!(head.last_key().unwrap(), 2);
    assert_eq!(head.first_key().unwrap(), 4);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_only_owning_reference_detaches() {
    let (db, _dir) = test_db();
    let map = words(&db.connect());
    map.put(&1, &"a".to_string()).unwrap();

    // Second open re-associates without creating: not owning
    let again = words(&db.connect());
    let borrowed = again.index(&by_len()).unwrap();
    assert!(!borrowed.is_owning());
    borrowed.close().unwrap();
    assert!(matches!(borrowed.count(&1), Err(MapError::Closed { .. })));

    let owner = map.index(&by_len()).unwrap();
    assert!(owner.is_owning());
    assert_eq!(owner.count(&1).unwrap(), 1);
    owner.close().unwrap();
    assert!(matches!(map.index(&by_len()), Err(MapError::Engine { .. })));
}

#[test]
fn test_recreate_migrates_index_set() {
    let (db, _dir) = test_db();
    let conn = db.connect();
    let map = conn.open_map("people", MapOptions::new(OrderedU32, Utf8).ordered().create(true)).unwrap();
    for (key, name) in [(1, "ann"), (2, "bo"), (3, "cy")] {
        map.put(&key, &name.to_string()).unwrap();
    }
    assert!(map.index(&by_len()).is_err());

    let spec = by_len();
    map.recreate(&[&spec]).unwrap();

    assert_eq!(map.len().unwrap(), 3);
    assert_eq!(map.get(&1).unwrap().as_deref(), Some("ann"));
    let index = map.index(&spec).unwrap();
    assert_eq!(index.count(&2).unwrap(), 2);
    assert!(db.environment().store_names().iter().all(|name| !name.contains(".recreate-")));

    // Writes after the swap reach the new store and index
    map.put(&4, &"dee".to_string()).unwrap();
    assert_eq!(index.count(&3).unwrap(), 2);

    conn.begin().unwrap();
    assert!(matches!(map.recreate(&[]), Err(MapError::Unsupported(_))));
    conn.abort().unwrap();
}

mod common;

#[test]
fn test_split_then_scripted_deletes() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("delete.db"));
    let tree = common::create_tree(&rm, "script", 4, false);

    let keys: Vec<i64> = (1..=20).collect();
    common::insert_all(&rm, &tree, &keys);

    {
        let rtx = rm.begin_read();
        let mut cursor = tree.browse(&rtx).unwrap();
        let browsed = common::collect_forward(&mut cursor);
        assert_eq!(
            browsed,
            keys.iter().map(|k| (*k, k.to_string())).collect::<Vec<_>>()
        );
    }

    // deletions picked to hit borrow-left, borrow-right, merges and a
    // root collapse
    for &k in &[3i64, 4, 19, 20, 11, 12, 1, 18, 5, 16] {
        let mut tx = rm.begin_write().unwrap();
        let removed = tree.delete(&mut tx, &k).unwrap();
        assert_eq!(removed, Some((k, k.to_string())), "deleting {}", k);
        tx.commit().unwrap();

        let rtx = rm.begin_read();
        assert_eq!(tree.get(&rtx, &k).unwrap(), None, "get({}) after delete", k);
        tree.check_integrity(&rtx, true).unwrap();
    }

    let rtx = rm.begin_read();
    assert_eq!(tree.count(&rtx).unwrap(), 10);
}

#[test]
fn test_delete_absent_key() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("delete.db"));
    let tree = common::create_tree(&rm, "absent", 4, false);
    common::insert_all(&rm, &tree, &[1, 2, 3]);

    let before = rm.current_revision();
    let mut tx = rm.begin_write().unwrap();
    assert_eq!(tree.delete(&mut tx, &99).unwrap(), None);
    tx.commit().unwrap();

    // nothing was written for a miss, but the commit still advances
    let rtx = rm.begin_read();
    assert_eq!(rm.current_revision(), before + 1);
    assert_eq!(tree.count(&rtx).unwrap(), 3);
}

#[test]
fn test_redistribute_leaf_pages() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("delete.db"));
    let tree = common::create_tree(&rm, "redistribute", 4, false);

    common::insert_all(&rm, &tree, &(1..=8).collect::<Vec<i64>>());

    // empty the left edge until it must borrow from its sibling
    let mut tx = rm.begin_write().unwrap();
    tree.delete(&mut tx, &1).unwrap();
    tree.delete(&mut tx, &2).unwrap();
    tx.commit().unwrap();

    let rtx = rm.begin_read();
    tree.check_integrity(&rtx, true).unwrap();
    let mut cursor = tree.browse(&rtx).unwrap();
    let remaining: Vec<i64> = common::collect_forward(&mut cursor)
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(remaining, vec![3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_merge_to_root_collapse() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("delete.db"));
    let tree = common::create_tree(&rm, "collapse", 4, false);

    common::insert_all(&rm, &tree, &(1..=6).collect::<Vec<i64>>());

    // shrink back to a single leaf
    for k in (1..=5).rev() {
        let mut tx = rm.begin_write().unwrap();
        tree.delete(&mut tx, &k).unwrap();
        tx.commit().unwrap();
        let rtx = rm.begin_read();
        tree.check_integrity(&rtx, true).unwrap();
    }

    let rtx = rm.begin_read();
    assert_eq!(tree.count(&rtx).unwrap(), 1);
    assert_eq!(tree.get(&rtx, &6).unwrap(), Some("6".to_string()));
}

#[test]
fn test_drain_returns_pages_to_free_list() {
    common::setup();
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("delete.db"));
    let tree = common::create_tree(&rm, "drain", 4, false);

    let mut rng = StdRng::seed_from_u64(99);
    let mut keys: Vec<i64> = (0..120).collect();
    keys.shuffle(&mut rng);
    common::insert_all(&rm, &tree, &keys);

    keys.shuffle(&mut rng);
    for &k in &keys {
        let mut tx = rm.begin_write().unwrap();
        assert!(tree.delete(&mut tx, &k).unwrap().is_some());
        tx.commit().unwrap();
    }

    let rtx = rm.begin_read();
    assert_eq!(tree.count(&rtx).unwrap(), 0);
    let mut cursor = tree.browse(&rtx).unwrap();
    assert!(!cursor.has_next());
    drop(rtx);

    // every page is either reachable from the current revision or free;
    // the two header page-images are neither
    let reachable = rm.reachable_page_count().unwrap();
    let free = rm.free_page_count() as u64;
    assert_eq!(reachable + free, rm.file_page_count() - 2);
}

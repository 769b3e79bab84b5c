use mavibot::Error;

mod common;

#[test]
fn test_forward_backward_reversal() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("scan.db"));
    let tree = common::create_tree(&rm, "reversal", 4, false);

    let keys: Vec<i64> = (0..60).map(|i| i * 3).collect();
    common::insert_all(&rm, &tree, &keys);

    let rtx = rm.begin_read();
    let mut cursor = tree.browse(&rtx).unwrap();
    let forward = common::collect_forward(&mut cursor);

    let mut cursor = tree.browse_backward(&rtx).unwrap();
    let mut backward = common::collect_backward(&mut cursor);
    backward.reverse();

    assert_eq!(forward, backward);
}

#[test]
fn test_browse_from_positions() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("scan.db"));
    let tree = common::create_tree(&rm, "positions", 4, false);

    // even keys 0, 2, .., 1000
    let keys: Vec<i64> = (0..=500).map(|i| i * 2).collect();
    common::insert_all(&rm, &tree, &keys);

    let rtx = rm.begin_read();

    // between two keys: next is the following key, prev the preceding one
    let mut cursor = tree.browse_from(&rtx, &41).unwrap();
    assert_eq!(cursor.next().unwrap(), (42, "42".to_string()));
    assert_eq!(cursor.prev().unwrap(), (42, "42".to_string()));
    cursor.prev().unwrap();
    assert_eq!(cursor.next().unwrap(), (40, "40".to_string()));

    // on an existing key: next yields it, prev yields its predecessor
    let mut cursor = tree.browse_from(&rtx, &100).unwrap();
    assert_eq!(cursor.next().unwrap(), (100, "100".to_string()));
    let mut cursor = tree.browse_from(&rtx, &100).unwrap();
    assert_eq!(cursor.prev().unwrap(), (98, "98".to_string()));

    // past the last key: nothing ahead, the maximum behind
    let mut cursor = tree.browse_from(&rtx, &1500).unwrap();
    assert!(!cursor.has_next());
    assert_eq!(cursor.prev().unwrap(), (1000, "1000".to_string()));
}

#[test]
fn test_cursor_ends_error() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("scan.db"));
    let tree = common::create_tree(&rm, "ends", 4, false);
    common::insert_all(&rm, &tree, &[1, 2]);

    let rtx = rm.begin_read();
    let mut cursor = tree.browse(&rtx).unwrap();
    assert!(!cursor.has_prev());
    assert!(matches!(cursor.prev(), Err(Error::Cursor(_))));

    cursor.next().unwrap();
    cursor.next().unwrap();
    assert!(!cursor.has_next());
    assert!(matches!(cursor.next(), Err(Error::Cursor(_))));

    // the sentinel positions are re-enterable
    cursor.before_first().unwrap();
    assert_eq!(cursor.next().unwrap(), (1, "1".to_string()));
    cursor.after_last().unwrap();
    assert_eq!(cursor.prev().unwrap(), (2, "2".to_string()));
}

#[test]
fn test_empty_tree_cursor() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("scan.db"));
    let tree = common::create_tree(&rm, "empty", 4, false);

    let rtx = rm.begin_read();
    let mut cursor = tree.browse(&rtx).unwrap();
    assert!(!cursor.has_next());
    assert!(!cursor.has_prev());
    assert!(cursor.next().is_err());
    assert!(cursor.prev().is_err());
}

#[test]
fn test_next_key_prev_key_unique_keys() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("scan.db"));
    let tree = common::create_tree(&rm, "distinct", 4, false);
    common::insert_all(&rm, &tree, &[10, 20, 30]);

    let rtx = rm.begin_read();
    let mut cursor = tree.browse(&rtx).unwrap();
    assert_eq!(cursor.next_key().unwrap().0, 10);
    assert_eq!(cursor.next_key().unwrap().0, 20);
    assert_eq!(cursor.prev_key().unwrap().0, 10);
    assert_eq!(cursor.next_key().unwrap().0, 20);
}

#[test]
fn test_cursor_unaffected_by_later_commits() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("scan.db"));
    let tree = common::create_tree(&rm, "stable", 4, false);
    common::insert_all(&rm, &tree, &[1, 2, 3]);

    let rtx = rm.begin_read();
    let mut cursor = tree.browse(&rtx).unwrap();
    assert_eq!(cursor.next().unwrap().0, 1);

    // a writer replaces everything while the cursor is mid-walk
    common::insert_all(&rm, &tree, &[100, 200]);
    {
        let mut tx = rm.begin_write().unwrap();
        tree.delete(&mut tx, &2).unwrap();
        tx.commit().unwrap();
    }

    assert_eq!(cursor.next().unwrap().0, 2);
    assert_eq!(cursor.next().unwrap().0, 3);
    assert!(!cursor.has_next());
}

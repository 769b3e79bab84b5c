use mavibot::TxView;

mod common;

#[test]
fn test_basic_browse() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("insert.db"));
    let tree = common::create_tree(&rm, "basic", 8, false);

    common::insert_all(&rm, &tree, &[1, 4, 2, 3, 5]);

    let rtx = rm.begin_read();
    let expected: Vec<(i64, String)> =
        (1..=5).map(|k| (k, k.to_string())).collect();

    let mut cursor = tree.browse(&rtx).unwrap();
    assert_eq!(common::collect_forward(&mut cursor), expected);

    let mut cursor = tree.browse_from(&rtx, &0).unwrap();
    assert_eq!(common::collect_forward(&mut cursor), expected);

    let mut cursor = tree.browse_from(&rtx, &4).unwrap();
    assert_eq!(
        common::collect_forward(&mut cursor),
        vec![(4, "4".to_string()), (5, "5".to_string())]
    );

    let mut cursor = tree.browse_backward(&rtx).unwrap();
    let mut reversed = expected.clone();
    reversed.reverse();
    assert_eq!(common::collect_backward(&mut cursor), reversed);
}

#[test]
fn test_get_after_insert() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("insert.db"));
    let tree = common::create_tree(&rm, "gets", 8, false);

    let keys: Vec<i64> = (0..200).map(|i| (i * 37) % 199).collect();
    common::insert_all(&rm, &tree, &keys);

    let rtx = rm.begin_read();
    for &k in &keys {
        assert_eq!(tree.get(&rtx, &k).unwrap(), Some(k.to_string()));
        assert!(tree.has_key(&rtx, &k).unwrap());
    }
    assert_eq!(tree.get(&rtx, &1000).unwrap(), None);
    assert!(!tree.has_key(&rtx, &1000).unwrap());
    tree.check_integrity(&rtx, true).unwrap();
}

#[test]
fn test_overwrite_returns_old_value() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("insert.db"));
    let tree = common::create_tree(&rm, "overwrite", 8, false);

    let mut tx = rm.begin_write().unwrap();
    assert_eq!(tree.insert(&mut tx, &1, &"1".to_string()).unwrap(), None);
    assert_eq!(
        tree.insert(&mut tx, &1, &"10".to_string()).unwrap(),
        Some("1".to_string())
    );
    tx.commit().unwrap();

    let rtx = rm.begin_read();
    assert_eq!(tree.get(&rtx, &1).unwrap(), Some("10".to_string()));
    assert_eq!(tree.count(&rtx).unwrap(), 1);
}

#[test]
fn test_ascending_inserts_split() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("insert.db"));
    let tree = common::create_tree(&rm, "ascending", 4, false);

    let keys: Vec<i64> = (1..=100).collect();
    common::insert_all(&rm, &tree, &keys);

    let rtx = rm.begin_read();
    assert_eq!(tree.count(&rtx).unwrap(), 100);
    tree.check_integrity(&rtx, true).unwrap();

    let mut cursor = tree.browse(&rtx).unwrap();
    let browsed = common::collect_forward(&mut cursor);
    assert_eq!(browsed.len(), 100);
    for (i, (k, v)) in browsed.iter().enumerate() {
        assert_eq!(*k, i as i64 + 1);
        assert_eq!(v, &k.to_string());
    }
}

#[test]
fn test_random_inserts_stay_sorted() {
    common::setup();
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("insert.db"));
    let tree = common::create_tree(&rm, "random", 4, false);

    let mut keys: Vec<i64> = (0..500).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(7));
    common::insert_all(&rm, &tree, &keys);

    let rtx = rm.begin_read();
    let mut cursor = tree.browse(&rtx).unwrap();
    let browsed = common::collect_forward(&mut cursor);
    let sorted: Vec<(i64, String)> =
        (0..500).map(|k| (k, k.to_string())).collect();
    assert_eq!(browsed, sorted);
    tree.check_integrity(&rtx, true).unwrap();
}

#[test]
fn test_writer_sees_own_changes() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("insert.db"));
    let tree = common::create_tree(&rm, "self-view", 8, false);

    let mut tx = rm.begin_write().unwrap();
    tree.insert(&mut tx, &7, &"7".to_string()).unwrap();

    // the uncommitted write transaction observes its own insert
    assert_eq!(tree.get(&tx, &7).unwrap(), Some("7".to_string()));
    assert_eq!(tx.revision(), rm.current_revision() + 1);

    // a concurrent reader does not
    let rtx = rm.begin_read();
    assert_eq!(tree.get(&rtx, &7).unwrap(), None);
    drop(rtx);

    tx.commit().unwrap();
    let rtx = rm.begin_read();
    assert_eq!(tree.get(&rtx, &7).unwrap(), Some("7".to_string()));
}

#[test]
fn test_add_tree_twice_fails() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("insert.db"));
    common::create_tree(&rm, "dup-name", 8, false);

    let result = rm.add_tree(
        "dup-name",
        mavibot::LongSerializer,
        mavibot::StringSerializer,
        mavibot::TreeConfig::default(),
    );
    assert!(matches!(result, Err(mavibot::Error::AlreadyManaged(_))));
}

#[test]
fn test_get_tree_by_name() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let rm = common::open_rm(dir.path().join("insert.db"));
    let tree = common::create_tree(&rm, "found", 8, false);
    common::insert_all(&rm, &tree, &[42]);

    let found = rm
        .get_tree("found", mavibot::LongSerializer, mavibot::StringSerializer)
        .unwrap()
        .unwrap();
    let rtx = rm.begin_read();
    assert_eq!(found.get(&rtx, &42).unwrap(), Some("42".to_string()));

    assert!(rm
        .get_tree("absent", mavibot::LongSerializer, mavibot::StringSerializer)
        .unwrap()
        .is_none());

    // a serializer mismatch is detected through the stored type tags
    assert!(rm
        .get_tree("found", mavibot::IntSerializer, mavibot::StringSerializer)
        .is_err());
}

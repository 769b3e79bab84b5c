#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use mavibot::{
    BTree, LongSerializer, RecordManager, RecordManagerConfig,
    StringSerializer, TreeConfig,
};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(mavibot::init_log);
}

/// Small pages and an eager reclaimer keep the interesting paths hot.
pub fn small_config() -> RecordManagerConfig {
    RecordManagerConfig {
        page_size: 128,
        cache_capacity: 64,
        reclaimer_threshold: 1,
    }
}

pub fn open_rm<P: AsRef<Path>>(path: P) -> RecordManager {
    RecordManager::open(path, small_config()).unwrap()
}

pub fn create_tree(
    rm: &RecordManager,
    name: &str,
    page_size: usize,
    allow_dups: bool,
) -> BTree<LongSerializer, StringSerializer> {
    rm.add_tree(
        name,
        LongSerializer,
        StringSerializer,
        TreeConfig {
            page_size,
            allow_dups,
            ..TreeConfig::default()
        },
    )
    .unwrap()
}

/// Insert every key as (k, k.to_string()) in one committed transaction.
pub fn insert_all(
    rm: &RecordManager,
    tree: &BTree<LongSerializer, StringSerializer>,
    keys: &[i64],
) {
    let mut tx = rm.begin_write().unwrap();
    for &k in keys {
        tree.insert(&mut tx, &k, &k.to_string()).unwrap();
    }
    tx.commit().unwrap();
}

/// Drain a cursor forward into a vector of pairs.
pub fn collect_forward<C>(cursor: &mut C) -> Vec<(i64, String)>
where
    C: CursorLike,
{
    let mut out = Vec::new();
    while cursor.has_next() {
        out.push(cursor.next().unwrap());
    }
    out
}

pub fn collect_backward<C>(cursor: &mut C) -> Vec<(i64, String)>
where
    C: CursorLike,
{
    let mut out = Vec::new();
    while cursor.has_prev() {
        out.push(cursor.prev().unwrap());
    }
    out
}

/// The few cursor operations the helpers need, so they work for cursors
/// over both read and write transactions.
pub trait CursorLike {
    fn has_next(&self) -> bool;
    fn has_prev(&self) -> bool;
    fn next(&mut self) -> mavibot::Result<(i64, String)>;
    fn prev(&mut self) -> mavibot::Result<(i64, String)>;
}

impl<'t, T: mavibot::TxView>
    CursorLike
    for mavibot::Cursor<'t, LongSerializer, StringSerializer, T>
{
    fn has_next(&self) -> bool {
        mavibot::Cursor::has_next(self)
    }
    fn has_prev(&self) -> bool {
        mavibot::Cursor::has_prev(self)
    }
    fn next(&mut self) -> mavibot::Result<(i64, String)> {
        mavibot::Cursor::next(self)
    }
    fn prev(&mut self) -> mavibot::Result<(i64, String)> {
        mavibot::Cursor::prev(self)
    }
}

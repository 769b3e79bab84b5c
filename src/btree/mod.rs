mod cursor;
mod delete;
mod insert;

pub(crate) mod page;

pub use cursor::Cursor;

use std::cmp::Ordering;

use crate::{
    error::Error, serializer::Serializer, transaction::TxView, Result,
};

use page::{decode_value_set, BTreePage, ValueSlot};

/// Shape of one named tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Maximum elements per leaf or node page.
    pub page_size: usize,
    /// Whether one key may map to several values.
    pub allow_dups: bool,
    /// Duplicate values per key kept inline before they overflow into a
    /// sub-tree.
    pub dup_threshold: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            page_size: 16,
            allow_dups: false,
            dup_threshold: 4,
        }
    }
}

/// Comparators and limits threaded through every tree operation. The
/// sub-tree of a duplicate slot runs the same operations with the value
/// order as its key order.
pub(crate) struct OpCtx<'a> {
    pub name: &'a str,
    pub cmp: &'a dyn Fn(&[u8], &[u8]) -> Result<Ordering>,
    pub value_cmp: &'a dyn Fn(&[u8], &[u8]) -> Result<Ordering>,
    pub capacity: usize,
    pub allow_dups: bool,
    pub dup_threshold: usize,
}

impl<'a> OpCtx<'a> {
    pub fn min_occupancy(&self) -> usize {
        self.capacity / 2
    }

    /// Threshold clamped so an overflowing set always fits one sub-tree
    /// leaf.
    pub fn effective_dup_threshold(&self) -> usize {
        self.dup_threshold.min(self.capacity - 1).max(1)
    }

    pub fn sub(&self) -> OpCtx<'a> {
        OpCtx {
            name: self.name,
            cmp: self.value_cmp,
            value_cmp: &empty_value_cmp,
            capacity: self.capacity,
            allow_dups: false,
            dup_threshold: self.dup_threshold,
        }
    }
}

/// Sub-tree values are always empty; any two compare equal.
fn empty_value_cmp(_: &[u8], _: &[u8]) -> Result<Ordering> {
    Ok(Ordering::Equal)
}

/// Binary search over serialized keys with a fallible comparator.
/// `Ok(Ok(i))` when the target sits at `i`, `Ok(Err(i))` with the
/// insertion point otherwise.
pub(crate) fn search(
    keys: &[Vec<u8>],
    target: &[u8],
    cmp: &dyn Fn(&[u8], &[u8]) -> Result<Ordering>,
) -> Result<std::result::Result<usize, usize>> {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp(&keys[mid], target)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => return Ok(Ok(mid)),
            Ordering::Greater => hi = mid,
        }
    }
    Ok(Err(lo))
}

/// Index of the child to descend into: the child to the right of the
/// last separator less than or equal to the target.
pub(crate) fn child_index(
    keys: &[Vec<u8>],
    target: &[u8],
    cmp: &dyn Fn(&[u8], &[u8]) -> Result<Ordering>,
) -> Result<usize> {
    Ok(match search(keys, target, cmp)? {
        Ok(i) => i + 1,
        Err(i) => i,
    })
}

pub(crate) fn read_page<T: TxView>(tx: &T, offset: u64) -> Result<BTreePage> {
    BTreePage::decode(&tx.read_record(offset)?)
}

/// Descend to the leaf slot holding `key`, if any.
pub(crate) fn lookup_slot<T: TxView>(
    tx: &T,
    root: u64,
    key: &[u8],
    cmp: &dyn Fn(&[u8], &[u8]) -> Result<Ordering>,
) -> Result<Option<ValueSlot>> {
    let mut offset = root;
    loop {
        match read_page(tx, offset)? {
            BTreePage::Node(node) => {
                let idx = child_index(&node.keys, key, cmp)?;
                offset = node.children[idx];
            }
            BTreePage::Leaf(leaf) => {
                return Ok(match search(&leaf.keys, key, cmp)? {
                    Ok(i) => Some(leaf.values[i].clone()),
                    Err(_) => None,
                });
            }
        }
    }
}

/// Smallest key of a sub-tree (the first duplicate value).
pub(crate) fn subtree_first<T: TxView>(tx: &T, root: u64) -> Result<Vec<u8>> {
    let mut offset = root;
    loop {
        match read_page(tx, offset)? {
            BTreePage::Node(node) => offset = node.children[0],
            BTreePage::Leaf(leaf) => {
                return leaf.keys.first().cloned().ok_or_else(|| {
                    Error::corrupt("duplicate sub-tree is empty")
                });
            }
        }
    }
}

pub(crate) fn subtree_count<T: TxView>(tx: &T, root: u64) -> Result<u64> {
    let mut count = 0;
    let mut stack = vec![root];
    while let Some(offset) = stack.pop() {
        match read_page(tx, offset)? {
            BTreePage::Node(node) => stack.extend(node.children),
            BTreePage::Leaf(leaf) => count += leaf.keys.len() as u64,
        }
    }
    Ok(count)
}

/// Record head offsets of every page in a tree, sub-trees included.
pub(crate) fn collect_tree_records<T: TxView>(
    tx: &T,
    root: u64,
    out: &mut Vec<u64>,
) -> Result<()> {
    let mut stack = vec![root];
    while let Some(offset) = stack.pop() {
        out.push(offset);
        match read_page(tx, offset)? {
            BTreePage::Node(node) => stack.extend(node.children),
            BTreePage::Leaf(leaf) => {
                for slot in &leaf.values {
                    if let ValueSlot::SubTree(sub) = slot {
                        stack.push(*sub);
                    }
                }
            }
        }
    }
    Ok(())
}

/// A named, persistent ordered map inside a record manager.
///
/// The handle itself is stateless: every operation resolves the tree's
/// current root through the transaction it is given, so one handle serves
/// any number of revisions concurrently.
pub struct BTree<KS, VS> {
    name: String,
    key_serializer: KS,
    value_serializer: VS,
    config: TreeConfig,
}

impl<KS, VS> BTree<KS, VS>
where
    KS: Serializer,
    VS: Serializer,
{
    pub(crate) fn new(
        name: String,
        key_serializer: KS,
        value_serializer: VS,
        config: TreeConfig,
    ) -> Self {
        Self {
            name,
            key_serializer,
            value_serializer,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Tune the inline-to-sub-tree overflow point for duplicate values.
    pub fn set_dup_threshold(&mut self, threshold: usize) {
        self.config.dup_threshold = threshold.max(1);
    }

    pub(crate) fn key_serializer(&self) -> &KS {
        &self.key_serializer
    }

    pub(crate) fn value_serializer(&self) -> &VS {
        &self.value_serializer
    }

    pub(crate) fn with_ctx<R>(
        &self,
        f: impl FnOnce(&OpCtx<'_>) -> Result<R>,
    ) -> Result<R> {
        let cmp =
            move |a: &[u8], b: &[u8]| self.key_serializer.compare(a, b);
        let value_cmp =
            move |a: &[u8], b: &[u8]| self.value_serializer.compare(a, b);
        let ctx = OpCtx {
            name: &self.name,
            cmp: &cmp,
            value_cmp: &value_cmp,
            capacity: self.config.page_size,
            allow_dups: self.config.allow_dups,
            dup_threshold: self.config.dup_threshold,
        };
        f(&ctx)
    }

    /// Look up the value for a key; in duplicates mode, the smallest of
    /// its values.
    pub fn get<T: TxView>(
        &self,
        tx: &T,
        key: &KS::Item,
    ) -> Result<Option<VS::Item>> {
        let key_bytes = self.key_serializer.serialize(key);
        let root = tx.tree_root(&self.name)?.root;
        let cmp =
            |a: &[u8], b: &[u8]| self.key_serializer.compare(a, b);

        let slot = match lookup_slot(tx, root, &key_bytes, &cmp)? {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let bytes = match slot {
            ValueSlot::Inline(bytes) if self.config.allow_dups => {
                let set = decode_value_set(&bytes)?;
                set.first()
                    .cloned()
                    .ok_or_else(|| Error::corrupt("empty duplicate set"))?
            }
            ValueSlot::Inline(bytes) => bytes,
            ValueSlot::SubTree(sub) => subtree_first(tx, sub)?,
        };
        Ok(Some(self.value_serializer.deserialize(&bytes)?))
    }

    pub fn has_key<T: TxView>(&self, tx: &T, key: &KS::Item) -> Result<bool> {
        let key_bytes = self.key_serializer.serialize(key);
        let root = tx.tree_root(&self.name)?.root;
        let cmp =
            |a: &[u8], b: &[u8]| self.key_serializer.compare(a, b);
        Ok(lookup_slot(tx, root, &key_bytes, &cmp)?.is_some())
    }

    /// Whether the exact (key, value) pair is present.
    pub fn contains<T: TxView>(
        &self,
        tx: &T,
        key: &KS::Item,
        value: &VS::Item,
    ) -> Result<bool> {
        let key_bytes = self.key_serializer.serialize(key);
        let value_bytes = self.value_serializer.serialize(value);
        let root = tx.tree_root(&self.name)?.root;
        let cmp =
            |a: &[u8], b: &[u8]| self.key_serializer.compare(a, b);
        let value_cmp =
            |a: &[u8], b: &[u8]| self.value_serializer.compare(a, b);

        let slot = match lookup_slot(tx, root, &key_bytes, &cmp)? {
            Some(slot) => slot,
            None => return Ok(false),
        };
        match slot {
            ValueSlot::Inline(bytes) if self.config.allow_dups => {
                let set = decode_value_set(&bytes)?;
                Ok(search(&set, &value_bytes, &value_cmp)?.is_ok())
            }
            ValueSlot::Inline(bytes) => {
                Ok(value_cmp(&bytes, &value_bytes)? == Ordering::Equal)
            }
            ValueSlot::SubTree(sub) => {
                Ok(lookup_slot(tx, sub, &value_bytes, &value_cmp)?.is_some())
            }
        }
    }

    /// Number of (key, value) pairs.
    pub fn count<T: TxView>(&self, tx: &T) -> Result<u64> {
        Ok(tx.tree_root(&self.name)?.count)
    }

    /// A cursor positioned before the first element.
    pub fn browse<'t, T: TxView>(
        &'t self,
        tx: &'t T,
    ) -> Result<Cursor<'t, KS, VS, T>> {
        Cursor::open_before_first(self, tx)
    }

    /// A cursor positioned after the last element.
    pub fn browse_backward<'t, T: TxView>(
        &'t self,
        tx: &'t T,
    ) -> Result<Cursor<'t, KS, VS, T>> {
        Cursor::open_after_last(self, tx)
    }

    /// A cursor positioned before the first element with key >= `key`.
    pub fn browse_from<'t, T: TxView>(
        &'t self,
        tx: &'t T,
        key: &KS::Item,
    ) -> Result<Cursor<'t, KS, VS, T>> {
        Cursor::open_from_key(self, tx, key)
    }

    /// Walk the whole tree asserting its structural invariants. Test
    /// support; panics on violation.
    pub fn check_integrity<T: TxView>(
        &self,
        tx: &T,
        check_occupancy: bool,
    ) -> Result<()> {
        let root = tx.tree_root(&self.name)?;
        let count = self.with_ctx(|ctx| {
            let check = check_page(
                tx,
                root.root,
                None,
                None,
                true,
                check_occupancy,
                ctx,
            )?;
            Ok(check.count)
        })?;
        assert_eq!(
            count,
            root.count,
            "stored element count disagrees with the tree"
        );
        Ok(())
    }
}

struct PageCheck {
    depth: usize,
    count: u64,
}

fn check_page<T: TxView>(
    tx: &T,
    offset: u64,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    is_root: bool,
    check_occupancy: bool,
    ctx: &OpCtx<'_>,
) -> Result<PageCheck> {
    let in_bounds = |key: &[u8]| -> Result<()> {
        if let Some(lower) = lower {
            assert_ne!(
                (ctx.cmp)(key, lower)?,
                Ordering::Less,
                "key below its subtree's lower bound"
            );
        }
        if let Some(upper) = upper {
            assert_eq!(
                (ctx.cmp)(key, upper)?,
                Ordering::Less,
                "key at or above its subtree's upper bound"
            );
        }
        Ok(())
    };

    match read_page(tx, offset)? {
        BTreePage::Leaf(leaf) => {
            assert_eq!(leaf.keys.len(), leaf.values.len());
            assert!(leaf.keys.len() <= ctx.capacity, "leaf overflow");
            if check_occupancy && !is_root {
                assert!(
                    leaf.keys.len() >= ctx.min_occupancy(),
                    "leaf below minimum occupancy"
                );
            }

            let mut count = 0;
            for (i, key) in leaf.keys.iter().enumerate() {
                if i > 0 {
                    assert_eq!(
                        (ctx.cmp)(&leaf.keys[i - 1], key)?,
                        Ordering::Less,
                        "leaf keys out of order"
                    );
                }
                in_bounds(key)?;

                match &leaf.values[i] {
                    ValueSlot::Inline(bytes) if ctx.allow_dups => {
                        let set = decode_value_set(bytes)?;
                        assert!(!set.is_empty(), "empty duplicate set");
                        assert!(
                            set.len() <= ctx.effective_dup_threshold(),
                            "inline duplicate set past its threshold"
                        );
                        for w in set.windows(2) {
                            assert_eq!(
                                (ctx.value_cmp)(&w[0], &w[1])?,
                                Ordering::Less,
                                "duplicate set out of order"
                            );
                        }
                        count += set.len() as u64;
                    }
                    ValueSlot::Inline(_) => count += 1,
                    ValueSlot::SubTree(sub) => {
                        assert!(ctx.allow_dups, "sub-tree in a non-dup tree");
                        let sub_ctx = ctx.sub();
                        let sub_check = check_page(
                            tx,
                            *sub,
                            None,
                            None,
                            true,
                            check_occupancy,
                            &sub_ctx,
                        )?;
                        assert!(
                            sub_check.count > 1,
                            "sub-tree too small to stay a sub-tree"
                        );
                        count += sub_check.count;
                    }
                }
            }
            Ok(PageCheck { depth: 1, count })
        }
        BTreePage::Node(node) => {
            assert_eq!(node.children.len(), node.keys.len() + 1);
            assert!(node.keys.len() <= ctx.capacity, "node overflow");
            assert!(!node.keys.is_empty(), "node without separators");
            if check_occupancy && !is_root {
                assert!(
                    node.keys.len() >= ctx.min_occupancy(),
                    "node below minimum occupancy"
                );
            }

            let mut depth = None;
            let mut count = 0;
            for (i, key) in node.keys.iter().enumerate() {
                if i > 0 {
                    assert_eq!(
                        (ctx.cmp)(&node.keys[i - 1], key)?,
                        Ordering::Less,
                        "node keys out of order"
                    );
                }
                in_bounds(key)?;
            }
            for i in 0..node.children.len() {
                let child_lower =
                    if i == 0 { lower } else { Some(&node.keys[i - 1][..]) };
                let child_upper = if i == node.keys.len() {
                    upper
                } else {
                    Some(&node.keys[i][..])
                };
                let check = check_page(
                    tx,
                    node.children[i],
                    child_lower,
                    child_upper,
                    false,
                    check_occupancy,
                    ctx,
                )?;
                match depth {
                    None => depth = Some(check.depth),
                    Some(d) => {
                        assert_eq!(d, check.depth, "leaves at unequal depth")
                    }
                }
                count += check.count;
            }
            Ok(PageCheck {
                depth: depth.unwrap() + 1,
                count,
            })
        }
    }
}

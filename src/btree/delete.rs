use log::debug;

use crate::{
    error::Error,
    serializer::Serializer,
    transaction::{TxView, WriteTx},
    Result,
};

use super::{
    child_index, collect_tree_records,
    page::{encode_value_set, BTreePage, LeafPage, NodePage, ValueSlot},
    read_page, search, subtree_count, subtree_first, BTree, OpCtx,
};

pub(crate) struct RawDelete {
    pub root: u64,
    /// Serialized value removed (the smallest one when a whole duplicate
    /// set goes).
    pub removed: Vec<u8>,
    pub delta: i64,
}

enum RecDelete {
    NotFound,
    Done {
        offset: u64,
        underflow: bool,
        removed: Vec<u8>,
        delta: i64,
    },
}

impl<KS, VS> BTree<KS, VS>
where
    KS: Serializer,
    VS: Serializer,
{
    /// Remove a key and everything stored under it. Returns the removed
    /// (key, value) pair (the smallest value in duplicates mode), or
    /// `None` when the key is absent.
    pub fn delete(
        &self,
        tx: &mut WriteTx<'_>,
        key: &KS::Item,
    ) -> Result<Option<(KS::Item, VS::Item)>> {
        let key_bytes = self.key_serializer().serialize(key);
        let root = tx.tree_root(self.name())?.root;

        let result = self.with_ctx(|ctx| {
            delete_raw(tx, root, &key_bytes, None, ctx)
        })?;
        self.finish_delete(tx, result, &key_bytes)
    }

    /// Remove one exact (key, value) pair. On a tree without duplicates
    /// the pair is removed only when the stored value matches.
    pub fn delete_value(
        &self,
        tx: &mut WriteTx<'_>,
        key: &KS::Item,
        value: &VS::Item,
    ) -> Result<Option<(KS::Item, VS::Item)>> {
        let key_bytes = self.key_serializer().serialize(key);
        let value_bytes = self.value_serializer().serialize(value);
        let root = tx.tree_root(self.name())?.root;

        let result = self.with_ctx(|ctx| {
            delete_raw(tx, root, &key_bytes, Some(&value_bytes), ctx)
        })?;
        self.finish_delete(tx, result, &key_bytes)
    }

    fn finish_delete(
        &self,
        tx: &mut WriteTx<'_>,
        result: Option<RawDelete>,
        key_bytes: &[u8],
    ) -> Result<Option<(KS::Item, VS::Item)>> {
        match result {
            None => Ok(None),
            Some(raw) => {
                tx.update_tree_root(self.name(), raw.root, raw.delta)?;
                Ok(Some((
                    self.key_serializer().deserialize(key_bytes)?,
                    self.value_serializer().deserialize(&raw.removed)?,
                )))
            }
        }
    }
}

pub(crate) fn delete_raw(
    tx: &mut WriteTx<'_>,
    root: u64,
    key: &[u8],
    value: Option<&[u8]>,
    ctx: &OpCtx<'_>,
) -> Result<Option<RawDelete>> {
    match delete_rec(tx, root, key, value, ctx)? {
        RecDelete::NotFound => Ok(None),
        RecDelete::Done {
            offset,
            removed,
            delta,
            ..
        } => {
            // a root node left with a single child collapses into it
            let new_root = match read_page(tx, offset)? {
                BTreePage::Node(node) if node.keys.is_empty() => {
                    debug!("root collapse, new root {:#x}", node.children[0]);
                    tx.supersede_record(offset)?;
                    node.children[0]
                }
                _ => offset,
            };
            Ok(Some(RawDelete {
                root: new_root,
                removed,
                delta,
            }))
        }
    }
}

fn delete_rec(
    tx: &mut WriteTx<'_>,
    offset: u64,
    key: &[u8],
    value: Option<&[u8]>,
    ctx: &OpCtx<'_>,
) -> Result<RecDelete> {
    match read_page(tx, offset)? {
        BTreePage::Leaf(leaf) => {
            delete_from_leaf(tx, offset, leaf, key, value, ctx)
        }
        BTreePage::Node(node) => {
            let idx = child_index(&node.keys, key, ctx.cmp)?;
            match delete_rec(tx, node.children[idx], key, value, ctx)? {
                RecDelete::NotFound => Ok(RecDelete::NotFound),
                RecDelete::Done {
                    offset: child,
                    underflow,
                    removed,
                    delta,
                } => {
                    let mut node = node;
                    node.revision = tx.revision();
                    node.children[idx] = child;

                    if underflow {
                        rebalance_child(tx, &mut node, idx, ctx)?;
                    }

                    let new_underflow =
                        node.keys.len() < ctx.min_occupancy();
                    let new_offset = tx
                        .write_record_pages(&BTreePage::Node(node).encode())?;
                    tx.supersede_record(offset)?;
                    Ok(RecDelete::Done {
                        offset: new_offset,
                        underflow: new_underflow,
                        removed,
                        delta,
                    })
                }
            }
        }
    }
}

fn delete_from_leaf(
    tx: &mut WriteTx<'_>,
    offset: u64,
    mut leaf: LeafPage,
    key: &[u8],
    value: Option<&[u8]>,
    ctx: &OpCtx<'_>,
) -> Result<RecDelete> {
    let i = match search(&leaf.keys, key, ctx.cmp)? {
        Ok(i) => i,
        Err(_) => return Ok(RecDelete::NotFound),
    };

    let removed;
    let delta;
    let mut drop_key = false;

    if !ctx.allow_dups {
        let stored = match &leaf.values[i] {
            ValueSlot::Inline(bytes) => bytes.clone(),
            ValueSlot::SubTree(_) => {
                return Err(Error::corrupt("sub-tree in a non-dup tree"));
            }
        };
        if let Some(expected) = value {
            if (ctx.value_cmp)(&stored, expected)? != std::cmp::Ordering::Equal
            {
                return Ok(RecDelete::NotFound);
            }
        }
        removed = stored;
        delta = -1;
        drop_key = true;
    } else {
        match leaf.values[i].clone() {
            ValueSlot::Inline(bytes) => {
                let mut set = super::page::decode_value_set(&bytes)?;
                match value {
                    None => {
                        removed = set[0].clone();
                        delta = -(set.len() as i64);
                        drop_key = true;
                    }
                    Some(target) => {
                        let j = match search(&set, target, ctx.value_cmp)? {
                            Ok(j) => j,
                            Err(_) => return Ok(RecDelete::NotFound),
                        };
                        removed = set.remove(j);
                        delta = -1;
                        if set.is_empty() {
                            drop_key = true;
                        } else {
                            leaf.values[i] =
                                ValueSlot::Inline(encode_value_set(&set));
                        }
                    }
                }
            }
            ValueSlot::SubTree(sub_root) => {
                match value {
                    None => {
                        removed = subtree_first(tx, sub_root)?;
                        delta = -(subtree_count(tx, sub_root)? as i64);
                        free_subtree(tx, sub_root)?;
                        drop_key = true;
                    }
                    Some(target) => {
                        let sub_ctx = ctx.sub();
                        let sub = match delete_raw(
                            tx, sub_root, target, None, &sub_ctx,
                        )? {
                            Some(sub) => sub,
                            None => return Ok(RecDelete::NotFound),
                        };
                        removed = target.to_vec();
                        delta = -1;
                        leaf.values[i] =
                            shrink_subtree_slot(tx, sub.root)?;
                    }
                }
            }
        }
    }

    if drop_key {
        leaf.keys.remove(i);
        leaf.values.remove(i);
    }

    leaf.revision = tx.revision();
    let underflow = leaf.keys.len() < ctx.min_occupancy();
    let new_offset = tx.write_record_pages(&BTreePage::Leaf(leaf).encode())?;
    tx.supersede_record(offset)?;
    Ok(RecDelete::Done {
        offset: new_offset,
        underflow,
        removed,
        delta,
    })
}

/// After a sub-tree deletion, fold a one-value sub-tree back inline.
fn shrink_subtree_slot(
    tx: &mut WriteTx<'_>,
    sub_root: u64,
) -> Result<ValueSlot> {
    if let BTreePage::Leaf(leaf) = read_page(tx, sub_root)? {
        if leaf.keys.len() == 1 {
            tx.supersede_record(sub_root)?;
            return Ok(ValueSlot::Inline(encode_value_set(&leaf.keys)));
        }
    }
    Ok(ValueSlot::SubTree(sub_root))
}

/// Hand every page of a duplicate sub-tree to the reclaimer.
fn free_subtree(tx: &mut WriteTx<'_>, root: u64) -> Result<()> {
    let mut records = Vec::new();
    collect_tree_records(tx, root, &mut records)?;
    for record in records {
        tx.supersede_record(record)?;
    }
    Ok(())
}

/// Bring the child at `idx` back to minimum occupancy by borrowing from a
/// sibling through the parent separator, or by merging with one. The left
/// sibling is preferred on both paths.
fn rebalance_child(
    tx: &mut WriteTx<'_>,
    node: &mut NodePage,
    idx: usize,
    ctx: &OpCtx<'_>,
) -> Result<()> {
    let min = ctx.min_occupancy();

    let page_len = |page: &BTreePage| match page {
        BTreePage::Leaf(leaf) => leaf.keys.len(),
        BTreePage::Node(node) => node.keys.len(),
    };

    let left = if idx > 0 {
        Some(read_page(tx, node.children[idx - 1])?)
    } else {
        None
    };
    let right = if idx + 1 < node.children.len() {
        Some(read_page(tx, node.children[idx + 1])?)
    } else {
        None
    };

    if let Some(sibling) = &left {
        if page_len(sibling) > min {
            return borrow(tx, node, idx, sibling.clone(), true);
        }
    }
    if let Some(sibling) = &right {
        if page_len(sibling) > min {
            return borrow(tx, node, idx, sibling.clone(), false);
        }
    }
    if left.is_some() {
        merge(tx, node, idx - 1)
    } else if right.is_some() {
        merge(tx, node, idx)
    } else {
        Err(Error::corrupt("underflowing page has no siblings"))
    }
}

/// Move one element from a richer sibling into the child, rotating the
/// parent separator.
fn borrow(
    tx: &mut WriteTx<'_>,
    node: &mut NodePage,
    idx: usize,
    sibling: BTreePage,
    from_left: bool,
) -> Result<()> {
    let sibling_idx = if from_left { idx - 1 } else { idx + 1 };
    let sibling_offset = node.children[sibling_idx];
    let child_offset = node.children[idx];
    let child = read_page(tx, child_offset)?;
    let separator_idx = if from_left { idx - 1 } else { idx };

    let (new_sibling, new_child, new_separator) = match (sibling, child) {
        (BTreePage::Leaf(mut sibling), BTreePage::Leaf(mut child)) => {
            if from_left {
                let key = sibling.keys.pop().unwrap();
                let value = sibling.values.pop().unwrap();
                child.keys.insert(0, key);
                child.values.insert(0, value);
                let separator = child.keys[0].clone();
                (
                    BTreePage::Leaf(sibling),
                    BTreePage::Leaf(child),
                    separator,
                )
            } else {
                child.keys.push(sibling.keys.remove(0));
                child.values.push(sibling.values.remove(0));
                let separator = sibling.keys[0].clone();
                (
                    BTreePage::Leaf(sibling),
                    BTreePage::Leaf(child),
                    separator,
                )
            }
        }
        (BTreePage::Node(mut sibling), BTreePage::Node(mut child)) => {
            if from_left {
                // the separator comes down, the sibling's last key goes up
                child
                    .keys
                    .insert(0, node.keys[separator_idx].clone());
                child.children.insert(0, sibling.children.pop().unwrap());
                let separator = sibling.keys.pop().unwrap();
                (
                    BTreePage::Node(sibling),
                    BTreePage::Node(child),
                    separator,
                )
            } else {
                child.keys.push(node.keys[separator_idx].clone());
                child.children.push(sibling.children.remove(0));
                let separator = sibling.keys.remove(0);
                (
                    BTreePage::Node(sibling),
                    BTreePage::Node(child),
                    separator,
                )
            }
        }
        _ => return Err(Error::corrupt("siblings of unequal kind")),
    };

    let revision = tx.revision();
    let new_sibling = set_revision(new_sibling, revision);
    let new_child = set_revision(new_child, revision);

    node.children[sibling_idx] =
        tx.write_record_pages(&new_sibling.encode())?;
    node.children[idx] = tx.write_record_pages(&new_child.encode())?;
    node.keys[separator_idx] = new_separator;

    tx.supersede_record(sibling_offset)?;
    tx.supersede_record(child_offset)?;
    Ok(())
}

/// Merge the children at `left_idx` and `left_idx + 1`, pulling the
/// parent separator down between internal pages.
fn merge(
    tx: &mut WriteTx<'_>,
    node: &mut NodePage,
    left_idx: usize,
) -> Result<()> {
    let right_idx = left_idx + 1;
    let left_offset = node.children[left_idx];
    let right_offset = node.children[right_idx];

    let left = read_page(tx, left_offset)?;
    let right = read_page(tx, right_offset)?;
    let separator = node.keys[left_idx].clone();

    let merged = match (left, right) {
        (BTreePage::Leaf(mut left), BTreePage::Leaf(right)) => {
            left.keys.extend(right.keys);
            left.values.extend(right.values);
            BTreePage::Leaf(left)
        }
        (BTreePage::Node(mut left), BTreePage::Node(right)) => {
            left.keys.push(separator);
            left.keys.extend(right.keys);
            left.children.extend(right.children);
            BTreePage::Node(left)
        }
        _ => return Err(Error::corrupt("siblings of unequal kind")),
    };
    let merged = set_revision(merged, tx.revision());

    let merged_offset = tx.write_record_pages(&merged.encode())?;
    node.children[left_idx] = merged_offset;
    node.keys.remove(left_idx);
    node.children.remove(right_idx);

    tx.supersede_record(left_offset)?;
    tx.supersede_record(right_offset)?;
    debug!("merged pages into {:#x}", merged_offset);
    Ok(())
}

fn set_revision(page: BTreePage, revision: u64) -> BTreePage {
    match page {
        BTreePage::Leaf(mut leaf) => {
            leaf.revision = revision;
            BTreePage::Leaf(leaf)
        }
        BTreePage::Node(mut node) => {
            node.revision = revision;
            BTreePage::Node(node)
        }
    }
}

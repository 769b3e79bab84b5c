use log::debug;

use crate::{
    error::Error,
    serializer::Serializer,
    transaction::{TxView, WriteTx},
    Result,
};

use super::{
    child_index,
    page::{encode_value_set, BTreePage, LeafPage, NodePage, ValueSlot},
    read_page, search, BTree, OpCtx,
};

pub(crate) struct RawInsert {
    pub root: u64,
    pub replaced: Option<Vec<u8>>,
    pub delta: i64,
}

enum RecInsert {
    /// Nothing was written: the key already held exactly this value.
    Unchanged { replaced: Vec<u8> },
    One {
        offset: u64,
        replaced: Option<Vec<u8>>,
        delta: i64,
    },
    Two {
        left: u64,
        separator: Vec<u8>,
        right: u64,
        delta: i64,
    },
}

impl<KS, VS> BTree<KS, VS>
where
    KS: Serializer,
    VS: Serializer,
{
    /// Insert one (key, value) pair, copying every page on the path.
    ///
    /// Without duplicates an existing key has its value replaced and the
    /// old value is returned. With duplicates the value joins the key's
    /// set; re-inserting a pair already in the set fails with
    /// `DuplicateValueNotAllowed`.
    pub fn insert(
        &self,
        tx: &mut WriteTx<'_>,
        key: &KS::Item,
        value: &VS::Item,
    ) -> Result<Option<VS::Item>> {
        let key_bytes = self.key_serializer().serialize(key);
        let value_bytes = self.value_serializer().serialize(value);
        let root = tx.tree_root(self.name())?.root;

        let result = self.with_ctx(|ctx| {
            insert_raw(tx, root, &key_bytes, &value_bytes, ctx)
        })?;

        if result.root != root || result.delta != 0 {
            tx.update_tree_root(self.name(), result.root, result.delta)?;
        }
        match result.replaced {
            Some(bytes) => {
                Ok(Some(self.value_serializer().deserialize(&bytes)?))
            }
            None => Ok(None),
        }
    }
}

pub(crate) fn insert_raw(
    tx: &mut WriteTx<'_>,
    root: u64,
    key: &[u8],
    value: &[u8],
    ctx: &OpCtx<'_>,
) -> Result<RawInsert> {
    match insert_rec(tx, root, key, value, ctx)? {
        RecInsert::Unchanged { replaced } => Ok(RawInsert {
            root,
            replaced: Some(replaced),
            delta: 0,
        }),
        RecInsert::One {
            offset,
            replaced,
            delta,
        } => Ok(RawInsert {
            root: offset,
            replaced,
            delta,
        }),
        RecInsert::Two {
            left,
            separator,
            right,
            delta,
        } => {
            // the root split: the tree grows one level
            let new_root = BTreePage::Node(NodePage {
                revision: tx.revision(),
                keys: vec![separator],
                children: vec![left, right],
            });
            let offset = tx.write_record_pages(&new_root.encode())?;
            debug!("root split, new root at {:#x}", offset);
            Ok(RawInsert {
                root: offset,
                replaced: None,
                delta,
            })
        }
    }
}

fn insert_rec(
    tx: &mut WriteTx<'_>,
    offset: u64,
    key: &[u8],
    value: &[u8],
    ctx: &OpCtx<'_>,
) -> Result<RecInsert> {
    match read_page(tx, offset)? {
        BTreePage::Leaf(leaf) => {
            insert_into_leaf(tx, offset, leaf, key, value, ctx)
        }
        BTreePage::Node(node) => {
            let idx = child_index(&node.keys, key, ctx.cmp)?;
            match insert_rec(tx, node.children[idx], key, value, ctx)? {
                RecInsert::Unchanged { replaced } => {
                    Ok(RecInsert::Unchanged { replaced })
                }
                RecInsert::One {
                    offset: child,
                    replaced,
                    delta,
                } => {
                    let mut node = node;
                    node.revision = tx.revision();
                    node.children[idx] = child;
                    let new_offset =
                        tx.write_record_pages(&BTreePage::Node(node).encode())?;
                    tx.supersede_record(offset)?;
                    Ok(RecInsert::One {
                        offset: new_offset,
                        replaced,
                        delta,
                    })
                }
                RecInsert::Two {
                    left,
                    separator,
                    right,
                    delta,
                } => {
                    let mut node = node;
                    node.revision = tx.revision();
                    node.children[idx] = left;
                    node.keys.insert(idx, separator);
                    node.children.insert(idx + 1, right);

                    let result = if node.keys.len() <= ctx.capacity {
                        let new_offset = tx.write_record_pages(
                            &BTreePage::Node(node).encode(),
                        )?;
                        RecInsert::One {
                            offset: new_offset,
                            replaced: None,
                            delta,
                        }
                    } else {
                        split_node(tx, node, delta, ctx)?
                    };
                    tx.supersede_record(offset)?;
                    Ok(result)
                }
            }
        }
    }
}

/// Split an overflowing node: the median key moves up, children follow.
fn split_node(
    tx: &mut WriteTx<'_>,
    mut node: NodePage,
    delta: i64,
    ctx: &OpCtx<'_>,
) -> Result<RecInsert> {
    debug_assert!(node.keys.len() == ctx.capacity + 1);
    let mid = node.keys.len() / 2;

    let right = NodePage {
        revision: node.revision,
        keys: node.keys.split_off(mid + 1),
        children: node.children.split_off(mid + 1),
    };
    let separator = node.keys.pop().unwrap();

    let left_offset = tx.write_record_pages(&BTreePage::Node(node).encode())?;
    let right_offset =
        tx.write_record_pages(&BTreePage::Node(right).encode())?;
    Ok(RecInsert::Two {
        left: left_offset,
        separator,
        right: right_offset,
        delta,
    })
}

fn insert_into_leaf(
    tx: &mut WriteTx<'_>,
    offset: u64,
    mut leaf: LeafPage,
    key: &[u8],
    value: &[u8],
    ctx: &OpCtx<'_>,
) -> Result<RecInsert> {
    let mut replaced = None;
    let mut delta = 1;

    match search(&leaf.keys, key, ctx.cmp)? {
        Ok(i) => {
            let slot = insert_into_slot(tx, &leaf.values[i], value, ctx)?;
            match slot {
                SlotUpdate::Unchanged { replaced } => {
                    return Ok(RecInsert::Unchanged { replaced });
                }
                SlotUpdate::Replaced { slot, old } => {
                    leaf.values[i] = slot;
                    replaced = old;
                    delta = 0;
                }
                SlotUpdate::Grown { slot } => {
                    leaf.values[i] = slot;
                }
            }
        }
        Err(i) => {
            let slot = if ctx.allow_dups {
                ValueSlot::Inline(encode_value_set(&[value.to_vec()]))
            } else {
                ValueSlot::Inline(value.to_vec())
            };
            leaf.keys.insert(i, key.to_vec());
            leaf.values.insert(i, slot);
        }
    }

    leaf.revision = tx.revision();
    let result = if leaf.keys.len() <= ctx.capacity {
        let new_offset = tx.write_record_pages(&BTreePage::Leaf(leaf).encode())?;
        RecInsert::One {
            offset: new_offset,
            replaced,
            delta,
        }
    } else {
        // keep the left half, promote the right half's first key
        let left_n = (leaf.keys.len() + 1) / 2;
        let right = LeafPage {
            revision: leaf.revision,
            keys: leaf.keys.split_off(left_n),
            values: leaf.values.split_off(left_n),
        };
        let separator = right.keys[0].clone();

        let left_offset =
            tx.write_record_pages(&BTreePage::Leaf(leaf).encode())?;
        let right_offset =
            tx.write_record_pages(&BTreePage::Leaf(right).encode())?;
        RecInsert::Two {
            left: left_offset,
            separator,
            right: right_offset,
            delta,
        }
    };
    tx.supersede_record(offset)?;
    Ok(result)
}

enum SlotUpdate {
    Unchanged { replaced: Vec<u8> },
    Replaced { slot: ValueSlot, old: Option<Vec<u8>> },
    Grown { slot: ValueSlot },
}

/// Apply an insert to the slot of an existing key.
fn insert_into_slot(
    tx: &mut WriteTx<'_>,
    slot: &ValueSlot,
    value: &[u8],
    ctx: &OpCtx<'_>,
) -> Result<SlotUpdate> {
    if !ctx.allow_dups {
        let old = match slot {
            ValueSlot::Inline(bytes) => bytes.clone(),
            ValueSlot::SubTree(_) => {
                return Err(Error::corrupt("sub-tree in a non-dup tree"));
            }
        };
        if (ctx.value_cmp)(&old, value)? == std::cmp::Ordering::Equal {
            return Ok(SlotUpdate::Unchanged { replaced: old });
        }
        return Ok(SlotUpdate::Replaced {
            slot: ValueSlot::Inline(value.to_vec()),
            old: Some(old),
        });
    }

    match slot {
        ValueSlot::Inline(bytes) => {
            let mut set = super::page::decode_value_set(bytes)?;
            let pos = match search(&set, value, ctx.value_cmp)? {
                Ok(_) => {
                    return Err(Error::DuplicateValueNotAllowed(
                        ctx.name.to_string(),
                    ));
                }
                Err(pos) => pos,
            };
            set.insert(pos, value.to_vec());

            if set.len() > ctx.effective_dup_threshold() {
                // the set overflows into a sub-tree keyed by its values
                let n = set.len();
                let sub = LeafPage {
                    revision: tx.revision(),
                    keys: set,
                    values: vec![ValueSlot::Inline(Vec::new()); n],
                };
                let sub_root =
                    tx.write_record_pages(&BTreePage::Leaf(sub).encode())?;
                debug!("duplicate set overflowed into sub-tree at {:#x}", sub_root);
                Ok(SlotUpdate::Grown {
                    slot: ValueSlot::SubTree(sub_root),
                })
            } else {
                Ok(SlotUpdate::Grown {
                    slot: ValueSlot::Inline(encode_value_set(&set)),
                })
            }
        }
        ValueSlot::SubTree(sub_root) => {
            let sub_ctx = ctx.sub();
            let sub = insert_raw(tx, *sub_root, value, &[], &sub_ctx)?;
            if sub.replaced.is_some() {
                return Err(Error::DuplicateValueNotAllowed(
                    ctx.name.to_string(),
                ));
            }
            Ok(SlotUpdate::Grown {
                slot: ValueSlot::SubTree(sub.root),
            })
        }
    }
}

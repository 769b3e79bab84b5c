use crate::{
    error::Error,
    serializer::Serializer,
    transaction::TxView,
    Result,
};

use super::{
    page::{decode_value_set, BTreePage, LeafPage, NodePage, ValueSlot},
    read_page, search, BTree,
};

/// A position between elements of one tree revision: the node path down
/// to a leaf plus an index inside it. `next_slot` yields the slot to the
/// right of the position, `prev_slot` the one to the left.
struct RawCursor {
    // (node, index of the child the path descends into)
    stack: Vec<(NodePage, usize)>,
    leaf: LeafPage,
    pos: usize,
}

impl RawCursor {
    fn before_first<T: TxView>(tx: &T, root: u64) -> Result<Self> {
        let mut stack = Vec::new();
        let leaf = descend_leftmost(tx, root, &mut stack)?;
        Ok(Self {
            stack,
            leaf,
            pos: 0,
        })
    }

    fn after_last<T: TxView>(tx: &T, root: u64) -> Result<Self> {
        let mut stack = Vec::new();
        let leaf = descend_rightmost(tx, root, &mut stack)?;
        let pos = leaf.keys.len();
        Ok(Self {
            stack,
            leaf,
            pos,
        })
    }

    fn seek<T: TxView>(
        tx: &T,
        root: u64,
        key: &[u8],
        cmp: &dyn Fn(&[u8], &[u8]) -> Result<std::cmp::Ordering>,
    ) -> Result<Self> {
        let mut stack = Vec::new();
        let mut offset = root;
        let leaf = loop {
            match read_page(tx, offset)? {
                BTreePage::Node(node) => {
                    let idx = super::child_index(&node.keys, key, cmp)?;
                    offset = node.children[idx];
                    stack.push((node, idx));
                }
                BTreePage::Leaf(leaf) => break leaf,
            }
        };
        let pos = match search(&leaf.keys, key, cmp)? {
            Ok(i) => i,
            Err(i) => i,
        };
        Ok(Self {
            stack,
            leaf,
            pos,
        })
    }

    fn has_next(&self) -> bool {
        self.pos < self.leaf.keys.len()
            || self
                .stack
                .iter()
                .any(|(node, idx)| idx + 1 < node.children.len())
    }

    fn has_prev(&self) -> bool {
        self.pos > 0 || self.stack.iter().any(|(_, idx)| *idx > 0)
    }

    fn current(&self) -> (Vec<u8>, ValueSlot) {
        (
            self.leaf.keys[self.pos].clone(),
            self.leaf.values[self.pos].clone(),
        )
    }

    fn next_slot<T: TxView>(
        &mut self,
        tx: &T,
    ) -> Result<Option<(Vec<u8>, ValueSlot)>> {
        if self.pos < self.leaf.keys.len() {
            let slot = self.current();
            self.pos += 1;
            return Ok(Some(slot));
        }
        if !self.has_next() {
            return Ok(None);
        }

        // climb to the first ancestor with a child to the right, then
        // drop to the leftmost leaf of that subtree
        while let Some((node, idx)) = self.stack.pop() {
            if idx + 1 < node.children.len() {
                let child = node.children[idx + 1];
                self.stack.push((node, idx + 1));
                self.leaf = descend_leftmost(tx, child, &mut self.stack)?;
                self.pos = 0;
                let slot = self.current();
                self.pos += 1;
                return Ok(Some(slot));
            }
        }
        unreachable!("has_next checked above");
    }

    fn prev_slot<T: TxView>(
        &mut self,
        tx: &T,
    ) -> Result<Option<(Vec<u8>, ValueSlot)>> {
        if self.pos > 0 {
            self.pos -= 1;
            return Ok(Some(self.current()));
        }
        if !self.has_prev() {
            return Ok(None);
        }

        while let Some((node, idx)) = self.stack.pop() {
            if idx > 0 {
                let child = node.children[idx - 1];
                self.stack.push((node, idx - 1));
                self.leaf = descend_rightmost(tx, child, &mut self.stack)?;
                self.pos = self.leaf.keys.len() - 1;
                return Ok(Some(self.current()));
            }
        }
        unreachable!("has_prev checked above");
    }
}

fn descend_leftmost<T: TxView>(
    tx: &T,
    mut offset: u64,
    stack: &mut Vec<(NodePage, usize)>,
) -> Result<LeafPage> {
    loop {
        match read_page(tx, offset)? {
            BTreePage::Node(node) => {
                offset = node.children[0];
                stack.push((node, 0));
            }
            BTreePage::Leaf(leaf) => return Ok(leaf),
        }
    }
}

fn descend_rightmost<T: TxView>(
    tx: &T,
    mut offset: u64,
    stack: &mut Vec<(NodePage, usize)>,
) -> Result<LeafPage> {
    loop {
        match read_page(tx, offset)? {
            BTreePage::Node(node) => {
                let idx = node.children.len() - 1;
                offset = node.children[idx];
                stack.push((node, idx));
            }
            BTreePage::Leaf(leaf) => return Ok(leaf),
        }
    }
}

/// Value-level iteration within one duplicate slot.
enum SlotIter {
    Set { values: Vec<Vec<u8>>, pos: usize },
    Sub { raw: RawCursor },
}

impl SlotIter {
    fn at_start<T: TxView>(tx: &T, slot: ValueSlot) -> Result<Self> {
        match slot {
            ValueSlot::Inline(bytes) => Ok(SlotIter::Set {
                values: decode_value_set(&bytes)?,
                pos: 0,
            }),
            ValueSlot::SubTree(root) => Ok(SlotIter::Sub {
                raw: RawCursor::before_first(tx, root)?,
            }),
        }
    }

    fn at_end<T: TxView>(tx: &T, slot: ValueSlot) -> Result<Self> {
        match slot {
            ValueSlot::Inline(bytes) => {
                let values = decode_value_set(&bytes)?;
                let pos = values.len();
                Ok(SlotIter::Set { values, pos })
            }
            ValueSlot::SubTree(root) => Ok(SlotIter::Sub {
                raw: RawCursor::after_last(tx, root)?,
            }),
        }
    }

    fn has_next(&self) -> bool {
        match self {
            SlotIter::Set { values, pos } => *pos < values.len(),
            SlotIter::Sub { raw } => raw.has_next(),
        }
    }

    fn has_prev(&self) -> bool {
        match self {
            SlotIter::Set { pos, .. } => *pos > 0,
            SlotIter::Sub { raw } => raw.has_prev(),
        }
    }

    fn next<T: TxView>(&mut self, tx: &T) -> Result<Option<Vec<u8>>> {
        match self {
            SlotIter::Set { values, pos } => {
                if *pos < values.len() {
                    let value = values[*pos].clone();
                    *pos += 1;
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
            SlotIter::Sub { raw } => {
                Ok(raw.next_slot(tx)?.map(|(value, _)| value))
            }
        }
    }

    fn prev<T: TxView>(&mut self, tx: &T) -> Result<Option<Vec<u8>>> {
        match self {
            SlotIter::Set { values, pos } => {
                if *pos > 0 {
                    *pos -= 1;
                    Ok(Some(values[*pos].clone()))
                } else {
                    Ok(None)
                }
            }
            SlotIter::Sub { raw } => {
                Ok(raw.prev_slot(tx)?.map(|(value, _)| value))
            }
        }
    }
}

/// The duplicate slot the cursor currently iterates. The raw cursor is
/// always positioned just past the slot; `main_has_prev_before` remembers
/// whether anything precedes the slot itself.
struct ActiveSlot {
    key: Vec<u8>,
    iter: SlotIter,
    main_has_prev_before: bool,
}

/// An iterator over one revision of a tree, yielding (key, value) pairs
/// in key order, values ordered within a key by the value comparator.
///
/// The cursor is bound to the transaction it was created from; writers
/// committing later revisions never move it.
pub struct Cursor<'t, KS, VS, T>
where
    KS: Serializer,
    VS: Serializer,
    T: TxView,
{
    tree: &'t BTree<KS, VS>,
    tx: &'t T,
    root: u64,
    raw: RawCursor,
    active: Option<ActiveSlot>,
    current_key: Option<Vec<u8>>,
}

impl<'t, KS, VS, T> Cursor<'t, KS, VS, T>
where
    KS: Serializer,
    VS: Serializer,
    T: TxView,
{
    pub(crate) fn open_before_first(
        tree: &'t BTree<KS, VS>,
        tx: &'t T,
    ) -> Result<Self> {
        let root = tx.tree_root(tree.name())?.root;
        Ok(Self {
            tree,
            tx,
            root,
            raw: RawCursor::before_first(tx, root)?,
            active: None,
            current_key: None,
        })
    }

    pub(crate) fn open_after_last(
        tree: &'t BTree<KS, VS>,
        tx: &'t T,
    ) -> Result<Self> {
        let root = tx.tree_root(tree.name())?.root;
        Ok(Self {
            tree,
            tx,
            root,
            raw: RawCursor::after_last(tx, root)?,
            active: None,
            current_key: None,
        })
    }

    pub(crate) fn open_from_key(
        tree: &'t BTree<KS, VS>,
        tx: &'t T,
        key: &KS::Item,
    ) -> Result<Self> {
        let root = tx.tree_root(tree.name())?.root;
        let key_bytes = tree.key_serializer().serialize(key);
        let cmp =
            |a: &[u8], b: &[u8]| tree.key_serializer().compare(a, b);
        Ok(Self {
            tree,
            tx,
            root,
            raw: RawCursor::seek(tx, root, &key_bytes, &cmp)?,
            active: None,
            current_key: None,
        })
    }

    /// Reposition before the first element.
    pub fn before_first(&mut self) -> Result<()> {
        self.raw = RawCursor::before_first(self.tx, self.root)?;
        self.active = None;
        self.current_key = None;
        Ok(())
    }

    /// Reposition after the last element.
    pub fn after_last(&mut self) -> Result<()> {
        self.raw = RawCursor::after_last(self.tx, self.root)?;
        self.active = None;
        self.current_key = None;
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        match &self.active {
            Some(active) => active.iter.has_next() || self.raw.has_next(),
            None => self.raw.has_next(),
        }
    }

    pub fn has_prev(&self) -> bool {
        match &self.active {
            Some(active) => {
                active.iter.has_prev() || active.main_has_prev_before
            }
            None => self.raw.has_prev(),
        }
    }

    /// The element to the right of the cursor; fails with a cursor error
    /// past the last one.
    pub fn next(&mut self) -> Result<(KS::Item, VS::Item)> {
        self.advance_forward(None)
    }

    /// The element to the left of the cursor; fails with a cursor error
    /// before the first one.
    pub fn prev(&mut self) -> Result<(KS::Item, VS::Item)> {
        self.advance_backward(None)
    }

    fn advance_forward(
        &mut self,
        skip: Option<Vec<u8>>,
    ) -> Result<(KS::Item, VS::Item)> {
        loop {
            if let Some(active) = &mut self.active {
                if let Some(value) = active.iter.next(self.tx)? {
                    let key = active.key.clone();
                    self.current_key = Some(key.clone());
                    return self.decode_pair(&key, &value);
                }
                self.active = None;
                continue;
            }

            let (key, slot) = match self.raw.next_slot(self.tx)? {
                Some(found) => found,
                None => return Err(Error::Cursor("no next element")),
            };
            if skip.as_deref() == Some(&key[..]) {
                continue;
            }

            if !self.tree.config().allow_dups {
                let value = inline_value(slot)?;
                self.current_key = Some(key.clone());
                return self.decode_pair(&key, &value);
            }

            // the raw cursor moved just past the slot; whether anything
            // precedes the slot itself is what has_prev needs later
            let main_has_prev_before = self.raw.pos > 1
                || self.raw.stack.iter().any(|(_, idx)| *idx > 0);
            self.active = Some(ActiveSlot {
                key,
                iter: SlotIter::at_start(self.tx, slot)?,
                main_has_prev_before,
            });
        }
    }

    fn advance_backward(
        &mut self,
        skip: Option<Vec<u8>>,
    ) -> Result<(KS::Item, VS::Item)> {
        loop {
            if let Some(active) = &mut self.active {
                if let Some(value) = active.iter.prev(self.tx)? {
                    let key = active.key.clone();
                    self.current_key = Some(key.clone());
                    return self.decode_pair(&key, &value);
                }
                // walked off the slot's start: step the raw cursor back
                // over the slot and resume at the previous one
                self.active = None;
                if self.raw.prev_slot(self.tx)?.is_none() {
                    return Err(Error::Cursor("no previous element"));
                }
                continue;
            }

            let (key, slot) = match self.raw.prev_slot(self.tx)? {
                Some(found) => found,
                None => return Err(Error::Cursor("no previous element")),
            };
            if skip.as_deref() == Some(&key[..]) {
                continue;
            }

            if !self.tree.config().allow_dups {
                let value = inline_value(slot)?;
                self.current_key = Some(key.clone());
                return self.decode_pair(&key, &value);
            }

            return self.enter_backward(key, slot);
        }
    }

    /// Enter a duplicate slot from its end: the raw cursor sits before
    /// the slot after `prev_slot`, so push it back past the slot first.
    fn enter_backward(
        &mut self,
        key: Vec<u8>,
        slot: ValueSlot,
    ) -> Result<(KS::Item, VS::Item)> {
        let main_has_prev_before = self.raw.has_prev();
        let _ = self.raw.next_slot(self.tx)?;

        let mut iter = SlotIter::at_end(self.tx, slot)?;
        let value = iter
            .prev(self.tx)?
            .ok_or_else(|| Error::corrupt("empty duplicate slot"))?;
        self.current_key = Some(key.clone());
        self.active = Some(ActiveSlot {
            key: key.clone(),
            iter,
            main_has_prev_before,
        });
        self.decode_pair(&key, &value)
    }

    /// Skip the remaining values of the current key and yield the first
    /// element of the next distinct key.
    pub fn next_key(&mut self) -> Result<(KS::Item, VS::Item)> {
        let skip = self.current_key.clone();
        self.active = None;
        self.advance_forward(skip)
    }

    /// Skip back over the current key's values and yield the previous
    /// distinct key (its last value in duplicates mode).
    pub fn prev_key(&mut self) -> Result<(KS::Item, VS::Item)> {
        let skip = self.current_key.clone();
        self.active = None;
        self.advance_backward(skip)
    }

    fn decode_pair(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<(KS::Item, VS::Item)> {
        Ok((
            self.tree.key_serializer().deserialize(key)?,
            self.tree.value_serializer().deserialize(value)?,
        ))
    }
}

fn inline_value(slot: ValueSlot) -> Result<Vec<u8>> {
    match slot {
        ValueSlot::Inline(bytes) => Ok(bytes),
        ValueSlot::SubTree(_) => {
            Err(Error::corrupt("sub-tree in a non-dup tree"))
        }
    }
}

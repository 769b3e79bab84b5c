use bytes::{Buf, BufMut, BytesMut};

use crate::{error::Error, Result};

pub const LEAF_KIND: u8 = 0x01;
pub const NODE_KIND: u8 = 0x02;

/// Marker in the value-length field for a slot holding a sub-tree root
/// offset instead of inline bytes.
pub const SUBTREE_VALUE_LEN: u32 = 0xFFFF_FFFF;

/// One value slot of a leaf.
///
/// In a tree that allows duplicates the inline bytes are a value-set
/// encoding (see [`encode_value_set`]); once a set outgrows the configured
/// threshold it moves into a sub-tree whose keys are the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSlot {
    Inline(Vec<u8>),
    SubTree(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafPage {
    pub revision: u64,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<ValueSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodePage {
    pub revision: u64,
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<u64>,
}

/// A materialized B+tree page.
///
/// Pages are immutable once written; a mutation decodes the page, builds a
/// modified copy and writes it at a fresh offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTreePage {
    Leaf(LeafPage),
    Node(NodePage),
}

impl BTreePage {
    pub fn revision(&self) -> u64 {
        match self {
            BTreePage::Leaf(leaf) => leaf.revision,
            BTreePage::Node(node) => node.revision,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            BTreePage::Leaf(leaf) => {
                buf.put_u8(LEAF_KIND);
                buf.put_u64(leaf.revision);
                buf.put_u32(leaf.keys.len() as u32);
                for key in &leaf.keys {
                    buf.put_u32(key.len() as u32);
                    buf.put_slice(key);
                }
                for value in &leaf.values {
                    match value {
                        ValueSlot::Inline(bytes) => {
                            buf.put_u32(bytes.len() as u32);
                            buf.put_slice(bytes);
                        }
                        ValueSlot::SubTree(root) => {
                            buf.put_u32(SUBTREE_VALUE_LEN);
                            buf.put_u64(*root);
                        }
                    }
                }
            }
            BTreePage::Node(node) => {
                assert_eq!(node.children.len(), node.keys.len() + 1);
                buf.put_u8(NODE_KIND);
                buf.put_u64(node.revision);
                buf.put_u32(node.keys.len() as u32);
                for key in &node.keys {
                    buf.put_u32(key.len() as u32);
                    buf.put_slice(key);
                }
                for child in &node.children {
                    buf.put_u64(*child);
                }
            }
        }
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < 13 {
            return Err(Error::corrupt("b+tree page payload too short"));
        }

        let kind = buf.get_u8();
        let revision = buf.get_u64();
        let n = buf.get_u32() as usize;

        let mut keys = Vec::with_capacity(n);
        for _ in 0..n {
            keys.push(read_chunk(&mut buf, "key")?);
        }

        match kind {
            LEAF_KIND => {
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    if buf.remaining() < 4 {
                        return Err(Error::corrupt("leaf value truncated"));
                    }
                    let len = buf.get_u32();
                    if len == SUBTREE_VALUE_LEN {
                        if buf.remaining() < 8 {
                            return Err(Error::corrupt(
                                "sub-tree pointer truncated",
                            ));
                        }
                        values.push(ValueSlot::SubTree(buf.get_u64()));
                    } else {
                        let len = len as usize;
                        if buf.remaining() < len {
                            return Err(Error::corrupt("leaf value truncated"));
                        }
                        values.push(ValueSlot::Inline(buf[..len].to_vec()));
                        buf.advance(len);
                    }
                }
                Ok(BTreePage::Leaf(LeafPage {
                    revision,
                    keys,
                    values,
                }))
            }
            NODE_KIND => {
                let mut children = Vec::with_capacity(n + 1);
                for _ in 0..=n {
                    if buf.remaining() < 8 {
                        return Err(Error::corrupt("node child truncated"));
                    }
                    children.push(buf.get_u64());
                }
                Ok(BTreePage::Node(NodePage {
                    revision,
                    keys,
                    children,
                }))
            }
            other => Err(Error::corrupt(format!(
                "unknown page kind {:#04x}",
                other
            ))),
        }
    }
}

fn read_chunk(buf: &mut &[u8], what: &str) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(Error::corrupt(format!("{} length truncated", what)));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::corrupt(format!("{} bytes truncated", what)));
    }
    let chunk = buf[..len].to_vec();
    buf.advance(len);
    Ok(chunk)
}

/// Encode an ordered set of duplicate values into one inline slot.
pub fn encode_value_set(values: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(values.len() as u32);
    for value in values {
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
    buf.to_vec()
}

pub fn decode_value_set(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut buf = bytes;
    if buf.remaining() < 4 {
        return Err(Error::corrupt("value set truncated"));
    }
    let n = buf.get_u32() as usize;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(read_chunk(&mut buf, "set value")?);
    }
    if buf.has_remaining() {
        return Err(Error::corrupt("trailing bytes after value set"));
    }
    Ok(values)
}

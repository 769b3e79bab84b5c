use std::{convert::TryInto, fs, path::Path};

use bytes::{Buf, BufMut, BytesMut};
use log::{error, warn};

use crate::{error::Error, io::PageFile, Result};

pub const HEADER_MAGIC: &[u8; 4] = b"MVBT";
pub const FORMAT_VERSION: u32 = 1;

/// Serialized header size: magic, version, seq, page_size, tree-of-trees
/// root, free-list head, revision, crc32.
const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8 + 8 + 8 + 4;

/// The record-manager header.
///
/// Two copies live in the first two page-images of the file. A commit
/// writes the slot that is not currently authoritative with a higher
/// sequence number; at open the slot with the highest valid sequence wins,
/// so a torn write of one slot is always recoverable from the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub seq: u64,
    pub page_size: u32,
    pub tree_of_trees_root: u64,
    pub free_list_head: u64,
    pub revision: u64,
}

impl FileHeader {
    pub fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(page_size);
        buf.put_slice(HEADER_MAGIC);
        buf.put_u32(FORMAT_VERSION);
        buf.put_u64(self.seq);
        buf.put_u32(self.page_size);
        buf.put_u64(self.tree_of_trees_root);
        buf.put_u64(self.free_list_head);
        buf.put_u64(self.revision);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.put_u32(hasher.finalize());

        buf.resize(page_size, 0);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::corrupt("header slot too short"));
        }
        if &bytes[..4] != HEADER_MAGIC {
            return Err(Error::corrupt("bad header magic"));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..HEADER_LEN - 4]);
        let expected = hasher.finalize();

        let mut buf = &bytes[4..];
        let version = buf.get_u32();
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported format version {}",
                version
            )));
        }

        let header = Self {
            seq: buf.get_u64(),
            page_size: buf.get_u32(),
            tree_of_trees_root: buf.get_u64(),
            free_list_head: buf.get_u64(),
            revision: buf.get_u64(),
        };

        let stored = buf.get_u32();
        if stored != expected {
            return Err(Error::corrupt(format!(
                "header crc mismatch: stored {:#x}, computed {:#x}",
                stored, expected
            )));
        }

        Ok(header)
    }

    /// Read both slots and return the authoritative header together with
    /// the slot index it came from. A slot with a bad checksum is skipped
    /// silently; two bad slots fail the open.
    pub fn load(file: &mut PageFile) -> Result<(Self, usize)> {
        let page_size = file.page_size() as u64;

        let mut best: Option<(Self, usize)> = None;
        for slot in 0..2usize {
            match file
                .read_page(slot as u64 * page_size)
                .and_then(|page| Self::decode(&page))
            {
                Ok(header) => {
                    let better = match &best {
                        Some((current, _)) => header.seq > current.seq,
                        None => true,
                    };
                    if better {
                        best = Some((header, slot));
                    }
                }
                Err(e) => {
                    warn!("header slot {} unreadable: {}", slot, e);
                }
            }
        }

        match best {
            Some(found) => Ok(found),
            None => {
                error!("both header slots are invalid");
                Err(Error::corrupt("both header slots are invalid"))
            }
        }
    }

    /// Write this header into the given slot. The caller syncs.
    pub fn store(&self, file: &mut PageFile, slot: usize) -> Result<()> {
        assert!(slot < 2);
        let page_size = file.page_size();
        file.write_page(slot as u64 * page_size as u64, &self.encode(page_size))
    }
}

/// Fish the page size out of an existing file before the page-granular
/// machinery can start. The leading magic/version/page_size bytes of slot 0
/// are identical across all rewrites of that slot, so they survive torn
/// header writes.
pub fn read_page_size<P: AsRef<Path>>(path: P) -> Result<u32> {
    let bytes = fs::read(path.as_ref())?;
    if bytes.len() < 20 {
        return Err(Error::corrupt("file too short for a header"));
    }
    if &bytes[..4] != HEADER_MAGIC {
        return Err(Error::corrupt("bad header magic"));
    }
    Ok(u32::from_be_bytes(bytes[16..20].try_into().unwrap()))
}

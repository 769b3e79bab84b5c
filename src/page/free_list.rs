use std::collections::{HashSet, VecDeque};

use bytes::{Buf, BufMut};
use log::{debug, warn};

use crate::{io::PageFile, Result, NO_PAGE};

/// Marker written into the payload of a free page-image. A page popped off
/// the list loses the marker as soon as it is rewritten, which makes the
/// open-time walk stop at the first reused page instead of following a
/// stale link after a torn commit.
pub const FREE_MAGIC: u32 = 0x4652_4545; // "FREE"

/// The reclaimable-page list.
///
/// On disk the list is a singly-linked chain: each free page-image's link
/// field holds the offset of the next free page and its payload starts
/// with [`FREE_MAGIC`]. The in-memory mirror is rebuilt by walking the
/// chain at open; at run time only the writer touches it. The head offset
/// is persisted in the record-manager header at commit.
pub struct FreeList {
    // front = head of the on-disk chain
    free: VecDeque<u64>,

    // next fresh offset handed out when the list runs dry
    next_alloc: u64,

    page_size: u64,
}

impl FreeList {
    /// Walk the chain starting at `head` and mirror it in memory.
    ///
    /// The walk is defensive: a link that is unaligned, out of bounds,
    /// already seen, or pointing at a page without the free marker ends
    /// the walk there. Pages past such a link were detached by an
    /// interrupted commit; they leak rather than corrupt the list.
    pub fn load(file: &mut PageFile, head: u64) -> Result<Self> {
        let page_size = file.page_size() as u64;
        let mut free = VecDeque::new();
        let mut seen = HashSet::new();

        let mut current = head;
        while current != NO_PAGE {
            if current % page_size != 0
                || current + page_size > file.len()
                || !seen.insert(current)
            {
                warn!(
                    "free list walk stopped at invalid link {:#x}, {} pages kept",
                    current,
                    free.len()
                );
                break;
            }

            let page = file.read_page(current)?;
            let mut buf = &page[..];
            let next = buf.get_u64();
            let magic = buf.get_u32();

            if magic != FREE_MAGIC {
                warn!(
                    "free list walk stopped at {:#x} without free marker, {} pages kept",
                    current,
                    free.len()
                );
                break;
            }

            free.push_back(current);
            current = next;
        }

        debug!("free list loaded, {} pages", free.len());
        Ok(Self {
            free,
            next_alloc: file.len(),
            page_size,
        })
    }

    pub fn new_empty(file: &PageFile) -> Self {
        Self {
            free: VecDeque::new(),
            next_alloc: file.len(),
            page_size: file.page_size() as u64,
        }
    }

    /// Offset persisted in the header as the list head.
    pub fn head(&self) -> u64 {
        self.free.front().copied().unwrap_or(NO_PAGE)
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Hand out `n` logical pages: reclaimed offsets first, fresh offsets
    /// at the end of the file once the list runs dry. The returned offsets
    /// need not be contiguous.
    pub fn allocate_chain(&mut self, n: usize) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            match self.free.pop_front() {
                Some(offset) => offsets.push(offset),
                None => {
                    offsets.push(self.next_alloc);
                    self.next_alloc += self.page_size;
                }
            }
        }
        debug!("allocated {} pages: {:x?}", n, offsets);
        offsets
    }

    /// Push pages onto the head in the order given, writing their on-disk
    /// links. Only the caller-supplied pages are touched; the previous
    /// head keeps its link bytes.
    pub fn release(
        &mut self,
        file: &mut PageFile,
        offsets: &[u64],
    ) -> Result<()> {
        for &offset in offsets {
            let mut prefix = Vec::with_capacity(12);
            prefix.put_u64(self.head());
            prefix.put_u32(FREE_MAGIC);
            file.write_page_prefix(offset, &prefix)?;
            self.free.push_front(offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_file() -> (tempfile::TempDir, PageFile) {
        let dir = tempfile::tempdir().unwrap();
        let file = PageFile::open(dir.path().join("free.db"), 64, 16).unwrap();
        (dir, file)
    }

    #[test]
    fn test_allocate_extends_file() {
        let (_dir, mut file) = open_file();
        file.write_page(0, &vec![0u8; 64]).unwrap();

        let mut list = FreeList::new_empty(&file);
        assert_eq!(list.allocate_chain(3), vec![64, 128, 192]);
        assert_eq!(list.allocate_chain(1), vec![256]);
    }

    #[test]
    fn test_release_then_reload() {
        let (_dir, mut file) = open_file();
        for i in 0..4u64 {
            file.write_page(i * 64, &vec![1u8; 64]).unwrap();
        }

        let mut list = FreeList::new_empty(&file);
        list.release(&mut file, &[64, 192]).unwrap();
        assert_eq!(list.head(), 192);
        assert_eq!(list.len(), 2);

        let reloaded = FreeList::load(&mut file, list.head()).unwrap();
        assert_eq!(reloaded.head(), 192);
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_reused_page_stops_walk() {
        let (_dir, mut file) = open_file();
        for i in 0..4u64 {
            file.write_page(i * 64, &vec![1u8; 64]).unwrap();
        }

        let mut list = FreeList::new_empty(&file);
        list.release(&mut file, &[64, 128, 192]).unwrap();
        // head chain: 192 -> 128 -> 64

        // simulate an interrupted commit that reused page 128
        file.write_page(128, &vec![0xeeu8; 64]).unwrap();

        let reloaded = FreeList::load(&mut file, 192).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.head(), 192);
    }

    #[test]
    fn test_reclaimed_pages_reused_first() {
        let (_dir, mut file) = open_file();
        file.write_page(0, &vec![0u8; 64]).unwrap();
        file.write_page(64, &vec![0u8; 64]).unwrap();

        let mut list = FreeList::new_empty(&file);
        list.release(&mut file, &[0]).unwrap();
        assert_eq!(list.allocate_chain(2), vec![0, 128]);
        assert_eq!(list.head(), NO_PAGE);
    }
}

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::Path,
};

use bytes::Bytes;
use log::debug;
use lru::LruCache;

use crate::{error::Error, Result};

/// Counters of the page-image cache, readable by tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Fixed-block access to the backing file.
///
/// Every read and write moves exactly one page-image at a page-aligned
/// offset. A small LRU cache keeps recently touched page-images in memory;
/// writes go through to the file immediately and refresh the cache.
pub struct PageFile {
    file: File,
    page_size: usize,

    // tracked file length in bytes, always a multiple of page_size
    len: u64,

    cache: LruCache<u64, Bytes>,
    hits: u64,
    misses: u64,
}

impl PageFile {
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();

        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap();

        Ok(Self {
            file,
            page_size,
            len,
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// File length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
        }
    }

    fn check_aligned(&self, offset: u64) -> Result<()> {
        if offset % self.page_size as u64 != 0 {
            return Err(Error::OutOfRange(offset));
        }
        Ok(())
    }

    /// Read one page-image. The offset must be page-aligned and inside the
    /// file.
    pub fn read_page(&mut self, offset: u64) -> Result<Bytes> {
        self.check_aligned(offset)?;
        if offset + self.page_size as u64 > self.len {
            return Err(Error::OutOfRange(offset));
        }

        if let Some(page) = self.cache.get(&offset) {
            self.hits += 1;
            return Ok(page.clone());
        }
        self.misses += 1;

        let mut buf = vec![0u8; self.page_size];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;

        let page = Bytes::from(buf);
        self.cache.put(offset, page.clone());
        debug!("page read from disk, offset: {:#x}", offset);
        Ok(page)
    }

    /// Write one page-image. Writing at or past the current end extends the
    /// file.
    pub fn write_page(&mut self, offset: u64, page: &[u8]) -> Result<()> {
        self.check_aligned(offset)?;
        assert_eq!(
            page.len(),
            self.page_size,
            "page-image must be exactly one page"
        );

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(page)?;

        let end = offset + self.page_size as u64;
        if end > self.len {
            self.len = end;
        }

        self.cache.put(offset, Bytes::copy_from_slice(page));
        Ok(())
    }

    /// Overwrite the leading bytes of a page-image in place, leaving the
    /// rest of the page untouched. Used for free-list links.
    pub fn write_page_prefix(&mut self, offset: u64, prefix: &[u8]) -> Result<()> {
        self.check_aligned(offset)?;
        assert!(prefix.len() <= self.page_size);

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(prefix)?;

        let end = offset + self.page_size as u64;
        if end > self.len {
            self.len = end;
        }

        self.cache.pop(&offset);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut file =
            PageFile::open(dir.path().join("pages.db"), 512, 16).unwrap();

        let page = vec![0xabu8; 512];
        file.write_page(0, &page).unwrap();
        file.write_page(512, &vec![0xcdu8; 512]).unwrap();
        assert_eq!(file.len(), 1024);

        assert_eq!(&file.read_page(0).unwrap()[..], &page[..]);
        assert!(file.read_page(1024).is_err());
        assert!(file.read_page(100).is_err());
    }

    #[test]
    fn test_cache_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut file =
            PageFile::open(dir.path().join("pages.db"), 512, 16).unwrap();

        file.write_page(0, &vec![1u8; 512]).unwrap();

        // the write left the page in the cache
        file.read_page(0).unwrap();
        assert_eq!(file.cache_stats(), CacheStats { hits: 1, misses: 0 });

        // prefix writes invalidate, forcing a disk read
        file.write_page_prefix(0, &[9u8; 8]).unwrap();
        let page = file.read_page(0).unwrap();
        assert_eq!(&page[..8], &[9u8; 8]);
        assert_eq!(page[8], 1);
        assert_eq!(file.cache_stats(), CacheStats { hits: 1, misses: 1 });
    }
}

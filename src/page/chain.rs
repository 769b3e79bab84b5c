use bytes::{Buf, BufMut, BytesMut};

use crate::{error::Error, io::PageFile, Result, NO_PAGE};

/// Bytes of every page-image taken by the next-page link.
pub const LINK_SIZE: usize = 8;

/// Number of page-images needed to store a record of `len` payload bytes.
pub fn chain_page_count(len: usize, page_size: usize) -> usize {
    let payload_per_page = page_size - LINK_SIZE;
    // the 4-byte logical size rides in the first page's payload
    (len + 4 + payload_per_page - 1) / payload_per_page
}

/// Write a logical record into the given chain of page offsets.
///
/// The offsets must have been sized with [`chain_page_count`]; each page is
/// linked to the next, the last one carries the none sentinel.
pub fn write_record(
    file: &mut PageFile,
    offsets: &[u64],
    data: &[u8],
) -> Result<()> {
    let page_size = file.page_size();
    assert_eq!(
        offsets.len(),
        chain_page_count(data.len(), page_size),
        "chain length must match the record size"
    );

    let mut remaining = data;
    for (i, &offset) in offsets.iter().enumerate() {
        let next = offsets.get(i + 1).copied().unwrap_or(NO_PAGE);

        let mut page = BytesMut::with_capacity(page_size);
        page.put_u64(next);
        if i == 0 {
            page.put_u32(data.len() as u32);
        }

        let take = remaining.len().min(page_size - page.len());
        page.put_slice(&remaining[..take]);
        remaining = &remaining[take..];

        page.resize(page_size, 0);
        file.write_page(offset, &page)?;
    }

    Ok(())
}

/// Read a logical record starting at `offset`, following the chain links.
///
/// Fails with `CorruptFile` when the declared length disagrees with the
/// chain, and with `EndOfFile` when a link points past the file.
pub fn read_record(file: &mut PageFile, offset: u64) -> Result<Vec<u8>> {
    let (data, _) = read_record_with_offsets(file, offset)?;
    Ok(data)
}

/// Like [`read_record`], also returning every page offset of the chain.
/// The offsets are what a superseding write hands to the reclaimer.
pub fn read_record_with_offsets(
    file: &mut PageFile,
    offset: u64,
) -> Result<(Vec<u8>, Vec<u64>)> {
    let page_size = file.page_size();

    let mut offsets = Vec::new();
    let mut data = Vec::new();
    let mut current = offset;
    let mut declared: Option<usize> = None;

    loop {
        if current == NO_PAGE || current + page_size as u64 > file.len() {
            return Err(Error::EndOfFile(current));
        }
        if offsets.contains(&current) {
            return Err(Error::corrupt(format!(
                "page chain at {:#x} loops through {:#x}",
                offset, current
            )));
        }
        offsets.push(current);

        let page = file.read_page(current)?;
        let mut buf = &page[..];
        let next = buf.get_u64();

        if declared.is_none() {
            declared = Some(buf.get_u32() as usize);
        }
        let total = declared.unwrap();

        let take = (total - data.len()).min(buf.remaining());
        data.extend_from_slice(&buf[..take]);

        if data.len() == total {
            if next != NO_PAGE {
                return Err(Error::corrupt(format!(
                    "chain at {:#x} continues past its declared {} bytes",
                    offset, total
                )));
            }
            return Ok((data, offsets));
        }

        if next == NO_PAGE {
            return Err(Error::corrupt(format!(
                "chain at {:#x} ends after {} of {} declared bytes",
                offset,
                data.len(),
                total
            )));
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_file() -> (tempfile::TempDir, PageFile) {
        let dir = tempfile::tempdir().unwrap();
        let file = PageFile::open(dir.path().join("chain.db"), 64, 16).unwrap();
        (dir, file)
    }

    #[test]
    fn test_page_count() {
        // 64-byte pages leave 56 payload bytes, 52 in the first page
        assert_eq!(chain_page_count(0, 64), 1);
        assert_eq!(chain_page_count(52, 64), 1);
        assert_eq!(chain_page_count(53, 64), 2);
        assert_eq!(chain_page_count(52 + 56, 64), 2);
        assert_eq!(chain_page_count(52 + 56 + 1, 64), 3);
    }

    #[test]
    fn test_round_trip_single_page() {
        let (_dir, mut file) = open_file();
        let data = b"hello record".to_vec();
        write_record(&mut file, &[0], &data).unwrap();
        assert_eq!(read_record(&mut file, 0).unwrap(), data);
    }

    #[test]
    fn test_round_trip_multi_page() {
        let (_dir, mut file) = open_file();
        let data: Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();
        let offsets = vec![0, 128, 64, 192];
        assert_eq!(offsets.len(), chain_page_count(data.len(), 64));
        write_record(&mut file, &offsets, &data).unwrap();

        let (read, chain) = read_record_with_offsets(&mut file, 0).unwrap();
        assert_eq!(read, data);
        assert_eq!(chain, offsets);
    }

    #[test]
    fn test_truncated_chain_is_corrupt() {
        let (_dir, mut file) = open_file();
        let data: Vec<u8> = vec![7u8; 100];
        write_record(&mut file, &[0, 64], &data).unwrap();

        // rewrite the first page claiming more bytes than the chain holds
        let mut page = file.read_page(0).unwrap().to_vec();
        page[8..12].copy_from_slice(&500u32.to_be_bytes());
        file.write_page(0, &page).unwrap();

        match read_record(&mut file, 0) {
            Err(crate::Error::CorruptFile(_)) => {}
            other => panic!("expected CorruptFile, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_link_past_eof() {
        let (_dir, mut file) = open_file();
        let data: Vec<u8> = vec![7u8; 100];
        write_record(&mut file, &[0, 64], &data).unwrap();

        // point the first link far past the end of the file
        let mut page = file.read_page(0).unwrap().to_vec();
        page[..8].copy_from_slice(&(1u64 << 40).to_be_bytes());
        file.write_page(0, &page).unwrap();

        match read_record(&mut file, 0) {
            Err(crate::Error::EndOfFile(_)) => {}
            other => panic!("expected EndOfFile, got {:?}", other.map(|_| ())),
        }
    }
}

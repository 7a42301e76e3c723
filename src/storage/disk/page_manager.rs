use crate::storage::disk::PAGE_SIZE;
use crate::storage::error::StorageError;
use crate::storage::page::{PageBuf, PageId, FIL_PAGE_CHECKSUM};
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Fixed-size page file. Pages carry a crc32 checksum in their FIL header,
/// stamped on write and verified on read.
pub struct PageManager {
    file: File,
}

impl PageManager {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self { file })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        Ok(Self { file })
    }

    /// Reads page `page_id`, failing with `PageNotFound` past the end of the
    /// file and `ChecksumMismatch` on a torn or corrupted page.
    pub fn read_page(&mut self, page_id: PageId) -> Result<PageBuf, StorageError> {
        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            return Err(StorageError::PageNotFound(page_id));
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.read_exact(&mut buf).context("Failed to read page")?;

        let page = PageBuf::from_bytes(page_id, &buf);
        if !page.verify_checksum() {
            return Err(StorageError::ChecksumMismatch(page_id));
        }
        Ok(page)
    }

    /// Writes the frame with a freshly computed checksum. The frame itself is
    /// not modified.
    pub fn write_page(&mut self, page: &PageBuf) -> Result<()> {
        let mut data = page.as_bytes().to_vec();
        data[FIL_PAGE_CHECKSUM..FIL_PAGE_CHECKSUM + 4]
            .copy_from_slice(&page.compute_checksum().to_be_bytes());
        self.write_raw(page.page_id(), &data)
    }

    pub fn write_raw(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            bail!(
                "Data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            );
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            self.file
                .set_len(offset + PAGE_SIZE as u64)
                .context("Failed to extend file")?;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().context("Failed to sync")
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let pm = PageManager::create(&file_path)?;
            assert_eq!(pm.num_pages()?, 0);
        }
        {
            let pm = PageManager::open(&file_path)?;
            assert_eq!(pm.num_pages()?, 0);
        }
        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;

        let mut page = PageBuf::new(PageId(3));
        page.write_u32(1000, 0xCAFE);
        pm.write_page(&page)?;
        assert_eq!(pm.num_pages()?, 4);

        let read = pm.read_page(PageId(3))?;
        assert_eq!(read.read_u32(1000), 0xCAFE);
        assert_eq!(read.page_no(), 3);
        Ok(())
    }

    #[test]
    fn test_torn_page_is_detected() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;

        let page = PageBuf::new(PageId(0));
        pm.write_page(&page)?;

        let mut raw = page.as_bytes().to_vec();
        raw[FIL_PAGE_CHECKSUM..FIL_PAGE_CHECKSUM + 4]
            .copy_from_slice(&page.compute_checksum().to_be_bytes());
        raw[5000] ^= 0xFF;
        pm.write_raw(PageId(0), &raw)?;

        assert!(matches!(
            pm.read_page(PageId(0)),
            Err(StorageError::ChecksumMismatch(PageId(0)))
        ));
        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;
        assert!(matches!(
            pm.read_page(PageId(10)),
            Err(StorageError::PageNotFound(PageId(10)))
        ));
        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let mut pm = PageManager::create(&file_path)?;
            let mut page = PageBuf::new(PageId(1));
            page.write_u8(4000, 99);
            pm.write_page(&page)?;
            pm.sync()?;
        }
        {
            let mut pm = PageManager::open(&file_path)?;
            assert_eq!(pm.read_page(PageId(1))?.read_u8(4000), 99);
            // The never-written page 0 reads back as zeros.
            assert_eq!(pm.read_page(PageId(0))?.page_no(), 0);
        }
        Ok(())
    }
}

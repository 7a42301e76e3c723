//! Page frames and the fixed page-format contract.
//!
//! Every page is `PAGE_SIZE` bytes:
//!
//! ```text
//! +---------------------------+ 0
//! | FIL header (32)           |  checksum, page no, prev, next, lsn, type, space
//! +---------------------------+ 32
//! | PAGE header (56)          |  directory/heap bookkeeping, level, index id
//! +---------------------------+ 88
//! | infimum | supremum        |  fixed system records
//! | user record heap  ->      |
//! |                           |
//! |        <- page directory  |  u16 slots growing towards lower addresses
//! +---------------------------+ PAGE_SIZE - 8
//! | FIL trailer (8)           |
//! +---------------------------+ PAGE_SIZE
//! ```
//!
//! All multi-byte integers are big-endian. Every mutation made through the
//! `write_*` family is captured as a [`RedoRecord`] until the owning
//! mini-transaction drains it.

pub mod cursor;
pub mod index_page;
pub mod record;
pub mod zip;

use crate::storage::wal::RedoRecord;
use crate::storage::PAGE_SIZE;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use zip::ZipShadow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sibling/child pointer value meaning "no page".
pub const FIL_NULL: u32 = u32::MAX;

pub const FIL_PAGE_CHECKSUM: usize = 0;
pub const FIL_PAGE_OFFSET: usize = 4;
pub const FIL_PAGE_PREV: usize = 8;
pub const FIL_PAGE_NEXT: usize = 12;
pub const FIL_PAGE_LSN: usize = 16;
pub const FIL_PAGE_TYPE: usize = 24;
pub const FIL_PAGE_SPACE_ID: usize = 26;
pub const FIL_HEADER_SIZE: usize = 32;
pub const FIL_TRAILER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PageType {
    Allocated = 0,
    Index = 17855,
    RTree = 17854,
}

impl PageType {
    fn from_u16(v: u16) -> Self {
        match v {
            17855 => PageType::Index,
            17854 => PageType::RTree,
            _ => PageType::Allocated,
        }
    }
}

/// An in-memory page frame.
pub struct PageBuf {
    data: Box<[u8; PAGE_SIZE]>,
    zip: Option<ZipShadow>,
    redo: Vec<RedoRecord>,
    page_id: PageId,
    logging: bool,
}

impl PageBuf {
    pub fn new(page_id: PageId) -> Self {
        let mut page = Self {
            data: Box::new([0u8; PAGE_SIZE]),
            zip: None,
            redo: Vec::new(),
            page_id,
            logging: true,
        };
        BigEndian::write_u32(&mut page.data[FIL_PAGE_OFFSET..], page_id.0);
        BigEndian::write_u32(&mut page.data[FIL_PAGE_PREV..], FIL_NULL);
        BigEndian::write_u32(&mut page.data[FIL_PAGE_NEXT..], FIL_NULL);
        page
    }

    /// A scratch page whose writes are never logged.
    pub fn new_temp(page_id: PageId) -> Self {
        let mut page = Self::new(page_id);
        page.logging = false;
        page
    }

    pub fn from_bytes(page_id: PageId, bytes: &[u8]) -> Self {
        let mut page = Self::new(page_id);
        page.data.copy_from_slice(&bytes[..PAGE_SIZE]);
        page
    }

    /// Unlogged copy of this frame, including the compressed shadow.
    pub fn snapshot(&self) -> PageBuf {
        PageBuf {
            data: self.data.clone(),
            zip: self.zip.clone(),
            redo: Vec::new(),
            page_id: self.page_id,
            logging: false,
        }
    }

    /// Resets the frame to a fresh image of the same page, as `new` would,
    /// keeping the logging mode and any redo captured so far.
    pub fn reinit(&mut self) {
        let logging = self.logging;
        let redo = std::mem::take(&mut self.redo);
        let page_id = self.page_id;
        *self = PageBuf::new(page_id);
        self.logging = logging;
        self.redo = redo;
        self.log_init();
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn set_logging(&mut self, logging: bool) {
        self.logging = logging;
    }

    pub fn is_logging(&self) -> bool {
        self.logging
    }

    pub fn take_redo(&mut self) -> Vec<RedoRecord> {
        std::mem::take(&mut self.redo)
    }

    /// Records that this frame was freshly initialized.
    pub fn log_init(&mut self) {
        if self.logging {
            self.redo.push(RedoRecord::InitPage { page: self.page_id });
        }
    }

    pub fn has_pending_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        BigEndian::read_u16(&self.data[offset..offset + 2])
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        BigEndian::read_u32(&self.data[offset..offset + 4])
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        BigEndian::read_u64(&self.data[offset..offset + 8])
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    fn log_write(&mut self, offset: usize, len: usize) {
        if self.logging {
            self.redo.push(RedoRecord::Write {
                page: self.page_id,
                offset: offset as u16,
                bytes: self.data[offset..offset + len].to_vec(),
            });
        }
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
        self.log_write(offset, 1);
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        BigEndian::write_u16(&mut self.data[offset..offset + 2], value);
        self.log_write(offset, 2);
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        BigEndian::write_u32(&mut self.data[offset..offset + 4], value);
        self.log_write(offset, 4);
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        BigEndian::write_u64(&mut self.data[offset..offset + 8], value);
        self.log_write(offset, 8);
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.log_write(offset, bytes.len());
    }

    pub fn memset(&mut self, offset: usize, len: usize, byte: u8) {
        self.data[offset..offset + len].fill(byte);
        if self.logging {
            self.redo.push(RedoRecord::Memset {
                page: self.page_id,
                offset: offset as u16,
                len: len as u16,
                byte,
            });
        }
    }

    /// Overlapping-safe move inside the frame, logged as a write of the target.
    pub fn memmove(&mut self, dst: usize, src: usize, len: usize) {
        self.data.copy_within(src..src + len, dst);
        self.log_write(dst, len);
    }

    /// Replaces the whole frame body with `src`'s body and logs it as one record.
    pub fn copy_body_from(&mut self, src: &PageBuf) {
        let end = PAGE_SIZE - FIL_TRAILER_SIZE;
        self.data[FIL_HEADER_SIZE..end].copy_from_slice(&src.data[FIL_HEADER_SIZE..end]);
        self.log_write(FIL_HEADER_SIZE, end - FIL_HEADER_SIZE);
    }

    pub(crate) fn body_mut_unlogged(&mut self) -> &mut [u8] {
        &mut self.data[FIL_HEADER_SIZE..PAGE_SIZE - FIL_TRAILER_SIZE]
    }

    pub fn page_no(&self) -> u32 {
        self.read_u32(FIL_PAGE_OFFSET)
    }

    pub fn prev(&self) -> Option<PageId> {
        match self.read_u32(FIL_PAGE_PREV) {
            FIL_NULL => None,
            n => Some(PageId(n)),
        }
    }

    pub fn next(&self) -> Option<PageId> {
        match self.read_u32(FIL_PAGE_NEXT) {
            FIL_NULL => None,
            n => Some(PageId(n)),
        }
    }

    pub fn set_prev(&mut self, prev: Option<PageId>) {
        self.write_u32(FIL_PAGE_PREV, prev.map_or(FIL_NULL, |p| p.0));
    }

    pub fn set_next(&mut self, next: Option<PageId>) {
        self.write_u32(FIL_PAGE_NEXT, next.map_or(FIL_NULL, |p| p.0));
    }

    pub fn has_siblings(&self) -> bool {
        self.prev().is_some() || self.next().is_some()
    }

    pub fn lsn(&self) -> u64 {
        self.read_u64(FIL_PAGE_LSN)
    }

    /// Stamped by the mini-transaction at commit; not itself logged.
    pub fn set_lsn(&mut self, lsn: u64) {
        BigEndian::write_u64(&mut self.data[FIL_PAGE_LSN..], lsn);
        BigEndian::write_u32(&mut self.data[PAGE_SIZE - FIL_TRAILER_SIZE..], lsn as u32);
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_u16(self.read_u16(FIL_PAGE_TYPE))
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.write_u16(FIL_PAGE_TYPE, page_type as u16);
    }

    pub fn space_id(&self) -> u32 {
        self.read_u32(FIL_PAGE_SPACE_ID)
    }

    pub fn set_space_id(&mut self, space_id: u32) {
        self.write_u32(FIL_PAGE_SPACE_ID, space_id);
    }

    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[FIL_PAGE_OFFSET..PAGE_SIZE - FIL_TRAILER_SIZE]);
        hasher.finalize()
    }

    pub fn stamp_checksum(&mut self) {
        let checksum = self.compute_checksum();
        BigEndian::write_u32(&mut self.data[FIL_PAGE_CHECKSUM..], checksum);
    }

    /// All-zero pages (never written) are accepted.
    pub fn verify_checksum(&self) -> bool {
        let stored = self.read_u32(FIL_PAGE_CHECKSUM);
        if stored == 0 && self.data.iter().all(|&b| b == 0) {
            return true;
        }
        stored == self.compute_checksum()
    }

    pub fn zip(&self) -> Option<&ZipShadow> {
        self.zip.as_ref()
    }

    pub fn is_compressed(&self) -> bool {
        self.zip.is_some()
    }

    pub fn attach_zip(&mut self, capacity: usize) {
        self.zip = Some(ZipShadow::new(capacity));
    }

    pub fn detach_zip(&mut self) {
        self.zip = None;
    }

    pub(crate) fn zip_mut(&mut self) -> Option<&mut ZipShadow> {
        self.zip.as_mut()
    }
}

impl fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuf")
            .field("page_id", &self.page_id)
            .field("prev", &self.prev())
            .field("next", &self.next())
            .field("compressed", &self.is_compressed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_has_null_siblings() {
        let page = PageBuf::new(PageId(3));
        assert_eq!(page.page_no(), 3);
        assert_eq!(page.prev(), None);
        assert_eq!(page.next(), None);
        assert!(!page.has_siblings());
    }

    #[test]
    fn test_writes_are_captured_as_redo() {
        let mut page = PageBuf::new(PageId(1));
        page.set_next(Some(PageId(2)));
        page.memset(200, 10, 0xAB);
        let redo = page.take_redo();
        assert_eq!(redo.len(), 2);
        assert!(page.take_redo().is_empty());
        assert_eq!(page.next(), Some(PageId(2)));
        assert_eq!(page.slice(200, 10), &[0xAB; 10]);
    }

    #[test]
    fn test_temp_page_does_not_log() {
        let mut page = PageBuf::new_temp(PageId(1));
        page.write_u64(100, 42);
        assert!(!page.has_pending_redo());
        assert_eq!(page.read_u64(100), 42);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let mut page = PageBuf::new(PageId(9));
        page.write_u32(500, 0xDEADBEEF);
        page.stamp_checksum();
        assert!(page.verify_checksum());
        page.write_u8(501, 0);
        assert!(!page.verify_checksum());
    }
}

//! Compressed page shadow.
//!
//! A compressed page keeps, next to its uncompressed frame, the last image of
//! the frame body that compressed into the index's `zip_size`. Every change
//! to the frame must be followed by [`PageBuf::zip_compress`]; when that
//! fails, [`PageBuf::zip_restore`] rolls the frame back to the shadow.

use super::{PageBuf, FIL_HEADER_SIZE, FIL_TRAILER_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::PAGE_SIZE;

/// Bytes of the compressed page not available to the image.
pub const PAGE_ZIP_OVERHEAD: usize = 64;

/// Headroom kept free by ordinary record operations so that later in-place
/// updates (child pointers, flags) still recompress.
pub const PAGE_ZIP_RESERVE: usize = 64;

/// Supported compressed sizes.
pub const PAGE_ZIP_SIZES: [usize; 3] = [4096, 8192, 12288];

#[derive(Debug, Clone)]
pub struct ZipShadow {
    capacity: usize,
    image: Vec<u8>,
}

impl ZipShadow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            image: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn image_len(&self) -> usize {
        self.image.len()
    }

    pub fn has_image(&self) -> bool {
        !self.image.is_empty()
    }
}

/// Usable compressed bytes of an empty page of `zip_size`.
pub fn page_zip_empty_size(zip_size: usize) -> usize {
    zip_size.saturating_sub(PAGE_ZIP_OVERHEAD)
}

fn body(data: &[u8; PAGE_SIZE]) -> &[u8] {
    &data[FIL_HEADER_SIZE..PAGE_SIZE - FIL_TRAILER_SIZE]
}

impl PageBuf {
    /// Compresses the frame body keeping `PAGE_ZIP_RESERVE` bytes of headroom.
    pub fn zip_compress(&mut self) -> bool {
        self.zip_compress_with_reserve(PAGE_ZIP_RESERVE)
    }

    /// Compresses the frame body into the shadow if the image fits in
    /// `capacity - overhead - reserve`. On failure the previous image stays.
    pub fn zip_compress_with_reserve(&mut self, reserve: usize) -> bool {
        let image = lz4_flex::compress_prepend_size(body(self.as_bytes()));
        let zip = match self.zip_mut() {
            Some(zip) => zip,
            None => return true,
        };
        let limit = page_zip_empty_size(zip.capacity).saturating_sub(reserve);
        if image.len() > limit {
            return false;
        }
        zip.image = image;
        true
    }

    /// Rewrites the frame body from the shadow image.
    pub fn zip_restore(&mut self) -> StorageResult<()> {
        let page_id = self.page_id();
        let image = match self.zip() {
            Some(zip) if zip.has_image() => zip.image.clone(),
            _ => {
                return Err(StorageError::corruption(
                    page_id,
                    "no compressed image to restore from",
                ))
            }
        };
        let decompressed = lz4_flex::decompress_size_prepended(&image).map_err(|e| {
            StorageError::corruption(page_id, format!("compressed image unreadable: {}", e))
        })?;
        if decompressed.len() != PAGE_SIZE - FIL_HEADER_SIZE - FIL_TRAILER_SIZE {
            return Err(StorageError::corruption(
                page_id,
                "compressed image has the wrong length",
            ));
        }
        let mut src = PageBuf::new_temp(page_id);
        src.body_mut_unlogged().copy_from_slice(&decompressed);
        self.copy_body_from(&src);
        Ok(())
    }

    /// Recompresses after an in-place update that cannot be undone; failure
    /// here means the page no longer represents a valid compressed page.
    pub fn zip_refresh(&mut self) -> StorageResult<()> {
        if self.is_compressed() && !self.zip_compress_with_reserve(0) {
            return Err(StorageError::corruption(
                self.page_id(),
                "in-place update does not recompress",
            ));
        }
        Ok(())
    }

    /// Copies the whole frame body and shadow of `src` byte for byte.
    pub fn zip_copy_from(&mut self, src: &PageBuf) {
        self.copy_body_from(src);
        if let (Some(dst), Some(s)) = (self.zip_mut(), src.zip()) {
            dst.image = s.image.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::tuple::Tuple;
    use crate::storage::page::record::RecStatus;
    use crate::storage::page::{PageId, PageType};
    use rand::{Rng, SeedableRng};

    fn zip_page(capacity: usize) -> PageBuf {
        let mut page = PageBuf::new(PageId(3));
        page.page_create(0, 1, PageType::Index);
        page.attach_zip(capacity);
        assert!(page.zip_compress());
        page
    }

    #[test]
    fn test_compressible_page_fits() {
        let mut page = zip_page(4096);
        let mut cur = page.infimum();
        for i in 0u32..50 {
            let t = Tuple::from_slices(&[&i.to_be_bytes(), &[7u8; 100]]);
            cur = page.insert_rec_after(cur, &t, RecStatus::Ordinary).unwrap().unwrap();
        }
        assert!(page.zip_compress());
        assert!(page.zip().unwrap().image_len() <= page_zip_empty_size(4096));
    }

    #[test]
    fn test_incompressible_insert_is_restored() {
        let mut page = zip_page(4096);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let mut cur = page.infimum();
        let mut inserted = 0;
        loop {
            let payload: Vec<u8> = (0..200).map(|_| rng.gen()).collect();
            let t = Tuple::from_slices(&[&(inserted as u32).to_be_bytes(), &payload]);
            let rec = page.insert_rec_after(cur, &t, RecStatus::Ordinary).unwrap().unwrap();
            if !page.zip_compress() {
                page.zip_restore().unwrap();
                break;
            }
            cur = rec;
            inserted += 1;
        }
        assert!(inserted > 0);
        assert_eq!(page.n_recs(), inserted);
        page.validate_page().unwrap();
    }
}

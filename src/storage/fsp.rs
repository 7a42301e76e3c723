//! File space and segment management.
//!
//! A [`FileSpace`] hands out page numbers of one tablespace. Pages are owned
//! by segments; a B-tree owns two (leaf and non-leaf) whose ids are stored in
//! its root page. Page 0 is reserved for the space header and never handed
//! out. Ownership metadata is kept in memory.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub type SegmentId = u32;

/// Preferred placement of a new page relative to the hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDirection {
    Up,
    Down,
    NoDir,
}

#[derive(Debug, Default)]
struct FspInner {
    next_page_no: u32,
    free_pages: BTreeSet<u32>,
    segments: HashMap<SegmentId, BTreeSet<u32>>,
    page_owner: HashMap<u32, SegmentId>,
    next_segment_id: SegmentId,
    /// Pages promised to outstanding reservations.
    reserved: u32,
}

impl FspInner {
    fn available(&self, max_pages: Option<u32>) -> u32 {
        match max_pages {
            None => u32::MAX,
            Some(max) => {
                let untouched = max.saturating_sub(self.next_page_no);
                untouched + self.free_pages.len() as u32
            }
        }
    }

    fn take(&mut self, page_no: u32, max_pages: Option<u32>) -> bool {
        if self.free_pages.remove(&page_no) {
            return true;
        }
        if page_no == self.next_page_no && max_pages.map_or(true, |m| page_no < m) {
            self.next_page_no += 1;
            return true;
        }
        false
    }
}

#[derive(Debug)]
pub struct FileSpace {
    space_id: u32,
    max_pages: Option<u32>,
    inner: Mutex<FspInner>,
}

impl FileSpace {
    pub fn new(space_id: u32, max_pages: Option<u32>) -> Self {
        Self {
            space_id,
            max_pages,
            inner: Mutex::new(FspInner {
                next_page_no: 1,
                next_segment_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn space_id(&self) -> u32 {
        self.space_id
    }

    fn out_of_space(&self) -> StorageError {
        warn!("tablespace {} is full", self.space_id);
        StorageError::OutOfSpace {
            space: self.space_id,
        }
    }

    pub fn create_segment(&self) -> SegmentId {
        let mut inner = self.inner.lock();
        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        inner.segments.insert(id, BTreeSet::new());
        id
    }

    pub fn segment_exists(&self, segment: SegmentId) -> bool {
        self.inner.lock().segments.contains_key(&segment)
    }

    /// Allocates a page for `segment`, preferring `hint ± 1` per `direction`.
    ///
    /// Without a reservation the call fails once only reserved pages remain.
    pub fn alloc_page(
        &self,
        segment: SegmentId,
        hint: Option<PageId>,
        direction: AllocDirection,
        reservation: Option<&mut Reservation>,
    ) -> StorageResult<PageId> {
        let mut inner = self.inner.lock();
        if !inner.segments.contains_key(&segment) {
            return Err(StorageError::tree_corruption(format!(
                "allocation from unknown segment {}",
                segment
            )));
        }
        let available = inner.available(self.max_pages);
        let reserved_here = match &reservation {
            Some(r) => r.remaining > 0,
            None => false,
        };
        if available == 0 || (!reserved_here && available <= inner.reserved) {
            return Err(self.out_of_space());
        }

        let mut candidates = Vec::with_capacity(2);
        if let Some(hint) = hint {
            match direction {
                AllocDirection::Up => candidates.push(hint.0.checked_add(1)),
                AllocDirection::Down => candidates.push(hint.0.checked_sub(1)),
                AllocDirection::NoDir => {
                    candidates.push(hint.0.checked_add(1));
                    candidates.push(hint.0.checked_sub(1));
                }
            }
        }
        let max_pages = self.max_pages;
        let mut chosen = candidates
            .into_iter()
            .flatten()
            .filter(|&p| p != 0)
            .find(|&p| inner.take(p, max_pages));
        if chosen.is_none() {
            chosen = inner.free_pages.iter().next().copied();
            if let Some(p) = chosen {
                inner.free_pages.remove(&p);
            }
        }
        let page_no = match chosen {
            Some(p) => p,
            None => {
                let p = inner.next_page_no;
                if !inner.take(p, max_pages) {
                    return Err(self.out_of_space());
                }
                p
            }
        };

        if let Some(segment_pages) = inner.segments.get_mut(&segment) {
            segment_pages.insert(page_no);
        }
        inner.page_owner.insert(page_no, segment);
        if let Some(r) = reservation {
            if r.remaining > 0 {
                r.remaining -= 1;
                inner.reserved = inner.reserved.saturating_sub(1);
            }
        }
        Ok(PageId(page_no))
    }

    pub fn free_page(&self, segment: SegmentId, page_id: PageId) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.page_owner.get(&page_id.0) != Some(&segment) {
            return Err(StorageError::corruption(
                page_id,
                format!("page is not owned by segment {}", segment),
            ));
        }
        inner.page_owner.remove(&page_id.0);
        if let Some(pages) = inner.segments.get_mut(&segment) {
            pages.remove(&page_id.0);
        }
        inner.free_pages.insert(page_id.0);
        Ok(())
    }

    /// Frees every page of `segment` and the segment itself.
    pub fn free_segment(&self, segment: SegmentId) -> usize {
        let mut inner = self.inner.lock();
        let pages = inner.segments.remove(&segment).unwrap_or_default();
        for p in &pages {
            inner.page_owner.remove(p);
            inner.free_pages.insert(*p);
        }
        debug!("freed segment {} with {} pages", segment, pages.len());
        pages.len()
    }

    pub fn segment_pages(&self, segment: SegmentId) -> Vec<PageId> {
        let inner = self.inner.lock();
        inner
            .segments
            .get(&segment)
            .map(|s| s.iter().map(|&p| PageId(p)).collect())
            .unwrap_or_default()
    }

    pub fn page_owner(&self, page_id: PageId) -> Option<SegmentId> {
        self.inner.lock().page_owner.get(&page_id.0).copied()
    }

    pub fn n_used_pages(&self) -> usize {
        self.inner.lock().page_owner.len()
    }

    /// Sets aside `n_pages` for one operation. Fails up front with
    /// `OutOfSpace` when the space cannot promise them.
    pub fn reserve(self: &Arc<Self>, n_pages: u32) -> StorageResult<Reservation> {
        let mut inner = self.inner.lock();
        let available = inner.available(self.max_pages);
        if available.saturating_sub(inner.reserved) < n_pages {
            return Err(self.out_of_space());
        }
        inner.reserved += n_pages;
        Ok(Reservation {
            space: self.clone(),
            remaining: n_pages,
        })
    }
}

/// Pages promised to a pessimistic operation; unused pages are returned on
/// drop.
#[derive(Debug)]
pub struct Reservation {
    space: Arc<FileSpace>,
    remaining: u32,
}

impl Reservation {
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut inner = self.space.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(self.remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_prefers_hint_neighbour() -> StorageResult<()> {
        let space = FileSpace::new(1, None);
        let seg = space.create_segment();
        let a = space.alloc_page(seg, None, AllocDirection::NoDir, None)?;
        assert_eq!(a, PageId(1));
        let b = space.alloc_page(seg, Some(a), AllocDirection::Up, None)?;
        assert_eq!(b, PageId(2));

        space.free_page(seg, a)?;
        let c = space.alloc_page(seg, Some(b), AllocDirection::Down, None)?;
        assert_eq!(c, PageId(1));
        Ok(())
    }

    #[test]
    fn test_free_requires_owner() -> StorageResult<()> {
        let space = FileSpace::new(1, None);
        let leaf = space.create_segment();
        let top = space.create_segment();
        let p = space.alloc_page(leaf, None, AllocDirection::NoDir, None)?;
        assert!(space.free_page(top, p).unwrap_err().is_corruption());
        space.free_page(leaf, p)?;
        assert_eq!(space.page_owner(p), None);
        Ok(())
    }

    #[test]
    fn test_reservation_guards_space() -> StorageResult<()> {
        let space = Arc::new(FileSpace::new(3, Some(5)));
        let seg = space.create_segment();
        // pages 1..=4 are usable
        let mut r = space.reserve(3)?;
        space.alloc_page(seg, None, AllocDirection::NoDir, None)?;
        assert!(matches!(
            space.alloc_page(seg, None, AllocDirection::NoDir, None),
            Err(StorageError::OutOfSpace { space: 3 })
        ));
        for _ in 0..3 {
            space.alloc_page(seg, None, AllocDirection::NoDir, Some(&mut r))?;
        }
        assert_eq!(r.remaining(), 0);
        assert!(space.reserve(1).is_err());
        Ok(())
    }

    #[test]
    fn test_dropped_reservation_is_released() -> StorageResult<()> {
        let space = Arc::new(FileSpace::new(1, Some(3)));
        let seg = space.create_segment();
        {
            let _r = space.reserve(2)?;
            assert!(space.alloc_page(seg, None, AllocDirection::NoDir, None).is_err());
        }
        space.alloc_page(seg, None, AllocDirection::NoDir, None)?;
        assert_eq!(space.free_segment(seg), 1);
        assert_eq!(space.n_used_pages(), 0);
        Ok(())
    }
}

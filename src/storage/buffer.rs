//! Page cache.
//!
//! Each resident page lives in a frame whose `RwLock<PageBuf>` is the page
//! latch. Latches are handed out as owned guards so a mini-transaction can
//! hold many of them at once; every guard also pins its frame, and only
//! unpinned frames are considered for eviction.

pub mod lru;
pub mod replacer;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageBuf, PageId};
use crate::storage::PageManager;
use dashmap::DashMap;
use log::trace;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Page latch modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchKind {
    S,
    X,
}

/// Notified with the page image before a frame is reused.
pub trait EvictionListener: Send + Sync {
    fn on_evict(&self, page: &PageBuf);
}

struct FrameState {
    page_id: Option<PageId>,
    pin_count: u32,
}

struct Frame {
    latch: Arc<RwLock<PageBuf>>,
    state: Mutex<FrameState>,
    dirty: AtomicBool,
}

impl Frame {
    fn new() -> Self {
        Self {
            latch: Arc::new(RwLock::new(PageBuf::new_temp(PageId(0)))),
            state: Mutex::new(FrameState {
                page_id: None,
                pin_count: 0,
            }),
            dirty: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Default)]
pub struct BufferStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, FrameId>,
    frames: RwLock<Vec<Arc<Frame>>>,
    replacer: Mutex<Box<dyn Replacer>>,
    page_manager: Option<Mutex<PageManager>>,
    /// Serializes misses so a page is never loaded into two frames.
    load_lock: Mutex<()>,
    max_frames: usize,
    listeners: RwLock<Vec<Arc<dyn EvictionListener>>>,
    stats: BufferStats,
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("resident", &self.inner.page_table.len())
            .field("max_frames", &self.inner.max_frames)
            .finish()
    }
}

impl BufferPool {
    /// A file-backed pool that evicts least recently used frames.
    pub fn new(page_manager: PageManager, replacer: Box<dyn Replacer>, max_frames: usize) -> Self {
        Self::build(Some(page_manager), replacer, max_frames)
    }

    /// A pool without backing file. Pages live until the pool is dropped.
    pub fn in_memory() -> Self {
        Self::build(None, Box::new(lru::LruReplacer::new(0)), usize::MAX)
    }

    fn build(
        page_manager: Option<PageManager>,
        replacer: Box<dyn Replacer>,
        max_frames: usize,
    ) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(Vec::new()),
                replacer: Mutex::new(replacer),
                page_manager: page_manager.map(Mutex::new),
                load_lock: Mutex::new(()),
                max_frames,
                listeners: RwLock::new(Vec::new()),
                stats: BufferStats::default(),
            }),
        }
    }

    pub fn add_eviction_listener(&self, listener: Arc<dyn EvictionListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn stats(&self) -> &BufferStats {
        &self.inner.stats
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.page_table.len()
    }

    /// Pins and latches a page, reading it from disk on a miss.
    pub fn get_page(&self, page_id: PageId, kind: LatchKind) -> StorageResult<PageGuard> {
        let pin = self.pin_page(page_id, false)?;
        Ok(PageGuard::latch(pin, kind))
    }

    /// Latches a resident page without waiting. `None` when the page is not
    /// cached or the latch is taken.
    pub fn try_get_page(&self, page_id: PageId, kind: LatchKind) -> Option<PageGuard> {
        let pin = self.pin_resident(page_id)?;
        let latch = match kind {
            LatchKind::S => Latch::S(pin.frame.latch.try_read_arc()?),
            LatchKind::X => Latch::X(pin.frame.latch.try_write_arc()?),
        };
        Some(PageGuard {
            latch,
            page_id,
            pin,
        })
    }

    /// X-latches a fresh zeroed frame for a newly allocated page, discarding
    /// any stale image of the same page number.
    pub fn create_page(&self, page_id: PageId) -> StorageResult<PageGuard> {
        let pin = self.pin_page(page_id, true)?;
        let mut guard = PageGuard::latch(pin, LatchKind::X);
        if let Latch::X(page) = &mut guard.latch {
            **page = PageBuf::new(page_id);
            page.log_init();
        }
        guard.mark_dirty();
        Ok(guard)
    }

    /// LRU promotion hint.
    pub fn make_young(&self, page_id: PageId) {
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            self.inner.replacer.lock().make_young(frame_id);
        }
    }

    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        let pm = match &self.inner.page_manager {
            Some(pm) => pm,
            None => return Ok(()),
        };
        if let Some(pin) = self.pin_resident(page_id) {
            let page = pin.frame.latch.read();
            if pin.frame.dirty.swap(false, Ordering::SeqCst) {
                pm.lock().write_page(&page)?;
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> StorageResult<()> {
        let pages: Vec<PageId> = self.inner.page_table.iter().map(|e| *e.key()).collect();
        for page_id in pages {
            self.flush_page(page_id)?;
        }
        if let Some(pm) = &self.inner.page_manager {
            pm.lock().sync()?;
        }
        Ok(())
    }

    fn frame(&self, frame_id: FrameId) -> Option<Arc<Frame>> {
        self.inner.frames.read().get(frame_id as usize).cloned()
    }

    fn pin_resident(&self, page_id: PageId) -> Option<Pin> {
        let frame_id = self.inner.page_table.get(&page_id).map(|e| *e.value())?;
        let frame = self.frame(frame_id)?;
        {
            let mut state = frame.state.lock();
            if state.page_id != Some(page_id) {
                return None;
            }
            state.pin_count += 1;
            if state.pin_count == 1 {
                self.inner.replacer.lock().pin(frame_id);
            }
        }
        Some(Pin {
            inner: self.inner.clone(),
            frame,
            frame_id,
        })
    }

    fn pin_page(&self, page_id: PageId, fresh: bool) -> StorageResult<Pin> {
        if let Some(pin) = self.pin_resident(page_id) {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(pin);
        }
        let _load = self.inner.load_lock.lock();
        if let Some(pin) = self.pin_resident(page_id) {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(pin);
        }
        self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);

        let page = if fresh {
            PageBuf::new(page_id)
        } else {
            self.read_from_disk(page_id)?
        };
        let frame_id = self.acquire_frame()?;
        let frame = self
            .frame(frame_id)
            .ok_or(StorageError::BufferPoolFull)?;
        *frame.latch.write() = page;
        frame.dirty.store(fresh, Ordering::SeqCst);
        {
            let mut state = frame.state.lock();
            state.page_id = Some(page_id);
            state.pin_count = 1;
        }
        self.inner.page_table.insert(page_id, frame_id);
        Ok(Pin {
            inner: self.inner.clone(),
            frame,
            frame_id,
        })
    }

    fn read_from_disk(&self, page_id: PageId) -> StorageResult<PageBuf> {
        let pm = self
            .inner
            .page_manager
            .as_ref()
            .ok_or(StorageError::PageNotFound(page_id))?;
        let mut page = pm.lock().read_page(page_id)?;
        if page.is_index_page() && page.header_zip_size() != 0 {
            page.attach_zip(page.header_zip_size());
            page.zip_compress_with_reserve(0);
        }
        Ok(page)
    }

    /// A free frame: a new one while under capacity, else an LRU victim.
    fn acquire_frame(&self) -> StorageResult<FrameId> {
        {
            let mut frames = self.inner.frames.write();
            if frames.len() < self.inner.max_frames || self.inner.page_manager.is_none() {
                frames.push(Arc::new(Frame::new()));
                return Ok((frames.len() - 1) as FrameId);
            }
        }

        for _ in 0..self.inner.max_frames.saturating_mul(2).max(1) {
            let victim = self.inner.replacer.lock().evict();
            let frame_id = victim.ok_or(StorageError::BufferPoolFull)?;
            let frame = match self.frame(frame_id) {
                Some(frame) => frame,
                None => continue,
            };
            let old = {
                let mut state = frame.state.lock();
                if state.pin_count > 0 {
                    continue;
                }
                state.page_id.take()
            };
            if let Some(old_id) = old {
                self.inner.page_table.remove(&old_id);
                let page = frame.latch.read();
                if frame.dirty.swap(false, Ordering::SeqCst) {
                    if let Some(pm) = &self.inner.page_manager {
                        pm.lock().write_page(&page)?;
                    }
                }
                for listener in self.inner.listeners.read().iter() {
                    listener.on_evict(&page);
                }
                self.inner.stats.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("evicted page {} from frame {}", old_id, frame_id);
            }
            return Ok(frame_id);
        }
        Err(StorageError::BufferPoolFull)
    }
}

/// Keeps a frame resident while alive.
struct Pin {
    inner: Arc<BufferPoolInner>,
    frame: Arc<Frame>,
    frame_id: FrameId,
}

impl Drop for Pin {
    fn drop(&mut self) {
        let mut state = self.frame.state.lock();
        state.pin_count = state.pin_count.saturating_sub(1);
        if state.pin_count == 0 {
            self.inner.replacer.lock().unpin(self.frame_id);
        }
    }
}

enum Latch {
    S(ArcRwLockReadGuard<RawRwLock, PageBuf>),
    X(ArcRwLockWriteGuard<RawRwLock, PageBuf>),
}

/// A latched, pinned page. The latch is released before the pin.
pub struct PageGuard {
    latch: Latch,
    page_id: PageId,
    pin: Pin,
}

impl PageGuard {
    fn latch(pin: Pin, kind: LatchKind) -> Self {
        let latch = match kind {
            LatchKind::S => Latch::S(pin.frame.latch.read_arc()),
            LatchKind::X => Latch::X(pin.frame.latch.write_arc()),
        };
        let page_id = match &latch {
            Latch::S(p) => p.page_id(),
            Latch::X(p) => p.page_id(),
        };
        Self {
            latch,
            page_id,
            pin,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn kind(&self) -> LatchKind {
        match self.latch {
            Latch::S(_) => LatchKind::S,
            Latch::X(_) => LatchKind::X,
        }
    }

    pub fn page(&self) -> &PageBuf {
        match &self.latch {
            Latch::S(p) => &**p,
            Latch::X(p) => &**p,
        }
    }

    /// Mutable access; `None` under an S latch.
    pub fn page_mut(&mut self) -> Option<&mut PageBuf> {
        match &mut self.latch {
            Latch::S(_) => None,
            Latch::X(p) => Some(&mut **p),
        }
    }

    pub fn mark_dirty(&self) {
        self.pin.frame.dirty.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;
    use anyhow::Result;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};

    fn create_test_buffer_pool(max_frames: usize) -> Result<(BufferPool, TempDir)> {
        let dir = tempdir()?;
        let page_manager = PageManager::create(&dir.path().join("test.db"))?;
        let replacer = Box::new(lru::LruReplacer::new(max_frames));
        Ok((BufferPool::new(page_manager, replacer, max_frames), dir))
    }

    #[test]
    fn test_create_and_fetch_page() -> Result<()> {
        let (pool, _dir) = create_test_buffer_pool(10)?;
        {
            let mut guard = pool.create_page(PageId(1))?;
            guard.page_mut().unwrap().write_u32(1000, 42);
        }
        let guard = pool.get_page(PageId(1), LatchKind::S)?;
        assert_eq!(guard.page().read_u32(1000), 42);
        assert!(guard.page_mut_is_none());
        Ok(())
    }

    impl PageGuard {
        fn page_mut_is_none(&self) -> bool {
            matches!(self.latch, Latch::S(_))
        }
    }

    #[test]
    fn test_eviction_writes_back() -> Result<()> {
        let (pool, _dir) = create_test_buffer_pool(3)?;
        for i in 1..=6u32 {
            let mut guard = pool.create_page(PageId(i))?;
            guard.page_mut().unwrap().write_u32(2000, i * 10);
        }
        assert!(pool.resident_pages() <= 3);
        assert!(pool.stats().evictions.load(Ordering::Relaxed) >= 3);

        for i in 1..=6u32 {
            let guard = pool.get_page(PageId(i), LatchKind::S)?;
            assert_eq!(guard.page().read_u32(2000), i * 10);
        }
        Ok(())
    }

    #[test]
    fn test_pool_full_when_all_pinned() -> Result<()> {
        let (pool, _dir) = create_test_buffer_pool(2)?;
        let _a = pool.create_page(PageId(1))?;
        let _b = pool.create_page(PageId(2))?;
        assert!(matches!(
            pool.create_page(PageId(3)),
            Err(StorageError::BufferPoolFull)
        ));
        Ok(())
    }

    #[test]
    fn test_try_latch_does_not_wait() -> Result<()> {
        let pool = BufferPool::in_memory();
        let x = pool.create_page(PageId(5))?;
        assert!(pool.try_get_page(PageId(5), LatchKind::S).is_none());
        drop(x);
        assert!(pool.try_get_page(PageId(5), LatchKind::S).is_some());
        assert!(pool.try_get_page(PageId(6), LatchKind::S).is_none());
        Ok(())
    }

    #[test]
    fn test_in_memory_missing_page() {
        let pool = BufferPool::in_memory();
        assert!(matches!(
            pool.get_page(PageId(9), LatchKind::S),
            Err(StorageError::PageNotFound(PageId(9)))
        ));
    }

    struct CountingListener(AtomicUsize);

    impl EvictionListener for CountingListener {
        fn on_evict(&self, _page: &PageBuf) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_eviction_listener_and_zip_reload() -> Result<()> {
        let (pool, _dir) = create_test_buffer_pool(1)?;
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        pool.add_eviction_listener(listener.clone());
        {
            let mut guard = pool.create_page(PageId(1))?;
            let page = guard.page_mut().unwrap();
            page.page_create(0, 3, PageType::Index);
            page.set_header_zip_size(8192);
        }
        drop(pool.create_page(PageId(2))?);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        let guard = pool.get_page(PageId(1), LatchKind::S)?;
        assert!(guard.page().is_compressed());
        assert_eq!(guard.page().index_id(), 3);
        Ok(())
    }
}

//! Mini-transactions.
//!
//! An [`Mtr`] owns every latch taken by one atomic unit of work: index tree
//! locks and page latches, kept in a memo in acquisition order. Pages are
//! addressed through [`BlockId`] handles into the memo. On commit the redo
//! captured by the X-latched pages is appended to the redo log as a single
//! group, page LSNs are stamped and latches are released child-to-parent.

use crate::storage::buffer::{BufferPool, LatchKind, PageGuard};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageBuf, PageId};
use crate::storage::wal::{RedoLog, RedoRecord, LSN};
use log::{trace, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::sync::Arc;

/// Index tree lock. S admits concurrent readers, SX one structure-preserving
/// writer beside them, X excludes everybody.
pub type IndexLock = Arc<RwLock<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeLatchMode {
    S,
    SX,
    X,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    All,
    NoRedo,
}

/// Handle of a page latched by a mini-transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

/// A held tree lock; the guard is only kept for its lifetime.
enum TreeGuard {
    S { _guard: ArcRwLockReadGuard<RawRwLock, ()> },
    SX { _guard: ArcRwLockUpgradableReadGuard<RawRwLock, ()> },
    X { _guard: ArcRwLockWriteGuard<RawRwLock, ()> },
}

impl TreeGuard {
    fn mode(&self) -> TreeLatchMode {
        match self {
            TreeGuard::S { .. } => TreeLatchMode::S,
            TreeGuard::SX { .. } => TreeLatchMode::SX,
            TreeGuard::X { .. } => TreeLatchMode::X,
        }
    }
}

enum MemoSlot {
    Tree { lock: usize, guard: TreeGuard },
    Page(PageGuard),
}

pub struct Mtr {
    pool: BufferPool,
    log: Arc<RedoLog>,
    memo: Vec<Option<MemoSlot>>,
    mode: LogMode,
    /// Redo of pages released before commit.
    pending: Vec<RedoRecord>,
    committed: bool,
}

fn lock_key(lock: &IndexLock) -> usize {
    Arc::as_ptr(lock) as usize
}

impl Mtr {
    pub fn start(pool: &BufferPool, log: &Arc<RedoLog>) -> Self {
        Self {
            pool: pool.clone(),
            log: log.clone(),
            memo: Vec::new(),
            mode: LogMode::All,
            pending: Vec::new(),
            committed: false,
        }
    }

    pub fn set_log_mode(&mut self, mode: LogMode) {
        self.mode = mode;
    }

    pub fn log_mode(&self) -> LogMode {
        self.mode
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn s_lock_index(&mut self, lock: &IndexLock) {
        let guard = TreeGuard::S {
            _guard: lock.read_arc(),
        };
        self.push_tree(lock, guard);
    }

    pub fn sx_lock_index(&mut self, lock: &IndexLock) {
        let guard = TreeGuard::SX {
            _guard: lock.upgradable_read_arc(),
        };
        self.push_tree(lock, guard);
    }

    pub fn x_lock_index(&mut self, lock: &IndexLock) {
        let guard = TreeGuard::X {
            _guard: lock.write_arc(),
        };
        self.push_tree(lock, guard);
    }

    fn push_tree(&mut self, lock: &IndexLock, guard: TreeGuard) {
        self.memo.push(Some(MemoSlot::Tree {
            lock: lock_key(lock),
            guard,
        }));
    }

    /// Releases every tree lock on `lock` held by this mini-transaction.
    pub fn release_index(&mut self, lock: &IndexLock) {
        let key = lock_key(lock);
        for slot in self.memo.iter_mut() {
            if matches!(slot, Some(MemoSlot::Tree { lock, .. }) if *lock == key) {
                *slot = None;
            }
        }
    }

    pub fn memo_contains_tree(&self, lock: &IndexLock, mode: TreeLatchMode) -> bool {
        let key = lock_key(lock);
        self.memo.iter().flatten().any(|slot| {
            matches!(slot, MemoSlot::Tree { lock, guard } if *lock == key && guard.mode() == mode)
        })
    }

    #[cfg(debug_assertions)]
    fn holds_structure_lock(&self) -> bool {
        self.memo.iter().flatten().any(|slot| {
            matches!(
                slot,
                MemoSlot::Tree {
                    guard: TreeGuard::X { .. } | TreeGuard::SX { .. },
                    ..
                }
            )
        })
    }

    /// Handle of `page_id` if this mini-transaction already latched it.
    pub fn get_already_latched(&self, page_id: PageId) -> Option<BlockId> {
        self.memo.iter().enumerate().find_map(|(i, slot)| match slot {
            Some(MemoSlot::Page(g)) if g.page_id() == page_id => Some(BlockId(i)),
            _ => None,
        })
    }

    pub fn memo_contains_page(&self, page_id: PageId, kind: LatchKind) -> bool {
        self.memo.iter().flatten().any(|slot| {
            matches!(slot, MemoSlot::Page(g) if g.page_id() == page_id && g.kind() == kind)
        })
    }

    /// Latches `page_id`, reusing a latch this mini-transaction already holds.
    pub fn get_page(&mut self, page_id: PageId, kind: LatchKind) -> StorageResult<BlockId> {
        if let Some(block) = self.get_already_latched(page_id) {
            if kind == LatchKind::X && self.latch_kind(block) == LatchKind::S {
                return Err(StorageError::corruption(
                    page_id,
                    "page latch upgrade from S to X",
                ));
            }
            return Ok(block);
        }
        let guard = self.pool.get_page(page_id, kind)?;
        let block = self.push_page(guard);
        #[cfg(debug_assertions)]
        self.check_latch_order(block);
        Ok(block)
    }

    /// Latches a resident page without waiting.
    pub fn try_get_page(&mut self, page_id: PageId, kind: LatchKind) -> Option<BlockId> {
        if let Some(block) = self.get_already_latched(page_id) {
            if kind == LatchKind::X && self.latch_kind(block) == LatchKind::S {
                return None;
            }
            return Some(block);
        }
        let guard = self.pool.try_get_page(page_id, kind)?;
        Some(self.push_page(guard))
    }

    /// X-latches a zeroed frame for a freshly allocated page.
    pub fn create_page(&mut self, page_id: PageId) -> StorageResult<BlockId> {
        if let Some(block) = self.get_already_latched(page_id) {
            // freed and reallocated within this mini-transaction
            if self.latch_kind(block) != LatchKind::X {
                return Err(StorageError::corruption(
                    page_id,
                    "reallocated page is only S-latched",
                ));
            }
            self.page_mut(block).reinit();
            return Ok(block);
        }
        let guard = self.pool.create_page(page_id)?;
        Ok(self.push_page(guard))
    }

    fn push_page(&mut self, mut guard: PageGuard) -> BlockId {
        let logging = self.mode == LogMode::All;
        if let Some(page) = guard.page_mut() {
            page.set_logging(logging);
        }
        self.memo.push(Some(MemoSlot::Page(guard)));
        BlockId(self.memo.len() - 1)
    }

    #[cfg(debug_assertions)]
    fn check_latch_order(&self, block: BlockId) {
        if self.holds_structure_lock() {
            return;
        }
        let new = self.page(block);
        if !new.is_index_page() {
            return;
        }
        for slot in self.memo[..block.0].iter().flatten() {
            let held = match slot {
                MemoSlot::Page(g) => g.page(),
                MemoSlot::Tree { .. } => continue,
            };
            if !held.is_index_page() || held.index_id() != new.index_id() {
                continue;
            }
            let ordered = held.level() > new.level()
                || (held.level() == new.level() && held.next() == Some(new.page_id()));
            debug_assert!(
                ordered,
                "latch order violated: page {} (level {}) latched while holding page {} (level {})",
                new.page_id(),
                new.level(),
                held.page_id(),
                held.level()
            );
        }
    }

    fn guard(&self, block: BlockId) -> &PageGuard {
        match self.memo.get(block.0) {
            Some(Some(MemoSlot::Page(g))) => g,
            _ => panic!("block {:?} is not latched by this mini-transaction", block),
        }
    }

    fn guard_mut(&mut self, block: BlockId) -> &mut PageGuard {
        match self.memo.get_mut(block.0) {
            Some(Some(MemoSlot::Page(g))) => g,
            _ => panic!("block {:?} is not latched by this mini-transaction", block),
        }
    }

    pub fn page_id(&self, block: BlockId) -> PageId {
        self.guard(block).page_id()
    }

    pub fn latch_kind(&self, block: BlockId) -> LatchKind {
        self.guard(block).kind()
    }

    pub fn page(&self, block: BlockId) -> &PageBuf {
        self.guard(block).page()
    }

    /// Mutable page access. The block must be X-latched.
    pub fn page_mut(&mut self, block: BlockId) -> &mut PageBuf {
        match self.guard_mut(block).page_mut() {
            Some(page) => page,
            None => panic!("block {:?} modified without an X latch", block),
        }
    }

    /// Two distinct X-latched pages at once.
    pub fn pages_mut2(&mut self, a: BlockId, b: BlockId) -> (&mut PageBuf, &mut PageBuf) {
        assert_ne!(a, b, "pages_mut2 on the same block");
        let (lo, hi, swapped) = if a.0 < b.0 { (a, b, false) } else { (b, a, true) };
        let (left, right) = self.memo.split_at_mut(hi.0);
        let first = match &mut left[lo.0] {
            Some(MemoSlot::Page(g)) => g.page_mut(),
            _ => None,
        };
        let second = match &mut right[0] {
            Some(MemoSlot::Page(g)) => g.page_mut(),
            _ => None,
        };
        match (first, second) {
            (Some(x), Some(y)) if swapped => (y, x),
            (Some(x), Some(y)) => (x, y),
            _ => panic!("blocks {:?}/{:?} modified without X latches", a, b),
        }
    }

    /// `src` for reading and `dst` for writing.
    pub fn page_pair(&mut self, src: BlockId, dst: BlockId) -> (&PageBuf, &mut PageBuf) {
        let (dst_page, src_page) = self.pages_mut2(dst, src);
        (src_page, dst_page)
    }

    pub fn savepoint(&self) -> usize {
        self.memo.len()
    }

    /// Releases the latches taken after `savepoint`, newest first.
    pub fn rollback_to_savepoint(&mut self, savepoint: usize) {
        while self.memo.len() > savepoint {
            if let Some(slot) = self.memo.pop() {
                self.release_slot(slot);
            }
        }
    }

    /// Releases one page latch before commit. Its redo is kept for the commit
    /// group.
    pub fn release_page(&mut self, block: BlockId) {
        let slot = self.memo.get_mut(block.0).and_then(Option::take);
        self.release_slot(slot);
    }

    fn release_slot(&mut self, slot: Option<MemoSlot>) {
        if let Some(MemoSlot::Page(mut guard)) = slot {
            let no_redo = self.mode == LogMode::NoRedo;
            if let Some(page) = guard.page_mut() {
                if page.has_pending_redo() || no_redo {
                    self.pending.extend(page.take_redo());
                    guard.mark_dirty();
                }
            }
        }
    }

    /// Number of page latches currently held.
    pub fn n_pages_latched(&self) -> usize {
        self.memo
            .iter()
            .flatten()
            .filter(|slot| matches!(slot, MemoSlot::Page(_)))
            .count()
    }

    /// Appends the captured redo as one group, stamps page LSNs and releases
    /// every latch in reverse acquisition order.
    pub fn commit(mut self) -> StorageResult<LSN> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> StorageResult<LSN> {
        self.committed = true;
        let mut records = std::mem::take(&mut self.pending);
        let mut modified = Vec::new();
        for (i, slot) in self.memo.iter_mut().enumerate() {
            if let Some(MemoSlot::Page(guard)) = slot {
                if let Some(page) = guard.page_mut() {
                    if page.has_pending_redo() || self.mode == LogMode::NoRedo {
                        records.extend(page.take_redo());
                        modified.push(i);
                    }
                }
            }
        }

        let result = match self.mode {
            LogMode::All if !records.is_empty() => self.log.append(records),
            _ => Ok(self.log.current_lsn()),
        };
        let lsn = match &result {
            Ok(lsn) => *lsn,
            Err(_) => LSN::new(),
        };
        for i in modified {
            if let Some(Some(MemoSlot::Page(guard))) = self.memo.get_mut(i) {
                if let Some(page) = guard.page_mut() {
                    if !lsn.is_invalid() {
                        page.set_lsn(lsn.0);
                    }
                }
                guard.mark_dirty();
            }
        }
        trace!("mtr commit at {} releasing {} latches", lsn, self.memo.len());
        while let Some(slot) = self.memo.pop() {
            drop(slot);
        }
        result
    }
}

/// Dropping an uncommitted mini-transaction commits it. Page changes are
/// never undone, so an error path that returns early leaves whatever it had
/// already written logged and in place; callers only bail out before their
/// first change or after the pages are consistent again.
impl Drop for Mtr {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.commit_inner() {
                warn!("implicit mini-transaction commit failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;
    use std::collections::HashMap;

    fn setup() -> (BufferPool, Arc<RedoLog>) {
        (BufferPool::in_memory(), Arc::new(RedoLog::in_memory()))
    }

    #[test]
    fn test_commit_groups_redo() -> StorageResult<()> {
        let (pool, log) = setup();
        let mut mtr = Mtr::start(&pool, &log);
        let a = mtr.create_page(PageId(1))?;
        let b = mtr.create_page(PageId(2))?;
        mtr.page_mut(a).page_create(0, 9, PageType::Index);
        mtr.page_mut(b).write_u32(4000, 77);
        let lsn = mtr.commit()?;
        assert_eq!(lsn, LSN(1));
        assert_eq!(log.groups().len(), 1);

        let mut pages = HashMap::new();
        RedoLog::replay(&log.groups(), &mut pages);
        assert_eq!(pages[&PageId(1)].index_id(), 9);
        assert_eq!(pages[&PageId(2)].read_u32(4000), 77);

        let guard = pool.get_page(PageId(2), LatchKind::S)?;
        assert_eq!(guard.page().lsn(), 1);
        Ok(())
    }

    #[test]
    fn test_drop_commits_changes_made_so_far() -> StorageResult<()> {
        let (pool, log) = setup();
        let fail_after_write = |pool: &BufferPool| -> StorageResult<()> {
            let mut mtr = Mtr::start(pool, &log);
            let a = mtr.create_page(PageId(5))?;
            mtr.page_mut(a).write_u32(4000, 42);
            Err(StorageError::PageNotFound(PageId(6)))
        };
        assert!(fail_after_write(&pool).is_err());

        assert_eq!(log.groups().len(), 1);
        let mut pages = HashMap::new();
        RedoLog::replay(&log.groups(), &mut pages);
        assert_eq!(pages[&PageId(5)].read_u32(4000), 42);
        // latches are gone and the page carries the group's LSN
        let guard = pool.try_get_page(PageId(5), LatchKind::X).expect("page still latched");
        assert_eq!(guard.page().read_u32(4000), 42);
        assert_eq!(guard.page().lsn(), 1);
        Ok(())
    }

    #[test]
    fn test_reuses_held_latch_and_rejects_upgrade() -> StorageResult<()> {
        let (pool, log) = setup();
        drop(pool.create_page(PageId(3))?);
        let mut mtr = Mtr::start(&pool, &log);
        let s = mtr.get_page(PageId(3), LatchKind::S)?;
        assert_eq!(mtr.get_page(PageId(3), LatchKind::S)?, s);
        assert!(mtr.get_page(PageId(3), LatchKind::X).unwrap_err().is_corruption());
        assert!(mtr.memo_contains_page(PageId(3), LatchKind::S));
        mtr.commit()?;
        Ok(())
    }

    #[test]
    fn test_savepoint_releases_later_latches() -> StorageResult<()> {
        let (pool, log) = setup();
        drop(pool.create_page(PageId(1))?);
        drop(pool.create_page(PageId(2))?);
        let mut mtr = Mtr::start(&pool, &log);
        mtr.get_page(PageId(1), LatchKind::X)?;
        let sp = mtr.savepoint();
        mtr.get_page(PageId(2), LatchKind::X)?;
        mtr.rollback_to_savepoint(sp);
        assert!(pool.try_get_page(PageId(2), LatchKind::X).is_some());
        assert!(pool.try_get_page(PageId(1), LatchKind::S).is_none());
        assert_eq!(mtr.n_pages_latched(), 1);
        mtr.commit()?;
        Ok(())
    }

    #[test]
    fn test_tree_lock_modes() {
        let (pool, log) = setup();
        let lock: IndexLock = Arc::new(RwLock::new(()));
        let mut a = Mtr::start(&pool, &log);
        a.sx_lock_index(&lock);
        let mut b = Mtr::start(&pool, &log);
        b.s_lock_index(&lock);
        assert!(a.memo_contains_tree(&lock, TreeLatchMode::SX));
        assert!(lock.try_write().is_none());
        drop(b);
        a.release_index(&lock);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_tree_guard_held_until_commit() -> StorageResult<()> {
        let (pool, log) = setup();
        let lock: IndexLock = Arc::new(RwLock::new(()));
        let mut mtr = Mtr::start(&pool, &log);
        mtr.x_lock_index(&lock);
        assert!(mtr.memo_contains_tree(&lock, TreeLatchMode::X));
        assert!(!mtr.memo_contains_tree(&lock, TreeLatchMode::S));
        assert!(lock.try_read().is_none());
        mtr.commit()?;
        assert!(lock.try_write().is_some());
        Ok(())
    }

    #[test]
    fn test_no_redo_mode_skips_log() -> StorageResult<()> {
        let (pool, log) = setup();
        let mut mtr = Mtr::start(&pool, &log);
        mtr.set_log_mode(LogMode::NoRedo);
        let a = mtr.create_page(PageId(4))?;
        mtr.page_mut(a).write_u16(3000, 5);
        mtr.commit()?;
        assert!(log.groups().is_empty());
        Ok(())
    }
}

//! B-tree index engine.
//!
//! Records live in index pages (see [`crate::storage::page::index_page`]);
//! leaves are at level 0 and every non-leaf record is a node pointer made of
//! the child's first key prefix and the child page number. The first record
//! of the leftmost page of each non-leaf level carries the MIN_REC flag and
//! compares below every key.
//!
//! Concurrency follows the tree-lock/page-latch protocol of [`latch`]: leaf
//! operations descend under the tree S lock with latch coupling and keep only
//! the leaf latched; structure modifications take the tree X lock and keep
//! every page they touch latched until the mini-transaction commits.

pub mod bulk;
pub mod cursor;
pub mod defrag;
pub mod delete;
pub mod insert;
pub mod iterator;
pub mod key;
pub mod latch;
pub mod smo;
pub mod validate;

use self::iterator::BTreeIterator;
use self::key::IndexDef;
use self::latch::BtrLatchMode;
use crate::access::ahi::info::{LeafSearch, SearchInfo};
use crate::access::ahi::AdaptiveHashIndex;
use crate::access::tuple::Tuple;
use crate::config::EngineConfig;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fsp::{AllocDirection, FileSpace, Reservation, SegmentId};
use crate::storage::mtr::{BlockId, IndexLock, Mtr};
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::{PageBuf, PageId, PageType};
use crate::storage::wal::RedoLog;
use crate::storage::{BufferPool, PAGE_SIZE};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Upper bound on tree height.
pub const BTR_MAX_LEVELS: usize = 100;

/// The services an index runs on.
#[derive(Clone)]
pub struct IndexContext {
    pub pool: BufferPool,
    pub log: Arc<RedoLog>,
    pub space: Arc<FileSpace>,
    pub ahi: Arc<AdaptiveHashIndex>,
    /// Fill percentage below which a page is merged with a sibling.
    pub merge_threshold_pct: usize,
    /// Share of a compressed page kept free when merging into it.
    pub zip_pad_pct: usize,
    /// Fill target of defragmented pages.
    pub defrag_fill_pct: usize,
    pub defrag_fill_n_recs: usize,
}

impl IndexContext {
    pub fn new(
        pool: BufferPool,
        log: Arc<RedoLog>,
        space: Arc<FileSpace>,
        ahi: Arc<AdaptiveHashIndex>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            pool,
            log,
            space,
            ahi,
            merge_threshold_pct: config.merge_threshold_pct,
            zip_pad_pct: config.zip_pad_pct,
            defrag_fill_pct: config.defrag_fill_pct,
            defrag_fill_n_recs: config.defrag_fill_n_recs,
        }
    }
}

/// Structure modification counters of one tree.
#[derive(Debug, Default)]
pub struct TreeCounters {
    pub optimistic_inserts: AtomicU64,
    pub pessimistic_inserts: AtomicU64,
    pub splits: AtomicU64,
    pub right_sibling_inserts: AtomicU64,
    pub root_raises: AtomicU64,
    pub optimistic_deletes: AtomicU64,
    pub pessimistic_deletes: AtomicU64,
    pub merges: AtomicU64,
    pub discards: AtomicU64,
    pub lifts: AtomicU64,
    pub reorganizes: AtomicU64,
    pub bulk_pages: AtomicU64,
    pub defrag_runs: AtomicU64,
    pub defrag_pages_freed: AtomicU64,
}

impl TreeCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub struct BTree {
    index: IndexDef,
    root: PageId,
    seg_leaf: SegmentId,
    seg_top: SegmentId,
    lock: IndexLock,
    ctx: IndexContext,
    search_info: SearchInfo,
    counters: TreeCounters,
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("index", &self.index.name)
            .field("root", &self.root)
            .finish()
    }
}

impl BTree {
    /// Creates an empty tree: two segments and a root leaf page.
    pub fn create(ctx: IndexContext, index: IndexDef) -> StorageResult<Self> {
        index.validate()?;
        let seg_top = ctx.space.create_segment();
        let seg_leaf = ctx.space.create_segment();
        let root = match ctx
            .space
            .alloc_page(seg_top, None, AllocDirection::NoDir, None)
        {
            Ok(page) => page,
            Err(e) => {
                ctx.space.free_segment(seg_top);
                ctx.space.free_segment(seg_leaf);
                return Err(e);
            }
        };

        let tree = Self {
            index,
            root,
            seg_leaf,
            seg_top,
            lock: Arc::new(RwLock::new(())),
            ctx,
            search_info: SearchInfo::new(),
            counters: TreeCounters::default(),
        };
        let mut mtr = tree.start_mtr();
        let block = mtr.create_page(root)?;
        let page = mtr.page_mut(block);
        tree.init_page(page, 0);
        page.set_seg_headers(seg_leaf, seg_top);
        page.zip_refresh()?;
        mtr.commit()?;
        info!(
            "created index {} (id {}) with root page {}",
            tree.index.name, tree.index.id, root
        );
        Ok(tree)
    }

    /// Opens an existing tree by its root page.
    pub fn open(ctx: IndexContext, index: IndexDef, root: PageId) -> StorageResult<Self> {
        index.validate()?;
        let (seg_leaf, seg_top) = {
            let guard = ctx.pool.get_page(root, LatchKind::S)?;
            let page = guard.page();
            if !page.is_index_page() || page.index_id() != index.id {
                return Err(StorageError::corruption(
                    root,
                    format!("not the root of index {}", index.name),
                ));
            }
            (page.seg_leaf(), page.seg_top())
        };
        if !ctx.space.segment_exists(seg_leaf) || !ctx.space.segment_exists(seg_top) {
            return Err(StorageError::corruption(
                root,
                format!("segments {}/{} of index {} are gone", seg_leaf, seg_top, index.name),
            ));
        }
        Ok(Self {
            index,
            root,
            seg_leaf,
            seg_top,
            lock: Arc::new(RwLock::new(())),
            ctx,
            search_info: SearchInfo::new(),
            counters: TreeCounters::default(),
        })
    }

    /// Frees both segments of the tree rooted at `root` if that page still
    /// belongs to `index_id`. Returns whether anything was freed.
    pub fn free_if_exists(ctx: &IndexContext, root: PageId, index_id: u64) -> StorageResult<bool> {
        let mut mtr = Mtr::start(&ctx.pool, &ctx.log);
        let block = match mtr.get_page(root, LatchKind::X) {
            Ok(block) => block,
            Err(StorageError::PageNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let (seg_leaf, seg_top) = {
            let page = mtr.page(block);
            if !page.is_index_page() || page.index_id() != index_id {
                return Ok(false);
            }
            (page.seg_leaf(), page.seg_top())
        };
        ctx.ahi.drop_index(index_id);
        let freed = ctx.space.free_segment(seg_leaf) + ctx.space.free_segment(seg_top);
        mtr.page_mut(block).set_page_type(PageType::Allocated);
        mtr.commit()?;
        info!("freed index {} rooted at page {}: {} pages", index_id, root, freed);
        Ok(true)
    }

    /// Frees this tree.
    pub fn drop_tree(self) -> StorageResult<bool> {
        Self::free_if_exists(&self.ctx, self.root, self.index.id)
    }

    pub fn index(&self) -> &IndexDef {
        &self.index
    }

    pub fn root_page_id(&self) -> PageId {
        self.root
    }

    pub fn context(&self) -> &IndexContext {
        &self.ctx
    }

    pub fn counters(&self) -> &TreeCounters {
        &self.counters
    }

    pub fn search_info(&self) -> &SearchInfo {
        &self.search_info
    }

    pub(crate) fn lock(&self) -> &IndexLock {
        &self.lock
    }

    /// Leaf and non-leaf segments.
    pub(crate) fn segments(&self) -> (SegmentId, SegmentId) {
        (self.seg_leaf, self.seg_top)
    }

    pub(crate) fn start_mtr(&self) -> Mtr {
        Mtr::start(&self.ctx.pool, &self.ctx.log)
    }

    /// Number of levels, 1 for a single leaf.
    pub fn height(&self) -> StorageResult<usize> {
        let mut mtr = self.start_mtr();
        mtr.s_lock_index(&self.lock);
        let block = mtr.get_page(self.root, LatchKind::S)?;
        let level = mtr.page(block).level();
        mtr.commit()?;
        Ok(level + 1)
    }

    /// Point lookup by the full unique key.
    pub fn get(&self, key: &Tuple) -> StorageResult<Option<Tuple>> {
        self.index.check_key(key)?;
        if key.n_fields() != self.index.n_uniq {
            return Err(StorageError::InvalidTuple(format!(
                "point lookup on index {} needs {} key fields, got {}",
                self.index.name,
                self.index.n_uniq,
                key.n_fields()
            )));
        }

        let mut hash_failed = false;
        self.search_info.sync_epoch(self.ctx.ahi.epoch());
        if self.ctx.ahi.is_enabled() && self.search_info.guess_params().is_some() {
            if let Some(found) =
                self.ctx
                    .ahi
                    .guess_on_hash(&self.ctx.pool, &self.index, &self.search_info, key)
            {
                return Ok(Some(found));
            }
            hash_failed = true;
        }

        let mut mtr = self.start_mtr();
        let cursor =
            self.search_to_nth_level(&mut mtr, key, 0, PageCurMode::GE, BtrLatchMode::SearchLeaf)?;
        let page = mtr.page(cursor.block);
        let found = (page.rec_is_user(cursor.rec) && cursor.up_match.fields >= self.index.n_uniq)
            .then(|| page.rec_to_tuple(cursor.rec));
        let search = LeafSearch {
            page_id: cursor.page_id,
            n_recs: page.n_recs(),
            low_match: cursor.low_match,
            up_match: cursor.up_match,
            hash_failed,
        };
        self.ctx
            .ahi
            .info_update(&self.search_info, &self.index, page, cursor.rec, &search);
        mtr.commit()?;
        Ok(found)
    }

    pub fn contains(&self, key: &Tuple) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Every record in key order.
    pub fn scan(&self) -> BTreeIterator<'_> {
        BTreeIterator::new(self, Bound::Unbounded, Bound::Unbounded)
    }

    /// Records whose key prefix lies within the bounds.
    pub fn range(&self, start: Bound<Tuple>, end: Bound<Tuple>) -> BTreeIterator<'_> {
        BTreeIterator::new(self, start, end)
    }

    /// Reads the auto-increment counter kept on the root page.
    pub fn read_autoinc(&self) -> StorageResult<u64> {
        let mut mtr = self.start_mtr();
        let block = mtr.get_page(self.root, LatchKind::S)?;
        let value = mtr.page(block).max_trx_id();
        mtr.commit()?;
        Ok(value)
    }

    /// Raises the auto-increment counter to `value`; lowers it only with
    /// `reset`.
    pub fn write_autoinc(&self, value: u64, reset: bool) -> StorageResult<()> {
        let mut mtr = self.start_mtr();
        let block = mtr.get_page(self.root, LatchKind::X)?;
        let page = mtr.page_mut(block);
        if reset || value > page.max_trx_id() {
            page.set_max_trx_id(value);
            page.zip_refresh()?;
        }
        mtr.commit()?;
        Ok(())
    }

    /// Fill level below which a page is merged.
    pub(crate) fn compress_limit(&self) -> usize {
        PAGE_SIZE * self.ctx.merge_threshold_pct / 100
    }

    /// Worst-case page count of a pessimistic operation on a tree of
    /// `height` levels: a split on every level plus a new root.
    pub(crate) fn reserve_for(&self, height: usize) -> u32 {
        (2 * height + 2) as u32
    }

    /// Reserves pages for a pessimistic delete. Deletes rarely allocate, so
    /// a full tablespace does not prevent them.
    pub(crate) fn reserve_for_delete(&self, height: usize) -> StorageResult<Reservation> {
        match self.ctx.space.reserve(self.reserve_for(height)) {
            Ok(r) => Ok(r),
            Err(StorageError::OutOfSpace { .. }) => {
                warn!(
                    "index {}: deleting without a page reservation, tablespace is full",
                    self.index.name
                );
                self.ctx.space.reserve(0)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn is_live_page(&self, page: &PageBuf) -> bool {
        page.is_index_page() && page.index_id() == self.index.id
    }

    pub(crate) fn check_index_page(
        &self,
        page: &PageBuf,
        level: Option<usize>,
    ) -> StorageResult<()> {
        if !self.is_live_page(page) {
            return Err(StorageError::corruption(
                page.page_id(),
                format!("page is not part of index {}", self.index.name),
            ));
        }
        if let Some(level) = level {
            if page.level() != level {
                return Err(StorageError::corruption(
                    page.page_id(),
                    format!("page is at level {}, expected {}", page.level(), level),
                ));
            }
        }
        Ok(())
    }

    fn init_page(&self, page: &mut PageBuf, level: usize) {
        page.page_create(level, self.index.id, self.index.page_type());
        page.set_space_id(self.ctx.space.space_id());
        if let Some(zip) = self.index.zip_size {
            page.set_header_zip_size(zip);
            if !page.is_compressed() {
                page.attach_zip(zip);
            }
        }
    }

    fn segment_for(&self, level: usize) -> SegmentId {
        if level == 0 {
            self.seg_leaf
        } else {
            self.seg_top
        }
    }

    /// Allocates and formats a page at `level` near `hint`. The page is
    /// returned X-latched and empty; compressed pages still need a compress.
    pub(crate) fn page_alloc(
        &self,
        mtr: &mut Mtr,
        level: usize,
        hint: PageId,
        direction: AllocDirection,
        reservation: &mut Reservation,
    ) -> StorageResult<BlockId> {
        let page_id = self.ctx.space.alloc_page(
            self.segment_for(level),
            Some(hint),
            direction,
            Some(reservation),
        )?;
        let block = mtr.create_page(page_id)?;
        self.init_page(mtr.page_mut(block), level);
        debug!(
            "index {}: allocated page {} at level {}",
            self.index.name, page_id, level
        );
        Ok(block)
    }

    /// Returns a page to its segment. Its hash entries go first.
    pub(crate) fn page_free(&self, mtr: &mut Mtr, block: BlockId) -> StorageResult<()> {
        let page_id = mtr.page_id(block);
        if page_id == self.root {
            return Err(StorageError::corruption(page_id, "attempt to free the root"));
        }
        let level = mtr.page(block).level();
        self.ctx.ahi.drop_page_hash_index(mtr.page(block));
        self.search_info.forget_page(page_id);
        self.ctx.space.free_page(self.segment_for(level), page_id)?;
        mtr.page_mut(block).set_page_type(PageType::Allocated);
        debug!("index {}: freed page {}", self.index.name, page_id);
        Ok(())
    }

    /// Reorganizes a page, dropping its hash entries first.
    pub(crate) fn reorganize(&self, mtr: &mut Mtr, block: BlockId) -> StorageResult<()> {
        self.ctx.ahi.drop_page_hash_index(mtr.page(block));
        TreeCounters::bump(&self.counters.reorganizes);
        mtr.page_mut(block).reorganize()
    }

    /// Puts the MIN_REC flag on the first record of a non-leaf page iff the
    /// page is leftmost on its level. Returns whether the page changed.
    pub(crate) fn fix_min_rec(page: &mut PageBuf, leftmost: bool) -> bool {
        if page.is_leaf() {
            return false;
        }
        match page.first_user_rec() {
            Some(first) if page.rec_is_min_rec(first) != leftmost => {
                page.rec_set_min_rec(first, leftmost);
                true
            }
            _ => false,
        }
    }

    /// Search key of a record: its unique prefix.
    pub(crate) fn node_key(&self, page: &PageBuf, rec: usize) -> Tuple {
        page.rec_key_tuple(rec, self.index.n_uniq)
    }

    /// Node pointer to `child` built from a record of that child.
    pub(crate) fn node_ptr(&self, page: &PageBuf, rec: usize, child: PageId) -> Tuple {
        self.node_key(page, rec).with_child(child)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::access::value::encode_u64;
    use crate::config::AhiConfig;

    pub fn context_with(max_pages: Option<u32>, ahi: &AhiConfig) -> IndexContext {
        let config = EngineConfig {
            tablespace_max_pages: max_pages,
            ahi: ahi.clone(),
            ..Default::default()
        };
        IndexContext::new(
            BufferPool::in_memory(),
            Arc::new(RedoLog::in_memory()),
            Arc::new(FileSpace::new(1, max_pages)),
            Arc::new(AdaptiveHashIndex::new(&config.ahi)),
            &config,
        )
    }

    pub fn context() -> IndexContext {
        context_with(None, &AhiConfig::default())
    }

    pub fn row(k: u64, payload_len: usize) -> Tuple {
        let payload = vec![(k % 251) as u8; payload_len];
        Tuple::from_slices(&[&encode_u64(k), &payload])
    }

    pub fn key(k: u64) -> Tuple {
        Tuple::from_slices(&[&encode_u64(k)])
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::access::value::decode_u64;

    #[test]
    fn test_create_and_lookup() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        assert_eq!(tree.height()?, 1);
        assert!(tree.get(&key(1))?.is_none());
        tree.insert(&row(1, 10))?;
        tree.insert(&row(3, 10))?;
        let found = tree.get(&key(3))?.unwrap();
        assert_eq!(decode_u64(found.field(0).unwrap()), 3);
        assert!(tree.get(&key(2))?.is_none());
        assert!(matches!(
            tree.get(&Tuple::from_slices(&[b"a", b"b"])),
            Err(StorageError::InvalidTuple(_))
        ));
        Ok(())
    }

    #[test]
    fn test_autoinc_only_grows_unless_reset() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        assert_eq!(tree.read_autoinc()?, 0);
        tree.write_autoinc(10, false)?;
        tree.write_autoinc(5, false)?;
        assert_eq!(tree.read_autoinc()?, 10);
        tree.write_autoinc(5, true)?;
        assert_eq!(tree.read_autoinc()?, 5);
        Ok(())
    }

    #[test]
    fn test_autoinc_survives_root_raise() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        tree.write_autoinc(77, false)?;
        for k in 0..400 {
            tree.insert(&row(k, 100))?;
        }
        assert!(tree.height()? > 1);
        assert_eq!(tree.read_autoinc()?, 77);
        Ok(())
    }

    #[test]
    fn test_free_if_exists() -> StorageResult<()> {
        let ctx = context();
        let tree = BTree::create(ctx.clone(), IndexDef::clustered(9, "pk", 1, 2))?;
        for k in 0..300 {
            tree.insert(&row(k, 100))?;
        }
        let root = tree.root_page_id();
        assert!(ctx.space.n_used_pages() > 1);
        assert!(!BTree::free_if_exists(&ctx, root, 8)?);
        assert!(tree.drop_tree()?);
        assert_eq!(ctx.space.n_used_pages(), 0);
        assert!(!BTree::free_if_exists(&ctx, root, 9)?);
        Ok(())
    }

    #[test]
    fn test_open_checks_root() -> StorageResult<()> {
        let ctx = context();
        let tree = BTree::create(ctx.clone(), IndexDef::clustered(4, "pk", 1, 2))?;
        tree.insert(&row(1, 8))?;
        let def = IndexDef::clustered(4, "pk", 1, 2);
        let reopened = BTree::open(ctx.clone(), def, tree.root_page_id())?;
        assert!(reopened.get(&key(1))?.is_some());
        assert!(BTree::open(ctx, IndexDef::clustered(5, "pk", 1, 2), tree.root_page_id()).is_err());
        Ok(())
    }
}

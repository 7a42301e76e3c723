//! Bulk loading of an empty tree from sorted input.
//!
//! Records are appended to the rightmost page of the leaf level until it
//! reaches the fill factor. A full page is compressed once, a new right
//! sibling is linked after it and the finished page's node pointer is
//! appended to the level above the same way, so levels grow bottom-up as
//! pages fill. When the input ends the last page of every level is finished
//! and the single page left on the top level is copied into the root, which
//! keeps its page number. The whole load runs under the tree X lock.

use super::{BTree, TreeCounters};
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fsp::AllocDirection;
use crate::storage::mtr::{BlockId, Mtr};
use crate::storage::page::index_page::{page_free_space_of_empty, PAGE_INFIMUM};
use crate::storage::page::record::{cmp_tuple_rec, rec_converted_size, RecStatus};
use crate::storage::page::zip::page_zip_empty_size;
use crate::storage::page::{PageBuf, PageId};
use log::{debug, info, warn};
use std::cmp::Ordering;

/// Accepted fill factors, in percent of a page.
pub const BULK_FILL_PCT_RANGE: std::ops::RangeInclusive<usize> = 10..=100;

/// Outcome of [`BTree::bulk_load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkLoadStats {
    pub n_records: usize,
    /// Pages of the finished tree, root included
    pub n_pages: usize,
    pub height: usize,
}

/// Rightmost page of one level.
#[derive(Debug, Clone, Copy)]
struct LevelTail {
    page_id: PageId,
    n_pages: usize,
}

struct BulkBuilder<'a> {
    tree: &'a BTree,
    fill_pct: usize,
    levels: Vec<LevelTail>,
    /// Every page allocated so far with its level
    allocated: Vec<(PageId, usize)>,
    n_records: usize,
}

impl BTree {
    /// Fills an empty tree from `rows`, which must come in strictly
    /// ascending key order. Pages are filled to `fill_factor_pct` percent,
    /// leaving the rest for later inserts.
    ///
    /// On error every page allocated by the load is freed again and the
    /// tree is left empty.
    pub fn bulk_load<I>(&self, rows: I, fill_factor_pct: usize) -> StorageResult<BulkLoadStats>
    where
        I: IntoIterator<Item = Tuple>,
    {
        if !BULK_FILL_PCT_RANGE.contains(&fill_factor_pct) {
            return Err(StorageError::InvalidIndex(format!(
                "fill factor must be in {:?}, got {}",
                BULK_FILL_PCT_RANGE, fill_factor_pct
            )));
        }
        let mut lock_mtr = self.start_mtr();
        lock_mtr.x_lock_index(&self.lock);
        self.check_empty()?;

        let mut builder = BulkBuilder {
            tree: self,
            fill_pct: fill_factor_pct,
            levels: Vec::new(),
            allocated: Vec::new(),
            n_records: 0,
        };
        let result = builder.load(rows);
        if result.is_err() {
            builder.abandon();
        }
        lock_mtr.commit()?;
        let stats = result?;
        info!(
            "index {}: bulk loaded {} records into {} pages, height {}",
            self.index.name, stats.n_records, stats.n_pages, stats.height
        );
        Ok(stats)
    }

    fn check_empty(&self) -> StorageResult<()> {
        let mut mtr = self.start_mtr();
        let block = mtr.get_page(self.root, LatchKind::S)?;
        let root = mtr.page(block);
        let empty = root.is_leaf() && root.n_recs() == 0;
        mtr.commit()?;
        if !empty {
            return Err(StorageError::InvalidIndex(format!(
                "index {} is not empty, bulk load needs an empty tree",
                self.index.name
            )));
        }
        Ok(())
    }

    /// Bytes of records a page may take at `fill_pct` percent.
    fn fill_limit(&self, page: &PageBuf, fill_pct: usize) -> usize {
        let mut usable = page_free_space_of_empty();
        if let Some(zip) = page.zip() {
            let zip_usable = page_zip_empty_size(zip.capacity())
                * (100 - self.ctx.zip_pad_pct.min(100))
                / 100;
            usable = usable.min(zip_usable);
        }
        usable * fill_pct / 100
    }
}

impl BulkBuilder<'_> {
    fn load<I>(&mut self, rows: I) -> StorageResult<BulkLoadStats>
    where
        I: IntoIterator<Item = Tuple>,
    {
        for row in rows {
            self.tree.index.check_tuple(&row)?;
            self.append(0, &row)?;
            self.n_records += 1;
        }
        if self.levels.is_empty() {
            return Ok(BulkLoadStats {
                n_records: 0,
                n_pages: 1,
                height: 1,
            });
        }
        self.finish()
    }

    /// Appends `tuple` to the rightmost page of `level`, starting a new page
    /// when the current one is full.
    fn append(&mut self, level: usize, tuple: &Tuple) -> StorageResult<()> {
        if level == self.levels.len() {
            let page_id = self.first_page(level)?;
            self.levels.push(LevelTail { page_id, n_pages: 1 });
        }
        let tree = self.tree;
        let tail = self.levels[level].page_id;
        let mut mtr = tree.start_mtr();
        let block = mtr.get_page(tail, LatchKind::X)?;
        if level == 0 {
            self.check_order(mtr.page(block), tuple)?;
        }
        if self.try_append(&mut mtr, block, tuple)? {
            return mtr.commit().map(|_| ());
        }

        // link first: the finished page is compressed with its final links
        let new_block = self.alloc_after(&mut mtr, block, level)?;
        let node_ptrs = self.finish_page(&mut mtr, block)?;
        if !self.try_append(&mut mtr, new_block, tuple)? {
            return Err(StorageError::InvalidTuple(
                "record does not fit an empty page".into(),
            ));
        }
        let tail = &mut self.levels[level];
        tail.page_id = mtr.page_id(new_block);
        tail.n_pages += 1;
        mtr.commit()?;

        for node_ptr in &node_ptrs {
            self.append(level + 1, node_ptr)?;
        }
        Ok(())
    }

    /// Keys must ascend strictly; the previous record is the last one on
    /// the tail leaf, which is never empty once the load has started.
    fn check_order(&self, page: &PageBuf, tuple: &Tuple) -> StorageResult<()> {
        let last = match page.last_user_rec() {
            Some(last) => last,
            None => return Ok(()),
        };
        let key = tuple.prefix(self.tree.index.n_uniq);
        match cmp_tuple_rec(&key, page, last) {
            Ordering::Greater => Ok(()),
            Ordering::Equal => Err(StorageError::DuplicateKey),
            Ordering::Less => Err(StorageError::InvalidTuple(
                "bulk load input is not in ascending key order".into(),
            )),
        }
    }

    /// Appends after the last record unless that would pass the fill
    /// factor. A page always takes at least one record.
    fn try_append(&self, mtr: &mut Mtr, block: BlockId, tuple: &Tuple) -> StorageResult<bool> {
        let page = mtr.page_mut(block);
        let limit = self.tree.fill_limit(page, self.fill_pct);
        if page.n_recs() > 0 && page.data_size() + rec_converted_size(tuple) > limit {
            return Ok(false);
        }
        let status = if page.is_leaf() {
            RecStatus::Ordinary
        } else {
            RecStatus::NodePtr
        };
        let after = page.last_user_rec().unwrap_or(PAGE_INFIMUM);
        Ok(page.insert_rec_after(after, tuple, status)?.is_some())
    }

    fn first_page(&mut self, level: usize) -> StorageResult<PageId> {
        let tree = self.tree;
        let mut mtr = tree.start_mtr();
        let mut reservation = tree.ctx.space.reserve(1)?;
        let block =
            tree.page_alloc(&mut mtr, level, tree.root, AllocDirection::Up, &mut reservation)?;
        let page_id = mtr.page_id(block);
        self.note_alloc(page_id, level);
        mtr.commit()?;
        Ok(page_id)
    }

    /// Allocates a page and links it to the right of `block`.
    fn alloc_after(
        &mut self,
        mtr: &mut Mtr,
        block: BlockId,
        level: usize,
    ) -> StorageResult<BlockId> {
        let tree = self.tree;
        let hint = mtr.page_id(block);
        let mut reservation = tree.ctx.space.reserve(1)?;
        let new_block = tree.page_alloc(mtr, level, hint, AllocDirection::Up, &mut reservation)?;
        tree.link_new_page(mtr, block, new_block, true)?;
        self.note_alloc(mtr.page_id(new_block), level);
        Ok(new_block)
    }

    fn note_alloc(&mut self, page_id: PageId, level: usize) {
        self.allocated.push((page_id, level));
        TreeCounters::bump(&self.tree.counters.bulk_pages);
    }

    /// Compresses a filled page. A page that does not compress is split in
    /// two first. Returns the node pointers of the finished pages.
    fn finish_page(&mut self, mtr: &mut Mtr, block: BlockId) -> StorageResult<Vec<Tuple>> {
        let page = mtr.page_mut(block);
        let leftmost = page.prev().is_none();
        BTree::fix_min_rec(page, leftmost);
        let mut finished = vec![block];
        if !page.zip_compress() {
            let level = page.level();
            let recs = page.user_recs();
            if recs.len() < 2 {
                return Err(StorageError::corruption(
                    page.page_id(),
                    "single record does not compress",
                ));
            }
            debug!(
                "index {}: bulk page {} does not compress, splitting it",
                self.tree.index.name,
                page.page_id()
            );
            let right = self.alloc_after(mtr, block, level)?;
            let moved = &recs[recs.len() / 2..];
            self.tree.move_records(mtr, block, right, moved, None)?;
            self.levels[level].n_pages += 1;
            finished.push(right);
        }

        let tree = self.tree;
        let node_ptrs = finished
            .iter()
            .map(|&b| {
                let page = mtr.page(b);
                let first = page.first_user_rec().ok_or_else(|| {
                    StorageError::corruption(page.page_id(), "finished an empty bulk page")
                })?;
                let mut node_ptr = tree.node_ptr(page, first, page.page_id());
                node_ptr.set_min_rec(page.prev().is_none());
                Ok(node_ptr)
            })
            .collect::<StorageResult<Vec<_>>>()?;
        debug!(
            "index {}: bulk finished page {} at level {}",
            tree.index.name,
            mtr.page_id(block),
            mtr.page(block).level()
        );
        Ok(node_ptrs)
    }

    /// Finishes the last page of every level, bottom-up, and moves the top
    /// level into the root.
    fn finish(&mut self) -> StorageResult<BulkLoadStats> {
        let tree = self.tree;
        let mut level = 0;
        loop {
            let mut mtr = tree.start_mtr();
            let block = mtr.get_page(self.levels[level].page_id, LatchKind::X)?;
            let node_ptrs = self.finish_page(&mut mtr, block)?;
            mtr.commit()?;

            let top = level + 1 == self.levels.len();
            if top && self.levels[level].n_pages == 1 {
                break;
            }
            for node_ptr in &node_ptrs {
                self.append(level + 1, node_ptr)?;
            }
            level += 1;
        }
        let top = self.levels[level];
        self.copy_into_root(top.page_id)?;
        Ok(BulkLoadStats {
            n_records: self.n_records,
            n_pages: self.allocated.len() + 1,
            height: level + 1,
        })
    }

    /// Replaces the empty root with the only page of the top level and
    /// frees that page.
    fn copy_into_root(&mut self, top: PageId) -> StorageResult<()> {
        let tree = self.tree;
        let mut mtr = tree.start_mtr();
        let block = mtr.get_page(top, LatchKind::X)?;
        let snapshot = mtr.page(block).snapshot();
        tree.page_free(&mut mtr, block)?;
        mtr.commit()?;

        let mut mtr = tree.start_mtr();
        let root_block = mtr.get_page(tree.root, LatchKind::X)?;
        tree.ctx.ahi.drop_page_hash_index(mtr.page(root_block));
        let root = mtr.page_mut(root_block);
        root.page_empty(snapshot.level(), true);
        root.copy_recs_after(PAGE_INFIMUM, &snapshot, &snapshot.user_recs())?;
        BTree::fix_min_rec(root, true);
        if !root.zip_compress_with_reserve(0) {
            return Err(StorageError::corruption(
                tree.root,
                "top level of a bulk load does not compress into the root",
            ));
        }
        mtr.commit()?;
        self.allocated.retain(|&(page_id, _)| page_id != top);
        Ok(())
    }

    /// Frees the pages of a failed load.
    fn abandon(&mut self) {
        let tree = self.tree;
        for &(page_id, _) in self.allocated.iter().rev() {
            let mut mtr = tree.start_mtr();
            let freed = mtr.get_page(page_id, LatchKind::X).and_then(|block| {
                if tree.is_live_page(mtr.page(block)) {
                    tree.page_free(&mut mtr, block)?;
                }
                Ok(())
            });
            let committed = mtr.commit();
            if let Err(e) = freed.and(committed.map(|_| ())) {
                warn!(
                    "index {}: page {} of a failed bulk load not freed: {}",
                    tree.index.name, page_id, e
                );
            }
        }
        self.allocated.clear();
    }
}

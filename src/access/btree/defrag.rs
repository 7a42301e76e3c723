//! Leaf defragmentation.
//!
//! The leaf level is walked left to right in windows of adjacent pages.
//! When the records of a window fit in fewer pages than it has, each page
//! after the first moves as many records as fit into the page on its left:
//! a page that empties is merged away and freed, a page that keeps records
//! gets a new node pointer for its new first key. The node pointer changes
//! run as tree ops in the window's mini-transaction under the tree X lock.
//! No latch is held between windows; the next one starts by searching the
//! first key of the last page the previous window kept.

use super::latch::BtrLatchMode;
use super::smo::{TreeOp, TreeOps};
use super::{BTree, TreeCounters};
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mtr::{BlockId, Mtr};
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::index_page::{page_free_space_of_empty, PAGE_INFIMUM};
use crate::storage::page::zip::page_zip_empty_size;
use crate::storage::page::PageBuf;
use log::{debug, info};

/// Largest window accepted by [`BTree::defragment`].
pub const BTR_DEFRAG_MAX_N_PAGES: usize = 32;

/// Outcome of [`BTree::defragment`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefragStats {
    pub windows: usize,
    pub pages_freed: usize,
    pub records_moved: usize,
}

/// Number of leading records of `page` whose bytes fit in `limit`, and
/// their size.
fn recs_for_size(page: &PageBuf, limit: usize) -> (usize, usize) {
    let mut n = 0;
    let mut size = 0;
    for rec in page.user_recs() {
        let rec_size = page.rec_size(rec);
        if size + rec_size > limit {
            break;
        }
        size += rec_size;
        n += 1;
    }
    (n, size)
}

impl BTree {
    /// Packs every run of `n_pages` adjacent leaves into as few pages as
    /// their records need at the configured defragmentation fill.
    pub fn defragment(&self, n_pages: usize) -> StorageResult<DefragStats> {
        if !(2..=BTR_DEFRAG_MAX_N_PAGES).contains(&n_pages) {
            return Err(StorageError::InvalidIndex(format!(
                "defragmentation window must be 2..={} pages, got {}",
                BTR_DEFRAG_MAX_N_PAGES, n_pages
            )));
        }
        TreeCounters::bump(&self.counters.defrag_runs);
        let mut stats = DefragStats::default();
        let mut resume = None;
        while let Some(key) = self.defragment_window(resume.as_ref(), n_pages, &mut stats)? {
            resume = Some(key);
        }
        info!(
            "index {}: defragmented in {} windows, {} pages freed, {} records moved",
            self.index.name, stats.windows, stats.pages_freed, stats.records_moved
        );
        Ok(stats)
    }

    /// Defragments the window starting at the leaf holding `start`, or the
    /// leftmost leaf. Returns where the next window starts.
    fn defragment_window(
        &self,
        start: Option<&Tuple>,
        n_pages: usize,
        stats: &mut DefragStats,
    ) -> StorageResult<Option<Tuple>> {
        let mut mtr = self.start_mtr();
        let (key, mode) = match start {
            Some(key) => (key.clone(), PageCurMode::LE),
            None => (Tuple::default(), PageCurMode::GE),
        };
        let cursor =
            self.search_to_nth_level(&mut mtr, &key, 0, mode, BtrLatchMode::ModifyTree)?;
        let height = cursor.path.len() + 1;

        let mut blocks = vec![cursor.block];
        while blocks.len() < n_pages {
            let next = match mtr.page(blocks[blocks.len() - 1]).next() {
                Some(next) => next,
                None => break,
            };
            let block = mtr.get_page(next, LatchKind::X)?;
            self.check_index_page(mtr.page(block), Some(0))?;
            blocks.push(block);
        }
        let last = blocks[blocks.len() - 1];
        let end_of_index = mtr.page(last).next().is_none();
        if blocks.len() < 2 {
            mtr.commit()?;
            return Ok(None);
        }
        stats.windows += 1;

        let total_size: usize = blocks.iter().map(|&b| mtr.page(b).data_size()).sum();
        let total_recs: usize = blocks.iter().map(|&b| mtr.page(b).n_recs()).sum();
        let target_size = self.defrag_target_size(mtr.page(blocks[0]), total_size, total_recs);
        let n_needed = total_size.div_ceil(target_size.max(1));

        let mut kept = last;
        let mut ops = TreeOps::new();
        if n_needed < blocks.len() {
            let mut to = blocks[0];
            for &from in &blocks[1..] {
                to = self.defrag_merge(&mut mtr, from, to, target_size, &mut ops, stats)?;
            }
            kept = to;
        } else {
            debug!(
                "index {}: {} leaves starting at page {} are already packed",
                self.index.name,
                blocks.len(),
                mtr.page_id(blocks[0])
            );
        }

        let resume = mtr
            .page(kept)
            .first_user_rec()
            .map(|first| self.node_key(mtr.page(kept), first));
        if !ops.is_empty() {
            let mut reservation = self.reserve_for_delete(height)?;
            self.run_tree_ops(&mut mtr, &mut ops, &mut reservation)?;
        }
        mtr.commit()?;
        Ok(if end_of_index { None } else { resume })
    }

    /// Bytes a defragmented page should hold: an empty page less the space
    /// kept free for later inserts.
    fn defrag_target_size(&self, page: &PageBuf, total_size: usize, total_recs: usize) -> usize {
        let mut optimal = page_free_space_of_empty();
        if let Some(zip) = page.zip() {
            let zip_usable = page_zip_empty_size(zip.capacity())
                * (100 - self.ctx.zip_pad_pct.min(100))
                / 100;
            optimal = optimal.min(zip_usable);
        }
        let per_rec = total_size / total_recs.max(1);
        let reserved = (optimal * (100 - self.ctx.defrag_fill_pct) / 100)
            .min(per_rec * self.ctx.defrag_fill_n_recs);
        optimal - reserved
    }

    /// Moves the leading records of `from` into its left sibling `to`.
    /// Returns the page the next merge should fill.
    fn defrag_merge(
        &self,
        mtr: &mut Mtr,
        from: BlockId,
        to: BlockId,
        target_size: usize,
        ops: &mut TreeOps,
        stats: &mut DefragStats,
    ) -> StorageResult<BlockId> {
        let from_id = mtr.page_id(from);
        let n_recs = mtr.page(from).n_recs();
        let to_page = mtr.page(to);
        let room = target_size
            .saturating_sub(to_page.data_size())
            .min(to_page.max_insert_size_after_reorganize(n_recs));
        let (n_move, move_size) = recs_for_size(mtr.page(from), room);
        if n_move == 0 {
            return Ok(from);
        }

        if n_move == n_recs {
            return match self.merge_into_left(mtr, from, to, ops) {
                Ok(()) => {
                    stats.pages_freed += 1;
                    stats.records_moved += n_recs;
                    TreeCounters::bump(&self.counters.defrag_pages_freed);
                    Ok(to)
                }
                Err(StorageError::LayoutFailure) => Ok(from),
                Err(e) => Err(e),
            };
        }

        if mtr.page(to).max_insert_size(n_move) < move_size {
            self.reorganize(mtr, to)?;
        }
        self.ctx.ahi.drop_page_hash_index(mtr.page(from));
        let to_snapshot = mtr.page(to).snapshot();
        let from_snapshot = mtr.page(from).snapshot();
        let recs = from_snapshot.user_recs();
        let old_key = self.node_key(&from_snapshot, recs[0]);

        let moved = {
            let (from_page, to_page) = mtr.page_pair(from, to);
            let after = to_page.last_user_rec().unwrap_or(PAGE_INFIMUM);
            match to_page.copy_recs_after(after, from_page, &recs[..n_move]) {
                Ok(()) => true,
                Err(StorageError::LayoutFailure) => false,
                Err(e) => return Err(e),
            }
        };
        let moved = moved && {
            let (to_page, from_page) = mtr.pages_mut2(to, from);
            from_page.delete_rec_list_start(recs[n_move])?;
            to_page.zip_compress() && from_page.zip_compress()
        };
        if !moved {
            let (to_page, from_page) = mtr.pages_mut2(to, from);
            to_page.zip_copy_from(&to_snapshot);
            from_page.zip_copy_from(&from_snapshot);
            debug!(
                "index {}: records of page {} do not fit its left sibling",
                self.index.name, from_id
            );
            return Ok(from);
        }
        stats.records_moved += n_move;

        let from_page = mtr.page(from);
        let first = from_page
            .first_user_rec()
            .ok_or_else(|| StorageError::corruption(from_id, "defragmented page emptied"))?;
        let node_ptr = self.node_ptr(from_page, first, from_id);
        ops.push(TreeOp::DeleteNodePtr {
            level: 1,
            key: old_key,
            child: from_id,
        })?;
        ops.push(TreeOp::InsertNodePtr {
            level: 1,
            tuple: node_ptr,
        })?;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::super::key::IndexDef;
    use super::super::test_util::*;
    use super::super::IndexContext;
    use super::*;
    use crate::access::ahi::AdaptiveHashIndex;
    use crate::access::value::decode_u64;
    use crate::config::EngineConfig;
    use crate::storage::fsp::FileSpace;
    use crate::storage::wal::RedoLog;
    use crate::storage::BufferPool;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::sync::Arc;

    /// A context that never merges on delete, so deletes leave sparse leaves.
    fn no_merge_context() -> IndexContext {
        let config = EngineConfig {
            merge_threshold_pct: 1,
            ..Default::default()
        };
        IndexContext::new(
            BufferPool::in_memory(),
            Arc::new(RedoLog::in_memory()),
            Arc::new(FileSpace::new(1, None)),
            Arc::new(AdaptiveHashIndex::new(&config.ahi)),
            &config,
        )
    }

    fn sparse_tree(index: IndexDef, n: u64) -> StorageResult<BTree> {
        let tree = BTree::create(no_merge_context(), index)?;
        let mut keys: Vec<u64> = (0..n).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(17));
        for &k in &keys {
            tree.insert(&row(k, 100))?;
        }
        for k in (0..n).filter(|k| k % 3 != 0) {
            assert!(tree.delete(&key(k))?);
        }
        Ok(tree)
    }

    fn scan_keys(tree: &BTree) -> StorageResult<Vec<u64>> {
        tree.scan()
            .map(|r| r.map(|t| decode_u64(t.field(0).unwrap())))
            .collect()
    }

    #[test]
    fn test_defragment_packs_sparse_leaves() -> StorageResult<()> {
        let tree = sparse_tree(IndexDef::clustered(1, "pk", 1, 2), 6000)?;
        let before = tree.validate()?;
        let used_before = tree.context().space.n_used_pages();

        let stats = tree.defragment(8)?;
        let after = tree.validate()?;
        assert_eq!(after.n_records, before.n_records);
        assert!(stats.pages_freed > 0);
        assert!(after.n_leaf_pages * 2 <= before.n_leaf_pages, "{:?} {:?}", before, after);
        assert!(after.leaf_fill_pct() >= 60, "fill {}", after.leaf_fill_pct());
        assert!(after.height <= before.height);
        assert_eq!(
            tree.context().space.n_used_pages(),
            used_before - (before.n_pages - after.n_pages)
        );
        assert_eq!(
            scan_keys(&tree)?,
            (0..6000).filter(|k| k % 3 == 0).collect::<Vec<_>>()
        );
        for k in (0..6000).step_by(3) {
            assert!(tree.get(&key(k))?.is_some(), "key {}", k);
        }
        // the tree keeps working afterwards
        tree.insert(&row(1, 100))?;
        assert!(tree.delete(&key(3))?);
        tree.validate()?;
        Ok(())
    }

    #[test]
    fn test_defragment_keeps_hash_index_valid() -> StorageResult<()> {
        let tree = sparse_tree(IndexDef::clustered(1, "pk", 1, 2), 3000)?;
        for _ in 0..5 {
            for k in (0..3000).step_by(3) {
                tree.get(&key(k))?;
            }
        }
        tree.defragment(4)?;
        tree.context().ahi.validate(&tree.context().pool)?;
        for k in (0..3000).step_by(3) {
            assert!(tree.get(&key(k))?.is_some(), "key {}", k);
        }
        Ok(())
    }

    #[test]
    fn test_compressed_leaves_defragment() -> StorageResult<()> {
        let tree = sparse_tree(IndexDef::clustered(1, "pk", 1, 2).with_zip(8192), 3000)?;
        let before = tree.validate()?;
        tree.defragment(6)?;
        let after = tree.validate()?;
        assert_eq!(after.n_records, 1000);
        assert!(after.n_leaf_pages < before.n_leaf_pages);
        Ok(())
    }

    #[test]
    fn test_packed_and_tiny_trees_are_left_alone() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        tree.bulk_load((0..3000).map(|k| row(k, 100)), 100)?;
        let before = tree.validate()?;
        let stats = tree.defragment(8)?;
        assert_eq!(stats.pages_freed, 0);
        assert_eq!(tree.validate()?, before);

        let single = BTree::create(context(), IndexDef::clustered(2, "pk", 1, 2))?;
        single.insert(&row(1, 10))?;
        assert_eq!(single.defragment(2)?, DefragStats::default());

        assert!(single.defragment(1).is_err());
        assert!(single.defragment(BTR_DEFRAG_MAX_N_PAGES + 1).is_err());
        Ok(())
    }
}

//! Structure modification operations.
//!
//! A pessimistic insert or delete changes one page and then queues the
//! consequences for the levels above on a [`TreeOps`] stack: node pointers
//! to insert or remove, pages to merge or discard. Ops run last-in first-out
//! inside the same mini-transaction under the tree X lock, so each one may
//! queue further work for the level above it. When the stack is empty a
//! root left with a single child is collapsed.

use super::latch::BtrLatchMode;
use super::{BTree, TreeCounters, BTR_MAX_LEVELS};
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fsp::Reservation;
use crate::storage::mtr::{BlockId, Mtr};
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::index_page::PAGE_INFIMUM;
use crate::storage::page::zip::page_zip_empty_size;
use crate::storage::page::{PageBuf, PageId};
use log::{debug, info, warn};

/// Upper bound on ops queued or run by one operation.
pub const BTR_MAX_TREE_OPS: usize = BTR_MAX_LEVELS * 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeOp {
    /// Insert a node pointer on `level`.
    InsertNodePtr { level: usize, tuple: Tuple },
    /// Remove the node pointer to `child` found by searching `key` on `level`.
    DeleteNodePtr {
        level: usize,
        key: Tuple,
        child: PageId,
    },
    /// Merge the page with a sibling if it is underfull.
    CompressIfUseful { page: PageId },
    /// Free the page and remove its node pointer.
    Discard { page: PageId },
}

/// Pending structure changes of one operation.
#[derive(Debug, Default)]
pub struct TreeOps {
    stack: Vec<TreeOp>,
    processed: usize,
}

impl TreeOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: TreeOp) -> StorageResult<()> {
        if self.stack.len() >= BTR_MAX_TREE_OPS {
            return Err(StorageError::tree_corruption(format!(
                "more than {} pending tree operations",
                BTR_MAX_TREE_OPS
            )));
        }
        self.stack.push(op);
        Ok(())
    }

    fn pop(&mut self) -> StorageResult<Option<TreeOp>> {
        let op = self.stack.pop();
        if op.is_some() {
            self.processed += 1;
            if self.processed > BTR_MAX_TREE_OPS {
                return Err(StorageError::tree_corruption(format!(
                    "structure change did not settle after {} operations",
                    BTR_MAX_TREE_OPS
                )));
            }
        }
        Ok(op)
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }
}

/// Whether `src` can be merged into `dst`.
fn can_merge(dst: &PageBuf, src: &PageBuf, zip_pad_pct: usize) -> bool {
    if dst.max_insert_size_after_reorganize(src.n_recs()) < src.data_size() {
        return false;
    }
    match dst.zip() {
        Some(zip) => {
            let usable = page_zip_empty_size(zip.capacity()) * (100 - zip_pad_pct.min(100)) / 100;
            dst.data_size() + src.data_size() <= usable
        }
        None => true,
    }
}

impl BTree {
    /// Runs every queued op, then collapses a root with a single child.
    pub(crate) fn run_tree_ops(
        &self,
        mtr: &mut Mtr,
        ops: &mut TreeOps,
        reservation: &mut Reservation,
    ) -> StorageResult<()> {
        while let Some(op) = ops.pop()? {
            debug!("index {}: {:?}", self.index.name, op);
            match op {
                TreeOp::InsertNodePtr { level, tuple } => {
                    self.insert_node_ptr(mtr, level, &tuple, reservation, ops)?
                }
                TreeOp::DeleteNodePtr { level, key, child } => {
                    self.delete_node_ptr(mtr, level, &key, child, ops)?
                }
                TreeOp::CompressIfUseful { page } => self.compress_if_useful(mtr, page, ops)?,
                TreeOp::Discard { page } => self.discard_page(mtr, page, ops)?,
            }
        }
        self.collapse_root(mtr)
    }

    /// X-latches a page queued by an earlier op if it still belongs to
    /// the index.
    fn latch_queued(&self, mtr: &mut Mtr, page_id: PageId) -> StorageResult<Option<BlockId>> {
        let block = mtr.get_page(page_id, LatchKind::X)?;
        Ok(self.is_live_page(mtr.page(block)).then_some(block))
    }

    /// Deletes a record and recompresses; reorganizes when the page does not
    /// compress as it is.
    pub(crate) fn delete_and_recompress(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        rec: usize,
    ) -> StorageResult<()> {
        let page = mtr.page_mut(block);
        if page.is_leaf() {
            self.ctx.ahi.update_on_delete(page, rec);
        }
        page.delete_rec(rec)?;
        if page.zip_compress_with_reserve(0) {
            return Ok(());
        }
        match self.reorganize(mtr, block) {
            Ok(()) => Ok(()),
            Err(StorageError::LayoutFailure) => Err(StorageError::corruption(
                mtr.page_id(block),
                "page does not recompress after a delete",
            )),
            Err(e) => Err(e),
        }
    }

    /// Removes a node pointer. A page left without records is discarded
    /// instead, and removing the first record of a page updates the pointer
    /// to it one level up.
    pub(crate) fn delete_node_ptr(
        &self,
        mtr: &mut Mtr,
        level: usize,
        key: &Tuple,
        child: PageId,
        ops: &mut TreeOps,
    ) -> StorageResult<()> {
        let cursor = self.search_to_nth_level(
            mtr,
            key,
            level,
            PageCurMode::LE,
            BtrLatchMode::ContModifyTree,
        )?;
        let page = mtr.page(cursor.block);
        let rec = if page.rec_is_user(cursor.rec) {
            cursor.rec
        } else {
            page.first_user_rec().unwrap_or(cursor.rec)
        };
        if !page.rec_is_user(rec) || page.rec_child(rec) != Some(child) {
            return Err(StorageError::corruption(
                cursor.page_id,
                format!("node pointer to page {} not found at level {}", child, level),
            ));
        }
        let page_id = cursor.page_id;
        let is_root = page_id == self.root;

        if page.n_recs() == 1 {
            if is_root {
                return Err(StorageError::corruption(
                    page_id,
                    "last node pointer of the root removed",
                ));
            }
            return ops.push(TreeOp::Discard { page: page_id });
        }

        let was_first = page.first_user_rec() == Some(rec);
        let leftmost = page.prev().is_none();
        let old_key = self.node_key(page, rec);
        self.delete_and_recompress(mtr, cursor.block, rec)?;

        if !is_root {
            ops.push(TreeOp::CompressIfUseful { page: page_id })?;
        }
        if was_first {
            let page = mtr.page_mut(cursor.block);
            if leftmost {
                if BTree::fix_min_rec(page, true) {
                    page.zip_refresh()?;
                }
            } else if !is_root {
                let first = page
                    .first_user_rec()
                    .ok_or_else(|| StorageError::corruption(page_id, "page emptied"))?;
                let node_ptr = self.node_ptr(page, first, page_id);
                ops.push(TreeOp::DeleteNodePtr {
                    level: level + 1,
                    key: old_key,
                    child: page_id,
                })?;
                ops.push(TreeOp::InsertNodePtr {
                    level: level + 1,
                    tuple: node_ptr,
                })?;
            }
        }
        Ok(())
    }

    /// Merges an underfull page into a sibling under the same father.
    pub(crate) fn compress_if_useful(
        &self,
        mtr: &mut Mtr,
        page_id: PageId,
        ops: &mut TreeOps,
    ) -> StorageResult<()> {
        if page_id == self.root {
            return Ok(());
        }
        let block = match self.latch_queued(mtr, page_id)? {
            Some(block) => block,
            None => return Ok(()),
        };
        let page = mtr.page(block);
        if page.n_recs() == 0 {
            return ops.push(TreeOp::Discard { page: page_id });
        }
        if page.data_size() >= self.compress_limit() || !page.has_siblings() {
            return Ok(());
        }
        match self.compress(mtr, block, ops) {
            Err(StorageError::LayoutFailure) => {
                debug!(
                    "index {}: merge of page {} did not fit",
                    self.index.name, page_id
                );
                Ok(())
            }
            other => other,
        }
    }

    fn compress(&self, mtr: &mut Mtr, block: BlockId, ops: &mut TreeOps) -> StorageResult<()> {
        let father = self.get_father(mtr, block)?;
        let father_page = mtr.page(father.block);
        let left_shares = father_page.first_user_rec() != Some(father.rec);
        let right_shares = father_page.next_user_rec(father.rec).is_some();

        let page = mtr.page(block);
        let left = page.prev().filter(|_| left_shares);
        let right = page.next().filter(|_| right_shares);

        if let Some(left) = left {
            let left_block = mtr.get_page(left, LatchKind::X)?;
            if can_merge(mtr.page(left_block), mtr.page(block), self.ctx.zip_pad_pct) {
                return self.merge_into_left(mtr, block, left_block, ops);
            }
        }
        if let Some(right) = right {
            let right_block = mtr.get_page(right, LatchKind::X)?;
            if can_merge(mtr.page(right_block), mtr.page(block), self.ctx.zip_pad_pct) {
                return self.merge_into_right(
                    mtr,
                    block,
                    right_block,
                    father.block,
                    father.rec,
                    ops,
                );
            }
        }
        Ok(())
    }

    /// Copies `recs` of `src` into `dst` after `after`, reorganizing `dst`
    /// first if its garbage is in the way. `dst` is restored on failure.
    fn merge_copy(
        &self,
        mtr: &mut Mtr,
        src: BlockId,
        dst: BlockId,
        at_end: bool,
    ) -> StorageResult<()> {
        let needed = mtr.page(src).data_size();
        let n_add = mtr.page(src).n_recs();
        if mtr.page(dst).max_insert_size(n_add) < needed {
            self.reorganize(mtr, dst)?;
        }
        let snapshot = mtr.page(dst).snapshot();
        let (src_page, dst_page) = mtr.page_pair(src, dst);
        let recs = src_page.user_recs();
        let after = if at_end {
            dst_page.last_user_rec().unwrap_or(PAGE_INFIMUM)
        } else {
            PAGE_INFIMUM
        };
        let copied = match dst_page.copy_recs_after(after, src_page, &recs) {
            Ok(()) => {
                let leftmost = if at_end {
                    dst_page.prev().is_none()
                } else {
                    src_page.prev().is_none()
                };
                BTree::fix_min_rec(dst_page, leftmost);
                dst_page.zip_compress()
            }
            Err(StorageError::LayoutFailure) => false,
            Err(e) => return Err(e),
        };
        if !copied {
            dst_page.zip_copy_from(&snapshot);
            return Err(StorageError::LayoutFailure);
        }
        Ok(())
    }

    pub(crate) fn merge_into_left(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        left_block: BlockId,
        ops: &mut TreeOps,
    ) -> StorageResult<()> {
        let page_id = mtr.page_id(block);
        let left_id = mtr.page_id(left_block);
        let page = mtr.page(block);
        let level = page.level();
        let next = page.next();
        let first = page
            .first_user_rec()
            .ok_or_else(|| StorageError::corruption(page_id, "merge of an empty page"))?;
        let key = self.node_key(page, first);

        self.merge_copy(mtr, block, left_block, true)?;

        mtr.page_mut(left_block).set_next(next);
        if let Some(next) = next {
            let next_block = mtr.get_page(next, LatchKind::X)?;
            mtr.page_mut(next_block).set_prev(Some(left_id));
        }
        self.page_free(mtr, block)?;
        TreeCounters::bump(&self.counters.merges);
        debug!(
            "index {}: merged page {} into left sibling {}",
            self.index.name, page_id, left_id
        );
        ops.push(TreeOp::DeleteNodePtr {
            level: level + 1,
            key,
            child: page_id,
        })
    }

    fn merge_into_right(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        right_block: BlockId,
        father_block: BlockId,
        father_rec: usize,
        ops: &mut TreeOps,
    ) -> StorageResult<()> {
        let page_id = mtr.page_id(block);
        let right_id = mtr.page_id(right_block);
        let page = mtr.page(block);
        let level = page.level();
        let prev = page.prev();
        let right_page = mtr.page(right_block);
        let right_first = right_page
            .first_user_rec()
            .ok_or_else(|| StorageError::corruption(right_id, "empty right sibling"))?;
        let right_key = self.node_key(right_page, right_first);

        self.merge_copy(mtr, block, right_block, false)?;

        let father_page = mtr.page_mut(father_block);
        father_page.rec_set_child(father_rec, right_id);
        father_page.zip_refresh()?;

        mtr.page_mut(right_block).set_prev(prev);
        if let Some(prev) = prev {
            let prev_block = mtr.get_page(prev, LatchKind::X)?;
            mtr.page_mut(prev_block).set_next(Some(right_id));
        }
        self.page_free(mtr, block)?;
        TreeCounters::bump(&self.counters.merges);
        debug!(
            "index {}: merged page {} into right sibling {}",
            self.index.name, page_id, right_id
        );
        ops.push(TreeOp::DeleteNodePtr {
            level: level + 1,
            key: right_key,
            child: right_id,
        })
    }

    /// Frees a page and queues the removal of its node pointer.
    pub(crate) fn discard_page(
        &self,
        mtr: &mut Mtr,
        page_id: PageId,
        ops: &mut TreeOps,
    ) -> StorageResult<()> {
        if page_id == self.root {
            return Ok(());
        }
        let block = match self.latch_queued(mtr, page_id)? {
            Some(block) => block,
            None => return Ok(()),
        };
        let page = mtr.page(block);
        let level = page.level();
        let prev = page.prev();
        let next = page.next();
        if prev.is_none() && next.is_none() {
            return self.discard_only_page_on_level(mtr, block);
        }
        let first = page
            .first_user_rec()
            .ok_or_else(|| StorageError::corruption(page_id, "discard of an empty page"))?;
        let key = self.node_key(page, first);

        if let Some(prev) = prev {
            let prev_block = mtr.get_page(prev, LatchKind::X)?;
            mtr.page_mut(prev_block).set_next(next);
        }
        if let Some(next) = next {
            let next_block = mtr.get_page(next, LatchKind::X)?;
            let next_page = mtr.page_mut(next_block);
            next_page.set_prev(prev);
            if prev.is_none() && BTree::fix_min_rec(next_page, true) {
                next_page.zip_refresh()?;
            }
        }
        self.page_free(mtr, block)?;
        TreeCounters::bump(&self.counters.discards);
        debug!("index {}: discarded page {}", self.index.name, page_id);
        ops.push(TreeOp::DeleteNodePtr {
            level: level + 1,
            key,
            child: page_id,
        })
    }

    /// Frees a page that is alone on its level together with its ancestors
    /// below the root, which is left as an empty leaf.
    fn discard_only_page_on_level(&self, mtr: &mut Mtr, block: BlockId) -> StorageResult<()> {
        let mut block = block;
        while mtr.page_id(block) != self.root {
            let father = self.get_father(mtr, block)?;
            let father_page = mtr.page(father.block);
            if father_page.n_recs() != 1 || father_page.has_siblings() {
                return Err(StorageError::corruption(
                    father.page_id,
                    "father of a page alone on its level has other children",
                ));
            }
            self.page_free(mtr, block)?;
            TreeCounters::bump(&self.counters.discards);
            block = father.block;
        }
        let root = mtr.page_mut(block);
        root.page_empty(0, true);
        root.zip_refresh()?;
        info!("index {}: tree emptied, root is a leaf again", self.index.name);
        Ok(())
    }

    /// Lifts the only child of the root into the root while there is one.
    fn collapse_root(&self, mtr: &mut Mtr) -> StorageResult<()> {
        loop {
            let root_block = mtr.get_page(self.root, LatchKind::X)?;
            let root = mtr.page(root_block);
            if root.is_leaf() || root.n_recs() != 1 {
                return Ok(());
            }
            let root_level = root.level();
            let child = root
                .first_user_rec()
                .and_then(|rec| root.rec_child(rec))
                .ok_or_else(|| StorageError::corruption(self.root, "node pointer without child"))?;
            let child_block = mtr.get_page(child, LatchKind::X)?;
            self.check_index_page(mtr.page(child_block), Some(root_level - 1))?;
            if mtr.page(child_block).has_siblings() {
                return Err(StorageError::corruption(
                    child,
                    "only child of the root has siblings",
                ));
            }
            match self.lift_page_up(mtr, root_block, child_block) {
                Ok(()) => {}
                Err(StorageError::LayoutFailure) => {
                    warn!(
                        "index {}: page {} does not fit the root, tree left one level higher",
                        self.index.name, child
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replaces the root's content with that of its only child.
    fn lift_page_up(
        &self,
        mtr: &mut Mtr,
        root_block: BlockId,
        child_block: BlockId,
    ) -> StorageResult<()> {
        let child_id = mtr.page_id(child_block);
        let (child, root) = mtr.page_pair(child_block, root_block);
        let level = child.level();
        let snapshot = root.snapshot();
        root.page_empty(level, true);
        let lifted = match root.copy_recs_after(PAGE_INFIMUM, child, &child.user_recs()) {
            Ok(()) => {
                BTree::fix_min_rec(root, true);
                root.zip_compress()
            }
            Err(StorageError::LayoutFailure) => false,
            Err(e) => return Err(e),
        };
        if !lifted {
            root.zip_copy_from(&snapshot);
            return Err(StorageError::LayoutFailure);
        }
        self.page_free(mtr, child_block)?;
        TreeCounters::bump(&self.counters.lifts);
        info!(
            "index {}: lifted page {} into the root, height now {}",
            self.index.name,
            child_id,
            level + 1
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::btree::key::IndexDef;
    use crate::access::btree::test_util::*;
    use crate::storage::page::record::RecStatus;
    use crate::storage::page::PageType;

    #[test]
    fn test_ops_run_last_in_first_out() -> StorageResult<()> {
        let mut ops = TreeOps::new();
        ops.push(TreeOp::Discard { page: PageId(1) })?;
        ops.push(TreeOp::CompressIfUseful { page: PageId(2) })?;
        assert_eq!(ops.len(), 2);
        assert_eq!(ops.pop()?, Some(TreeOp::CompressIfUseful { page: PageId(2) }));
        assert_eq!(ops.pop()?, Some(TreeOp::Discard { page: PageId(1) }));
        assert_eq!(ops.pop()?, None);
        assert!(ops.is_empty());
        Ok(())
    }

    #[test]
    fn test_op_stack_is_bounded() {
        let mut ops = TreeOps::new();
        for i in 0..BTR_MAX_TREE_OPS {
            ops.push(TreeOp::Discard { page: PageId(i as u32) }).unwrap();
        }
        assert!(ops.push(TreeOp::Discard { page: PageId(0) }).is_err());
    }

    #[test]
    fn test_can_merge_respects_zip_padding() {
        let mut dst = PageBuf::new_temp(PageId(1));
        dst.page_create(0, 1, PageType::Index);
        let mut src = PageBuf::new_temp(PageId(2));
        src.page_create(0, 1, PageType::Index);
        let mut cur = PAGE_INFIMUM;
        for k in 0..20u64 {
            cur = src
                .insert_rec_after(cur, &row(k, 200), RecStatus::Ordinary)
                .unwrap()
                .unwrap();
        }
        assert!(can_merge(&dst, &src, 15));
        dst.attach_zip(4096);
        // 20 records of ~220 bytes exceed 85% of a 4K compressed page
        assert!(!can_merge(&dst, &src, 15));
    }

    #[test]
    fn test_delete_everything_collapses_tree() -> StorageResult<()> {
        let ctx = context();
        let tree = BTree::create(ctx.clone(), IndexDef::clustered(3, "pk", 1, 2))?;
        for k in 0..3000 {
            tree.insert(&row(k, 100))?;
        }
        assert!(tree.height()? >= 2);
        for k in 0..3000 {
            assert!(tree.delete(&key(k))?, "key {}", k);
        }
        assert_eq!(tree.height()?, 1);
        let stats = tree.validate()?;
        assert_eq!(stats.n_records, 0);
        assert_eq!(ctx.space.n_used_pages(), 1);
        Ok(())
    }
}

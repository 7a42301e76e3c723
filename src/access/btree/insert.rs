//! Record insertion: the optimistic leaf insert, page splits and root raises.

use super::cursor::BtrCursor;
use super::latch::BtrLatchMode;
use super::smo::{TreeOp, TreeOps};
use super::{BTree, TreeCounters};
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fsp::{AllocDirection, Reservation};
use crate::storage::mtr::{BlockId, Mtr};
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::index_page::PAGE_INFIMUM;
use crate::storage::page::record::{rec_converted_size, RecStatus};
use crate::storage::page::PageBuf;
use log::{debug, info};

/// Splits attempted for one insert before giving up.
pub const BTR_SPLIT_MAX_ITERATIONS: usize = 8;

/// Pages produced by one split.
#[derive(Debug, Clone, Copy)]
struct SplitOutcome {
    /// The page that needs a new node pointer in the father.
    ptr_block: BlockId,
    /// The page the tuple belongs on now.
    t_block: BlockId,
}

/// Where the page is cut. `s` counts items (records plus the tuple) that
/// stay on the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SplitPlan {
    s: usize,
    direction: AllocDirection,
}

/// Picks a split point for inserting at item position `t_pos` of a page
/// with `n` records.
///
/// Sequential inserts leave the full page behind: ascending ones keep all
/// but one record to the right of the insert point on the old page,
/// descending ones move the part before the insert point to a new left page.
fn plan_split(
    n: usize,
    t_pos: usize,
    after_last_insert: bool,
    before_last_insert: bool,
) -> SplitPlan {
    let clamp = |s: usize| s.clamp(1, n);
    if after_last_insert {
        let s = if t_pos + 1 < n { t_pos + 2 } else { t_pos };
        return SplitPlan {
            s: clamp(s),
            direction: AllocDirection::Up,
        };
    }
    if before_last_insert {
        let s = if t_pos <= 1 { t_pos + 1 } else { t_pos - 1 };
        return SplitPlan {
            s: clamp(s),
            direction: AllocDirection::Down,
        };
    }
    let idx = (n + 2) / 2 - 1;
    let s = if t_pos <= idx { idx + 1 } else { idx };
    SplitPlan {
        s: clamp(s),
        direction: AllocDirection::Up,
    }
}

/// Cuts `sizes` (bytes of every item in order) where both halves weigh
/// about the same. Always leaves at least one item on each side.
fn plan_balanced_split(sizes: &[usize]) -> usize {
    let n = sizes.len();
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if 2 * acc >= total {
            let s = if 2 * acc - total > *size { i } else { i + 1 };
            return s.clamp(1, n - 1);
        }
    }
    n - 1
}

impl BTree {
    /// Inserts a record. Fails with `DuplicateKey` if its unique prefix
    /// is already present.
    pub fn insert(&self, tuple: &Tuple) -> StorageResult<()> {
        self.index.check_tuple(tuple)?;
        if self.insert_optimistic(tuple)? {
            TreeCounters::bump(&self.counters.optimistic_inserts);
            return Ok(());
        }
        self.insert_pessimistic(tuple)?;
        TreeCounters::bump(&self.counters.pessimistic_inserts);
        Ok(())
    }

    fn check_duplicate(&self, mtr: &Mtr, cursor: &BtrCursor) -> StorageResult<()> {
        let page = mtr.page(cursor.block);
        if page.rec_is_user(cursor.rec) && cursor.low_match.fields >= self.index.n_uniq {
            return Err(StorageError::DuplicateKey);
        }
        Ok(())
    }

    /// Inserts into the leaf without changing the tree structure.
    fn insert_optimistic(&self, tuple: &Tuple) -> StorageResult<bool> {
        let mut mtr = self.start_mtr();
        let mode = BtrLatchMode::ModifyLeaf;
        let cursor = self.search_to_nth_level(&mut mtr, tuple, 0, PageCurMode::LE, mode)?;
        self.check_duplicate(&mtr, &cursor)?;
        let inserted = self.insert_if_possible(&mut mtr, cursor.block, cursor.rec, tuple)?;
        mtr.commit()?;
        Ok(inserted.is_some())
    }

    fn insert_pessimistic(&self, tuple: &Tuple) -> StorageResult<()> {
        let mut mtr = self.start_mtr();
        let mode = BtrLatchMode::ModifyTree;
        let cursor = self.search_to_nth_level(&mut mtr, tuple, 0, PageCurMode::LE, mode)?;
        self.check_duplicate(&mtr, &cursor)?;
        let height = cursor.path.len() + 1;
        let mut reservation = self.ctx.space.reserve(self.reserve_for(height))?;

        // the page may have changed since the optimistic attempt
        if self
            .insert_if_possible(&mut mtr, cursor.block, cursor.rec, tuple)?
            .is_none()
        {
            let mut ops = TreeOps::new();
            self.page_split_and_insert(&mut mtr, cursor.block, tuple, &mut reservation, &mut ops)?;
            self.run_tree_ops(&mut mtr, &mut ops, &mut reservation)?;
        }
        mtr.commit()?;
        Ok(())
    }

    /// Inserts `tuple` after `cur`, reorganizing the page if that makes room.
    /// Returns `None` when the record does not fit; the page is then
    /// logically unchanged.
    pub(crate) fn insert_if_possible(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        cur: usize,
        tuple: &Tuple,
    ) -> StorageResult<Option<usize>> {
        let page = mtr.page_mut(block);
        let status = if page.is_leaf() {
            RecStatus::Ordinary
        } else {
            RecStatus::NodePtr
        };
        let rec = match page.insert_rec_after(cur, tuple, status)? {
            Some(rec) => rec,
            None => {
                if page.max_insert_size_after_reorganize(1) < rec_converted_size(tuple) {
                    return Ok(None);
                }
                match self.reorganize(mtr, block) {
                    Ok(()) => {}
                    Err(StorageError::LayoutFailure) => return Ok(None),
                    Err(e) => return Err(e),
                }
                let page = mtr.page_mut(block);
                let cur = page.search_with_match(tuple, PageCurMode::LE).rec;
                match page.insert_rec_after(cur, tuple, status)? {
                    Some(rec) => rec,
                    None => return Ok(None),
                }
            }
        };
        let page = mtr.page_mut(block);
        if !page.zip_compress() {
            page.zip_restore()?;
            return Ok(None);
        }
        if page.is_leaf() {
            self.ctx.ahi.update_on_insert(page, rec);
        }
        Ok(Some(rec))
    }

    /// Makes room for `tuple` on the page in `block` by splitting it, then
    /// inserts. Node pointers for the new pages are queued on `ops`.
    pub(crate) fn page_split_and_insert(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        tuple: &Tuple,
        reservation: &mut Reservation,
        ops: &mut TreeOps,
    ) -> StorageResult<()> {
        let mut block = block;
        if mtr.page_id(block) == self.root {
            block = self.root_raise(mtr, block, reservation)?;
        }
        let level = mtr.page(block).level();
        if level == 0 && self.insert_into_right_sibling(mtr, block, tuple, ops)? {
            return Ok(());
        }

        let mut ptr_blocks: Vec<BlockId> = Vec::new();
        for iteration in 0..BTR_SPLIT_MAX_ITERATIONS {
            let split = self.split_page(mtr, block, tuple, iteration > 0, reservation)?;
            TreeCounters::bump(&self.counters.splits);
            if !ptr_blocks.contains(&split.ptr_block) {
                ptr_blocks.push(split.ptr_block);
            }

            let cur = mtr
                .page(split.t_block)
                .search_with_match(tuple, PageCurMode::LE)
                .rec;
            if self
                .insert_if_possible(mtr, split.t_block, cur, tuple)?
                .is_some()
            {
                let page = mtr.page_mut(split.t_block);
                let leftmost = page.prev().is_none();
                if BTree::fix_min_rec(page, leftmost) {
                    page.zip_refresh()?;
                }
                for ptr_block in ptr_blocks {
                    let page = mtr.page(ptr_block);
                    let first = page.first_user_rec().ok_or_else(|| {
                        StorageError::corruption(page.page_id(), "split left an empty page")
                    })?;
                    ops.push(TreeOp::InsertNodePtr {
                        level: level + 1,
                        tuple: self.node_ptr(page, first, page.page_id()),
                    })?;
                }
                return Ok(());
            }
            debug!(
                "index {}: record does not fit page {} after split, splitting again",
                self.index.name,
                mtr.page_id(split.t_block)
            );
            block = split.t_block;
        }
        Err(StorageError::corruption(
            mtr.page_id(block),
            format!(
                "record still does not fit after {} splits",
                BTR_SPLIT_MAX_ITERATIONS
            ),
        ))
    }

    /// Splits one page. The tuple itself is not inserted.
    fn split_page(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        tuple: &Tuple,
        retry: bool,
        reservation: &mut Reservation,
    ) -> StorageResult<SplitOutcome> {
        let page = mtr.page(block);
        let page_id = page.page_id();
        let level = page.level();
        let recs = page.user_recs();
        let n = recs.len();
        if n == 0 {
            return Err(StorageError::corruption(page_id, "split of an empty page"));
        }
        let cur = page.search_with_match(tuple, PageCurMode::LE).rec;
        let t_pos = if cur == PAGE_INFIMUM {
            0
        } else {
            recs.iter().position(|&r| r == cur).map(|i| i + 1).ok_or_else(|| {
                StorageError::corruption(page_id, "insert position not in record list")
            })?
        };

        let plan = if retry {
            let t_size = rec_converted_size(tuple);
            let mut sizes: Vec<usize> = recs.iter().map(|&r| page.rec_size(r)).collect();
            sizes.insert(t_pos, t_size);
            SplitPlan {
                s: plan_balanced_split(&sizes),
                direction: AllocDirection::Up,
            }
        } else {
            let last_insert = page.last_insert();
            let after_last = last_insert.is_some() && last_insert == Some(cur);
            let before_last = last_insert.is_some() && last_insert == Some(page.rec_next(cur));
            plan_split(n, t_pos, after_last, before_last)
        };
        let t_left = t_pos < plan.s;
        let left_count = if t_left { plan.s - 1 } else { plan.s };
        let up = plan.direction == AllocDirection::Up;

        // records moving to the new page
        let moved: Vec<usize> = if up {
            recs[left_count..].to_vec()
        } else {
            recs[..left_count].to_vec()
        };
        let first_kept = if up {
            None
        } else {
            Some(recs.get(left_count).copied().unwrap_or_else(|| page.supremum()))
        };

        let father = if up {
            None
        } else {
            Some(self.get_father(mtr, block)?)
        };

        self.ctx.ahi.drop_page_hash_index(mtr.page(block));
        let new_block = self.page_alloc(mtr, level, page_id, plan.direction, reservation)?;
        let new_id = mtr.page_id(new_block);
        self.link_new_page(mtr, block, new_block, up)?;
        self.move_records(mtr, block, new_block, &moved, first_kept)?;

        if let Some(father) = father {
            let father_page = mtr.page_mut(father.block);
            father_page.rec_set_child(father.rec, new_id);
            father_page.zip_refresh()?;
        }

        debug!(
            "index {}: split page {} at level {}: {} records to new page {} ({})",
            self.index.name,
            page_id,
            level,
            moved.len(),
            new_id,
            if up { "right" } else { "left" }
        );

        let (left, right) = if up {
            (block, new_block)
        } else {
            (new_block, block)
        };
        Ok(SplitOutcome {
            ptr_block: right,
            t_block: if t_left { left } else { right },
        })
    }

    /// Links `new_block` next to `block`: to its right when `up`.
    pub(crate) fn link_new_page(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        new_block: BlockId,
        up: bool,
    ) -> StorageResult<()> {
        let page_id = mtr.page_id(block);
        let new_id = mtr.page_id(new_block);
        let (old, new) = mtr.pages_mut2(block, new_block);
        let far = if up {
            let next = old.next();
            new.set_prev(Some(page_id));
            new.set_next(next);
            old.set_next(Some(new_id));
            next
        } else {
            let prev = old.prev();
            new.set_prev(prev);
            new.set_next(Some(page_id));
            old.set_prev(Some(new_id));
            prev
        };
        if let Some(far) = far {
            let far_block = mtr.get_page(far, LatchKind::X)?;
            let far_page = mtr.page_mut(far_block);
            if up {
                far_page.set_prev(Some(new_id));
            } else {
                far_page.set_next(Some(new_id));
            }
        }
        Ok(())
    }

    /// Moves `moved` from the page in `block` to the empty `new_block`.
    /// `first_kept` is set when the moved records are the page start.
    pub(crate) fn move_records(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        new_block: BlockId,
        moved: &[usize],
        first_kept: Option<usize>,
    ) -> StorageResult<()> {
        let snapshot = mtr.page(block).snapshot();
        let (old, new) = mtr.pages_mut2(block, new_block);
        let copied = new.copy_recs_after(PAGE_INFIMUM, &snapshot, moved);
        let done = match copied {
            Ok(()) => {
                match (first_kept, moved.first()) {
                    (_, None) => {}
                    (Some(until), Some(_)) => {
                        old.delete_rec_list_start(until)?;
                    }
                    (None, Some(&from)) => {
                        old.delete_rec_list_end(from)?;
                    }
                }
                Self::fix_split_min_recs(old, new);
                old.zip_compress() && new.zip_compress()
            }
            Err(StorageError::LayoutFailure) => false,
            Err(e) => return Err(e),
        };
        if done {
            return Ok(());
        }

        // copy the whole page and cut each copy down to its half
        old.zip_copy_from(&snapshot);
        new.zip_copy_from(&snapshot);
        match (first_kept, moved.first()) {
            (_, None) => {
                new.delete_rec_list_end(new.first_user_rec().unwrap_or(new.supremum()))?;
            }
            (Some(until), Some(_)) => {
                new.delete_rec_list_end(until)?;
                old.delete_rec_list_start(until)?;
            }
            (None, Some(&from)) => {
                new.delete_rec_list_start(from)?;
                old.delete_rec_list_end(from)?;
            }
        }
        new.set_seg_headers(0, 0);
        Self::fix_split_min_recs(old, new);
        if !old.zip_compress_with_reserve(0) || !new.zip_compress_with_reserve(0) {
            return Err(StorageError::corruption(
                old.page_id(),
                "split halves do not recompress",
            ));
        }
        Ok(())
    }

    fn fix_split_min_recs(old: &mut PageBuf, new: &mut PageBuf) {
        let old_leftmost = old.prev().is_none();
        let new_leftmost = new.prev().is_none();
        BTree::fix_min_rec(old, old_leftmost);
        BTree::fix_min_rec(new, new_leftmost);
    }

    /// Moves the root's records to a new page one level down and leaves a
    /// single node pointer to it in the root. Returns the new page.
    fn root_raise(
        &self,
        mtr: &mut Mtr,
        root_block: BlockId,
        reservation: &mut Reservation,
    ) -> StorageResult<BlockId> {
        let level = mtr.page(root_block).level();
        let new_block =
            self.page_alloc(mtr, level, self.root, AllocDirection::NoDir, reservation)?;
        let new_id = mtr.page_id(new_block);
        self.ctx.ahi.drop_page_hash_index(mtr.page(root_block));

        {
            let (root, new) = mtr.page_pair(root_block, new_block);
            let recs = root.user_recs();
            let copied = match new.copy_recs_after(PAGE_INFIMUM, root, &recs) {
                Ok(()) => new.zip_compress(),
                Err(StorageError::LayoutFailure) => false,
                Err(e) => return Err(e),
            };
            if !copied {
                new.zip_copy_from(root);
                new.set_seg_headers(0, 0);
                new.set_max_trx_id(0);
            }
            BTree::fix_min_rec(new, true);
            new.zip_refresh()?;
        }

        let new_page = mtr.page(new_block);
        let first = new_page
            .first_user_rec()
            .ok_or_else(|| StorageError::corruption(self.root, "raise of an empty root"))?;
        let mut node_ptr = self.node_ptr(new_page, first, new_id);
        node_ptr.set_min_rec(true);

        let root = mtr.page_mut(root_block);
        root.page_empty(level + 1, true);
        root.insert_rec_after(PAGE_INFIMUM, &node_ptr, RecStatus::NodePtr)?
            .ok_or_else(|| {
                StorageError::corruption(self.root, "node pointer does not fit the root")
            })?;
        root.zip_refresh()?;
        TreeCounters::bump(&self.counters.root_raises);
        info!(
            "index {}: root raised to level {}, old root records moved to page {}",
            self.index.name,
            level + 1,
            new_id
        );
        Ok(new_block)
    }

    /// Tries to put a tuple that belongs at the end of a full leaf at the
    /// start of its right sibling instead of splitting.
    fn insert_into_right_sibling(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        tuple: &Tuple,
        ops: &mut TreeOps,
    ) -> StorageResult<bool> {
        let page = mtr.page(block);
        let cur = page.search_with_match(tuple, PageCurMode::LE).rec;
        if page.rec_next(cur) != page.supremum() {
            return Ok(false);
        }
        let next_id = match page.next() {
            Some(next) => next,
            None => return Ok(false),
        };
        let next_block = mtr.get_page(next_id, LatchKind::X)?;
        self.check_index_page(mtr.page(next_block), Some(0))?;

        let father = self.get_father(mtr, block)?;
        let next_father = self.get_father(mtr, next_block)?;
        if father.page_id != next_father.page_id {
            return Ok(false);
        }

        let next_page = mtr.page(next_block);
        let old_first = next_page
            .first_user_rec()
            .ok_or_else(|| StorageError::corruption(next_id, "empty non-root leaf"))?;
        let old_key = self.node_key(next_page, old_first);
        let rec = match self.insert_if_possible(mtr, next_block, PAGE_INFIMUM, tuple)? {
            Some(rec) => rec,
            None => return Ok(false),
        };

        let new_ptr = self.node_ptr(mtr.page(next_block), rec, next_id);
        ops.push(TreeOp::DeleteNodePtr {
            level: 1,
            key: old_key,
            child: next_id,
        })?;
        ops.push(TreeOp::InsertNodePtr {
            level: 1,
            tuple: new_ptr,
        })?;
        TreeCounters::bump(&self.counters.right_sibling_inserts);
        debug!(
            "index {}: inserted at the start of right sibling {}",
            self.index.name, next_id
        );
        Ok(true)
    }

    /// Inserts a node pointer on a non-leaf level, splitting as needed.
    pub(crate) fn insert_node_ptr(
        &self,
        mtr: &mut Mtr,
        level: usize,
        node_ptr: &Tuple,
        reservation: &mut Reservation,
        ops: &mut TreeOps,
    ) -> StorageResult<()> {
        let cursor = self.search_to_nth_level(
            mtr,
            node_ptr,
            level,
            PageCurMode::LE,
            BtrLatchMode::ContModifyTree,
        )?;
        if self
            .insert_if_possible(mtr, cursor.block, cursor.rec, node_ptr)?
            .is_none()
        {
            self.page_split_and_insert(mtr, cursor.block, node_ptr, reservation, ops)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::key::IndexDef;
    use super::super::test_util::*;
    use super::*;
    use crate::access::value::decode_u64;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn test_plan_split_sequential() {
        // ascending: insert after the last record
        let plan = plan_split(10, 10, true, false);
        assert_eq!(plan, SplitPlan { s: 10, direction: AllocDirection::Up });
        // ascending with records after the insert point keeps one of them
        let plan = plan_split(10, 4, true, false);
        assert_eq!(plan.s, 6);
        // descending inserts split to a new left page
        let plan = plan_split(10, 0, false, true);
        assert_eq!(plan, SplitPlan { s: 1, direction: AllocDirection::Down });
        let plan = plan_split(10, 5, false, true);
        assert_eq!(plan.s, 4);
        // random inserts split in the middle
        let plan = plan_split(10, 2, false, false);
        assert_eq!(plan, SplitPlan { s: 6, direction: AllocDirection::Up });
        let plan = plan_split(1, 0, false, false);
        assert_eq!(plan.s, 1);
    }

    #[test]
    fn test_plan_balanced_split() {
        assert_eq!(plan_balanced_split(&[10, 10, 10, 10]), 2);
        assert_eq!(plan_balanced_split(&[100, 1, 1]), 1);
        assert_eq!(plan_balanced_split(&[1, 1, 100]), 2);
    }

    fn scan_keys(tree: &BTree) -> StorageResult<Vec<u64>> {
        tree.scan()
            .map(|r| r.map(|t| decode_u64(t.field(0).unwrap())))
            .collect()
    }

    #[test]
    fn test_ascending_inserts_fill_pages() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        for k in 0..2000 {
            tree.insert(&row(k, 100))?;
        }
        let stats = tree.validate()?;
        assert_eq!(stats.n_records, 2000);
        // sequential splits leave nearly full pages behind
        assert!(stats.leaf_fill_pct() > 85, "fill {}", stats.leaf_fill_pct());
        assert_eq!(scan_keys(&tree)?, (0..2000).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_descending_inserts() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        for k in (0..1500).rev() {
            tree.insert(&row(k, 100))?;
        }
        let stats = tree.validate()?;
        assert_eq!(stats.n_records, 1500);
        assert!(stats.leaf_fill_pct() > 85, "fill {}", stats.leaf_fill_pct());
        assert_eq!(scan_keys(&tree)?, (0..1500).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_random_inserts_and_duplicates() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        let mut keys: Vec<u64> = (0..3000).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        for &k in &keys {
            tree.insert(&row(k, 60))?;
        }
        assert!(matches!(tree.insert(&row(42, 60)), Err(StorageError::DuplicateKey)));
        tree.validate()?;
        assert_eq!(scan_keys(&tree)?, (0..3000).collect::<Vec<_>>());
        assert!(tree.height()? >= 2);
        Ok(())
    }

    #[test]
    fn test_compressed_index_splits() -> StorageResult<()> {
        let tree = BTree::create(
            context(),
            IndexDef::clustered(1, "pk", 1, 2).with_zip(8192),
        )?;
        let mut keys: Vec<u64> = (0..1500).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(11));
        for &k in &keys {
            tree.insert(&row(k, 80))?;
        }
        tree.validate()?;
        assert_eq!(scan_keys(&tree)?.len(), 1500);
        Ok(())
    }

    #[test]
    fn test_large_records_force_deep_tree() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::secondary(1, "wide", 2))?;
        let pad = vec![b'x'; 2000];
        for k in 0..400u64 {
            let t = Tuple::from_slices(&[&pad, &k.to_be_bytes()]);
            tree.insert(&t)?;
        }
        let stats = tree.validate()?;
        assert!(stats.height >= 3, "height {}", stats.height);
        assert_eq!(stats.n_records, 400);
        Ok(())
    }

    #[test]
    fn test_insert_fails_cleanly_when_space_runs_out() -> StorageResult<()> {
        let ctx = context_with(Some(6), &Default::default());
        let tree = BTree::create(ctx, IndexDef::clustered(1, "pk", 1, 2))?;
        let mut inserted = 0u64;
        let err = loop {
            match tree.insert(&row(inserted, 200)) {
                Ok(()) => inserted += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, StorageError::OutOfSpace { .. }), "{}", err);
        tree.validate()?;
        assert_eq!(scan_keys(&tree)?, (0..inserted).collect::<Vec<_>>());
        Ok(())
    }
}

use super::mbr::Mbr;
use super::{PredicateEvent, RTree, RtrPathStep};
use crate::access::btree::TreeCounters;
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mtr::{BlockId, Mtr};
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::index_page::PAGE_INFIMUM;
use crate::storage::page::record::{cmp_tuple_rec, RecStatus};
use crate::storage::page::PageBuf;
use log::{debug, info};
use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;

/// Leaf page, record and the non-leaf pages above it, root first.
pub(crate) type Located = (BlockId, usize, Vec<RtrPathStep>);

/// Inserts `tuples` keeping leaf records in byte order. Node pointers are
/// appended.
fn place_tuples(page: &mut PageBuf, tuples: &[Tuple]) -> StorageResult<()> {
    for t in tuples {
        let (cur, status) = if page.is_leaf() {
            (page.search_with_match(t, PageCurMode::LE).rec, RecStatus::Ordinary)
        } else {
            (page.last_user_rec().unwrap_or(PAGE_INFIMUM), RecStatus::NodePtr)
        };
        page.insert_rec_after(cur, t, status)?
            .ok_or(StorageError::LayoutFailure)?;
    }
    Ok(())
}

impl RTree {
    /// Removes the entry `(mbr, payload)`. Returns false when absent.
    pub fn delete(&self, mbr: &Mbr, payload: &[u8]) -> StorageResult<bool> {
        mbr.check()?;
        let tuple = Self::leaf_tuple(mbr, payload);

        let mut mtr = self.base.start_mtr();
        mtr.x_lock_index(self.base.lock());
        let (leaf, rec, mut path) = match self.locate(&mut mtr, &tuple)? {
            Some(found) => found,
            None => {
                mtr.commit()?;
                return Ok(false);
            }
        };

        mtr.page_mut(leaf).delete_rec(rec)?;
        let restructured = self.condense_tree(&mut mtr, leaf, &mut path)?;
        let collapsed = self.collapse_root(&mut mtr)?;
        mtr.commit()?;

        let _ = self
            .n_rows
            .fetch_update(AtomicOrdering::Relaxed, AtomicOrdering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        if restructured || collapsed {
            TreeCounters::bump(&self.counters().pessimistic_deletes);
        } else {
            TreeCounters::bump(&self.counters().optimistic_deletes);
        }
        Ok(true)
    }

    /// Finds the leaf record equal to `tuple`, X latching the pages on the
    /// way. Subtrees whose MBR does not cover the entry are skipped and
    /// their pages released again. Requires the tree X lock.
    pub(crate) fn locate(&self, mtr: &mut Mtr, tuple: &Tuple) -> StorageResult<Option<Located>> {
        let mbr = Mbr::from_bytes(tuple.field(0).unwrap_or(&[]))?;
        let root = mtr.get_page(self.root_page_id(), LatchKind::X)?;
        self.base.check_index_page(mtr.page(root), None)?;
        let mut path = Vec::new();
        self.locate_in(mtr, root, tuple, &mbr, &mut path)
    }

    fn locate_in(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        tuple: &Tuple,
        mbr: &Mbr,
        path: &mut Vec<RtrPathStep>,
    ) -> StorageResult<Option<Located>> {
        let page = mtr.page(block);
        if page.is_leaf() {
            let rec = page.search_with_match(tuple, PageCurMode::GE).rec;
            if page.rec_is_user(rec) && cmp_tuple_rec(tuple, page, rec) == Ordering::Equal {
                return Ok(Some((block, rec, path.clone())));
            }
            return Ok(None);
        }

        let level = page.level();
        let mut children = Vec::new();
        for rec in page.user_recs() {
            if Self::rec_mbr(page, rec)?.contains(mbr) {
                children.push(page.rec_child(rec).ok_or_else(|| {
                    StorageError::corruption(page.page_id(), "node pointer without child")
                })?);
            }
        }
        path.push(RtrPathStep {
            page_id: page.page_id(),
            level,
        });
        for child in children {
            let child_block = mtr.get_page(child, LatchKind::X)?;
            self.base.check_index_page(mtr.page(child_block), Some(level - 1))?;
            if let Some(found) = self.locate_in(mtr, child_block, tuple, mbr, path)? {
                return Ok(Some(found));
            }
            mtr.release_page(child_block);
        }
        path.pop();
        Ok(None)
    }

    /// Walks up from a page that lost a record: empty pages are discarded,
    /// underfull ones merged into a sibling under the same parent, and node
    /// pointer MBRs shrunk. Returns whether a page left the tree.
    fn condense_tree(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        path: &mut Vec<RtrPathStep>,
    ) -> StorageResult<bool> {
        let mut block = block;
        let mut restructured = false;
        while let Some(step) = path.pop() {
            let parent = mtr.get_page(step.page_id, LatchKind::X)?;
            let page = mtr.page(block);
            if page.n_recs() == 0 {
                self.discard_page(mtr, parent, block)?;
                restructured = true;
            } else if page.data_size() < self.base.compress_limit()
                && self.merge_with_sibling(mtr, parent, block)?
            {
                restructured = true;
            } else if !self.update_node_ptr_mbr(mtr, parent, block)? {
                break;
            }
            block = parent;
        }
        Ok(restructured)
    }

    fn unlink_page(&self, mtr: &mut Mtr, block: BlockId) -> StorageResult<()> {
        let page = mtr.page(block);
        let level = page.level();
        let (prev, next) = (page.prev(), page.next());
        if let Some(prev_id) = prev {
            let b = mtr.get_page(prev_id, LatchKind::X)?;
            self.base.check_index_page(mtr.page(b), Some(level))?;
            mtr.page_mut(b).set_next(next);
        }
        if let Some(next_id) = next {
            let b = mtr.get_page(next_id, LatchKind::X)?;
            self.base.check_index_page(mtr.page(b), Some(level))?;
            mtr.page_mut(b).set_prev(prev);
        }
        Ok(())
    }

    /// Removes an empty non-root page and its node pointer.
    fn discard_page(&self, mtr: &mut Mtr, parent: BlockId, block: BlockId) -> StorageResult<()> {
        let page_id = mtr.page_id(block);
        let rec = Self::find_node_ptr(mtr.page(parent), page_id)?;
        mtr.page_mut(parent).delete_rec(rec)?;
        self.unlink_page(mtr, block)?;
        self.base.page_free(mtr, block)?;
        TreeCounters::bump(&self.counters().discards);
        debug!(
            "spatial index {}: discarded empty page {}",
            self.index().name,
            page_id
        );
        self.notify(PredicateEvent::Discard { page: page_id });
        Ok(())
    }

    /// Moves every record of `block` into its left or right sibling if one
    /// with the same parent has room, then frees `block`.
    fn merge_with_sibling(
        &self,
        mtr: &mut Mtr,
        parent: BlockId,
        block: BlockId,
    ) -> StorageResult<bool> {
        let page = mtr.page(block);
        let page_id = page.page_id();
        let level = page.level();
        let candidates = [page.prev(), page.next()];
        let tuples: Vec<Tuple> = page
            .user_recs()
            .into_iter()
            .map(|rec| page.rec_to_tuple(rec))
            .collect();
        let need: usize = page.user_recs().into_iter().map(|rec| page.rec_size(rec)).sum();

        for sib_id in candidates.into_iter().flatten() {
            if Self::find_node_ptr(mtr.page(parent), sib_id).is_err() {
                continue;
            }
            let sib = mtr.get_page(sib_id, LatchKind::X)?;
            self.base.check_index_page(mtr.page(sib), Some(level))?;
            if need > mtr.page(sib).max_insert_size_after_reorganize(tuples.len()) {
                continue;
            }
            if need > mtr.page(sib).max_insert_size(tuples.len()) {
                self.base.reorganize(mtr, sib)?;
            }
            let before = Self::page_mbr(mtr.page(sib))?;
            place_tuples(mtr.page_mut(sib), &tuples).map_err(|_| {
                StorageError::corruption(sib_id, "merged records do not fit the sibling")
            })?;

            let rec = Self::find_node_ptr(mtr.page(parent), page_id)?;
            mtr.page_mut(parent).delete_rec(rec)?;
            self.update_node_ptr_mbr(mtr, parent, sib)?;
            let after = Self::page_mbr(mtr.page(sib))?
                .ok_or_else(|| StorageError::corruption(sib_id, "merge left an empty page"))?;
            self.unlink_page(mtr, block)?;
            self.base.page_free(mtr, block)?;

            TreeCounters::bump(&self.counters().merges);
            debug!(
                "spatial index {}: merged page {} into {} at level {}",
                self.index().name,
                page_id,
                sib_id,
                level
            );
            self.notify(PredicateEvent::Merge {
                from: page_id,
                into: sib_id,
                before,
                after,
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Shrinks the tree from the top: an empty non-leaf root becomes an
    /// empty leaf, a root with a single child takes over the child's
    /// records. Returns whether the root changed.
    fn collapse_root(&self, mtr: &mut Mtr) -> StorageResult<bool> {
        let root_id = self.root_page_id();
        let root = mtr.get_page(root_id, LatchKind::X)?;
        let mut changed = false;
        loop {
            let page = mtr.page(root);
            if page.is_leaf() {
                return Ok(changed);
            }
            let level = page.level();
            match page.n_recs() {
                0 => {
                    mtr.page_mut(root).page_empty(0, true);
                    info!("spatial index {}: tree emptied", self.index().name);
                    return Ok(true);
                }
                1 => {
                    let child_id = page
                        .first_user_rec()
                        .and_then(|rec| page.rec_child(rec))
                        .ok_or_else(|| {
                            StorageError::corruption(root_id, "root pointer without child")
                        })?;
                    let child = mtr.get_page(child_id, LatchKind::X)?;
                    self.base.check_index_page(mtr.page(child), Some(level - 1))?;
                    let recs = mtr.page(child).user_recs();
                    mtr.page_mut(root).page_empty(level - 1, true);
                    {
                        let (src, dst) = mtr.page_pair(child, root);
                        dst.copy_recs_after(PAGE_INFIMUM, src, &recs)?;
                    }
                    self.base.page_free(mtr, child)?;
                    TreeCounters::bump(&self.counters().lifts);
                    info!(
                        "spatial index {}: root lowered to level {}, page {} freed",
                        self.index().name,
                        level - 1,
                        child_id
                    );
                    changed = true;
                }
                _ => return Ok(changed),
            }
        }
    }
}

use super::mbr::Mbr;
use super::split::{split_entries, SplitEntry};
use super::{PredicateEvent, RTree, RtrPathStep};
use crate::access::btree::TreeCounters;
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fsp::{AllocDirection, Reservation};
use crate::storage::mtr::{BlockId, Mtr};
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::index_page::PAGE_INFIMUM;
use crate::storage::page::record::{rec_converted_size, RecStatus};
use log::{debug, info};
use std::sync::atomic::Ordering;

impl RTree {
    /// Adds an entry. `(mbr, payload)` pairs are unique.
    pub fn insert(&self, mbr: &Mbr, payload: &[u8]) -> StorageResult<()> {
        mbr.check()?;
        let tuple = Self::leaf_tuple(mbr, payload);
        self.base.index().check_tuple(&tuple)?;

        let mut mtr = self.base.start_mtr();
        mtr.x_lock_index(self.base.lock());
        if self.locate(&mut mtr, &tuple)?.is_some() {
            return Err(StorageError::DuplicateKey);
        }
        let (leaf, mut path) = self.search_to_nth_level(&mut mtr, mbr, 0)?;
        let mut reservation = self
            .base
            .context()
            .space
            .reserve(self.base.reserve_for(path.len() + 1))?;

        if self.insert_into_page(&mut mtr, leaf, &tuple)? {
            self.adjust_upper_levels(&mut mtr, &mut path, leaf, None, &mut reservation)?;
            TreeCounters::bump(&self.counters().optimistic_inserts);
        } else {
            let (left, right) =
                self.split_and_insert(&mut mtr, leaf, tuple, &mut path, &mut reservation)?;
            self.adjust_upper_levels(&mut mtr, &mut path, left, Some(right), &mut reservation)?;
            TreeCounters::bump(&self.counters().pessimistic_inserts);
        }
        mtr.commit()?;
        self.n_rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Descends to `level` choosing the child whose MBR grows least, X
    /// latching every page. Requires the tree X lock. Returns the target
    /// page and the non-leaf pages passed, root first.
    pub(crate) fn search_to_nth_level(
        &self,
        mtr: &mut Mtr,
        mbr: &Mbr,
        level: usize,
    ) -> StorageResult<(BlockId, Vec<RtrPathStep>)> {
        let mut block = mtr.get_page(self.root_page_id(), LatchKind::X)?;
        self.base.check_index_page(mtr.page(block), None)?;
        let mut path = Vec::new();

        loop {
            let page = mtr.page(block);
            let page_level = page.level();
            if page_level == level {
                return Ok((block, path));
            }
            if page_level < level || path.len() >= crate::access::btree::BTR_MAX_LEVELS {
                return Err(StorageError::corruption(
                    page.page_id(),
                    format!("level {} not reachable from level {}", level, page_level),
                ));
            }

            let mut best: Option<(usize, f64, f64)> = None;
            for rec in page.user_recs() {
                let m = Self::rec_mbr(page, rec)?;
                let growth = m.enlargement(mbr);
                let area = m.area();
                let better = match best {
                    None => true,
                    Some((_, g, a)) => growth < g || (growth == g && area < a),
                };
                if better {
                    best = Some((rec, growth, area));
                }
            }
            let (rec, _, _) = best.ok_or_else(|| {
                StorageError::corruption(page.page_id(), "non-leaf page without records")
            })?;
            let child = page.rec_child(rec).ok_or_else(|| {
                StorageError::corruption(page.page_id(), "node pointer without child")
            })?;
            path.push(RtrPathStep {
                page_id: page.page_id(),
                level: page_level,
            });
            block = mtr.get_page(child, LatchKind::X)?;
            self.base.check_index_page(mtr.page(block), Some(page_level - 1))?;
        }
    }

    /// Places `tuple` on the page, reorganizing if that makes room.
    /// Leaf entries keep byte order; node pointers go to the end.
    pub(crate) fn insert_into_page(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        tuple: &Tuple,
    ) -> StorageResult<bool> {
        let size = rec_converted_size(tuple);
        {
            let page = mtr.page(block);
            if size > page.max_insert_size(1) {
                if size > page.max_insert_size_after_reorganize(1) {
                    return Ok(false);
                }
                self.base.reorganize(mtr, block)?;
            }
        }
        let page = mtr.page_mut(block);
        let (cur, status) = if page.is_leaf() {
            (page.search_with_match(tuple, PageCurMode::LE).rec, RecStatus::Ordinary)
        } else {
            (page.last_user_rec().unwrap_or(PAGE_INFIMUM), RecStatus::NodePtr)
        };
        Ok(page.insert_rec_after(cur, tuple, status)?.is_some())
    }

    /// Moves the root's records to a new page one level down and leaves a
    /// single node pointer on the root. Returns the new page.
    fn root_raise(
        &self,
        mtr: &mut Mtr,
        root_block: BlockId,
        reservation: &mut Reservation,
    ) -> StorageResult<BlockId> {
        let root_id = self.root_page_id();
        let level = mtr.page(root_block).level();
        let new_block =
            self.base
                .page_alloc(mtr, level, root_id, AllocDirection::NoDir, reservation)?;
        let new_id = mtr.page_id(new_block);
        {
            let (root, new) = mtr.page_pair(root_block, new_block);
            new.set_ssn(root.ssn());
            let recs = root.user_recs();
            new.copy_recs_after(PAGE_INFIMUM, root, &recs).map_err(|_| {
                StorageError::corruption(root_id, "root records do not fit a new page")
            })?;
        }
        let mbr = Self::page_mbr(mtr.page(new_block))?
            .ok_or_else(|| StorageError::corruption(root_id, "raise of an empty root"))?;
        let root = mtr.page_mut(root_block);
        root.page_empty(level + 1, true);
        let node_ptr = Self::node_ptr_tuple(&mbr, new_id);
        root.insert_rec_after(PAGE_INFIMUM, &node_ptr, RecStatus::NodePtr)?
            .ok_or_else(|| {
                StorageError::corruption(root_id, "node pointer does not fit the root")
            })?;
        TreeCounters::bump(&self.counters().root_raises);
        info!(
            "spatial index {}: root raised to level {}, records moved to page {}",
            self.index().name,
            level + 1,
            new_id
        );
        Ok(new_block)
    }

    /// Splits the page in `block` and inserts `tuple` into one of the
    /// halves. A root is raised first and pushed onto `path`. Returns the
    /// left (original) and right (new) pages; the caller fixes the level
    /// above.
    pub(crate) fn split_and_insert(
        &self,
        mtr: &mut Mtr,
        block: BlockId,
        tuple: Tuple,
        path: &mut Vec<RtrPathStep>,
        reservation: &mut Reservation,
    ) -> StorageResult<(BlockId, BlockId)> {
        let mut block = block;
        if mtr.page_id(block) == self.root_page_id() {
            let level = mtr.page(block).level();
            block = self.root_raise(mtr, block, reservation)?;
            path.push(RtrPathStep {
                page_id: self.root_page_id(),
                level: level + 1,
            });
        }

        let page = mtr.page(block);
        let page_id = page.page_id();
        let level = page.level();
        let old_ssn = page.ssn();
        let mut tuples: Vec<Tuple> = page
            .user_recs()
            .into_iter()
            .map(|rec| page.rec_to_tuple(rec))
            .collect();
        tuples.push(tuple);
        let entries = tuples
            .iter()
            .map(|t| {
                let mbr = Mbr::from_bytes(t.field(0).unwrap_or(&[]))
                    .map_err(|_| StorageError::corruption(page_id, "record with a bad MBR"))?;
                Ok(SplitEntry {
                    mbr,
                    size: rec_converted_size(t),
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        let groups = split_entries(&entries)
            .ok_or_else(|| StorageError::corruption(page_id, "split of a page with one record"))?;
        let before = groups.left_mbr.union(&groups.right_mbr);

        let new_block =
            self.base
                .page_alloc(mtr, level, page_id, AllocDirection::Up, reservation)?;
        let new_id = mtr.page_id(new_block);
        let old_next = mtr.page(block).next();

        let status = if level == 0 {
            RecStatus::Ordinary
        } else {
            RecStatus::NodePtr
        };
        let fill = |page: &mut crate::storage::page::PageBuf, members: &[usize]| {
            let mut group: Vec<&Tuple> = members.iter().map(|&i| &tuples[i]).collect();
            group.sort_by(|a, b| a.fields.cmp(&b.fields));
            let mut cur = PAGE_INFIMUM;
            for t in group {
                cur = page.insert_rec_after(cur, t, status)?.ok_or_else(|| {
                    StorageError::corruption(page.page_id(), "split group does not fit a page")
                })?;
            }
            Ok::<(), StorageError>(())
        };
        {
            let (old, new) = mtr.pages_mut2(block, new_block);
            old.page_empty(level, true);
            fill(old, &groups.left)?;
            fill(new, &groups.right)?;
            new.set_prev(Some(page_id));
            new.set_next(old_next);
            old.set_next(Some(new_id));
            new.set_ssn(old_ssn);
        }
        if let Some(next) = old_next {
            let next_block = mtr.get_page(next, LatchKind::X)?;
            self.base.check_index_page(mtr.page(next_block), Some(level))?;
            mtr.page_mut(next_block).set_prev(Some(new_id));
        }
        let ssn = self.next_ssn(mtr)?;
        mtr.page_mut(block).set_ssn(ssn);

        TreeCounters::bump(&self.counters().splits);
        debug!(
            "spatial index {}: split page {} at level {} into {} + {} records, new page {}, ssn {}",
            self.index().name,
            page_id,
            level,
            groups.left.len(),
            groups.right.len(),
            new_id,
            ssn
        );
        self.notify(PredicateEvent::Split {
            page: page_id,
            new_page: new_id,
            before,
            left: groups.left_mbr,
            right: groups.right_mbr,
        });
        Ok((block, new_block))
    }

    /// Walks `path` upwards from `child`, bringing each node pointer MBR up
    /// to date and inserting the pointer to `sibling` left by a split.
    /// Stops early once a level needs no change.
    pub(crate) fn adjust_upper_levels(
        &self,
        mtr: &mut Mtr,
        path: &mut Vec<RtrPathStep>,
        child: BlockId,
        sibling: Option<BlockId>,
        reservation: &mut Reservation,
    ) -> StorageResult<()> {
        let mut child = child;
        let mut sibling = sibling;
        while let Some(step) = path.pop() {
            let parent = mtr.get_page(step.page_id, LatchKind::X)?;
            let changed = self.update_node_ptr_mbr(mtr, parent, child)?;
            let sib = match sibling.take() {
                Some(sib) => sib,
                None if changed => {
                    child = parent;
                    continue;
                }
                None => break,
            };

            let sib_id = mtr.page_id(sib);
            let mbr = Self::page_mbr(mtr.page(sib))?
                .ok_or_else(|| StorageError::corruption(sib_id, "new page is empty"))?;
            let ptr = Self::node_ptr_tuple(&mbr, sib_id);
            if self.insert_into_page(mtr, parent, &ptr)? {
                child = parent;
                continue;
            }
            let (left, right) = self.split_and_insert(mtr, parent, ptr, path, reservation)?;
            child = left;
            sibling = Some(right);
        }
        if sibling.is_some() {
            return Err(StorageError::tree_corruption(format!(
                "spatial index {}: split reached above the root",
                self.index().name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::access::rtree::mbr::SearchMode;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_insert_and_find() -> StorageResult<()> {
        let tree = spatial_tree()?;
        tree.insert(&Mbr::new(0.0, 0.0, 10.0, 10.0), &pk(1))?;
        tree.insert(&Mbr::new(20.0, 20.0, 30.0, 30.0), &pk(2))?;
        assert!(matches!(
            tree.insert(&Mbr::new(0.0, 0.0, 10.0, 10.0), &pk(1)),
            Err(StorageError::DuplicateKey)
        ));
        // same rectangle, other payload
        tree.insert(&Mbr::new(0.0, 0.0, 10.0, 10.0), &pk(3))?;
        let hits: Vec<_> = tree
            .search(SearchMode::Intersect, &Mbr::new(5.0, 5.0, 6.0, 6.0))
            .collect::<StorageResult<_>>()?;
        assert_eq!(hits.len(), 2);
        assert_eq!(tree.n_rows(), 3);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_entries() -> StorageResult<()> {
        let tree = spatial_tree()?;
        assert!(tree.insert(&Mbr::new(f64::INFINITY, 0.0, 1.0, 1.0), &pk(1)).is_err());
        assert!(tree.insert(&Mbr::point(1.0, 1.0), &vec![0u8; 20_000]).is_err());
        assert_eq!(tree.n_rows(), 0);
        Ok(())
    }

    #[test]
    fn test_splits_grow_the_tree() -> StorageResult<()> {
        let tree = spatial_tree()?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);
        for k in 0..5000u64 {
            let x = rng.gen_range(0.0..1000.0);
            let y = rng.gen_range(0.0..1000.0);
            tree.insert(&Mbr::new(x, y, x + 2.0, y + 2.0), &pk(k))?;
        }
        let stats = tree.validate()?;
        assert_eq!(stats.n_records, 5000);
        assert!(stats.height >= 2);
        assert!(tree.counters().splits.load(Ordering::Relaxed) > 0);
        assert!(tree.current_ssn() > 0);
        Ok(())
    }

    #[test]
    fn test_enlarges_ancestors() -> StorageResult<()> {
        let tree = spatial_tree()?;
        for k in 0..2000 {
            tree.insert(&cell(k), &pk(k))?;
        }
        assert!(tree.height()? >= 2);
        // far outside everything stored so far
        tree.insert(&Mbr::new(5000.0, 5000.0, 5001.0, 5001.0), &pk(99_999))?;
        tree.validate()?;
        let hits: Vec<_> = tree
            .search(SearchMode::Within, &Mbr::new(4000.0, 4000.0, 6000.0, 6000.0))
            .collect::<StorageResult<_>>()?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload, pk(99_999).to_vec());
        Ok(())
    }
}

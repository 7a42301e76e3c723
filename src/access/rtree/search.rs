//! Spatial search and range estimation.

use super::mbr::{Mbr, SearchMode};
use super::{RTree, RTreeEntry};
use crate::storage::buffer::LatchKind;
use crate::storage::error::StorageResult;
use crate::storage::page::PageId;
use std::collections::VecDeque;

/// A page still to be visited. `ssn` is the split sequence number that was
/// current when its node pointer was read; a higher SSN on the page means
/// it split since, and its right sibling holds part of the subtree.
#[derive(Debug, Clone, Copy)]
struct PendingNode {
    page_id: PageId,
    level: Option<usize>,
    ssn: u64,
}

/// Depth-first search returning every leaf entry whose MBR satisfies the
/// mode. Each page is read under its own short tree S lock, so inserts and
/// deletes may run between pages.
pub struct RTreeSearch<'a> {
    tree: &'a RTree,
    mode: SearchMode,
    query: Mbr,
    stack: Vec<PendingNode>,
    buffered: VecDeque<RTreeEntry>,
    pages_visited: usize,
    entries_returned: usize,
    done: bool,
}

impl<'a> RTreeSearch<'a> {
    fn new(tree: &'a RTree, mode: SearchMode, query: Mbr) -> Self {
        let root = PendingNode {
            page_id: tree.root_page_id(),
            level: None,
            ssn: tree.current_ssn(),
        };
        Self {
            tree,
            mode,
            query,
            stack: vec![root],
            buffered: VecDeque::new(),
            pages_visited: 0,
            entries_returned: 0,
            done: false,
        }
    }

    fn visit(&mut self, node: PendingNode) -> StorageResult<()> {
        let base = &self.tree.base;
        let mut mtr = base.start_mtr();
        mtr.s_lock_index(base.lock());
        let block = mtr.get_page(node.page_id, LatchKind::S)?;
        let page = mtr.page(block);
        self.pages_visited += 1;

        // freed, or reused elsewhere, since the pointer was read
        if !base.is_live_page(page) || node.level.is_some_and(|l| l != page.level()) {
            return mtr.commit().map(|_| ());
        }
        if page.ssn() > node.ssn {
            if let Some(next) = page.next() {
                self.stack.push(PendingNode {
                    page_id: next,
                    level: Some(page.level()),
                    ssn: node.ssn,
                });
            }
        }

        if page.is_leaf() {
            for rec in page.user_recs() {
                let entry = RTree::rec_entry(page, rec)?;
                if entry.mbr.matches(self.mode, &self.query) {
                    self.buffered.push_back(entry);
                }
            }
        } else {
            let ssn = self.tree.current_ssn();
            let level = page.level() - 1;
            let mut children = Vec::new();
            for rec in page.user_recs() {
                if RTree::rec_mbr(page, rec)?.may_hold(self.mode, &self.query) {
                    if let Some(child) = page.rec_child(rec) {
                        children.push(PendingNode {
                            page_id: child,
                            level: Some(level),
                            ssn,
                        });
                    }
                }
            }
            self.stack.extend(children.into_iter().rev());
        }
        mtr.commit()?;
        Ok(())
    }

    /// Pages read and entries returned so far.
    pub fn statistics(&self) -> (usize, usize) {
        (self.pages_visited, self.entries_returned)
    }
}

impl Iterator for RTreeSearch<'_> {
    type Item = StorageResult<RTreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.pop_front() {
                self.entries_returned += 1;
                return Some(Ok(entry));
            }
            if self.done {
                return None;
            }
            let Some(node) = self.stack.pop() else {
                self.done = true;
                return None;
            };
            if let Err(e) = self.visit(node) {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

impl RTree {
    pub fn search(&self, mode: SearchMode, query: &Mbr) -> RTreeSearch<'_> {
        RTreeSearch::new(self, mode, *query)
    }

    /// Rough count of entries matching `mode`, from the root page alone.
    /// `None` when the root is empty or the estimate is not a number.
    pub fn estimate_n_rows_in_range(
        &self,
        mode: SearchMode,
        query: &Mbr,
    ) -> StorageResult<Option<u64>> {
        query.check()?;
        let range_area = query.area();

        let mut mtr = self.base.start_mtr();
        mtr.s_lock_index(self.base.lock());
        let block = mtr.get_page(self.root_page_id(), LatchKind::S)?;
        let page = mtr.page(block);
        self.base.check_index_page(page, None)?;
        let n_recs = page.n_recs();
        if n_recs == 0 {
            mtr.commit()?;
            return Ok(None);
        }

        let mut area = 0.0;
        for rec in page.user_recs() {
            let mbr = Self::rec_mbr(page, rec)?;
            let rec_area = mbr.area();
            let within = mbr.within(query);
            if rec_area == 0.0 {
                area += match mode {
                    SearchMode::Contain | SearchMode::Intersect => 1.0,
                    SearchMode::Disjoint => 0.0,
                    SearchMode::Within | SearchMode::MbrEqual if within => 1.0,
                    SearchMode::Within | SearchMode::MbrEqual => 0.0,
                };
            } else {
                area += match mode {
                    SearchMode::Contain | SearchMode::Intersect => {
                        query.overlap_area(&mbr) / rec_area
                    }
                    SearchMode::Disjoint => 1.0 - query.overlap_area(&mbr) / rec_area,
                    SearchMode::Within | SearchMode::MbrEqual if within => range_area / rec_area,
                    SearchMode::Within | SearchMode::MbrEqual => 0.0,
                };
            }
        }
        mtr.commit()?;

        if !area.is_finite() {
            return Ok(None);
        }
        let fraction = area / n_recs as f64;
        Ok(Some((self.n_rows() as f64 * fraction) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::storage::error::StorageError;

    fn collect(tree: &RTree, mode: SearchMode, query: &Mbr) -> StorageResult<Vec<u64>> {
        let mut keys = tree
            .search(mode, query)
            .map(|e| {
                e.map(|e| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&e.payload);
                    u64::from_be_bytes(raw)
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        keys.sort_unstable();
        Ok(keys)
    }

    #[test]
    fn test_search_empty_tree() -> StorageResult<()> {
        let tree = spatial_tree()?;
        let mut it = tree.search(SearchMode::Intersect, &Mbr::new(0.0, 0.0, 10.0, 10.0));
        assert!(it.next().is_none());
        assert_eq!(it.statistics(), (1, 0));
        assert_eq!(
            tree.estimate_n_rows_in_range(SearchMode::Intersect, &Mbr::point(1.0, 1.0))?,
            None
        );
        Ok(())
    }

    #[test]
    fn test_modes_against_brute_force() -> StorageResult<()> {
        let tree = spatial_tree()?;
        let n = 3000;
        for k in 0..n {
            tree.insert(&cell(k), &pk(k))?;
        }
        let queries = [
            Mbr::new(12.0, 12.0, 48.0, 33.0),
            Mbr::new(0.0, 0.0, 995.0, 295.0),
            Mbr::new(201.0, 101.0, 203.0, 102.0),
            cell(1234),
        ];
        let modes = [
            SearchMode::Intersect,
            SearchMode::Contain,
            SearchMode::Within,
            SearchMode::Disjoint,
            SearchMode::MbrEqual,
        ];
        for q in &queries {
            for mode in modes {
                let expected: Vec<u64> = (0..n).filter(|&k| cell(k).matches(mode, q)).collect();
                assert_eq!(collect(&tree, mode, q)?, expected, "{:?} {:?}", mode, q);
            }
        }
        Ok(())
    }

    #[test]
    fn test_search_prunes_subtrees() -> StorageResult<()> {
        let tree = spatial_tree()?;
        for k in 0..3000 {
            tree.insert(&cell(k), &pk(k))?;
        }
        let stats = tree.validate()?;
        let mut it = tree.search(SearchMode::Intersect, &Mbr::new(0.0, 0.0, 4.0, 4.0));
        assert_eq!(it.next().transpose()?.map(|e| e.payload), Some(pk(0).to_vec()));
        assert!(it.next().is_none());
        assert!(it.statistics().0 < stats.n_pages);
        Ok(())
    }

    #[test]
    fn test_estimate_tracks_selectivity() -> StorageResult<()> {
        let tree = spatial_tree()?;
        for k in 0..3000 {
            tree.insert(&cell(k), &pk(k))?;
        }
        let everything = Mbr::new(-10.0, -10.0, 2000.0, 2000.0);
        let all = tree
            .estimate_n_rows_in_range(SearchMode::Intersect, &everything)?
            .unwrap_or(0);
        let small = tree
            .estimate_n_rows_in_range(SearchMode::Intersect, &Mbr::new(0.0, 0.0, 50.0, 50.0))?
            .unwrap_or(u64::MAX);
        assert_eq!(all, 3000);
        assert!(small < all);
        assert!(matches!(
            tree.estimate_n_rows_in_range(SearchMode::Within, &Mbr::new(f64::NAN, 0.0, 1.0, 1.0)),
            Err(StorageError::InvalidTuple(_))
        ));
        Ok(())
    }
}

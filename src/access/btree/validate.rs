//! Whole-tree consistency check.

use super::BTree;
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mtr::{BlockId, Mtr};
use crate::storage::page::index_page::page_free_space_of_empty;
use crate::storage::page::record::{cmp_rec_rec, cmp_tuple_rec};
use crate::storage::page::PageId;
use log::warn;
use std::cmp::Ordering;

/// Shape of a tree, gathered while validating it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BTreeStatistics {
    pub height: usize,
    pub n_pages: usize,
    pub n_leaf_pages: usize,
    /// User records on the leaf level
    pub n_records: usize,
    /// Page count per level, leaf level first
    pub pages_per_level: Vec<usize>,
    /// Record bytes on the leaf level
    pub data_bytes: usize,
}

impl BTreeStatistics {
    /// Average leaf fill as a percentage of the usable page space.
    pub fn leaf_fill_pct(&self) -> usize {
        if self.n_leaf_pages == 0 {
            return 0;
        }
        self.data_bytes * 100 / (self.n_leaf_pages * page_free_space_of_empty())
    }
}

/// Node pointer expected to lead to a page on the level below.
struct ExpectedChild {
    page_id: PageId,
    /// `None` for the MIN_REC pointer
    key: Option<Tuple>,
}

impl BTree {
    /// Walks every level left to right and checks the structural
    /// invariants. Problems are logged one by one and reported as a single
    /// corruption error.
    pub fn validate(&self) -> StorageResult<BTreeStatistics> {
        let mut mtr = self.start_mtr();
        mtr.sx_lock_index(&self.lock);
        let mut issues = Vec::new();
        let stats = self.validate_levels(&mut mtr, &mut issues)?;
        mtr.commit()?;

        if let Some(stats) = &stats {
            self.validate_segments(stats, &mut issues);
        }
        if !issues.is_empty() {
            for issue in &issues {
                warn!("index {}: {}", self.index.name, issue);
            }
            return Err(StorageError::tree_corruption(format!(
                "index {}: {} problem(s), first: {}",
                self.index.name,
                issues.len(),
                issues[0]
            )));
        }
        stats.ok_or_else(|| StorageError::tree_corruption("validation produced no statistics"))
    }

    fn validate_levels(
        &self,
        mtr: &mut Mtr,
        issues: &mut Vec<String>,
    ) -> StorageResult<Option<BTreeStatistics>> {
        let root = mtr.get_page(self.root, LatchKind::S)?;
        let page = mtr.page(root);
        if !self.is_live_page(page) {
            issues.push(format!("root {} is not an index page of this index", self.root));
            return Ok(None);
        }
        if page.prev().is_some() || page.next().is_some() {
            issues.push(format!("root {} has siblings", self.root));
        }
        let root_level = page.level();
        mtr.release_page(root);

        let mut stats = BTreeStatistics {
            height: root_level + 1,
            pages_per_level: vec![0; root_level + 1],
            ..Default::default()
        };
        let mut expected = vec![ExpectedChild {
            page_id: self.root,
            key: None,
        }];
        for level in (0..=root_level).rev() {
            let children = self.validate_level(mtr, level, &expected, &mut stats, issues)?;
            match children {
                Some(children) => expected = children,
                None => return Ok(None),
            }
        }
        Ok(Some(stats))
    }

    /// Checks one level. Returns the node pointers found on it, or `None`
    /// when the level cannot be walked.
    fn validate_level(
        &self,
        mtr: &mut Mtr,
        level: usize,
        expected: &[ExpectedChild],
        stats: &mut BTreeStatistics,
        issues: &mut Vec<String>,
    ) -> StorageResult<Option<Vec<ExpectedChild>>> {
        let n_uniq = self.index.n_uniq;
        let limit = self.ctx.space.n_used_pages() + 1;
        let mut children = Vec::new();
        let mut prev: Option<BlockId> = None;
        let mut next = expected.first().map(|e| e.page_id);
        let mut visited = 0;

        while let Some(page_id) = next {
            if visited == limit {
                issues.push(format!("level {} does not terminate", level));
                break;
            }
            let block = mtr.get_page(page_id, LatchKind::S)?;
            let page = mtr.page(block);
            if let Err(e) = self.check_index_page(page, Some(level)) {
                issues.push(e.to_string());
                if let Some(p) = prev {
                    mtr.release_page(p);
                }
                mtr.release_page(block);
                return Ok(None);
            }
            if let Err(e) = page.validate_page() {
                issues.push(e.to_string());
            }
            let prev_id = prev.map(|p| mtr.page_id(p));
            if page.prev() != prev_id {
                issues.push(format!(
                    "page {} links back to {:?}, expected {:?}",
                    page_id,
                    page.prev(),
                    prev_id
                ));
            }
            if page_id != self.root && page.n_recs() == 0 {
                issues.push(format!("page {} is empty", page_id));
            }

            let recs = page.user_recs();
            for pair in recs.windows(2) {
                if page.rec_is_min_rec(pair[0]) {
                    continue;
                }
                if cmp_rec_rec(page, pair[0], page, pair[1], n_uniq) != Ordering::Less {
                    issues.push(format!(
                        "page {}: records {} and {} out of order",
                        page_id, pair[0], pair[1]
                    ));
                }
            }
            for (i, &rec) in recs.iter().enumerate() {
                let want_min = !page.is_leaf() && i == 0 && prev.is_none();
                if page.rec_is_min_rec(rec) != want_min {
                    issues.push(format!(
                        "page {}: record {} has MIN_REC {}, expected {}",
                        page_id,
                        rec,
                        page.rec_is_min_rec(rec),
                        want_min
                    ));
                }
            }

            match expected.get(visited) {
                Some(e) if e.page_id == page_id => {
                    if let (Some(key), Some(&first)) = (&e.key, recs.first()) {
                        if cmp_tuple_rec(key, page, first) == Ordering::Greater {
                            issues.push(format!(
                                "node pointer to page {} is above its first record",
                                page_id
                            ));
                        }
                    }
                    if let (Some(key), Some(p)) = (&e.key, prev) {
                        let left = mtr.page(p);
                        if let Some(last) = left.last_user_rec() {
                            if cmp_tuple_rec(key, left, last) != Ordering::Greater {
                                issues.push(format!(
                                    "node pointer to page {} does not exceed page {}",
                                    page_id,
                                    left.page_id()
                                ));
                            }
                        }
                    }
                }
                other => issues.push(format!(
                    "page {} reached on level {}, node pointer leads to {:?}",
                    page_id,
                    level,
                    other.map(|e| e.page_id)
                )),
            }
            if let (Some(p), Some(&first)) = (prev, recs.first()) {
                let left = mtr.page(p);
                if let Some(last) = left.last_user_rec().filter(|&r| !left.rec_is_min_rec(r)) {
                    if cmp_rec_rec(left, last, page, first, n_uniq) != Ordering::Less {
                        issues.push(format!(
                            "pages {} and {} overlap",
                            left.page_id(),
                            page_id
                        ));
                    }
                }
            }

            if page.is_leaf() {
                stats.n_leaf_pages += 1;
                stats.n_records += page.n_recs();
                stats.data_bytes += page.data_size();
            } else {
                for &rec in &recs {
                    match page.rec_child(rec) {
                        Some(child) => children.push(ExpectedChild {
                            page_id: child,
                            key: (!page.rec_is_min_rec(rec)).then(|| self.node_key(page, rec)),
                        }),
                        None => issues.push(format!(
                            "page {}: node pointer {} has no child",
                            page_id, rec
                        )),
                    }
                }
            }
            stats.n_pages += 1;
            stats.pages_per_level[level] += 1;
            visited += 1;
            next = page.next();

            if let Some(p) = prev.replace(block) {
                mtr.release_page(p);
            }
        }
        if let Some(p) = prev {
            mtr.release_page(p);
        }
        if visited != expected.len() {
            issues.push(format!(
                "level {} has {} pages, the level above points to {}",
                level,
                visited,
                expected.len()
            ));
        }
        Ok(Some(children))
    }

    /// Every tree page is owned by the right segment and nothing else is.
    fn validate_segments(&self, stats: &BTreeStatistics, issues: &mut Vec<String>) {
        let leaf_pages = self.ctx.space.segment_pages(self.seg_leaf).len();
        let top_pages = self.ctx.space.segment_pages(self.seg_top).len();
        let (want_leaf, want_top) = if stats.height == 1 {
            (0, 1)
        } else {
            (stats.n_leaf_pages, stats.n_pages - stats.n_leaf_pages)
        };
        if leaf_pages != want_leaf || top_pages != want_top {
            issues.push(format!(
                "segments hold {} leaf and {} non-leaf pages, tree has {} and {}",
                leaf_pages, top_pages, want_leaf, want_top
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::key::IndexDef;
    use super::super::test_util::*;
    use super::*;
    use crate::access::value::encode_u64;

    #[test]
    fn test_statistics_of_small_tree() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        let stats = tree.validate()?;
        assert_eq!(stats.height, 1);
        assert_eq!(stats.n_pages, 1);
        assert_eq!(stats.n_records, 0);
        assert_eq!(stats.leaf_fill_pct(), 0);

        for k in 0..10 {
            tree.insert(&row(k, 20))?;
        }
        let stats = tree.validate()?;
        assert_eq!(stats.n_records, 10);
        assert_eq!(stats.pages_per_level, vec![1]);
        assert!(stats.data_bytes > 10 * 28);
        Ok(())
    }

    #[test]
    fn test_levels_add_up() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        for k in 0..3000 {
            tree.insert(&row(k, 200))?;
        }
        let stats = tree.validate()?;
        assert_eq!(stats.pages_per_level.len(), stats.height);
        assert_eq!(stats.pages_per_level.iter().sum::<usize>(), stats.n_pages);
        assert_eq!(stats.pages_per_level[0], stats.n_leaf_pages);
        assert_eq!(*stats.pages_per_level.last().unwrap(), 1);
        Ok(())
    }

    #[test]
    fn test_detects_out_of_order_records() -> StorageResult<()> {
        let ctx = context();
        let tree = BTree::create(ctx.clone(), IndexDef::clustered(1, "pk", 1, 2))?;
        for k in 0..3 {
            tree.insert(&row(k * 10, 20))?;
        }
        {
            let mut guard = ctx.pool.get_page(tree.root_page_id(), LatchKind::X)?;
            let page = guard.page_mut().unwrap();
            let last = page.last_user_rec().unwrap();
            let big = encode_u64(5);
            // overwrite the key bytes of the last record in place
            let start = page.rec_field(last, 0).unwrap().as_ptr() as usize
                - page.as_bytes().as_ptr() as usize;
            page.write_bytes(start, &big);
        }
        let err = tree.validate().unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("out of order"), "{}", err);
        Ok(())
    }
}

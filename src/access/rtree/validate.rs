//! Spatial index consistency check.

use super::mbr::{union_all, Mbr};
use super::RTree;
use crate::access::btree::validate::BTreeStatistics;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mtr::Mtr;
use crate::storage::page::record::cmp_rec_rec;
use crate::storage::page::PageId;
use log::warn;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Pages expected on a level, with the MBR of the pointer leading there.
type Expected = HashMap<PageId, Option<Mbr>>;

impl RTree {
    /// Walks every level and checks sibling links, leaf order, that each
    /// node pointer MBR covers its child, and that every pointed-to page is
    /// on the level exactly once.
    pub fn validate(&self) -> StorageResult<BTreeStatistics> {
        let mut mtr = self.base.start_mtr();
        mtr.sx_lock_index(self.base.lock());
        let mut issues = Vec::new();
        let stats = self.validate_levels(&mut mtr, &mut issues)?;
        mtr.commit()?;

        if let Some(stats) = &stats {
            self.validate_segments(stats, &mut issues);
            if stats.n_records as u64 != self.n_rows() {
                issues.push(format!(
                    "{} leaf entries, row count says {}",
                    stats.n_records,
                    self.n_rows()
                ));
            }
        }
        if !issues.is_empty() {
            let name = &self.index().name;
            for issue in &issues {
                warn!("spatial index {}: {}", name, issue);
            }
            return Err(StorageError::tree_corruption(format!(
                "spatial index {}: {} problem(s), first: {}",
                name,
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
        let root_id = self.root_page_id();
        let root = mtr.get_page(root_id, LatchKind::S)?;
        let page = mtr.page(root);
        if !self.base.is_live_page(page) {
            issues.push(format!("root {} is not a page of this index", root_id));
            return Ok(None);
        }
        if page.prev().is_some() || page.next().is_some() {
            issues.push(format!("root {} has siblings", root_id));
        }
        let root_level = page.level();
        mtr.release_page(root);

        let mut stats = BTreeStatistics {
            height: root_level + 1,
            pages_per_level: vec![0; root_level + 1],
            ..Default::default()
        };
        let mut expected = Expected::from([(root_id, None)]);
        for level in (0..=root_level).rev() {
            match self.validate_level(mtr, level, &expected, &mut stats, issues)? {
                Some(children) => expected = children,
                None => return Ok(None),
            }
        }
        Ok(Some(stats))
    }

    /// Leftmost page of the level holding `start`.
    fn leftmost_on_level(
        &self,
        mtr: &mut Mtr,
        start: PageId,
        level: usize,
        issues: &mut Vec<String>,
    ) -> StorageResult<Option<PageId>> {
        let limit = self.base.context().space.n_used_pages() + 1;
        let mut page_id = start;
        for _ in 0..limit {
            let block = mtr.get_page(page_id, LatchKind::S)?;
            let page = mtr.page(block);
            if let Err(e) = self.base.check_index_page(page, Some(level)) {
                issues.push(e.to_string());
                mtr.release_page(block);
                return Ok(None);
            }
            let prev = page.prev();
            mtr.release_page(block);
            match prev {
                Some(p) => page_id = p,
                None => return Ok(Some(page_id)),
            }
        }
        issues.push(format!("level {} has a cycle in its back links", level));
        Ok(None)
    }

    fn validate_level(
        &self,
        mtr: &mut Mtr,
        level: usize,
        expected: &Expected,
        stats: &mut BTreeStatistics,
        issues: &mut Vec<String>,
    ) -> StorageResult<Option<Expected>> {
        let root_id = self.root_page_id();
        let Some(&start) = expected.keys().min() else {
            issues.push(format!("level {} has no node pointers", level));
            return Ok(None);
        };
        let Some(first) = self.leftmost_on_level(mtr, start, level, issues)? else {
            return Ok(None);
        };

        let limit = self.base.context().space.n_used_pages() + 1;
        let mut children = Expected::new();
        let mut seen = HashSet::new();
        let mut prev: Option<PageId> = None;
        let mut next = Some(first);

        while let Some(page_id) = next {
            if seen.len() == limit || !seen.insert(page_id) {
                issues.push(format!("level {} does not terminate", level));
                break;
            }
            let block = mtr.get_page(page_id, LatchKind::S)?;
            let page = mtr.page(block);
            if let Err(e) = self.base.check_index_page(page, Some(level)) {
                issues.push(e.to_string());
                mtr.release_page(block);
                return Ok(None);
            }
            if let Err(e) = page.validate_page() {
                issues.push(e.to_string());
            }
            if page.prev() != prev {
                issues.push(format!(
                    "page {} links back to {:?}, expected {:?}",
                    page_id,
                    page.prev(),
                    prev
                ));
            }
            if page_id != root_id && page.n_recs() == 0 {
                issues.push(format!("page {} is empty", page_id));
            }

            let recs = page.user_recs();
            if page.is_leaf() {
                for pair in recs.windows(2) {
                    if cmp_rec_rec(page, pair[0], page, pair[1], 2) != Ordering::Less {
                        issues.push(format!(
                            "page {}: records {} and {} out of order",
                            page_id, pair[0], pair[1]
                        ));
                    }
                }
            }
            let mut mbrs = Vec::with_capacity(recs.len());
            for &rec in &recs {
                match Self::rec_mbr(page, rec) {
                    Ok(mbr) => {
                        if !page.is_leaf() {
                            match page.rec_child(rec) {
                                Some(child) => {
                                    if children.insert(child, Some(mbr)).is_some() {
                                        issues.push(format!(
                                            "page {}: second node pointer to page {}",
                                            page_id, child
                                        ));
                                    }
                                }
                                None => issues.push(format!(
                                    "page {}: node pointer {} has no child",
                                    page_id, rec
                                )),
                            }
                        }
                        mbrs.push(mbr);
                    }
                    Err(e) => issues.push(e.to_string()),
                }
            }

            match expected.get(&page_id) {
                Some(Some(ptr_mbr)) => {
                    if let Some(covered) = union_all(mbrs.iter()) {
                        if !ptr_mbr.contains(&covered) {
                            issues.push(format!(
                                "node pointer MBR {:?} does not cover page {} ({:?})",
                                ptr_mbr, page_id, covered
                            ));
                        }
                    }
                }
                Some(None) => {}
                None => issues.push(format!(
                    "page {} on level {} has no node pointer",
                    page_id, level
                )),
            }

            if page.is_leaf() {
                stats.n_leaf_pages += 1;
                stats.n_records += page.n_recs();
                stats.data_bytes += page.data_size();
            }
            stats.n_pages += 1;
            stats.pages_per_level[level] += 1;
            prev = Some(page_id);
            next = page.next();
            mtr.release_page(block);
        }

        let missing = expected.keys().filter(|id| !seen.contains(*id)).count();
        if missing > 0 {
            issues.push(format!(
                "level {}: {} page(s) pointed to from above are not linked in",
                level, missing
            ));
        }
        Ok(Some(children))
    }

    fn validate_segments(&self, stats: &BTreeStatistics, issues: &mut Vec<String>) {
        let space = &self.base.context().space;
        let (seg_leaf, seg_top) = self.base.segments();
        let leaf_pages = space.segment_pages(seg_leaf).len();
        let top_pages = space.segment_pages(seg_top).len();
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

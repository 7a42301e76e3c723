use super::latch::BtrLatchMode;
use super::BTree;
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mtr::{BlockId, Mtr, TreeLatchMode};
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::index_page::PAGE_SUPREMUM;
use crate::storage::page::record::{cmp_tuple_rec_with_match, RecMatch};
use crate::storage::page::PageId;

/// One node pointer followed on the way down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    pub page_id: PageId,
    pub rec: usize,
    pub level: usize,
}

/// Position reached by a tree descent
#[derive(Debug, Clone)]
pub struct BtrCursor {
    pub block: BlockId,
    pub page_id: PageId,
    /// Record the cursor is on; may be infimum or supremum
    pub rec: usize,
    pub low_match: RecMatch,
    pub up_match: RecMatch,
    /// Node pointers followed from the root, root first
    pub path: Vec<PathStep>,
}

/// The node pointer that refers to a page.
#[derive(Debug, Clone, Copy)]
pub struct FatherCursor {
    pub block: BlockId,
    pub page_id: PageId,
    pub rec: usize,
}

/// Mode used on the levels above the target level.
fn upper_mode(mode: PageCurMode) -> PageCurMode {
    match mode {
        PageCurMode::GE | PageCurMode::L => PageCurMode::L,
        PageCurMode::G | PageCurMode::LE => PageCurMode::LE,
    }
}

impl BTree {
    /// Descends from the root to `level` and positions on `tuple` per `mode`.
    ///
    /// Takes the tree lock `latch_mode` asks for; leaf modes release it again
    /// before returning, leaving only the target page latched, unless the
    /// caller already held tree S.
    pub(crate) fn search_to_nth_level(
        &self,
        mtr: &mut Mtr,
        tuple: &Tuple,
        level: usize,
        mode: PageCurMode,
        latch_mode: BtrLatchMode,
    ) -> StorageResult<BtrCursor> {
        // a leaf descent by a caller already holding tree S keeps that lock
        let mut took_s = false;
        match latch_mode {
            BtrLatchMode::SearchLeaf | BtrLatchMode::ModifyLeaf => {
                if !mtr.memo_contains_tree(&self.lock, TreeLatchMode::S) {
                    mtr.s_lock_index(&self.lock);
                    took_s = true;
                }
            }
            BtrLatchMode::ModifyTree => mtr.x_lock_index(&self.lock),
            BtrLatchMode::ContModifyTree => {
                if !mtr.memo_contains_tree(&self.lock, TreeLatchMode::X) {
                    return Err(StorageError::tree_corruption(format!(
                        "index {}: continued tree modification without the tree lock",
                        self.index.name
                    )));
                }
            }
        }
        let result = self.descend(mtr, tuple, level, mode, latch_mode);
        if took_s {
            mtr.release_index(&self.lock);
        }
        result
    }

    fn latch_root(
        &self,
        mtr: &mut Mtr,
        level: usize,
        latch_mode: BtrLatchMode,
    ) -> StorageResult<BlockId> {
        let kind = latch_mode.upper_latch();
        let block = mtr.get_page(self.root, kind)?;
        if kind == LatchKind::S
            && latch_mode.target_latch() == LatchKind::X
            && mtr.page(block).level() == level
        {
            // the root is the target; the tree lock keeps its level stable
            mtr.release_page(block);
            return mtr.get_page(self.root, LatchKind::X);
        }
        Ok(block)
    }

    fn descend(
        &self,
        mtr: &mut Mtr,
        tuple: &Tuple,
        level: usize,
        mode: PageCurMode,
        latch_mode: BtrLatchMode,
    ) -> StorageResult<BtrCursor> {
        let mut block = self.latch_root(mtr, level, latch_mode)?;
        let mut page_id = self.root;
        let mut expected_level: Option<usize> = None;
        let mut path = Vec::new();

        for _ in 0..super::BTR_MAX_LEVELS {
            let page = mtr.page(block);
            self.check_index_page(page, expected_level)?;
            let page_level = page.level();
            if page_level < level {
                return Err(StorageError::corruption(
                    page_id,
                    format!("level {} requested, tree ends at level {}", level, page_level),
                ));
            }

            if page_level == level {
                let s = page.search_with_match(tuple, mode);
                let mut cursor = BtrCursor {
                    block,
                    page_id,
                    rec: s.rec,
                    low_match: s.low_match,
                    up_match: s.up_match,
                    path,
                };
                let move_right = matches!(mode, PageCurMode::G | PageCurMode::GE)
                    && s.rec == PAGE_SUPREMUM
                    && !latch_mode.modifies_tree();
                if move_right {
                    if let Some(next) = page.next() {
                        self.move_to_next_page(mtr, tuple, &mut cursor, next, latch_mode)?;
                    }
                }
                return Ok(cursor);
            }

            let s = page.search_with_match(tuple, upper_mode(mode));
            let rec = if page.rec_is_user(s.rec) {
                s.rec
            } else {
                page.first_user_rec().ok_or_else(|| {
                    StorageError::corruption(page_id, "non-leaf page without records")
                })?
            };
            let child = page
                .rec_child(rec)
                .ok_or_else(|| StorageError::corruption(page_id, "node pointer without child"))?;
            path.push(PathStep {
                page_id,
                rec,
                level: page_level,
            });

            let kind = if page_level - 1 == level {
                latch_mode.target_latch()
            } else {
                latch_mode.upper_latch()
            };
            let child_block = mtr.get_page(child, kind)?;
            if !latch_mode.modifies_tree() {
                mtr.release_page(block);
            }
            block = child_block;
            page_id = child;
            expected_level = Some(page_level - 1);
        }
        Err(StorageError::corruption(
            self.root,
            format!("descent deeper than {} levels", super::BTR_MAX_LEVELS),
        ))
    }

    /// Continues a G/GE search that ended on the supremum on the right
    /// sibling. Runs while the tree S lock is still held.
    fn move_to_next_page(
        &self,
        mtr: &mut Mtr,
        tuple: &Tuple,
        cursor: &mut BtrCursor,
        next: PageId,
        latch_mode: BtrLatchMode,
    ) -> StorageResult<()> {
        let level = mtr.page(cursor.block).level();
        let next_block = mtr.get_page(next, latch_mode.target_latch())?;
        let page = mtr.page(next_block);
        self.check_index_page(page, Some(level))?;
        let mut up_match = RecMatch::default();
        let rec = match page.first_user_rec() {
            Some(rec) => {
                cmp_tuple_rec_with_match(tuple, page, rec, &mut up_match);
                rec
            }
            None => PAGE_SUPREMUM,
        };
        mtr.release_page(cursor.block);
        cursor.block = next_block;
        cursor.page_id = next;
        cursor.rec = rec;
        cursor.up_match = up_match;
        Ok(())
    }

    /// Finds the node pointer to the page in `block`. Requires the tree X
    /// lock; the father page is X-latched.
    pub(crate) fn get_father(&self, mtr: &mut Mtr, block: BlockId) -> StorageResult<FatherCursor> {
        let page = mtr.page(block);
        let page_id = mtr.page_id(block);
        if page_id == self.root {
            return Err(StorageError::corruption(page_id, "the root has no father"));
        }
        let level = page.level();
        let first = page
            .first_user_rec()
            .ok_or_else(|| StorageError::corruption(page_id, "empty non-root page"))?;
        let key = self.node_key(page, first);

        let cursor = self.search_to_nth_level(
            mtr,
            &key,
            level + 1,
            PageCurMode::LE,
            BtrLatchMode::ContModifyTree,
        )?;
        let father = mtr.page(cursor.block);
        let rec = if father.rec_is_user(cursor.rec) {
            cursor.rec
        } else {
            father.first_user_rec().unwrap_or(cursor.rec)
        };
        if !father.rec_is_user(rec) || father.rec_child(rec) != Some(page_id) {
            return Err(StorageError::corruption(
                cursor.page_id,
                format!("node pointer to page {} not found at level {}", page_id, level + 1),
            ));
        }
        Ok(FatherCursor {
            block: cursor.block,
            page_id: cursor.page_id,
            rec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::key::IndexDef;
    use super::super::test_util::*;
    use super::*;
    use crate::access::value::decode_u64;

    fn filled_tree(n: u64) -> StorageResult<BTree> {
        let tree = BTree::create(context(), IndexDef::clustered(2, "pk", 1, 2))?;
        for k in 0..n {
            tree.insert(&row(k * 2, 120))?;
        }
        Ok(tree)
    }

    #[test]
    fn test_upper_modes() {
        assert_eq!(upper_mode(PageCurMode::GE), PageCurMode::L);
        assert_eq!(upper_mode(PageCurMode::G), PageCurMode::LE);
        assert_eq!(upper_mode(PageCurMode::LE), PageCurMode::LE);
    }

    #[test]
    fn test_leaf_search_releases_path() -> StorageResult<()> {
        let tree = filled_tree(600)?;
        assert!(tree.height()? >= 2);
        let mut mtr = tree.start_mtr();
        let cursor = tree.search_to_nth_level(
            &mut mtr,
            &key(301),
            0,
            PageCurMode::GE,
            BtrLatchMode::SearchLeaf,
        )?;
        assert_eq!(mtr.n_pages_latched(), 1);
        assert!(!mtr.memo_contains_tree(&tree.lock, TreeLatchMode::S));
        let page = mtr.page(cursor.block);
        assert_eq!(decode_u64(page.rec_field(cursor.rec, 0).unwrap()), 302);
        assert_eq!(cursor.path.len(), tree.height()? - 1);
        mtr.commit()?;
        Ok(())
    }

    #[test]
    fn test_leaf_search_keeps_callers_tree_lock() -> StorageResult<()> {
        let tree = filled_tree(600)?;
        let mut mtr = tree.start_mtr();
        mtr.s_lock_index(&tree.lock);
        let mode = BtrLatchMode::SearchLeaf;
        tree.search_to_nth_level(&mut mtr, &key(301), 0, PageCurMode::GE, mode)?;
        assert!(mtr.memo_contains_tree(&tree.lock, TreeLatchMode::S));
        mtr.commit()?;
        Ok(())
    }

    #[test]
    fn test_ge_search_moves_right_past_page_end() -> StorageResult<()> {
        let tree = filled_tree(600)?;
        // every first key of a non-leftmost leaf is reached through its left
        // neighbour's supremum when searching just below it
        let mut mtr = tree.start_mtr();
        let cursor = tree.search_to_nth_level(
            &mut mtr,
            &key(0),
            0,
            PageCurMode::GE,
            BtrLatchMode::SearchLeaf,
        )?;
        let mut next = mtr.page(cursor.block).next();
        mtr.commit()?;
        while let Some(page_id) = next {
            let guard = tree.context().pool.get_page(page_id, LatchKind::S)?;
            let first = guard.page().first_user_rec().unwrap();
            let k = decode_u64(guard.page().rec_field(first, 0).unwrap());
            next = guard.page().next();
            drop(guard);

            let found = tree.get(&key(k))?.unwrap();
            assert_eq!(decode_u64(found.field(0).unwrap()), k);
            let mut mtr = tree.start_mtr();
            let cursor = tree.search_to_nth_level(
                &mut mtr,
                &key(k - 1),
                0,
                PageCurMode::GE,
                BtrLatchMode::SearchLeaf,
            )?;
            let page = mtr.page(cursor.block);
            assert_eq!(decode_u64(page.rec_field(cursor.rec, 0).unwrap()), k);
            mtr.commit()?;
        }
        Ok(())
    }

    #[test]
    fn test_cont_modify_tree_needs_tree_lock() -> StorageResult<()> {
        let tree = filled_tree(10)?;
        let mut mtr = tree.start_mtr();
        let result = tree.search_to_nth_level(
            &mut mtr,
            &key(1),
            0,
            PageCurMode::LE,
            BtrLatchMode::ContModifyTree,
        );
        assert!(matches!(result, Err(e) if e.is_corruption()));
        Ok(())
    }

    #[test]
    fn test_get_father_finds_node_pointer() -> StorageResult<()> {
        let tree = filled_tree(600)?;
        let mut mtr = tree.start_mtr();
        let cursor = tree.search_to_nth_level(
            &mut mtr,
            &key(500),
            0,
            PageCurMode::LE,
            BtrLatchMode::ModifyTree,
        )?;
        let father = tree.get_father(&mut mtr, cursor.block)?;
        let step = cursor.path.last().copied().unwrap();
        assert_eq!(father.page_id, step.page_id);
        assert_eq!(
            mtr.page(father.block).rec_child(father.rec),
            Some(cursor.page_id)
        );
        mtr.commit()?;
        Ok(())
    }
}

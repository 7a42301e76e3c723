//! Record deletion.

use super::latch::BtrLatchMode;
use super::smo::{TreeOp, TreeOps};
use super::{BTree, TreeCounters};
use crate::access::tuple::Tuple;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::PageBuf;

impl BTree {
    /// Deletes the record with unique key `key`. Returns whether it existed.
    pub fn delete(&self, key: &Tuple) -> StorageResult<bool> {
        self.index.check_key(key)?;
        if key.n_fields() != self.index.n_uniq {
            return Err(StorageError::InvalidTuple(format!(
                "delete on index {} needs {} key fields, got {}",
                self.index.name,
                self.index.n_uniq,
                key.n_fields()
            )));
        }
        if let Some(found) = self.delete_optimistic(key)? {
            return Ok(found);
        }
        self.delete_pessimistic(key)
    }

    /// Whether removing `rec` keeps the page out of merge territory.
    fn can_delete_without_compress(&self, page: &PageBuf, rec: usize, is_root: bool) -> bool {
        if is_root {
            return true;
        }
        page.n_recs() >= 2
            && page.has_siblings()
            && page.data_size() - page.rec_size(rec) >= self.compress_limit()
    }

    /// Deletes under the leaf latch only. `None` means the delete needs the
    /// tree lock.
    fn delete_optimistic(&self, key: &Tuple) -> StorageResult<Option<bool>> {
        let mut mtr = self.start_mtr();
        let cursor =
            self.search_to_nth_level(&mut mtr, key, 0, PageCurMode::LE, BtrLatchMode::ModifyLeaf)?;
        let page = mtr.page(cursor.block);
        if !page.rec_is_user(cursor.rec) || cursor.low_match.fields < self.index.n_uniq {
            mtr.commit()?;
            return Ok(Some(false));
        }
        if !self.can_delete_without_compress(page, cursor.rec, cursor.page_id == self.root) {
            mtr.commit()?;
            return Ok(None);
        }

        let page = mtr.page_mut(cursor.block);
        self.ctx.ahi.update_on_delete(page, cursor.rec);
        page.delete_rec(cursor.rec)?;
        if !page.zip_compress() {
            page.zip_restore()?;
            mtr.commit()?;
            return Ok(None);
        }
        mtr.commit()?;
        TreeCounters::bump(&self.counters.optimistic_deletes);
        Ok(Some(true))
    }

    fn delete_pessimistic(&self, key: &Tuple) -> StorageResult<bool> {
        let mut mtr = self.start_mtr();
        let cursor =
            self.search_to_nth_level(&mut mtr, key, 0, PageCurMode::LE, BtrLatchMode::ModifyTree)?;
        let page = mtr.page(cursor.block);
        if !page.rec_is_user(cursor.rec) || cursor.low_match.fields < self.index.n_uniq {
            mtr.commit()?;
            return Ok(false);
        }
        let is_root = cursor.page_id == self.root;
        let single = page.n_recs() == 1;
        let height = cursor.path.len() + 1;
        let mut reservation = self.reserve_for_delete(height)?;

        let mut ops = TreeOps::new();
        if !is_root && single {
            ops.push(TreeOp::Discard {
                page: cursor.page_id,
            })?;
        } else {
            self.delete_and_recompress(&mut mtr, cursor.block, cursor.rec)?;
            if !is_root {
                ops.push(TreeOp::CompressIfUseful {
                    page: cursor.page_id,
                })?;
            }
        }
        self.run_tree_ops(&mut mtr, &mut ops, &mut reservation)?;
        mtr.commit()?;
        TreeCounters::bump(&self.counters.pessimistic_deletes);
        Ok(true)
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
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;

    fn keys_of(tree: &BTree) -> StorageResult<Vec<u64>> {
        tree.scan()
            .map(|r| r.map(|t| decode_u64(t.field(0).unwrap())))
            .collect()
    }

    #[test]
    fn test_delete_missing_key() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        tree.insert(&row(5, 10))?;
        assert!(!tree.delete(&key(4))?);
        assert!(tree.delete(&key(5))?);
        assert!(!tree.delete(&key(5))?);
        assert!(tree.delete(&Tuple::from_slices(&[])).is_err());
        Ok(())
    }

    #[test]
    fn test_random_deletes_keep_tree_valid() -> StorageResult<()> {
        let ctx = context();
        let tree = BTree::create(ctx.clone(), IndexDef::clustered(1, "pk", 1, 2))?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let mut keys: Vec<u64> = (0..4000).collect();
        keys.shuffle(&mut rng);
        for &k in &keys {
            tree.insert(&row(k, 90))?;
        }
        let pages_full = ctx.space.n_used_pages();

        keys.shuffle(&mut rng);
        let (gone, kept) = keys.split_at(3000);
        for (i, &k) in gone.iter().enumerate() {
            assert!(tree.delete(&key(k))?);
            if i % 500 == 0 {
                tree.validate()?;
            }
        }
        let stats = tree.validate()?;
        assert_eq!(stats.n_records, 1000);
        let expected: Vec<u64> = kept
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(keys_of(&tree)?, expected);
        assert!(ctx.space.n_used_pages() < pages_full);
        let counters = tree.counters();
        let shrinks = counters.merges.load(Ordering::Relaxed)
            + counters.discards.load(Ordering::Relaxed);
        assert!(shrinks > 0);
        Ok(())
    }

    #[test]
    fn test_interleaved_inserts_and_deletes() -> StorageResult<()> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let mut present = BTreeSet::new();
        for round in 0..6 {
            let mut batch: Vec<u64> = (0..1500).map(|i| i * 7 + round).collect();
            batch.shuffle(&mut rng);
            for &k in &batch {
                if present.insert(k) {
                    tree.insert(&row(k, 120))?;
                }
            }
            let victims: Vec<u64> =
                present.iter().copied().filter(|k| k % 3 == round % 3).collect();
            for k in victims {
                assert!(tree.delete(&key(k))?);
                present.remove(&k);
            }
            tree.validate()?;
        }
        assert_eq!(keys_of(&tree)?, present.into_iter().collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_compressed_index_deletes() -> StorageResult<()> {
        let tree = BTree::create(
            context(),
            IndexDef::clustered(1, "pk", 1, 2).with_zip(4096),
        )?;
        for k in 0..1200 {
            tree.insert(&row(k, 40))?;
        }
        for k in (0..1200).filter(|k| k % 4 != 0) {
            assert!(tree.delete(&key(k))?);
        }
        let stats = tree.validate()?;
        assert_eq!(stats.n_records, 300);
        Ok(())
    }
}

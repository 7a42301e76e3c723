use super::latch::BtrLatchMode;
use super::BTree;
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::StorageResult;
use crate::storage::page::cursor::PageCurMode;
use crate::storage::page::record::cmp_tuple_rec;
use crate::storage::page::PageBuf;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Bound;

/// State of the iterator
#[derive(Debug)]
enum IterState {
    /// The next batch starts at this bound
    Positioned(Bound<Tuple>),
    /// Iterator has exhausted all entries
    Exhausted,
}

/// Forward range scan over a B-tree.
///
/// Records are read one leaf at a time. No latch is held between batches;
/// each batch descends again from the root starting just after the last
/// key returned, so concurrent splits and merges never invalidate the scan.
pub struct BTreeIterator<'a> {
    tree: &'a BTree,
    /// Current state
    state: IterState,
    /// Upper bound on the key prefix
    end: Bound<Tuple>,
    /// Records read from the current leaf, not yet returned
    buffered: VecDeque<Tuple>,
    /// Statistics
    pages_visited: usize,
    keys_returned: usize,
}

impl<'a> BTreeIterator<'a> {
    pub(crate) fn new(tree: &'a BTree, start: Bound<Tuple>, end: Bound<Tuple>) -> Self {
        Self {
            tree,
            state: IterState::Positioned(start),
            end,
            buffered: VecDeque::new(),
            pages_visited: 0,
            keys_returned: 0,
        }
    }

    /// Whether `rec` lies past the end bound.
    fn past_end(&self, page: &PageBuf, rec: usize) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => cmp_tuple_rec(end, page, rec) == Ordering::Less,
            Bound::Excluded(end) => cmp_tuple_rec(end, page, rec) != Ordering::Greater,
        }
    }

    /// Reads the next leaf's worth of records into the buffer.
    fn fill_batch(&mut self, start: Bound<Tuple>) -> StorageResult<()> {
        let (tuple, mode) = match start {
            Bound::Included(t) => (t, PageCurMode::GE),
            Bound::Excluded(t) => (t, PageCurMode::G),
            Bound::Unbounded => (Tuple::default(), PageCurMode::GE),
        };
        if !self.read_leaves(&tuple, mode, false)? {
            self.read_leaves(&tuple, mode, true)?;
        }
        Ok(())
    }

    /// Collects records from the leaf `tuple` leads to, moving right past
    /// leaves with nothing to return. Moving right needs the tree S lock;
    /// without `hold_tree` this returns `false` instead of moving and the
    /// batch is read again from the root.
    fn read_leaves(
        &mut self,
        tuple: &Tuple,
        mode: PageCurMode,
        hold_tree: bool,
    ) -> StorageResult<bool> {
        let tree = self.tree;
        let mut mtr = tree.start_mtr();
        if hold_tree {
            mtr.s_lock_index(tree.lock());
        }
        let cursor =
            tree.search_to_nth_level(&mut mtr, tuple, 0, mode, BtrLatchMode::SearchLeaf)?;
        let mut block = cursor.block;
        let mut rec = cursor.rec;
        self.pages_visited += 1;

        loop {
            let page = mtr.page(block);
            let mut reached_end = false;
            while page.rec_is_user(rec) {
                if self.past_end(page, rec) {
                    reached_end = true;
                    break;
                }
                self.buffered.push_back(page.rec_to_tuple(rec));
                rec = page.rec_next(rec);
            }
            let next = page.next();

            if reached_end {
                self.state = IterState::Exhausted;
                break;
            }
            match (self.buffered.back(), next) {
                (_, None) => {
                    self.state = IterState::Exhausted;
                    break;
                }
                (Some(last), Some(_)) => {
                    let resume = last.prefix(tree.index.n_uniq);
                    self.state = IterState::Positioned(Bound::Excluded(resume));
                    break;
                }
                (None, Some(_)) if !hold_tree => {
                    mtr.commit()?;
                    return Ok(false);
                }
                (None, Some(next)) => {
                    // tree S keeps merges from latching this pair right to left
                    let next_block = mtr.get_page(next, LatchKind::S)?;
                    tree.check_index_page(mtr.page(next_block), Some(0))?;
                    mtr.release_page(block);
                    block = next_block;
                    rec = mtr.page(block).infimum();
                    rec = mtr.page(block).rec_next(rec);
                    self.pages_visited += 1;
                }
            }
        }
        mtr.commit()?;
        Ok(true)
    }

    /// Pages visited and records returned so far.
    pub fn statistics(&self) -> (usize, usize) {
        (self.pages_visited, self.keys_returned)
    }
}

impl Iterator for BTreeIterator<'_> {
    type Item = StorageResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(tuple) = self.buffered.pop_front() {
                self.keys_returned += 1;
                return Some(Ok(tuple));
            }
            let start = match std::mem::replace(&mut self.state, IterState::Exhausted) {
                IterState::Exhausted => return None,
                IterState::Positioned(start) => start,
            };
            if let Err(e) = self.fill_batch(start) {
                self.state = IterState::Exhausted;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::key::IndexDef;
    use super::super::test_util::*;
    use super::*;
    use crate::access::value::decode_u64;

    fn keys(iter: BTreeIterator<'_>) -> StorageResult<Vec<u64>> {
        iter.map(|r| r.map(|t| decode_u64(t.field(0).unwrap())))
            .collect()
    }

    fn tree_with(n: u64) -> StorageResult<BTree> {
        let tree = BTree::create(context(), IndexDef::clustered(1, "pk", 1, 2))?;
        for k in 0..n {
            tree.insert(&row(k * 10, 150))?;
        }
        Ok(tree)
    }

    #[test]
    fn test_empty_tree_scan() -> StorageResult<()> {
        let tree = tree_with(0)?;
        assert!(keys(tree.scan())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_full_scan_crosses_leaves() -> StorageResult<()> {
        let tree = tree_with(2000)?;
        let mut iter = tree.scan();
        let mut got = Vec::new();
        for r in iter.by_ref() {
            got.push(decode_u64(r?.field(0).unwrap()));
        }
        assert_eq!(got, (0..2000).map(|k| k * 10).collect::<Vec<_>>());
        let (pages, returned) = iter.statistics();
        assert!(pages > 1);
        assert_eq!(returned, 2000);
        Ok(())
    }

    #[test]
    fn test_bounds() -> StorageResult<()> {
        let tree = tree_with(2000)?;
        let got = keys(tree.range(Bound::Included(key(100)), Bound::Included(key(150))))?;
        assert_eq!(got, vec![100, 110, 120, 130, 140, 150]);

        let got = keys(tree.range(Bound::Excluded(key(100)), Bound::Excluded(key(150))))?;
        assert_eq!(got, vec![110, 120, 130, 140]);

        // bounds between stored keys
        let got = keys(tree.range(Bound::Included(key(105)), Bound::Excluded(key(131))))?;
        assert_eq!(got, vec![110, 120, 130]);

        let got = keys(tree.range(Bound::Excluded(key(19_980)), Bound::Unbounded))?;
        assert_eq!(got, vec![19_990]);

        let got = keys(tree.range(Bound::Included(key(50_000)), Bound::Unbounded))?;
        assert!(got.is_empty());
        Ok(())
    }

    #[test]
    fn test_scan_across_emptied_leaves_alongside_deletes() -> StorageResult<()> {
        let tree = tree_with(3000)?;
        // the middle third goes away while scans run; the rest stays put
        let doomed = 1000..2000u64;
        std::thread::scope(|s| -> StorageResult<()> {
            let deleter = s.spawn(|| -> StorageResult<()> {
                for k in doomed.clone() {
                    assert!(tree.delete(&key(k * 10))?);
                }
                Ok(())
            });
            for _ in 0..20 {
                let got = keys(tree.range(Bound::Included(key(9_995)), Bound::Unbounded))?;
                let mut sorted = got.clone();
                sorted.sort_unstable();
                sorted.dedup();
                assert_eq!(got, sorted);
                assert_eq!(got.last(), Some(&29_990));
                assert!(got.contains(&20_000));
            }
            deleter.join().expect("deleter panicked")
        })?;
        let got = keys(tree.range(Bound::Included(key(9_995)), Bound::Unbounded))?;
        assert_eq!(got, (2000..3000).map(|k| k * 10).collect::<Vec<_>>());
        tree.validate()?;
        Ok(())
    }

    #[test]
    fn test_scan_survives_concurrent_splits() -> StorageResult<()> {
        let tree = tree_with(500)?;
        let mut seen = Vec::new();
        let mut iter = tree.scan();
        while let Some(r) = iter.next() {
            let k = decode_u64(r?.field(0).unwrap());
            seen.push(k);
            if k % 100 == 0 && k < 4000 {
                // odd keys land both behind and ahead of the scan position
                for j in 1..40 {
                    tree.insert(&row(k + j * 2 + 1, 150))?;
                }
            }
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seen, sorted);
        assert!(seen.contains(&4990));
        tree.validate()?;
        Ok(())
    }
}

//! R-tree spatial index.
//!
//! Leaf records are `[mbr, payload]`, node pointers `[mbr, child]`. The
//! tree shares page format, segments, the tree lock and page allocation
//! with [`BTree`]; only the record placement differs. Structure changes
//! run under the tree X lock with every page of the insert path latched,
//! readers take the tree S lock one page at a time. Each split stamps the
//! split page with a fresh split sequence number (SSN) so a reader that
//! read the parent before the split also visits the new right sibling.

pub mod delete;
pub mod insert;
pub mod mbr;
pub mod search;
pub mod split;
pub mod validate;

use self::mbr::{union_all, Mbr, DATA_MBR_LEN};
use crate::access::btree::key::IndexDef;
use crate::access::btree::{BTree, IndexContext, TreeCounters};
use crate::access::tuple::Tuple;
use crate::storage::buffer::LatchKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mtr::{BlockId, Mtr};
use crate::storage::page::{PageBuf, PageId};
use log::info;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Structure change reported to the predicate lock layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateEvent {
    Split {
        page: PageId,
        new_page: PageId,
        before: Mbr,
        left: Mbr,
        right: Mbr,
    },
    Merge {
        from: PageId,
        into: PageId,
        before: Option<Mbr>,
        after: Mbr,
    },
    Discard {
        page: PageId,
    },
}

/// Receives page split, merge and discard notifications while the pages
/// involved are still latched.
pub trait PredicateLockHook: Send + Sync {
    fn notify(&self, event: &PredicateEvent);
}

/// One entry of a spatial index.
#[derive(Debug, Clone, PartialEq)]
pub struct RTreeEntry {
    pub mbr: Mbr,
    pub payload: Vec<u8>,
}

/// A non-leaf page passed on the way down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtrPathStep {
    pub page_id: PageId,
    pub level: usize,
}

pub struct RTree {
    base: BTree,
    /// Last split sequence number handed out
    ssn: AtomicU64,
    /// Leaf entries, for range estimates
    n_rows: AtomicU64,
    hook: RwLock<Option<Arc<dyn PredicateLockHook>>>,
}

impl std::fmt::Debug for RTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RTree")
            .field("index", &self.base.index().name)
            .field("root", &self.base.root_page_id())
            .field("n_rows", &self.n_rows())
            .finish()
    }
}

fn check_spatial(index: &IndexDef) -> StorageResult<()> {
    if !index.is_spatial() {
        return Err(StorageError::InvalidIndex(format!(
            "index {} is not spatial",
            index.name
        )));
    }
    Ok(())
}

impl RTree {
    pub fn create(ctx: IndexContext, index: IndexDef) -> StorageResult<Self> {
        check_spatial(&index)?;
        Ok(Self {
            base: BTree::create(ctx, index)?,
            ssn: AtomicU64::new(0),
            n_rows: AtomicU64::new(0),
            hook: RwLock::new(None),
        })
    }

    /// Opens an existing spatial index and recounts its entries.
    pub fn open(ctx: IndexContext, index: IndexDef, root: PageId) -> StorageResult<Self> {
        check_spatial(&index)?;
        let tree = Self {
            base: BTree::open(ctx, index, root)?,
            ssn: AtomicU64::new(0),
            n_rows: AtomicU64::new(0),
            hook: RwLock::new(None),
        };
        let (ssn, rows) = tree.scan_leaf_level()?;
        tree.ssn.store(ssn, Ordering::SeqCst);
        tree.n_rows.store(rows, Ordering::Relaxed);
        info!(
            "opened spatial index {}: {} entries, ssn {}",
            tree.base.index().name,
            rows,
            ssn
        );
        Ok(tree)
    }

    pub fn drop_tree(self) -> StorageResult<bool> {
        self.base.drop_tree()
    }

    pub fn index(&self) -> &IndexDef {
        self.base.index()
    }

    pub fn root_page_id(&self) -> PageId {
        self.base.root_page_id()
    }

    pub fn counters(&self) -> &TreeCounters {
        self.base.counters()
    }

    pub fn height(&self) -> StorageResult<usize> {
        self.base.height()
    }

    pub fn n_rows(&self) -> u64 {
        self.n_rows.load(Ordering::Relaxed)
    }

    pub fn set_predicate_lock_hook(&self, hook: Option<Arc<dyn PredicateLockHook>>) {
        *self.hook.write() = hook;
    }

    fn notify(&self, event: PredicateEvent) {
        if let Some(hook) = self.hook.read().as_ref() {
            hook.notify(&event);
        }
    }

    pub(crate) fn current_ssn(&self) -> u64 {
        self.ssn.load(Ordering::SeqCst)
    }

    /// Hands out a new SSN and records it on the root, which the caller
    /// holds X-latched.
    fn next_ssn(&self, mtr: &mut Mtr) -> StorageResult<u64> {
        let ssn = self.ssn.fetch_add(1, Ordering::SeqCst) + 1;
        let root = mtr.get_page(self.root_page_id(), LatchKind::X)?;
        let page = mtr.page_mut(root);
        if page.ssn() < ssn {
            page.set_ssn(ssn);
        }
        Ok(ssn)
    }

    /// Highest SSN and the entry count, read from the root and leaves.
    fn scan_leaf_level(&self) -> StorageResult<(u64, u64)> {
        let mut mtr = self.base.start_mtr();
        mtr.s_lock_index(self.base.lock());
        let mut block = mtr.get_page(self.root_page_id(), LatchKind::S)?;
        let mut max_ssn = mtr.page(block).ssn();
        while !mtr.page(block).is_leaf() {
            let page = mtr.page(block);
            let first = page.first_user_rec().ok_or_else(|| {
                StorageError::corruption(page.page_id(), "non-leaf page without records")
            })?;
            let child = page.rec_child(first).ok_or_else(|| {
                StorageError::corruption(page.page_id(), "node pointer without child")
            })?;
            let child_block = mtr.get_page(child, LatchKind::S)?;
            mtr.release_page(block);
            block = child_block;
        }
        // walk to the leftmost leaf, then count left to right
        while let Some(prev) = mtr.page(block).prev() {
            mtr.release_page(block);
            block = mtr.get_page(prev, LatchKind::S)?;
        }
        let mut rows = 0;
        loop {
            let page = mtr.page(block);
            rows += page.n_recs() as u64;
            max_ssn = max_ssn.max(page.ssn());
            match page.next() {
                Some(next) => {
                    let next_block = mtr.get_page(next, LatchKind::S)?;
                    mtr.release_page(block);
                    block = next_block;
                }
                None => break,
            }
        }
        mtr.commit()?;
        Ok((max_ssn, rows))
    }

    pub fn leaf_tuple(mbr: &Mbr, payload: &[u8]) -> Tuple {
        Tuple::from_slices(&[&mbr.to_bytes(), payload])
    }

    fn node_ptr_tuple(mbr: &Mbr, child: PageId) -> Tuple {
        Tuple::from_slices(&[&mbr.to_bytes()]).with_child(child)
    }

    /// MBR stored in the first field of a record.
    pub(crate) fn rec_mbr(page: &PageBuf, rec: usize) -> StorageResult<Mbr> {
        let bytes = page.rec_field(rec, 0).unwrap_or(&[]);
        Mbr::from_bytes(bytes).map_err(|_| {
            StorageError::corruption(page.page_id(), format!("record {} has a bad MBR", rec))
        })
    }

    /// Union of the MBRs on a page, `None` when it is empty.
    pub(crate) fn page_mbr(page: &PageBuf) -> StorageResult<Option<Mbr>> {
        let mbrs = page
            .user_recs()
            .into_iter()
            .map(|rec| Self::rec_mbr(page, rec))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(union_all(mbrs.iter()))
    }

    fn rec_entry(page: &PageBuf, rec: usize) -> StorageResult<RTreeEntry> {
        Ok(RTreeEntry {
            mbr: Self::rec_mbr(page, rec)?,
            payload: page.rec_field(rec, 1).map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    /// Node pointer on `parent` that refers to `child`.
    pub(crate) fn find_node_ptr(parent: &PageBuf, child: PageId) -> StorageResult<usize> {
        parent
            .user_recs()
            .into_iter()
            .find(|&rec| parent.rec_child(rec) == Some(child))
            .ok_or_else(|| {
                StorageError::corruption(
                    parent.page_id(),
                    format!("no node pointer to page {}", child),
                )
            })
    }

    /// Sets the MBR of the node pointer to `child` to the child's current
    /// bounding box. Returns whether it changed.
    fn update_node_ptr_mbr(
        &self,
        mtr: &mut Mtr,
        parent: BlockId,
        child: BlockId,
    ) -> StorageResult<bool> {
        let child_id = mtr.page_id(child);
        let mbr = Self::page_mbr(mtr.page(child))?
            .ok_or_else(|| StorageError::corruption(child_id, "empty page keeps a node pointer"))?;
        let rec = Self::find_node_ptr(mtr.page(parent), child_id)?;
        if Self::rec_mbr(mtr.page(parent), rec)? == mbr {
            return Ok(false);
        }
        let page = mtr.page_mut(parent);
        if !page.rec_set_field_in_place(rec, 0, &mbr.to_bytes()) {
            return Err(StorageError::corruption(
                page.page_id(),
                format!("node pointer {} has no {} byte MBR", rec, DATA_MBR_LEN),
            ));
        }
        Ok(true)
    }
}

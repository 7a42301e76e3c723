//! Adaptive hash index.
//!
//! An advisory hash over leaf record prefixes that lets a point lookup skip
//! the tree descent. The index is split into partitions chosen by index id,
//! each behind its own latch. Entries map a fold to a (page, record) location
//! and are maintained as records are inserted and deleted; every guess is
//! checked against the record it lands on before it is trusted, so stale or
//! colliding entries only cost a tree search.
//!
//! Latch order: page latches are taken before a partition latch, never the
//! other way round. The guess path only tries page latches without waiting
//! while it holds a partition latch.

pub mod fold;
pub mod info;
pub mod partition;

use self::fold::{fold_rec, fold_tuple};
use self::info::{HashAdvice, HashParams, LeafSearch, SearchInfo};
use self::partition::{BlockInfo, PartitionInner};
use crate::access::btree::key::IndexDef;
use crate::access::tuple::Tuple;
use crate::config::AhiConfig;
use crate::storage::buffer::{EvictionListener, LatchKind};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::record::{cmp_tuple_rec_with_match, RecMatch};
use crate::storage::page::{PageBuf, PageId};
use crate::storage::BufferPool;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters of the adaptive hash index.
#[derive(Debug, Default)]
pub struct AhiStats {
    pub searches: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub pages_built: AtomicU64,
    pub pages_dropped: AtomicU64,
}

/// Point-in-time copy of [`AhiStats`] plus table occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AhiSnapshot {
    pub enabled: bool,
    pub searches: u64,
    pub hits: u64,
    pub misses: u64,
    pub pages_built: u64,
    pub pages_dropped: u64,
    pub entries: usize,
    pub pages_indexed: usize,
}

pub struct AdaptiveHashIndex {
    config: AhiConfig,
    enabled: AtomicBool,
    /// Bumped by every disable; search statistics of an older epoch are stale.
    epoch: AtomicU64,
    /// Serializes enable/disable.
    state_lock: Mutex<()>,
    partitions: Vec<RwLock<PartitionInner>>,
    stats: AhiStats,
}

impl std::fmt::Debug for AdaptiveHashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveHashIndex")
            .field("enabled", &self.is_enabled())
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl AdaptiveHashIndex {
    pub fn new(config: &AhiConfig) -> Self {
        let n = config.partitions.max(1);
        let partitions = (0..n)
            .map(|_| RwLock::new(PartitionInner::new(config.cells_per_partition)))
            .collect();
        Self {
            config: config.clone(),
            enabled: AtomicBool::new(config.enabled),
            epoch: AtomicU64::new(0),
            state_lock: Mutex::new(()),
            partitions,
            stats: AhiStats::default(),
        }
    }

    pub fn config(&self) -> &AhiConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn partition(&self, index_id: u64) -> &RwLock<PartitionInner> {
        &self.partitions[(index_id % self.partitions.len() as u64) as usize]
    }

    pub fn stats(&self) -> &AhiStats {
        &self.stats
    }

    pub fn snapshot(&self) -> AhiSnapshot {
        let (entries, pages_indexed) = self.partitions.iter().fold((0, 0), |(e, p), part| {
            let part = part.read();
            (e + part.table.len(), p + part.blocks.len())
        });
        AhiSnapshot {
            enabled: self.is_enabled(),
            searches: self.stats.searches.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            pages_built: self.stats.pages_built.load(Ordering::Relaxed),
            pages_dropped: self.stats.pages_dropped.load(Ordering::Relaxed),
            entries,
            pages_indexed,
        }
    }

    /// Drops every entry and stops hashing until [`enable`](Self::enable).
    pub fn disable(&self) {
        let _state = self.state_lock.lock();
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        // every partition is latched at once, nobody can observe a half-cleared index
        let mut guards: Vec<_> = self.partitions.iter().map(|p| p.write()).collect();
        let dropped: usize = guards.iter().map(|g| g.table.len()).sum();
        for guard in guards.iter_mut() {
            guard.clear();
        }
        info!("adaptive hash index disabled, {} entries dropped", dropped);
    }

    /// Re-enables hashing. The index starts empty and is rebuilt on demand.
    pub fn enable(&self) {
        let _state = self.state_lock.lock();
        if !self.enabled.swap(true, Ordering::AcqRel) {
            info!("adaptive hash index enabled");
        }
    }

    /// Parameters `page` is hashed with, if it is.
    pub fn page_params(&self, page: &PageBuf) -> Option<HashParams> {
        if !page.is_index_page() {
            return None;
        }
        let part = self.partition(page.index_id()).read();
        part.blocks
            .get(&page.page_id())
            .filter(|b| b.index_id == page.index_id())
            .map(|b| b.params)
    }

    /// Looks `tuple` up without descending the tree.
    ///
    /// Only full-key lookups are hashed. The returned record is a copy taken
    /// under the page S latch after checking that it still belongs to the
    /// index and equals the key.
    pub fn guess_on_hash(
        &self,
        pool: &BufferPool,
        index: &IndexDef,
        info: &SearchInfo,
        tuple: &Tuple,
    ) -> Option<Tuple> {
        if !self.is_enabled() || tuple.n_fields() != index.n_uniq {
            return None;
        }
        info.sync_epoch(self.epoch());
        let params = info.guess_params()?;
        if params.n_fields + usize::from(params.n_bytes > 0) > tuple.n_fields() {
            return None;
        }
        self.stats.searches.fetch_add(1, Ordering::Relaxed);
        let fold = fold_tuple(tuple, params, index.id);

        let guard = {
            let part = self.partition(index.id).read();
            let found = part.table.lookup(fold).and_then(|(page_id, rec)| {
                let hashed_as = part.blocks.get(&page_id)?;
                (hashed_as.index_id == index.id).then_some((page_id, rec))
            });
            // never wait for a page latch while holding the partition latch
            found.and_then(|(page_id, rec)| {
                pool.try_get_page(page_id, LatchKind::S).map(|g| (g, rec))
            })
        };

        let hit = guard.and_then(|(guard, rec)| {
            let page = guard.page();
            if !page.is_index_page()
                || page.index_id() != index.id
                || !page.is_leaf()
                || !page.rec_is_sane(rec, page.heap_top())
            {
                return None;
            }
            let mut matched = RecMatch::default();
            let ord = cmp_tuple_rec_with_match(tuple, page, rec, &mut matched);
            (ord == CmpOrdering::Equal && matched.fields >= index.n_uniq)
                .then(|| page.rec_to_tuple(rec))
        });

        info.record_guess(hit.is_some(), self.config.build_limit);
        if hit.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            trace!("hash guess for index {} missed", index.name);
        }
        hit
    }

    /// Feeds a finished leaf search into `info` and acts on its advice. The
    /// caller holds a latch on `page`.
    pub fn info_update(
        &self,
        info: &SearchInfo,
        index: &IndexDef,
        page: &PageBuf,
        rec: usize,
        search: &LeafSearch,
    ) {
        if !self.is_enabled() || index.is_spatial() {
            return;
        }
        info.sync_epoch(self.epoch());
        let hashed = self.page_params(page);
        match info.update(&self.config, index.n_uniq, search, hashed) {
            HashAdvice::Nothing => {}
            HashAdvice::Build(params) => self.build_page_hash_index(page, params),
            HashAdvice::UpdateRef(params) => self.update_hash_ref(page, rec, params),
        }
    }

    /// Adds the entry for one record of an already hashed page.
    fn update_hash_ref(&self, page: &PageBuf, rec: usize, params: HashParams) {
        if !page.rec_is_user(rec) {
            return;
        }
        let fold = fold_rec(page, rec, params, page.index_id());
        let mut part = self.partition(page.index_id()).write();
        if !self.is_enabled() {
            return;
        }
        match part.blocks.get(&page.page_id()) {
            Some(b) if b.params == params && b.index_id == page.index_id() => {}
            _ => return,
        }
        part.insert_for_fold(fold, page.page_id(), rec);
    }

    /// Hashes every user record of a leaf page. The caller holds a latch on
    /// the page.
    pub fn build_page_hash_index(&self, page: &PageBuf, params: HashParams) {
        if !self.is_enabled() || !page.is_leaf() || page.n_recs() == 0 {
            return;
        }
        let index_id = page.index_id();
        let page_id = page.page_id();
        if let Some(current) = self.page_params(page) {
            if current == params {
                return;
            }
            self.drop_page_hash_index(page);
        }

        let recs = page.user_recs();
        let mut entries: Vec<(u32, usize)> = Vec::with_capacity(recs.len());
        for rec in recs {
            let fold = fold_rec(page, rec, params, index_id);
            match entries.last_mut() {
                Some(last) if last.0 == fold => {
                    if !params.left_side {
                        last.1 = rec;
                    }
                }
                _ => entries.push((fold, rec)),
            }
        }

        let mut part = self.partition(index_id).write();
        if !self.is_enabled() {
            return;
        }
        if let Some(existing) = part.blocks.get(&page_id) {
            // another search hashed the page meanwhile
            if existing.params != params || existing.index_id != index_id {
                trace!("page {} hashed concurrently, build abandoned", page_id);
            }
            return;
        }
        part.blocks.insert(
            page_id,
            BlockInfo {
                index_id,
                params,
                n_pointers: 0,
            },
        );
        for &(fold, rec) in &entries {
            part.insert_for_fold(fold, page_id, rec);
        }
        self.stats.pages_built.fetch_add(1, Ordering::Relaxed);
        debug!(
            "hashed page {} of index {}: {} entries, {} fields {} bytes",
            page_id,
            index_id,
            entries.len(),
            params.n_fields,
            params.n_bytes
        );
    }

    /// Removes every entry pointing into `page`. A no-op for pages that are
    /// not hashed. Must precede any change that moves records on the page or
    /// gives the frame another identity.
    pub fn drop_page_hash_index(&self, page: &PageBuf) {
        if !page.is_index_page() {
            return;
        }
        let index_id = page.index_id();
        let page_id = page.page_id();
        let params = {
            let part = self.partition(index_id).read();
            match part.blocks.get(&page_id) {
                Some(b) => b.params,
                None => return,
            }
        };
        let folds: Vec<u32> = page
            .user_recs()
            .into_iter()
            .map(|rec| fold_rec(page, rec, params, index_id))
            .collect();

        let mut part = self.partition(index_id).write();
        for fold in folds {
            part.remove_for_fold(fold, page_id, None);
        }
        let leftover = part.blocks.get(&page_id).map_or(0, |b| b.n_pointers);
        if leftover > 0 {
            part.remove_page(page_id);
        }
        part.blocks.remove(&page_id);
        self.stats.pages_dropped.fetch_add(1, Ordering::Relaxed);
        trace!("dropped hash entries of page {}", page_id);
    }

    /// Removes all entries of an index, e.g. when the index is freed.
    pub fn drop_index(&self, index_id: u64) {
        let mut part = self.partition(index_id).write();
        let pages: Vec<PageId> = part
            .blocks
            .iter()
            .filter(|(_, b)| b.index_id == index_id)
            .map(|(&p, _)| p)
            .collect();
        for page in &pages {
            part.remove_page(*page);
            part.blocks.remove(page);
        }
        if !pages.is_empty() {
            debug!("dropped hash entries of {} pages of index {}", pages.len(), index_id);
        }
    }

    /// Maintains the entries of a hashed page after `rec` was inserted. The
    /// caller holds the page X latch.
    pub fn update_on_insert(&self, page: &PageBuf, rec: usize) {
        let params = match self.page_params(page) {
            Some(p) => p,
            None => return,
        };
        let index_id = page.index_id();
        let page_id = page.page_id();
        let prev = page.rec_prev(rec);
        let next = page.rec_next(rec);
        let ins_fold = fold_rec(page, rec, params, index_id);
        let prev_fold = page
            .rec_is_user(prev)
            .then(|| fold_rec(page, prev, params, index_id));
        let next_fold = page
            .rec_is_user(next)
            .then(|| fold_rec(page, next, params, index_id));

        let mut part = self.partition(index_id).write();
        if !part.blocks.contains_key(&page_id) {
            return;
        }
        match prev_fold {
            None => {
                if params.left_side {
                    part.insert_for_fold(ins_fold, page_id, rec);
                }
            }
            Some(fold) if fold != ins_fold => {
                if params.left_side {
                    part.insert_for_fold(ins_fold, page_id, rec);
                } else {
                    part.insert_for_fold(fold, page_id, prev);
                }
            }
            Some(_) => {}
        }
        match next_fold {
            None => {
                if !params.left_side {
                    part.insert_for_fold(ins_fold, page_id, rec);
                }
            }
            Some(fold) if fold != ins_fold => {
                if params.left_side {
                    part.insert_for_fold(fold, page_id, next);
                } else {
                    part.insert_for_fold(ins_fold, page_id, rec);
                }
            }
            Some(_) => {}
        }
    }

    /// Removes the entry of `rec` before it is deleted. The caller holds the
    /// page X latch.
    pub fn update_on_delete(&self, page: &PageBuf, rec: usize) {
        let params = match self.page_params(page) {
            Some(p) => p,
            None => return,
        };
        let fold = fold_rec(page, rec, params, page.index_id());
        let mut part = self.partition(page.index_id()).write();
        part.remove_for_fold(fold, page.page_id(), Some(rec));
    }

    /// Checks that every entry points at a live user record of a leaf page of
    /// its index whose fold matches. Returns the number of entries checked.
    pub fn validate(&self, pool: &BufferPool) -> StorageResult<usize> {
        let mut issues = Vec::new();
        let mut checked = 0;
        for part in &self.partitions {
            let nodes: Vec<(u32, PageId, usize, BlockInfo)> = {
                let p = part.read();
                p.table
                    .iter()
                    .filter_map(|n| match p.blocks.get(&n.page) {
                        Some(b) => Some((n.fold, n.page, n.rec as usize, *b)),
                        None => {
                            issues.push(format!(
                                "entry {:#x} points at unhashed page {}",
                                n.fold, n.page
                            ));
                            None
                        }
                    })
                    .collect()
            };
            for (fold, page_id, rec, block) in nodes {
                let guard = pool.get_page(page_id, LatchKind::S)?;
                let page = guard.page();
                {
                    // the entry may have changed since the snapshot
                    let p = part.read();
                    if p.table.lookup(fold) != Some((page_id, rec)) {
                        continue;
                    }
                }
                checked += 1;
                if !page.is_index_page() || page.index_id() != block.index_id || !page.is_leaf() {
                    issues.push(format!(
                        "entry {:#x} points at page {} outside its index",
                        fold, page_id
                    ));
                    continue;
                }
                if !page.rec_is_sane(rec, page.heap_top()) {
                    issues.push(format!(
                        "entry {:#x} points at no record ({} on page {})",
                        fold, rec, page_id
                    ));
                    continue;
                }
                let actual = fold_rec(page, rec, block.params, block.index_id);
                if actual != fold {
                    issues.push(format!(
                        "entry {:#x} points at record {} on page {} folding to {:#x}",
                        fold, rec, page_id, actual
                    ));
                }
            }
        }
        if issues.is_empty() {
            return Ok(checked);
        }
        for issue in &issues {
            warn!("adaptive hash index: {}", issue);
        }
        Err(StorageError::tree_corruption(issues.join("; ")))
    }
}

impl EvictionListener for AdaptiveHashIndex {
    fn on_evict(&self, page: &PageBuf) {
        self.drop_page_hash_index(page);
    }
}

//! An engine instance: the page cache, redo log, tablespace and adaptive
//! hash index shared by every index created on it.

use crate::access::ahi::AdaptiveHashIndex;
use crate::access::btree::key::IndexDef;
use crate::access::btree::{BTree, IndexContext};
use crate::access::rtree::RTree;
use crate::config::EngineConfig;
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::wal::RedoLog;
use crate::storage::{BufferPool, FileSpace, PageId, PageManager, StorageResult};
use log::{info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SPACE_ID: u32 = 1;

pub struct Engine {
    config: EngineConfig,
    ctx: IndexContext,
    next_index_id: AtomicU64,
}

impl Engine {
    /// An engine whose pages never leave memory.
    pub fn in_memory(config: EngineConfig) -> StorageResult<Self> {
        config.validate()?;
        Self::build(BufferPool::in_memory(), config)
    }

    /// An engine over a new page file at `path`. The pool evicts least
    /// recently used pages once `buffer_pool_frames` are in use.
    pub fn create(path: &Path, config: EngineConfig) -> StorageResult<Self> {
        config.validate()?;
        let page_manager = PageManager::create(path)?;
        let frames = config.buffer_pool_frames;
        let pool = BufferPool::new(page_manager, Box::new(LruReplacer::new(frames)), frames);
        info!("created page file {:?} with {} buffer frames", path, frames);
        Self::build(pool, config)
    }

    fn build(pool: BufferPool, config: EngineConfig) -> StorageResult<Self> {
        let log = Arc::new(RedoLog::new(config.wal.clone())?);
        let space = Arc::new(FileSpace::new(SPACE_ID, config.tablespace_max_pages));
        let ahi = Arc::new(AdaptiveHashIndex::new(&config.ahi));
        pool.add_eviction_listener(ahi.clone());
        let ctx = IndexContext::new(pool, log, space, ahi, &config);
        Ok(Self {
            config,
            ctx,
            next_index_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Services handed to every index of this engine.
    pub fn context(&self) -> IndexContext {
        self.ctx.clone()
    }

    pub fn ahi(&self) -> &Arc<AdaptiveHashIndex> {
        &self.ctx.ahi
    }

    pub fn pool(&self) -> &BufferPool {
        &self.ctx.pool
    }

    pub fn space(&self) -> &Arc<FileSpace> {
        &self.ctx.space
    }

    pub fn log(&self) -> &Arc<RedoLog> {
        &self.ctx.log
    }

    /// A fresh index id.
    pub fn allocate_index_id(&self) -> u64 {
        self.next_index_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a clustered index with `n_uniq` key fields out of `n_fields`.
    pub fn create_clustered_index(
        &self,
        name: &str,
        n_uniq: usize,
        n_fields: usize,
    ) -> StorageResult<BTree> {
        let index = IndexDef::clustered(self.allocate_index_id(), name, n_uniq, n_fields);
        self.create_index(index)
    }

    /// Creates a B-tree for an index definition built by the caller, e.g.
    /// one with compressed pages.
    pub fn create_index(&self, index: IndexDef) -> StorageResult<BTree> {
        BTree::create(self.context(), index)
    }

    pub fn create_spatial_index(&self, name: &str) -> StorageResult<RTree> {
        RTree::create(
            self.context(),
            IndexDef::spatial(self.allocate_index_id(), name),
        )
    }

    pub fn open_index(&self, index: IndexDef, root: PageId) -> StorageResult<BTree> {
        BTree::open(self.context(), index, root)
    }

    pub fn open_spatial_index(&self, index: IndexDef, root: PageId) -> StorageResult<RTree> {
        RTree::open(self.context(), index, root)
    }

    /// Frees the index rooted at `root` if the page still belongs to it.
    pub fn free_index_if_exists(&self, root: PageId, index_id: u64) -> StorageResult<bool> {
        BTree::free_if_exists(&self.ctx, root, index_id)
    }

    /// Writes the redo log, then every dirty page.
    pub fn flush(&self) -> StorageResult<()> {
        self.ctx.log.flush()?;
        self.ctx.pool.flush_all()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("flush on engine shutdown failed: {}", e);
        }
    }
}

//! One partition of the adaptive hash index: a chained hash table whose
//! nodes live in fixed-size chunks, plus the per-page bookkeeping of the
//! pages the partition indexes.

use super::info::HashParams;
use crate::storage::page::PageId;
use std::collections::HashMap;

/// Nodes per storage chunk.
pub const CHUNK_NODES: usize = 1024;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashNode {
    pub fold: u32,
    pub page: PageId,
    pub rec: u16,
    next: u32,
}

/// Chunked node storage. Nodes are kept dense: removing a node moves the
/// last node into its place. One emptied chunk is kept as a spare.
#[derive(Debug, Default)]
struct NodeStore {
    chunks: Vec<Vec<HashNode>>,
    len: usize,
    spare: Option<Vec<HashNode>>,
}

impl NodeStore {
    fn get(&self, i: u32) -> &HashNode {
        let i = i as usize;
        &self.chunks[i / CHUNK_NODES][i % CHUNK_NODES]
    }

    fn get_mut(&mut self, i: u32) -> &mut HashNode {
        let i = i as usize;
        &mut self.chunks[i / CHUNK_NODES][i % CHUNK_NODES]
    }

    fn push(&mut self, node: HashNode) -> u32 {
        if self.len == self.chunks.len() * CHUNK_NODES {
            let chunk = self
                .spare
                .take()
                .unwrap_or_else(|| Vec::with_capacity(CHUNK_NODES));
            self.chunks.push(chunk);
        }
        let idx = self.len;
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.push(node);
        }
        self.len += 1;
        idx as u32
    }

    fn pop(&mut self) -> Option<HashNode> {
        let node = self.chunks.last_mut()?.pop()?;
        self.len -= 1;
        if self.chunks.last().is_some_and(|c| c.is_empty()) {
            let chunk = self.chunks.pop();
            if self.spare.is_none() {
                self.spare = chunk;
            }
        }
        Some(node)
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

/// Outcome of [`HashTable::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    /// A node with the same fold existed and now points elsewhere.
    Replaced { old_page: PageId },
}

/// Open hashing with one node per fold.
#[derive(Debug)]
pub struct HashTable {
    cells: Vec<u32>,
    nodes: NodeStore,
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/// Smallest prime not below `n`.
pub fn next_prime(n: usize) -> usize {
    let mut p = n.max(2);
    while !is_prime(p) {
        p += 1;
    }
    p
}

impl HashTable {
    pub fn new(n_cells: usize) -> Self {
        Self {
            cells: vec![NIL; next_prime(n_cells)],
            nodes: NodeStore::default(),
        }
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len == 0
    }

    pub fn n_chunks(&self) -> usize {
        self.nodes.chunks.len()
    }

    fn cell(&self, fold: u32) -> usize {
        fold as usize % self.cells.len()
    }

    fn find(&self, fold: u32) -> Option<u32> {
        let mut i = self.cells[self.cell(fold)];
        while i != NIL {
            let node = self.nodes.get(i);
            if node.fold == fold {
                return Some(i);
            }
            i = node.next;
        }
        None
    }

    pub fn lookup(&self, fold: u32) -> Option<(PageId, usize)> {
        self.find(fold).map(|i| {
            let node = self.nodes.get(i);
            (node.page, node.rec as usize)
        })
    }

    pub fn insert(&mut self, fold: u32, page: PageId, rec: usize) -> InsertOutcome {
        if let Some(i) = self.find(fold) {
            let node = self.nodes.get_mut(i);
            let old_page = node.page;
            node.page = page;
            node.rec = rec as u16;
            return InsertOutcome::Replaced { old_page };
        }
        let cell = self.cell(fold);
        let idx = self.nodes.push(HashNode {
            fold,
            page,
            rec: rec as u16,
            next: self.cells[cell],
        });
        self.cells[cell] = idx;
        InsertOutcome::Added
    }

    /// Removes the node of `fold` if `pred` accepts it.
    pub fn remove_if(&mut self, fold: u32, pred: impl Fn(&HashNode) -> bool) -> Option<HashNode> {
        let i = self.find(fold)?;
        let node = *self.nodes.get(i);
        if !pred(&node) {
            return None;
        }
        self.delete_node(i);
        Some(node)
    }

    /// Removes every node `pred` accepts. Returns the removed nodes.
    pub fn remove_where(&mut self, pred: impl Fn(&HashNode) -> bool) -> Vec<HashNode> {
        let mut removed = Vec::new();
        let mut i = self.nodes.len;
        while i > 0 {
            i -= 1;
            let node = *self.nodes.get(i as u32);
            if pred(&node) {
                self.delete_node(i as u32);
                removed.push(node);
            }
        }
        removed
    }

    /// Takes `idx` out of its chain.
    fn unlink(&mut self, idx: u32) {
        let fold = self.nodes.get(idx).fold;
        let next = self.nodes.get(idx).next;
        let cell = self.cell(fold);
        if self.cells[cell] == idx {
            self.cells[cell] = next;
            return;
        }
        let mut i = self.cells[cell];
        while i != NIL {
            if self.nodes.get(i).next == idx {
                self.nodes.get_mut(i).next = next;
                return;
            }
            i = self.nodes.get(i).next;
        }
    }

    fn delete_node(&mut self, idx: u32) {
        self.unlink(idx);
        let last = (self.nodes.len - 1) as u32;
        if idx != last {
            // relink the last node into the freed position
            let moved = *self.nodes.get(last);
            let cell = self.cell(moved.fold);
            if self.cells[cell] == last {
                self.cells[cell] = idx;
            } else {
                let mut i = self.cells[cell];
                while i != NIL {
                    if self.nodes.get(i).next == last {
                        self.nodes.get_mut(i).next = idx;
                        break;
                    }
                    i = self.nodes.get(i).next;
                }
            }
            *self.nodes.get_mut(idx) = moved;
        }
        self.nodes.pop();
    }

    pub fn iter(&self) -> impl Iterator<Item = &HashNode> {
        self.nodes.chunks.iter().flatten()
    }

    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = NIL);
        self.nodes.clear();
    }
}

/// Hash state of a page indexed by the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub index_id: u64,
    pub params: HashParams,
    /// Nodes pointing into the page.
    pub n_pointers: usize,
}

#[derive(Debug)]
pub struct PartitionInner {
    pub table: HashTable,
    pub blocks: HashMap<PageId, BlockInfo>,
}

impl PartitionInner {
    pub fn new(n_cells: usize) -> Self {
        Self {
            table: HashTable::new(n_cells),
            blocks: HashMap::new(),
        }
    }

    fn adjust_pointers(&mut self, page: PageId, delta: isize) {
        if let Some(block) = self.blocks.get_mut(&page) {
            block.n_pointers = block.n_pointers.saturating_add_signed(delta);
        }
    }

    pub fn insert_for_fold(&mut self, fold: u32, page: PageId, rec: usize) {
        match self.table.insert(fold, page, rec) {
            InsertOutcome::Added => self.adjust_pointers(page, 1),
            InsertOutcome::Replaced { old_page } if old_page != page => {
                self.adjust_pointers(old_page, -1);
                self.adjust_pointers(page, 1);
            }
            InsertOutcome::Replaced { .. } => {}
        }
    }

    /// Removes the node of `fold` if it points into `page` (at `rec`, when
    /// given).
    pub fn remove_for_fold(&mut self, fold: u32, page: PageId, rec: Option<usize>) -> bool {
        let removed = self
            .table
            .remove_if(fold, |n| n.page == page && rec.map_or(true, |r| n.rec as usize == r));
        if removed.is_some() {
            self.adjust_pointers(page, -1);
        }
        removed.is_some()
    }

    /// Removes every node pointing into `page`.
    pub fn remove_page(&mut self, page: PageId) -> usize {
        let n = self.table.remove_where(|n| n.page == page).len();
        self.adjust_pointers(page, -(n as isize));
        n
    }

    pub fn clear(&mut self) {
        self.table.clear();
        self.blocks.clear();
    }
}

//! Storage layer for vibetree.
//!
//! The pieces the index engine runs on:
//!
//! - **PageManager**: reads and writes checksummed fixed-size pages
//! - **BufferPool**: page cache with S/X latches and LRU eviction
//! - **FileSpace**: segment-based page allocation with reservations
//! - **Mtr**: mini-transactions holding latches and grouping redo
//! - **RedoLog**: physical redo records, in memory or in files
//! - **page**: the index page format, record codec and compressed shadow

pub mod buffer;
pub mod disk;
pub mod error;
pub mod fsp;
pub mod mtr;
pub mod page;
pub mod wal;

pub use buffer::{BufferPool, LatchKind, PageGuard};
pub use disk::{PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use fsp::{AllocDirection, FileSpace, Reservation, SegmentId};
pub use mtr::{BlockId, IndexLock, LogMode, Mtr, TreeLatchMode};
pub use page::{PageBuf, PageId, PageType};

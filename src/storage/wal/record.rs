//! Redo record types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::page::{PageBuf, PageId};

/// Log Sequence Number. Monotonically increasing, one per committed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LSN(pub u64);

impl LSN {
    pub fn new() -> Self {
        LSN(0)
    }

    pub fn next(&self) -> Self {
        LSN(self.0 + 1)
    }

    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl Default for LSN {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LSN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// A physical, replayable page mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RedoRecord {
    Write {
        page: PageId,
        offset: u16,
        bytes: Vec<u8>,
    },
    Memset {
        page: PageId,
        offset: u16,
        len: u16,
        byte: u8,
    },
    /// The page was (re)initialized as a fresh frame.
    InitPage { page: PageId },
}

impl RedoRecord {
    pub fn page(&self) -> PageId {
        match self {
            RedoRecord::Write { page, .. }
            | RedoRecord::Memset { page, .. }
            | RedoRecord::InitPage { page } => *page,
        }
    }

    /// Applies the record to `page` without logging it again.
    pub fn apply(&self, page: &mut PageBuf) {
        let logging = page.is_logging();
        page.set_logging(false);
        match self {
            RedoRecord::Write { offset, bytes, .. } => page.write_bytes(*offset as usize, bytes),
            RedoRecord::Memset {
                offset, len, byte, ..
            } => page.memset(*offset as usize, *len as usize, *byte),
            RedoRecord::InitPage { page: id } => *page = PageBuf::new_temp(*id),
        }
        page.set_logging(logging);
    }
}

/// All records of one committed mini-transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedoGroup {
    pub lsn: LSN,
    pub records: Vec<RedoRecord>,
}

impl RedoGroup {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage and index layers.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A page-level or tree-level invariant does not hold.
    #[error("Structural corruption{}: {reason}", fmt_page(.page))]
    Corruption { page: Option<PageId>, reason: String },

    /// A page-local transformation (recompression, merge fit) did not succeed.
    /// The caller is expected to try another strategy.
    #[error("Page layout operation failed; retry with another strategy")]
    LayoutFailure,

    #[error("Tablespace {space} is full")]
    OutOfSpace { space: u32 },

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Checksum mismatch on page {0}")]
    ChecksumMismatch(PageId),

    #[error("Buffer pool is full: cannot allocate new frame")]
    BufferPoolFull,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Invalid index definition: {0}")]
    InvalidIndex(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Disk(#[from] anyhow::Error),
}

fn fmt_page(page: &Option<PageId>) -> String {
    match page {
        Some(id) => format!(" on page {}", id),
        None => String::new(),
    }
}

impl StorageError {
    pub fn corruption(page: PageId, reason: impl Into<String>) -> Self {
        StorageError::Corruption {
            page: Some(page),
            reason: reason.into(),
        }
    }

    pub fn tree_corruption(reason: impl Into<String>) -> Self {
        StorageError::Corruption {
            page: None,
            reason: reason.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption { .. })
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_message_names_page() {
        let err = StorageError::corruption(PageId(7), "n_recs mismatch");
        assert!(err.is_corruption());
        assert_eq!(
            err.to_string(),
            "Structural corruption on page 7: n_recs mismatch"
        );

        let err = StorageError::tree_corruption("height");
        assert_eq!(err.to_string(), "Structural corruption: height");
    }
}

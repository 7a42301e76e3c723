//! Page file access.

pub mod page_manager;

pub use page_manager::PageManager;

/// Size of every page, in bytes.
pub const PAGE_SIZE: usize = 16384;

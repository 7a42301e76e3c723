//! Redo logging.
//!
//! Page mutations made inside a mini-transaction are captured as physical
//! [`RedoRecord`]s and appended to the [`RedoLog`] as one group per commit,
//! under a single log sequence number. Groups can be replayed onto page
//! images.

pub mod manager;
pub mod record;

pub use manager::{RedoLog, WalConfig};
pub use record::{RedoGroup, RedoRecord, LSN};

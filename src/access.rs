//! Index access methods.
//!
//! - **btree**: clustered and secondary B-trees, their structure
//!   modifications and validation
//! - **rtree**: the spatial variant, keyed by minimum bounding rectangles
//! - **ahi**: the adaptive hash index that short-cuts leaf searches
//! - **tuple**/**value**: logical records and memcmp-comparable field encoders

pub mod ahi;
pub mod btree;
pub mod rtree;
pub mod tuple;
pub mod value;

pub use ahi::AdaptiveHashIndex;
pub use btree::iterator::BTreeIterator;
pub use btree::{BTree, IndexContext};
pub use rtree::{RTree, RTreeEntry};
pub use tuple::Tuple;
pub use value::{encode_i64, encode_u64, DataType, Value};

use crate::access::tuple::Tuple;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::index_page::page_max_rec_size;
use crate::storage::page::record::{rec_converted_size, REC_MAX_N_FIELDS};
use crate::storage::page::zip::PAGE_ZIP_SIZES;
use crate::storage::page::PageType;

/// Kind of index a tree implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Clustered,
    Secondary,
    Spatial,
}

/// Describes the records an index stores and how they are compared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub id: u64,
    pub name: String,
    pub kind: IndexKind,
    /// Fields of every leaf record
    pub n_fields: usize,
    /// Leading fields that identify a record. Node pointers carry exactly
    /// these fields plus the child page number.
    pub n_uniq: usize,
    /// Compressed page size, `None` for uncompressed pages
    pub zip_size: Option<usize>,
}

impl IndexDef {
    pub fn clustered(id: u64, name: &str, n_uniq: usize, n_fields: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: IndexKind::Clustered,
            n_fields,
            n_uniq,
            zip_size: None,
        }
    }

    /// A secondary index; its entries are made unique by the trailing
    /// primary key columns, so every field takes part in comparison.
    pub fn secondary(id: u64, name: &str, n_fields: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: IndexKind::Secondary,
            n_fields,
            n_uniq: n_fields,
            zip_size: None,
        }
    }

    /// A spatial index over `[mbr, primary key]` records.
    pub fn spatial(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: IndexKind::Spatial,
            n_fields: 2,
            n_uniq: 2,
            zip_size: None,
        }
    }

    pub fn with_zip(mut self, zip_size: usize) -> Self {
        self.zip_size = Some(zip_size);
        self
    }

    pub fn is_spatial(&self) -> bool {
        self.kind == IndexKind::Spatial
    }

    pub fn page_type(&self) -> PageType {
        if self.is_spatial() {
            PageType::RTree
        } else {
            PageType::Index
        }
    }

    /// Largest leaf record accepted. Half a page, less room for the node
    /// pointer that may be built from it.
    pub fn max_rec_size(&self) -> usize {
        page_max_rec_size() / 2 - 2 * REC_MAX_N_FIELDS
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.n_fields == 0 || self.n_fields > REC_MAX_N_FIELDS - 1 {
            return Err(StorageError::InvalidIndex(format!(
                "index {} has {} fields",
                self.name, self.n_fields
            )));
        }
        if self.n_uniq == 0 || self.n_uniq > self.n_fields {
            return Err(StorageError::InvalidIndex(format!(
                "index {}: n_uniq {} outside 1..={}",
                self.name, self.n_uniq, self.n_fields
            )));
        }
        if let Some(zip) = self.zip_size {
            if self.is_spatial() {
                return Err(StorageError::InvalidIndex(format!(
                    "spatial index {} cannot be compressed",
                    self.name
                )));
            }
            if !PAGE_ZIP_SIZES.contains(&zip) {
                return Err(StorageError::InvalidIndex(format!(
                    "index {}: unsupported compressed size {}",
                    self.name, zip
                )));
            }
        }
        Ok(())
    }

    /// Checks a record before it is handed to the tree.
    pub fn check_tuple(&self, tuple: &Tuple) -> StorageResult<()> {
        if tuple.n_fields() != self.n_fields {
            return Err(StorageError::InvalidTuple(format!(
                "index {} expects {} fields, got {}",
                self.name,
                self.n_fields,
                tuple.n_fields()
            )));
        }
        let size = rec_converted_size(tuple);
        if size > self.max_rec_size() {
            return Err(StorageError::InvalidTuple(format!(
                "record of {} bytes exceeds the {} byte limit",
                size,
                self.max_rec_size()
            )));
        }
        Ok(())
    }

    /// Checks a search key: at most `n_uniq` fields.
    pub fn check_key(&self, key: &Tuple) -> StorageResult<()> {
        if key.n_fields() > self.n_uniq {
            return Err(StorageError::InvalidTuple(format!(
                "search key has {} fields, index {} compares {}",
                key.n_fields(),
                self.name,
                self.n_uniq
            )));
        }
        Ok(())
    }
}

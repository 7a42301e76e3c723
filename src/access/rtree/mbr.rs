//! Minimum bounding rectangles.

use crate::storage::error::{StorageError, StorageResult};

/// Stored size of an MBR field.
pub const DATA_MBR_LEN: usize = 32;

/// Axis-aligned rectangle; stored as xmin, xmax, ymin, ymax.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mbr {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

/// Relation a search asks for between the query rectangle and each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Entry and query share at least a point.
    Intersect,
    /// Entry contains the query.
    Contain,
    /// Entry lies within the query.
    Within,
    /// Entry and query share no point.
    Disjoint,
    /// Entry equals the query.
    MbrEqual,
}

fn encode_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    ordered.to_be_bytes()
}

fn decode_f64(b: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    let ordered = u64::from_be_bytes(raw);
    let bits = if ordered >> 63 == 1 { ordered ^ (1 << 63) } else { !ordered };
    f64::from_bits(bits)
}

impl Mbr {
    /// Builds a rectangle from two corners in any order.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            xmin: x1.min(x2),
            xmax: x1.max(x2),
            ymin: y1.min(y2),
            ymax: y1.max(y2),
        }
    }

    pub fn point(x: f64, y: f64) -> Self {
        Self::new(x, y, x, y)
    }

    /// Memcmp-comparable encoding.
    pub fn to_bytes(&self) -> [u8; DATA_MBR_LEN] {
        let mut out = [0u8; DATA_MBR_LEN];
        for (i, v) in [self.xmin, self.xmax, self.ymin, self.ymax].iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&encode_f64(*v));
        }
        out
    }

    pub fn from_bytes(b: &[u8]) -> StorageResult<Self> {
        if b.len() != DATA_MBR_LEN {
            return Err(StorageError::InvalidTuple(format!(
                "MBR field has {} bytes, expected {}",
                b.len(),
                DATA_MBR_LEN
            )));
        }
        let mbr = Self {
            xmin: decode_f64(&b[0..8]),
            xmax: decode_f64(&b[8..16]),
            ymin: decode_f64(&b[16..24]),
            ymax: decode_f64(&b[24..32]),
        };
        mbr.check()?;
        Ok(mbr)
    }

    /// Rejects NaN or infinite coordinates and inverted bounds.
    pub fn check(&self) -> StorageResult<()> {
        let finite = [self.xmin, self.xmax, self.ymin, self.ymax]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.xmin > self.xmax || self.ymin > self.ymax {
            return Err(StorageError::InvalidTuple(format!("invalid MBR {:?}", self)));
        }
        Ok(())
    }

    pub fn area(&self) -> f64 {
        (self.xmax - self.xmin) * (self.ymax - self.ymin)
    }

    pub fn union(&self, other: &Mbr) -> Mbr {
        Mbr {
            xmin: self.xmin.min(other.xmin),
            xmax: self.xmax.max(other.xmax),
            ymin: self.ymin.min(other.ymin),
            ymax: self.ymax.max(other.ymax),
        }
    }

    /// Area added by growing this rectangle to cover `other`.
    pub fn enlargement(&self, other: &Mbr) -> f64 {
        self.union(other).area() - self.area()
    }

    pub fn overlap_area(&self, other: &Mbr) -> f64 {
        let w = self.xmax.min(other.xmax) - self.xmin.max(other.xmin);
        let h = self.ymax.min(other.ymax) - self.ymin.max(other.ymin);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    pub fn intersects(&self, other: &Mbr) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    pub fn contains(&self, other: &Mbr) -> bool {
        self.xmin <= other.xmin
            && self.xmax >= other.xmax
            && self.ymin <= other.ymin
            && self.ymax >= other.ymax
    }

    pub fn within(&self, other: &Mbr) -> bool {
        other.contains(self)
    }

    /// Whether an entry with this MBR satisfies `mode` for `query`.
    pub fn matches(&self, mode: SearchMode, query: &Mbr) -> bool {
        match mode {
            SearchMode::Intersect => self.intersects(query),
            SearchMode::Contain => self.contains(query),
            SearchMode::Within => self.within(query),
            SearchMode::Disjoint => !self.intersects(query),
            SearchMode::MbrEqual => self == query,
        }
    }

    /// Whether a subtree bounded by this MBR may hold a match.
    pub fn may_hold(&self, mode: SearchMode, query: &Mbr) -> bool {
        match mode {
            SearchMode::Intersect | SearchMode::Within => self.intersects(query),
            SearchMode::Contain | SearchMode::MbrEqual => self.contains(query),
            SearchMode::Disjoint => !query.contains(self),
        }
    }
}

/// Union of a non-empty set of rectangles.
pub fn union_all<'a>(mut mbrs: impl Iterator<Item = &'a Mbr>) -> Option<Mbr> {
    let first = *mbrs.next()?;
    Some(mbrs.fold(first, |acc, m| acc.union(m)))
}

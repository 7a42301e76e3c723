//! Physical record format.
//!
//! ```text
//! +------+---------+---------+--------+------+----------+------------------+--------+
//! | info | n_owned | heap_no | status | next | n_fields | len[0..n] (u16)  | data   |
//! |  u8  |   u8    |   u16   |   u8   | u16  |   u16    | 0xFFFF = NULL    |        |
//! +------+---------+---------+--------+------+----------+------------------+--------+
//! ```
//!
//! A record offset always points at the first header byte. `next` is the
//! absolute page offset of the successor in key order (0 only for supremum).

use super::PageBuf;
use crate::access::tuple::Tuple;
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;
use std::cmp::Ordering;

pub const REC_INFO_MIN_REC_FLAG: u8 = 0x10;
pub const REC_INFO_DELETED_FLAG: u8 = 0x20;

const REC_OFF_INFO: usize = 0;
const REC_OFF_N_OWNED: usize = 1;
const REC_OFF_HEAP_NO: usize = 2;
const REC_OFF_STATUS: usize = 4;
const REC_OFF_NEXT: usize = 5;
const REC_OFF_N_FIELDS: usize = 7;
pub const REC_HEADER_SIZE: usize = 9;
const REC_NULL_LEN: u16 = 0xFFFF;

/// Upper bound on fields per record; also guards decoding of stale offsets.
pub const REC_MAX_N_FIELDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecStatus {
    Ordinary = 0,
    NodePtr = 1,
    Infimum = 2,
    Supremum = 3,
}

impl RecStatus {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RecStatus::Ordinary),
            1 => Some(RecStatus::NodePtr),
            2 => Some(RecStatus::Infimum),
            3 => Some(RecStatus::Supremum),
            _ => None,
        }
    }
}

/// Fields and bytes matched by a comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecMatch {
    pub fields: usize,
    pub bytes: usize,
}

/// Stored size of `tuple` as a record.
pub fn rec_converted_size(tuple: &Tuple) -> usize {
    REC_HEADER_SIZE + 2 * tuple.n_fields() + tuple.data_len()
}

impl PageBuf {
    pub fn rec_info_bits(&self, rec: usize) -> u8 {
        self.read_u8(rec + REC_OFF_INFO)
    }

    pub fn rec_set_info_bits(&mut self, rec: usize, bits: u8) {
        self.write_u8(rec + REC_OFF_INFO, bits);
    }

    pub fn rec_is_min_rec(&self, rec: usize) -> bool {
        self.rec_info_bits(rec) & REC_INFO_MIN_REC_FLAG != 0
    }

    pub fn rec_set_min_rec(&mut self, rec: usize, on: bool) {
        let bits = self.rec_info_bits(rec);
        let bits = if on {
            bits | REC_INFO_MIN_REC_FLAG
        } else {
            bits & !REC_INFO_MIN_REC_FLAG
        };
        self.rec_set_info_bits(rec, bits);
    }

    pub fn rec_is_deleted(&self, rec: usize) -> bool {
        self.rec_info_bits(rec) & REC_INFO_DELETED_FLAG != 0
    }

    pub fn rec_n_owned(&self, rec: usize) -> usize {
        self.read_u8(rec + REC_OFF_N_OWNED) as usize
    }

    pub fn rec_set_n_owned(&mut self, rec: usize, n: usize) {
        self.write_u8(rec + REC_OFF_N_OWNED, n as u8);
    }

    pub fn rec_heap_no(&self, rec: usize) -> usize {
        self.read_u16(rec + REC_OFF_HEAP_NO) as usize
    }

    pub fn rec_status(&self, rec: usize) -> RecStatus {
        RecStatus::from_u8(self.read_u8(rec + REC_OFF_STATUS)).unwrap_or(RecStatus::Ordinary)
    }

    pub fn rec_is_user(&self, rec: usize) -> bool {
        matches!(
            self.rec_status(rec),
            RecStatus::Ordinary | RecStatus::NodePtr
        )
    }

    pub fn rec_next(&self, rec: usize) -> usize {
        self.read_u16(rec + REC_OFF_NEXT) as usize
    }

    pub fn rec_set_next(&mut self, rec: usize, next: usize) {
        self.write_u16(rec + REC_OFF_NEXT, next as u16);
    }

    pub fn rec_n_fields(&self, rec: usize) -> usize {
        self.read_u16(rec + REC_OFF_N_FIELDS) as usize
    }

    /// Fields taking part in key comparison: the child page number of a node
    /// pointer is excluded.
    pub fn rec_n_key_fields(&self, rec: usize) -> usize {
        match self.rec_status(rec) {
            RecStatus::NodePtr => self.rec_n_fields(rec).saturating_sub(1),
            RecStatus::Ordinary => self.rec_n_fields(rec),
            RecStatus::Infimum | RecStatus::Supremum => 0,
        }
    }

    fn rec_len_slot(&self, rec: usize, i: usize) -> u16 {
        self.read_u16(rec + REC_HEADER_SIZE + 2 * i)
    }

    pub fn rec_field_len(&self, rec: usize, i: usize) -> Option<usize> {
        match self.rec_len_slot(rec, i) {
            REC_NULL_LEN => None,
            len => Some(len as usize),
        }
    }

    fn rec_data_start(&self, rec: usize) -> usize {
        rec + REC_HEADER_SIZE + 2 * self.rec_n_fields(rec)
    }

    pub fn rec_field(&self, rec: usize, i: usize) -> Option<&[u8]> {
        let mut off = self.rec_data_start(rec);
        for j in 0..i {
            off += self.rec_field_len(rec, j).unwrap_or(0);
        }
        self.rec_field_len(rec, i).map(|len| self.slice(off, len))
    }

    pub fn rec_size(&self, rec: usize) -> usize {
        let n = self.rec_n_fields(rec);
        let data: usize = (0..n).map(|i| self.rec_field_len(rec, i).unwrap_or(0)).sum();
        REC_HEADER_SIZE + 2 * n + data
    }

    /// Child page number stored in the last field of a node pointer.
    pub fn rec_child(&self, rec: usize) -> Option<PageId> {
        let n = self.rec_n_fields(rec);
        if n == 0 {
            return None;
        }
        match self.rec_field(rec, n - 1) {
            Some(b) if b.len() == 4 => Some(PageId(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))),
            _ => None,
        }
    }

    /// In-place rewrite of a node pointer's child field.
    pub fn rec_set_child(&mut self, rec: usize, child: PageId) {
        let n = self.rec_n_fields(rec);
        let mut off = self.rec_data_start(rec);
        for j in 0..n - 1 {
            off += self.rec_field_len(rec, j).unwrap_or(0);
        }
        self.write_u32(off, child.0);
    }

    /// Overwrites field `i` with bytes of the same length. Returns false
    /// when the lengths differ or the field is NULL.
    pub fn rec_set_field_in_place(&mut self, rec: usize, i: usize, bytes: &[u8]) -> bool {
        if i >= self.rec_n_fields(rec) || self.rec_field_len(rec, i) != Some(bytes.len()) {
            return false;
        }
        let mut off = self.rec_data_start(rec);
        for j in 0..i {
            off += self.rec_field_len(rec, j).unwrap_or(0);
        }
        self.write_bytes(off, bytes);
        true
    }

    /// All fields of the record, including a node pointer's child.
    pub fn rec_to_tuple(&self, rec: usize) -> Tuple {
        let n = self.rec_n_fields(rec);
        let mut fields = Vec::with_capacity(n);
        let mut off = self.rec_data_start(rec);
        for i in 0..n {
            match self.rec_field_len(rec, i) {
                None => fields.push(None),
                Some(len) => {
                    fields.push(Some(self.slice(off, len).to_vec()));
                    off += len;
                }
            }
        }
        Tuple {
            fields,
            info_bits: self.rec_info_bits(rec) & REC_INFO_MIN_REC_FLAG,
        }
    }

    /// The first `n` fields only.
    pub fn rec_key_tuple(&self, rec: usize, n: usize) -> Tuple {
        let mut t = self.rec_to_tuple(rec);
        t.fields.truncate(n);
        t.info_bits = 0;
        t
    }

    /// Serializes `tuple` at `at`. `next` and `n_owned` start at zero.
    pub fn write_record(&mut self, at: usize, tuple: &Tuple, status: RecStatus, heap_no: usize) {
        let size = rec_converted_size(tuple);
        let mut buf = Vec::with_capacity(size);
        buf.push(tuple.info_bits & REC_INFO_MIN_REC_FLAG);
        buf.push(0);
        buf.extend_from_slice(&(heap_no as u16).to_be_bytes());
        buf.push(status as u8);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&(tuple.n_fields() as u16).to_be_bytes());
        for f in &tuple.fields {
            let len = f.as_ref().map_or(REC_NULL_LEN, |b| b.len() as u16);
            buf.extend_from_slice(&len.to_be_bytes());
        }
        for f in tuple.fields.iter().flatten() {
            buf.extend_from_slice(f);
        }
        self.write_bytes(at, &buf);
    }

    /// Checks that `rec` decodes to a live user record inside the heap.
    /// Used before trusting an offset that came from outside the page latch.
    pub fn rec_is_sane(&self, rec: usize, heap_top: usize) -> bool {
        if rec < super::index_page::PAGE_HEAP_START || rec + REC_HEADER_SIZE > heap_top {
            return false;
        }
        if self.rec_status(rec) != RecStatus::Ordinary
            || self.read_u8(rec + REC_OFF_STATUS) > 3
            || self.rec_is_deleted(rec)
        {
            return false;
        }
        let n = self.rec_n_fields(rec);
        if n == 0 || n > REC_MAX_N_FIELDS || rec + REC_HEADER_SIZE + 2 * n > heap_top {
            return false;
        }
        let data: usize = (0..n).map(|i| self.rec_field_len(rec, i).unwrap_or(0)).sum();
        let next = self.rec_next(rec);
        rec + REC_HEADER_SIZE + 2 * n + data <= heap_top && next != 0 && next < PAGE_SIZE
    }
}

fn cmp_field(a: Option<&[u8]>, b: Option<&[u8]>, matched_bytes: &mut usize) -> Ordering {
    *matched_bytes = 0;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let common = a.iter().zip(b).take_while(|(x, y)| x == y).count();
            *matched_bytes = common;
            if common < a.len() && common < b.len() {
                a[common].cmp(&b[common])
            } else {
                a.len().cmp(&b.len())
            }
        }
    }
}

/// Compares a search tuple with a record on `page`.
///
/// Only `min(tuple fields, record key fields)` fields take part. Infimum is
/// below and supremum above every tuple; a record carrying the MIN_REC flag is
/// below every tuple. `matched` receives the fully equal fields and the equal
/// leading bytes of the first differing field.
pub fn cmp_tuple_rec_with_match(
    tuple: &Tuple,
    page: &PageBuf,
    rec: usize,
    matched: &mut RecMatch,
) -> Ordering {
    *matched = RecMatch::default();
    match page.rec_status(rec) {
        RecStatus::Infimum => return Ordering::Greater,
        RecStatus::Supremum => return Ordering::Less,
        _ => {}
    }
    if page.rec_is_min_rec(rec) {
        return Ordering::Greater;
    }
    let n = tuple.n_fields().min(page.rec_n_key_fields(rec));
    for i in 0..n {
        let mut bytes = 0;
        let ord = cmp_field(tuple.field(i), page.rec_field(rec, i), &mut bytes);
        if ord != Ordering::Equal {
            matched.bytes = bytes;
            return ord;
        }
        matched.fields += 1;
    }
    Ordering::Equal
}

pub fn cmp_tuple_rec(tuple: &Tuple, page: &PageBuf, rec: usize) -> Ordering {
    let mut matched = RecMatch::default();
    cmp_tuple_rec_with_match(tuple, page, rec, &mut matched)
}

/// Compares two user records on their first `n` key fields.
pub fn cmp_rec_rec(a: &PageBuf, rec_a: usize, b: &PageBuf, rec_b: usize, n: usize) -> Ordering {
    let n = n
        .min(a.rec_n_key_fields(rec_a))
        .min(b.rec_n_key_fields(rec_b));
    for i in 0..n {
        let mut bytes = 0;
        let ord = cmp_field(a.rec_field(rec_a, i), b.rec_field(rec_b, i), &mut bytes);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

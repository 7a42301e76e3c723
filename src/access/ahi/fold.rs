//! Fold computation.
//!
//! A fold hashes the index id together with a record prefix: the first
//! `n_fields` whole fields and the first `n_bytes` of the field after them.
//! Tuples and records with the same prefix fold to the same value.

use super::info::HashParams;
use crate::access::tuple::Tuple;
use crate::storage::page::PageBuf;

const FOLD_MASK_1: u32 = 1653893711;
const FOLD_MASK_2: u32 = 1463735687;

/// Combines two 32-bit values into one.
pub fn fold_pair(n1: u32, n2: u32) -> u32 {
    ((((n1 ^ n2 ^ FOLD_MASK_1) << 8).wrapping_add(n1)) ^ FOLD_MASK_2).wrapping_add(n2)
}

pub fn fold_u64(v: u64) -> u32 {
    fold_pair((v >> 32) as u32, v as u32)
}

enum FieldRef<'a> {
    Missing,
    Null,
    Data(&'a [u8]),
}

fn fold_prefix<'a>(
    index_id: u64,
    params: HashParams,
    field: impl Fn(usize) -> FieldRef<'a>,
) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&index_id.to_be_bytes());
    for i in 0..params.n_fields {
        match field(i) {
            FieldRef::Missing => hasher.update(&[2]),
            FieldRef::Null => hasher.update(&[0]),
            FieldRef::Data(bytes) => {
                hasher.update(&[1]);
                hasher.update(&(bytes.len() as u32).to_be_bytes());
                hasher.update(bytes);
            }
        }
    }
    if params.n_bytes > 0 {
        match field(params.n_fields) {
            FieldRef::Missing => hasher.update(&[2]),
            FieldRef::Null => hasher.update(&[0]),
            FieldRef::Data(bytes) => {
                hasher.update(&[1]);
                hasher.update(&bytes[..params.n_bytes.min(bytes.len())]);
            }
        }
    }
    fold_pair(hasher.finalize(), fold_u64(index_id))
}

/// Fold of a search tuple.
pub fn fold_tuple(tuple: &Tuple, params: HashParams, index_id: u64) -> u32 {
    fold_prefix(index_id, params, |i| {
        if i >= tuple.n_fields() {
            FieldRef::Missing
        } else {
            match tuple.field(i) {
                Some(bytes) => FieldRef::Data(bytes),
                None => FieldRef::Null,
            }
        }
    })
}

/// Fold of a user record on `page`.
pub fn fold_rec(page: &PageBuf, rec: usize, params: HashParams, index_id: u64) -> u32 {
    let n = page.rec_n_fields(rec);
    fold_prefix(index_id, params, |i| {
        if i >= n {
            FieldRef::Missing
        } else {
            match page.rec_field(rec, i) {
                Some(bytes) => FieldRef::Data(bytes),
                None => FieldRef::Null,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::value::encode_u64;
    use crate::storage::page::record::RecStatus;
    use crate::storage::page::{PageId, PageType};

    fn params(n_fields: usize, n_bytes: usize) -> HashParams {
        HashParams {
            n_fields,
            n_bytes,
            left_side: true,
        }
    }

    #[test]
    fn test_tuple_and_record_fold_agree() {
        let mut page = PageBuf::new_temp(PageId(4));
        page.page_create(0, 7, PageType::Index);
        let t = Tuple::from_slices(&[&encode_u64(42), b"payload"]);
        let rec = page
            .insert_rec_after(page.infimum(), &t, RecStatus::Ordinary)
            .unwrap()
            .unwrap();

        for p in [params(1, 0), params(2, 0), params(1, 3)] {
            assert_eq!(fold_tuple(&t, p, 7), fold_rec(&page, rec, p, 7));
        }
        // a key prefix folds like the record when only the key is hashed
        let key = Tuple::from_slices(&[&encode_u64(42)]);
        assert_eq!(fold_tuple(&key, params(1, 0), 7), fold_rec(&page, rec, params(1, 0), 7));
    }

    #[test]
    fn test_fold_depends_on_index_and_prefix() {
        let a = Tuple::from_slices(&[b"abc", b"x"]);
        let b = Tuple::from_slices(&[b"abd", b"x"]);
        assert_ne!(fold_tuple(&a, params(1, 0), 1), fold_tuple(&a, params(1, 0), 2));
        assert_ne!(fold_tuple(&a, params(1, 0), 1), fold_tuple(&b, params(1, 0), 1));
        // only the first two bytes of field 0 take part
        assert_eq!(fold_tuple(&a, params(0, 2), 1), fold_tuple(&b, params(0, 2), 1));
        let null = Tuple::new(vec![None, Some(b"x".to_vec())]);
        let empty = Tuple::new(vec![Some(Vec::new()), Some(b"x".to_vec())]);
        assert_ne!(fold_tuple(&null, params(1, 0), 1), fold_tuple(&empty, params(1, 0), 1));
    }
}

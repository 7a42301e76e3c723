use crate::access::value::{encode_u32, Value};
use crate::storage::page::record::REC_INFO_MIN_REC_FLAG;
use crate::storage::page::PageId;

/// A logical record: ordered, nullable byte fields plus record info bits.
///
/// Fields are expected to be memcmp-comparable (see [`Value::encode`]);
/// index comparison is a plain byte comparison field by field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple {
    pub fields: Vec<Option<Vec<u8>>>,
    pub info_bits: u8,
}

impl Tuple {
    pub fn new(fields: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            fields,
            info_bits: 0,
        }
    }

    pub fn from_slices(fields: &[&[u8]]) -> Self {
        Self::new(fields.iter().map(|f| Some(f.to_vec())).collect())
    }

    pub fn from_values(values: &[Value]) -> Self {
        Self::new(values.iter().map(Value::encode).collect())
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, i: usize) -> Option<&[u8]> {
        self.fields.get(i).and_then(|f| f.as_deref())
    }

    pub fn push(&mut self, field: Option<Vec<u8>>) {
        self.fields.push(field);
    }

    /// The first `n` fields, info bits cleared.
    pub fn prefix(&self, n: usize) -> Tuple {
        Tuple::new(self.fields[..n.min(self.fields.len())].to_vec())
    }

    /// Appends a child page number, turning a key prefix into a node pointer.
    pub fn with_child(mut self, child: PageId) -> Tuple {
        self.fields.push(Some(encode_u32(child.0).to_vec()));
        self
    }

    pub fn is_min_rec(&self) -> bool {
        self.info_bits & REC_INFO_MIN_REC_FLAG != 0
    }

    pub fn set_min_rec(&mut self, on: bool) {
        if on {
            self.info_bits |= REC_INFO_MIN_REC_FLAG;
        } else {
            self.info_bits &= !REC_INFO_MIN_REC_FLAG;
        }
    }

    /// Total bytes of field data.
    pub fn data_len(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.as_ref().map_or(0, |b| b.len()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_from_values() {
        let t = Tuple::from_values(&[Value::Int64(3), Value::Null, Value::String("ab".into())]);
        assert_eq!(t.n_fields(), 3);
        assert!(t.field(1).is_none());
        assert_eq!(t.field(2), Some(&b"ab"[..]));
        assert_eq!(t.data_len(), 10);
    }

    #[test]
    fn test_prefix_and_child() {
        let mut t = Tuple::from_slices(&[b"a", b"b", b"c"]);
        t.set_min_rec(true);
        let p = t.prefix(2);
        assert_eq!(p.n_fields(), 2);
        assert!(!p.is_min_rec());
        let ptr = p.with_child(PageId(9));
        assert_eq!(ptr.field(2), Some(&[0, 0, 0, 9][..]));
    }
}

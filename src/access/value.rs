use crate::storage::error::{StorageError, StorageResult};

/// Column types an index field can hold.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DataType {
    Boolean = 1,
    Int32 = 2,
    Int64 = 3,
    Varchar = 4,
    Binary = 5,
    /// Minimum bounding rectangle, four `f64` (xmin, xmax, ymin, ymax).
    Mbr = 6,
}

impl DataType {
    pub fn from_u8(value: u8) -> StorageResult<Self> {
        match value {
            1 => Ok(DataType::Boolean),
            2 => Ok(DataType::Int32),
            3 => Ok(DataType::Int64),
            4 => Ok(DataType::Varchar),
            5 => Ok(DataType::Binary),
            6 => Ok(DataType::Mbr),
            _ => Err(StorageError::InvalidTuple(format!(
                "Unknown data type: {}",
                value
            ))),
        }
    }

    /// Encoded width for fixed-size types.
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            DataType::Boolean => Some(1),
            DataType::Int32 => Some(4),
            DataType::Int64 => Some(8),
            DataType::Mbr => Some(32),
            DataType::Varchar | DataType::Binary => None,
        }
    }
}

/// Typed field values. Encoded as memcmp-comparable bytes so that index
/// comparison never needs to know the type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Int32(_) => Some(DataType::Int32),
            Value::Int64(_) => Some(DataType::Int64),
            Value::String(_) => Some(DataType::Varchar),
            Value::Bytes(_) => Some(DataType::Binary),
        }
    }

    pub fn is_compatible_with(&self, data_type: DataType) -> bool {
        match (self, data_type) {
            (Value::Null, _) => true,
            (Value::Boolean(_), DataType::Boolean) => true,
            (Value::Int32(_), DataType::Int32) => true,
            (Value::Int64(_), DataType::Int64) => true,
            (Value::String(_), DataType::Varchar) => true,
            (Value::Bytes(_), DataType::Binary) => true,
            (Value::Bytes(b), DataType::Mbr) => b.len() == 32,
            _ => false,
        }
    }

    /// Byte image whose unsigned lexicographic order equals the value order.
    /// `None` for SQL NULL.
    pub fn encode(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Boolean(b) => Some(vec![*b as u8]),
            Value::Int32(i) => Some(encode_i32(*i).to_vec()),
            Value::Int64(i) => Some(encode_i64(*i).to_vec()),
            Value::String(s) => Some(s.as_bytes().to_vec()),
            Value::Bytes(b) => Some(b.clone()),
        }
    }

    pub fn decode(data_type: DataType, bytes: Option<&[u8]>) -> StorageResult<Value> {
        let bytes = match bytes {
            None => return Ok(Value::Null),
            Some(b) => b,
        };
        if let Some(len) = data_type.fixed_len() {
            if bytes.len() != len {
                return Err(StorageError::InvalidTuple(format!(
                    "{:?} field has {} bytes, expected {}",
                    data_type,
                    bytes.len(),
                    len
                )));
            }
        }
        Ok(match data_type {
            DataType::Boolean => Value::Boolean(bytes[0] != 0),
            DataType::Int32 => Value::Int32(decode_i32(bytes)),
            DataType::Int64 => Value::Int64(decode_i64(bytes)),
            DataType::Varchar => Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| StorageError::InvalidTuple(e.to_string()))?,
            ),
            DataType::Binary | DataType::Mbr => Value::Bytes(bytes.to_vec()),
        })
    }
}

pub fn encode_u32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

pub fn encode_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

pub fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

/// Sign bit flipped so negative numbers sort first.
pub fn encode_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_i64(bytes: &[u8]) -> i64 {
    (decode_u64(bytes) ^ (1 << 63)) as i64
}

pub fn encode_i32(v: i32) -> [u8; 4] {
    ((v as u32) ^ (1 << 31)).to_be_bytes()
}

pub fn decode_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    (u32::from_be_bytes(buf) ^ (1 << 31)) as i32
}

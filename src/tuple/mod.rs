use self::value::Value;
use crate::storage::StoreResult;

pub mod value;

pub type Row = Vec<Value>;

/// Converts rows to and from the bytes a page store persists.
pub trait DataType: Send + Sync {
    fn encode(&self, row: &[Value], buffer: &mut Vec<u8>);
    fn decode(&self, bytes: &[u8]) -> StoreResult<Row>;
}

/// Encodes a row as the concatenation of its byte-comparable values, so encoded keys
/// sort like the rows they represent.
#[derive(Copy, Clone, Debug, Default)]
pub struct ValueDataType;

impl DataType for ValueDataType {
    fn encode(&self, row: &[Value], buffer: &mut Vec<u8>) {
        for value in row {
            value.serialize_value(buffer);
        }
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<Row> {
        let mut row = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (value, len) = Value::parse_value(&bytes[pos..])?;
            row.push(value);
            pos += len;
        }
        Ok(row)
    }
}

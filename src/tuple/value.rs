use std::cmp::Ordering;

use crate::storage::{PageStoreError, StoreResult};

const TAG_NULL: u8 = 0x00;
const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_STRING: u8 = 0x03;

const STRING_ESCAPE: u8 = 0x00;
const STRING_ESCAPED_ZERO: u8 = 0xFF;
const STRING_TERMINATOR: u8 = 0x00;

const SIGN_BIT: u64 = 1 << 63;

#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    String(String),
}

impl Value {
    /// Appends the byte-comparable encoding of this value.
    ///
    /// Encoded values compare bytewise in the same order as [`Value::compare`]:
    /// Null < Boolean < Integer < String, integers are stored big endian with the
    /// sign bit flipped and strings are zero-escaped and zero-terminated.
    pub fn serialize_value(&self, buffer: &mut Vec<u8>) {
        match self {
            Value::Null => buffer.push(TAG_NULL),
            Value::Boolean(b) => {
                buffer.push(TAG_BOOLEAN);
                buffer.push(*b as u8);
            }
            Value::Integer(val) => {
                buffer.push(TAG_INTEGER);
                buffer.extend_from_slice(&((*val as u64) ^ SIGN_BIT).to_be_bytes());
            }
            Value::String(val) => {
                buffer.push(TAG_STRING);
                for byte in val.as_bytes() {
                    if *byte == STRING_ESCAPE {
                        buffer.push(STRING_ESCAPE);
                        buffer.push(STRING_ESCAPED_ZERO);
                    } else {
                        buffer.push(*byte);
                    }
                }
                buffer.push(STRING_ESCAPE);
                buffer.push(STRING_TERMINATOR);
            }
        }
    }

    /// Parses one value from the front of `bytes`.
    /// Returns the value and the number of bytes it occupied.
    pub fn parse_value(bytes: &[u8]) -> StoreResult<(Self, usize)> {
        let truncated = || PageStoreError::corrupt("Encoded value is truncated");
        let tag = *bytes.first().ok_or_else(truncated)?;
        match tag {
            TAG_NULL => Ok((Value::Null, 1)),
            TAG_BOOLEAN => {
                let val = *bytes.get(1).ok_or_else(truncated)?;
                Ok((Value::Boolean(val == 1), 2))
            }
            TAG_INTEGER => {
                let raw: [u8; 8] = bytes
                    .get(1..9)
                    .ok_or_else(truncated)?
                    .try_into()
                    .map_err(|_| truncated())?;
                let val = (u64::from_be_bytes(raw) ^ SIGN_BIT) as i64;
                Ok((Value::Integer(val), 9))
            }
            TAG_STRING => {
                let mut raw = Vec::new();
                let mut pos = 1;
                loop {
                    let byte = *bytes.get(pos).ok_or_else(truncated)?;
                    if byte == STRING_ESCAPE {
                        let next = *bytes.get(pos + 1).ok_or_else(truncated)?;
                        pos += 2;
                        match next {
                            STRING_TERMINATOR => break,
                            STRING_ESCAPED_ZERO => raw.push(0),
                            other => {
                                return Err(PageStoreError::corrupt(format!(
                                    "Invalid escape byte {other:#x} in encoded string"
                                )))
                            }
                        }
                    } else {
                        raw.push(byte);
                        pos += 1;
                    }
                }
                let val = String::from_utf8(raw).map_err(|e| {
                    PageStoreError::corrupt(format!("Encoded string is not utf-8: {e}"))
                })?;
                Ok((Value::String(val), pos))
            }
            other => Err(PageStoreError::corrupt(format!(
                "Unknown value tag {other:#x}"
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Value::Null
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Boolean(_) => TAG_BOOLEAN,
            Value::Integer(_) => TAG_INTEGER,
            Value::String(_) => TAG_STRING,
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

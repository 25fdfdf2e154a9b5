use super::page_store::{PageStoreError, StoreResult};

const U8_SIZE: usize = std::mem::size_of::<u8>();
const U32_SIZE: usize = std::mem::size_of::<u32>();
const U64_SIZE: usize = std::mem::size_of::<u64>();

pub(crate) struct Serializer {
    buffer: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn serialize_u8(&mut self, val: u8) {
        self.buffer.extend_from_slice(val.to_be_bytes().as_slice());
    }

    pub fn serialize_u32(&mut self, val: u32) {
        self.buffer.extend_from_slice(val.to_be_bytes().as_slice());
    }

    pub fn serialize_u64(&mut self, val: u64) {
        self.buffer.extend_from_slice(val.to_be_bytes().as_slice());
    }

    /// Writes a length prefixed byte string.
    pub fn serialize_bytes(&mut self, bytes: &[u8]) {
        self.serialize_u32(bytes.len() as u32);
        self.buffer.extend_from_slice(bytes);
    }

    pub fn serialize_str(&mut self, val: &str) {
        self.serialize_bytes(val.as_bytes());
    }

    pub fn serialize_option_str(&mut self, val: Option<&str>) {
        match val {
            Some(val) => {
                self.serialize_u8(1);
                self.serialize_str(val);
            }
            None => self.serialize_u8(0),
        }
    }

    pub fn end(self) -> Vec<u8> {
        self.buffer
    }
}

pub(crate) struct Deserializer<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buffer.len()
    }

    fn take(&mut self, count: usize) -> StoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|end| *end <= self.buffer.len())
            .ok_or_else(|| {
                PageStoreError::corrupt(format!(
                    "Record truncated: need {} bytes at offset {}, have {}",
                    count,
                    self.pos,
                    self.buffer.len()
                ))
            })?;
        let slice = &self.buffer[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn deserialize_u8(&mut self) -> StoreResult<u8> {
        Ok(self.take(U8_SIZE)?[0])
    }

    pub fn deserialize_u32(&mut self) -> StoreResult<u32> {
        let mut bytes = [0u8; U32_SIZE];
        bytes.copy_from_slice(self.take(U32_SIZE)?);
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn deserialize_u64(&mut self) -> StoreResult<u64> {
        let mut bytes = [0u8; U64_SIZE];
        bytes.copy_from_slice(self.take(U64_SIZE)?);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn deserialize_bytes(&mut self) -> StoreResult<&'a [u8]> {
        let len = self.deserialize_u32()? as usize;
        self.take(len)
    }

    pub fn deserialize_string(&mut self) -> StoreResult<String> {
        let bytes = self.deserialize_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| PageStoreError::corrupt(format!("Invalid utf-8 in record: {e}")))
    }

    pub fn deserialize_option_string(&mut self) -> StoreResult<Option<String>> {
        match self.deserialize_u8()? {
            0 => Ok(None),
            _ => self.deserialize_string().map(Some),
        }
    }
}

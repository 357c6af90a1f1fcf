#![forbid(unsafe_code)]
//! Length-prefixed little-endian encoding shared by the table, snapshot
//! and merge log codecs.

use core::convert::TryInto;

use crate::types::{GraphError, Result};

const U64_LEN: usize = core::mem::size_of::<u64>();
const U32_LEN: usize = core::mem::size_of::<u32>();

/// Appends `v` as 8 little-endian bytes.
pub fn put_u64(dst: &mut Vec<u8>, v: u64) {
    dst.extend_from_slice(&v.to_le_bytes());
}

/// Appends `v` as 4 little-endian bytes.
pub fn put_u32(dst: &mut Vec<u8>, v: u32) {
    dst.extend_from_slice(&v.to_le_bytes());
}

/// Appends a `u64` length prefix followed by the bytes themselves.
pub fn put_len_prefixed(dst: &mut Vec<u8>, bytes: &[u8]) {
    put_u64(dst, bytes.len() as u64);
    dst.extend_from_slice(bytes);
}

/// Encoded size of a length-prefixed field holding `len` bytes.
pub const fn len_prefixed_size(len: usize) -> usize {
    U64_LEN + len
}

/// Bounds-checked cursor over an encoded buffer.
///
/// Every read that would run past the end reports `CorruptTable`
/// tagged with `what`, so truncated inputs never panic.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `buf`; `what` names the structure in error messages.
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once every byte has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads a little-endian `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        let raw = self.take(U64_LEN)?;
        Ok(u64::from_le_bytes(raw.try_into().map_err(|_| self.truncated())?))
    }

    /// Reads a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        let raw = self.take(U32_LEN)?;
        Ok(u32::from_le_bytes(raw.try_into().map_err(|_| self.truncated())?))
    }

    /// Reads a single byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a `u64`-length-prefixed byte run.
    pub fn len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.u64()?;
        let len = usize::try_from(len).map_err(|_| self.truncated())?;
        self.take(len)
    }

    /// Reads a `u64`-length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String> {
        let raw = self.len_prefixed()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| GraphError::corrupt(format!("{}: key is not valid UTF-8", self.what)))
    }

    /// Consumes exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(self.truncated());
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn truncated(&self) -> GraphError {
        GraphError::corrupt(format!("{} truncated at offset {}", self.what, self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_walks_prefixed_fields() -> Result<()> {
        let mut buf = Vec::new();
        put_u64(&mut buf, 2);
        put_len_prefixed(&mut buf, b"alpha");
        put_u32(&mut buf, 7);
        buf.push(1);
        let mut reader = Reader::new(&buf, "test");
        assert_eq!(reader.u64()?, 2);
        assert_eq!(reader.string()?, "alpha");
        assert_eq!(reader.u32()?, 7);
        assert_eq!(reader.u8()?, 1);
        assert!(reader.is_exhausted());
        Ok(())
    }

    #[test]
    fn overlong_prefix_is_corruption() {
        let mut buf = Vec::new();
        put_u64(&mut buf, 1 << 40);
        buf.extend_from_slice(b"short");
        let mut reader = Reader::new(&buf, "test");
        assert!(matches!(
            reader.len_prefixed(),
            Err(GraphError::CorruptTable(_))
        ));
    }
}

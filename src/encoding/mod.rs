//! Encoding Module
//!
//! Low-level binary primitives shared by every on-disk structure.
//!
//! ## Responsibilities
//! - Varint (LEB128) and fixed-width big-endian integers
//! - A bounds-checked `ByteReader` for the inverse direction
//! - Compressed byte/uint64/string blocks (see `blocks`)
//! - Timestamp column codec (see `timestamps`)

mod blocks;
mod timestamps;

pub use blocks::{
    compress_zstd, decompress_zstd, marshal_bytes_block, marshal_strings_block,
    marshal_uint64_block,
};
pub use timestamps::{marshal_timestamps, unmarshal_timestamps, TimestampsMarshalType};

use crate::error::{LogDbError, Result};

// =============================================================================
// Writers
// =============================================================================

/// Append `v` as a LEB128 varint
pub fn put_varint(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    dst.push(v as u8);
}

/// Append `v` as a zigzag-encoded varint
pub fn put_varint_i64(dst: &mut Vec<u8>, v: i64) {
    put_varint(dst, zigzag_encode(v));
}

pub fn put_u16(dst: &mut Vec<u8>, v: u16) {
    dst.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u32(dst: &mut Vec<u8>, v: u32) {
    dst.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u64(dst: &mut Vec<u8>, v: u64) {
    dst.extend_from_slice(&v.to_be_bytes());
}

/// Append `data` prefixed by its varint length
pub fn put_bytes(dst: &mut Vec<u8>, data: &[u8]) {
    put_varint(dst, data.len() as u64);
    dst.extend_from_slice(data);
}

pub fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

// =============================================================================
// Reader
// =============================================================================

/// Bounds-checked cursor over an encoded buffer
///
/// Every method fails with `LogDbError::Decode` instead of panicking when the
/// input is truncated.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    src: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src }
    }

    /// Bytes not consumed yet
    pub fn remaining(&self) -> &'a [u8] {
        self.src
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let (&b, tail) = self
            .src
            .split_first()
            .ok_or_else(|| decode_err("cannot read byte from empty buffer"))?;
        self.src = tail;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_exact(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_exact(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_exact(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0u32;
        for (i, &b) in self.src.iter().enumerate() {
            if shift >= 64 {
                return Err(decode_err("varint overflows 64 bits"));
            }
            v |= u64::from(b & 0x7f) << shift;
            if b < 0x80 {
                self.src = &self.src[i + 1..];
                return Ok(v);
            }
            shift += 7;
        }
        Err(decode_err("truncated varint"))
    }

    pub fn read_varint_i64(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.read_varint()?))
    }

    /// Read exactly `n` raw bytes
    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.src.len() < n {
            return Err(decode_err(format!(
                "cannot read {} bytes; only {} bytes left",
                n,
                self.src.len()
            )));
        }
        let (head, tail) = self.src.split_at(n);
        self.src = tail;
        Ok(head)
    }

    /// Read a varint length followed by that many bytes
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.read_varint()?;
        let n = usize::try_from(n).map_err(|_| decode_err("length does not fit usize"))?;
        self.read_exact(n)
    }

    /// Like `read_bytes`, but the payload must be valid UTF-8
    pub fn read_str(&mut self) -> Result<&'a str> {
        let b = self.read_bytes()?;
        std::str::from_utf8(b).map_err(|e| decode_err(format!("invalid utf-8 string: {}", e)))
    }

    /// Fail if unread bytes are left
    pub fn expect_end(&self, what: &str) -> Result<()> {
        if !self.src.is_empty() {
            return Err(decode_err(format!(
                "unexpected {} tail bytes after {}",
                self.src.len(),
                what
            )));
        }
        Ok(())
    }
}

pub(crate) fn decode_err(msg: impl Into<String>) -> LogDbError {
    LogDbError::Decode(msg.into())
}

// =============================================================================
// Tests
// =============================================================================

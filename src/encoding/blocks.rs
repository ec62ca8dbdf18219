//! Compressed blocks
//!
//! Byte, uint64 and string sequences are stored as small self-describing
//! blocks: a type tag followed by either plain or zstd-compressed payload.

use crate::error::Result;

use super::{decode_err, put_u16, put_u32, put_u64, put_varint, ByteReader};

/// Payloads shorter than this are stored without compression
const PLAIN_BYTES_LIMIT: usize = 128;

const BYTES_BLOCK_PLAIN: u8 = 0;
const BYTES_BLOCK_ZSTD: u8 = 1;

/// Uint64 block tags: 0..=3 hold a value per item, 4..=7 hold one shared value
const UINT_BLOCK_CONST_OFFSET: u8 = 4;

// =============================================================================
// zstd
// =============================================================================

/// Compress with a level chosen by input size
pub fn compress_zstd(src: &[u8]) -> Result<Vec<u8>> {
    let level = if src.len() <= 512 {
        1
    } else if src.len() <= 4 * 1024 {
        2
    } else {
        3
    };
    Ok(zstd::bulk::compress(src, level)?)
}

pub fn decompress_zstd(src: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(src)
        .map_err(|e| decode_err(format!("cannot decompress zstd block: {}", e)))
}

// =============================================================================
// Bytes Block
// =============================================================================

/// Append `src` as a bytes block
pub fn marshal_bytes_block(dst: &mut Vec<u8>, src: &[u8]) -> Result<()> {
    if src.len() < PLAIN_BYTES_LIMIT {
        dst.push(BYTES_BLOCK_PLAIN);
        dst.push(src.len() as u8);
        dst.extend_from_slice(src);
        return Ok(());
    }
    let compressed = compress_zstd(src)?;
    dst.push(BYTES_BLOCK_ZSTD);
    put_varint(dst, compressed.len() as u64);
    dst.extend_from_slice(&compressed);
    Ok(())
}

impl<'a> ByteReader<'a> {
    /// Read a block written by `marshal_bytes_block`
    pub fn read_bytes_block(&mut self) -> Result<Vec<u8>> {
        match self.read_u8()? {
            BYTES_BLOCK_PLAIN => {
                let n = self.read_u8()? as usize;
                Ok(self.read_exact(n)?.to_vec())
            }
            BYTES_BLOCK_ZSTD => {
                let compressed = self.read_bytes()?;
                decompress_zstd(compressed)
            }
            t => Err(decode_err(format!("unknown bytes block type {}", t))),
        }
    }

    /// Read a block written by `marshal_uint64_block` holding `items` values
    pub fn read_uint64_block(&mut self, items: usize) -> Result<Vec<u64>> {
        let tag = self.read_u8()?;
        if tag >= UINT_BLOCK_CONST_OFFSET {
            let width = width_for_tag(tag - UINT_BLOCK_CONST_OFFSET)?;
            let b = self.read_exact(width)?;
            let v = read_be(b);
            return Ok(vec![v; items]);
        }
        let width = width_for_tag(tag)?;
        let data = self.read_bytes_block()?;
        if data.len() != items * width {
            return Err(decode_err(format!(
                "unexpected uint64 block size; got {} bytes; want {} bytes for {} items",
                data.len(),
                items * width,
                items
            )));
        }
        Ok(data.chunks_exact(width).map(read_be).collect())
    }

    /// Read a block written by `marshal_strings_block` holding `items` values
    pub fn read_strings_block(&mut self, items: usize) -> Result<Vec<Vec<u8>>> {
        let lens = self.read_uint64_block(items)?;
        let data = self.read_bytes_block()?;

        let total: u64 = lens.iter().sum();
        if items >= 2 && lens[0] == data.len() as u64 && total != data.len() as u64 {
            // const block: a single copy is shared by every item
            return Ok(vec![data; items]);
        }
        if total != data.len() as u64 {
            return Err(decode_err(format!(
                "strings block size mismatch; lengths sum to {}; data has {} bytes",
                total,
                data.len()
            )));
        }
        let mut values = Vec::with_capacity(items);
        let mut offset = 0usize;
        for n in lens {
            let n = n as usize;
            values.push(data[offset..offset + n].to_vec());
            offset += n;
        }
        Ok(values)
    }
}

// =============================================================================
// Uint64 Block
// =============================================================================

/// Append `values` using the narrowest width that fits the maximum
pub fn marshal_uint64_block(dst: &mut Vec<u8>, values: &[u64]) -> Result<()> {
    let max = values.iter().copied().max().unwrap_or(0);
    let tag = tag_for_max(max);

    if values.len() >= 2 && values.iter().all(|&v| v == values[0]) {
        dst.push(UINT_BLOCK_CONST_OFFSET + tag);
        put_width(dst, tag, values[0]);
        return Ok(());
    }

    let mut buf = Vec::with_capacity(values.len() * (1 << tag));
    for &v in values {
        put_width(&mut buf, tag, v);
    }
    dst.push(tag);
    marshal_bytes_block(dst, &buf)
}

/// Append `values` as a strings block
pub fn marshal_strings_block<T: AsRef<[u8]>>(dst: &mut Vec<u8>, values: &[T]) -> Result<()> {
    let lens: Vec<u64> = values.iter().map(|v| v.as_ref().len() as u64).collect();
    marshal_uint64_block(dst, &lens)?;

    let all_equal = values.len() >= 2
        && lens[0] > 0
        && values.iter().all(|v| v.as_ref() == values[0].as_ref());
    if all_equal {
        return marshal_bytes_block(dst, values[0].as_ref());
    }
    let mut data = Vec::with_capacity(lens.iter().sum::<u64>() as usize);
    for v in values {
        data.extend_from_slice(v.as_ref());
    }
    marshal_bytes_block(dst, &data)
}

// =============================================================================
// Private Helpers
// =============================================================================

fn tag_for_max(max: u64) -> u8 {
    if max <= u8::MAX as u64 {
        0
    } else if max <= u16::MAX as u64 {
        1
    } else if max <= u32::MAX as u64 {
        2
    } else {
        3
    }
}

fn width_for_tag(tag: u8) -> Result<usize> {
    match tag {
        0..=3 => Ok(1 << tag),
        _ => Err(decode_err(format!("unknown uint64 block type {}", tag))),
    }
}

fn put_width(dst: &mut Vec<u8>, tag: u8, v: u64) {
    match tag {
        0 => dst.push(v as u8),
        1 => put_u16(dst, v as u16),
        2 => put_u32(dst, v as u32),
        _ => put_u64(dst, v),
    }
}

fn read_be(b: &[u8]) -> u64 {
    b.iter().fold(0u64, |acc, &x| (acc << 8) | u64::from(x))
}

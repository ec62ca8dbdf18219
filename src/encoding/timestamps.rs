//! Timestamp column codec
//!
//! Timestamps inside a block are sorted, so they are stored as deltas. Evenly
//! spaced series collapse to a first value plus one delta.

use crate::error::Result;

use super::{decode_err, marshal_bytes_block, put_varint_i64, ByteReader};

/// How a timestamps block is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimestampsMarshalType {
    /// zigzag varint of the first value, then zigzag varint deltas, in a bytes block
    Deltas = 1,
    /// first value and one delta shared by every step
    ConstDelta = 2,
}

impl TimestampsMarshalType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Deltas),
            2 => Ok(Self::ConstDelta),
            _ => Err(decode_err(format!("unknown timestamps marshal type {}", v))),
        }
    }
}

/// Append encoded `timestamps` to `dst` and return the layout used
pub fn marshal_timestamps(dst: &mut Vec<u8>, timestamps: &[i64]) -> Result<TimestampsMarshalType> {
    if timestamps.len() >= 2 {
        let delta = timestamps[1].wrapping_sub(timestamps[0]);
        let const_delta = timestamps
            .windows(2)
            .all(|w| w[1].wrapping_sub(w[0]) == delta);
        if const_delta {
            put_varint_i64(dst, timestamps[0]);
            put_varint_i64(dst, delta);
            return Ok(TimestampsMarshalType::ConstDelta);
        }
    }

    let mut buf = Vec::with_capacity(timestamps.len() * 2);
    let mut prev = 0i64;
    for &ts in timestamps {
        put_varint_i64(&mut buf, ts.wrapping_sub(prev));
        prev = ts;
    }
    marshal_bytes_block(dst, &buf)?;
    Ok(TimestampsMarshalType::Deltas)
}

/// Decode `rows` timestamps written by `marshal_timestamps`
pub fn unmarshal_timestamps(
    marshal_type: TimestampsMarshalType,
    src: &[u8],
    rows: usize,
) -> Result<Vec<i64>> {
    let mut r = ByteReader::new(src);
    let mut out = Vec::with_capacity(rows);
    match marshal_type {
        TimestampsMarshalType::ConstDelta => {
            let first = r.read_varint_i64()?;
            let delta = r.read_varint_i64()?;
            let mut ts = first;
            for _ in 0..rows {
                out.push(ts);
                ts = ts.wrapping_add(delta);
            }
        }
        TimestampsMarshalType::Deltas => {
            let data = r.read_bytes_block()?;
            let mut dr = ByteReader::new(&data);
            let mut prev = 0i64;
            for _ in 0..rows {
                prev = prev.wrapping_add(dr.read_varint_i64()?);
                out.push(prev);
            }
            dr.expect_end("timestamps")?;
        }
    }
    r.expect_end("timestamps block")?;
    Ok(out)
}

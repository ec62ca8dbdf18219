//! Values Module
//!
//! Column values encoding.
//!
//! ## Responsibilities
//! - Pick the most compact lossless representation for a column's values
//! - Keep small-cardinality columns as a dictionary of at most 8 entries
//! - Track min/max of numeric columns for range pruning
//! - Decode any representation back to the original strings

mod parse;

pub use parse::{
    format_f64, format_ipv4, format_iso8601, try_parse_f64, try_parse_i64, try_parse_ipv4,
    try_parse_iso8601, try_parse_u64,
};

use crate::encoding::{decode_err, put_bytes, ByteReader};
use crate::error::Result;

/// Maximum number of entries in a values dictionary
pub const MAX_DICT_LEN: usize = 8;

/// Maximum total size of the values in a dictionary
pub const MAX_DICT_SIZE_BYTES: usize = 256;

/// Logical type of an encoded column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Unknown = 0,
    String = 1,
    Dict = 2,
    Uint8 = 3,
    Uint16 = 4,
    Uint32 = 5,
    Uint64 = 6,
    Float64 = 7,
    IPv4 = 8,
    TimestampIso8601 = 9,
    Int64 = 10,
}

impl ValueType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Unknown,
            1 => Self::String,
            2 => Self::Dict,
            3 => Self::Uint8,
            4 => Self::Uint16,
            5 => Self::Uint32,
            6 => Self::Uint64,
            7 => Self::Float64,
            8 => Self::IPv4,
            9 => Self::TimestampIso8601,
            10 => Self::Int64,
            _ => return Err(decode_err(format!("unknown value type {}", v))),
        })
    }

    /// Size of every encoded value for fixed-width types
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Dict | Self::Uint8 => Some(1),
            Self::Uint16 => Some(2),
            Self::Uint32 | Self::IPv4 => Some(4),
            Self::Uint64 | Self::Float64 | Self::TimestampIso8601 | Self::Int64 => Some(8),
            Self::Unknown | Self::String => None,
        }
    }

    /// Types whose header carries min/max
    pub fn has_min_max(self) -> bool {
        !matches!(self, Self::Unknown | Self::String | Self::Dict)
    }
}

// =============================================================================
// Values Dictionary
// =============================================================================

/// Distinct values of a small-cardinality column
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValuesDict {
    pub values: Vec<String>,
}

impl ValuesDict {
    pub fn reset(&mut self) {
        self.values.clear();
    }

    /// Index of `v`, adding it when there is room
    pub fn get_or_add(&mut self, v: &str) -> Option<u8> {
        if let Some(idx) = self.values.iter().position(|x| x == v) {
            return Some(idx as u8);
        }
        if self.values.len() >= MAX_DICT_LEN {
            return None;
        }
        let size: usize = self.values.iter().map(|x| x.len()).sum();
        if size + v.len() > MAX_DICT_SIZE_BYTES {
            return None;
        }
        self.values.push(v.to_string());
        Some((self.values.len() - 1) as u8)
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.push(self.values.len() as u8);
        for v in &self.values {
            put_bytes(dst, v.as_bytes());
        }
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> Result<Self> {
        let n = r.read_u8()? as usize;
        if n > MAX_DICT_LEN {
            return Err(decode_err(format!(
                "too many dict entries: {}; cannot exceed {}",
                n, MAX_DICT_LEN
            )));
        }
        let mut values = Vec::with_capacity(n);
        let mut size = 0usize;
        for _ in 0..n {
            let v = r.read_str()?;
            size += v.len();
            values.push(v.to_string());
        }
        if size > MAX_DICT_SIZE_BYTES {
            return Err(decode_err(format!(
                "too big dict: {} bytes; cannot exceed {} bytes",
                size, MAX_DICT_SIZE_BYTES
            )));
        }
        Ok(Self { values })
    }
}

// =============================================================================
// Encoder
// =============================================================================

/// Result of encoding one column
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValues {
    pub value_type: ValueType,
    pub min_value: u64,
    pub max_value: u64,
    pub values: Vec<Vec<u8>>,
    pub dict: ValuesDict,
}

/// Encode `values` with the first representation that accepts all of them
///
/// Order: dict, uint, int64, float64, ipv4, iso8601 timestamp, string.
pub fn encode_values<S: AsRef<str>>(values: &[S]) -> EncodedValues {
    if values.is_empty() {
        return string_encoding(values);
    }
    if let Some(ev) = try_dict_encoding(values) {
        return ev;
    }
    if let Some(ev) = try_uint_encoding(values) {
        return ev;
    }
    if let Some(ev) = try_int64_encoding(values) {
        return ev;
    }
    if let Some(ev) = try_float64_encoding(values) {
        return ev;
    }
    if let Some(ev) = try_ipv4_encoding(values) {
        return ev;
    }
    if let Some(ev) = try_iso8601_encoding(values) {
        return ev;
    }
    string_encoding(values)
}

fn string_encoding<S: AsRef<str>>(values: &[S]) -> EncodedValues {
    EncodedValues {
        value_type: ValueType::String,
        min_value: 0,
        max_value: 0,
        values: values.iter().map(|v| v.as_ref().as_bytes().to_vec()).collect(),
        dict: ValuesDict::default(),
    }
}

fn try_dict_encoding<S: AsRef<str>>(values: &[S]) -> Option<EncodedValues> {
    let mut dict = ValuesDict::default();
    let mut encoded = Vec::with_capacity(values.len());
    for v in values {
        let idx = dict.get_or_add(v.as_ref())?;
        encoded.push(vec![idx]);
    }
    Some(EncodedValues {
        value_type: ValueType::Dict,
        min_value: 0,
        max_value: 0,
        values: encoded,
        dict,
    })
}

fn try_uint_encoding<S: AsRef<str>>(values: &[S]) -> Option<EncodedValues> {
    let nums: Vec<u64> = values
        .iter()
        .map(|v| try_parse_u64(v.as_ref()))
        .collect::<Option<_>>()?;
    let min = nums.iter().copied().min().unwrap_or(0);
    let max = nums.iter().copied().max().unwrap_or(0);
    let (value_type, width) = if max <= u8::MAX as u64 {
        (ValueType::Uint8, 1)
    } else if max <= u16::MAX as u64 {
        (ValueType::Uint16, 2)
    } else if max <= u32::MAX as u64 {
        (ValueType::Uint32, 4)
    } else {
        (ValueType::Uint64, 8)
    };
    let encoded = nums
        .iter()
        .map(|n| n.to_be_bytes()[8 - width..].to_vec())
        .collect();
    Some(EncodedValues {
        value_type,
        min_value: min,
        max_value: max,
        values: encoded,
        dict: ValuesDict::default(),
    })
}

fn try_int64_encoding<S: AsRef<str>>(values: &[S]) -> Option<EncodedValues> {
    let nums: Vec<i64> = values
        .iter()
        .map(|v| try_parse_i64(v.as_ref()))
        .collect::<Option<_>>()?;
    let min = nums.iter().copied().min().unwrap_or(0);
    let max = nums.iter().copied().max().unwrap_or(0);
    Some(EncodedValues {
        value_type: ValueType::Int64,
        min_value: min as u64,
        max_value: max as u64,
        values: nums.iter().map(|n| n.to_be_bytes().to_vec()).collect(),
        dict: ValuesDict::default(),
    })
}

fn try_float64_encoding<S: AsRef<str>>(values: &[S]) -> Option<EncodedValues> {
    let nums: Vec<f64> = values
        .iter()
        .map(|v| try_parse_f64(v.as_ref()))
        .collect::<Option<_>>()?;
    let min = nums.iter().copied().fold(f64::INFINITY, f64::min);
    let max = nums.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(EncodedValues {
        value_type: ValueType::Float64,
        min_value: min.to_bits(),
        max_value: max.to_bits(),
        values: nums.iter().map(|f| f.to_bits().to_be_bytes().to_vec()).collect(),
        dict: ValuesDict::default(),
    })
}

fn try_ipv4_encoding<S: AsRef<str>>(values: &[S]) -> Option<EncodedValues> {
    let ips: Vec<u32> = values
        .iter()
        .map(|v| try_parse_ipv4(v.as_ref()))
        .collect::<Option<_>>()?;
    let min = ips.iter().copied().min().unwrap_or(0);
    let max = ips.iter().copied().max().unwrap_or(0);
    Some(EncodedValues {
        value_type: ValueType::IPv4,
        min_value: u64::from(min),
        max_value: u64::from(max),
        values: ips.iter().map(|ip| ip.to_be_bytes().to_vec()).collect(),
        dict: ValuesDict::default(),
    })
}

fn try_iso8601_encoding<S: AsRef<str>>(values: &[S]) -> Option<EncodedValues> {
    let ts: Vec<i64> = values
        .iter()
        .map(|v| try_parse_iso8601(v.as_ref()))
        .collect::<Option<_>>()?;
    let min = ts.iter().copied().min().unwrap_or(0);
    let max = ts.iter().copied().max().unwrap_or(0);
    Some(EncodedValues {
        value_type: ValueType::TimestampIso8601,
        min_value: min as u64,
        max_value: max as u64,
        values: ts.iter().map(|t| t.to_be_bytes().to_vec()).collect(),
        dict: ValuesDict::default(),
    })
}

// =============================================================================
// Decoder
// =============================================================================

/// Convert one encoded value back to its string form
pub fn decode_value(value_type: ValueType, v: &[u8], dict: &ValuesDict) -> Result<String> {
    if let Some(width) = value_type.fixed_width() {
        if v.len() != width {
            return Err(decode_err(format!(
                "unexpected value size for {:?}; got {} bytes; want {} bytes",
                value_type,
                v.len(),
                width
            )));
        }
    }
    let n = v.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    Ok(match value_type {
        ValueType::String => String::from_utf8(v.to_vec())
            .map_err(|e| decode_err(format!("invalid utf-8 value: {}", e)))?,
        ValueType::Dict => dict
            .values
            .get(v[0] as usize)
            .cloned()
            .ok_or_else(|| {
                decode_err(format!(
                    "dict index {} out of range; dict has {} entries",
                    v[0],
                    dict.values.len()
                ))
            })?,
        ValueType::Uint8 | ValueType::Uint16 | ValueType::Uint32 | ValueType::Uint64 => {
            n.to_string()
        }
        ValueType::Int64 => (n as i64).to_string(),
        ValueType::Float64 => format_f64(f64::from_bits(n)),
        ValueType::IPv4 => format_ipv4(n as u32),
        ValueType::TimestampIso8601 => format_iso8601(n as i64),
        ValueType::Unknown => return Err(decode_err("cannot decode values of unknown type")),
    })
}

/// Decode a whole column
pub fn decode_values(
    value_type: ValueType,
    values: &[Vec<u8>],
    dict: &ValuesDict,
) -> Result<Vec<String>> {
    values
        .iter()
        .map(|v| decode_value(value_type, v, dict))
        .collect()
}

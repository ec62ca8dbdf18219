//! Typed value parsers and formatters
//!
//! A parser only accepts a string when formatting the parsed value gives back
//! exactly the same string, so typed encoding never changes what a reader sees.

use std::net::Ipv4Addr;

use chrono::{DateTime, NaiveDateTime, Utc};

const ISO8601_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const ISO8601_LEN: usize = "2006-01-02T15:04:05.000Z".len();

/// Longest string considered for float encoding
const MAX_FLOAT_LEN: usize = 20;

pub fn try_parse_u64(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

pub fn try_parse_i64(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    try_parse_u64(digits)?;
    if s == "-0" {
        return None;
    }
    s.parse().ok()
}

pub fn try_parse_f64(s: &str) -> Option<f64> {
    if s.is_empty() || s.len() > MAX_FLOAT_LEN {
        return None;
    }
    if !s.bytes().all(|b| b.is_ascii_digit() || b == b'.' || b == b'-') {
        return None;
    }
    let f: f64 = s.parse().ok()?;
    if format_f64(f) != s {
        return None;
    }
    Some(f)
}

pub fn format_f64(f: f64) -> String {
    format!("{}", f)
}

pub fn try_parse_ipv4(s: &str) -> Option<u32> {
    let ip: Ipv4Addr = s.parse().ok()?;
    if ip.to_string() != s {
        return None;
    }
    Some(u32::from(ip))
}

pub fn format_ipv4(v: u32) -> String {
    Ipv4Addr::from(v).to_string()
}

/// Parse `YYYY-MM-DDTHH:MM:SS.mmmZ` into unix nanoseconds
pub fn try_parse_iso8601(s: &str) -> Option<i64> {
    if s.len() != ISO8601_LEN || !s.ends_with('Z') {
        return None;
    }
    let dt = NaiveDateTime::parse_from_str(s, ISO8601_FORMAT).ok()?;
    let nanos = dt.and_utc().timestamp_nanos_opt()?;
    if format_iso8601(nanos) != s {
        return None;
    }
    Some(nanos)
}

pub fn format_iso8601(nanos: i64) -> String {
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    match DateTime::<Utc>::from_timestamp(secs, subsec) {
        Some(dt) => dt.format(ISO8601_FORMAT).to_string(),
        None => nanos.to_string(),
    }
}

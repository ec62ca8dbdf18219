//! Stream identity
//!
//! A stream is identified by its tenant plus a 128-bit hash of its canonical
//! stream tags. Rows inside every part are ordered by `(StreamId, timestamp)`.

use std::fmt;

use xxhash_rust::xxh3::xxh3_128;

use crate::encoding::{put_bytes, put_u32, put_u64, ByteReader};
use crate::error::Result;

/// Size of a marshaled `StreamId`
pub const STREAM_ID_SIZE: usize = 24;

/// Tenant owning a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId {
    pub account_id: u32,
    pub project_id: u32,
}

impl TenantId {
    pub fn new(account_id: u32, project_id: u32) -> Self {
        Self {
            account_id,
            project_id,
        }
    }
}

/// Stream identity; the primary sort and group key
///
/// Ordering compares the tenant first, then the hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub tenant: TenantId,
    pub id: u128,
}

impl StreamId {
    pub fn new(tenant: TenantId, id: u128) -> Self {
        Self { tenant, id }
    }

    /// Derive the id from canonical stream tags
    pub fn from_canonical_tags(tenant: TenantId, canonical: &[u8]) -> Self {
        Self {
            tenant,
            id: xxh3_128(canonical),
        }
    }

    /// Derive the id from `(name, value)` tag pairs in any order
    pub fn from_tags<N: AsRef<str>, V: AsRef<str>>(tenant: TenantId, tags: &[(N, V)]) -> Self {
        Self::from_canonical_tags(tenant, &canonical_stream_tags(tags))
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        put_u32(dst, self.tenant.account_id);
        put_u32(dst, self.tenant.project_id);
        put_u64(dst, (self.id >> 64) as u64);
        put_u64(dst, self.id as u64);
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> Result<Self> {
        let account_id = r.read_u32()?;
        let project_id = r.read_u32()?;
        let hi = r.read_u64()?;
        let lo = r.read_u64()?;
        Ok(Self {
            tenant: TenantId::new(account_id, project_id),
            id: (u128::from(hi) << 64) | u128::from(lo),
        })
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{:032x}",
            self.tenant.account_id, self.tenant.project_id, self.id
        )
    }
}

/// Canonical form of stream tags: pairs sorted by name, each length-prefixed
pub fn canonical_stream_tags<N: AsRef<str>, V: AsRef<str>>(tags: &[(N, V)]) -> Vec<u8> {
    let mut sorted: Vec<(&str, &str)> = tags
        .iter()
        .map(|(n, v)| (n.as_ref(), v.as_ref()))
        .collect();
    sorted.sort_unstable();
    let mut dst = Vec::new();
    for (name, value) in sorted {
        put_bytes(&mut dst, name.as_bytes());
        put_bytes(&mut dst, value.as_bytes());
    }
    dst
}

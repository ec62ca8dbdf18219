//! Column-name dictionary
//!
//! Every column in a part gets a small integer id in first-seen order. The
//! id list is persisted as `column_names.bin`, and the id -> bloom/values
//! shard table as `column_idxs.bin`, so a column keeps its shard for the
//! lifetime of the part.

use std::collections::{BTreeMap, HashMap};

use crate::encoding::{compress_zstd, decode_err, decompress_zstd, put_bytes, put_varint, ByteReader};
use crate::error::Result;

/// Assigns column name ids in first-seen order
#[derive(Debug, Clone, Default)]
pub struct ColumnNameIdGenerator {
    ids: HashMap<String, u64>,
    names: Vec<String>,
}

impl ColumnNameIdGenerator {
    pub fn get_or_assign(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u64;
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        id
    }

    /// Names indexed by id
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// zstd(varint count + length-prefixed names)
pub fn marshal_column_names(names: &[String]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    put_varint(&mut buf, names.len() as u64);
    for name in names {
        put_bytes(&mut buf, name.as_bytes());
    }
    compress_zstd(&buf)
}

pub fn unmarshal_column_names(src: &[u8]) -> Result<Vec<String>> {
    let data = decompress_zstd(src)?;
    let mut r = ByteReader::new(&data);
    let n = r.read_varint()?;
    let mut names = Vec::with_capacity(n.min(1 << 16) as usize);
    let mut seen = HashMap::new();
    for id in 0..n {
        let name = r.read_str()?.to_string();
        if let Some(prev) = seen.insert(name.clone(), id) {
            return Err(decode_err(format!(
                "duplicate column name {:?} at ids {} and {}",
                name, prev, id
            )));
        }
        names.push(name);
    }
    r.expect_end("column names")?;
    Ok(names)
}

/// zstd(varint count + varint (column id, shard) pairs)
pub fn marshal_column_idxs(idxs: &BTreeMap<u64, u64>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    put_varint(&mut buf, idxs.len() as u64);
    for (&id, &shard) in idxs {
        put_varint(&mut buf, id);
        put_varint(&mut buf, shard);
    }
    compress_zstd(&buf)
}

/// Decode the shard table into `column name -> shard`
pub fn unmarshal_column_idxs(
    src: &[u8],
    column_names: &[String],
    shards_count: u64,
) -> Result<HashMap<String, u64>> {
    let data = decompress_zstd(src)?;
    let mut r = ByteReader::new(&data);
    let n = r.read_varint()?;
    let mut idxs = HashMap::with_capacity(n.min(1 << 16) as usize);
    for _ in 0..n {
        let id = r.read_varint()?;
        let shard = r.read_varint()?;
        let name = column_names.get(id as usize).ok_or_else(|| {
            decode_err(format!(
                "column id {} is out of range; part has {} column names",
                id,
                column_names.len()
            ))
        })?;
        if shard >= shards_count {
            return Err(decode_err(format!(
                "shard {} for column {:?} is out of range; part has {} shards",
                shard, name, shards_count
            )));
        }
        idxs.insert(name.clone(), shard);
    }
    r.expect_end("column idxs")?;
    Ok(idxs)
}

//! Part Module
//!
//! Opened, immutable parts.
//!
//! ## Responsibilities
//! - `InmemoryPart`: build a part from a row batch and store it to disk
//! - `Part`: random-access query handle over a file part or an in-memory part
//!
//! The query surface exposes what a search engine needs to prune and read:
//! index block headers for time/stream pruning, block headers, columns
//! headers, and per-column bloom filters and values.

mod inmemory;

pub use inmemory::InmemoryPart;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::bloom::BloomFilter;
use crate::encoding::{decompress_zstd, unmarshal_timestamps, ByteReader};
use crate::error::{LogDbError, Result};
use crate::format::{
    bloom_shard_path, unmarshal_block_headers, unmarshal_column_idxs, unmarshal_column_names,
    unmarshal_index_block_headers, values_shard_path, Block, BlockData, BlockHeader, ColumnData,
    ColumnHeader, ColumnsHeader, ColumnsHeaderIndex, IndexBlockHeader, PartHeader,
    TimestampsData, BLOOM_FILENAME, COLUMNS_HEADER_FILENAME, COLUMNS_HEADER_INDEX_FILENAME,
    COLUMN_IDXS_FILENAME, COLUMN_NAMES_FILENAME, INDEX_FILENAME, MESSAGE_BLOOM_FILENAME,
    MESSAGE_VALUES_FILENAME, METAINDEX_FILENAME, TIMESTAMPS_FILENAME, VALUES_FILENAME,
};
use crate::values::{decode_values, ValueType};

// =============================================================================
// Random Access Readers
// =============================================================================

enum Source {
    File(Mutex<File>),
    Memory(Bytes),
}

/// Reads byte ranges of one part file
struct RangeReader {
    path: PathBuf,
    source: Source,
}

impl RangeReader {
    fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)?;
        Ok(Self {
            path,
            source: Source::File(Mutex::new(file)),
        })
    }

    fn memory(name: &str, data: &Bytes) -> Self {
        Self {
            path: PathBuf::from("inmemory").join(name),
            source: Source::Memory(data.clone()),
        }
    }

    fn read_at(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        match &self.source {
            Source::File(file) => {
                let mut buf = vec![0u8; size as usize];
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf).map_err(|e| {
                    if e.kind() == ErrorKind::UnexpectedEof {
                        self.out_of_range(offset, size)
                    } else {
                        e.into()
                    }
                })?;
                Ok(buf)
            }
            Source::Memory(data) => {
                let end = offset.checked_add(size).filter(|&end| end <= data.len() as u64);
                match end {
                    Some(end) => Ok(data[offset as usize..end as usize].to_vec()),
                    None => Err(self.out_of_range(offset, size)),
                }
            }
        }
    }

    fn out_of_range(&self, offset: u64, size: u64) -> LogDbError {
        LogDbError::corruption(
            &self.path,
            format!("range [{}, {}) is past the end of the file", offset, offset + size),
        )
    }
}

struct BloomValuesFiles {
    bloom: RangeReader,
    values: RangeReader,
}

struct PartFiles {
    index: RangeReader,
    columns_header_index: RangeReader,
    columns_header: RangeReader,
    timestamps: RangeReader,
    message: BloomValuesFiles,
    shards: Vec<BloomValuesFiles>,
}

// =============================================================================
// Part
// =============================================================================

/// Opened part
///
/// Readers hold it through a `PartRef`; the owning wrapper closes it once the
/// last reference is gone. Reads after `close` fail with `LogDbError::Closed`.
pub struct Part {
    header: PartHeader,
    path: PathBuf,
    index_block_headers: Vec<IndexBlockHeader>,
    column_names: Vec<String>,
    column_shards: HashMap<String, u64>,
    files: RwLock<Option<PartFiles>>,
}

impl std::fmt::Debug for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Part")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Part {
    /// Open the file part at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let header = PartHeader::read_from_dir(path)?;

        let metaindex = fs::read(path.join(METAINDEX_FILENAME))?;
        let column_names = fs::read(path.join(COLUMN_NAMES_FILENAME))?;
        let column_idxs = fs::read(path.join(COLUMN_IDXS_FILENAME))?;

        let open = |name: &str| RangeReader::open(path.join(name));
        let mut shards = Vec::with_capacity(header.bloom_values_shards_count as usize);
        for shard in 0..header.bloom_values_shards_count {
            shards.push(BloomValuesFiles {
                bloom: RangeReader::open(bloom_shard_path(path, shard))?,
                values: RangeReader::open(values_shard_path(path, shard))?,
            });
        }
        let files = PartFiles {
            index: open(INDEX_FILENAME)?,
            columns_header_index: open(COLUMNS_HEADER_INDEX_FILENAME)?,
            columns_header: open(COLUMNS_HEADER_FILENAME)?,
            timestamps: open(TIMESTAMPS_FILENAME)?,
            message: BloomValuesFiles {
                bloom: open(MESSAGE_BLOOM_FILENAME)?,
                values: open(MESSAGE_VALUES_FILENAME)?,
            },
            shards,
        };
        Self::new(header, path.to_path_buf(), &metaindex, &column_names, &column_idxs, files)
    }

    /// Open an in-memory part; buffers are shared, not copied
    pub fn from_inmemory_part(mp: &InmemoryPart) -> Result<Self> {
        let f = mp.files();
        let mut shards = Vec::new();
        if mp.header().bloom_values_shards_count > 0 {
            shards.push(BloomValuesFiles {
                bloom: RangeReader::memory(BLOOM_FILENAME, &f.field_bloom),
                values: RangeReader::memory(VALUES_FILENAME, &f.field_values),
            });
        }
        let files = PartFiles {
            index: RangeReader::memory(INDEX_FILENAME, &f.index),
            columns_header_index: RangeReader::memory(
                COLUMNS_HEADER_INDEX_FILENAME,
                &f.columns_header_index,
            ),
            columns_header: RangeReader::memory(COLUMNS_HEADER_FILENAME, &f.columns_header),
            timestamps: RangeReader::memory(TIMESTAMPS_FILENAME, &f.timestamps),
            message: BloomValuesFiles {
                bloom: RangeReader::memory(MESSAGE_BLOOM_FILENAME, &f.message_bloom),
                values: RangeReader::memory(MESSAGE_VALUES_FILENAME, &f.message_values),
            },
            shards,
        };
        Self::new(
            *mp.header(),
            PathBuf::new(),
            &f.metaindex,
            &f.column_names,
            &f.column_idxs,
            files,
        )
    }

    fn new(
        header: PartHeader,
        path: PathBuf,
        metaindex: &[u8],
        column_names: &[u8],
        column_idxs: &[u8],
        files: PartFiles,
    ) -> Result<Self> {
        let data = decompress_zstd(metaindex).map_err(|e| e.with_path(&path))?;
        let index_block_headers =
            unmarshal_index_block_headers(&data).map_err(|e| e.with_path(&path))?;
        let column_names = unmarshal_column_names(column_names).map_err(|e| e.with_path(&path))?;
        let column_shards =
            unmarshal_column_idxs(column_idxs, &column_names, header.bloom_values_shards_count)
                .map_err(|e| e.with_path(&path))?;
        Ok(Self {
            header,
            path,
            index_block_headers,
            column_names,
            column_shards,
            files: RwLock::new(Some(files)),
        })
    }

    pub fn header(&self) -> &PartHeader {
        &self.header
    }

    /// Directory of a file part; empty for in-memory parts
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index_block_headers(&self) -> &[IndexBlockHeader] {
        &self.index_block_headers
    }

    /// Column names indexed by column name id
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn read_block_headers(&self, ih: &IndexBlockHeader) -> Result<Vec<BlockHeader>> {
        self.with_files(|files| {
            let data = files.index.read_at(ih.index_block_offset, ih.index_block_size)?;
            let data = decompress_zstd(&data).map_err(|e| e.with_path(&files.index.path))?;
            unmarshal_block_headers(&data).map_err(|e| e.with_path(&files.index.path))
        })
    }

    pub fn read_timestamps(&self, bh: &BlockHeader) -> Result<Vec<i64>> {
        let th = &bh.timestamps_header;
        self.with_files(|files| {
            let data = files.timestamps.read_at(th.block_offset, th.block_size)?;
            unmarshal_timestamps(th.marshal_type, &data, bh.rows_count as usize)
                .map_err(|e| e.with_path(&files.timestamps.path))
        })
    }

    pub fn read_columns_header(&self, bh: &BlockHeader) -> Result<ColumnsHeader> {
        self.with_files(|files| {
            let data = files
                .columns_header_index
                .read_at(bh.columns_header_index_offset, bh.columns_header_index_size)?;
            let cshi = ColumnsHeaderIndex::unmarshal(&data)
                .map_err(|e| e.with_path(&files.columns_header_index.path))?;
            let data = files
                .columns_header
                .read_at(bh.columns_header_offset, bh.columns_header_size)?;
            ColumnsHeader::unmarshal(&data, &cshi, &self.column_names)
                .map_err(|e| e.with_path(&files.columns_header.path))
        })
    }

    /// Bloom filter of a column; `None` for dict columns, which carry none
    pub fn read_bloom_filter(&self, ch: &ColumnHeader) -> Result<Option<BloomFilter>> {
        if ch.value_type == ValueType::Dict {
            return Ok(None);
        }
        self.with_files(|files| {
            let bv = self.bloom_values_files(files, &ch.name)?;
            let data = bv.bloom.read_at(ch.bloom_filter_offset, ch.bloom_filter_size)?;
            let bf = BloomFilter::unmarshal(&data).map_err(|e| e.with_path(&bv.bloom.path))?;
            Ok(Some(bf))
        })
    }

    /// Decoded values of a column in a block with `rows` rows
    pub fn read_values(&self, ch: &ColumnHeader, rows: usize) -> Result<Vec<String>> {
        let data = self.read_values_data(ch)?;
        let mut r = ByteReader::new(&data);
        let encoded = r.read_strings_block(rows)?;
        r.expect_end("column values")?;
        decode_values(ch.value_type, &encoded, &ch.dict).map_err(|e| e.with_path(&self.path))
    }

    /// Decode a whole block
    pub fn read_block(&self, bh: &BlockHeader) -> Result<Block> {
        let th = &bh.timestamps_header;
        let ts_data = self.with_files(|files| files.timestamps.read_at(th.block_offset, th.block_size))?;
        let csh = self.read_columns_header(bh)?;

        let mut columns = Vec::with_capacity(csh.column_headers.len());
        for ch in csh.column_headers {
            let values_data = self.read_values_data(&ch)?;
            columns.push(ColumnData {
                name: ch.name,
                value_type: ch.value_type,
                min_value: ch.min_value,
                max_value: ch.max_value,
                dict: ch.dict,
                values_data,
                bloom_filter_data: Vec::new(),
            });
        }
        let bd = BlockData {
            stream_id: bh.stream_id,
            uncompressed_size_bytes: bh.uncompressed_size_bytes,
            rows_count: bh.rows_count,
            timestamps: TimestampsData {
                data: ts_data,
                marshal_type: th.marshal_type,
                min_timestamp: th.min_timestamp,
                max_timestamp: th.max_timestamp,
            },
            columns,
            const_columns: csh.const_columns,
        };
        Block::from_block_data(&bd).map_err(|e| e.with_path(&self.path))
    }

    /// Release file handles and buffers
    pub fn close(&self) {
        self.files.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.files.read().is_none()
    }

    fn read_values_data(&self, ch: &ColumnHeader) -> Result<Vec<u8>> {
        self.with_files(|files| {
            let bv = self.bloom_values_files(files, &ch.name)?;
            bv.values.read_at(ch.values_offset, ch.values_size)
        })
    }

    fn with_files<T>(&self, f: impl FnOnce(&PartFiles) -> Result<T>) -> Result<T> {
        let files = self.files.read();
        match files.as_ref() {
            Some(files) => f(files),
            None => Err(LogDbError::Closed),
        }
    }

    fn bloom_values_files<'a>(&self, files: &'a PartFiles, name: &str) -> Result<&'a BloomValuesFiles> {
        if name.is_empty() {
            return Ok(&files.message);
        }
        let shard = self.column_shards.get(name).copied().ok_or_else(|| {
            LogDbError::corruption(&self.path, format!("column {:?} has no bloom/values shard", name))
        })?;
        files.shards.get(shard as usize).ok_or_else(|| {
            LogDbError::corruption(
                &self.path,
                format!("shard {} is out of range; part has {} shards", shard, files.shards.len()),
            )
        })
    }
}

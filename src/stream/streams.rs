//! Per-file stream sets of a part
//!
//! `StreamWriters` owns one writer per part file and routes every column to
//! its bloom/values pair. `StreamReaders` is the mirror image used while
//! scanning a part from start to end.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{LogDbError, Result};
use crate::format::{
    bloom_shard_path, marshal_column_idxs, marshal_column_names, unmarshal_column_idxs,
    unmarshal_column_names, values_shard_path, ColumnNameIdGenerator, PartHeader,
    BLOOM_FILENAME, BLOOM_VALUES_MAX_SHARDS_COUNT, COLUMNS_HEADER_FILENAME,
    COLUMNS_HEADER_INDEX_FILENAME, COLUMN_IDXS_FILENAME, COLUMN_NAMES_FILENAME, INDEX_FILENAME,
    MESSAGE_BLOOM_FILENAME, MESSAGE_VALUES_FILENAME, METAINDEX_FILENAME, TIMESTAMPS_FILENAME,
    VALUES_FILENAME,
};

use super::io::{StreamReader, StreamWriter};

/// Contents of every file of an in-memory part
///
/// In-memory parts use a single bloom/values shard.
#[derive(Debug, Clone, Default)]
pub struct InmemoryFiles {
    pub column_names: Bytes,
    pub column_idxs: Bytes,
    pub metaindex: Bytes,
    pub index: Bytes,
    pub columns_header_index: Bytes,
    pub columns_header: Bytes,
    pub timestamps: Bytes,
    pub message_bloom: Bytes,
    pub message_values: Bytes,
    pub field_bloom: Bytes,
    pub field_values: Bytes,
}

impl InmemoryFiles {
    /// Sum of all buffer sizes; equals the part's compressed size
    pub fn size_bytes(&self) -> u64 {
        [
            &self.column_names,
            &self.column_idxs,
            &self.metaindex,
            &self.index,
            &self.columns_header_index,
            &self.columns_header,
            &self.timestamps,
            &self.message_bloom,
            &self.message_values,
            &self.field_bloom,
            &self.field_values,
        ]
        .iter()
        .map(|b| b.len() as u64)
        .sum()
    }
}

// =============================================================================
// Writers
// =============================================================================

pub struct BloomValuesWriter {
    pub bloom: StreamWriter,
    pub values: StreamWriter,
}

impl BloomValuesWriter {
    fn in_memory(bloom: &str, values: &str) -> Self {
        Self {
            bloom: StreamWriter::in_memory(bloom),
            values: StreamWriter::in_memory(values),
        }
    }

    fn create(bloom: &Path, values: &Path) -> Result<Self> {
        Ok(Self {
            bloom: StreamWriter::create_file(bloom)?,
            values: StreamWriter::create_file(values)?,
        })
    }

    fn bytes_written(&self) -> u64 {
        self.bloom.bytes_written() + self.values.bytes_written()
    }
}

/// Writers for every file of a part under construction
pub struct StreamWriters {
    part_path: Option<PathBuf>,

    pub(crate) column_names: StreamWriter,
    pub(crate) column_idxs: StreamWriter,
    pub(crate) metaindex: StreamWriter,
    pub(crate) index: StreamWriter,
    pub(crate) columns_header_index: StreamWriter,
    pub(crate) columns_header: StreamWriter,
    pub(crate) timestamps: StreamWriter,

    message_bloom_values: BloomValuesWriter,
    bloom_values_shards: Vec<BloomValuesWriter>,
    max_shards: u64,

    pub(crate) column_name_ids: ColumnNameIdGenerator,
    column_shards: BTreeMap<u64, u64>,
    next_shard: u64,
}

impl StreamWriters {
    /// Writers accumulating an in-memory part
    pub fn in_memory() -> Self {
        Self {
            part_path: None,
            column_names: StreamWriter::in_memory(COLUMN_NAMES_FILENAME),
            column_idxs: StreamWriter::in_memory(COLUMN_IDXS_FILENAME),
            metaindex: StreamWriter::in_memory(METAINDEX_FILENAME),
            index: StreamWriter::in_memory(INDEX_FILENAME),
            columns_header_index: StreamWriter::in_memory(COLUMNS_HEADER_INDEX_FILENAME),
            columns_header: StreamWriter::in_memory(COLUMNS_HEADER_FILENAME),
            timestamps: StreamWriter::in_memory(TIMESTAMPS_FILENAME),
            message_bloom_values: BloomValuesWriter::in_memory(
                MESSAGE_BLOOM_FILENAME,
                MESSAGE_VALUES_FILENAME,
            ),
            bloom_values_shards: Vec::new(),
            max_shards: 1,
            column_name_ids: ColumnNameIdGenerator::default(),
            column_shards: BTreeMap::new(),
            next_shard: 0,
        }
    }

    /// Create every fixed file of a part inside the existing directory `part_path`
    ///
    /// Shard files are created lazily when the first column lands in them.
    pub fn create_dir(part_path: &Path) -> Result<Self> {
        let f = |name: &str| StreamWriter::create_file(&part_path.join(name));
        Ok(Self {
            part_path: Some(part_path.to_path_buf()),
            column_names: f(COLUMN_NAMES_FILENAME)?,
            column_idxs: f(COLUMN_IDXS_FILENAME)?,
            metaindex: f(METAINDEX_FILENAME)?,
            index: f(INDEX_FILENAME)?,
            columns_header_index: f(COLUMNS_HEADER_INDEX_FILENAME)?,
            columns_header: f(COLUMNS_HEADER_FILENAME)?,
            timestamps: f(TIMESTAMPS_FILENAME)?,
            message_bloom_values: BloomValuesWriter::create(
                &part_path.join(MESSAGE_BLOOM_FILENAME),
                &part_path.join(MESSAGE_VALUES_FILENAME),
            )?,
            bloom_values_shards: Vec::new(),
            max_shards: BLOOM_VALUES_MAX_SHARDS_COUNT,
            column_name_ids: ColumnNameIdGenerator::default(),
            column_shards: BTreeMap::new(),
            next_shard: 0,
        })
    }

    /// Bloom/values pair holding the column `name`
    ///
    /// The message column has its own pair. Other columns are assigned a
    /// shard round-robin on first use and keep it for the part's lifetime.
    pub fn bloom_values_writer(&mut self, name: &str) -> Result<&mut BloomValuesWriter> {
        if name.is_empty() {
            return Ok(&mut self.message_bloom_values);
        }
        let id = self.column_name_ids.get_or_assign(name);
        let shard = match self.column_shards.get(&id) {
            Some(&shard) => shard,
            None => {
                let shard = self.next_shard % self.max_shards;
                self.next_shard += 1;
                self.column_shards.insert(id, shard);
                shard
            }
        } as usize;

        if shard == self.bloom_values_shards.len() {
            let bvw = match &self.part_path {
                Some(path) => BloomValuesWriter::create(
                    &bloom_shard_path(path, shard as u64),
                    &values_shard_path(path, shard as u64),
                )?,
                None => BloomValuesWriter::in_memory(BLOOM_FILENAME, VALUES_FILENAME),
            };
            self.bloom_values_shards.push(bvw);
        }
        let shards_count = self.bloom_values_shards.len();
        self.bloom_values_shards.get_mut(shard).ok_or_else(|| {
            LogDbError::InvariantViolation(format!(
                "shard {} skipped; only {} shards exist",
                shard, shards_count
            ))
        })
    }

    /// Number of bloom/values shards created so far
    pub fn shards_count(&self) -> u64 {
        self.bloom_values_shards.len() as u64
    }

    /// Write `column_names.bin` and `column_idxs.bin`
    pub(crate) fn write_column_dictionaries(&mut self) -> Result<()> {
        let names = marshal_column_names(self.column_name_ids.names())?;
        self.column_names.write_all(&names)?;
        let idxs = marshal_column_idxs(&self.column_shards)?;
        self.column_idxs.write_all(&idxs)?;
        Ok(())
    }

    pub fn total_bytes_written(&self) -> u64 {
        let fixed = [
            &self.column_names,
            &self.column_idxs,
            &self.metaindex,
            &self.index,
            &self.columns_header_index,
            &self.columns_header,
            &self.timestamps,
        ]
        .iter()
        .map(|w| w.bytes_written())
        .sum::<u64>();
        let shards = self
            .bloom_values_shards
            .iter()
            .map(BloomValuesWriter::bytes_written)
            .sum::<u64>();
        fixed + self.message_bloom_values.bytes_written() + shards
    }

    /// Flush and sync everything; in-memory writers hand back their buffers
    pub(crate) fn finish(self) -> Result<Option<InmemoryFiles>> {
        let is_inmemory = self.part_path.is_none();
        let mut files = InmemoryFiles {
            column_names: finish(self.column_names)?,
            column_idxs: finish(self.column_idxs)?,
            metaindex: finish(self.metaindex)?,
            index: finish(self.index)?,
            columns_header_index: finish(self.columns_header_index)?,
            columns_header: finish(self.columns_header)?,
            timestamps: finish(self.timestamps)?,
            message_bloom: finish(self.message_bloom_values.bloom)?,
            message_values: finish(self.message_bloom_values.values)?,
            field_bloom: Bytes::new(),
            field_values: Bytes::new(),
        };
        for (shard, bvw) in self.bloom_values_shards.into_iter().enumerate() {
            let bloom = finish(bvw.bloom)?;
            let values = finish(bvw.values)?;
            if shard == 0 {
                files.field_bloom = bloom;
                files.field_values = values;
            }
        }
        Ok(is_inmemory.then_some(files))
    }
}

fn finish(w: StreamWriter) -> Result<Bytes> {
    Ok(w.finish()?.unwrap_or_default())
}

// =============================================================================
// Readers
// =============================================================================

pub struct BloomValuesReader {
    pub bloom: StreamReader,
    pub values: StreamReader,
}

impl BloomValuesReader {
    fn bytes_read(&self) -> u64 {
        self.bloom.bytes_read() + self.values.bytes_read()
    }
}

/// Readers for every file of a part, positioned at the start
pub struct StreamReaders {
    part_path: PathBuf,

    column_names_reader: StreamReader,
    column_idxs_reader: StreamReader,
    pub(crate) metaindex: StreamReader,
    pub(crate) index: StreamReader,
    pub(crate) columns_header_index: StreamReader,
    pub(crate) columns_header: StreamReader,
    pub(crate) timestamps: StreamReader,

    message_bloom_values: BloomValuesReader,
    bloom_values_shards: Vec<BloomValuesReader>,

    /// Column names indexed by column name id
    pub(crate) column_names: Vec<String>,
    column_shards: HashMap<String, u64>,
}

impl StreamReaders {
    /// Readers over the buffers of an in-memory part
    pub fn from_inmemory(files: &InmemoryFiles, ph: &PartHeader) -> Result<Self> {
        let base = PathBuf::from("inmemory");
        let r = |name: &str, data: &Bytes| StreamReader::from_bytes(base.join(name), data.clone());
        let mut bloom_values_shards = Vec::new();
        if ph.bloom_values_shards_count > 0 {
            bloom_values_shards.push(BloomValuesReader {
                bloom: r(BLOOM_FILENAME, &files.field_bloom),
                values: r(VALUES_FILENAME, &files.field_values),
            });
        }
        let mut sr = Self {
            part_path: base.clone(),
            column_names_reader: r(COLUMN_NAMES_FILENAME, &files.column_names),
            column_idxs_reader: r(COLUMN_IDXS_FILENAME, &files.column_idxs),
            metaindex: r(METAINDEX_FILENAME, &files.metaindex),
            index: r(INDEX_FILENAME, &files.index),
            columns_header_index: r(COLUMNS_HEADER_INDEX_FILENAME, &files.columns_header_index),
            columns_header: r(COLUMNS_HEADER_FILENAME, &files.columns_header),
            timestamps: r(TIMESTAMPS_FILENAME, &files.timestamps),
            message_bloom_values: BloomValuesReader {
                bloom: r(MESSAGE_BLOOM_FILENAME, &files.message_bloom),
                values: r(MESSAGE_VALUES_FILENAME, &files.message_values),
            },
            bloom_values_shards,
            column_names: Vec::new(),
            column_shards: HashMap::new(),
        };
        sr.load_column_dictionaries(ph)?;
        Ok(sr)
    }

    /// Open every file of the file part at `part_path`
    pub fn open_dir(part_path: &Path, ph: &PartHeader) -> Result<Self> {
        let f = |name: &str| StreamReader::open_file(&part_path.join(name));
        let mut bloom_values_shards = Vec::with_capacity(ph.bloom_values_shards_count as usize);
        for shard in 0..ph.bloom_values_shards_count {
            bloom_values_shards.push(BloomValuesReader {
                bloom: StreamReader::open_file(&bloom_shard_path(part_path, shard))?,
                values: StreamReader::open_file(&values_shard_path(part_path, shard))?,
            });
        }
        let mut sr = Self {
            part_path: part_path.to_path_buf(),
            column_names_reader: f(COLUMN_NAMES_FILENAME)?,
            column_idxs_reader: f(COLUMN_IDXS_FILENAME)?,
            metaindex: f(METAINDEX_FILENAME)?,
            index: f(INDEX_FILENAME)?,
            columns_header_index: f(COLUMNS_HEADER_INDEX_FILENAME)?,
            columns_header: f(COLUMNS_HEADER_FILENAME)?,
            timestamps: f(TIMESTAMPS_FILENAME)?,
            message_bloom_values: BloomValuesReader {
                bloom: f(MESSAGE_BLOOM_FILENAME)?,
                values: f(MESSAGE_VALUES_FILENAME)?,
            },
            bloom_values_shards,
            column_names: Vec::new(),
            column_shards: HashMap::new(),
        };
        sr.load_column_dictionaries(ph)?;
        Ok(sr)
    }

    fn load_column_dictionaries(&mut self, ph: &PartHeader) -> Result<()> {
        let data = self.column_names_reader.read_to_end()?;
        self.column_names = unmarshal_column_names(&data)
            .map_err(|e| e.with_path(self.column_names_reader.path()))?;
        let data = self.column_idxs_reader.read_to_end()?;
        self.column_shards =
            unmarshal_column_idxs(&data, &self.column_names, ph.bloom_values_shards_count)
                .map_err(|e| e.with_path(self.column_idxs_reader.path()))?;
        Ok(())
    }

    /// Bloom/values pair holding the column `name`
    pub fn bloom_values_reader(&mut self, name: &str) -> Result<&mut BloomValuesReader> {
        if name.is_empty() {
            return Ok(&mut self.message_bloom_values);
        }
        let shard = *self.column_shards.get(name).ok_or_else(|| {
            LogDbError::corruption(
                &self.part_path,
                format!("column {:?} has no bloom/values shard", name),
            )
        })?;
        let shards_count = self.bloom_values_shards.len();
        self.bloom_values_shards
            .get_mut(shard as usize)
            .ok_or_else(|| {
                LogDbError::corruption(
                    &self.part_path,
                    format!("shard {} is out of range; part has {} shards", shard, shards_count),
                )
            })
    }

    pub fn total_bytes_read(&self) -> u64 {
        let fixed = [
            &self.column_names_reader,
            &self.column_idxs_reader,
            &self.metaindex,
            &self.index,
            &self.columns_header_index,
            &self.columns_header,
            &self.timestamps,
        ]
        .iter()
        .map(|r| r.bytes_read())
        .sum::<u64>();
        let shards = self
            .bloom_values_shards
            .iter()
            .map(BloomValuesReader::bytes_read)
            .sum::<u64>();
        fixed + self.message_bloom_values.bytes_read() + shards
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }
}

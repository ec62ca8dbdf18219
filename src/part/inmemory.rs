//! In-memory part
//!
//! A complete part whose files live in `Bytes` buffers. Row-buffer flushes
//! produce these; they are merged in memory and eventually stored to disk.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{LogDbError, Result};
use crate::format::{
    bloom_shard_path, uncompressed_row_size_bytes, values_shard_path, PartHeader, COLUMNS_HEADER_FILENAME,
    COLUMNS_HEADER_INDEX_FILENAME, COLUMN_IDXS_FILENAME, COLUMN_NAMES_FILENAME, INDEX_FILENAME,
    MAX_COLUMNS_PER_BLOCK, MAX_ROWS_PER_BLOCK, MAX_UNCOMPRESSED_BLOCK_SIZE,
    MESSAGE_BLOOM_FILENAME, MESSAGE_VALUES_FILENAME, METAINDEX_FILENAME, TIMESTAMPS_FILENAME,
};
use crate::fsutil;
use crate::rows::LogRows;
use crate::stream::{BlockStreamWriter, FinalizedPart, InmemoryFiles, StreamWriter};

#[derive(Debug, Clone)]
pub struct InmemoryPart {
    header: PartHeader,
    files: InmemoryFiles,
}

impl InmemoryPart {
    pub(crate) fn new(header: PartHeader, files: InmemoryFiles) -> Self {
        Self { header, files }
    }

    /// Sort `lr` and pack it into blocks
    ///
    /// A block is cut when the stream changes, when it reaches the row or size
    /// limit, or when one more row would push its column count over the limit.
    pub fn from_log_rows(lr: &mut LogRows) -> Result<Self> {
        lr.sort();
        let sids = lr.stream_ids();
        let timestamps = lr.timestamps();
        let rows = lr.rows();

        let mut bsw = BlockStreamWriter::for_inmemory_part();
        let mut start = 0;
        let mut size = 0u64;
        let mut columns: HashSet<&str> = HashSet::new();
        for i in 0..rows.len() {
            let row_columns = rows[i]
                .iter()
                .filter(|f| !columns.contains(f.name.as_str()))
                .count();
            let cut = i > start
                && (sids[i] != sids[start]
                    || i - start >= MAX_ROWS_PER_BLOCK
                    || size >= MAX_UNCOMPRESSED_BLOCK_SIZE
                    || columns.len() + row_columns > MAX_COLUMNS_PER_BLOCK);
            if cut {
                bsw.write_rows(&sids[start], &timestamps[start..i], &rows[start..i])?;
                start = i;
                size = 0;
                columns.clear();
            }
            size += uncompressed_row_size_bytes(&rows[i]);
            columns.extend(rows[i].iter().map(|f| f.name.as_str()));
        }
        if start < rows.len() {
            bsw.write_rows(&sids[start], &timestamps[start..], &rows[start..])?;
        }

        match bsw.finalize()? {
            FinalizedPart::Inmemory(mp) => Ok(mp),
            FinalizedPart::File { path, .. } => Err(LogDbError::InvariantViolation(format!(
                "in-memory writer produced a file part at {}",
                path.display()
            ))),
        }
    }

    pub fn header(&self) -> &PartHeader {
        &self.header
    }

    pub fn files(&self) -> &InmemoryFiles {
        &self.files
    }

    /// Write every buffer into the new directory `path`, then `metadata.json`
    pub fn store_to_disk(&self, path: &Path) -> Result<()> {
        fsutil::create_dir_new(path)?;
        let f = &self.files;
        let mut entries = vec![
            (path.join(COLUMN_NAMES_FILENAME), &f.column_names),
            (path.join(COLUMN_IDXS_FILENAME), &f.column_idxs),
            (path.join(METAINDEX_FILENAME), &f.metaindex),
            (path.join(INDEX_FILENAME), &f.index),
            (path.join(COLUMNS_HEADER_INDEX_FILENAME), &f.columns_header_index),
            (path.join(COLUMNS_HEADER_FILENAME), &f.columns_header),
            (path.join(TIMESTAMPS_FILENAME), &f.timestamps),
            (path.join(MESSAGE_BLOOM_FILENAME), &f.message_bloom),
            (path.join(MESSAGE_VALUES_FILENAME), &f.message_values),
        ];
        if self.header.bloom_values_shards_count > 0 {
            entries.push((bloom_shard_path(path, 0), &f.field_bloom));
            entries.push((values_shard_path(path, 0), &f.field_values));
        }
        for (file_path, data) in entries {
            let mut w = StreamWriter::create_file(&file_path)?;
            w.write_all(data)?;
            w.finish()?;
        }
        self.header.write_to_dir(path)?;
        fsutil::sync_dir(path)
    }
}

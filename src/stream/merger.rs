//! K-way merge of block streams
//!
//! Blocks from all source parts are pulled in `(stream id, min timestamp)`
//! order. Full blocks are copied without decoding; small blocks of the same
//! stream are decoded and their rows interleaved by timestamp before being
//! re-encoded.
//!
//! Blocks of one stream only arrive ordered by their min timestamp, so rows
//! still pending may be later than the next block's first row. Pending rows
//! are therefore written only up to the min timestamp of the next block of
//! the same stream; the rest stay pending. This keeps every written block's
//! min timestamp at or above the previous one.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crossbeam::channel::{Receiver, TryRecvError};

use crate::error::{LogDbError, Result};
use crate::format::{
    uncompressed_row_size_bytes, Block, BlockData, MAX_COLUMNS_PER_BLOCK,
    MAX_UNCOMPRESSED_BLOCK_SIZE,
};
use crate::rows::{merge_rows_by_timestamp, Field, StreamId};

use super::reader::BlockStreamReader;
use super::writer::{BlockStreamWriter, FinalizedPart};

/// How a merge ended
#[derive(Debug)]
pub enum MergeOutcome {
    Completed(FinalizedPart),
    /// The stop channel closed mid-merge; the destination is incomplete
    Stopped,
}

/// Whether the stop channel has been closed
pub(crate) fn need_stop(stop: Option<&Receiver<()>>) -> bool {
    matches!(stop.map(Receiver::try_recv), Some(Err(TryRecvError::Disconnected)))
}

/// Merge every block of `readers` into `writer` and finalize it
///
/// Readers must be freshly opened. `stop` is polled between blocks.
pub fn merge_block_streams(
    writer: BlockStreamWriter,
    mut readers: Vec<BlockStreamReader>,
    stop: Option<&Receiver<()>>,
) -> Result<MergeOutcome> {
    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (idx, r) in readers.iter_mut().enumerate() {
        if r.next_block()? {
            heap.push(Reverse(heap_key(r, idx)?));
        }
    }

    let mut merger = BlockMerger::new(writer);
    while let Some(Reverse((_, _, idx))) = heap.pop() {
        if need_stop(stop) {
            return Ok(MergeOutcome::Stopped);
        }
        let r = &mut readers[idx];
        let bd = r.take_block_data().ok_or_else(|| {
            LogDbError::InvariantViolation("reader in the merge heap has no block".to_string())
        })?;
        if r.next_block()? {
            heap.push(Reverse(heap_key(r, idx)?));
        }
        // Lower bound for every row of this stream not yet seen
        let next_min_timestamp = heap
            .peek()
            .and_then(|Reverse((sid, ts, _))| (*sid == bd.stream_id).then_some(*ts));
        merger.write_block(bd, next_min_timestamp)?;
    }
    merger.flush()?;
    Ok(MergeOutcome::Completed(merger.writer.finalize()?))
}

fn heap_key(r: &BlockStreamReader, idx: usize) -> Result<(StreamId, i64, usize)> {
    let bd = r.block_data().ok_or_else(|| {
        LogDbError::InvariantViolation("reader advanced without loading a block".to_string())
    })?;
    Ok((bd.stream_id, bd.timestamps.min_timestamp, idx))
}

// =============================================================================
// Pending State
// =============================================================================

enum Pending {
    Empty,
    /// A single block that may still be written unchanged
    Data(BlockData),
    /// Decoded rows sorted by timestamp
    Rows {
        timestamps: Vec<i64>,
        rows: Vec<Vec<Field>>,
    },
}

struct BlockMerger {
    writer: BlockStreamWriter,
    sid: Option<StreamId>,
    last_min_timestamp: i64,
    pending: Pending,
    /// Distinct column names in the pending rows
    pending_columns: HashSet<String>,
}

impl BlockMerger {
    fn new(writer: BlockStreamWriter) -> Self {
        Self {
            writer,
            sid: None,
            last_min_timestamp: 0,
            pending: Pending::Empty,
            pending_columns: HashSet::new(),
        }
    }

    /// Add `bd` to the output
    ///
    /// `next_min_timestamp` is the min timestamp of the next block of the same
    /// stream, or `None` when no more blocks of this stream follow.
    fn write_block(&mut self, bd: BlockData, next_min_timestamp: Option<i64>) -> Result<()> {
        let min_ts = bd.timestamps.min_timestamp;
        if let Some(sid) = self.sid {
            if bd.stream_id < sid {
                return Err(LogDbError::InvariantViolation(format!(
                    "merge got stream {} after {}",
                    bd.stream_id, sid
                )));
            }
            if bd.stream_id == sid && min_ts < self.last_min_timestamp {
                return Err(LogDbError::InvariantViolation(format!(
                    "merge got min timestamp {} after {} for stream {}",
                    min_ts, self.last_min_timestamp, sid
                )));
            }
        }
        self.last_min_timestamp = min_ts;

        if self.sid != Some(bd.stream_id) {
            self.flush()?;
            self.sid = Some(bd.stream_id);
        }

        let is_full = bd.uncompressed_size_bytes >= MAX_UNCOMPRESSED_BLOCK_SIZE;
        let too_many_columns =
            self.pending_columns.len() + new_columns(&self.pending_columns, &bd) > MAX_COLUMNS_PER_BLOCK;
        if is_full || too_many_columns {
            // Pending rows later than `bd` stay pending and sort after it
            self.flush_until(Some(min_ts))?;
            if is_full || !self.pending.is_empty() {
                return self.writer.write_block_data(&bd);
            }
            return self.start_pending(bd);
        }
        if self.pending.is_empty() {
            return self.start_pending(bd);
        }
        self.merge_rows(&bd, next_min_timestamp)
    }

    fn start_pending(&mut self, bd: BlockData) -> Result<()> {
        self.pending_columns = column_names(&bd);
        self.pending = Pending::Data(bd);
        Ok(())
    }

    fn merge_rows(&mut self, bd: &BlockData, next_min_timestamp: Option<i64>) -> Result<()> {
        let (a_ts, a_rows) = match std::mem::replace(&mut self.pending, Pending::Empty) {
            Pending::Empty => (Vec::new(), Vec::new()),
            Pending::Data(pending) => {
                let block = Block::from_block_data(&pending)?;
                (block.timestamps().to_vec(), block.to_rows())
            }
            Pending::Rows { timestamps, rows } => (timestamps, rows),
        };
        let block = Block::from_block_data(bd)?;
        let (timestamps, rows) =
            merge_rows_by_timestamp(&a_ts, &a_rows, block.timestamps(), &block.to_rows());
        let size = rows_size(&rows);
        self.pending_columns.extend(column_names(bd));
        self.pending = Pending::Rows { timestamps, rows };
        if size >= MAX_UNCOMPRESSED_BLOCK_SIZE {
            self.flush_until(next_min_timestamp)?;
        }
        Ok(())
    }

    /// Write everything pending
    fn flush(&mut self) -> Result<()> {
        self.flush_until(None)
    }

    /// Write pending rows with timestamps up to `limit`, or all of them for `None`
    fn flush_until(&mut self, limit: Option<i64>) -> Result<()> {
        let pending = std::mem::replace(&mut self.pending, Pending::Empty);
        let sid = match self.sid {
            Some(sid) => sid,
            None => {
                self.pending_columns.clear();
                return Ok(());
            }
        };
        match pending {
            Pending::Empty => {}
            Pending::Data(bd) => {
                if limit.is_some_and(|limit| bd.timestamps.min_timestamp > limit) {
                    self.pending = Pending::Data(bd);
                    return Ok(());
                }
                self.writer.write_block_data(&bd)?;
            }
            Pending::Rows {
                timestamps,
                mut rows,
            } => {
                let cut = limit.map_or(timestamps.len(), |limit| {
                    timestamps.partition_point(|&ts| ts <= limit)
                });
                write_rows_by_size(&mut self.writer, &sid, &timestamps[..cut], &rows[..cut])?;
                if cut < timestamps.len() {
                    let rest = rows.split_off(cut);
                    self.pending_columns = rest
                        .iter()
                        .flat_map(|row| row.iter().map(|f| f.name.clone()))
                        .collect();
                    self.pending = Pending::Rows {
                        timestamps: timestamps[cut..].to_vec(),
                        rows: rest,
                    };
                    return Ok(());
                }
            }
        }
        self.pending_columns.clear();
        Ok(())
    }
}

impl Pending {
    fn is_empty(&self) -> bool {
        matches!(self, Pending::Empty)
    }
}

fn rows_size(rows: &[Vec<Field>]) -> u64 {
    rows.iter().map(|r| uncompressed_row_size_bytes(r)).sum()
}

/// Write rows in chunks that stay within the block size target
fn write_rows_by_size(
    writer: &mut BlockStreamWriter,
    sid: &StreamId,
    timestamps: &[i64],
    rows: &[Vec<Field>],
) -> Result<()> {
    let mut start = 0;
    let mut size = 0;
    for (i, row) in rows.iter().enumerate() {
        let row_size = uncompressed_row_size_bytes(row);
        if i > start && size + row_size > MAX_UNCOMPRESSED_BLOCK_SIZE {
            writer.write_rows(sid, &timestamps[start..i], &rows[start..i])?;
            start = i;
            size = 0;
        }
        size += row_size;
    }
    writer.write_rows(sid, &timestamps[start..], &rows[start..])
}

fn column_names(bd: &BlockData) -> HashSet<String> {
    bd.columns
        .iter()
        .map(|c| c.name.clone())
        .chain(bd.const_columns.iter().map(|f| f.name.clone()))
        .collect()
}

fn new_columns(known: &HashSet<String>, bd: &BlockData) -> usize {
    bd.columns
        .iter()
        .map(|c| &c.name)
        .chain(bd.const_columns.iter().map(|f| &f.name))
        .filter(|name| !known.contains(*name))
        .count()
}

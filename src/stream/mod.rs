//! Stream Module
//!
//! Sequential writing and reading of whole parts.
//!
//! ## Responsibilities
//! - Byte-counting file and memory streams
//! - `BlockStreamWriter`: build a part from ordered blocks
//! - `BlockStreamReader`: validated block-by-block scan of a part
//! - `merge_block_streams`: k-way merge of several parts into one

mod io;
mod merger;
mod reader;
mod streams;
mod writer;

pub use io::{StreamReader, StreamWriter};
pub use merger::{merge_block_streams, MergeOutcome};
pub use reader::BlockStreamReader;
pub use streams::{BloomValuesReader, BloomValuesWriter, InmemoryFiles, StreamReaders, StreamWriters};
pub use writer::{BlockStreamWriter, FinalizedPart};

pub(crate) use merger::need_stop;

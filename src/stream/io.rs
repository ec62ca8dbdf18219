//! Byte-counting sinks and sources
//!
//! Every part file is written and read strictly sequentially. The counters
//! let headers record offsets on write and let readers detect desync on read.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{LogDbError, Result};

const WRITE_BUFFER_SIZE: usize = 64 * 1024;
const READ_BUFFER_SIZE: usize = 64 * 1024;

// =============================================================================
// Writer
// =============================================================================

enum Sink {
    File(BufWriter<File>),
    Memory(Vec<u8>),
}

/// Sequential writer tracking how many bytes it has written
pub struct StreamWriter {
    path: PathBuf,
    sink: Sink,
    bytes_written: u64,
}

impl StreamWriter {
    /// Writer backed by a growable buffer; `name` only shows up in errors
    pub fn in_memory(name: &str) -> Self {
        Self {
            path: PathBuf::from("inmemory").join(name),
            sink: Sink::Memory(Vec::new()),
            bytes_written: 0,
        }
    }

    /// Create a new file; fails if it already exists
    pub fn create_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            sink: Sink::File(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
            bytes_written: 0,
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.sink {
            Sink::File(w) => w.write_all(data)?,
            Sink::Memory(buf) => buf.extend_from_slice(data),
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and sync a file, or hand back the buffer of an in-memory writer
    pub fn finish(self) -> Result<Option<Bytes>> {
        match self.sink {
            Sink::File(w) => {
                let file = w.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()?;
                Ok(None)
            }
            Sink::Memory(buf) => Ok(Some(Bytes::from(buf))),
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

enum Source {
    File(BufReader<File>),
    Memory(Bytes),
}

/// Sequential reader tracking how many bytes it has consumed
pub struct StreamReader {
    path: PathBuf,
    source: Source,
    bytes_read: u64,
}

impl StreamReader {
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            source: Source::File(BufReader::with_capacity(READ_BUFFER_SIZE, file)),
            bytes_read: 0,
        })
    }

    /// Reader over an in-memory buffer; `path` only shows up in errors
    pub fn from_bytes(path: PathBuf, data: Bytes) -> Self {
        Self {
            path,
            source: Source::Memory(data),
            bytes_read: 0,
        }
    }

    /// Read exactly `n` bytes; running out of data is corruption
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        match &mut self.source {
            Source::File(r) => r.read_exact(&mut buf).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    self.unexpected_eof(n)
                } else {
                    e.into()
                }
            })?,
            Source::Memory(data) => {
                let start = self.bytes_read as usize;
                if data.len() < start + n {
                    return Err(self.unexpected_eof(n));
                }
                buf.copy_from_slice(&data[start..start + n]);
            }
        }
        self.bytes_read += n as u64;
        Ok(buf)
    }

    /// Read everything that is left
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let buf = match &mut self.source {
            Source::File(r) => {
                let mut buf = Vec::new();
                r.read_to_end(&mut buf)?;
                buf
            }
            Source::Memory(data) => data[self.bytes_read as usize..].to_vec(),
        };
        self.bytes_read += buf.len() as u64;
        Ok(buf)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unexpected_eof(&self, n: usize) -> LogDbError {
        LogDbError::corruption(
            &self.path,
            format!(
                "unexpected end of data while reading {} bytes at offset {}",
                n, self.bytes_read
            ),
        )
    }
}

//! # logdb
//!
//! A columnar, append-only storage engine for log records with:
//! - Rows grouped by stream and sorted by timestamp
//! - Per-column encodings: dictionaries, fixed-width integers, floats, IPv4, timestamps
//! - Bloom filters over value tokens for fast negative lookups
//! - Immutable parts organized into in-memory, small and big tiers
//! - Background merges with crash-safe part list updates
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Datadb                                │
//! │              (one partition directory)                       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ must_add_rows
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   Rows Buffer                                │
//! │            (sharded, flushed by size/timer)                  │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ LogRows
//!                       ▼
//!   ┌──────────────┐  merge  ┌─────────────┐  merge  ┌─────────────┐
//!   │  In-memory   │────────▶│ Small parts │────────▶│  Big parts  │
//!   │    parts     │  flush  │   (disk)    │         │   (disk)    │
//!   └──────────────┘         └─────────────┘         └─────────────┘
//!          │                        │                       │
//!          └────────────────────────┴───────────────────────┘
//!                                   │
//!                          ┌────────▼────────┐
//!                          │  Block streams  │
//!                          │ (read/write/merge)
//!                          └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod fsutil;

pub mod encoding;
pub mod values;
pub mod bloom;
pub mod rows;
pub mod format;
pub mod stream;
pub mod part;
pub mod datadb;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LogDbError, Result};
pub use config::{DatadbConfig, DatadbConfigBuilder, FatalHandler};
pub use datadb::{Datadb, DatadbStats, DiskBudget, PartRef, PartType, TierStats};
pub use part::{InmemoryPart, Part};
pub use rows::{Field, LogRows, StreamId, TenantId};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of logdb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

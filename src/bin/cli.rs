//! logdb CLI
//!
//! Command-line tool for loading and inspecting a logdb partition.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use logdb::stream::BlockStreamReader;
use logdb::values::try_parse_iso8601;
use logdb::{Datadb, DatadbConfig, DatadbStats, Field, LogRows, TenantId};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

/// logdb CLI
#[derive(Parser, Debug)]
#[command(name = "logdb-cli")]
#[command(about = "Load and inspect logdb partitions")]
#[command(version)]
struct Args {
    /// Partition directory
    #[arg(short, long, default_value = "./logdb_data")]
    data_dir: PathBuf,

    /// Concurrent merges per tier
    #[arg(short, long)]
    merge_workers: Option<usize>,

    /// Memory budget in MB used to size in-memory and small parts
    #[arg(long, default_value = "1024")]
    memory_mb: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest JSON lines, one log entry per line
    Ingest {
        /// Input file; stdin when omitted
        input: Option<PathBuf>,

        /// Comma-separated fields identifying the stream
        #[arg(short, long, default_value = "")]
        stream_fields: String,

        /// Tenant account id
        #[arg(long, default_value = "0")]
        account_id: u32,

        /// Tenant project id
        #[arg(long, default_value = "0")]
        project_id: u32,
    },

    /// Print partition statistics as JSON
    Stats,

    /// Read every block of every part and check its consistency
    Verify,

    /// Merge all parts into as few as possible
    ForceMerge,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,logdb=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    tracing::info!("logdb CLI v{}", logdb::VERSION);
    tracing::info!("Data directory: {}", args.data_dir.display());

    let mut builder = DatadbConfig::builder()
        .path(&args.data_dir)
        .memory_allowed_bytes(args.memory_mb * 1024 * 1024);
    if let Some(n) = args.merge_workers {
        builder = builder.merge_workers(n);
    }
    let config = builder.build();

    let db = match Datadb::open(config) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open partition: {}", e);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Ingest {
            input,
            stream_fields,
            account_id,
            project_id,
        } => ingest(&db, input, &stream_fields, TenantId::new(account_id, project_id)),
        Commands::Stats => print_stats(&db),
        Commands::Verify => verify(&db),
        Commands::ForceMerge => db.force_merge().map_err(|e| e.to_string()),
    };

    if let Err(e) = db.close() {
        tracing::error!("Failed to close partition: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

// =============================================================================
// Commands
// =============================================================================

fn ingest(db: &Datadb, input: Option<PathBuf>, stream_fields: &str, tenant: TenantId) -> Result<(), String> {
    let reader: Box<dyn BufRead> = match &input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let names: Vec<&str> = stream_fields
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut lr = LogRows::with_stream_fields(&names);
    let mut total = 0u64;
    let mut skipped = 0u64;
    for (n, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("cannot read input: {}", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let (timestamp, fields) = match parse_line(&line) {
            Some(parsed) => parsed,
            None => {
                tracing::warn!(line = n + 1, "skipping line that is not a JSON object");
                skipped += 1;
                continue;
            }
        };
        lr.must_add(tenant, timestamp, fields);
        total += 1;
        if lr.need_flush() {
            db.must_add_rows(&lr).map_err(|e| e.to_string())?;
            lr = LogRows::with_stream_fields(&names);
        }
    }
    if !lr.is_empty() {
        db.must_add_rows(&lr).map_err(|e| e.to_string())?;
    }
    db.debug_flush().map_err(|e| e.to_string())?;

    tracing::info!(rows = total, skipped, "ingest finished");
    Ok(())
}

/// Split a JSON object into its timestamp and string fields
fn parse_line(line: &str) -> Option<(i64, Vec<Field>)> {
    let obj = match serde_json::from_str::<Value>(line).ok()? {
        Value::Object(obj) => obj,
        _ => return None,
    };
    let mut timestamp = None;
    let mut fields = Vec::with_capacity(obj.len());
    for (name, value) in obj {
        let value = match value {
            Value::String(s) => s,
            Value::Null => continue,
            other => other.to_string(),
        };
        if name == "_time" {
            timestamp = try_parse_iso8601(&value).or_else(|| value.parse().ok());
            continue;
        }
        fields.push(Field::new(name, value));
    }
    let timestamp = timestamp.unwrap_or_else(now_nanos);
    Some((timestamp, fields))
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as i64
}

fn print_stats(db: &Datadb) -> Result<(), String> {
    let mut stats = DatadbStats::default();
    db.update_stats(&mut stats);
    let out = serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?;
    println!("{}", out);
    let disk = logdb::fsutil::dir_size(db.path()).map_err(|e| e.to_string())?;
    println!("disk usage: {} bytes", disk);
    Ok(())
}

fn verify(db: &Datadb) -> Result<(), String> {
    let parts = db.acquire_parts();
    let mut rows = 0u64;
    let mut blocks = 0u64;
    for part in &parts {
        if part.is_inmemory() {
            continue;
        }
        let mut bsr = BlockStreamReader::open_file_part(part.path()).map_err(|e| e.to_string())?;
        while bsr.next_block().map_err(|e| e.to_string())? {
            blocks += 1;
        }
        rows += bsr.header().rows_count;
        tracing::info!(
            part = %part.path().display(),
            rows = bsr.header().rows_count,
            blocks = bsr.header().blocks_count,
            "part verified"
        );
    }
    println!("verified {} parts, {} blocks, {} rows", parts.len(), blocks, rows);
    Ok(())
}

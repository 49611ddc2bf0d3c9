//! logstream binary.
//!
//! Reads JSON-lines log records from a file or stdin, runs them through the
//! engine and prints the final metrics snapshot as JSON on stdout.
//!
//! # Configuration
//!
//! In order of precedence:
//!
//! 1. Command-line arguments (highest precedence)
//! 2. Environment variables (prefixed with `LOGSTREAM_`)
//! 3. User-specified configuration file (via `--config`)
//! 4. `config/local.toml`, then `config/default.toml`
//! 5. Built-in defaults
//!
//! ## Command-line Options
//!
//! ```text
//! Options:
//!   -c, --config <FILE>             Path to configuration file
//!   -i, --input <FILE>              JSON-lines input; stdin when omitted
//!   -o, --output-dir <DIR>          Directory sink root [env: LOGSTREAM_OUTPUT_DIR]
//!       --batch-size-limit <N>      Records per batch
//!       --flush-interval-ms <MS>    Maximum batch age
//!       --dedup-strategy <NAME>     exact, lru or bloom
//! ```
//!
//! Without `--output-dir` batches are kept in memory and discarded on exit,
//! which is useful for measuring dedup and compression on a sample.
//!
//! # Examples
//!
//! ```bash
//! logstream --input app.log.jsonl --output-dir /var/lib/logstream
//! RUST_LOG=logstream=debug logstream --dedup-strategy bloom < app.log.jsonl
//! ```

use clap::Parser;
use futures::StreamExt;
use logstream::{
    DedupStrategy, DirectorySink, IngestReason, LogRecord, LogStreamEngine, MemorySink, Sink,
    StreamSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// JSON-lines input file; reads stdin when omitted
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Root directory for the directory sink
    #[arg(short, long, value_name = "DIR", env = "LOGSTREAM_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Records per batch before a size flush
    #[arg(long)]
    batch_size_limit: Option<usize>,

    /// Maximum batch age in milliseconds
    #[arg(long)]
    flush_interval_ms: Option<u64>,

    /// Deduplication index: exact, lru or bloom
    #[arg(long)]
    dedup_strategy: Option<DedupStrategy>,
}

impl CliArgs {
    fn settings(&self) -> Result<StreamSettings, Box<dyn std::error::Error>> {
        let mut settings = StreamSettings::load(self.config.as_deref())?;
        if let Some(limit) = self.batch_size_limit {
            settings.batch_size_limit = limit;
        }
        if let Some(interval) = self.flush_interval_ms {
            settings.flush_interval = interval;
        }
        if let Some(strategy) = self.dedup_strategy {
            settings.dedup_strategy = strategy;
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let settings = args.settings()?;

    let sink: Arc<dyn Sink> = match &args.output_dir {
        Some(dir) => Arc::new(DirectorySink::new(dir).await?),
        None => Arc::new(MemorySink::new()),
    };

    let engine = LogStreamEngine::new(settings, sink)?;
    engine.start()?;

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = LinesStream::new(BufReader::new(reader).lines());

    let mut line_number = 0usize;
    let mut unparsable = 0usize;
    while let Some(line) = lines.next().await {
        let line = line?;
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: LogRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                unparsable += 1;
                warn!(line = line_number, error = %err, "skipping unparsable line");
                continue;
            }
        };

        let result = engine.ingest(record);
        if let Some(IngestReason::ShuttingDown) = result.reason {
            break;
        }
    }

    info!(lines = line_number, unparsable, "input exhausted");
    engine.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
    Ok(())
}

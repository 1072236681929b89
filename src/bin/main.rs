use trade_enrich::transformers::open_input;
use trade_enrich::{enrich, CancellationToken, EnrichConfig, ProductRegistry};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "trade-enrich")]
#[command(about = "Replaces product ids in a trade CSV with product names.")]
struct Cli {
    /// Product reference table (`product_id,product_name` with a header row)
    #[arg(long, env = "TRADE_ENRICH_PRODUCTS")]
    products: PathBuf,
    /// Trade CSV to read, `-` for stdin. Files ending in `.gz` are decompressed.
    #[arg(short, long, default_value = "-")]
    input: String,
    /// Where to write the enriched CSV, `-` for stdout
    #[arg(short, long, default_value = "-")]
    output: String,
    /// Input lines per chunk
    #[arg(long, env = "TRADE_ENRICH_CHUNK_SIZE", default_value_t = 10_000)]
    chunk_size: usize,
    /// Worker threads, 0 for one per available core
    #[arg(short, long, env = "TRADE_ENRICH_WORKERS", default_value_t = 0)]
    workers: usize,
    /// Capacity of the chunk and result queues [default: 2 x workers]
    #[arg(long, env = "TRADE_ENRICH_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,
    /// Chunks dispatched but not yet written [default: 4 x workers]
    #[arg(long, env = "TRADE_ENRICH_MAX_IN_FLIGHT")]
    max_in_flight: Option<usize>,
    /// Seconds to wait for the output to be flushed once every chunk is processed
    #[arg(long, env = "TRADE_ENRICH_WRITER_TIMEOUT_SECS", default_value_t = 300)]
    writer_timeout_secs: u64,
    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn config(&self) -> EnrichConfig {
        let mut config = if self.workers == 0 {
            EnrichConfig::default()
        } else {
            EnrichConfig::with_workers(self.workers)
        };
        config.chunk_size = self.chunk_size;
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(in_flight) = self.max_in_flight {
            config.max_in_flight = in_flight;
        }
        config.writer_timeout = Duration::from_secs(self.writer_timeout_secs);
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // setup logger, INFO level by default
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level.as_str())).init();

    let started = Instant::now();
    let products = ProductRegistry::from_path(&cli.products)
        .with_context(|| format!("failed to load products from {}", cli.products.display()))?;

    let input: Box<dyn Read + Send> = if cli.input == "-" {
        Box::new(io::stdin())
    } else {
        open_input(Path::new(&cli.input)).with_context(|| format!("failed to open {}", cli.input))?
    };
    let output: Box<dyn Write + Send> = if cli.output == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(File::create(&cli.output).with_context(|| format!("failed to create {}", cli.output))?)
    };

    let stats = enrich(
        input,
        output,
        &products,
        &cli.config(),
        &CancellationToken::new(),
    )
    .context("trade enrichment failed")?;

    info!(
        "done in {:.2?}: {} rows read, {} written, {} dropped",
        started.elapsed(),
        stats.rows_read,
        stats.rows_written,
        stats.rows_dropped
    );
    Ok(())
}

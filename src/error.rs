use std::io;
use std::time::Duration;

use thiserror::Error;

/// Stream-level failures. Any of these fails the whole enrichment call.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("failed to read input: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write output: {0}")]
    Write(#[source] io::Error),
    #[error("writer did not finish within {0:?}")]
    WriterTimeout(Duration),
    #[error("worker panicked while processing chunk {seq}")]
    WorkerPanicked { seq: u64 },
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("dispatched {dispatched} chunks but only {written} reached the output")]
    LostChunks { dispatched: u64, written: u64 },
    #[error("enrichment cancelled")]
    Cancelled,
    #[error("failed to load product table: {0}")]
    ProductTable(#[from] csv::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Reasons a single trade row is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("expected 4 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid date {0:?}")]
    InvalidDate(String),
}

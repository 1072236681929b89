//! Streaming enrichment of one trade CSV.
//!
//! ```text
//! reader thread --chunks--> worker pool --results--> writer thread
//!       ^                                                 |
//!       +---------------------- permits ------------------+
//! ```
//!
//! The reader takes a permit before dispatching each chunk and the writer
//! returns one per chunk written, so at most `max_in_flight` chunks are held
//! anywhere in the pipeline, including the writer's reorder buffer.

use crate::error::EnrichError;
use crate::framework::*;
use crate::lookup::Lookup;
use crate::transformers::{Chunk, ChunkProcessor, ChunkResult, TradeEnricher};
use crate::writer::{OrderedWriter, WriterSummary};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, info, warn};
use rayon::iter::ParallelBridge;
use rayon::prelude::ParallelIterator;

use std::borrow::Cow;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichConfig {
    /// Input lines per chunk.
    pub chunk_size: usize,
    /// Worker threads in the per-call pool.
    pub workers: usize,
    /// Capacity of the reader->worker and worker->writer channels.
    pub queue_capacity: usize,
    /// Chunks dispatched but not yet written.
    pub max_in_flight: usize,
    /// How long to wait for the writer once all chunks are processed.
    ///
    /// On expiry the call fails with `WriterTimeout`, but it still joins the
    /// writer thread, so a `write` blocked in the output stream delays the
    /// return until that write comes back.
    pub writer_timeout: Duration,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(workers)
    }
}

impl EnrichConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            chunk_size: 10_000,
            workers,
            queue_capacity: workers * 2,
            max_in_flight: workers * 4,
            writer_timeout: Duration::from_secs(5 * 60),
        }
    }

    pub fn validate(&self) -> Result<(), EnrichError> {
        let checks = [
            ("chunk_size", self.chunk_size),
            ("workers", self.workers),
            ("queue_capacity", self.queue_capacity),
            ("max_in_flight", self.max_in_flight),
        ];
        for (name, value) in checks.iter() {
            if *value == 0 {
                return Err(EnrichError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.writer_timeout.is_zero() {
            return Err(EnrichError::InvalidConfig(
                "writer_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EnrichStats {
    pub chunks: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_dropped: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReadSummary {
    chunks: u64,
    lines: u64,
}

/// External cancellation plus the pipeline's own abort flag.
struct Halt<'a> {
    cancel: &'a CancellationToken,
    abort: AtomicBool,
}

impl<'a> Halt<'a> {
    fn new(cancel: &'a CancellationToken) -> Self {
        Self {
            cancel,
            abort: AtomicBool::new(false),
        }
    }

    fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    fn is_halted(&self) -> bool {
        self.cancel.is_cancelled() || self.abort.load(Ordering::Acquire)
    }
}

/// Enriches the trade CSV on `input` into `output`, replacing product ids with
/// names from `lookup`.
///
/// Returns only after every dispatched chunk is accounted for and the output
/// has been flushed, or with the first fatal error.
pub fn enrich<R, W, L>(
    input: R,
    output: W,
    lookup: &L,
    config: &EnrichConfig,
    cancel: &CancellationToken,
) -> Result<EnrichStats, EnrichError>
where
    R: Read + Send,
    W: Write + Send,
    L: Lookup + ?Sized,
{
    let processor = ChunkProcessor::new(TradeEnricher::new(lookup));
    run(input, output, &processor, config, cancel)
}

/// Runs the chunked pipeline with an arbitrary row transform.
pub fn run<R, W, T>(
    input: R,
    output: W,
    processor: &ChunkProcessor<T>,
    config: &EnrichConfig,
    cancel: &CancellationToken,
) -> Result<EnrichStats, EnrichError>
where
    R: Read + Send,
    W: Write + Send,
    T: Transform<Input = String, Output = String>,
{
    config.validate()?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|i| format!("enrich-worker-{}", i))
        .build()?;

    info!(
        "enriching with {} workers, chunk size {}, {} chunks in flight",
        config.workers, config.chunk_size, config.max_in_flight
    );

    let (chunk_tx, chunk_rx) = bounded::<Chunk>(config.queue_capacity);
    let (result_tx, result_rx) = bounded::<ChunkResult>(config.queue_capacity);
    let (permit_tx, permit_rx) = bounded::<()>(config.max_in_flight);
    let (done_tx, done_rx) = bounded::<Result<WriterSummary, EnrichError>>(1);
    for _ in 0..config.max_in_flight {
        let _ = permit_tx.try_send(());
    }

    let halt = Halt::new(cancel);
    let halt = &halt;

    let (read, worked, written) = thread::scope(|s| {
        let writer = s.spawn(move || {
            let outcome = OrderedWriter::new(output).run(result_rx, permit_tx, || halt.is_halted());
            match &outcome {
                Err(EnrichError::Cancelled) => debug!("writer halted"),
                Err(e) => {
                    error!("writer failed: {}", e);
                    halt.abort();
                }
                Ok(_) => {}
            }
            let _ = done_tx.send(outcome);
        });

        let chunk_size = config.chunk_size;
        let reader = s.spawn(move || read_chunks(input, chunk_size, chunk_tx, permit_rx, halt));

        let worked = pool.install(|| {
            chunk_rx.into_iter().par_bridge().try_for_each(|chunk| {
                if halt.is_halted() {
                    return Err(EnrichError::Cancelled);
                }
                let seq = chunk.seq;
                let result = panic::catch_unwind(AssertUnwindSafe(|| processor.process(chunk)))
                    .map_err(|_| EnrichError::WorkerPanicked { seq })?;
                debug!("processed chunk {}", seq);
                result_tx.send(result).map_err(|_| EnrichError::Cancelled)
            })
        });
        if let Err(e) = &worked {
            if !matches!(e, EnrichError::Cancelled) {
                error!("workers failed: {}", e);
            }
            halt.abort();
        }
        // last sender gone: the writer sees end-of-stream
        drop(result_tx);

        let read = reader.join().unwrap_or_else(|_| {
            Err(EnrichError::Read(io::Error::new(
                io::ErrorKind::Other,
                "reader thread panicked",
            )))
        });

        let written = match done_rx.recv_timeout(config.writer_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                error!("writer still busy after {:?}, aborting", config.writer_timeout);
                halt.abort();
                Err(EnrichError::WriterTimeout(config.writer_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EnrichError::Write(io::Error::new(
                io::ErrorKind::Other,
                "writer thread panicked",
            ))),
        };
        let _ = writer.join();

        (read, worked, written)
    });

    let stats = settle(read, worked, written)?;
    info!(
        "enriched {} chunks: {} rows read, {} written, {} dropped",
        stats.chunks, stats.rows_read, stats.rows_written, stats.rows_dropped
    );
    Ok(stats)
}

/// Picks the outcome of the whole call from the outcomes of its stages.
fn settle(
    read: Result<ReadSummary, EnrichError>,
    worked: Result<(), EnrichError>,
    written: Result<WriterSummary, EnrichError>,
) -> Result<EnrichStats, EnrichError> {
    let (read, read_err) = split(read);
    let (written, write_err) = split(written);

    // stages that merely noticed the halt report Cancelled, the cause is elsewhere
    let mut halted = false;
    for e in [worked.err(), write_err, read_err].into_iter().flatten() {
        match e {
            EnrichError::Cancelled => halted = true,
            e => return Err(e),
        }
    }

    let (read, written) = match (read, written) {
        (Some(read), Some(written)) if !halted => (read, written),
        _ => return Err(EnrichError::Cancelled),
    };

    if written.chunks_written != read.chunks || written.stranded > 0 {
        return Err(EnrichError::LostChunks {
            dispatched: read.chunks,
            written: written.chunks_written,
        });
    }

    Ok(EnrichStats {
        chunks: read.chunks,
        rows_read: read.lines,
        rows_written: written.rows_written,
        rows_dropped: read.lines.saturating_sub(written.rows_written),
    })
}

fn split<T>(outcome: Result<T, EnrichError>) -> (Option<T>, Option<EnrichError>) {
    match outcome {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(e)),
    }
}

/// Skips the header, then cuts the remaining lines into chunks.
///
/// A read error ends assembly after dispatching the lines read so far;
/// chunks already dispatched still run to completion.
fn read_chunks<R: Read>(
    input: R,
    chunk_size: usize,
    chunks: Sender<Chunk>,
    permits: Receiver<()>,
    halt: &Halt<'_>,
) -> Result<ReadSummary, EnrichError> {
    let mut input = BufReader::new(input);
    let mut buf = Vec::new();
    let mut summary = ReadSummary::default();

    match next_line(&mut input, &mut buf) {
        Ok(None) => return Ok(summary),
        Err(e) => return Err(read_failed(e, &summary)),
        Ok(Some(header)) => debug!("skipping input header {:?}", header),
    }

    let mut current = Vec::with_capacity(chunk_size);
    loop {
        if halt.is_halted() {
            return Err(EnrichError::Cancelled);
        }
        let line = match next_line(&mut input, &mut buf) {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                // lines read before the failure still go out
                if !current.is_empty()
                    && dispatch(Sequenced::new(summary.chunks, current), &chunks, &permits, halt)
                        .is_ok()
                {
                    summary.chunks += 1;
                }
                return Err(read_failed(e, &summary));
            }
        };
        current.push(line);
        summary.lines += 1;

        if current.len() == chunk_size {
            let full = std::mem::replace(&mut current, Vec::with_capacity(chunk_size));
            dispatch(Sequenced::new(summary.chunks, full), &chunks, &permits, halt)?;
            summary.chunks += 1;
        }
    }

    if !current.is_empty() {
        dispatch(Sequenced::new(summary.chunks, current), &chunks, &permits, halt)?;
        summary.chunks += 1;
    }

    debug!("input exhausted after {} lines", summary.lines);
    Ok(summary)
}

/// Reads one line without its `\n` or `\r\n`. Bytes that are not UTF-8 are
/// replaced with U+FFFD so a bad row stays a row-level problem.
fn next_line<B: BufRead>(input: &mut B, buf: &mut Vec<u8>) -> io::Result<Option<String>> {
    buf.clear();
    if input.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }

    let line = match String::from_utf8_lossy(&buf[..]) {
        Cow::Borrowed(line) => line.to_string(),
        Cow::Owned(line) => {
            warn!("replaced invalid UTF-8 in input line {:?}", line);
            line
        }
    };
    Ok(Some(line))
}

fn read_failed(e: io::Error, summary: &ReadSummary) -> EnrichError {
    error!(
        "input read failed after {} lines, {} chunks dispatched: {}",
        summary.lines, summary.chunks, e
    );
    EnrichError::Read(e)
}

fn dispatch(
    mut chunk: Chunk,
    chunks: &Sender<Chunk>,
    permits: &Receiver<()>,
    halt: &Halt<'_>,
) -> Result<(), EnrichError> {
    loop {
        if halt.is_halted() {
            return Err(EnrichError::Cancelled);
        }
        match permits.recv_timeout(POLL_INTERVAL) {
            Ok(()) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Err(EnrichError::Cancelled),
        }
    }

    debug!("dispatching chunk {} ({} lines)", chunk.seq, chunk.data.len());
    loop {
        if halt.is_halted() {
            return Err(EnrichError::Cancelled);
        }
        match chunks.send_timeout(chunk, POLL_INTERVAL) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(back)) => chunk = back,
            Err(SendTimeoutError::Disconnected(_)) => return Err(EnrichError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EnrichConfig::with_workers(3);
        assert_eq!(config.chunk_size, 10_000);
        assert_eq!(config.queue_capacity, 6);
        assert_eq!(config.max_in_flight, 12);
        assert_eq!(config.writer_timeout, Duration::from_secs(300));
        assert!(config.validate().is_ok());
        assert!(EnrichConfig::default().workers >= 1);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = EnrichConfig::with_workers(2);
        config.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(EnrichError::InvalidConfig(_))
        ));

        let mut config = EnrichConfig::with_workers(2);
        config.writer_timeout = Duration::from_secs(0);
        assert!(matches!(
            config.validate(),
            Err(EnrichError::InvalidConfig(_))
        ));

        assert!(EnrichConfig::with_workers(0).validate().is_err());
    }

    #[test]
    fn test_reader_cuts_chunks() {
        let cancel = CancellationToken::new();
        let halt = Halt::new(&cancel);
        let (chunk_tx, chunk_rx) = bounded(8);
        let (permit_tx, permit_rx) = bounded(8);
        for _ in 0..8 {
            permit_tx.send(()).unwrap();
        }

        let input = "header\na\nb\nc\nd\ne\n";
        let summary = read_chunks(input.as_bytes(), 2, chunk_tx, permit_rx, &halt).unwrap();
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.lines, 5);

        let chunks: Vec<Chunk> = chunk_rx.try_iter().collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], Sequenced::new(0, vec!["a".to_string(), "b".to_string()]));
        assert_eq!(chunks[1].seq, 1);
        assert_eq!(chunks[2], Sequenced::new(2, vec!["e".to_string()]));
    }

    #[test]
    fn test_next_line_strips_endings_and_replaces_bad_bytes() {
        let mut input = io::Cursor::new(b"a,b\r\nE\xffR\nlast".to_vec());
        let mut buf = Vec::new();

        assert_eq!(next_line(&mut input, &mut buf).unwrap().as_deref(), Some("a,b"));
        assert_eq!(
            next_line(&mut input, &mut buf).unwrap().as_deref(),
            Some("E\u{FFFD}R")
        );
        assert_eq!(next_line(&mut input, &mut buf).unwrap().as_deref(), Some("last"));
        assert_eq!(next_line(&mut input, &mut buf).unwrap(), None);
    }

    #[test]
    fn test_reader_stops_without_permits() {
        let cancel = CancellationToken::new();
        let halt = Halt::new(&cancel);
        let (chunk_tx, _chunk_rx) = bounded(8);
        let (permit_tx, permit_rx) = bounded::<()>(1);
        drop(permit_tx);

        let outcome = read_chunks("header\na\n".as_bytes(), 1, chunk_tx, permit_rx, &halt);
        assert!(matches!(outcome, Err(EnrichError::Cancelled)));
    }

    #[test]
    fn test_settle_prefers_root_cause() {
        let outcome = settle(
            Ok(ReadSummary::default()),
            Err(EnrichError::Cancelled),
            Err(EnrichError::Write(io::Error::new(io::ErrorKind::Other, "disk full"))),
        );
        assert!(matches!(outcome, Err(EnrichError::Write(_))));

        let outcome = settle(
            Err(EnrichError::Cancelled),
            Err(EnrichError::WorkerPanicked { seq: 4 }),
            Err(EnrichError::Cancelled),
        );
        assert!(matches!(outcome, Err(EnrichError::WorkerPanicked { seq: 4 })));
    }

    #[test]
    fn test_settle_detects_lost_chunks() {
        let outcome = settle(
            Ok(ReadSummary { chunks: 3, lines: 30 }),
            Ok(()),
            Ok(WriterSummary {
                chunks_written: 2,
                rows_written: 20,
                stranded: 0,
            }),
        );
        assert!(matches!(
            outcome,
            Err(EnrichError::LostChunks {
                dispatched: 3,
                written: 2
            })
        ));
    }
}

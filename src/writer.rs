use crate::error::EnrichError;
use crate::transformers::{ChunkOutput, ChunkResult, OUTPUT_HEADER};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use std::collections::BTreeMap;
use std::io::{self, BufWriter, Write};
use std::time::Duration;

/// How often a waiting writer checks whether it should stop.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WriterSummary {
    pub chunks_written: u64,
    pub rows_written: u64,
    /// Results still waiting for an earlier chunk when the input closed.
    pub stranded: usize,
}

/// Writes chunk results strictly in sequence order.
///
/// Results arriving ahead of their turn are parked until every lower
/// sequence number has been written.
pub struct OrderedWriter<W: Write> {
    out: BufWriter<W>,
    header_written: bool,
    next_seq: u64,
    pending: BTreeMap<u64, ChunkOutput>,
    rows_written: u64,
}

impl<W: Write> OrderedWriter<W> {
    pub fn new(output: W) -> Self {
        Self {
            out: BufWriter::new(output),
            header_written: false,
            next_seq: 0,
            pending: BTreeMap::new(),
            rows_written: 0,
        }
    }

    fn ensure_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            self.out.write_all(OUTPUT_HEADER.as_bytes())?;
            self.out.write_all(b"\n")?;
            self.header_written = true;
        }
        Ok(())
    }

    /// Takes one result and writes everything that has become contiguous.
    /// Returns how many chunks were written.
    pub fn accept(&mut self, result: ChunkResult) -> io::Result<usize> {
        self.ensure_header()?;

        if result.seq < self.next_seq || self.pending.contains_key(&result.seq) {
            error!("ignoring duplicate result for chunk {}", result.seq);
            return Ok(0);
        }
        self.pending.insert(result.seq, result.data);

        let mut emitted = 0;
        while let Some(output) = self.pending.remove(&self.next_seq) {
            self.emit(&output)?;
            debug!(
                "wrote chunk {} ({} of {} rows kept)",
                self.next_seq, output.rows_out, output.rows_in
            );
            self.next_seq += 1;
            emitted += 1;
        }

        Ok(emitted)
    }

    fn emit(&mut self, output: &ChunkOutput) -> io::Result<()> {
        if output.text.is_empty() {
            return Ok(());
        }
        if self.rows_written > 0 {
            self.out.write_all(b"\n")?;
        }
        self.out.write_all(output.text.as_bytes())?;
        self.rows_written += output.rows_out as u64;
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Flushes and releases the output stream.
    pub fn finish(mut self) -> io::Result<WriterSummary> {
        self.ensure_header()?;
        self.out.flush()?;

        let summary = WriterSummary {
            chunks_written: self.next_seq,
            rows_written: self.rows_written,
            stranded: self.pending.len(),
        };
        if summary.stranded > 0 {
            error!(
                "{} chunk results never became writable, next expected chunk was {}",
                summary.stranded, self.next_seq
            );
        }

        drop(self.out.into_inner().map_err(|e| e.into_error())?);
        Ok(summary)
    }

    /// Drains `results` until every sender is gone, handing one permit back per
    /// chunk written. Stops early with [`EnrichError::Cancelled`] once `halted`
    /// reports true.
    pub fn run<F>(
        mut self,
        results: Receiver<ChunkResult>,
        permits: Sender<()>,
        halted: F,
    ) -> Result<WriterSummary, EnrichError>
    where
        F: Fn() -> bool,
    {
        self.ensure_header().map_err(EnrichError::Write)?;

        loop {
            if halted() {
                // keep whatever complete chunks already went out
                self.out.flush().map_err(EnrichError::Write)?;
                return Err(EnrichError::Cancelled);
            }

            match results.recv_timeout(POLL_INTERVAL) {
                Ok(result) => {
                    let emitted = self.accept(result).map_err(EnrichError::Write)?;
                    for _ in 0..emitted {
                        // the reader may already be gone
                        let _ = permits.try_send(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.finish().map_err(EnrichError::Write)
    }
}

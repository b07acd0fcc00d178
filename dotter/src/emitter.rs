//! The burst emitter.
//!
//! A burst is `burst_size` copies of [`RECORD`] written to a [`Sink`]. The
//! record never varies.
//!
//! ## Metrics
//!
//! `cron_log_total`: see [`crate::counter`]
//! `emit_failure`: Number of records the sink refused
//!

use std::{
    fmt, io,
    sync::{Arc, Mutex},
};

use metrics::counter;
use tracing::trace;

use crate::counter::LineCounter;

/// The record written for every emitted line.
pub const RECORD: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Errors produced by a [`Sink`].
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    /// Wrapper for [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A writer lock was poisoned by a panicking writer.
    #[error("sink writer lock poisoned")]
    Poisoned,
}

/// Errors produced by [`Emitter`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The sink refused one or more records of a burst.
    #[error("sink refused {failed} of {attempted} records: {source}")]
    Sink {
        /// Records the sink refused
        failed: u64,
        /// Records attempted in the burst
        attempted: u64,
        /// The last error the sink returned
        #[source]
        source: SinkError,
    },
}

/// Destination for emitted records.
pub trait Sink: Send + Sync + fmt::Debug {
    /// Write a single record.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying destination cannot accept the record.
    fn write_record(&self, record: &str) -> Result<(), SinkError>;
}

#[derive(Debug)]
struct LineWriter<W> {
    writer: W,
    line: Vec<u8>,
}

/// A [`Sink`] that writes each record as a line to an [`io::Write`].
///
/// Each record and its newline reach the writer in a single `write_all`, so
/// a writer shared with the diagnostic log never splits a record.
#[derive(Debug)]
pub struct WriterSink<W> {
    inner: Mutex<LineWriter<W>>,
}

impl<W> WriterSink<W> {
    /// Create a new [`WriterSink`] around `writer`.
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(LineWriter {
                writer,
                line: Vec::with_capacity(RECORD.len() + 1),
            }),
        }
    }

    /// Recover the inner writer.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Poisoned`] if a writer panicked while holding the
    /// lock.
    pub fn into_inner(self) -> Result<W, SinkError> {
        self.inner
            .into_inner()
            .map(|inner| inner.writer)
            .map_err(|_| SinkError::Poisoned)
    }
}

impl<W> Sink for WriterSink<W>
where
    W: io::Write + Send + fmt::Debug,
{
    fn write_record(&self, record: &str) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().map_err(|_| SinkError::Poisoned)?;
        let LineWriter { writer, line } = &mut *inner;
        line.clear();
        line.extend_from_slice(record.as_bytes());
        line.push(b'\n');
        writer.write_all(line)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Writes bursts of [`RECORD`] to a [`Sink`] and accounts for them in a
/// [`LineCounter`].
pub struct Emitter {
    sink: Arc<dyn Sink>,
    counter: Arc<LineCounter>,
}

impl Emitter {
    /// Create a new [`Emitter`].
    #[must_use]
    pub fn new(sink: Arc<dyn Sink>, counter: Arc<LineCounter>) -> Self {
        Self { sink, counter }
    }

    /// Write `burst_size` records, returning the number accepted by the sink.
    ///
    /// Records are never retried. The counter advances by the number the sink
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sink`] if the sink refused any record of the burst.
    pub fn burst(&self, burst_size: u32) -> Result<u64, Error> {
        let attempted = u64::from(burst_size);
        let mut failed = 0;
        let mut last_error = None;

        for _ in 0..burst_size {
            if let Err(err) = self.sink.write_record(RECORD) {
                failed += 1;
                last_error = Some(err);
            }
        }

        let written = attempted - failed;
        let total = self.counter.add(written);
        trace!(written, total, "burst complete");

        match last_error {
            None => Ok(written),
            Some(source) => {
                counter!("emit_failure").increment(failed);
                Err(Error::Sink {
                    failed,
                    attempted,
                    source,
                })
            }
        }
    }

    /// The counter bursts are accounted in.
    #[must_use]
    pub fn counter(&self) -> &LineCounter {
        &self.counter
    }
}

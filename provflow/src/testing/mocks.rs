//! In-memory sources and sinks for testing.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{ProvflowError, Result};
use crate::records::{Record, RecordSink, RecordSource};

/// A source replaying a vector of records.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    records: Vec<Record>,
    position: usize,
    closed: Arc<AtomicBool>,
}

impl VecSource {
    /// Creates a source over `records`.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            position: 0,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a source of `n` parentless records with ids `0..n`.
    #[must_use]
    pub fn sequential(n: i64) -> Self {
        Self::new((0..n).map(|id| Record::new(id, id.to_le_bytes().to_vec())).collect())
    }

    /// The records this source replays.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// A flag that flips once the source is closed, observable after the
    /// source has been moved away.
    #[must_use]
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl RecordSource for VecSource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.is_closed() {
            return Ok(None);
        }
        let record = self.records.get(self.position).cloned();
        if record.is_some() {
            self.position += 1;
        }
        Ok(record)
    }

    fn progress(&self) -> f64 {
        if self.records.is_empty() {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.position as f64 / self.records.len() as f64;
        fraction
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A sink collecting records in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    records: Vec<Record>,
    closed: bool,
}

impl VecSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consumes the sink.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl RecordSink for VecSink {
    fn write(&mut self, record: Record) -> Result<()> {
        if self.closed {
            return Err(ProvflowError::invalid_state("write to a closed sink"));
        }
        self.records.push(record);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A source that yields some records and then fails with an I/O error.
#[derive(Debug)]
pub struct FailingSource {
    inner: VecSource,
    message: String,
}

impl FailingSource {
    /// Yields `n` sequential records, then fails with `message`.
    #[must_use]
    pub fn after(n: i64, message: impl Into<String>) -> Self {
        Self {
            inner: VecSource::sequential(n),
            message: message.into(),
        }
    }
}

impl RecordSource for FailingSource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        match self.inner.next_record()? {
            Some(record) => Ok(Some(record)),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, self.message.clone()).into()),
        }
    }

    fn progress(&self) -> f64 {
        self.inner.progress() * 0.5
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

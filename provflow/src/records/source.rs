//! Record source and sink contracts.

use std::io;

use super::record::Record;
use crate::errors::Result;

/// A pull-based, single-consumer stream of records.
///
/// `Ok(None)` is the end-of-stream sentinel. A closed source reports end of
/// stream on every later pull instead of failing.
pub trait RecordSource: Send {
    /// Pulls the next record.
    fn next_record(&mut self) -> Result<Option<Record>>;

    /// Fraction of the source consumed so far, in `[0, 1]`.
    fn progress(&self) -> f64;

    /// Releases the source. Idempotent.
    fn close(&mut self) {}
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        (**self).next_record()
    }

    fn progress(&self) -> f64 {
        (**self).progress()
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// A consumer of records.
pub trait RecordSink: Send {
    /// Accepts one record.
    fn write(&mut self, record: Record) -> Result<()>;

    /// Flushes and finalizes whatever the sink persists.
    fn close(&mut self) -> Result<()>;
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn write(&mut self, record: Record) -> Result<()> {
        (**self).write(record)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Opens a record source on demand.
///
/// Mergers receive openers rather than open sources so that inputs are
/// opened lazily and an open failure can be attributed to its position.
pub trait SourceOpener: Send {
    /// Opens the source.
    fn open(&self) -> io::Result<Box<dyn RecordSource>>;

    /// Human-readable description, usually a path.
    fn describe(&self) -> String;
}

impl<F> SourceOpener for F
where
    F: Fn() -> io::Result<Box<dyn RecordSource>> + Send,
{
    fn open(&self) -> io::Result<Box<dyn RecordSource>> {
        self()
    }

    fn describe(&self) -> String {
        "<in-memory source>".to_string()
    }
}

/// Pulls `source` dry into `sink`, closing both. Returns the record count.
///
/// The sink is not closed when a pull or write fails.
pub fn copy_records<S, K>(source: &mut S, sink: &mut K) -> Result<u64>
where
    S: RecordSource + ?Sized,
    K: RecordSink + ?Sized,
{
    let mut count = 0u64;
    while let Some(record) = source.next_record()? {
        sink.write(record)?;
        count += 1;
    }
    source.close();
    sink.close()?;
    Ok(count)
}

//! Flat record stream files.
//!
//! ```text
//! chain header
//! record*
//! 0xFF
//! count  u64 LE
//! ```

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::codec::{decode_record, encode_end, encode_record, CountingReader};
use super::record::Record;
use super::source::{RecordSink, RecordSource, SourceOpener};
use crate::errors::{CorruptArtifactError, ProvflowError, Result};
use crate::provenance::{read_chain_header, ArtifactWriter, PipelineChain};

const TRAILER_LEN: u64 = 8;

/// Writes a record stream file. Nothing appears at the target until
/// [`RecordSink::close`] succeeds.
#[derive(Debug)]
pub struct RecordStreamWriter {
    writer: Option<ArtifactWriter>,
    count: u64,
    committed: Option<u64>,
}

impl RecordStreamWriter {
    /// Starts a stream at `path` carrying `chain`.
    pub fn create(path: impl Into<PathBuf>, chain: &PipelineChain) -> Result<Self> {
        Ok(Self {
            writer: Some(ArtifactWriter::create(path, chain)?),
            count: 0,
            committed: None,
        })
    }

    /// Records written so far.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.count
    }

    /// Closes the stream and returns the artifact size. A stream already
    /// closed through [`RecordSink::close`] reports its committed size.
    pub fn finish(mut self) -> Result<u64> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<u64> {
        let Some(mut writer) = self.writer.take() else {
            return self
                .committed
                .ok_or_else(|| ProvflowError::invalid_state("record stream failed to close"));
        };
        encode_end(&mut writer)?;
        writer.write_all(&self.count.to_le_bytes())?;
        debug!(target = %writer.target().display(), records = self.count, "Record stream closed");
        let bytes = writer.commit()?;
        self.committed = Some(bytes);
        Ok(bytes)
    }
}

impl RecordSink for RecordStreamWriter {
    fn write(&mut self, record: Record) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ProvflowError::invalid_state("write to a closed record stream"))?;
        encode_record(writer, &record)?;
        self.count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.finalize().map(|_| ())
    }
}

/// Reads a record stream file.
#[derive(Debug)]
pub struct RecordStreamReader {
    path: PathBuf,
    chain: PipelineChain,
    reader: CountingReader<BufReader<File>>,
    body_len: u64,
    declared: u64,
    read: u64,
    done: bool,
}

impl RecordStreamReader {
    /// Opens the stream at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let corrupt = |reason: &str| ProvflowError::from(CorruptArtifactError::new(path, reason));

        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let (chain, body_offset) = read_chain_header(&mut BufReader::new(&mut file), file_len, path)?
            .ok_or_else(|| corrupt("not a record stream: no provenance header"))?;

        if file_len < body_offset + 1 + TRAILER_LEN {
            return Err(corrupt("record stream is missing its trailer"));
        }
        file.seek(SeekFrom::End(-8))?;
        let mut trailer = [0u8; 8];
        file.read_exact(&mut trailer)?;
        let declared = u64::from_le_bytes(trailer);

        file.seek(SeekFrom::Start(body_offset))?;
        debug!(path = %path.display(), records = declared, "Record stream opened");

        Ok(Self {
            path: path.to_path_buf(),
            chain,
            reader: CountingReader::new(BufReader::new(file)),
            body_len: file_len - body_offset - TRAILER_LEN,
            declared,
            read: 0,
            done: false,
        })
    }

    /// The chain recorded in the stream.
    #[must_use]
    pub fn chain(&self) -> &PipelineChain {
        &self.chain
    }

    /// Record count declared by the trailer.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.declared
    }

    /// Reads every remaining record.
    pub fn read_all(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

impl RecordSource for RecordStreamReader {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        if let Some(record) = decode_record(&mut self.reader)? {
            self.read += 1;
            return Ok(Some(record));
        }

        self.done = true;
        if self.read != self.declared {
            return Err(CorruptArtifactError::new(
                &self.path,
                format!("trailer declares {} records, found {}", self.declared, self.read),
            )
            .into());
        }
        Ok(None)
    }

    fn progress(&self) -> f64 {
        if self.done || self.body_len == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.reader.count() as f64 / self.body_len as f64;
        fraction.min(1.0)
    }

    fn close(&mut self) {
        self.done = true;
    }
}

/// Opens a record stream file as a merge input.
#[derive(Debug, Clone)]
pub struct StreamFileOpener {
    path: PathBuf,
}

impl StreamFileOpener {
    /// Creates an opener for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceOpener for StreamFileOpener {
    fn open(&self) -> io::Result<Box<dyn RecordSource>> {
        match RecordStreamReader::open(&self.path) {
            Ok(reader) => Ok(Box::new(reader)),
            Err(ProvflowError::Io(e)) => Err(e),
            Err(other) => Err(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

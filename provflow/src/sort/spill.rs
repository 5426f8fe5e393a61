//! Scoped temporary storage for sorted runs.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use super::external::SortKey;
use crate::errors::Result;
use crate::records::{decode_record, encode_end, encode_record, Record};

/// A private temporary directory holding the runs of one sort.
///
/// Every sort gets its own arena; the directory and all runs are removed
/// when the arena is dropped, whatever the exit path.
#[derive(Debug)]
pub struct SpillArena {
    dir: TempDir,
    tag: Uuid,
    runs: Vec<PathBuf>,
    bytes: u64,
}

impl SpillArena {
    /// Creates an arena under `parent`, or the system temp directory.
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let tag = Uuid::new_v4();
        let prefix = format!("provflow-sort-{tag}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        debug!(arena = %tag, path = %dir.path().display(), "Spill arena created");
        Ok(Self {
            dir,
            tag,
            runs: Vec::new(),
            bytes: 0,
        })
    }

    /// Arena identifier, for log correlation.
    #[must_use]
    pub fn tag(&self) -> Uuid {
        self.tag
    }

    /// Directory holding the runs.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Number of runs written.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Bytes spilled so far.
    #[must_use]
    pub fn bytes_spilled(&self) -> u64 {
        self.bytes
    }

    /// Writes an already sorted run.
    pub fn spill(&mut self, run: &[(SortKey, Record)]) -> Result<usize> {
        let index = self.runs.len();
        let path = self.dir.path().join(format!("run-{index:05}.bin"));
        let mut writer = BufWriter::new(File::create(&path)?);
        let mut bytes = 0u64;
        for (key, record) in run {
            bytes += encode_record(&mut writer, record)?;
            writer.write_all(&key.key.to_le_bytes())?;
            bytes += 8;
        }
        encode_end(&mut writer)?;
        writer.flush()?;

        self.bytes += bytes + 1;
        self.runs.push(path);
        debug!(arena = %self.tag, run = index, records = run.len(), bytes, "Sorted run spilled");
        Ok(index)
    }

    /// Opens every run for merging.
    pub(crate) fn open_runs(&self) -> Result<Vec<RunReader>> {
        self.runs
            .iter()
            .map(|path| Ok(RunReader { reader: BufReader::new(File::open(path)?) }))
            .collect()
    }
}

impl Drop for SpillArena {
    fn drop(&mut self) {
        debug!(arena = %self.tag, runs = self.runs.len(), bytes = self.bytes, "Spill arena released");
    }
}

/// Sequential reader over one spilled run.
#[derive(Debug)]
pub(crate) struct RunReader {
    reader: BufReader<File>,
}

impl RunReader {
    pub(crate) fn next_entry(&mut self) -> Result<Option<(SortKey, Record)>> {
        let Some(record) = decode_record(&mut self.reader)? else {
            return Ok(None);
        };
        let mut key = [0u8; 8];
        self.reader.read_exact(&mut key)?;
        Ok(Some((SortKey::new(&record, i64::from_le_bytes(key)), record)))
    }
}

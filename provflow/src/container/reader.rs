//! Random-access reading of indexed containers.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::CONTAINER_MAGIC;
use crate::errors::{CorruptArtifactError, ProvflowError, Result, UnknownParentError};
use crate::provenance::{read_chain_header, PipelineChain};
use crate::records::{decode_record, Record, RecordSource};

const TRAILER_LEN: u64 = 16;
const INDEX_ENTRY_LEN: u64 = 16;

/// An opened container. Parents and the index are held in memory; children
/// are read from disk on demand.
#[derive(Debug, Clone)]
pub struct ContainerReader {
    path: PathBuf,
    chain: PipelineChain,
    parents: Vec<Record>,
    index: Vec<(u64, u64)>,
    index_offset: u64,
}

impl ContainerReader {
    /// Opens and validates the container at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let corrupt = |reason: String| ProvflowError::from(CorruptArtifactError::new(path, reason));

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let (chain, body_offset) = read_chain_header(&mut reader, file_len, path)?
            .ok_or_else(|| corrupt("not a container: no provenance header".to_string()))?;

        let fixed = body_offset + CONTAINER_MAGIC.len() as u64 + 4;
        if file_len < fixed + TRAILER_LEN {
            return Err(corrupt("container is truncated".to_string()));
        }
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != CONTAINER_MAGIC {
            return Err(corrupt("missing container magic".to_string()));
        }
        let parent_count = read_u32(&mut reader)? as usize;

        reader.seek(SeekFrom::End(-16))?;
        let first_parent_offset = read_u64(&mut reader)?;
        let index_offset = read_u64(&mut reader)?;
        if first_parent_offset != fixed {
            return Err(corrupt(format!(
                "trailer places parents at {first_parent_offset}, expected {fixed}"
            )));
        }
        if index_offset.checked_add(parent_count as u64 * INDEX_ENTRY_LEN + TRAILER_LEN)
            != Some(file_len)
        {
            return Err(corrupt(format!(
                "index of {parent_count} entries at {index_offset} does not fit a {file_len} byte file"
            )));
        }

        reader.seek(SeekFrom::Start(first_parent_offset))?;
        let mut parents = Vec::with_capacity(parent_count.min(1 << 16));
        for position in 0..parent_count {
            let parent = decode_record(&mut reader)
                .map_err(|e| corrupt(format!("parent {position} unreadable: {e}")))?
                .ok_or_else(|| corrupt(format!("parent list ends at {position}")))?;
            if usize::try_from(parent.id).ok() != Some(position) {
                return Err(corrupt(format!("parent at {position} has id {}", parent.id)));
            }
            parents.push(parent);
        }
        let children_start = reader.stream_position()?;

        reader.seek(SeekFrom::Start(index_offset))?;
        let mut index = Vec::with_capacity(parent_count);
        let mut floor = children_start;
        for position in 0..parent_count {
            let offset = read_u64(&mut reader)?;
            let count = read_u64(&mut reader)?;
            if offset < floor || offset > index_offset {
                return Err(corrupt(format!("index entry {position} points outside the child region")));
            }
            floor = offset;
            index.push((offset, count));
        }

        debug!(path = %path.display(), parents = parent_count, "Container opened");
        Ok(Self {
            path: path.to_path_buf(),
            chain,
            parents,
            index,
            index_offset,
        })
    }

    /// Path of the container.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The chain recorded in the container.
    #[must_use]
    pub fn chain(&self) -> &PipelineChain {
        &self.chain
    }

    /// All parents; a parent's id is its position.
    #[must_use]
    pub fn parents(&self) -> &[Record] {
        &self.parents
    }

    /// Number of parents.
    #[must_use]
    pub fn parent_count(&self) -> usize {
        self.parents.len()
    }

    /// Number of children of `parent_id`.
    pub fn child_count(&self, parent_id: i32) -> Result<u64> {
        Ok(self.entry(parent_id)?.1)
    }

    /// Number of children across all parents.
    #[must_use]
    pub fn total_children(&self) -> u64 {
        self.index.iter().map(|(_, count)| count).sum()
    }

    /// Location of the children of `parent_id`.
    pub fn child_range(&self, parent_id: i32) -> Result<ChildRange> {
        let (offset, count) = self.entry(parent_id)?;
        Ok(ChildRange {
            path: self.path.clone(),
            offset,
            count,
        })
    }

    /// Streams the children of `parent_id` without touching other parents.
    pub fn children_of(&self, parent_id: i32) -> Result<ChildCursor> {
        self.child_range(parent_id)?.open()
    }

    /// Streams every child in parent order.
    pub fn all_children(&self) -> Result<ChildCursor> {
        let offset = self.index.first().map_or(self.index_offset, |(offset, _)| *offset);
        ChildRange {
            path: self.path.clone(),
            offset,
            count: self.total_children(),
        }
        .open()
    }

    fn entry(&self, parent_id: i32) -> Result<(u64, u64)> {
        usize::try_from(parent_id)
            .ok()
            .and_then(|p| self.index.get(p).copied())
            .ok_or_else(|| UnknownParentError { parent_id }.into())
    }
}

/// A contiguous run of children inside a container file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRange {
    path: PathBuf,
    offset: u64,
    count: u64,
}

impl ChildRange {
    /// Number of children in the range.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Opens a cursor positioned at the first child.
    pub fn open(&self) -> Result<ChildCursor> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(self.offset))?;
        Ok(ChildCursor {
            path: self.path.clone(),
            reader,
            remaining: self.count,
            total: self.count,
        })
    }
}

/// Reads a fixed number of children from a container.
#[derive(Debug)]
pub struct ChildCursor {
    path: PathBuf,
    reader: BufReader<File>,
    remaining: u64,
    total: u64,
}

impl RecordSource for ChildCursor {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let record = decode_record(&mut self.reader)?.ok_or_else(|| {
            CorruptArtifactError::new(&self.path, "child range ends before its indexed count")
        })?;
        self.remaining -= 1;
        Ok(Some(record))
    }

    fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = (self.total - self.remaining) as f64 / self.total as f64;
        fraction
    }

    fn close(&mut self) {
        self.remaining = 0;
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain, write_fixture_container};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_random_access_by_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pvc");
        write_fixture_container(&path, &[3, 0, 2]).unwrap();

        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.parent_count(), 3);
        assert_eq!(reader.total_children(), 5);

        let children = drain(reader.children_of(2).unwrap()).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.parent_id == Some(2)));
        assert!(drain(reader.children_of(1).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pvc");
        write_fixture_container(&path, &[1]).unwrap();

        let reader = ContainerReader::open(&path).unwrap();
        for bad in [1, -1] {
            let err = reader.child_count(bad).unwrap_err();
            assert!(matches!(
                err,
                ProvflowError::UnknownParent(UnknownParentError { parent_id }) if parent_id == bad
            ));
        }
    }

    #[test]
    fn test_empty_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pvc");
        write_fixture_container(&path, &[]).unwrap();

        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.parent_count(), 0);
        assert!(drain(reader.all_children().unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_container_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pvc");
        write_fixture_container(&path, &[2, 2]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert!(matches!(
            ContainerReader::open(&path),
            Err(ProvflowError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn test_cursor_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pvc");
        write_fixture_container(&path, &[4]).unwrap();

        let mut cursor = ContainerReader::open(&path).unwrap().children_of(0).unwrap();
        assert!(cursor.progress().abs() < f64::EPSILON);
        cursor.next_record().unwrap();
        cursor.next_record().unwrap();
        assert!((cursor.progress() - 0.5).abs() < f64::EPSILON);
    }
}

//! Builds indexed parent/child containers.

use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

use super::CONTAINER_MAGIC;
use crate::config::SortConfig;
use crate::errors::{ProvflowError, Result};
use crate::provenance::{ArtifactWriter, PipelineChain};
use crate::records::{encode_record, Record, RecordSource};
use crate::sort::ExternalSorter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    AwaitingParents,
    AwaitingChildren,
    ChildrenWritten,
}

/// Writes a container in one pass: parents, then the child stream, then
/// the index.
///
/// Parents must carry ids `0..n` in order. Children are sorted by parent
/// (then by the sorter's key) on the way in, spilling to disk when large.
/// Nothing appears at the target until [`ContainerWriter::finish`].
#[derive(Debug)]
pub struct ContainerWriter {
    writer: ArtifactWriter,
    sorter: ExternalSorter,
    state: WriterState,
    parent_count: usize,
    first_parent_offset: u64,
    index: Vec<(u64, u64)>,
}

impl ContainerWriter {
    /// Starts a container at `path` carrying `chain`.
    pub fn create(path: impl Into<PathBuf>, chain: &PipelineChain) -> Result<Self> {
        let mut writer = ArtifactWriter::create(path, chain)?;
        writer.write_all(CONTAINER_MAGIC)?;
        Ok(Self {
            writer,
            sorter: ExternalSorter::new(SortConfig::default()),
            state: WriterState::AwaitingParents,
            parent_count: 0,
            first_parent_offset: 0,
            index: Vec::new(),
        })
    }

    /// Replaces the sorter used for the child stream.
    #[must_use]
    pub fn with_sorter(mut self, sorter: ExternalSorter) -> Self {
        self.sorter = sorter;
        self
    }

    /// Writes the parent list. Must be called exactly once, first.
    pub fn write_parents<I>(&mut self, parents: I) -> Result<usize>
    where
        I: IntoIterator<Item = Record>,
    {
        self.expect_state(WriterState::AwaitingParents, "write_parents")?;
        let parents: Vec<Record> = parents.into_iter().collect();
        let count = u32::try_from(parents.len())
            .ok()
            .filter(|&n| i32::try_from(n).is_ok())
            .ok_or_else(|| ProvflowError::invalid_record("too many parents for one container"))?;

        for (position, parent) in parents.iter().enumerate() {
            if usize::try_from(parent.id).ok() != Some(position) {
                return Err(ProvflowError::invalid_record(format!(
                    "parent at position {position} has id {}",
                    parent.id
                )));
            }
        }

        self.writer.write_all(&count.to_le_bytes())?;
        self.first_parent_offset = self.writer.position();
        for parent in &parents {
            encode_record(&mut self.writer, parent)?;
        }

        self.parent_count = parents.len();
        self.state = WriterState::AwaitingChildren;
        debug!(parents = self.parent_count, "Container parents written");
        Ok(self.parent_count)
    }

    /// Sorts and writes the whole child stream. Must follow
    /// [`ContainerWriter::write_parents`].
    ///
    /// Every child must reference a parent in `0..parent_count`.
    pub fn sort_children<S>(&mut self, children: &mut S, expected_total: Option<u64>) -> Result<u64>
    where
        S: RecordSource + ?Sized,
    {
        self.expect_state(WriterState::AwaitingChildren, "sort_children")?;

        let mut checked = CheckedChildren {
            inner: children,
            parent_count: self.parent_count,
            consumed: 0,
        };
        let mut sorted = self.sorter.sort(&mut checked, expected_total)?;
        let consumed = checked.consumed;

        let mut index = vec![(0u64, 0u64); self.parent_count];
        let mut next_parent = 0usize;
        let mut written = 0u64;
        while let Some(child) = sorted.next_record()? {
            let parent = child
                .parent_id
                .and_then(|p| usize::try_from(p).ok())
                .filter(|&p| p < self.parent_count)
                .ok_or_else(|| ProvflowError::invalid_state("sorted child lost its parent"))?;
            while next_parent <= parent {
                index[next_parent].0 = self.writer.position();
                next_parent += 1;
            }
            encode_record(&mut self.writer, &child)?;
            index[parent].1 += 1;
            written += 1;
        }
        while next_parent < self.parent_count {
            index[next_parent].0 = self.writer.position();
            next_parent += 1;
        }

        if written != consumed {
            return Err(ProvflowError::Cancelled(format!(
                "child sort ended after {written} of {consumed} records"
            )));
        }

        self.index = index;
        self.state = WriterState::ChildrenWritten;
        debug!(children = written, "Container children written");
        Ok(written)
    }

    /// Writes the index and trailer and moves the container into place.
    /// Returns its size.
    pub fn finish(mut self) -> Result<u64> {
        self.expect_state(WriterState::ChildrenWritten, "finish")?;

        let index_offset = self.writer.position();
        for (offset, count) in &self.index {
            self.writer.write_all(&offset.to_le_bytes())?;
            self.writer.write_all(&count.to_le_bytes())?;
        }
        self.writer.write_all(&self.first_parent_offset.to_le_bytes())?;
        self.writer.write_all(&index_offset.to_le_bytes())?;

        let target = self.writer.target().to_path_buf();
        let parents = self.parent_count;
        let children: u64 = self.index.iter().map(|(_, count)| count).sum();
        let bytes = self.writer.commit()?;
        info!(path = %target.display(), parents, children, bytes, "Container written");
        Ok(bytes)
    }

    fn expect_state(&self, expected: WriterState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProvflowError::invalid_state(format!(
                "{operation} called while the container writer is in state {:?}",
                self.state
            )))
        }
    }
}

/// Rejects children without a valid parent as they stream into the sort.
struct CheckedChildren<'a, S: ?Sized> {
    inner: &'a mut S,
    parent_count: usize,
    consumed: u64,
}

impl<S: RecordSource + ?Sized> RecordSource for CheckedChildren<'_, S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(child) = self.inner.next_record()? else {
            return Ok(None);
        };
        match child.parent_id {
            None => Err(ProvflowError::invalid_record(format!(
                "child {} has no parent",
                child.id
            ))),
            Some(p) if usize::try_from(p).map_or(true, |p| p >= self.parent_count) => {
                Err(ProvflowError::invalid_record(format!(
                    "child {} references parent {p} outside 0..{}",
                    child.id, self.parent_count
                )))
            }
            Some(_) => {
                self.consumed += 1;
                Ok(Some(child))
            }
        }
    }

    fn progress(&self) -> f64 {
        self.inner.progress()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerReader;
    use crate::testing::{fixture_chain, VecSource};
    use pretty_assertions::assert_eq;

    fn parents(n: i64) -> Vec<Record> {
        (0..n).map(|i| Record::new(i, format!("parent-{i}").into_bytes())).collect()
    }

    #[test]
    fn test_order_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ContainerWriter::create(dir.path().join("c.pvc"), &fixture_chain()).unwrap();
        assert!(matches!(
            writer.sort_children(&mut VecSource::new(vec![]), None),
            Err(ProvflowError::InvalidState(_))
        ));
        writer.write_parents(parents(1)).unwrap();
        assert!(matches!(writer.write_parents(parents(1)), Err(ProvflowError::InvalidState(_))));
        assert!(matches!(writer.finish(), Err(ProvflowError::InvalidState(_))));
    }

    #[test]
    fn test_parent_ids_must_be_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ContainerWriter::create(dir.path().join("c.pvc"), &fixture_chain()).unwrap();
        let err = writer
            .write_parents(vec![Record::new(1, vec![])])
            .unwrap_err();
        assert!(matches!(err, ProvflowError::InvalidRecord(_)));
    }

    #[test]
    fn test_unparented_and_out_of_range_children_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for bad in [Record::new(0, vec![]), Record::new(0, vec![]).with_parent(2)] {
            let mut writer =
                ContainerWriter::create(dir.path().join("c.pvc"), &fixture_chain()).unwrap();
            writer.write_parents(parents(2)).unwrap();
            let err = writer
                .sort_children(&mut VecSource::new(vec![bad]), None)
                .unwrap_err();
            assert!(matches!(err, ProvflowError::InvalidRecord(_)));
        }
        assert!(!dir.path().join("c.pvc").exists());
    }

    #[test]
    fn test_children_are_grouped_by_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pvc");
        let mut writer = ContainerWriter::create(&path, &fixture_chain()).unwrap();
        writer.write_parents(parents(3)).unwrap();
        let children = vec![
            Record::new(0, b"c".to_vec()).with_parent(2),
            Record::new(1, b"a".to_vec()).with_parent(0),
            Record::new(2, b"d".to_vec()).with_parent(2),
            Record::new(3, b"b".to_vec()).with_parent(0),
        ];
        assert_eq!(writer.sort_children(&mut VecSource::new(children), None).unwrap(), 4);
        writer.finish().unwrap();

        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.child_count(0).unwrap(), 2);
        assert_eq!(reader.child_count(1).unwrap(), 0);
        assert_eq!(reader.child_count(2).unwrap(), 2);

        let all: Vec<_> = crate::testing::drain(reader.all_children().unwrap())
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }
}

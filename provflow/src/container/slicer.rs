//! Restricting a container to a subset of parents.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::reader::{ChildRange, ContainerReader};
use super::writer::ContainerWriter;
use crate::cancellation::CancellationToken;
use crate::config::SortConfig;
use crate::errors::{ProvflowError, Result, UnknownParentError};
use crate::events::{AdvisorySink, LoggingAdvisorySink};
use crate::fingerprint::ActionConfiguration;
use crate::merge::{IdRewrite, ReconciledStreamMerger};
use crate::observability::SpanTimer;
use crate::provenance::{GateMode, GuardedStep, PipelineChain, PipelineStep, StepReport};
use crate::records::{CancellableSource, Record, RecordSource, SourceOpener};
use crate::sort::ExternalSorter;

/// Summary of a slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceReport {
    /// Output container.
    pub output: PathBuf,
    /// `(old parent id, new parent id)` in output order.
    pub id_mapping: Vec<(i32, i32)>,
    /// Children written.
    pub children: u64,
    /// Requested ids ignored because they repeated an earlier one.
    pub duplicates_ignored: usize,
    /// Output size in bytes.
    pub bytes: u64,
}

impl SliceReport {
    /// Number of parents in the output.
    #[must_use]
    pub fn parents(&self) -> usize {
        self.id_mapping.len()
    }
}

/// Produces containers holding only selected parents, renumbered `0..k` in
/// request order, with their children renumbered into one fresh index.
pub struct ContainerSlicer {
    sort: SortConfig,
    child_key: Option<Arc<dyn Fn(&Record) -> i64 + Send + Sync>>,
    token: Option<CancellationToken>,
}

impl std::fmt::Debug for ContainerSlicer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSlicer")
            .field("sort", &self.sort)
            .field("child_key", &self.child_key.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ContainerSlicer {
    fn default() -> Self {
        Self::new(SortConfig::default())
    }
}

impl ContainerSlicer {
    /// Creates a slicer whose child sort follows `sort`.
    #[must_use]
    pub fn new(sort: SortConfig) -> Self {
        Self {
            sort,
            child_key: None,
            token: None,
        }
    }

    /// Orders children within a parent by `key` in the output.
    #[must_use]
    pub fn with_child_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Record) -> i64 + Send + Sync + 'static,
    {
        self.child_key = Some(Arc::new(key));
        self
    }

    /// Aborts the slice when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Writes the slice of `input` holding `keep` to `output`, carrying
    /// `chain`.
    ///
    /// Every requested id is checked before anything is written; repeated
    /// ids are ignored after their first occurrence.
    pub fn slice(
        &self,
        input: &ContainerReader,
        keep: &[i32],
        output: impl AsRef<Path>,
        chain: &PipelineChain,
    ) -> Result<(SliceReport, ContainerReader)> {
        let output = output.as_ref();
        let timer = SpanTimer::start("container_slice");

        let (selected, duplicates_ignored) = dedup(keep);
        let mut ranges = Vec::with_capacity(selected.len());
        for &parent_id in &selected {
            ranges.push(input.child_range(parent_id)?);
        }
        let expected: u64 = ranges.iter().map(ChildRange::count).sum();

        let mut id_mapping = Vec::with_capacity(selected.len());
        let mut parents = Vec::with_capacity(selected.len());
        let mut openers: Vec<Box<dyn SourceOpener>> = Vec::with_capacity(selected.len());
        for (new_id, (&old_id, range)) in (0i32..).zip(selected.iter().zip(ranges)) {
            let parent = usize::try_from(old_id)
                .ok()
                .and_then(|p| input.parents().get(p))
                .ok_or(UnknownParentError { parent_id: old_id })?;
            parents.push(parent.clone().with_id(i64::from(new_id)));
            id_mapping.push((old_id, new_id));
            openers.push(Box::new(ReparentingOpener { range, new_parent: new_id }));
        }

        let mut sorter = ExternalSorter::new(self.sort.clone());
        if let Some(key) = &self.child_key {
            let key = Arc::clone(key);
            sorter = sorter.with_key(move |record| key(record));
        }

        let merger = ReconciledStreamMerger::new(openers).with_rewrite(IdRewrite::Sequential);
        let mut children: Box<dyn RecordSource> = match &self.token {
            Some(token) => {
                sorter = sorter.with_cancellation(token.clone());
                Box::new(CancellableSource::new(merger, token.clone()))
            }
            None => Box::new(merger),
        };

        let mut writer = ContainerWriter::create(output, chain)?.with_sorter(sorter);
        writer.write_parents(parents)?;
        let written = writer.sort_children(&mut children, Some(expected))?;
        if let Some(token) = self.token.as_ref().filter(|t| t.is_cancelled()) {
            return Err(ProvflowError::Cancelled(
                token.reason().unwrap_or_else(|| "slice cancelled".to_string()),
            ));
        }
        let bytes = writer.finish()?;

        let elapsed_ms = timer.finish();
        info!(
            input = %input.path().display(),
            output = %output.display(),
            parents = id_mapping.len(),
            children = written,
            elapsed_ms,
            "Container sliced"
        );

        let report = SliceReport {
            output: output.to_path_buf(),
            id_mapping,
            children: written,
            duplicates_ignored,
            bytes,
        };
        Ok((report, ContainerReader::open(output)?))
    }

    /// The chain a slice of `input` keeping `keep` would carry.
    pub fn expected_chain(&self, input: &ContainerReader, keep: &[i32]) -> Result<PipelineChain> {
        let (selected, _) = dedup(keep);
        let step = PipelineStep::capture(&ActionConfiguration::slice(&selected), &[input.path()])?;
        Ok(input.chain().append(step)?)
    }

    /// Slices behind the provenance gate for `output`.
    pub fn run_guarded(
        &self,
        input: &ContainerReader,
        keep: &[i32],
        output: impl Into<PathBuf>,
        mode: GateMode,
        sink: Option<Arc<dyn AdvisorySink>>,
    ) -> Result<StepReport> {
        let expected = self.expected_chain(input, keep)?;
        GuardedStep::new(output, expected)
            .with_mode(mode)
            .with_sink(sink.unwrap_or_else(|| Arc::new(LoggingAdvisorySink)))
            .run_with(|path, chain| {
                let (report, _) = self.slice(input, keep, path, chain)?;
                Ok(Some(report.bytes))
            })
    }
}

/// Slices `input` to `keep` at `output`, recording a slice step on top of
/// the input's chain.
pub fn slice_container(
    input: &ContainerReader,
    keep: &[i32],
    output: impl AsRef<Path>,
) -> Result<ContainerReader> {
    let slicer = ContainerSlicer::default();
    let chain = slicer.expected_chain(input, keep)?;
    slicer.slice(input, keep, output, &chain).map(|(_, reader)| reader)
}

fn dedup(keep: &[i32]) -> (Vec<i32>, usize) {
    let mut seen = HashSet::with_capacity(keep.len());
    let mut selected = Vec::with_capacity(keep.len());
    let mut duplicates = 0;
    for &id in keep {
        if seen.insert(id) {
            selected.push(id);
        } else {
            warn!(parent_id = id, "Duplicate parent id in slice request ignored");
            duplicates += 1;
        }
    }
    (selected, duplicates)
}

/// Opens one parent's children and retags them with the parent's new id.
struct ReparentingOpener {
    range: ChildRange,
    new_parent: i32,
}

impl SourceOpener for ReparentingOpener {
    fn open(&self) -> io::Result<Box<dyn RecordSource>> {
        let cursor = self.range.open().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Box::new(Reparented {
            inner: cursor,
            new_parent: self.new_parent,
        }))
    }

    fn describe(&self) -> String {
        format!("children of new parent {}", self.new_parent)
    }
}

struct Reparented<S> {
    inner: S,
    new_parent: i32,
}

impl<S: RecordSource> RecordSource for Reparented<S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.inner.next_record()?.map(|mut record| {
            record.parent_id = Some(self.new_parent);
            record
        }))
    }

    fn progress(&self) -> f64 {
        self.inner.progress()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

//! Merging ordered record streams into one identifier space.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use tracing::{debug, info};

use crate::errors::{ProvflowError, Result, SourceOpenError};
use crate::fingerprint::ActionConfiguration;
use crate::observability::ProgressHandle;
use crate::provenance::PipelineChain;
use crate::records::{copy_records, Record, RecordSink, RecordSource, SourceOpener};

/// How output identifiers are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdRewrite {
    /// `original + offset`, where the offset grows past each exhausted
    /// source.
    #[default]
    Offset,
    /// `0, 1, 2, ...` in emission order.
    Sequential,
}

/// How sources are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// All of source `k` before any of source `k + 1`.
    #[default]
    Concatenate,
    /// Records interleaved by key; ties go to the lower source index.
    KeyOrdered,
}

/// Ordering key for key-ordered merges.
pub type MergeKey = Box<dyn Fn(&Record) -> i64 + Send>;

/// Presents several ordered sources as one ordered source with strictly
/// increasing, globally unique identifiers.
///
/// Sources are opened lazily, in order. Single consumer only.
pub struct ReconciledStreamMerger {
    openers: Vec<Box<dyn SourceOpener>>,
    mode: MergeMode,
    rewrite: IdRewrite,
    key: MergeKey,
    progress: ProgressHandle,
    state: State,
    emitted: u64,
    next_sequential: i64,
}

enum State {
    Pending,
    Concatenating(Concat),
    KeyOrdered(Keyed),
    Done,
}

struct Concat {
    index: usize,
    current: Option<Box<dyn RecordSource>>,
    /// Offset the next non-empty source starts from at the earliest.
    floor: i64,
    /// Offset of the current source, fixed by its first record.
    offset: Option<i64>,
    count: u64,
    last_id: Option<i64>,
    last_emitted: Option<i64>,
}

struct Keyed {
    sources: Vec<Box<dyn RecordSource>>,
    heads: Vec<Option<Record>>,
    last_keys: Vec<Option<i64>>,
    heap: BinaryHeap<Reverse<(i64, usize)>>,
}

impl fmt::Debug for ReconciledStreamMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciledStreamMerger")
            .field("sources", &self.openers.len())
            .field("mode", &self.mode)
            .field("rewrite", &self.rewrite)
            .field("emitted", &self.emitted)
            .finish_non_exhaustive()
    }
}

impl ReconciledStreamMerger {
    /// Creates a concatenating, offset-rewriting merger over `openers`.
    #[must_use]
    pub fn new(openers: Vec<Box<dyn SourceOpener>>) -> Self {
        Self {
            openers,
            mode: MergeMode::Concatenate,
            rewrite: IdRewrite::Offset,
            key: Box::new(|record| record.id),
            progress: ProgressHandle::new(),
            state: State::Pending,
            emitted: 0,
            next_sequential: 0,
        }
    }

    /// Creates a merger over already-open sources.
    #[must_use]
    pub fn from_sources(sources: Vec<Box<dyn RecordSource>>) -> Self {
        Self::new(
            sources
                .into_iter()
                .enumerate()
                .map(|(index, source)| Box::new(OpenedSource::new(index, source)) as Box<dyn SourceOpener>)
                .collect(),
        )
    }

    /// Appends another source.
    #[must_use]
    pub fn with_source(mut self, opener: impl SourceOpener + 'static) -> Self {
        self.openers.push(Box::new(opener));
        self
    }

    /// Sets the merge mode. Key-ordered merges always number sequentially.
    #[must_use]
    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        if mode == MergeMode::KeyOrdered {
            self.rewrite = IdRewrite::Sequential;
        }
        self
    }

    /// Sets the identifier rewrite for concatenating merges.
    #[must_use]
    pub fn with_rewrite(mut self, rewrite: IdRewrite) -> Self {
        if self.mode == MergeMode::Concatenate {
            self.rewrite = rewrite;
        }
        self
    }

    /// Sets the key for key-ordered merges. Defaults to the original id.
    #[must_use]
    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Record) -> i64 + Send + 'static,
    {
        self.key = Box::new(key);
        self
    }

    /// Shares progress with an external observer.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = progress;
        self
    }

    /// A handle observing this merge's progress.
    #[must_use]
    pub fn progress_handle(&self) -> ProgressHandle {
        self.progress.clone()
    }

    /// Records emitted so far.
    #[must_use]
    pub fn records_emitted(&self) -> u64 {
        self.emitted
    }

    /// Number of sources.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.openers.len()
    }

    /// Configuration recorded for this merge, given the inputs' chains.
    #[must_use]
    pub fn action_configuration(&self, sources: Vec<PipelineChain>) -> ActionConfiguration {
        ActionConfiguration::Merge {
            key_ordered: self.mode == MergeMode::KeyOrdered,
            sources,
        }
    }

    /// Streams everything into `sink` and closes it.
    pub fn write_to<K: RecordSink + ?Sized>(mut self, sink: &mut K) -> Result<u64> {
        copy_records(&mut self, sink)
    }

    fn open(&self, index: usize) -> Result<Box<dyn RecordSource>> {
        let opener = &self.openers[index];
        let source = opener
            .open()
            .map_err(|e| SourceOpenError::new(index, opener.describe(), e))?;
        debug!(index, source = %opener.describe(), "Merge source opened");
        Ok(source)
    }

    fn assign_id(&mut self, original: i64, offset: i64) -> Result<i64> {
        match self.rewrite {
            IdRewrite::Offset => original.checked_add(offset).ok_or_else(|| {
                ProvflowError::invalid_record(format!("id {original} overflows with offset {offset}"))
            }),
            IdRewrite::Sequential => {
                let id = self.next_sequential;
                self.next_sequential += 1;
                Ok(id)
            }
        }
    }

    fn finish(&mut self) {
        if !matches!(self.state, State::Done) {
            self.state = State::Done;
            self.progress.complete();
            info!(sources = self.openers.len(), records = self.emitted, "Merge finished");
        }
    }

    fn next_concatenated(&mut self) -> Result<Option<Record>> {
        loop {
            let State::Concatenating(concat) = &mut self.state else {
                return Ok(None);
            };

            let Some(current) = concat.current.as_mut() else {
                if concat.index >= self.openers.len() {
                    self.finish();
                    return Ok(None);
                }
                let index = concat.index;
                let source = self.open(index)?;
                if let State::Concatenating(concat) = &mut self.state {
                    concat.current = Some(source);
                }
                continue;
            };

            match current.next_record()? {
                Some(record) => {
                    let index = concat.index;
                    if self.rewrite == IdRewrite::Offset {
                        if let Some(last) = concat.last_id {
                            if record.id <= last {
                                return Err(ProvflowError::invalid_record(format!(
                                    "source #{index} emitted id {} after {last}",
                                    record.id
                                )));
                            }
                        }
                    }
                    let offset = match concat.offset {
                        Some(offset) => offset,
                        None => {
                            let offset = if self.rewrite == IdRewrite::Offset {
                                source_offset(concat.floor, concat.last_emitted, record.id)?
                            } else {
                                0
                            };
                            concat.offset = Some(offset);
                            offset
                        }
                    };
                    concat.last_id = Some(record.id);
                    concat.count += 1;

                    #[allow(clippy::cast_precision_loss)]
                    let fraction =
                        (index as f64 + current.progress()) / self.openers.len() as f64;
                    self.progress.advance_to(fraction);

                    let id = self.assign_id(record.id, offset)?;
                    if let State::Concatenating(concat) = &mut self.state {
                        concat.last_emitted = Some(id);
                    }
                    self.emitted += 1;
                    return Ok(Some(record.with_id(id)));
                }
                None => {
                    current.close();
                    debug!(
                        index = concat.index,
                        records = concat.count,
                        offset = ?concat.offset,
                        "Merge source exhausted"
                    );
                    if let Some(offset) = concat.offset {
                        let count = i64::try_from(concat.count).unwrap_or(i64::MAX);
                        concat.floor = offset.saturating_add(count);
                    }
                    concat.index += 1;
                    concat.current = None;
                    concat.offset = None;
                    concat.count = 0;
                    concat.last_id = None;

                    #[allow(clippy::cast_precision_loss)]
                    let fraction = concat.index as f64 / self.openers.len() as f64;
                    self.progress.advance_to(fraction);
                }
            }
        }
    }

    fn open_all(&self) -> Result<Keyed> {
        let mut keyed = Keyed {
            sources: Vec::with_capacity(self.openers.len()),
            heads: Vec::with_capacity(self.openers.len()),
            last_keys: vec![None; self.openers.len()],
            heap: BinaryHeap::new(),
        };
        for index in 0..self.openers.len() {
            let source = self.open(index)?;
            keyed.sources.push(source);
            keyed.heads.push(None);
            self.refill(&mut keyed, index)?;
        }
        Ok(keyed)
    }

    fn refill(&self, keyed: &mut Keyed, index: usize) -> Result<()> {
        match keyed.sources[index].next_record()? {
            Some(record) => {
                let key = (self.key)(&record);
                if let Some(last) = keyed.last_keys[index] {
                    if key < last {
                        return Err(ProvflowError::invalid_record(format!(
                            "source #{index} is not ordered by key: {key} after {last}"
                        )));
                    }
                }
                keyed.last_keys[index] = Some(key);
                keyed.heads[index] = Some(record);
                keyed.heap.push(Reverse((key, index)));
            }
            None => {
                keyed.sources[index].close();
                debug!(index, "Merge source exhausted");
            }
        }
        Ok(())
    }

    fn next_keyed(&mut self) -> Result<Option<Record>> {
        let State::KeyOrdered(mut keyed) = std::mem::replace(&mut self.state, State::Done) else {
            return Ok(None);
        };

        let Some(Reverse((_, index))) = keyed.heap.pop() else {
            self.state = State::KeyOrdered(keyed);
            self.finish();
            return Ok(None);
        };
        let record = keyed.heads[index].take();
        let refilled = self.refill(&mut keyed, index);

        #[allow(clippy::cast_precision_loss)]
        let fraction = keyed.sources.iter().map(|s| s.progress()).sum::<f64>()
            / keyed.sources.len().max(1) as f64;
        self.progress.advance_to(fraction);
        self.state = State::KeyOrdered(keyed);
        refilled?;

        match record {
            Some(record) => {
                let id = self.assign_id(record.id, 0)?;
                self.emitted += 1;
                Ok(Some(record.with_id(id)))
            }
            None => Err(ProvflowError::invalid_state("merge heap out of sync with sources")),
        }
    }
}

impl RecordSource for ReconciledStreamMerger {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if matches!(self.state, State::Pending) {
            debug!(sources = self.openers.len(), mode = ?self.mode, "Merge started");
            self.state = match self.mode {
                MergeMode::Concatenate => State::Concatenating(Concat {
                    index: 0,
                    current: None,
                    floor: 0,
                    offset: None,
                    count: 0,
                    last_id: None,
                    last_emitted: None,
                }),
                MergeMode::KeyOrdered => State::KeyOrdered(self.open_all()?),
            };
        }

        match self.state {
            State::Concatenating(_) => self.next_concatenated(),
            State::KeyOrdered(_) => self.next_keyed(),
            State::Pending | State::Done => Ok(None),
        }
    }

    fn progress(&self) -> f64 {
        self.progress.fraction()
    }

    fn close(&mut self) {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Concatenating(Concat { current: Some(mut current), .. }) => current.close(),
            State::KeyOrdered(mut keyed) => keyed.sources.iter_mut().for_each(|s| s.close()),
            _ => {}
        }
    }
}

/// Merges already-open sources by concatenation with offset rewriting.
#[must_use]
pub fn merge_streams(sources: Vec<Box<dyn RecordSource>>) -> ReconciledStreamMerger {
    ReconciledStreamMerger::from_sources(sources)
}

/// Hands out a source that is already open, exactly once.
struct OpenedSource {
    index: usize,
    source: Mutex<Option<Box<dyn RecordSource>>>,
}

impl OpenedSource {
    fn new(index: usize, source: Box<dyn RecordSource>) -> Self {
        Self {
            index,
            source: Mutex::new(Some(source)),
        }
    }
}

impl SourceOpener for OpenedSource {
    fn open(&self) -> io::Result<Box<dyn RecordSource>> {
        self.source
            .lock()
            .take()
            .ok_or_else(|| io::Error::other("source was already consumed"))
    }

    fn describe(&self) -> String {
        format!("open source #{}", self.index)
    }
}

/// Offset for a source whose first id is `first_id`: at least `floor`, and
/// high enough that its first record lands after everything already emitted.
fn source_offset(floor: i64, last_emitted: Option<i64>, first_id: i64) -> Result<i64> {
    let Some(last) = last_emitted else {
        return Ok(floor);
    };
    let needed = last
        .checked_add(1)
        .and_then(|next| next.checked_sub(first_id))
        .ok_or_else(|| {
            ProvflowError::invalid_record(format!("id {first_id} cannot follow emitted id {last}"))
        })?;
    Ok(floor.max(needed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_strictly_increasing_ids, drain, FailingSource, VecSink, VecSource};
    use mockall::mock;
    use pretty_assertions::assert_eq;

    mock! {
        Opener {}
        impl SourceOpener for Opener {
            fn open(&self) -> io::Result<Box<dyn RecordSource>>;
            fn describe(&self) -> String;
        }
    }

    fn boxed(source: VecSource) -> Box<dyn RecordSource> {
        Box::new(source)
    }

    #[test]
    fn test_concatenation_offsets() {
        let merger = merge_streams(vec![
            boxed(VecSource::sequential(100)),
            boxed(VecSource::sequential(0)),
            boxed(VecSource::sequential(50)),
        ]);
        let records = drain(merger).unwrap();

        assert_eq!(records.len(), 150);
        assert_strictly_increasing_ids(&records);
        assert!(records[100..].iter().all(|r| (100..150).contains(&r.id)));
    }

    #[test]
    fn test_single_source_is_identity() {
        let source = VecSource::sequential(20);
        let expected = source.records().to_vec();
        let records = drain(merge_streams(vec![boxed(source)])).unwrap();
        assert_eq!(records, expected);
    }

    #[test]
    fn test_sparse_ids_stay_unique() {
        let sparse = VecSource::new(vec![Record::new(0, vec![]), Record::new(9, vec![])]);
        let dense = VecSource::sequential(3);
        let records = drain(merge_streams(vec![boxed(sparse), boxed(dense)])).unwrap();

        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 9, 10, 11, 12]);
    }

    #[test]
    fn test_negative_ids_pass_through_a_single_source() {
        let source = VecSource::new(vec![Record::new(-3, vec![1]), Record::new(-2, vec![2])]);
        let expected = source.records().to_vec();
        let records = drain(merge_streams(vec![boxed(source)])).unwrap();
        assert_eq!(records, expected);
    }

    #[test]
    fn test_negative_ids_in_later_sources_follow_earlier_ones() {
        let first = VecSource::new(vec![Record::new(-3, vec![]), Record::new(-2, vec![])]);
        let second = VecSource::new(vec![Record::new(-10, vec![]), Record::new(-4, vec![])]);
        let third = VecSource::sequential(2);
        let records =
            drain(merge_streams(vec![boxed(first), boxed(second), boxed(third)])).unwrap();

        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![-3, -2, -1, 5, 11, 12]);
    }

    #[test]
    fn test_mid_stream_failure_is_a_hard_error() {
        let sources: Vec<Box<dyn RecordSource>> = vec![
            boxed(VecSource::sequential(5)),
            Box::new(FailingSource::after(3, "device went away")),
        ];
        let merger = merge_streams(sources);
        let progress = merger.progress_handle();

        let err = drain(merger).unwrap_err();
        assert!(matches!(
            err,
            ProvflowError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_non_increasing_ids_are_rejected() {
        let bad = VecSource::new(vec![Record::new(3, vec![]), Record::new(3, vec![])]);
        let err = drain(merge_streams(vec![boxed(bad)])).unwrap_err();
        assert!(matches!(err, ProvflowError::InvalidRecord(_)));
    }

    #[test]
    fn test_sequential_rewrite() {
        let a = VecSource::new(vec![Record::new(5, vec![]), Record::new(8, vec![])]);
        let b = VecSource::new(vec![Record::new(2, vec![])]);
        let merger = merge_streams(vec![boxed(a), boxed(b)]).with_rewrite(IdRewrite::Sequential);
        let ids: Vec<_> = drain(merger).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_progress_is_monotonic_and_completes() {
        let mut merger = merge_streams(vec![
            boxed(VecSource::sequential(10)),
            boxed(VecSource::sequential(10)),
        ]);
        let handle = merger.progress_handle();
        let mut last = 0.0;
        while merger.next_record().unwrap().is_some() {
            let now = handle.fraction();
            assert!(now >= last);
            last = now;
        }
        assert!(handle.is_complete());
    }

    #[test]
    fn test_open_failure_names_the_source() {
        let mut first = MockOpener::new();
        first
            .expect_open()
            .times(1)
            .returning(|| Ok(Box::new(VecSource::sequential(2)) as Box<dyn RecordSource>));
        first.expect_describe().return_const("first.pvs".to_string());

        let mut second = MockOpener::new();
        second
            .expect_open()
            .times(1)
            .returning(|| Err(io::Error::new(io::ErrorKind::NotFound, "gone")));
        second.expect_describe().return_const("second.pvs".to_string());

        let mut merger = ReconciledStreamMerger::new(vec![Box::new(first), Box::new(second)]);
        assert!(merger.next_record().unwrap().is_some());
        assert!(merger.next_record().unwrap().is_some());

        let err = merger.next_record().unwrap_err();
        let ProvflowError::SourceOpen(open) = err else {
            panic!("expected a source open error, got {err:?}");
        };
        assert_eq!(open.index, 1);
        assert_eq!(open.description, "second.pvs");
        assert_eq!(open.source.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_key_ordered_interleaves_with_stable_ties() {
        let a = VecSource::new(vec![
            Record::new(0, b"a0".to_vec()),
            Record::new(2, b"a2".to_vec()),
        ]);
        let b = VecSource::new(vec![
            Record::new(1, b"b1".to_vec()),
            Record::new(2, b"b2".to_vec()),
        ]);
        let merger = merge_streams(vec![boxed(a), boxed(b)]).with_mode(MergeMode::KeyOrdered);
        let records = drain(merger).unwrap();

        let payloads: Vec<_> = records.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![b"a0".to_vec(), b"b1".to_vec(), b"a2".to_vec(), b"b2".to_vec()]
        );
        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_key_ordered_rejects_unordered_source() {
        let a = VecSource::new(vec![Record::new(0, vec![]), Record::new(1, vec![])]);
        let merger = merge_streams(vec![boxed(a)])
            .with_mode(MergeMode::KeyOrdered)
            .with_key(|r| -r.id);
        assert!(matches!(drain(merger), Err(ProvflowError::InvalidRecord(_))));
    }

    #[test]
    fn test_write_to_sink() {
        let mut sink = VecSink::new();
        let count = merge_streams(vec![boxed(VecSource::sequential(4))])
            .write_to(&mut sink)
            .unwrap();
        assert_eq!(count, 4);
        assert!(sink.is_closed());
        assert_eq!(sink.records().len(), 4);
    }

    #[test]
    fn test_close_closes_current_source() {
        let source = VecSource::sequential(5);
        let closed = source.closed_flag();
        let mut merger = merge_streams(vec![boxed(source)]);
        merger.next_record().unwrap();
        merger.close();
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(merger.next_record().unwrap().is_none());
    }

    #[test]
    fn test_merge_configuration_tracks_mode() {
        let merger = merge_streams(vec![]).with_mode(MergeMode::KeyOrdered);
        assert!(matches!(
            merger.action_configuration(vec![]),
            ActionConfiguration::Merge { key_ordered: true, .. }
        ));
    }

    #[test]
    fn test_no_sources() {
        let mut merger = merge_streams(vec![]);
        assert!(merger.next_record().unwrap().is_none());
        assert!(merger.progress_handle().is_complete());
    }
}

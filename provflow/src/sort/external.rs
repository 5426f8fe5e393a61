//! Out-of-core sorting of record streams.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use super::spill::{RunReader, SpillArena};
use crate::cancellation::CancellationToken;
use crate::config::SortConfig;
use crate::errors::Result;
use crate::observability::SpanTimer;
use crate::records::{Record, RecordSource};

/// Sort order: parent first, then the caller's key, then the record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    /// Parent of the record; parentless records sort first.
    pub parent_id: Option<i32>,
    /// Caller-supplied key.
    pub key: i64,
    /// Record identifier.
    pub id: i64,
}

impl SortKey {
    /// Builds the key of `record` under caller key `key`.
    #[must_use]
    pub fn new(record: &Record, key: i64) -> Self {
        Self {
            parent_id: record.parent_id,
            key,
            id: record.id,
        }
    }
}

type KeyFn = Box<dyn Fn(&Record) -> i64 + Send + Sync>;

/// Sorts record streams that may not fit in memory.
///
/// Records are buffered in chunks, each chunk is sorted and spilled as a
/// run into a private [`SpillArena`], and the runs are merged back lazily.
/// Input that fits in a single chunk never touches the disk. The sort is
/// stable.
pub struct ExternalSorter {
    config: SortConfig,
    key: KeyFn,
    token: Option<CancellationToken>,
}

impl fmt::Debug for ExternalSorter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSorter")
            .field("config", &self.config)
            .field("cancellable", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl ExternalSorter {
    /// Creates a sorter ordering by parent, then id.
    #[must_use]
    pub fn new(config: SortConfig) -> Self {
        Self {
            config,
            key: Box::new(|_| 0),
            token: None,
        }
    }

    /// Orders records within a parent by `key` before falling back to id.
    #[must_use]
    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Record) -> i64 + Send + Sync + 'static,
    {
        self.key = Box::new(key);
        self
    }

    /// Stops the sort, and the stream it returns, once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Drains `source` and returns its records in [`SortKey`] order.
    ///
    /// `expected_total` sizes the chunks when known. A cancelled sort
    /// returns an empty stream and releases its spill storage.
    pub fn sort<S>(&self, source: &mut S, expected_total: Option<u64>) -> Result<SortedRecords>
    where
        S: RecordSource + ?Sized,
    {
        let timer = SpanTimer::start("external_sort");
        let chunk_size = expected_total
            .map_or(self.config.chunk_size, |total| self.config.chunk_size_for(total))
            .max(1);

        let mut arena: Option<SpillArena> = None;
        let mut chunk: Vec<(SortKey, Record)> = Vec::with_capacity(chunk_size.min(65_536));
        let mut total = 0u64;

        while let Some(record) = source.next_record()? {
            if self.is_cancelled() {
                source.close();
                debug!(records = total, "Sort cancelled");
                return Ok(SortedRecords::empty(self.token.clone()));
            }
            chunk.push((SortKey::new(&record, (self.key)(&record)), record));
            total += 1;

            if chunk.len() >= chunk_size {
                if arena.is_none() {
                    arena = Some(SpillArena::create(self.config.temp_dir.as_deref())?);
                }
                if let Some(arena) = arena.as_mut() {
                    sort_chunk(&mut chunk);
                    arena.spill(&chunk)?;
                }
                chunk.clear();
            }
        }
        source.close();
        if self.is_cancelled() {
            debug!(records = total, "Sort cancelled");
            return Ok(SortedRecords::empty(self.token.clone()));
        }

        sort_chunk(&mut chunk);
        let inner = match arena {
            None => {
                let records: Vec<Record> = chunk.into_iter().map(|(_, record)| record).collect();
                Inner::Memory(records.into_iter())
            }
            Some(mut arena) => {
                if !chunk.is_empty() {
                    arena.spill(&chunk)?;
                }
                Inner::Runs(Runs::open(arena)?)
            }
        };

        let elapsed_ms = timer.finish();
        info!(
            records = total,
            chunk_size,
            spilled = matches!(inner, Inner::Runs(_)),
            elapsed_ms,
            "Sort prepared"
        );

        Ok(SortedRecords {
            inner,
            total,
            yielded: 0,
            token: self.token.clone(),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

fn sort_chunk(chunk: &mut [(SortKey, Record)]) {
    chunk.sort_by_key(|(key, _)| *key);
}

/// The output of a sort. Owns its spill arena: dropping or closing the
/// stream removes every spilled run.
#[derive(Debug)]
pub struct SortedRecords {
    inner: Inner,
    total: u64,
    yielded: u64,
    token: Option<CancellationToken>,
}

#[derive(Debug)]
enum Inner {
    Memory(std::vec::IntoIter<Record>),
    Runs(Runs),
    Closed,
}

#[derive(Debug)]
struct Runs {
    readers: Vec<RunReader>,
    heads: Vec<Option<Record>>,
    heap: BinaryHeap<Reverse<(SortKey, usize)>>,
    arena: SpillArena,
}

impl Runs {
    fn open(arena: SpillArena) -> Result<Self> {
        let readers = arena.open_runs()?;
        let mut runs = Self {
            heads: vec![None; readers.len()],
            readers,
            heap: BinaryHeap::new(),
            arena,
        };
        for index in 0..runs.readers.len() {
            runs.refill(index)?;
        }
        debug!(arena = %runs.arena.tag(), runs = runs.readers.len(), "Merging sorted runs");
        Ok(runs)
    }

    fn refill(&mut self, index: usize) -> Result<()> {
        if let Some((key, record)) = self.readers[index].next_entry()? {
            self.heads[index] = Some(record);
            self.heap.push(Reverse((key, index)));
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<Record>> {
        let Some(Reverse((_, index))) = self.heap.pop() else {
            return Ok(None);
        };
        let record = self.heads[index].take();
        self.refill(index)?;
        Ok(record)
    }
}

impl SortedRecords {
    fn empty(token: Option<CancellationToken>) -> Self {
        Self {
            inner: Inner::Closed,
            total: 0,
            yielded: 0,
            token,
        }
    }

    /// Number of records sorted.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Whether any run was spilled to disk.
    #[must_use]
    pub fn spilled(&self) -> bool {
        matches!(self.inner, Inner::Runs(_))
    }

    /// Location of the spill arena while it exists.
    #[must_use]
    pub fn arena_path(&self) -> Option<&Path> {
        match &self.inner {
            Inner::Runs(runs) => Some(runs.arena.path()),
            _ => None,
        }
    }
}

impl RecordSource for SortedRecords {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            self.close();
            return Ok(None);
        }
        let next = match &mut self.inner {
            Inner::Memory(records) => records.next(),
            Inner::Runs(runs) => match runs.pop() {
                Ok(next) => next,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            },
            Inner::Closed => None,
        };
        match next {
            Some(record) => {
                self.yielded += 1;
                Ok(Some(record))
            }
            None => {
                self.close();
                Ok(None)
            }
        }
    }

    fn progress(&self) -> f64 {
        if self.total == 0 || matches!(self.inner, Inner::Closed) {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.yielded as f64 / self.total as f64;
        fraction
    }

    fn close(&mut self) {
        self.inner = Inner::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain, VecSource};
    use pretty_assertions::assert_eq;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn small_chunks() -> SortConfig {
        SortConfig::default().with_chunk_size(4).with_max_chunk_size(4)
    }

    fn shuffled(n: i64) -> Vec<Record> {
        let mut records: Vec<_> = (0..n)
            .map(|i| Record::new(i, i.to_le_bytes().to_vec()).with_parent(i32::try_from(i % 3).unwrap()))
            .collect();
        records.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        records
    }

    fn expected_order(records: &[Record]) -> Vec<(Option<i32>, i64)> {
        let mut keys: Vec<_> = records.iter().map(|r| (r.parent_id, r.id)).collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_in_memory_sort() {
        let input = shuffled(10);
        let sorted = ExternalSorter::new(SortConfig::default())
            .sort(&mut VecSource::new(input.clone()), None)
            .unwrap();
        assert!(!sorted.spilled());
        assert_eq!(sorted.total(), 10);

        let keys: Vec<_> = drain(sorted).unwrap().iter().map(|r| (r.parent_id, r.id)).collect();
        assert_eq!(keys, expected_order(&input));
    }

    #[test]
    fn test_spilled_sort_matches_in_memory() {
        let input = shuffled(37);
        let mut sorted = ExternalSorter::new(small_chunks())
            .sort(&mut VecSource::new(input.clone()), Some(37))
            .unwrap();
        assert!(sorted.spilled());
        let arena = sorted.arena_path().unwrap().to_path_buf();
        assert!(arena.exists());

        let mut keys = Vec::new();
        while let Some(record) = sorted.next_record().unwrap() {
            keys.push((record.parent_id, record.id));
        }
        assert_eq!(keys, expected_order(&input));
        assert!(!arena.exists());
    }

    #[test]
    fn test_caller_key_orders_within_parent() {
        let input = vec![
            Record::new(0, vec![]).with_parent(0),
            Record::new(1, vec![]).with_parent(0),
            Record::new(2, vec![]).with_parent(0),
        ];
        let sorted = ExternalSorter::new(small_chunks())
            .with_key(|r| -r.id)
            .sort(&mut VecSource::new(input), None)
            .unwrap();
        let ids: Vec<_> = drain(sorted).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1, 0]);
    }

    #[test]
    fn test_drop_releases_spill() {
        let sorted = ExternalSorter::new(small_chunks())
            .sort(&mut VecSource::new(shuffled(20)), None)
            .unwrap();
        let arena = sorted.arena_path().unwrap().to_path_buf();
        drop(sorted);
        assert!(!arena.exists());
    }

    #[test]
    fn test_cancellation_releases_spill_and_ends_stream() {
        let token = CancellationToken::new();
        let mut sorted = ExternalSorter::new(small_chunks())
            .with_cancellation(token.clone())
            .sort(&mut VecSource::new(shuffled(20)), None)
            .unwrap();
        let arena = sorted.arena_path().unwrap().to_path_buf();

        assert!(sorted.next_record().unwrap().is_some());
        token.cancel("stop");
        assert!(sorted.next_record().unwrap().is_none());
        assert!(!arena.exists());
    }

    #[test]
    fn test_cancelled_before_sort() {
        let token = CancellationToken::new();
        token.cancel("early");
        let source = VecSource::sequential(10);
        let closed = source.closed_flag();
        let mut source = source;
        let sorted = ExternalSorter::new(small_chunks())
            .with_cancellation(token)
            .sort(&mut source, None)
            .unwrap();
        assert_eq!(sorted.total(), 0);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_empty_input() {
        let mut sorted = ExternalSorter::new(small_chunks())
            .sort(&mut VecSource::new(vec![]), None)
            .unwrap();
        assert!(sorted.next_record().unwrap().is_none());
        assert!((sorted.progress() - 1.0).abs() < f64::EPSILON);
    }
}

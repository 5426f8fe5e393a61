//! Parallel per-record transforms that keep input order.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::resequence::Resequencer;
use crate::config::TransformConfig;
use crate::errors::{ProvflowError, Result};
use crate::observability::SpanTimer;
use crate::records::{Record, RecordSink, RecordSource};

/// Applies `transform` to every record of `source` on the blocking pool and
/// writes the results to `sink` in input order, then closes both.
///
/// At most `config.max_in_flight` records are running or waiting for a
/// predecessor at any time. The first failing record aborts the run.
/// Returns the number of records written.
pub async fn transform_ordered<S, K, F>(
    source: &mut S,
    sink: &mut K,
    transform: F,
    config: &TransformConfig,
) -> Result<u64>
where
    S: RecordSource + ?Sized,
    K: RecordSink + ?Sized,
    F: Fn(Record) -> Result<Record> + Send + Sync + 'static,
{
    let run = Uuid::new_v4();
    let timer = SpanTimer::start("transform_ordered");
    let limit = config.max_in_flight.max(1) as u64;
    let transform = Arc::new(transform);

    let mut tasks: JoinSet<(u64, Result<Record>)> = JoinSet::new();
    let mut order = Resequencer::new();
    let mut dispatched = 0u64;
    let mut exhausted = false;

    debug!(run = %run, max_in_flight = limit, "Transform started");
    loop {
        while !exhausted && dispatched - order.released() < limit {
            match source.next_record()? {
                Some(record) => {
                    let position = dispatched;
                    let transform = Arc::clone(&transform);
                    tasks.spawn_blocking(move || (position, transform(record)));
                    dispatched += 1;
                }
                None => exhausted = true,
            }
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let (position, result) = joined.map_err(|e| {
            ProvflowError::invalid_state(format!("transform task failed: {e}"))
        })?;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(run = %run, position, error = %e, "Transform failed");
                tasks.abort_all();
                source.close();
                return Err(e);
            }
        };

        order.push(position, record)?;
        while let Some(record) = order.pop_ready() {
            sink.write(record)?;
        }
    }

    if order.pending() > 0 {
        return Err(ProvflowError::invalid_state(format!(
            "{} transformed records never became ready",
            order.pending()
        )));
    }
    source.close();
    sink.close()?;

    let elapsed_ms = timer.finish();
    info!(run = %run, records = order.released(), elapsed_ms, "Transform finished");
    Ok(order.released())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{VecSink, VecSource};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_order_survives_uneven_work() {
        let mut source = VecSource::sequential(64);
        let mut sink = VecSink::new();
        let config = TransformConfig::default().with_max_in_flight(8);

        let written = transform_ordered(
            &mut source,
            &mut sink,
            |mut record| {
                let delay = u64::try_from((record.id * 7) % 5).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(delay));
                record.payload.push(0xAB);
                Ok(record)
            },
            &config,
        )
        .await
        .unwrap();

        assert_eq!(written, 64);
        let ids: Vec<_> = sink.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, (0..64).collect::<Vec<_>>());
        assert!(sink.records().iter().all(|r| r.payload.last() == Some(&0xAB)));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_failure_aborts_and_leaves_sink_open() {
        let mut source = VecSource::sequential(20);
        let mut sink = VecSink::new();
        let err = transform_ordered(
            &mut source,
            &mut sink,
            |record| {
                if record.id == 5 {
                    Err(ProvflowError::invalid_record("bad record 5"))
                } else {
                    Ok(record)
                }
            },
            &TransformConfig::default().with_max_in_flight(2),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProvflowError::InvalidRecord(_)));
        assert!(!sink.is_closed());
        assert!(sink.records().len() <= 5);
        assert!(source.is_closed());
    }

    #[test]
    fn test_empty_source() {
        let mut source = VecSource::new(vec![]);
        let mut sink = VecSink::new();
        let written = tokio_test::block_on(transform_ordered(
            &mut source,
            &mut sink,
            Ok,
            &TransformConfig::default(),
        ))
        .unwrap();
        assert_eq!(written, 0);
        assert!(sink.is_closed());
    }
}

//! Ready-made chains, streams and containers.

use serde_json::json;
use std::path::Path;

use crate::container::{ContainerReader, ContainerWriter};
use crate::errors::Result;
use crate::fingerprint::ConfigurationFingerprint;
use crate::provenance::{PipelineChain, PipelineStep, TOOL_VERSION};
use crate::records::{Record, RecordSink, RecordSource, RecordStreamWriter};
use crate::testing::VecSource;

/// A one-step chain, as if produced by an initial `assemble` action.
#[must_use]
pub fn fixture_chain() -> PipelineChain {
    let configuration =
        ConfigurationFingerprint::from_value("assemble", &json!({"min_quality": 20, "species": "hs"}));
    PipelineChain::initial(PipelineStep::new("assemble", TOOL_VERSION, configuration, vec![]))
}

/// Parents `0..counts.len()` and, for each, `counts[p]` children in parent
/// order with globally sequential ids.
#[must_use]
pub fn fixture_records(counts: &[usize]) -> (Vec<Record>, Vec<Record>) {
    let mut parents = Vec::with_capacity(counts.len());
    let mut children = Vec::new();
    let mut next_child = 0i64;
    for (parent, &count) in (0i32..).zip(counts) {
        parents.push(Record::new(i64::from(parent), format!("parent-{parent}").into_bytes()));
        for j in 0..count {
            children.push(
                Record::new(next_child, format!("child-{parent}-{j}").into_bytes()).with_parent(parent),
            );
            next_child += 1;
        }
    }
    (parents, children)
}

/// Writes a container whose parent `p` has `counts[p]` children.
pub fn write_fixture_container(path: impl AsRef<Path>, counts: &[usize]) -> Result<ContainerReader> {
    let path = path.as_ref();
    let (parents, children) = fixture_records(counts);
    let total = children.len() as u64;

    let mut writer = ContainerWriter::create(path, &fixture_chain())?;
    writer.write_parents(parents)?;
    writer.sort_children(&mut VecSource::new(children), Some(total))?;
    writer.finish()?;
    ContainerReader::open(path)
}

/// Writes `records` as a record stream carrying `chain`.
pub fn write_fixture_stream(
    path: impl AsRef<Path>,
    records: &[Record],
    chain: &PipelineChain,
) -> Result<u64> {
    let mut writer = RecordStreamWriter::create(path.as_ref(), chain)?;
    for record in records {
        writer.write(record.clone())?;
    }
    writer.finish()
}

/// Pulls every record out of `source` and closes it.
pub fn drain<S: RecordSource>(mut source: S) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    while let Some(record) = source.next_record()? {
        records.push(record);
    }
    source.close();
    Ok(records)
}

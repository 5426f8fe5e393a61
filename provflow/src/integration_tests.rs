//! End-to-end tests across gate, merge, sort and container slicing.

use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;

use crate::config::{SortConfig, TransformConfig};
use crate::container::{ContainerReader, ContainerSlicer, ContainerWriter};
use crate::errors::ProvflowError;
use crate::events::CollectingAdvisorySink;
use crate::fingerprint::ActionConfiguration;
use crate::merge::{IdRewrite, ReconciledStreamMerger};
use crate::provenance::{
    GateMode, GateState, GuardedStep, Outcome, PipelineChain, PipelineStep, ProvenanceGate,
    StepReport,
};
use crate::records::{
    encode_record, Record, RecordSink, RecordSource, RecordStreamReader, RecordStreamWriter,
    SourceOpener, StreamFileOpener,
};
use crate::sort::ExternalSorter;
use crate::testing::{
    assert_all_children_of, assert_parent_ids_in_range, assert_strictly_increasing_ids, drain,
    fixture_chain, fixture_records, write_fixture_container, write_fixture_stream, FailingSource,
    VecSink, VecSource,
};
use crate::transform::transform_ordered;

fn stream_of(path: &Path, n: i64) {
    let records = VecSource::sequential(n).records().to_vec();
    write_fixture_stream(path, &records, &fixture_chain()).unwrap();
}

fn openers(paths: &[&Path]) -> Vec<Box<dyn SourceOpener>> {
    paths
        .iter()
        .map(|p| Box::new(StreamFileOpener::new(*p)) as Box<dyn SourceOpener>)
        .collect()
}

fn sort_step(input: &Path, key: &str) -> PipelineChain {
    let step = PipelineStep::capture(&ActionConfiguration::sort(key), &[input]).unwrap();
    PipelineChain::initial(step)
}

#[test]
fn test_slice_keeps_requested_parents_in_request_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_fixture_container(dir.path().join("in.pvc"), &[10, 0, 5]).unwrap();
    let out = dir.path().join("out.pvc");

    let report = ContainerSlicer::default()
        .run_guarded(&input, &[2, 0], &out, GateMode::Default, None)
        .unwrap();
    assert!(report.ran());

    let sliced = ContainerReader::open(&out).unwrap();
    assert_eq!(sliced.parent_count(), 2);
    assert_eq!(sliced.parents()[0].id, 0);
    assert_eq!(sliced.parents()[0].payload, b"parent-2".to_vec());
    assert_eq!(sliced.parents()[1].payload, b"parent-0".to_vec());

    let first = drain(sliced.children_of(0).unwrap()).unwrap();
    let second = drain(sliced.children_of(1).unwrap()).unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 10);
    assert_all_children_of(&first, 0);
    assert_all_children_of(&second, 1);
    assert_eq!(first[0].payload, b"child-2-0".to_vec());

    let all = drain(sliced.all_children().unwrap()).unwrap();
    assert_eq!(all.len(), 15);
    assert_strictly_increasing_ids(&all);
    assert_parent_ids_in_range(&all, 2);

    let chain = sliced.chain();
    assert_eq!(chain.len(), 2);
    assert_eq!(&chain.steps()[..1], input.chain().steps());
}

#[test]
fn test_gate_blocks_on_configuration_change() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pvs");
    let output = dir.path().join("out.pvs");
    stream_of(&input, 3);

    let with_x = sort_step(&input, "score");
    GuardedStep::new(&output, with_x)
        .run(|writer| {
            encode_record(writer, &Record::new(0, b"x".to_vec()))?;
            Ok(())
        })
        .unwrap();

    let with_y = sort_step(&input, "length");
    let gate = ProvenanceGate::for_output(&output);

    let blocked = gate.evaluate(&with_y, GateMode::Default);
    assert_eq!(blocked.state, GateState::Incompatible);
    match blocked.outcome {
        Outcome::Fail(failure) => {
            assert_eq!(failure.step_index, Some(0));
            assert_eq!(failure.expected_action.as_deref(), Some("sort"));
            assert_ne!(failure.expected_configuration, failure.existing_configuration);
        }
        other => panic!("expected a failure, got {other:?}"),
    }

    let forced = gate.evaluate(&with_y, GateMode::ForceOverwrite);
    assert_eq!(forced.outcome, Outcome::ProceedOverwrite);

    let err = GuardedStep::new(&output, sort_step(&input, "length"))
        .run(|_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, ProvflowError::IncompatibleProvenance(_)));
}

#[test]
fn test_merge_of_stream_files_is_dense() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = ["a.pvs", "b.pvs", "c.pvs"].iter().map(|n| dir.path().join(n)).collect();
    for (path, n) in paths.iter().zip([100, 0, 50]) {
        stream_of(path, n);
    }

    let refs: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
    let merger = ReconciledStreamMerger::new(openers(&refs));
    let progress = merger.progress_handle();
    let merged = drain(merger).unwrap();

    assert_eq!(merged.len(), 150);
    assert_strictly_increasing_ids(&merged);
    assert_eq!(merged.first().map(|r| r.id), Some(0));
    assert_eq!(merged.last().map(|r| r.id), Some(149));
    assert_eq!(merged[100].payload, 0i64.to_le_bytes().to_vec());
    assert!(progress.is_complete());
}

#[test]
fn test_merge_output_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.pvs");
    let b = dir.path().join("b.pvs");
    stream_of(&a, 40);
    stream_of(&b, 25);

    let step = PipelineStep::capture(&ActionConfiguration::merge(vec![fixture_chain()]), &[&a, &b])
        .unwrap();
    let chain = PipelineChain::initial(step);

    let mut outputs = Vec::new();
    for name in ["m1.pvs", "m2.pvs"] {
        let path = dir.path().join(name);
        let mut writer = RecordStreamWriter::create(&path, &chain).unwrap();
        let written = ReconciledStreamMerger::new(openers(&[a.as_path(), b.as_path()]))
            .write_to(&mut writer)
            .unwrap();
        assert_eq!(written, 65);
        writer.finish().unwrap();
        outputs.push(std::fs::read(&path).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn test_failing_merge_input_leaves_no_container() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.pvc");
    let (parents, children) = fixture_records(&[4, 2]);

    let sources: Vec<Box<dyn RecordSource>> = vec![
        Box::new(VecSource::new(children)),
        Box::new(FailingSource::after(0, "input truncated")),
    ];
    let mut merged = ReconciledStreamMerger::from_sources(sources).with_rewrite(IdRewrite::Sequential);

    let mut writer = ContainerWriter::create(&out, &fixture_chain()).unwrap();
    writer.write_parents(parents).unwrap();
    let err = writer.sort_children(&mut merged, Some(6)).unwrap_err();
    drop(writer);

    assert!(matches!(err, ProvflowError::Io(_)));
    assert!(!out.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_single_source_merge_is_identity() {
    let source = VecSource::sequential(17);
    let expected = source.records().to_vec();
    let sources: Vec<Box<dyn RecordSource>> = vec![Box::new(source)];
    let merged = drain(ReconciledStreamMerger::from_sources(sources)).unwrap();
    assert_eq!(merged, expected);
}

#[test]
fn test_chain_survives_a_round_trip_through_a_stream() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pvs");
    let output = dir.path().join("out.pvs");
    stream_of(&input, 2);

    let step = PipelineStep::capture(&ActionConfiguration::sort("score"), &[&input]).unwrap();
    let chain = fixture_chain().append(step).unwrap();
    write_fixture_stream(&output, &[Record::new(0, vec![1])], &chain).unwrap();

    assert_eq!(PipelineChain::read_from(&output).unwrap(), Some(chain.clone()));
    let reader = RecordStreamReader::open(&output).unwrap();
    assert_eq!(reader.chain(), &chain);
    assert_eq!(reader.record_count(), 1);
}

#[test]
fn test_guarded_two_step_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raw.pvs");
    let sorted = dir.path().join("sorted.pvs");
    write_fixture_stream(
        &raw,
        &[
            Record::new(0, b"ccc".to_vec()),
            Record::new(1, b"a".to_vec()),
            Record::new(2, b"bb".to_vec()),
        ],
        &fixture_chain(),
    )
    .unwrap();

    let sink = Arc::new(CollectingAdvisorySink::new());
    let run_sort = |mode: GateMode| -> crate::errors::Result<StepReport> {
        let raw_chain = PipelineChain::read_from(&raw)?.unwrap_or_default();
        let step = PipelineStep::capture(&ActionConfiguration::sort("payload_len"), &[&raw])?;
        GuardedStep::new(&sorted, raw_chain.append(step)?)
            .with_mode(mode)
            .with_sink(sink.clone())
            .run_with(|path, chain| {
                let mut input = RecordStreamReader::open(&raw)?;
                let total = input.record_count();
                let sorter = ExternalSorter::new(SortConfig::default())
                    .with_key(|r| i64::try_from(r.payload.len()).unwrap_or(i64::MAX));
                let mut ordered = sorter.sort(&mut input, Some(total))?;
                let mut writer = RecordStreamWriter::create(path, chain)?;
                while let Some(record) = ordered.next_record()? {
                    writer.write(record)?;
                }
                writer.finish().map(Some)
            })
    };

    assert!(run_sort(GateMode::ReuseIfValid).unwrap().ran());
    let payloads: Vec<_> = RecordStreamReader::open(&sorted)
        .unwrap()
        .read_all()
        .unwrap()
        .into_iter()
        .map(|r| r.payload)
        .collect();
    assert_eq!(payloads, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);

    assert!(!run_sort(GateMode::ReuseIfValid).unwrap().ran());
    assert!(matches!(
        run_sort(GateMode::Default),
        Err(ProvflowError::IncompatibleProvenance(_))
    ));

    write_fixture_stream(&raw, &[Record::new(0, b"zzzz".to_vec())], &fixture_chain()).unwrap();
    let rerun = run_sort(GateMode::OverwriteIfRequired).unwrap();
    assert!(matches!(rerun, StepReport::Written { overwritten: true, .. }));
    assert!(!sink.advisories().is_empty());
    assert_eq!(RecordStreamReader::open(&sorted).unwrap().record_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transform_feeds_a_stream_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pvs");
    stream_of(&input, 64);

    let mut source = RecordStreamReader::open(&input).unwrap();
    let mut sink = VecSink::new();
    let written = transform_ordered(
        &mut source,
        &mut sink,
        |mut record: Record| {
            record.payload.reverse();
            Ok(record)
        },
        &TransformConfig::default().with_max_in_flight(8),
    )
    .await
    .unwrap();

    assert_eq!(written, 64);
    assert!(sink.is_closed());
    assert_strictly_increasing_ids(sink.records());
    let mut expected = 5i64.to_le_bytes().to_vec();
    expected.reverse();
    assert_eq!(sink.records()[5].payload, expected);
}

//! # Provflow
//!
//! Provenance tracking and record reconciliation for multi-stage data
//! pipelines.
//!
//! Provflow provides:
//!
//! - **Provenance chains**: every artifact carries the ordered history of the
//!   steps (action, configuration, input fingerprints, tool version) that
//!   produced it
//! - **Provenance gate**: decides whether an existing output may be reused,
//!   must be overwritten, or blocks the run with a diagnostic
//! - **Reconciled merges**: concatenates ordered record streams while
//!   rewriting identifiers into one strictly increasing space
//! - **Container slicing**: restricts a parent/child container to a subset of
//!   parents, renumbering and re-indexing everything through an out-of-core
//!   sort
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use provflow::prelude::*;
//!
//! let step = PipelineStep::capture(&ActionConfiguration::sort("score"), &["input.pvs"])?;
//! let expected = PipelineChain::initial(step);
//!
//! let report = GuardedStep::new("output.pvs", expected)
//!     .with_mode(GateMode::ReuseIfValid)
//!     .run(|writer| {
//!         // domain logic writes the body
//!         Ok(())
//!     })?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod container;
pub mod errors;
pub mod events;
pub mod fingerprint;
pub mod merge;
pub mod observability;
pub mod provenance;
pub mod records;
pub mod sort;
pub mod testing;
pub mod transform;

#[cfg(test)]
mod integration_tests;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{LoggingConfig, ProvflowConfig, SortConfig, TransformConfig};
    pub use crate::container::{
        slice_container, ContainerReader, ContainerSlicer, ContainerWriter, SliceReport,
    };
    pub use crate::errors::{
        CorruptArtifactError, EmptyChainError, IncompatibleProvenanceError, InvalidChainError,
        ProvflowError, Result, SourceOpenError, UnknownParentError,
    };
    pub use crate::events::{Advisory, AdvisorySink, LoggingAdvisorySink, NoOpAdvisorySink};
    pub use crate::fingerprint::{ActionConfiguration, ConfigurationFingerprint, InputFingerprint};
    pub use crate::merge::{merge_streams, IdRewrite, MergeMode, ReconciledStreamMerger};
    pub use crate::observability::{init_logging, ProgressHandle, SpanTimer};
    pub use crate::provenance::{
        ArtifactWriter, ExistingOutput, GateMode, GateState, GuardedStep, Outcome,
        PipelineChain, PipelineStep, ProvenanceGate, StepReport, TOOL_VERSION,
    };
    pub use crate::records::{Record, RecordSink, RecordSource, SourceOpener};
    pub use crate::sort::{ExternalSorter, SortKey, SortedRecords};
    pub use crate::transform::{transform_ordered, Resequencer};
}

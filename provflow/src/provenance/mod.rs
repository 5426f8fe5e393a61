//! Provenance-guarded incremental execution.
//!
//! Every artifact carries the [`PipelineChain`] that produced it. Before a
//! step runs, the [`ProvenanceGate`] compares the chain this invocation would
//! write with the one recorded in the existing output and returns an
//! explicit [`Outcome`]. [`GuardedStep`] wires the two together.

mod chain;
mod gate;
mod header;
mod runner;
mod step;

pub use chain::{Divergence, PipelineChain, VersionDrift};
pub use gate::{
    Decision, ExistingOutput, GateFailure, GateMode, GateState, Outcome, ProvenanceGate,
};
pub use header::{read_chain_header, write_chain_header, CHAIN_FORMAT_VERSION, CHAIN_MAGIC};
pub use runner::{ArtifactWriter, GuardedStep, StepReport};
pub use step::{PipelineStep, TOOL_VERSION};

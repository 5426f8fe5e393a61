//! Testing utilities for provflow.
//!
//! This module provides:
//! - In-memory and failing record sources and sinks
//! - Chain, stream and container fixtures
//! - Assertions over record sequences

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_all_children_of, assert_parent_ids_in_range, assert_strictly_increasing_ids,
};
pub use fixtures::{
    drain, fixture_chain, fixture_records, write_fixture_container, write_fixture_stream,
};
pub use mocks::{FailingSource, VecSink, VecSource};

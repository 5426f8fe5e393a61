//! Order-preserving parallel transforms.
//!
//! CPU-bound per-record work runs on tokio's blocking pool; results are
//! tagged with their input position and re-sequenced before emission.

mod ordered;
mod resequence;

pub use ordered::transform_ordered;
pub use resequence::Resequencer;

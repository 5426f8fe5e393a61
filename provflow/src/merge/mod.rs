//! Reconciled stream merging.
//!
//! Identifiers are only unique within one source; the merger rewrites them
//! into a single strictly increasing space while preserving source order.

mod reconciled;

pub use reconciled::{merge_streams, IdRewrite, MergeKey, MergeMode, ReconciledStreamMerger};

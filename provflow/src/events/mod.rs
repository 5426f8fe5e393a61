//! Advisory emission.
//!
//! The provenance gate reports non-fatal findings (version drift, forced
//! overwrites) through an [`AdvisorySink`] injected by the caller.

mod sink;

pub use sink::{
    Advisory, AdvisoryLevel, AdvisorySink, CollectingAdvisorySink, LoggingAdvisorySink,
    NoOpAdvisorySink,
};

//! Observability utilities.

mod logging;
mod progress;

pub use logging::init_logging;
pub use progress::{ProgressHandle, SpanTimer};

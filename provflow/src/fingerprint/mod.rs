//! Fingerprints: comparable stand-ins for "would this produce the same bytes".
//!
//! - [`ConfigurationFingerprint`] captures everything about a step's
//!   configuration that affects its output
//! - [`ActionConfiguration`] is the closed set of action kinds known at the
//!   boundary; the core only ever sees their fingerprints
//! - [`InputFingerprint`] identifies an input file by cheap metadata

mod canonical;
mod configuration;
mod input;

pub use canonical::{canonical_json, sha256_hex};
pub use configuration::{ActionConfiguration, ConfigurationFingerprint, StepConfiguration};
pub use input::InputFingerprint;

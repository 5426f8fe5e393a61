//! Configuration fingerprints and the closed set of action configurations.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::canonical::{canonical_json, sha256_hex};
use crate::errors::Result;
use crate::provenance::PipelineChain;

/// What a step was configured to do, in comparable form.
///
/// Two fingerprints are equal iff their action names and canonical parameter
/// renderings are equal; the digest is derived from both and exists for
/// compact display in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigurationFingerprint {
    /// Action the configuration belongs to.
    pub action: String,
    /// Canonical JSON rendering of every output-affecting parameter.
    pub canonical: String,
    /// SHA-256 over action and canonical form.
    pub digest: String,
}

impl ConfigurationFingerprint {
    /// Fingerprints arbitrary serializable parameters for `action`.
    pub fn of<P: Serialize + ?Sized>(action: impl Into<String>, params: &P) -> Result<Self> {
        let value = serde_json::to_value(params)?;
        Ok(Self::from_value(action, &value))
    }

    /// Fingerprints an already-built JSON value.
    #[must_use]
    pub fn from_value(action: impl Into<String>, params: &serde_json::Value) -> Self {
        let action = action.into();
        let canonical = canonical_json(params);
        let digest = sha256_hex(format!("{action}\n{canonical}").as_bytes());
        Self {
            action,
            canonical,
            digest,
        }
    }

    /// First twelve hex digits of the digest.
    #[must_use]
    pub fn short_digest(&self) -> &str {
        self.digest.get(..12).unwrap_or(&self.digest)
    }
}

impl fmt::Display for ConfigurationFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.action, self.short_digest())
    }
}

/// Anything that can describe its own configuration for provenance.
///
/// Domain crates implement this for their own action parameter types; the
/// core only ever consumes the resulting fingerprint.
pub trait StepConfiguration {
    /// Name of the action.
    fn action_name(&self) -> String;

    /// Fingerprint of the configuration.
    fn fingerprint(&self) -> Result<ConfigurationFingerprint>;
}

/// The action kinds known at the crate boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfiguration {
    /// Several streams merged into one. The configuration is the provenance
    /// of every input, so re-merging different inputs never looks compatible.
    Merge {
        /// Whether records interleave by key rather than concatenate.
        #[serde(default)]
        key_ordered: bool,
        /// Chains of the merged inputs, in input order.
        sources: Vec<PipelineChain>,
    },
    /// A container restricted to a subset of parents.
    Slice {
        /// Parent identifiers kept, in output order.
        parent_ids: Vec<i32>,
    },
    /// A stream re-sorted by a named key.
    Sort {
        /// Key name.
        key: String,
    },
    /// A per-record transform.
    Transform {
        /// Transform name.
        name: String,
        /// Output-affecting parameters.
        #[serde(default)]
        params: serde_json::Value,
    },
    /// A domain action the core knows nothing about.
    External {
        /// Action name.
        action: String,
        /// Output-affecting parameters.
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl ActionConfiguration {
    /// Configuration of a concatenating merge.
    #[must_use]
    pub fn merge(sources: Vec<PipelineChain>) -> Self {
        Self::Merge {
            key_ordered: false,
            sources,
        }
    }

    /// Configuration of a slice.
    #[must_use]
    pub fn slice(parent_ids: &[i32]) -> Self {
        Self::Slice {
            parent_ids: parent_ids.to_vec(),
        }
    }

    /// Configuration of a sort.
    #[must_use]
    pub fn sort(key: impl Into<String>) -> Self {
        Self::Sort { key: key.into() }
    }

    /// Configuration of a per-record transform.
    #[must_use]
    pub fn transform(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self::Transform {
            name: name.into(),
            params,
        }
    }

    /// Configuration of an opaque domain action.
    #[must_use]
    pub fn external(action: impl Into<String>, params: serde_json::Value) -> Self {
        Self::External {
            action: action.into(),
            params,
        }
    }
}

impl StepConfiguration for ActionConfiguration {
    fn action_name(&self) -> String {
        match self {
            Self::Merge { .. } => "merge".to_string(),
            Self::Slice { .. } => "slice".to_string(),
            Self::Sort { .. } => "sort".to_string(),
            Self::Transform { name, .. } => format!("transform:{name}"),
            Self::External { action, .. } => action.clone(),
        }
    }

    fn fingerprint(&self) -> Result<ConfigurationFingerprint> {
        ConfigurationFingerprint::of(self.action_name(), self)
    }
}

//! The domain-opaque record.

use serde::{Deserialize, Serialize};

/// One entity in a stream: an identifier, an optional parent and an opaque
/// payload the core never interprets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    /// Identifier, unique and increasing within its stream.
    pub id: i64,
    /// Parent entity, for records grouped in a container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i32>,
    /// Encoded domain record.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Record {
    /// Creates a parentless record.
    #[must_use]
    pub fn new(id: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            parent_id: None,
            payload: payload.into(),
        }
    }

    /// Sets the parent.
    #[must_use]
    pub fn with_parent(mut self, parent_id: i32) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Replaces the identifier.
    #[must_use]
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }
}

//! Run request: what the UI asks the backend to execute.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::{RunKind, SessionKey};

/// Request to start a run within a session.
///
/// `metadata` carries app-specific fields (files, user id, knowledge
/// filters) through to the launcher untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub session_id: SessionKey,
    pub kind: RunKind,
    /// Agent, team or workflow id to run.
    pub owner_id: String,
    pub message: String,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl RunRequest {
    /// Create a request without metadata.
    #[must_use]
    pub fn new(
        session_id: impl Into<SessionKey>,
        kind: RunKind,
        owner_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            owner_id: owner_id.into(),
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

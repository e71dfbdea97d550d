//! Run records: one execution of an agent, team or workflow step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::RunEvent;

/// Run identifier, as issued by the backend (or a temporary placeholder id).
pub type RunId = String;

/// Conversation/session key the store is addressed by.
pub type SessionKey = String;

/// Prefix marking a run id that the backend has not confirmed yet.
pub const TEMPORARY_RUN_PREFIX: &str = "optimistic:";

/// Generate a fresh temporary run id.
#[must_use]
pub fn temporary_run_id() -> RunId {
    format!("{TEMPORARY_RUN_PREFIX}{}", Uuid::new_v4())
}

/// Whether a run id is a not-yet-confirmed placeholder.
#[must_use]
pub fn is_temporary_run_id(run_id: &str) -> bool {
    run_id.starts_with(TEMPORARY_RUN_PREFIX)
}

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Run is known but has not started.
    #[default]
    Pending,
    /// Run is executing.
    Running,
    /// Run finished successfully.
    Completed,
    /// Run failed.
    Error,
    /// Run was cancelled.
    Cancelled,
    /// Run is waiting on external input.
    Paused,
}

impl RunStatus {
    /// Terminal statuses freeze the run: no further event mutates it.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// What kind of executor produced the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    #[default]
    Agent,
    Team,
    Workflow,
}

/// Accumulated run output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunContent {
    /// Plain text, appended to by incremental events.
    Text(String),
    /// Structured payload, always replaced wholesale.
    Structured(Value),
}

impl RunContent {
    /// Text view of the content, if it is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }

    /// Merge an incremental chunk into `slot`. Returns whether it changed.
    ///
    /// Text appends to text in place; anything involving a structured
    /// payload replaces.
    pub fn append_to(slot: &mut Option<Self>, chunk: &Self) -> bool {
        match (slot.as_mut(), chunk) {
            (Some(Self::Text(existing)), Self::Text(delta)) => {
                existing.push_str(delta);
                !delta.is_empty()
            }
            (Some(current), _) if current == chunk => false,
            _ => {
                *slot = Some(chunk.clone());
                true
            }
        }
    }
}

impl From<&str> for RunContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RunContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Result of one workflow step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<RunContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// A tool invocation made during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl ToolCall {
    /// Whether the tool call has produced its result.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One execution record.
///
/// Records are flat: tree membership is carried by `parent_run_id` and
/// assembled on demand by [`crate::tree::build_tree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub kind: RunKind,
    /// Agent, team or workflow id that executed the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<RunContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    /// Lifecycle, step and tool events applied to this run (content deltas
    /// are not logged).
    #[serde(default)]
    pub events: Vec<RunEvent>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

impl RunRecord {
    /// Create a pending record.
    #[must_use]
    pub fn new(run_id: impl Into<RunId>, created_at: i64) -> Self {
        Self {
            run_id: run_id.into(),
            parent_run_id: None,
            kind: RunKind::default(),
            owner_id: None,
            status: RunStatus::Pending,
            content: None,
            error: None,
            step_results: Vec::new(),
            tool_calls: Vec::new(),
            metrics: BTreeMap::new(),
            events: Vec::new(),
            created_at,
        }
    }

    /// Create an optimistic placeholder for a run the UI just initiated.
    #[must_use]
    pub fn placeholder(kind: RunKind, owner_id: Option<String>, created_at: i64) -> Self {
        Self {
            kind,
            owner_id,
            ..Self::new(temporary_run_id(), created_at)
        }
    }

    /// Attach a parent run.
    #[must_use]
    pub fn with_parent(mut self, parent_run_id: impl Into<RunId>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    /// Set the run kind.
    #[must_use]
    pub const fn with_kind(mut self, kind: RunKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the status.
    #[must_use]
    pub const fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the backend has not confirmed this run yet.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        is_temporary_run_id(&self.run_id)
    }

    /// Look up a step result by id.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|s| s.step_id == step_id)
    }

    /// Look up a tool call by id.
    #[must_use]
    pub fn tool_call(&self, tool_call_id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|t| t.tool_call_id == tool_call_id)
    }
}

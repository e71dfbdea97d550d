//! Realtime run events.
//!
//! The backend pushes one tagged event per state change. Agent, team and
//! workflow runs share the same lifecycle, so their tags are folded onto one
//! payload type (`TeamRunStarted` and `WorkflowStarted` both decode to
//! [`EventPayload::Started`]). A start event that carries no `kind` field
//! takes its kind from the tag it arrived under.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::{RunContent, RunId, RunKind, SessionKey};

/// One realtime event addressed to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct RunEvent {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionKey>,
    /// Unix epoch seconds.
    #[serde(default)]
    pub created_at: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Event payload, keyed by the `event` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventPayload {
    #[serde(rename = "RunStarted", alias = "TeamRunStarted", alias = "WorkflowStarted")]
    Started {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<RunKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<RunId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_id: Option<String>,
    },
    /// Incremental output chunk.
    #[serde(rename = "RunContent", alias = "TeamRunContent", alias = "WorkflowContent")]
    Content { content: RunContent },
    /// Terminal success; `content`, when present, replaces accumulated output.
    #[serde(
        rename = "RunCompleted",
        alias = "TeamRunCompleted",
        alias = "WorkflowCompleted"
    )]
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<RunContent>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metrics: BTreeMap<String, Value>,
    },
    #[serde(rename = "RunError", alias = "TeamRunError", alias = "WorkflowError")]
    Error { error: String },
    #[serde(
        rename = "RunCancelled",
        alias = "TeamRunCancelled",
        alias = "WorkflowCancelled"
    )]
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "RunPaused", alias = "TeamRunPaused")]
    Paused {},
    #[serde(rename = "RunContinued", alias = "TeamRunContinued")]
    Continued {},
    StepStarted {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_name: Option<String>,
    },
    StepCompleted {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<RunContent>,
    },
    StepError {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_name: Option<String>,
        error: String,
    },
    #[serde(alias = "TeamToolCallStarted")]
    ToolCallStarted {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(alias = "TeamToolCallCompleted")]
    ToolCallCompleted {
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default)]
        is_error: bool,
    },
    /// Any tag this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Decoding shape of [`RunEvent`], before the tag-derived kind is filled in.
#[derive(Deserialize)]
struct WireRunEvent {
    run_id: RunId,
    #[serde(default)]
    session_id: Option<SessionKey>,
    #[serde(default)]
    created_at: i64,
    #[serde(flatten)]
    payload: EventPayload,
}

impl TryFrom<Value> for RunEvent {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let tagged = value
            .get("event")
            .and_then(Value::as_str)
            .and_then(kind_for_tag);
        let WireRunEvent {
            run_id,
            session_id,
            created_at,
            mut payload,
        } = serde_json::from_value(value)?;
        if let EventPayload::Started { kind, .. } = &mut payload {
            if kind.is_none() {
                *kind = tagged;
            }
        }
        Ok(Self {
            run_id,
            session_id,
            created_at,
            payload,
        })
    }
}

fn kind_for_tag(tag: &str) -> Option<RunKind> {
    match tag {
        "TeamRunStarted" => Some(RunKind::Team),
        "WorkflowStarted" => Some(RunKind::Workflow),
        _ => None,
    }
}

impl EventPayload {
    /// Stable name for logs and telemetry.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "RunStarted",
            Self::Content { .. } => "RunContent",
            Self::Completed { .. } => "RunCompleted",
            Self::Error { .. } => "RunError",
            Self::Cancelled { .. } => "RunCancelled",
            Self::Paused {} => "RunPaused",
            Self::Continued {} => "RunContinued",
            Self::StepStarted { .. } => "StepStarted",
            Self::StepCompleted { .. } => "StepCompleted",
            Self::StepError { .. } => "StepError",
            Self::ToolCallStarted { .. } => "ToolCallStarted",
            Self::ToolCallCompleted { .. } => "ToolCallCompleted",
            Self::Unknown => "Unknown",
        }
    }
}

impl RunEvent {
    /// Create an event for a run.
    #[must_use]
    pub fn new(run_id: impl Into<RunId>, created_at: i64, payload: EventPayload) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: None,
            created_at,
            payload,
        }
    }

    /// Scope the event to a session.
    #[must_use]
    pub fn in_session(mut self, session_id: impl Into<SessionKey>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Decode one event from a JSON line. A leading SSE `data:` field
    /// prefix is accepted.
    ///
    /// # Errors
    /// Returns error if the line is not a JSON event object.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        let line = line.trim();
        let line = line.strip_prefix("data:").map_or(line, str::trim_start);
        serde_json::from_str(line)
    }

    /// Content deltas are applied but not kept in the run's event log.
    #[must_use]
    pub const fn is_content_delta(&self) -> bool {
        matches!(self.payload, EventPayload::Content { .. })
    }

    /// Whether the event ends the run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Completed { .. } | EventPayload::Error { .. } | EventPayload::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_tags_fold_onto_run_lifecycle() {
        let event = RunEvent::from_json_line(
            r#"{"event":"WorkflowStarted","run_id":"R1","created_at":10,"kind":"workflow"}"#,
        )
        .unwrap();
        assert_eq!(event.run_id, "R1");
        assert_eq!(
            event.payload,
            EventPayload::Started {
                kind: Some(RunKind::Workflow),
                parent_run_id: None,
                owner_id: None,
            }
        );
    }

    #[test]
    fn test_start_tag_implies_kind() {
        let team = RunEvent::from_json_line(r#"{"event":"TeamRunStarted","run_id":"T1"}"#).unwrap();
        let workflow =
            RunEvent::from_json_line(r#"{"event":"WorkflowStarted","run_id":"W1"}"#).unwrap();
        let plain = RunEvent::from_json_line(r#"{"event":"RunStarted","run_id":"R1"}"#).unwrap();
        let explicit = RunEvent::from_json_line(
            r#"{"event":"TeamRunStarted","run_id":"T2","kind":"agent"}"#,
        )
        .unwrap();

        let kind = |event: &RunEvent| match &event.payload {
            EventPayload::Started { kind, .. } => *kind,
            other => panic!("unexpected payload: {other:?}"),
        };
        assert_eq!(kind(&team), Some(RunKind::Team));
        assert_eq!(kind(&workflow), Some(RunKind::Workflow));
        assert_eq!(kind(&plain), None);
        assert_eq!(kind(&explicit), Some(RunKind::Agent));
    }

    #[test]
    fn test_sse_data_prefix_is_stripped() {
        let event = RunEvent::from_json_line(
            r#"data: {"event":"RunContent","run_id":"R1","content":"hi"}"#,
        )
        .unwrap();
        assert!(event.is_content_delta());
        assert_eq!(event.created_at, 0);
    }

    #[test]
    fn test_unknown_tag_decodes_to_unknown() {
        let event = RunEvent::from_json_line(
            r#"{"event":"ReasoningStep","run_id":"R1","created_at":3,"reasoning":"..."}"#,
        )
        .unwrap();
        assert_eq!(event.payload, EventPayload::Unknown);
        assert_eq!(event.payload.name(), "Unknown");
    }

    #[test]
    fn test_step_completed_with_structured_content() {
        let event = RunEvent::from_json_line(
            r#"{"event":"StepCompleted","run_id":"R1","step_id":"S1","content":{"rows":2}}"#,
        )
        .unwrap();
        match event.payload {
            EventPayload::StepCompleted { step_id, content, .. } => {
                assert_eq!(step_id, "S1");
                assert_eq!(
                    content,
                    Some(RunContent::Structured(serde_json::json!({"rows": 2})))
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_terminal_classification() {
        let done = RunEvent::new("R1", 0, EventPayload::Cancelled { reason: None });
        assert!(done.is_terminal());
        let paused = RunEvent::new("R1", 0, EventPayload::Paused {});
        assert!(!paused.is_terminal());
    }
}

//! Run-event reducer: folds one realtime event into a run record.

use crate::{
    event::{EventPayload, RunEvent},
    run::{RunContent, RunRecord, RunStatus, StepResult, ToolCall},
};

/// Apply an event to a run record, producing the next record.
///
/// Terminal runs are frozen and unknown events are ignored; in both cases
/// the returned record equals the input.
#[must_use]
pub fn apply(record: &RunRecord, event: &RunEvent) -> RunRecord {
    let mut next = record.clone();
    apply_in_place(&mut next, event);
    next
}

/// In-place form of [`apply`]. Returns whether the record changed.
pub fn apply_in_place(record: &mut RunRecord, event: &RunEvent) -> bool {
    if record.status.is_terminal() {
        tracing::trace!(
            run_id = %record.run_id,
            event = event.payload.name(),
            "Ignoring event for finished run"
        );
        return false;
    }
    if matches!(event.payload, EventPayload::Unknown) {
        tracing::debug!(run_id = %record.run_id, "Dropping unknown run event");
        return false;
    }

    let at = event.created_at;

    let changed = match &event.payload {
        EventPayload::Started {
            kind,
            parent_run_id,
            owner_id,
        } => {
            let mut changed = assign(&mut record.status, RunStatus::Running);
            // A start without a kind keeps whatever the record already knows.
            if let Some(kind) = kind {
                changed |= assign(&mut record.kind, *kind);
            }
            // Parent is write-once.
            if record.parent_run_id.is_none() && parent_run_id.is_some() {
                record.parent_run_id.clone_from(parent_run_id);
                changed = true;
            }
            if owner_id.is_some() {
                changed |= assign(&mut record.owner_id, owner_id.clone());
            }
            changed
        }
        EventPayload::Content { content } => {
            let started = mark_running(record);
            RunContent::append_to(&mut record.content, content) || started
        }
        EventPayload::Completed { content, metrics } => {
            let mut changed = assign(&mut record.status, RunStatus::Completed);
            if content.is_some() {
                changed |= assign(&mut record.content, content.clone());
            }
            for (key, value) in metrics {
                if record.metrics.get(key) != Some(value) {
                    record.metrics.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
            changed
        }
        EventPayload::Error { error } => {
            assign(&mut record.status, RunStatus::Error)
                | assign(&mut record.error, Some(error.clone()))
        }
        EventPayload::Cancelled { reason } => {
            let mut changed = assign(&mut record.status, RunStatus::Cancelled);
            if reason.is_some() {
                changed |= assign(&mut record.error, reason.clone());
            }
            changed
        }
        EventPayload::Paused {} => assign(&mut record.status, RunStatus::Paused),
        EventPayload::Continued {} => assign(&mut record.status, RunStatus::Running),
        EventPayload::StepStarted { step_id, step_name } => {
            let mut changed = mark_running(record);
            let (step, created) = upsert_step(record, step_id, at);
            changed |= created;
            if step_name.is_some() {
                changed |= assign(&mut step.step_name, step_name.clone());
            }
            // A replayed start must not regress a finished step.
            if !step.status.is_terminal() {
                changed |= assign(&mut step.status, RunStatus::Running);
            }
            changed
        }
        EventPayload::StepCompleted {
            step_id,
            step_name,
            content,
        } => {
            let mut changed = mark_running(record);
            let (step, created) = upsert_step(record, step_id, at);
            changed |= created;
            if step_name.is_some() {
                changed |= assign(&mut step.step_name, step_name.clone());
            }
            changed |= assign(&mut step.status, RunStatus::Completed);
            changed |= assign(&mut step.content, content.clone());
            changed |= assign(&mut step.completed_at, Some(at));
            changed
        }
        EventPayload::StepError {
            step_id,
            step_name,
            error,
        } => {
            let mut changed = mark_running(record);
            let (step, created) = upsert_step(record, step_id, at);
            changed |= created;
            if step_name.is_some() {
                changed |= assign(&mut step.step_name, step_name.clone());
            }
            changed |= assign(&mut step.status, RunStatus::Error);
            changed |= assign(&mut step.error, Some(error.clone()));
            changed |= assign(&mut step.completed_at, Some(at));
            changed
        }
        EventPayload::ToolCallStarted {
            tool_call_id,
            tool_name,
            args,
        } => {
            let mut changed = mark_running(record);
            let (tool, created) = upsert_tool(record, tool_call_id, tool_name, at);
            changed |= created;
            changed |= assign(&mut tool.args, args.clone());
            changed
        }
        EventPayload::ToolCallCompleted {
            tool_call_id,
            tool_name,
            result,
            is_error,
        } => {
            let mut changed = mark_running(record);
            let (tool, created) = upsert_tool(record, tool_call_id, tool_name, at);
            changed |= created;
            changed |= assign(&mut tool.result, result.clone());
            changed |= assign(&mut tool.is_error, *is_error);
            changed |= assign(&mut tool.completed_at, Some(at));
            changed
        }
        EventPayload::Unknown => false,
    };

    // Only events that moved the record are logged, so replays stay out.
    if changed && !event.is_content_delta() {
        record.events.push(event.clone());
    }
    changed
}

fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Any live event implies the run has started, even if its start event was
/// lost or arrives later.
fn mark_running(record: &mut RunRecord) -> bool {
    if record.status == RunStatus::Pending {
        record.status = RunStatus::Running;
        return true;
    }
    false
}

fn upsert_step<'a>(
    record: &'a mut RunRecord,
    step_id: &str,
    at: i64,
) -> (&'a mut StepResult, bool) {
    match record.step_results.iter().position(|s| s.step_id == step_id) {
        Some(idx) => (&mut record.step_results[idx], false),
        None => {
            record.step_results.push(StepResult {
                step_id: step_id.to_string(),
                step_name: None,
                status: RunStatus::Pending,
                content: None,
                error: None,
                started_at: at,
                completed_at: None,
            });
            let idx = record.step_results.len() - 1;
            (&mut record.step_results[idx], true)
        }
    }
}

fn upsert_tool<'a>(
    record: &'a mut RunRecord,
    tool_call_id: &str,
    tool_name: &str,
    at: i64,
) -> (&'a mut ToolCall, bool) {
    match record
        .tool_calls
        .iter()
        .position(|t| t.tool_call_id == tool_call_id)
    {
        Some(idx) => (&mut record.tool_calls[idx], false),
        None => {
            record.tool_calls.push(ToolCall {
                tool_call_id: tool_call_id.to_string(),
                tool_name: tool_name.to_string(),
                args: serde_json::Value::Null,
                result: None,
                is_error: false,
                started_at: at,
                completed_at: None,
            });
            let idx = record.tool_calls.len() - 1;
            (&mut record.tool_calls[idx], true)
        }
    }
}

//! In-memory run history and a launcher that replays recorded runs.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use agent_console_core::{
    EventPayload, HistoryError, LaunchError, LaunchedRun, RunEvent, RunHistorySource,
    RunLauncher, RunRecord, RunRequest, SessionKey, reducer,
};
use async_trait::async_trait;
use futures::StreamExt;

/// In-memory history source.
///
/// Useful for development and tests. Data is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    sessions: RwLock<HashMap<SessionKey, Vec<RunRecord>>>,
}

impl MemoryHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the runs recorded for a session.
    pub fn insert_runs(&self, session_id: impl Into<SessionKey>, runs: Vec<RunRecord>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.into(), runs);
    }

    /// Runs recorded for a session.
    #[must_use]
    pub fn runs(&self, session_id: &str) -> Vec<RunRecord> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Persist one event the way the backend would.
    pub fn record_event(&self, session_id: &str, event: &RunEvent) -> bool {
        if matches!(event.payload, EventPayload::Unknown) {
            return false;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let runs = sessions.entry(session_id.to_string()).or_default();
        match runs.iter_mut().find(|r| r.run_id == event.run_id) {
            Some(run) => reducer::apply_in_place(run, event),
            None => {
                let mut run = RunRecord::new(event.run_id.clone(), event.created_at);
                reducer::apply_in_place(&mut run, event);
                runs.push(run);
                true
            }
        }
    }
}

#[async_trait]
impl RunHistorySource for MemoryHistory {
    async fn fetch_runs(&self, session_id: &str) -> Result<Vec<RunRecord>, HistoryError> {
        self.sessions
            .read()
            .map_err(|e| HistoryError::Unavailable(e.to_string()))?
            .get(session_id)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(session_id.to_string()))
    }
}

/// Launcher that plays back recorded event scripts, one per launch.
///
/// With a history attached, every event is also persisted there as it is
/// emitted, so a history fetch after the stream ends sees the final runs.
#[derive(Debug, Default)]
pub struct ReplayLauncher {
    scripts: Mutex<VecDeque<Vec<RunEvent>>>,
    history: Option<Arc<MemoryHistory>>,
}

impl ReplayLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist replayed events into `history`.
    #[must_use]
    pub fn recording_into(mut self, history: Arc<MemoryHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Queue the events of one run.
    pub fn push_script(&self, events: Vec<RunEvent>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(events);
    }
}

#[async_trait]
impl RunLauncher for ReplayLauncher {
    async fn launch(&self, request: &RunRequest) -> Result<LaunchedRun, LaunchError> {
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| LaunchError::Rejected("no recorded run left to replay".to_string()))?;

        let run_id = script.iter().find_map(|event| match &event.payload {
            EventPayload::Started {
                parent_run_id: None,
                ..
            } => Some(event.run_id.clone()),
            _ => None,
        });
        tracing::debug!(
            session_id = %request.session_id,
            ?run_id,
            events = script.len(),
            "Replaying recorded run"
        );

        let history = self.history.clone();
        let session_id = request.session_id.clone();
        let events = futures::stream::iter(script)
            .map(move |event| {
                if let Some(history) = &history {
                    history.record_event(&session_id, &event);
                }
                Ok(event)
            })
            .boxed();

        Ok(LaunchedRun { run_id, events })
    }
}

#[cfg(test)]
mod tests {
    use agent_console_core::{RunKind, RunStatus};

    use super::*;

    fn started(run_id: &str) -> RunEvent {
        RunEvent::new(
            run_id,
            1,
            EventPayload::Started {
                kind: Some(RunKind::Agent),
                parent_run_id: None,
                owner_id: Some("agent-1".to_string()),
            },
        )
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let history = MemoryHistory::new();
        assert!(matches!(
            history.fetch_runs("nope").await,
            Err(HistoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_records_into_history() {
        let history = Arc::new(MemoryHistory::new());
        let launcher = ReplayLauncher::new().recording_into(Arc::clone(&history));
        launcher.push_script(vec![
            started("r1"),
            RunEvent::new(
                "r1",
                2,
                EventPayload::Completed {
                    content: Some("done".into()),
                    metrics: Default::default(),
                },
            ),
        ]);

        let request = RunRequest::new("s1", RunKind::Agent, "agent-1", "hello");
        let launched = launcher.launch(&request).await.unwrap();
        assert_eq!(launched.run_id.as_deref(), Some("r1"));
        let events: Vec<_> = launched.events.collect().await;
        assert_eq!(events.len(), 2);

        let runs = history.fetch_runs("s1").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);

        assert!(matches!(
            launcher.launch(&request).await,
            Err(LaunchError::Rejected(_))
        ));
    }
}

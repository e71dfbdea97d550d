//! Collaborator traits for run history and run launching.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{
    RunRequest,
    event::RunEvent,
    run::{RunId, RunRecord, SessionKey},
};

/// History fetch error.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Session not found: {0}")]
    NotFound(SessionKey),
    #[error("History unavailable: {0}")]
    Unavailable(String),
}

/// Source of authoritative run records for a session.
#[async_trait]
pub trait RunHistorySource: Send + Sync {
    /// Fetch every run recorded for a session, in creation order.
    async fn fetch_runs(&self, session_id: &str) -> Result<Vec<RunRecord>, HistoryError>;
}

/// Launch error.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Run rejected: {0}")]
    Rejected(String),
    #[error("Event stream failed: {0}")]
    Stream(String),
}

/// Stream of realtime events produced by a launched run.
pub type EventStream = BoxStream<'static, Result<RunEvent, LaunchError>>;

/// A run accepted by the backend.
pub struct LaunchedRun {
    /// Backend run id, when the backend reports it up front.
    pub run_id: Option<RunId>,
    /// Realtime events for the run and its children.
    pub events: EventStream,
}

impl std::fmt::Debug for LaunchedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedRun")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Trait for starting runs on the execution backend.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// Start a run and return its event stream.
    async fn launch(&self, request: &RunRequest) -> Result<LaunchedRun, LaunchError>;
}

//! Session manager: starts runs and keeps the streaming store in step with
//! their realtime events.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use agent_console_core::{
    EventPayload, HistoryError, LaunchError, RunEvent, RunHistorySource, RunId, RunLauncher,
    RunRecord, RunRequest, SessionKey, StoreError, StreamingRunStore, run::is_temporary_run_id,
};
use futures::StreamExt;
use tokio::{
    sync::{RwLock, watch},
    task::{AbortHandle, JoinHandle},
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("History error: {0}")]
    History(#[from] HistoryError),
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),
    #[error("Session already streaming: {0}")]
    AlreadyStreaming(SessionKey),
    #[error("Session abandoned while the run was launching: {0}")]
    Abandoned(SessionKey),
}

/// A run whose events are being pumped into the store.
#[derive(Debug)]
pub struct StartedRun {
    run_id: watch::Receiver<RunId>,
    /// Completes once the stream has ended and history has settled.
    pub finished: JoinHandle<()>,
}

impl StartedRun {
    /// Current id of the run: the backend id once known, the placeholder id
    /// until then.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id.borrow().clone()
    }

    /// Wait until the backend has confirmed the run's id.
    ///
    /// Returns `None` if the stream ended without a root start event.
    pub async fn confirmed_run_id(&mut self) -> Option<RunId> {
        self.run_id
            .wait_for(|id| !is_temporary_run_id(id))
            .await
            .ok()
            .map(|id| RunId::clone(&id))
    }
}

/// One session's claim on the manager. `handle` stays empty while the run
/// is still launching.
#[derive(Debug)]
struct PumpSlot {
    ticket: u64,
    handle: Option<AbortHandle>,
}

type Pumps = Arc<RwLock<HashMap<SessionKey, PumpSlot>>>;

/// Orchestrates runs for any number of sessions over one store.
pub struct SessionManager<H, L>
where
    H: RunHistorySource + 'static,
    L: RunLauncher,
{
    store: Arc<StreamingRunStore>,
    history: Arc<H>,
    launcher: L,
    pumps: Pumps,
    tickets: AtomicU64,
}

impl<H, L> SessionManager<H, L>
where
    H: RunHistorySource + 'static,
    L: RunLauncher,
{
    /// Create a new session manager.
    #[must_use]
    pub fn new(store: Arc<StreamingRunStore>, history: Arc<H>, launcher: L) -> Self {
        Self {
            store,
            history,
            launcher,
            pumps: Arc::new(RwLock::new(HashMap::new())),
            tickets: AtomicU64::new(0),
        }
    }

    /// The store this manager writes.
    #[must_use]
    pub const fn store(&self) -> &Arc<StreamingRunStore> {
        &self.store
    }

    /// Whether a run is launching or streaming for a session.
    pub async fn is_pumping(&self, session_id: &str) -> bool {
        self.pumps.read().await.contains_key(session_id)
    }

    /// Fetch a session's history into the store.
    ///
    /// A session the backend does not know yet has an empty history.
    ///
    /// # Errors
    /// Returns error if the history source is unavailable.
    pub async fn refresh_history(&self, session_id: &str) -> Result<usize, SessionError> {
        let runs = load_history(self.history.as_ref(), session_id).await?;
        let count = runs.len();
        self.store.set_history_runs(session_id, runs);
        Ok(count)
    }

    /// Start a run.
    ///
    /// The session is claimed before anything else happens, so concurrent
    /// starts for one session cannot both launch. An optimistic placeholder
    /// appears in the store right away and is confirmed by the run's start
    /// event. If the launch fails the placeholder is removed and the stream
    /// abandoned.
    ///
    /// # Errors
    /// Returns error if the session is already streaming, streaming is not
    /// allowed, the launch is rejected, or the session was abandoned while
    /// launching.
    pub async fn start_run(&self, request: RunRequest) -> Result<StartedRun, SessionError> {
        let session_id = request.session_id.clone();
        let ticket = self.reserve(&session_id).await?;

        if let Err(e) = self.store.begin_stream(&session_id) {
            self.release(&session_id, ticket).await;
            return Err(e.into());
        }
        let placeholder =
            RunRecord::placeholder(request.kind, Some(request.owner_id.clone()), now());
        let placeholder_id = placeholder.run_id.clone();
        self.store.upsert_streaming_run(&session_id, placeholder);

        let launched = match self.launcher.launch(&request).await {
            Ok(launched) => launched,
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Run launch failed");
                // An abandon during the launch already cleaned up, and the
                // session may belong to a newer start by now.
                if self.release(&session_id, ticket).await {
                    self.store.purge_temporary_runs(&session_id);
                    self.store.abandon_stream(&session_id);
                }
                return Err(e.into());
            }
        };

        let run_id = launched.run_id.clone().unwrap_or(placeholder_id);

        let mut pumps = self.pumps.write().await;
        let Some(slot) = pumps
            .get_mut(&session_id)
            .filter(|slot| slot.ticket == ticket)
        else {
            drop(pumps);
            tracing::info!(%session_id, "Session abandoned while launching, dropping run stream");
            return Err(SessionError::Abandoned(session_id));
        };
        tracing::info!(%session_id, %run_id, "Run started");
        let (run_id_tx, run_id_rx) = watch::channel(run_id);
        let finished = tokio::spawn(pump(
            Arc::clone(&self.store),
            Arc::clone(&self.history),
            Arc::clone(&self.pumps),
            Claim {
                session_id,
                ticket,
            },
            launched.run_id,
            run_id_tx,
            launched.events,
        ));
        slot.handle = Some(finished.abort_handle());
        drop(pumps);

        Ok(StartedRun {
            run_id: run_id_rx,
            finished,
        })
    }

    /// Stop pumping a session and drop its live runs.
    ///
    /// A start still launching for the session loses its claim and fails
    /// with [`SessionError::Abandoned`].
    pub async fn abandon(&self, session_id: &str) -> bool {
        let slot = self.pumps.write().await.remove(session_id);
        if let Some(slot) = &slot {
            if let Some(handle) = &slot.handle {
                handle.abort();
            }
            tracing::info!(session_id, "Abandoned run stream");
        }
        let purged = self.store.purge_temporary_runs(session_id);
        let closed = self.store.abandon_stream(session_id);
        slot.is_some() || purged || closed
    }

    /// Claim a session for a new run under a single write lock.
    async fn reserve(&self, session_id: &str) -> Result<u64, SessionError> {
        let mut pumps = self.pumps.write().await;
        if pumps.contains_key(session_id) {
            return Err(SessionError::AlreadyStreaming(session_id.to_string()));
        }
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        pumps.insert(
            session_id.to_string(),
            PumpSlot {
                ticket,
                handle: None,
            },
        );
        Ok(ticket)
    }

    /// Give up a claim. Returns whether the claim was still held.
    async fn release(&self, session_id: &str, ticket: u64) -> bool {
        release_claim(
            &self.pumps,
            &Claim {
                session_id: session_id.to_string(),
                ticket,
            },
        )
        .await
    }
}

/// The session a pump writes to, and the claim it holds on it.
struct Claim {
    session_id: SessionKey,
    ticket: u64,
}

async fn release_claim(pumps: &Pumps, claim: &Claim) -> bool {
    let mut pumps = pumps.write().await;
    let held = pumps
        .get(&claim.session_id)
        .is_some_and(|slot| slot.ticket == claim.ticket);
    if held {
        pumps.remove(&claim.session_id);
    }
    held
}

async fn load_history<H: RunHistorySource + ?Sized>(
    history: &H,
    session_id: &str,
) -> Result<Vec<RunRecord>, HistoryError> {
    match history.fetch_runs(session_id).await {
        Err(HistoryError::NotFound(_)) => Ok(Vec::new()),
        other => other,
    }
}

async fn pump<H: RunHistorySource + ?Sized>(
    store: Arc<StreamingRunStore>,
    history: Arc<H>,
    pumps: Pumps,
    claim: Claim,
    mut root_run_id: Option<RunId>,
    run_id: watch::Sender<RunId>,
    mut events: agent_console_core::EventStream,
) {
    let session_id = claim.session_id.as_str();
    let mut applied = 0usize;
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => {
                if track_root(&mut root_run_id, &event) {
                    run_id.send_replace(event.run_id.clone());
                }
                stream_root_text(&store, session_id, root_run_id.as_deref(), &event);
                if store.apply_event(session_id, &event) {
                    applied += 1;
                }
            }
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Run event stream failed");
                break;
            }
        }
    }
    tracing::debug!(%session_id, applied, "Run event stream ended");

    match load_history(history.as_ref(), session_id).await {
        Ok(runs) => {
            store.set_history_runs(session_id, runs);
            store.end_stream(session_id);
        }
        Err(e) => {
            // Keep the live runs on screen; they are all we have.
            tracing::warn!(%session_id, error = %e, "History refresh after stream failed");
            store.update_session_state(session_id, |state| {
                state.is_streaming = false;
                state.was_streamed = true;
            });
        }
    }
    store.purge_temporary_runs(session_id);
    release_claim(&pumps, &claim).await;
}

/// Record the first root start event's run id. Returns whether it was new.
fn track_root(root_run_id: &mut Option<RunId>, event: &RunEvent) -> bool {
    if root_run_id.is_some() {
        return false;
    }
    if let EventPayload::Started {
        parent_run_id: None,
        ..
    } = &event.payload
    {
        *root_run_id = Some(event.run_id.clone());
        return true;
    }
    false
}

fn stream_root_text(
    store: &StreamingRunStore,
    session_id: &str,
    root_run_id: Option<&str>,
    event: &RunEvent,
) {
    if root_run_id != Some(event.run_id.as_str()) {
        return;
    }
    if let EventPayload::Content { content } = &event.payload {
        if let Some(text) = content.as_text() {
            store.append_streaming_message(session_id, text);
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use agent_console_core::{AuthStatus, AuthStatusCell, RunKind, RunStatus};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::storage::{MemoryHistory, ReplayLauncher};

    const SESSION: &str = "session-1";

    fn event(run_id: &str, at: i64, payload: EventPayload) -> RunEvent {
        RunEvent::new(run_id, at, payload).in_session(SESSION)
    }

    fn started(run_id: &str, parent: Option<&str>) -> RunEvent {
        event(
            run_id,
            1,
            EventPayload::Started {
                kind: Some(RunKind::Workflow),
                parent_run_id: parent.map(str::to_string),
                owner_id: Some("wf-1".to_string()),
            },
        )
    }

    fn workflow_script() -> Vec<RunEvent> {
        vec![
            started("W1", None),
            event("W1", 2, EventPayload::Content { content: "Hel".into() }),
            started("A1", Some("W1")),
            event("W1", 3, EventPayload::Content { content: "lo".into() }),
            event(
                "A1",
                4,
                EventPayload::Completed {
                    content: Some("sub".into()),
                    metrics: Default::default(),
                },
            ),
            event(
                "W1",
                5,
                EventPayload::Completed {
                    content: None,
                    metrics: Default::default(),
                },
            ),
        ]
    }

    fn request() -> RunRequest {
        RunRequest::new(SESSION, RunKind::Workflow, "wf-1", "go")
    }

    #[tokio::test]
    async fn test_run_settles_into_history() {
        let history = Arc::new(MemoryHistory::new());
        let launcher = ReplayLauncher::new().recording_into(Arc::clone(&history));
        launcher.push_script(workflow_script());
        let manager = SessionManager::new(Arc::new(StreamingRunStore::new()), history, launcher);

        let started = manager.start_run(request()).await.unwrap();
        assert_eq!(started.run_id(), "W1");
        started.finished.await.unwrap();

        let store = manager.store();
        assert!(store.streaming_runs(SESSION).is_empty());
        let state = store.session_state(SESSION);
        assert!(!state.is_streaming);
        assert!(state.was_streamed);
        assert_eq!(state.streaming_message, "Hello");

        let tree = store.run_tree(SESSION);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].record.run_id, "W1");
        assert_eq!(tree[0].record.status, RunStatus::Completed);
        assert_eq!(tree[0].children[0].record.run_id, "A1");
        assert!(!manager.is_pumping(SESSION).await);
    }

    struct Rejecting;

    #[async_trait]
    impl RunLauncher for Rejecting {
        async fn launch(
            &self,
            _request: &RunRequest,
        ) -> Result<agent_console_core::LaunchedRun, LaunchError> {
            Err(LaunchError::Rejected("quota exceeded".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_launch_removes_placeholder() {
        let manager = SessionManager::new(
            Arc::new(StreamingRunStore::new()),
            Arc::new(MemoryHistory::new()),
            Rejecting,
        );

        let err = manager.start_run(request()).await.unwrap_err();

        assert!(matches!(err, SessionError::Launch(LaunchError::Rejected(_))));
        assert!(manager.store().streaming_runs(SESSION).is_empty());
        assert!(!manager.store().session_state(SESSION).is_streaming);
    }

    #[tokio::test]
    async fn test_gated_store_refuses_to_start() {
        let auth = AuthStatusCell::new();
        let manager = SessionManager::new(
            Arc::new(StreamingRunStore::with_auth_gate(auth.clone())),
            Arc::new(MemoryHistory::new()),
            ReplayLauncher::new(),
        );

        let err = manager.start_run(request()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Store(StoreError::StreamingDisabled(AuthStatus::Loading))
        ));
        assert!(manager.store().streaming_runs(SESSION).is_empty());
    }

    /// Launcher whose stream never ends.
    struct Endless;

    #[async_trait]
    impl RunLauncher for Endless {
        async fn launch(
            &self,
            _request: &RunRequest,
        ) -> Result<agent_console_core::LaunchedRun, LaunchError> {
            let events = futures::stream::iter(vec![Ok(started("W1", None))])
                .chain(futures::stream::pending())
                .boxed();
            Ok(agent_console_core::LaunchedRun {
                run_id: None,
                events,
            })
        }
    }

    #[tokio::test]
    async fn test_second_start_is_refused_and_abandon_clears() {
        let manager = SessionManager::new(
            Arc::new(StreamingRunStore::new()),
            Arc::new(MemoryHistory::new()),
            Endless,
        );

        let mut started = manager.start_run(request()).await.unwrap();
        assert!(started.run_id().starts_with(agent_console_core::run::TEMPORARY_RUN_PREFIX));
        assert_eq!(started.confirmed_run_id().await.as_deref(), Some("W1"));
        assert_eq!(started.run_id(), "W1");
        assert!(matches!(
            manager.start_run(request()).await,
            Err(SessionError::AlreadyStreaming(_))
        ));

        assert!(manager.abandon(SESSION).await);
        assert!(started.finished.await.unwrap_err().is_cancelled());
        assert!(manager.store().streaming_runs(SESSION).is_empty());
        assert!(!manager.store().session_state(SESSION).is_streaming);
        assert!(!manager.is_pumping(SESSION).await);
    }

    /// Launcher that holds every launch until the gate opens.
    struct Gated(Arc<Notify>);

    #[async_trait]
    impl RunLauncher for Gated {
        async fn launch(
            &self,
            request: &RunRequest,
        ) -> Result<agent_console_core::LaunchedRun, LaunchError> {
            self.0.notified().await;
            Endless.launch(request).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_starts_launch_once() {
        let gate = Arc::new(Notify::new());
        let manager = SessionManager::new(
            Arc::new(StreamingRunStore::new()),
            Arc::new(MemoryHistory::new()),
            Gated(Arc::clone(&gate)),
        );

        let (first, second, ()) = tokio::join!(
            manager.start_run(request()),
            manager.start_run(request()),
            async { gate.notify_one() },
        );

        let refused = [&first, &second]
            .into_iter()
            .filter(|r| matches!(r, Err(SessionError::AlreadyStreaming(_))))
            .count();
        assert_eq!(refused, 1);
        let started = first.or(second).unwrap();
        assert_eq!(manager.store().streaming_runs(SESSION).len(), 1);

        manager.abandon(SESSION).await;
        assert!(started.finished.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_abandon_during_launch_drops_the_run() {
        let gate = Arc::new(Notify::new());
        let manager = SessionManager::new(
            Arc::new(StreamingRunStore::new()),
            Arc::new(MemoryHistory::new()),
            Gated(Arc::clone(&gate)),
        );

        let (result, abandoned) = tokio::join!(manager.start_run(request()), async {
            let abandoned = manager.abandon(SESSION).await;
            gate.notify_one();
            abandoned
        });

        assert!(abandoned);
        assert!(matches!(result, Err(SessionError::Abandoned(id)) if id == SESSION));
        assert!(!manager.is_pumping(SESSION).await);
        assert!(manager.store().streaming_runs(SESSION).is_empty());
        assert!(!manager.store().session_state(SESSION).is_streaming);

        // The session is free again.
        gate.notify_one();
        let started = manager.start_run(request()).await.unwrap();
        manager.abandon(SESSION).await;
        assert!(started.finished.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_refresh_history_of_new_session_is_empty() {
        let manager = SessionManager::new(
            Arc::new(StreamingRunStore::new()),
            Arc::new(MemoryHistory::new()),
            ReplayLauncher::new(),
        );
        assert_eq!(manager.refresh_history(SESSION).await.unwrap(), 0);
    }
}

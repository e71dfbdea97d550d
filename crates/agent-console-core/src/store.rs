//! Streaming run store.
//!
//! Keyed by session: historical runs (replaced wholesale on refetch),
//! streaming runs (mutated as realtime events arrive) and the per-session
//! streaming flags. State is an immutable [`StoreSnapshot`] behind an
//! `Arc`; every setter compares its proposed state with the current one and
//! commits nothing when they are equal, so the snapshot identity and the
//! revision only move on observable changes.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockWriteGuard},
};

use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    auth::{AuthStatus, AuthStatusCell},
    event::{EventPayload, RunEvent},
    reducer,
    run::{RunRecord, RunStatus, SessionKey},
    tree::{RunNode, build_tree},
};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

type RunMap = HashMap<SessionKey, Arc<Vec<RunRecord>>>;

/// Per-session streaming flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStreamingState {
    pub is_streaming: bool,
    pub streaming_message: String,
    pub was_streamed: bool,
}

/// Which part of a session a committed change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeScope {
    History,
    Streaming,
    StreamingState,
    /// More than one of the above in a single commit.
    Session,
}

/// Notification of one committed store change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChange {
    pub revision: u64,
    pub session_id: SessionKey,
    pub scope: ChangeScope,
}

/// Store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Streaming is disabled while backend status is {0:?}")]
    StreamingDisabled(AuthStatus),
}

/// Immutable view of the whole store at one revision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    revision: u64,
    history_runs: RunMap,
    streaming_runs: RunMap,
    session_states: HashMap<SessionKey, SessionStreamingState>,
}

impl StoreSnapshot {
    /// Revision of this snapshot; bumped once per committed change.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Historical runs of a session.
    #[must_use]
    pub fn history_runs(&self, session_id: &str) -> &[RunRecord] {
        slot(&self.history_runs, session_id)
    }

    /// Live runs of a session.
    #[must_use]
    pub fn streaming_runs(&self, session_id: &str) -> &[RunRecord] {
        slot(&self.streaming_runs, session_id)
    }

    /// Streaming flags of a session (default when never set).
    #[must_use]
    pub fn session_state(&self, session_id: &str) -> SessionStreamingState {
        self.session_states
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// History merged with live runs.
    ///
    /// History order comes first. A live record replaces its historical
    /// counterpart while the historical one is not terminal; live records
    /// unknown to history follow in arrival order.
    #[must_use]
    pub fn combined_runs(&self, session_id: &str) -> Vec<RunRecord> {
        let history = self.history_runs(session_id);
        let streaming = self.streaming_runs(session_id);
        let live: HashMap<&str, &RunRecord> =
            streaming.iter().map(|r| (r.run_id.as_str(), r)).collect();

        let mut shown: HashSet<&str> = HashSet::with_capacity(history.len());
        let mut combined = Vec::with_capacity(history.len() + streaming.len());
        for run in history {
            match live.get(run.run_id.as_str()) {
                Some(live_run) if !run.status.is_terminal() => combined.push((*live_run).clone()),
                _ => combined.push(run.clone()),
            }
            shown.insert(run.run_id.as_str());
        }
        combined.extend(
            streaming
                .iter()
                .filter(|r| !shown.contains(r.run_id.as_str()))
                .cloned(),
        );
        combined
    }

    /// Display tree over [`Self::combined_runs`].
    #[must_use]
    pub fn run_tree(&self, session_id: &str) -> Vec<RunNode> {
        build_tree(&self.combined_runs(session_id))
    }
}

fn slot<'a>(map: &'a RunMap, session_id: &str) -> &'a [RunRecord] {
    map.get(session_id).map_or(&[], |runs| runs.as_slice())
}

fn put_runs(map: &mut RunMap, session_id: &str, runs: Vec<RunRecord>) {
    if runs.is_empty() {
        map.remove(session_id);
    } else {
        map.insert(session_id.to_string(), Arc::new(runs));
    }
}

fn put_state(snapshot: &mut StoreSnapshot, session_id: &str, state: SessionStreamingState) {
    if state == SessionStreamingState::default() {
        snapshot.session_states.remove(session_id);
    } else {
        snapshot.session_states.insert(session_id.to_string(), state);
    }
}

/// How a session's streaming list changes.
enum Placement {
    Replace(usize, RunRecord),
    Append(RunRecord),
    /// The record takes over a placeholder's slot and its duplicate at
    /// `stale` goes.
    Adopt {
        slot: usize,
        stale: usize,
        run: RunRecord,
    },
    Remove(usize),
}

/// Process-wide run state, keyed by session.
pub struct StreamingRunStore {
    state: RwLock<Arc<StoreSnapshot>>,
    sender: broadcast::Sender<StoreChange>,
    auth: Option<AuthStatusCell>,
}

impl Default for StreamingRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamingRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRunStore")
            .field("revision", &self.snapshot().revision())
            .field("gated", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

impl StreamingRunStore {
    /// Create an ungated store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(Arc::new(StoreSnapshot::default())),
            sender,
            auth: None,
        }
    }

    /// Create a store whose streams may only begin while the backend is
    /// authenticated.
    #[must_use]
    pub fn with_auth_gate(auth: AuthStatusCell) -> Self {
        Self {
            auth: Some(auth),
            ..Self::new()
        }
    }

    /// Whether a new stream may begin now.
    #[must_use]
    pub fn streaming_enabled(&self) -> bool {
        self.auth
            .as_ref()
            .is_none_or(|auth| auth.get().allows_streaming())
    }

    /// Current snapshot. Unchanged (same `Arc`) across no-op setter calls.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Historical runs of a session.
    #[must_use]
    pub fn history_runs(&self, session_id: &str) -> Vec<RunRecord> {
        self.snapshot().history_runs(session_id).to_vec()
    }

    /// Live runs of a session.
    #[must_use]
    pub fn streaming_runs(&self, session_id: &str) -> Vec<RunRecord> {
        self.snapshot().streaming_runs(session_id).to_vec()
    }

    /// Streaming flags of a session.
    #[must_use]
    pub fn session_state(&self, session_id: &str) -> SessionStreamingState {
        self.snapshot().session_state(session_id)
    }

    /// Display tree of a session.
    #[must_use]
    pub fn run_tree(&self, session_id: &str) -> Vec<RunNode> {
        self.snapshot().run_tree(session_id)
    }

    /// Receiver for committed changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.sender.subscribe()
    }

    /// Stream of committed changes. Lagged notifications are skipped.
    #[must_use]
    pub fn changes(&self) -> futures::stream::BoxStream<'static, StoreChange> {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|res| future::ready(res.ok()))
            .boxed()
    }

    /// Replace a session's history.
    ///
    /// Live runs whose history record is terminal are superseded and
    /// dropped in the same commit.
    pub fn set_history_runs(&self, session_id: &str, runs: Vec<RunRecord>) -> bool {
        let mut guard = self.write();

        let history_changed = guard.history_runs(session_id) != runs.as_slice();
        let finished: HashSet<&str> = runs
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| r.run_id.as_str())
            .collect();
        let streaming = guard.streaming_runs(session_id);
        let kept: Vec<RunRecord> = streaming
            .iter()
            .filter(|r| !finished.contains(r.run_id.as_str()))
            .cloned()
            .collect();
        let streaming_changed = kept.len() != streaming.len();

        if !history_changed && !streaming_changed {
            return false;
        }

        let scope = match (history_changed, streaming_changed) {
            (true, true) => ChangeScope::Session,
            (true, false) => ChangeScope::History,
            _ => ChangeScope::Streaming,
        };
        self.commit(&mut guard, session_id, scope, |s| {
            if history_changed {
                put_runs(&mut s.history_runs, session_id, runs);
            }
            if streaming_changed {
                put_runs(&mut s.streaming_runs, session_id, kept);
            }
        });
        true
    }

    /// Replace a session's live runs.
    pub fn set_streaming_runs(&self, session_id: &str, runs: Vec<RunRecord>) -> bool {
        let mut guard = self.write();
        if guard.streaming_runs(session_id) == runs.as_slice() {
            return false;
        }
        self.commit(&mut guard, session_id, ChangeScope::Streaming, |s| {
            put_runs(&mut s.streaming_runs, session_id, runs);
        });
        true
    }

    /// Insert or replace one live run, keyed by run id.
    pub fn upsert_streaming_run(&self, session_id: &str, run: RunRecord) -> bool {
        let mut guard = self.write();
        let placement = match guard
            .streaming_runs(session_id)
            .iter()
            .position(|r| r.run_id == run.run_id)
        {
            Some(idx) if guard.streaming_runs(session_id)[idx] == run => return false,
            Some(idx) => Placement::Replace(idx, run),
            None => Placement::Append(run),
        };
        self.commit(&mut guard, session_id, ChangeScope::Streaming, |s| {
            place(s, session_id, placement);
        });
        true
    }

    /// Fold one realtime event into the session's live runs.
    ///
    /// The run is looked up among live runs first, then history. A root
    /// start event adopts the session's oldest unconfirmed placeholder: the
    /// placeholder becomes the run, or merges into the live copy that
    /// streamed in before its start event, or is dropped when history
    /// already holds the finished run. Returns whether anything changed.
    pub fn apply_event(&self, session_id: &str, event: &RunEvent) -> bool {
        if matches!(event.payload, EventPayload::Unknown) {
            tracing::debug!(session_id, run_id = %event.run_id, "Dropping unknown run event");
            return false;
        }

        let mut guard = self.write();
        let placement = {
            let snapshot: &StoreSnapshot = &guard;
            let streaming = snapshot.streaming_runs(session_id);
            let live = streaming.iter().position(|r| r.run_id == event.run_id);
            let placeholder =
                adoptable_placeholder(streaming, event).filter(|&slot| Some(slot) != live);
            if let Some(slot) = placeholder {
                tracing::debug!(
                    session_id,
                    placeholder = %streaming[slot].run_id,
                    run_id = %event.run_id,
                    "Confirming placeholder run"
                );
            }

            match (live, placeholder) {
                (Some(stale), Some(slot)) => {
                    let mut run = streaming[stale].clone();
                    absorb_placeholder(&mut run, &streaming[slot]);
                    reducer::apply_in_place(&mut run, event);
                    Placement::Adopt { slot, stale, run }
                }
                (Some(idx), None) => {
                    let mut run = streaming[idx].clone();
                    if !reducer::apply_in_place(&mut run, event) {
                        return false;
                    }
                    Placement::Replace(idx, run)
                }
                (None, placeholder) => {
                    let known = snapshot
                        .history_runs(session_id)
                        .iter()
                        .find(|r| r.run_id == event.run_id);
                    match (known, placeholder) {
                        (Some(known), Some(slot)) if known.status.is_terminal() => {
                            Placement::Remove(slot)
                        }
                        (Some(known), Some(slot)) => {
                            let mut run = known.clone();
                            absorb_placeholder(&mut run, &streaming[slot]);
                            reducer::apply_in_place(&mut run, event);
                            Placement::Replace(slot, run)
                        }
                        (Some(known), None) => {
                            let mut run = known.clone();
                            if !reducer::apply_in_place(&mut run, event) {
                                return false;
                            }
                            Placement::Append(run)
                        }
                        (None, Some(slot)) => {
                            let mut run = streaming[slot].clone();
                            run.run_id.clone_from(&event.run_id);
                            reducer::apply_in_place(&mut run, event);
                            Placement::Replace(slot, run)
                        }
                        (None, None) => {
                            let mut run = RunRecord::new(event.run_id.clone(), event.created_at);
                            reducer::apply_in_place(&mut run, event);
                            Placement::Append(run)
                        }
                    }
                }
            }
        };

        tracing::trace!(
            session_id,
            run_id = %event.run_id,
            event = event.payload.name(),
            "Applied run event"
        );
        self.commit(&mut guard, session_id, ChangeScope::Streaming, |s| {
            place(s, session_id, placement);
        });
        true
    }

    /// Drop a session's live runs. No-op when there are none.
    pub fn clear_streaming_runs(&self, session_id: &str) -> bool {
        let mut guard = self.write();
        if guard.streaming_runs(session_id).is_empty() {
            return false;
        }
        self.commit(&mut guard, session_id, ChangeScope::Streaming, |s| {
            s.streaming_runs.remove(session_id);
        });
        true
    }

    /// Drop a session's unconfirmed placeholder runs.
    pub fn purge_temporary_runs(&self, session_id: &str) -> bool {
        let mut guard = self.write();
        let streaming = guard.streaming_runs(session_id);
        if !streaming.iter().any(RunRecord::is_temporary) {
            return false;
        }
        let kept: Vec<RunRecord> = streaming
            .iter()
            .filter(|r| !r.is_temporary())
            .cloned()
            .collect();
        self.commit(&mut guard, session_id, ChangeScope::Streaming, |s| {
            put_runs(&mut s.streaming_runs, session_id, kept);
        });
        true
    }

    /// Replace a session's streaming flags.
    pub fn set_session_state(&self, session_id: &str, state: SessionStreamingState) -> bool {
        self.update_session_state(session_id, |current| *current = state)
    }

    /// Edit a session's streaming flags in place.
    pub fn update_session_state(
        &self,
        session_id: &str,
        edit: impl FnOnce(&mut SessionStreamingState),
    ) -> bool {
        let mut guard = self.write();
        let current = guard.session_state(session_id);
        let mut next = current.clone();
        edit(&mut next);
        if next == current {
            return false;
        }
        self.commit(&mut guard, session_id, ChangeScope::StreamingState, |s| {
            put_state(s, session_id, next);
        });
        true
    }

    /// Append text to the session's streaming message.
    pub fn append_streaming_message(&self, session_id: &str, chunk: &str) -> bool {
        if chunk.is_empty() {
            return false;
        }
        self.update_session_state(session_id, |state| state.streaming_message.push_str(chunk))
    }

    /// Mark a session as streaming.
    ///
    /// # Errors
    /// Returns error if the store is gated and the backend is not
    /// authenticated.
    pub fn begin_stream(&self, session_id: &str) -> Result<bool, StoreError> {
        if let Some(auth) = &self.auth {
            let status = auth.get();
            if !status.allows_streaming() {
                tracing::warn!(session_id, ?status, "Refusing to begin stream");
                return Err(StoreError::StreamingDisabled(status));
            }
        }
        Ok(self.update_session_state(session_id, |state| {
            state.is_streaming = true;
            state.was_streamed = false;
            state.streaming_message.clear();
        }))
    }

    /// End a session's stream: flags flip and its live runs are cleared in
    /// one commit.
    pub fn end_stream(&self, session_id: &str) -> bool {
        self.close_stream(session_id, true)
    }

    /// Abandon a session's stream (failed start, user navigated away).
    pub fn abandon_stream(&self, session_id: &str) -> bool {
        self.close_stream(session_id, false)
    }

    /// Forget everything about a session.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let mut guard = self.write();
        let present = guard.history_runs.contains_key(session_id)
            || guard.streaming_runs.contains_key(session_id)
            || guard.session_states.contains_key(session_id);
        if !present {
            return false;
        }
        self.commit(&mut guard, session_id, ChangeScope::Session, |s| {
            s.history_runs.remove(session_id);
            s.streaming_runs.remove(session_id);
            s.session_states.remove(session_id);
        });
        true
    }

    fn close_stream(&self, session_id: &str, completed: bool) -> bool {
        let mut guard = self.write();
        let current = guard.session_state(session_id);
        let next = SessionStreamingState {
            is_streaming: false,
            was_streamed: if completed {
                current.is_streaming || current.was_streamed
            } else {
                current.was_streamed
            },
            streaming_message: current.streaming_message.clone(),
        };
        let state_changed = next != current;
        let runs_present = !guard.streaming_runs(session_id).is_empty();
        if !state_changed && !runs_present {
            return false;
        }

        let scope = match (state_changed, runs_present) {
            (true, true) => ChangeScope::Session,
            (true, false) => ChangeScope::StreamingState,
            _ => ChangeScope::Streaming,
        };
        self.commit(&mut guard, session_id, scope, |s| {
            put_state(s, session_id, next);
            s.streaming_runs.remove(session_id);
        });
        true
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<StoreSnapshot>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(
        &self,
        guard: &mut Arc<StoreSnapshot>,
        session_id: &str,
        scope: ChangeScope,
        apply: impl FnOnce(&mut StoreSnapshot),
    ) {
        let next = Arc::make_mut(guard);
        apply(next);
        next.revision += 1;

        let change = StoreChange {
            revision: next.revision,
            session_id: session_id.to_string(),
            scope,
        };
        // No subscribers is fine.
        let _ = self.sender.send(change);
    }
}

fn place(snapshot: &mut StoreSnapshot, session_id: &str, placement: Placement) {
    let runs = Arc::make_mut(
        snapshot
            .streaming_runs
            .entry(session_id.to_string())
            .or_default(),
    );
    match placement {
        Placement::Replace(idx, run) => runs[idx] = run,
        Placement::Append(run) => runs.push(run),
        Placement::Adopt { slot, stale, run } => {
            runs[slot] = run;
            runs.remove(stale);
        }
        Placement::Remove(idx) => {
            runs.remove(idx);
        }
    }
    if runs.is_empty() {
        snapshot.streaming_runs.remove(session_id);
    }
}

/// Carry what only the placeholder knows (requested kind and owner) onto
/// the confirmed record.
fn absorb_placeholder(run: &mut RunRecord, placeholder: &RunRecord) {
    run.kind = placeholder.kind;
    if run.owner_id.is_none() {
        run.owner_id.clone_from(&placeholder.owner_id);
    }
}

fn adoptable_placeholder(streaming: &[RunRecord], event: &RunEvent) -> Option<usize> {
    let EventPayload::Started {
        parent_run_id: None,
        ..
    } = &event.payload
    else {
        return None;
    };
    streaming.iter().position(|r| {
        r.is_temporary() && r.status == RunStatus::Pending && r.parent_run_id.is_none()
    })
}

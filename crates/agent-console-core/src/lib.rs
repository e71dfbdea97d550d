//! Core of the agent console client.
//!
//! This crate provides:
//! - `RunRecord` / `RunEvent` - Run data model and tagged realtime events
//! - `reducer` - Folds one event into a run record
//! - `tree` - Builds the run forest from flat records
//! - `StreamingRunStore` - Per-session history/live runs with no-op suppression
//! - `AuthStatusCell` - Observable backend connectivity/auth status
//! - History and launcher traits

pub mod auth;
pub mod context;
pub mod event;
pub mod reducer;
pub mod run;
pub mod store;
pub mod traits;
pub mod tree;

pub use auth::{AuthStatus, AuthStatusCell};
pub use context::RunRequest;
pub use event::{EventPayload, RunEvent};
pub use run::{RunContent, RunId, RunKind, RunRecord, RunStatus, SessionKey, StepResult, ToolCall};
pub use store::{SessionStreamingState, StoreChange, StoreError, StoreSnapshot, StreamingRunStore};
pub use traits::{EventStream, HistoryError, LaunchError, LaunchedRun, RunHistorySource, RunLauncher};
pub use tree::{RunForest, RunNode, build_forest, build_tree};

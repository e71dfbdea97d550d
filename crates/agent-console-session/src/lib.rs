//! Session orchestration for the agent console.
//!
//! Provides:
//! - `SessionManager` - Start runs, pump their events into the store, settle history
//! - Storage implementations (in-memory history, replay launcher)

pub mod manager;
pub mod storage;

pub use manager::{SessionError, SessionManager, StartedRun};

#[cfg(feature = "memory")]
pub use storage::{MemoryHistory, ReplayLauncher};

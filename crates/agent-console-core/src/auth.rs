//! Connectivity/auth status of the execution backend.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Backend connectivity/auth status.
///
/// `Loading` is initial. There is no terminal state: every state is
/// reachable from every other on the next relevant response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStatus {
    #[default]
    Loading,
    Authenticated,
    AuthFailed,
    MissingSecurityKey,
}

impl AuthStatus {
    /// Whether realtime streaming against the backend may begin.
    #[must_use]
    pub const fn allows_streaming(self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

/// Shared, observable auth status.
///
/// Cloning yields another handle to the same status. Writes that do not
/// change the value notify nobody.
#[derive(Debug, Clone)]
pub struct AuthStatusCell {
    tx: Arc<watch::Sender<AuthStatus>>,
}

impl Default for AuthStatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStatusCell {
    /// Create a cell in the `Loading` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AuthStatus::Loading);
        Self { tx: Arc::new(tx) }
    }

    /// Current status.
    #[must_use]
    pub fn get(&self) -> AuthStatus {
        *self.tx.borrow()
    }

    /// Set the status. Returns whether it changed.
    pub fn set(&self, status: AuthStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!(?status, "Backend auth status changed");
        }
        changed
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.tx.subscribe()
    }
}

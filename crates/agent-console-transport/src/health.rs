//! Backend-health interceptor for the execution backend.
//!
//! Never redirects. Derives [`AuthStatus`] from the status codes of the
//! calls it carries and leaves the decision to whoever reads the cell.

use std::sync::Arc;

use agent_console_core::{AuthStatus, AuthStatusCell};
use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::{
    collaborators::{NoticeLevel, Notifier},
    config::{ClientConfig, join_url},
    dispatcher::Transport,
    error::{Result, TransportError},
    protocol::{RequestDescriptor, ResponseDescriptor},
};

/// Which kind of backend endpoint a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Config,
    Health,
    Other,
}

/// Wraps a transport and keeps the backend auth status current.
pub struct BackendHealthInterceptor<T> {
    inner: T,
    status: AuthStatusCell,
    notifier: Arc<dyn Notifier>,
    base_url: Url,
    security_key: Option<String>,
    config_path: String,
    health_path: String,
}

impl<T: Transport> BackendHealthInterceptor<T> {
    /// Wrap a transport that talks to the execution backend.
    ///
    /// # Errors
    /// Returns error if the backend base URL does not parse.
    pub fn new(
        inner: T,
        config: &ClientConfig,
        status: AuthStatusCell,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let agent_os = &config.agent_os;
        Ok(Self {
            inner,
            status,
            notifier,
            base_url: agent_os.base()?,
            security_key: agent_os.security_key.clone().filter(|k| !k.is_empty()),
            config_path: agent_os.config_path.clone(),
            health_path: agent_os.health_path.clone(),
        })
    }

    /// The shared status this interceptor writes.
    #[must_use]
    pub const fn status(&self) -> &AuthStatusCell {
        &self.status
    }

    /// Absolute URL for a backend path.
    ///
    /// # Errors
    /// Returns error if `path` cannot be resolved against the base URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        join_url(&self.base_url, path)
    }

    /// Fetch the backend's config endpoint and return the resulting status.
    ///
    /// Unreachable backends are absorbed into the status; only the shared
    /// status is reported.
    pub async fn probe(&self) -> AuthStatus {
        let request = match self.url(&self.config_path) {
            Ok(url) => RequestDescriptor::get(url),
            Err(e) => {
                tracing::warn!(path = %self.config_path, error = %e, "Backend config path is not a valid URL");
                return self.status.get();
            }
        };
        match self.send(request).await {
            Ok(_) | Err(TransportError::BackendUnreachable { .. }) => {}
            Err(e) => tracing::warn!(error = %e, "Backend probe failed"),
        }
        self.status.get()
    }

    fn classify(&self, request: &RequestDescriptor) -> Endpoint {
        let path = request.path().trim_end_matches('/');
        if path.ends_with(self.config_path.trim_end_matches('/')) {
            Endpoint::Config
        } else if path.ends_with(self.health_path.trim_end_matches('/')) {
            Endpoint::Health
        } else {
            Endpoint::Other
        }
    }

    const fn failure_status(&self) -> AuthStatus {
        if self.security_key.is_some() {
            AuthStatus::AuthFailed
        } else {
            AuthStatus::MissingSecurityKey
        }
    }

    fn observe(&self, endpoint: Endpoint, response: &ResponseDescriptor) {
        if response.status == StatusCode::UNAUTHORIZED {
            let status = self.failure_status();
            if self.status.set(status) {
                let message = match status {
                    AuthStatus::MissingSecurityKey => "The backend requires a security key",
                    _ => "The backend rejected the security key",
                };
                self.notifier.notify(NoticeLevel::Warning, message);
            }
            return;
        }
        if !response.is_success() {
            return;
        }
        let previous = self.status.get();
        // Health alone does not prove the key is accepted on first contact,
        // but it does prove the backend is back after a failure.
        if endpoint == Endpoint::Health && previous == AuthStatus::Loading {
            return;
        }
        if self.status.set(AuthStatus::Authenticated)
            && matches!(
                previous,
                AuthStatus::AuthFailed | AuthStatus::MissingSecurityKey
            )
        {
            self.notifier
                .notify(NoticeLevel::Info, "Connected to the backend");
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for BackendHealthInterceptor<T> {
    async fn send(&self, request: RequestDescriptor) -> Result<ResponseDescriptor> {
        let endpoint = self.classify(&request);
        let request = match &self.security_key {
            Some(key) => request.header("authorization", format!("Bearer {key}")),
            None => request,
        };
        let url = request.url.to_string();

        match self.inner.send(request).await {
            Ok(response) => {
                self.observe(endpoint, &response);
                Ok(response)
            }
            Err(e) if endpoint != Endpoint::Other => {
                tracing::warn!(%url, error = %e, "Backend unreachable");
                self.status.set(self.failure_status());
                self.notifier
                    .notify(NoticeLevel::Error, "Could not connect to the backend");
                Err(TransportError::BackendUnreachable {
                    url,
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

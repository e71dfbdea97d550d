//! External collaborators the interceptors call out to.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::config::ClientConfig;

/// Flat attribute map attached to telemetry events.
pub type TelemetryAttributes = BTreeMap<&'static str, String>;

/// Reports whether the network is reachable at all.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Reports the route the user is currently on.
pub trait RouteProvider: Send + Sync {
    fn current_route(&self) -> String;
}

/// Signs the user out and navigates to a target path.
pub trait SignOutHook: Send + Sync {
    fn sign_out(&self, redirect_to: &str);
}

/// Best-effort telemetry. Implementations swallow their own failures.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &str, attributes: &TelemetryAttributes);
}

/// Toast severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// User-visible toast notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);
}

/// Network flag that can be flipped by whatever watches connectivity.
#[derive(Debug, Clone)]
pub struct NetworkFlag {
    online: Arc<AtomicBool>,
}

impl Default for NetworkFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkFlag {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl NetworkMonitor for NetworkFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Current route held in shared state; the router updates it.
#[derive(Debug, Clone, Default)]
pub struct CurrentRoute {
    route: Arc<RwLock<String>>,
}

impl CurrentRoute {
    #[must_use]
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: Arc::new(RwLock::new(route.into())),
        }
    }

    pub fn navigate(&self, route: impl Into<String>) {
        *self.route.write().unwrap_or_else(PoisonError::into_inner) = route.into();
    }
}

impl RouteProvider for CurrentRoute {
    fn current_route(&self) -> String {
        self.route
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Telemetry sink that emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &str, attributes: &TelemetryAttributes) {
        tracing::info!(target: "agent_console::telemetry", event, ?attributes, "telemetry");
    }
}

/// Notifier that logs toasts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => tracing::info!(toast = message, "Notification"),
            NoticeLevel::Warning => tracing::warn!(toast = message, "Notification"),
            NoticeLevel::Error => tracing::error!(toast = message, "Notification"),
        }
    }
}

/// Sign-out hook that only logs the redirect.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSignOut;

impl SignOutHook for LogSignOut {
    fn sign_out(&self, redirect_to: &str) {
        tracing::warn!(redirect_to, "Signing out");
    }
}

/// Decides which requests and routes take part in credential refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    pub refresh_path: String,
    pub auth_path_prefixes: Vec<String>,
    pub public_routes: Vec<String>,
    pub auth_routes: Vec<String>,
    pub sign_in_route: String,
}

impl From<&ClientConfig> for RoutePolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            refresh_path: config.refresh_path.clone(),
            auth_path_prefixes: config.auth_path_prefixes.clone(),
            public_routes: config.public_routes.clone(),
            auth_routes: config.auth_routes.clone(),
            sign_in_route: config.sign_in_route.clone(),
        }
    }
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl RoutePolicy {
    /// Whether a request path is the refresh endpoint.
    #[must_use]
    pub fn is_refresh_path(&self, path: &str) -> bool {
        path.trim_end_matches('/') == self.refresh_path.trim_end_matches('/')
    }

    /// Whether a request path belongs to the auth domain.
    #[must_use]
    pub fn is_auth_path(&self, path: &str) -> bool {
        self.auth_path_prefixes
            .iter()
            .any(|prefix| path_has_prefix(path, prefix))
    }

    /// Whether an unauthenticated response is expected on this route, in
    /// which case a 401 neither refreshes nor redirects.
    #[must_use]
    pub fn unauthenticated_expected(&self, route: &str) -> bool {
        let route = route.split(['?', '#']).next().unwrap_or(route);
        self.public_routes.iter().any(|r| r == route)
            || self.auth_routes.iter().any(|r| path_has_prefix(route, r))
    }
}

/// Segment-aware prefix match: `/api/auth` matches `/api/auth/refresh`
/// but not `/api/authors`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

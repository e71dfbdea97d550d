//! Session-resilient request layer.
//!
//! Provides:
//! - `Transport` - The dispatcher primitive, backed by `reqwest`
//! - `CredentialRefreshInterceptor` - Refresh-once-then-retry on 401
//! - `BackendHealthInterceptor` - Backend auth status from response codes
//! - `HttpHistorySource` - Run history over any transport
//! - Collaborator traits (network, routes, sign-out, telemetry, toasts)

pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod history;
pub mod protocol;
pub mod refresh;

pub use collaborators::{
    CurrentRoute, LogNotifier, LogSignOut, NetworkFlag, NetworkMonitor, NoticeLevel, Notifier,
    RouteProvider, RoutePolicy, SignOutHook, TelemetryAttributes, TelemetrySink,
    TracingTelemetry,
};
pub use config::{AgentOsConfig, ClientConfig, RefreshMode};
pub use dispatcher::{HttpTransport, Transport};
pub use error::{Result, TransportError};
pub use health::BackendHealthInterceptor;
pub use history::HttpHistorySource;
pub use protocol::{Envelope, RequestDescriptor, ResponseDescriptor};
pub use refresh::{CredentialRefreshInterceptor, Recovery, RefreshFailure, RefreshHooks};

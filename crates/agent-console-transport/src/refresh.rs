//! Credential-refresh interceptor.
//!
//! On a 401 from a protected call, refreshes credentials once and retries
//! the original request once. Failed refreshes redirect to sign-in and hand
//! the caller its original response.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use reqwest::StatusCode;
use url::Url;

use crate::{
    collaborators::{
        NetworkMonitor, RouteProvider, RoutePolicy, SignOutHook, TelemetryAttributes,
        TelemetrySink,
    },
    config::{ClientConfig, RefreshMode},
    dispatcher::Transport,
    error::{Result, TransportError},
    protocol::{RequestDescriptor, ResponseDescriptor},
};

/// Telemetry event for failed API responses.
pub const API_FAILURE_EVENT: &str = "api_request_failed";

/// Why a refresh did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    Network(String),
    Status(StatusCode),
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(reason) => write!(f, "network error: {reason}"),
            Self::Status(status) => write!(f, "refresh endpoint returned {status}"),
        }
    }
}

type RefreshOutcome = std::result::Result<(), RefreshFailure>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// What the interceptor did about a 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// The response was not a refresh-eligible 401.
    NotNeeded,
    /// Another refresh held the guard flag; the 401 was returned as is.
    Suppressed,
    /// Credentials were refreshed (here or by a concurrent caller) and the
    /// request retried.
    Retried,
    /// The retry was unauthorized again; the user was sent to sign-in.
    RetryUnauthorized,
    /// The refresh failed; the user was sent to sign-in.
    RefreshFailed(RefreshFailure),
}

/// Collaborators the interceptor needs besides the transport.
#[derive(Clone)]
pub struct RefreshHooks {
    pub network: Arc<dyn NetworkMonitor>,
    pub routes: Arc<dyn RouteProvider>,
    pub sign_out: Arc<dyn SignOutHook>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// Resets the guard flag even if the refreshing future is dropped.
struct GuardReset<'a>(&'a AtomicBool);

impl Drop for GuardReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Credential-refresh interceptor.
pub struct CredentialRefreshInterceptor<T: Transport + 'static> {
    inner: Arc<T>,
    refresh_url: Url,
    policy: RoutePolicy,
    mode: RefreshMode,
    hooks: RefreshHooks,
    /// Guarded mode: set while this instance is refreshing.
    refreshing: AtomicBool,
    /// Single-flight mode: the refresh every concurrent 401 awaits.
    in_flight: Mutex<Option<SharedRefresh>>,
    /// Bumped on every successful refresh.
    generation: AtomicU64,
}

impl<T: Transport + 'static> fmt::Debug for CredentialRefreshInterceptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRefreshInterceptor")
            .field("refresh_url", &self.refresh_url)
            .field("mode", &self.mode)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> CredentialRefreshInterceptor<T> {
    /// Wrap a transport.
    ///
    /// # Errors
    /// Returns error if the configured refresh URL does not parse.
    pub fn new(inner: T, config: &ClientConfig, hooks: RefreshHooks) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(inner),
            refresh_url: config.refresh_url()?,
            policy: RoutePolicy::from(config),
            mode: config.refresh_mode,
            hooks,
            refreshing: AtomicBool::new(false),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Number of successful refreshes so far.
    #[must_use]
    pub fn refresh_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Send a request and report what happened about authorization.
    ///
    /// # Errors
    /// Returns `Offline` without calling out when the network is down, and
    /// propagates transport failures of the original call or the retry.
    pub async fn dispatch(
        &self,
        request: RequestDescriptor,
    ) -> Result<(ResponseDescriptor, Recovery)> {
        if !self.hooks.network.is_online() {
            tracing::debug!(url = %request.url, "Offline, not dispatching");
            return Err(TransportError::Offline);
        }

        let generation = self.refresh_generation();
        let response = self.inner.send(request.clone()).await?;

        let (response, recovery) =
            if response.status == StatusCode::UNAUTHORIZED && self.refresh_eligible(&request) {
                self.recover(&request, response, generation).await?
            } else {
                (response, Recovery::NotNeeded)
            };

        self.report_failure(&request, &response);
        Ok((response, recovery))
    }

    /// Send a request and map unrecovered failures to typed errors.
    ///
    /// # Errors
    /// Besides [`Self::dispatch`] errors: `RefreshFailed`, `RetryFailed`,
    /// `AuthExpired` for unrecovered 401s and `Api` for other non-2xx
    /// responses.
    pub async fn send_checked(&self, request: RequestDescriptor) -> Result<ResponseDescriptor> {
        let url = request.url.to_string();
        let (response, recovery) = self.dispatch(request).await?;
        match recovery {
            Recovery::RefreshFailed(failure) => Err(TransportError::RefreshFailed {
                reason: failure.to_string(),
            }),
            Recovery::RetryUnauthorized => Err(TransportError::RetryFailed { url }),
            Recovery::Suppressed => Err(TransportError::AuthExpired { url }),
            Recovery::NotNeeded | Recovery::Retried => response.error_for_status(),
        }
    }

    fn refresh_eligible(&self, request: &RequestDescriptor) -> bool {
        let path = request.path();
        if self.policy.is_refresh_path(path) || self.policy.is_auth_path(path) {
            return false;
        }
        let route = self.hooks.routes.current_route();
        !self.policy.unauthenticated_expected(&route)
    }

    async fn recover(
        &self,
        request: &RequestDescriptor,
        original: ResponseDescriptor,
        generation: u64,
    ) -> Result<(ResponseDescriptor, Recovery)> {
        let outcome = match self.mode {
            RefreshMode::SingleFlight => {
                if self.refresh_generation() == generation {
                    self.refresh_single_flight().await
                } else {
                    // Credentials were renewed after this request went out.
                    tracing::debug!(url = %request.url, "Refresh already happened, retrying");
                    Ok(())
                }
            }
            RefreshMode::Guarded => {
                if self.refreshing.swap(true, Ordering::AcqRel) {
                    tracing::debug!(url = %request.url, "Refresh in progress, returning 401");
                    return Ok((original, Recovery::Suppressed));
                }
                let _reset = GuardReset(&self.refreshing);
                let outcome = refresh(Arc::clone(&self.inner), self.refresh_request()).await;
                if outcome.is_ok() {
                    self.generation.fetch_add(1, Ordering::AcqRel);
                }
                outcome
            }
        };

        match outcome {
            Ok(()) => {
                let retried = self.inner.send(request.clone()).await?;
                if retried.status == StatusCode::UNAUTHORIZED {
                    tracing::warn!(url = %request.url, "Still unauthorized after refresh");
                    self.redirect_to_sign_in();
                    Ok((retried, Recovery::RetryUnauthorized))
                } else {
                    Ok((retried, Recovery::Retried))
                }
            }
            Err(failure) => {
                tracing::warn!(url = %request.url, %failure, "Credential refresh failed");
                self.redirect_to_sign_in();
                Ok((original, Recovery::RefreshFailed(failure)))
            }
        }
    }

    async fn refresh_single_flight(&self) -> RefreshOutcome {
        let shared = {
            let mut slot = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = slot.as_ref() {
                tracing::debug!("Joining in-flight refresh");
                existing.clone()
            } else {
                let shared = refresh(Arc::clone(&self.inner), self.refresh_request())
                    .boxed()
                    .shared();
                *slot = Some(shared.clone());
                shared
            }
        };

        let outcome = shared.clone().await;

        let mut slot = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&shared)) {
            *slot = None;
            if outcome.is_ok() {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
        }
        outcome
    }

    fn refresh_request(&self) -> RequestDescriptor {
        RequestDescriptor::post(self.refresh_url.clone())
    }

    fn redirect_to_sign_in(&self) {
        self.hooks.sign_out.sign_out(&self.policy.sign_in_route);
    }

    fn report_failure(&self, request: &RequestDescriptor, response: &ResponseDescriptor) {
        if response.is_success() {
            return;
        }
        let path = request.path();
        if self.policy.is_auth_path(path) || self.policy.is_refresh_path(path) {
            return;
        }
        let attributes: TelemetryAttributes = [
            ("url", request.url.to_string()),
            ("method", request.method.to_string()),
            ("status", response.status.as_u16().to_string()),
        ]
        .into_iter()
        .collect();
        self.hooks.telemetry.record(API_FAILURE_EVENT, &attributes);
    }
}

async fn refresh<T: Transport + ?Sized>(
    transport: Arc<T>,
    request: RequestDescriptor,
) -> RefreshOutcome {
    tracing::info!(url = %request.url, "Refreshing credentials");
    match transport.send(request).await {
        Ok(response) if response.is_success() => Ok(()),
        Ok(response) => Err(RefreshFailure::Status(response.status)),
        Err(e) => Err(RefreshFailure::Network(e.to_string())),
    }
}

#[async_trait]
impl<T: Transport + 'static> Transport for CredentialRefreshInterceptor<T> {
    async fn send(&self, request: RequestDescriptor) -> Result<ResponseDescriptor> {
        self.dispatch(request).await.map(|(response, _)| response)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use tokio::sync::Notify;

    use super::*;
    use crate::collaborators::{CurrentRoute, NetworkFlag};

    const API: &str = "http://localhost:3000";

    /// Scripted transport: per-path queues of statuses, with an optional
    /// gate the refresh call waits on.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<Vec<(String, VecDeque<StatusCode>)>>,
        calls: Mutex<Vec<String>>,
        refresh_gate: Option<Arc<Notify>>,
    }

    impl Scripted {
        fn on(self, path: &str, statuses: &[StatusCode]) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push((path.to_string(), statuses.iter().copied().collect()));
            self
        }

        fn calls_to(&self, path: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|p| *p == path).count()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, request: RequestDescriptor) -> Result<ResponseDescriptor> {
            let path = request.path().to_string();
            self.calls.lock().unwrap().push(path.clone());
            if path == "/api/auth/refresh" {
                if let Some(gate) = &self.refresh_gate {
                    gate.notified().await;
                }
            }
            let status = {
                let mut responses = self.responses.lock().unwrap();
                responses
                    .iter_mut()
                    .find(|(p, _)| *p == path)
                    .and_then(|(_, queue)| {
                        if queue.len() > 1 {
                            queue.pop_front()
                        } else {
                            queue.front().copied()
                        }
                    })
                    .unwrap_or(StatusCode::OK)
            };
            Ok(ResponseDescriptor::new(status, request.url))
        }
    }

    #[derive(Default)]
    struct Recorder {
        sign_outs: Mutex<Vec<String>>,
        events: Mutex<Vec<TelemetryAttributes>>,
    }

    impl SignOutHook for Recorder {
        fn sign_out(&self, redirect_to: &str) {
            self.sign_outs.lock().unwrap().push(redirect_to.to_string());
        }
    }

    impl TelemetrySink for Recorder {
        fn record(&self, _event: &str, attributes: &TelemetryAttributes) {
            self.events.lock().unwrap().push(attributes.clone());
        }
    }

    struct Harness {
        interceptor: CredentialRefreshInterceptor<Scripted>,
        recorder: Arc<Recorder>,
        route: CurrentRoute,
        network: NetworkFlag,
    }

    fn harness(transport: Scripted, mode: RefreshMode) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let route = CurrentRoute::new("/agents");
        let network = NetworkFlag::default();
        let config = ClientConfig {
            api_base_url: API.to_string(),
            refresh_mode: mode,
            ..ClientConfig::default()
        };
        let hooks = RefreshHooks {
            network: Arc::new(network.clone()),
            routes: Arc::new(route.clone()),
            sign_out: recorder.clone(),
            telemetry: recorder.clone(),
        };
        Harness {
            interceptor: CredentialRefreshInterceptor::new(transport, &config, hooks).unwrap(),
            recorder,
            route,
            network,
        }
    }

    fn get(path: &str) -> RequestDescriptor {
        RequestDescriptor::get(Url::parse(API).unwrap().join(path).unwrap())
    }

    #[tokio::test]
    async fn test_refresh_then_single_retry() {
        let transport = Scripted::default().on(
            "/api/agents",
            &[StatusCode::UNAUTHORIZED, StatusCode::OK],
        );
        let h = harness(transport, RefreshMode::SingleFlight);

        let (response, recovery) = h.interceptor.dispatch(get("/api/agents")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(recovery, Recovery::Retried);
        assert_eq!(h.interceptor.inner.calls_to("/api/auth/refresh"), 1);
        assert_eq!(h.interceptor.inner.calls_to("/api/agents"), 2);
        assert_eq!(h.interceptor.refresh_generation(), 1);
        assert!(h.recorder.sign_outs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_still_unauthorized_redirects() {
        let transport = Scripted::default().on("/api/agents", &[StatusCode::UNAUTHORIZED]);
        let h = harness(transport, RefreshMode::SingleFlight);

        let (response, recovery) = h.interceptor.dispatch(get("/api/agents")).await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(recovery, Recovery::RetryUnauthorized);
        assert_eq!(h.interceptor.inner.calls_to("/api/agents"), 2);
        assert_eq!(*h.recorder.sign_outs.lock().unwrap(), ["/sign-in"]);
    }

    #[tokio::test]
    async fn test_failed_refresh_returns_original_response() {
        let transport = Scripted::default()
            .on("/api/agents", &[StatusCode::UNAUTHORIZED])
            .on("/api/auth/refresh", &[StatusCode::FORBIDDEN]);
        let h = harness(transport, RefreshMode::SingleFlight);

        let (response, recovery) = h.interceptor.dispatch(get("/api/agents")).await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            recovery,
            Recovery::RefreshFailed(RefreshFailure::Status(StatusCode::FORBIDDEN))
        );
        assert_eq!(h.interceptor.inner.calls_to("/api/agents"), 1);
        assert_eq!(h.recorder.sign_outs.lock().unwrap().len(), 1);
        assert_eq!(h.interceptor.refresh_generation(), 0);
    }

    #[tokio::test]
    async fn test_public_route_never_refreshes() {
        let transport = Scripted::default().on("/api/agents", &[StatusCode::UNAUTHORIZED]);
        let h = harness(transport, RefreshMode::SingleFlight);
        h.route.navigate("/sign-in");

        let (response, recovery) = h.interceptor.dispatch(get("/api/agents")).await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(recovery, Recovery::NotNeeded);
        assert_eq!(h.interceptor.inner.calls_to("/api/auth/refresh"), 0);
        assert!(h.recorder.sign_outs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_domain_401_is_not_refreshed_or_reported() {
        let transport = Scripted::default().on("/api/auth/session", &[StatusCode::UNAUTHORIZED]);
        let h = harness(transport, RefreshMode::SingleFlight);

        let (_, recovery) = h.interceptor.dispatch(get("/api/auth/session")).await.unwrap();

        assert_eq!(recovery, Recovery::NotNeeded);
        assert_eq!(h.interceptor.inner.calls_to("/api/auth/refresh"), 0);
        assert!(h.recorder.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_fails_fast() {
        let h = harness(Scripted::default(), RefreshMode::SingleFlight);
        h.network.set_online(false);

        let err = h.interceptor.dispatch(get("/api/agents")).await.unwrap_err();

        assert!(matches!(err, TransportError::Offline));
        assert!(h.interceptor.inner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let transport = Scripted::default().on("/api/billing", &[StatusCode::INTERNAL_SERVER_ERROR]);
        let h = harness(transport, RefreshMode::SingleFlight);

        h.interceptor.dispatch(get("/api/billing")).await.unwrap();

        let events = h.recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["status"], "500");
        assert_eq!(events[0]["method"], "GET");
        assert_eq!(events[0]["url"], format!("{API}/api/billing"));
    }

    #[tokio::test]
    async fn test_send_checked_maps_outcomes() {
        let transport = Scripted::default()
            .on("/api/agents", &[StatusCode::UNAUTHORIZED])
            .on("/api/auth/refresh", &[StatusCode::UNAUTHORIZED]);
        let h = harness(transport, RefreshMode::SingleFlight);

        let err = h.interceptor.send_checked(get("/api/agents")).await.unwrap_err();
        assert!(matches!(err, TransportError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn test_single_flight_shares_one_refresh() {
        let gate = Arc::new(Notify::new());
        let transport = Scripted {
            refresh_gate: Some(Arc::clone(&gate)),
            ..Scripted::default()
        }
        .on("/api/a", &[StatusCode::UNAUTHORIZED, StatusCode::OK])
        .on("/api/b", &[StatusCode::UNAUTHORIZED, StatusCode::OK]);
        let h = Arc::new(harness(transport, RefreshMode::SingleFlight));

        let first = tokio::spawn({
            let h = Arc::clone(&h);
            async move { h.interceptor.dispatch(get("/api/a")).await }
        });
        let second = tokio::spawn({
            let h = Arc::clone(&h);
            async move { h.interceptor.dispatch(get("/api/b")).await }
        });

        // Let both requests hit their 401 and park on the refresh.
        while h.interceptor.inner.calls_to("/api/b") == 0 || h.interceptor.inner.calls_to("/api/a") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        let (a, _) = first.await.unwrap().unwrap();
        let (b, _) = second.await.unwrap().unwrap();
        assert_eq!(a.status, StatusCode::OK);
        assert_eq!(b.status, StatusCode::OK);
        assert_eq!(h.interceptor.inner.calls_to("/api/auth/refresh"), 1);
        assert_eq!(h.interceptor.refresh_generation(), 1);
    }

    #[tokio::test]
    async fn test_guarded_mode_returns_401_while_refreshing() {
        let gate = Arc::new(Notify::new());
        let transport = Scripted {
            refresh_gate: Some(Arc::clone(&gate)),
            ..Scripted::default()
        }
        .on("/api/a", &[StatusCode::UNAUTHORIZED, StatusCode::OK])
        .on("/api/b", &[StatusCode::UNAUTHORIZED]);
        let h = Arc::new(harness(transport, RefreshMode::Guarded));

        let first = tokio::spawn({
            let h = Arc::clone(&h);
            async move { h.interceptor.dispatch(get("/api/a")).await }
        });
        while h.interceptor.inner.calls_to("/api/auth/refresh") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (b, recovery) = h.interceptor.dispatch(get("/api/b")).await.unwrap();
        assert_eq!(b.status, StatusCode::UNAUTHORIZED);
        assert_eq!(recovery, Recovery::Suppressed);

        gate.notify_one();
        let (a, recovery) = first.await.unwrap().unwrap();
        assert_eq!(a.status, StatusCode::OK);
        assert_eq!(recovery, Recovery::Retried);
        assert_eq!(h.interceptor.inner.calls_to("/api/auth/refresh"), 1);
    }
}

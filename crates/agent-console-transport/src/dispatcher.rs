//! Request dispatcher: the HTTP call primitive every component goes
//! through.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    config::ClientConfig,
    error::Result,
    protocol::{RequestDescriptor, ResponseDescriptor},
};

/// Sends one request and returns the response, whatever its status.
///
/// Interceptors implement this trait too, so they stack.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RequestDescriptor) -> Result<ResponseDescriptor>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: RequestDescriptor) -> Result<ResponseDescriptor> {
        (**self).send(request).await
    }
}

/// `reqwest`-backed transport with a cookie store, so refresh calls carry
/// the same credentials as ordinary calls.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport from configuration.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { http })
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: RequestDescriptor) -> Result<ResponseDescriptor> {
        let RequestDescriptor {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.http.request(method.clone(), url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let final_url = response.url().clone();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        tracing::debug!(%method, url = %final_url, status = status.as_u16(), "HTTP response");

        Ok(ResponseDescriptor {
            status,
            url: final_url,
            headers,
            body,
        })
    }
}

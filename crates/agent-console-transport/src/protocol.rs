//! Request and response descriptors exchanged with the dispatcher.

use std::collections::BTreeMap;

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

use crate::error::TransportError;

/// Outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

impl RequestDescriptor {
    /// Create a request with no headers or body.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// GET request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// POST request.
    #[must_use]
    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    /// Add a header, replacing any previous value.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a raw body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON body and content type.
    ///
    /// # Errors
    /// Returns error if the value cannot be serialized.
    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, TransportError> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("content-type", "application/json").body(body))
    }

    /// Path component of the URL, without query or fragment.
    #[must_use]
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

/// Response as returned by the underlying transport.
///
/// Non-2xx statuses are responses, not errors, at this level; interceptors
/// inspect them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub status: StatusCode,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl ResponseDescriptor {
    /// Create a response with an empty body.
    #[must_use]
    pub fn new(status: StatusCode, url: Url) -> Self {
        Self {
            status,
            url,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    /// Returns error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Decode a `{ data, meta }` envelope.
    ///
    /// # Errors
    /// Returns error if the body is not an envelope around `T`.
    pub fn envelope<T: DeserializeOwned>(&self) -> Result<Envelope<T>, TransportError> {
        self.json()
    }

    /// Turn a non-2xx response into a typed error.
    ///
    /// # Errors
    /// Returns `TransportError::Api` for non-2xx statuses.
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Api {
                status: self.status.as_u16(),
                message: self.text(),
            })
        }
    }
}

/// Standard backend response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

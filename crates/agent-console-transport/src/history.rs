//! Run history fetched from the execution backend.

use agent_console_core::{HistoryError, RunHistorySource, RunRecord};
use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::{
    config::ClientConfig,
    dispatcher::Transport,
    protocol::{Envelope, RequestDescriptor},
};

const SESSION_ID_SEGMENT: &str = "{session_id}";

/// [`RunHistorySource`] that reads `{ data: [RunRecord] }` envelopes over
/// any [`Transport`], usually the health interceptor.
pub struct HttpHistorySource<T> {
    transport: T,
    base_url: Url,
    runs_path: String,
}

impl<T: Transport> HttpHistorySource<T> {
    /// Read history through `transport` from the configured backend.
    ///
    /// # Errors
    /// Returns error if the backend base URL does not parse or cannot carry
    /// a path.
    pub fn new(transport: T, config: &ClientConfig) -> crate::error::Result<Self> {
        let base_url = config.agent_os.base()?;
        if base_url.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
        }
        Ok(Self {
            transport,
            base_url,
            runs_path: config.agent_os.session_runs_path.clone(),
        })
    }

    /// The session id always lands in a single path segment, percent-encoded.
    fn runs_url(&self, session_id: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            for segment in self.runs_path.split('/').filter(|s| !s.is_empty()) {
                if segment == SESSION_ID_SEGMENT {
                    segments.push(session_id);
                } else {
                    segments.push(segment);
                }
            }
        }
        url
    }
}

#[async_trait]
impl<T: Transport> RunHistorySource for HttpHistorySource<T> {
    async fn fetch_runs(&self, session_id: &str) -> Result<Vec<RunRecord>, HistoryError> {
        let url = self.runs_url(session_id);
        let response = self
            .transport
            .send(RequestDescriptor::get(url))
            .await
            .map_err(|e| HistoryError::Unavailable(e.to_string()))?;

        if response.status == StatusCode::NOT_FOUND {
            return Err(HistoryError::NotFound(session_id.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| HistoryError::Unavailable(e.to_string()))?;
        let envelope: Envelope<Vec<RunRecord>> = response
            .envelope()
            .map_err(|e| HistoryError::Unavailable(e.to_string()))?;

        tracing::debug!(session_id, runs = envelope.data.len(), "Fetched run history");
        Ok(envelope.data)
    }
}

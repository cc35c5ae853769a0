//! HTTP dispatch transport.
//!
//! POSTs the dispatch request to the schedule's configured url. The
//! receiver is expected to acknowledge with `202 Accepted` immediately and
//! report the final outcome later through the status ingress.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use super::{DispatchRequest, SyncTransport, TransportError};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Synchronous HTTP transport backed by a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the default request timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a transport with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn start(&self, url: &str, request: &DispatchRequest) -> Result<(), TransportError> {
        tracing::debug!(url, job = %request.job, "sending schedule start request");

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Request(format!("post to {} failed: {}", url, e)))?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(TransportError::UnexpectedStatus(response.status().as_u16()));
        }

        Ok(())
    }
}

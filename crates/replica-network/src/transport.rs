//! Sending requests over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::{NetworkError, NetworkRequest, NetworkResponse};

/// Performs one request and reports the raw response.
///
/// Non-success statuses are returned as responses, not errors, so the
/// executor can recognize authorization failures. Dropping the returned
/// future cancels the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &NetworkRequest,
        token: Option<&str>,
    ) -> Result<NetworkResponse, NetworkError>;
}

/// [`Transport`] backed by a `reqwest` client.
pub struct ReqwestTransport {
    http: Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Create a transport for the given base URL with default timeouts.
    pub fn new(base_url: impl Into<String>) -> Result<Self, NetworkError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &NetworkRequest,
        token: Option<&str>,
    ) -> Result<NetworkResponse, NetworkError> {
        let url = self.url(&request.path);
        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        let body = response.text().await?;
        debug!(method = %request.method, url = %url, status, "request completed");

        Ok(NetworkResponse {
            status,
            body,
            retry_after_secs,
        })
    }
}

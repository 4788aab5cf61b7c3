//! Transport-neutral request and response values.

use reqwest::Method;
use serde::de::DeserializeOwned;

use crate::NetworkError;

/// A request to run through a [`Transport`](crate::Transport).
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub method: Method,
    /// Path appended to the transport's base URL, or an absolute URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Attach the current access token.
    pub requires_auth: bool,
    /// This request is the credential refresh call itself.
    pub is_refresh: bool,
}

impl NetworkRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            requires_auth: true,
            is_refresh: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Option<serde_json::Value>) -> Self {
        Self {
            body,
            ..Self::new(Method::POST, path)
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Send without credentials.
    pub fn without_auth(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    /// Mark as the refresh call; auth failures on it never trigger another refresh.
    pub fn refresh(mut self) -> Self {
        self.is_refresh = true;
        self
    }
}

/// A response as reported by a transport, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkResponse {
    pub status: u16,
    pub body: String,
    /// Parsed Retry-After header.
    pub retry_after_secs: Option<u64>,
}

impl NetworkResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after_secs: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-success status into an error.
    pub fn error_for_status(self) -> Result<Self, NetworkError> {
        if self.status == 429 {
            return Err(NetworkError::RateLimited {
                retry_after_secs: self.retry_after_secs,
            });
        }
        if !self.is_success() {
            return Err(NetworkError::Status {
                status: self.status,
                body: self.body,
            });
        }
        Ok(self)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

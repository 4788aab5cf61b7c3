//! Access tokens and how to renew them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{NetworkError, NetworkRequest, Transport};

/// Supplies the current access token and renews it on demand.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Token to attach to requests that require credentials.
    async fn access_token(&self) -> Option<String>;

    /// Obtain a new access token.
    async fn refresh(&self) -> Result<(), NetworkError>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken", alias = "accessJwt")]
    access_token: String,
}

/// Bearer token credentials, optionally renewed by POSTing a refresh token
/// to a refresh endpoint.
///
/// The endpoint must answer with `{"access_token": "..."}`.
pub struct BearerCredentials {
    access_token: RwLock<Option<String>>,
    refresh: Option<RefreshEndpoint>,
}

struct RefreshEndpoint {
    transport: Arc<dyn Transport>,
    path: String,
    refresh_token: String,
}

impl BearerCredentials {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            access_token: RwLock::new(access_token),
            refresh: None,
        }
    }

    /// Renew through `path` on `transport`, authenticating with `refresh_token`.
    pub fn with_refresh(
        mut self,
        transport: Arc<dyn Transport>,
        path: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        self.refresh = Some(RefreshEndpoint {
            transport,
            path: path.into(),
            refresh_token: refresh_token.into(),
        });
        self
    }

    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }
}

#[async_trait]
impl CredentialProvider for BearerCredentials {
    async fn access_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    async fn refresh(&self) -> Result<(), NetworkError> {
        let endpoint = self
            .refresh
            .as_ref()
            .ok_or_else(|| NetworkError::Refresh("no refresh endpoint configured".to_string()))?;

        let request = NetworkRequest::post(endpoint.path.clone(), None).refresh();
        let response = endpoint
            .transport
            .send(&request, Some(&endpoint.refresh_token))
            .await?;
        if !response.is_success() {
            return Err(NetworkError::Refresh(format!(
                "refresh failed ({}): {}",
                response.status, response.body
            )));
        }

        let session: RefreshResponse = response.json()?;
        debug!("refreshed access token");
        *self.access_token.write().await = Some(session.access_token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReqwestTransport;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_refresh_without_endpoint_fails() {
        let credentials = BearerCredentials::new(Some("token".to_string()));
        let result = credentials.refresh().await;

        assert!(matches!(result, Err(NetworkError::Refresh(_))));
        assert_eq!(credentials.access_token().await.as_deref(), Some("token"));
    }

    #[tokio::test]
    async fn test_refresh_replaces_access_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(header("Authorization", "Bearer refresh-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessJwt": "renewed"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = Arc::new(ReqwestTransport::new(mock_server.uri()).unwrap());
        let credentials = BearerCredentials::new(Some("expired".to_string())).with_refresh(
            transport,
            "/auth/refresh",
            "refresh-secret",
        );

        credentials.refresh().await.unwrap();
        assert_eq!(credentials.access_token().await.as_deref(), Some("renewed"));
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_string("revoked"))
            .mount(&mock_server)
            .await;

        let transport = Arc::new(ReqwestTransport::new(mock_server.uri()).unwrap());
        let credentials = BearerCredentials::new(Some("expired".to_string())).with_refresh(
            transport,
            "/auth/refresh",
            "refresh-secret",
        );

        let err = credentials.refresh().await.unwrap_err();
        assert_eq!(err.to_string(), "credential refresh failed: refresh failed (401): revoked");
        assert_eq!(credentials.access_token().await.as_deref(), Some("expired"));
    }
}

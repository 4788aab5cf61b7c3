//! Request execution with single-flight credential refresh.
//!
//! A request that fails authorization triggers one credential refresh and is
//! retried once. Concurrent failures share a single refresh: requests failing
//! while a refresh runs join it, and requests that were already in flight
//! when it started join it even after it finished, since they were sent with
//! the old token.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{CredentialProvider, NetworkError, NetworkRequest, NetworkResponse, Transport};

/// Called once per failed refresh attempt.
pub type RefreshFailedCallback = Arc<dyn Fn(&NetworkError) + Send + Sync>;

type RefreshTask = Shared<BoxFuture<'static, Result<(), Arc<NetworkError>>>>;

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkExecutorConfig {
    /// Response statuses that mean the access token must be refreshed.
    pub auth_failure_statuses: HashSet<u16>,
}

impl Default for NetworkExecutorConfig {
    fn default() -> Self {
        Self {
            auth_failure_statuses: HashSet::from([401]),
        }
    }
}

#[derive(Default)]
struct Coordinator {
    next_id: u64,
    in_flight: HashSet<u64>,
    /// Requests that were in flight when the current refresh started.
    pending_refresh: HashSet<u64>,
    refresh: Option<RefreshTask>,
}

fn lock(coordinator: &Mutex<Coordinator>) -> MutexGuard<'_, Coordinator> {
    coordinator.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registration of one executing request; unregisters on drop so canceled
/// requests never linger in the pending set.
struct InFlight<'a> {
    coordinator: &'a Mutex<Coordinator>,
    id: u64,
}

impl<'a> InFlight<'a> {
    fn register(coordinator: &'a Mutex<Coordinator>) -> Self {
        let mut state = lock(coordinator);
        let id = state.next_id;
        state.next_id += 1;
        state.in_flight.insert(id);
        Self { coordinator, id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.coordinator);
        state.in_flight.remove(&self.id);
        state.pending_refresh.remove(&self.id);
    }
}

/// Runs requests through a [`Transport`], refreshing credentials on
/// authorization failures. Clones share refresh state.
#[derive(Clone)]
pub struct NetworkExecutor {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    config: NetworkExecutorConfig,
    on_refresh_failed: Option<RefreshFailedCallback>,
    coordinator: Arc<Mutex<Coordinator>>,
}

impl NetworkExecutor {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            transport,
            credentials,
            config: NetworkExecutorConfig::default(),
            on_refresh_failed: None,
            coordinator: Arc::new(Mutex::new(Coordinator::default())),
        }
    }

    pub fn with_config(mut self, config: NetworkExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a callback for failed refreshes, e.g. to sign the user out.
    pub fn on_refresh_failed(mut self, callback: RefreshFailedCallback) -> Self {
        self.on_refresh_failed = Some(callback);
        self
    }

    pub fn config(&self) -> &NetworkExecutorConfig {
        &self.config
    }

    /// Execute a request, refreshing credentials and retrying once on an
    /// authorization failure.
    ///
    /// If the refresh fails, the original failure is returned.
    pub async fn execute(&self, request: NetworkRequest) -> Result<NetworkResponse, NetworkError> {
        let in_flight = InFlight::register(&self.coordinator);

        let response = self.send(&request).await?;
        if !self.needs_refresh(&request, &response) {
            return response.error_for_status();
        }

        let refresh = self.refresh_for(in_flight.id);
        match refresh.await {
            Ok(()) => {
                debug!(path = %request.path, "retrying after credential refresh");
                self.send(&request).await?.error_for_status()
            }
            Err(_) => response.error_for_status(),
        }
    }

    /// Execute a request and decode the JSON response body.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: NetworkRequest,
    ) -> Result<T, NetworkError> {
        self.execute(request).await?.json()
    }

    async fn send(&self, request: &NetworkRequest) -> Result<NetworkResponse, NetworkError> {
        let token = if request.requires_auth {
            self.credentials.access_token().await
        } else {
            None
        };
        self.transport.send(request, token.as_deref()).await
    }

    fn needs_refresh(&self, request: &NetworkRequest, response: &NetworkResponse) -> bool {
        request.requires_auth
            && !request.is_refresh
            && self
                .config
                .auth_failure_statuses
                .contains(&response.status)
    }

    /// The refresh this request should wait for, starting one if needed.
    fn refresh_for(&self, id: u64) -> RefreshTask {
        let mut state = lock(&self.coordinator);

        let joinable = state.refresh.as_ref().filter(|task| {
            task.peek().is_none() || state.pending_refresh.contains(&id)
        });
        if let Some(task) = joinable.cloned() {
            state.pending_refresh.remove(&id);
            debug!(request = id, "joining credential refresh");
            return task;
        }

        let task = self.start_refresh();
        let pending: HashSet<u64> = state
            .in_flight
            .iter()
            .copied()
            .filter(|other| *other != id)
            .collect();
        state.pending_refresh = pending;
        state.refresh = Some(task.clone());
        task
    }

    fn start_refresh(&self) -> RefreshTask {
        let credentials = Arc::clone(&self.credentials);
        let on_failed = self.on_refresh_failed.clone();

        // Spawned so the refresh completes, and the callback fires, even if
        // every waiting request is dropped.
        let handle = tokio::spawn(async move {
            info!("refreshing credentials");
            match credentials.refresh().await {
                Ok(()) => {
                    info!("credentials refreshed");
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "credential refresh failed");
                    if let Some(callback) = on_failed {
                        callback(&e);
                    }
                    Err(Arc::new(e))
                }
            }
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(NetworkError::Refresh(e.to_string()))),
            }
        }
        .boxed()
        .shared()
    }
}

//! Fetching a value from storage and from the remote fetcher.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BoxError, ReplicaError};
use crate::storage::Storage;

/// Produces the authoritative value for a replica, typically over the network.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self) -> Result<T, BoxError>;
}

/// Adapter turning an async closure into a [`Fetcher`].
pub struct FnFetcher<F>(F);

/// Build a fetcher from an async closure.
///
/// ```ignore
/// let fetcher = fetcher_fn(|| async { Ok::<_, std::io::Error>(42) });
/// ```
pub fn fetcher_fn<F>(f: F) -> FnFetcher<F> {
    FnFetcher(f)
}

#[async_trait]
impl<T, E, F, Fut> Fetcher<T> for FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    E: Into<BoxError>,
    T: Send + 'static,
{
    async fn fetch(&self) -> Result<T, BoxError> {
        (self.0)().await.map_err(Into::into)
    }
}

/// Identifies one load attempt.
pub(crate) type LoadToken = u64;

/// Output of a load attempt. Cancellation produces no event.
#[derive(Debug)]
pub(crate) enum LoaderEvent<T> {
    StorageRead(Option<T>),
    Finished(Result<T, ReplicaError>),
}

/// Runs at most one load attempt at a time.
pub(crate) struct DataLoader<T> {
    name: Arc<str>,
    fetcher: Arc<dyn Fetcher<T>>,
    storage: Option<Arc<dyn Storage<T>>>,
    task: Option<JoinHandle<()>>,
    token: LoadToken,
}

impl<T: Clone + Send + Sync + 'static> DataLoader<T> {
    pub(crate) fn new(
        name: Arc<str>,
        fetcher: Arc<dyn Fetcher<T>>,
        storage: Option<Arc<dyn Storage<T>>>,
    ) -> Self {
        Self {
            name,
            fetcher,
            storage,
            task: None,
            token: 0,
        }
    }

    pub(crate) fn storage(&self) -> Option<&Arc<dyn Storage<T>>> {
        self.storage.as_ref()
    }

    /// Start a load, canceling any previous attempt.
    pub(crate) fn load<M: Send + 'static>(
        &mut self,
        loading_from_storage_required: bool,
        tx: WeakUnboundedSender<M>,
        wrap: impl Fn(LoadToken, LoaderEvent<T>) -> M + Send + Sync + 'static,
    ) {
        self.cancel();
        let token = self.token;
        let name = Arc::clone(&self.name);
        let fetcher = Arc::clone(&self.fetcher);
        let storage = self.storage.clone();

        let emit = move |event: LoaderEvent<T>| match tx.upgrade() {
            Some(tx) => tx.send(wrap(token, event)).is_ok(),
            None => false,
        };

        self.task = Some(tokio::spawn(async move {
            if loading_from_storage_required {
                if let Some(storage) = &storage {
                    let stored = match storage.read().await {
                        Ok(stored) => stored,
                        Err(e) => {
                            warn!(replica = %name, error = %e, "storage read failed, fetching instead");
                            None
                        }
                    };
                    debug!(replica = %name, found = stored.is_some(), "storage read");
                    if !emit(LoaderEvent::StorageRead(stored)) {
                        return;
                    }
                }
            }

            let result = match fetcher.fetch().await {
                Ok(value) => {
                    if let Some(storage) = &storage {
                        if let Err(e) = storage.write(&value).await {
                            warn!(replica = %name, error = %e, "failed to persist fetched value");
                        }
                    }
                    Ok(value)
                }
                Err(e) => Err(ReplicaError::fetch(e)),
            };
            emit(LoaderEvent::Finished(result));
        }));
    }

    /// Abort the in-flight attempt, if any. Idempotent.
    pub(crate) fn cancel(&mut self) {
        self.token = self.token.wrapping_add(1);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub(crate) fn is_current(&self, token: LoadToken) -> bool {
        self.task.is_some() && token == self.token
    }

    /// Mark the attempt identified by `token` as done.
    pub(crate) fn finish(&mut self, token: LoadToken) -> bool {
        if self.is_current(token) {
            self.task = None;
            true
        } else {
            false
        }
    }
}

impl<T> Drop for DataLoader<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

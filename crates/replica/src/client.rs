//! Named replica registry shared by an application.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{ClientError, ReplicaError};
use crate::keyed::{KeyedFetcher, KeyedPhysicalReplica, KeyedReplicaBuilder, ReplicaKey};
use crate::loader::Fetcher;
use crate::replica::PhysicalReplica;
use crate::settings::ReplicaSettings;
use crate::state::InvalidationMode;
use crate::storage::Storage;

/// Type-erased operations the client runs across everything it created.
#[async_trait]
trait ManagedReplica: Send + Sync {
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    async fn invalidate_all(&self, mode: InvalidationMode);
    async fn clear_all(
        &self,
        mode: InvalidationMode,
        remove_from_storage: bool,
    ) -> Result<(), ReplicaError>;
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ManagedReplica for PhysicalReplica<T> {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    async fn invalidate_all(&self, mode: InvalidationMode) {
        self.invalidate(mode);
    }

    async fn clear_all(
        &self,
        mode: InvalidationMode,
        remove_from_storage: bool,
    ) -> Result<(), ReplicaError> {
        self.clear(mode, remove_from_storage).await
    }
}

#[async_trait]
impl<K: ReplicaKey, T: Clone + Send + Sync + 'static> ManagedReplica for KeyedPhysicalReplica<K, T> {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    async fn invalidate_all(&self, mode: InvalidationMode) {
        KeyedPhysicalReplica::invalidate_all(self, mode).await;
    }

    async fn clear_all(
        &self,
        mode: InvalidationMode,
        remove_from_storage: bool,
    ) -> Result<(), ReplicaError> {
        KeyedPhysicalReplica::clear_all(self, mode, remove_from_storage).await
    }
}

/// Creates replicas on first use and hands out the same instance afterwards.
///
/// Every replica created through the client follows the client's network
/// connectivity signal (see [`ReplicaClient::set_network_connected`]).
pub struct ReplicaClient {
    replicas: DashMap<String, Arc<dyn ManagedReplica>>,
    connectivity: watch::Sender<bool>,
}

impl Default for ReplicaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaClient {
    /// A client that starts out assuming the network is reachable.
    pub fn new() -> Self {
        let (connectivity, _) = watch::channel(true);
        Self {
            replicas: DashMap::new(),
            connectivity,
        }
    }

    /// Report a connectivity change to every replica created by this client.
    pub fn set_network_connected(&self, connected: bool) {
        let changed = self.connectivity.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
        if changed {
            info!(connected, "network connectivity changed");
        }
    }

    pub fn is_network_connected(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// The replica registered under `name`, created with the given pieces if absent.
    ///
    /// `fetcher`, `settings` and `storage` are ignored when the replica
    /// already exists.
    pub fn get_or_create_replica<T>(
        &self,
        name: &str,
        settings: ReplicaSettings,
        fetcher: impl Fetcher<T> + 'static,
        storage: Option<Arc<dyn Storage<T>>>,
    ) -> Result<PhysicalReplica<T>, ClientError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some(existing) = self.lookup::<PhysicalReplica<T>>(name)? {
            return Ok(existing);
        }

        let entry = self.replicas.entry(name.to_string()).or_insert_with(|| {
            debug!(replica = %name, "creating replica");
            let mut builder = PhysicalReplica::builder(name, fetcher)
                .settings(settings)
                .network_connectivity(self.connectivity.subscribe());
            if let Some(storage) = storage {
                builder = builder.shared_storage(storage);
            }
            Arc::new(builder.build())
        });
        downcast(name, entry.value().as_ref())
    }

    /// The keyed registry registered under `name`, created if absent.
    ///
    /// `configure` can set the bound and eviction strategy of a newly built
    /// registry.
    pub fn get_or_create_keyed_replica<K, T>(
        &self,
        name: &str,
        settings: ReplicaSettings,
        fetcher: impl KeyedFetcher<K, T> + 'static,
        storage: impl Fn(&K) -> Option<Arc<dyn Storage<T>>> + Send + Sync + 'static,
        configure: impl FnOnce(KeyedReplicaBuilder<K, T>) -> KeyedReplicaBuilder<K, T>,
    ) -> Result<KeyedPhysicalReplica<K, T>, ClientError>
    where
        K: ReplicaKey,
        T: Clone + Send + Sync + 'static,
    {
        if let Some(existing) = self.lookup::<KeyedPhysicalReplica<K, T>>(name)? {
            return Ok(existing);
        }

        let entry = self.replicas.entry(name.to_string()).or_insert_with(|| {
            debug!(keyed_replica = %name, "creating keyed replica");
            let builder = KeyedPhysicalReplica::builder(
                name,
                settings,
                fetcher,
                storage,
                Some(self.connectivity.subscribe()),
            );
            Arc::new(configure(builder).build())
        });
        downcast(name, entry.value().as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.replicas.contains_key(name)
    }

    /// Invalidate every replica and every keyed child created by this client.
    pub async fn invalidate_all(&self, mode: InvalidationMode) {
        for replica in self.snapshot() {
            replica.invalidate_all(mode).await;
        }
    }

    /// Clear every replica and every keyed child. Stops at the first storage failure.
    pub async fn clear_all(
        &self,
        mode: InvalidationMode,
        remove_from_storage: bool,
    ) -> Result<(), ReplicaError> {
        for replica in self.snapshot() {
            replica.clear_all(mode, remove_from_storage).await?;
        }
        Ok(())
    }

    fn lookup<R: Clone + 'static>(&self, name: &str) -> Result<Option<R>, ClientError> {
        match self.replicas.get(name) {
            Some(entry) => downcast(name, entry.value().as_ref()).map(Some),
            None => Ok(None),
        }
    }

    // Clone the handles out so no map shard lock is held across an await.
    fn snapshot(&self) -> Vec<Arc<dyn ManagedReplica>> {
        self.replicas.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

fn downcast<R: Clone + 'static>(name: &str, replica: &dyn ManagedReplica) -> Result<R, ClientError> {
    replica
        .as_any()
        .downcast_ref::<R>()
        .cloned()
        .ok_or_else(|| ClientError::TypeMismatch {
            name: name.to_string(),
        })
}

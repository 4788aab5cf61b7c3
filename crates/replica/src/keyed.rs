//! Bounded registry of per-key replicas.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{BoxError, ReplicaError};
use crate::keyed_view::KeyedView;
use crate::loader::Fetcher;
use crate::optimistic::OptimisticUpdate;
use crate::replica::{Observer, PhysicalReplica};
use crate::settings::ReplicaSettings;
use crate::state::{InvalidationMode, KeyedReplicaState, ReplicaState};
use crate::storage::Storage;
use crate::timer::{TimerSlot, TimerToken};

/// Delay before an unobserved child is checked for idleness a second time.
const IDLE_RECHECK_DELAY: Duration = Duration::from_millis(500);

/// Bounds every registry key type must satisfy.
pub trait ReplicaKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<K: Clone + Eq + Hash + Debug + Send + Sync + 'static> ReplicaKey for K {}

/// Fetches the value for one key.
#[async_trait]
pub trait KeyedFetcher<K, T>: Send + Sync {
    async fn fetch(&self, key: &K) -> Result<T, BoxError>;
}

/// Adapter turning an async closure over a key into a [`KeyedFetcher`].
pub struct FnKeyedFetcher<F>(F);

pub fn keyed_fetcher_fn<F>(f: F) -> FnKeyedFetcher<F> {
    FnKeyedFetcher(f)
}

#[async_trait]
impl<K, T, E, F, Fut> KeyedFetcher<K, T> for FnKeyedFetcher<F>
where
    K: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    E: Into<BoxError>,
    T: Send + 'static,
{
    async fn fetch(&self, key: &K) -> Result<T, BoxError> {
        (self.0)(key.clone()).await.map_err(Into::into)
    }
}

/// Binds a [`KeyedFetcher`] to one key.
struct BoundFetcher<K, T> {
    key: K,
    inner: Arc<dyn KeyedFetcher<K, T>>,
}

#[async_trait]
impl<K: Send + Sync, T: Send> Fetcher<T> for BoundFetcher<K, T> {
    async fn fetch(&self) -> Result<T, BoxError> {
        self.inner.fetch(&self.key).await
    }
}

/// Builds the child replica for a key.
pub type ReplicaFactory<K, T> = Arc<dyn Fn(&K) -> PhysicalReplica<T> + Send + Sync>;

/// Comparator over child states.
pub type StateComparator<T> =
    Arc<dyn Fn(&ReplicaState<T>, &ReplicaState<T>) -> Ordering + Send + Sync>;

/// Chooses which child to evict when a bounded registry is full.
///
/// The child that compares lowest is evicted.
pub enum EvictionStrategy<T> {
    /// Evict the child observed least recently.
    ByObservingTime,
    /// Evict the child whose data changed least recently; children without data go first.
    ByDataChangingTime,
    Custom(StateComparator<T>),
}

impl<T> Clone for EvictionStrategy<T> {
    fn clone(&self) -> Self {
        match self {
            EvictionStrategy::ByObservingTime => EvictionStrategy::ByObservingTime,
            EvictionStrategy::ByDataChangingTime => EvictionStrategy::ByDataChangingTime,
            EvictionStrategy::Custom(cmp) => EvictionStrategy::Custom(Arc::clone(cmp)),
        }
    }
}

impl<T> EvictionStrategy<T> {
    pub fn compare(&self, a: &ReplicaState<T>, b: &ReplicaState<T>) -> Ordering {
        match self {
            EvictionStrategy::ByObservingTime => a
                .observing_state
                .last_observing_time
                .cmp(&b.observing_state.last_observing_time),
            EvictionStrategy::ByDataChangingTime => {
                let a = a.data.as_ref().map(|d| d.changing_date);
                let b = b.data.as_ref().map(|d| d.changing_date);
                a.cmp(&b)
            }
            EvictionStrategy::Custom(cmp) => cmp(a, b),
        }
    }
}

enum KeyedMessage<K, T> {
    GetOrCreate {
        key: K,
        reply: oneshot::Sender<PhysicalReplica<T>>,
    },
    Get {
        key: K,
        reply: oneshot::Sender<Option<PhysicalReplica<T>>>,
    },
    All {
        reply: oneshot::Sender<Vec<(K, PhysicalReplica<T>)>>,
    },
    ChildChanged {
        key: K,
        child_id: u64,
    },
    RecheckIdle {
        key: K,
        child_id: u64,
        token: TimerToken,
    },
    /// Run an action against the child for `key`, creating it if needed.
    Apply {
        key: K,
        action: Box<dyn FnOnce(&PhysicalReplica<T>) + Send>,
    },
}

struct Child<T> {
    id: u64,
    replica: PhysicalReplica<T>,
    watcher: JoinHandle<()>,
    /// At most one pending idle recheck per child.
    recheck: TimerSlot,
    has_observers: bool,
    has_active_observers: bool,
}

impl<T> Drop for Child<T> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

struct KeyedActor<K, T> {
    name: Arc<str>,
    factory: ReplicaFactory<K, T>,
    max_count: Option<NonZeroUsize>,
    strategy: EvictionStrategy<T>,
    children: HashMap<K, Child<T>>,
    next_child_id: u64,
    state_tx: watch::Sender<KeyedReplicaState>,
    self_tx: WeakUnboundedSender<KeyedMessage<K, T>>,
}

impl<K: ReplicaKey, T: Clone + Send + Sync + 'static> KeyedActor<K, T> {
    async fn run(mut self, mut rx: UnboundedReceiver<KeyedMessage<K, T>>) {
        while let Some(message) = rx.recv().await {
            match message {
                KeyedMessage::GetOrCreate { key, reply } => {
                    let replica = self.get_or_create(key);
                    let _ = reply.send(replica);
                }
                KeyedMessage::Get { key, reply } => {
                    let _ = reply.send(self.children.get(&key).map(|c| c.replica.clone()));
                }
                KeyedMessage::All { reply } => {
                    let all = self
                        .children
                        .iter()
                        .map(|(k, c)| (k.clone(), c.replica.clone()))
                        .collect();
                    let _ = reply.send(all);
                }
                KeyedMessage::Apply { key, action } => {
                    let replica = self.get_or_create(key);
                    action(&replica);
                }
                KeyedMessage::ChildChanged { key, child_id } => {
                    self.on_child_changed(key, child_id);
                }
                KeyedMessage::RecheckIdle {
                    key,
                    child_id,
                    token,
                } => {
                    let Some(child) = self.children.get_mut(&key).filter(|c| c.id == child_id)
                    else {
                        continue;
                    };
                    if !child.recheck.fire(token) {
                        continue;
                    }
                    if child.replica.current_state().is_idle() {
                        self.remove(&key, "idle on recheck");
                    }
                }
            }
        }
        debug!(keyed_replica = %self.name, "keyed replica closed");
    }

    fn get_or_create(&mut self, key: K) -> PhysicalReplica<T> {
        if let Some(child) = self.children.get(&key) {
            return child.replica.clone();
        }

        if let Some(max) = self.max_count {
            while self.children.len() >= max.get() {
                if !self.evict_one() {
                    break;
                }
            }
        }

        let replica = (self.factory)(&key);
        let id = self.next_child_id;
        self.next_child_id += 1;
        let watcher = spawn_child_watcher(key.clone(), id, &replica, self.self_tx.clone());
        trace!(keyed_replica = %self.name, key = ?key, "created child replica");

        self.children.insert(
            key,
            Child {
                id,
                replica: replica.clone(),
                watcher,
                recheck: TimerSlot::default(),
                has_observers: false,
                has_active_observers: false,
            },
        );
        self.publish_counts();
        replica
    }

    /// Evict the lowest-ranked child. Returns false if there was nothing to evict.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .children
            .iter()
            .map(|(key, child)| (key, child.replica.current_state()))
            .min_by(|(_, a), (_, b)| self.strategy.compare(a, b))
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                if let Some(child) = self.children.get(&key) {
                    child.replica.cancel();
                }
                self.remove(&key, "evicted");
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &K, reason: &'static str) {
        if self.children.remove(key).is_some() {
            debug!(keyed_replica = %self.name, key = ?key, reason, "removed child replica");
            self.publish_counts();
        }
    }

    fn on_child_changed(&mut self, key: K, child_id: u64) {
        let Some(child) = self.children.get_mut(&key).filter(|c| c.id == child_id) else {
            return;
        };
        let state = child.replica.current_state();
        child.has_observers = state.observing_state.observer_count() > 0;
        child.has_active_observers = state.observing_state.active_observer_count() > 0;

        if state.is_idle() {
            self.remove(&key, "idle");
            return;
        }
        self.publish_counts();

        if state.observing_state.observer_count() == 0 {
            if let Some(child) = self.children.get_mut(&key) {
                if !child.recheck.is_armed() {
                    let tx = self.self_tx.clone();
                    child.recheck.arm(IDLE_RECHECK_DELAY, tx, move |token| {
                        KeyedMessage::RecheckIdle {
                            key,
                            child_id,
                            token,
                        }
                    });
                }
            }
        } else if let Some(child) = self.children.get_mut(&key) {
            child.recheck.cancel();
        }
    }

    fn publish_counts(&self) {
        let counts = KeyedReplicaState {
            replica_count: self.children.len(),
            replica_with_observers_count: self.children.values().filter(|c| c.has_observers).count(),
            replica_with_active_observers_count: self
                .children
                .values()
                .filter(|c| c.has_active_observers)
                .count(),
        };
        self.state_tx.send_if_modified(|current| {
            if *current == counts {
                false
            } else {
                *current = counts;
                true
            }
        });
    }
}

fn spawn_child_watcher<K: ReplicaKey, T: Clone + Send + Sync + 'static>(
    key: K,
    child_id: u64,
    replica: &PhysicalReplica<T>,
    tx: WeakUnboundedSender<KeyedMessage<K, T>>,
) -> JoinHandle<()> {
    let mut states = replica.state_watch();
    states.borrow_and_update();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let Some(tx) = tx.upgrade() else { break };
            let message = KeyedMessage::ChildChanged {
                key: key.clone(),
                child_id,
            };
            if tx.send(message).is_err() {
                break;
            }
        }
    })
}

/// Builder for [`KeyedPhysicalReplica`].
pub struct KeyedReplicaBuilder<K, T> {
    name: String,
    factory: ReplicaFactory<K, T>,
    max_count: Option<NonZeroUsize>,
    strategy: EvictionStrategy<T>,
}

impl<K: ReplicaKey, T: Clone + Send + Sync + 'static> KeyedReplicaBuilder<K, T> {
    /// Upper bound on simultaneously held children.
    pub fn max_count(mut self, max_count: NonZeroUsize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn eviction(mut self, strategy: EvictionStrategy<T>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Spawn the registry's processing task. Must be called within a Tokio runtime.
    pub fn build(self) -> KeyedPhysicalReplica<K, T> {
        let name: Arc<str> = Arc::from(self.name);
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(KeyedReplicaState::default());

        let actor = KeyedActor {
            name: Arc::clone(&name),
            factory: self.factory,
            max_count: self.max_count,
            strategy: self.strategy,
            children: HashMap::new(),
            next_child_id: 0,
            state_tx,
            self_tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));

        KeyedPhysicalReplica { name, tx, state_rx }
    }
}

/// A registry of independent child replicas indexed by key.
pub struct KeyedPhysicalReplica<K, T> {
    name: Arc<str>,
    tx: UnboundedSender<KeyedMessage<K, T>>,
    state_rx: watch::Receiver<KeyedReplicaState>,
}

impl<K, T> Clone for KeyedPhysicalReplica<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            state_rx: self.state_rx.clone(),
        }
    }
}

impl<K: ReplicaKey, T: Clone + Send + Sync + 'static> KeyedPhysicalReplica<K, T> {
    /// Registry whose children are built by `factory`.
    pub fn with_factory(
        name: impl Into<String>,
        factory: impl Fn(&K) -> PhysicalReplica<T> + Send + Sync + 'static,
    ) -> KeyedReplicaBuilder<K, T> {
        KeyedReplicaBuilder {
            name: name.into(),
            factory: Arc::new(factory),
            max_count: None,
            strategy: EvictionStrategy::ByObservingTime,
        }
    }

    /// Registry whose children share `settings` and fetch through `fetcher`.
    ///
    /// `storage` supplies per-key storage; return `None` for keys that
    /// should not be persisted.
    pub fn builder(
        name: impl Into<String>,
        settings: ReplicaSettings,
        fetcher: impl KeyedFetcher<K, T> + 'static,
        storage: impl Fn(&K) -> Option<Arc<dyn Storage<T>>> + Send + Sync + 'static,
        connectivity: Option<watch::Receiver<bool>>,
    ) -> KeyedReplicaBuilder<K, T> {
        let name = name.into();
        let prefix = name.clone();
        let fetcher: Arc<dyn KeyedFetcher<K, T>> = Arc::new(fetcher);
        Self::with_factory(name, move |key: &K| {
            let bound = BoundFetcher {
                key: key.clone(),
                inner: Arc::clone(&fetcher),
            };
            let mut builder = PhysicalReplica::builder(format!("{}[{:?}]", prefix, key), bound)
                .settings(settings.clone());
            if let Some(storage) = storage(key) {
                builder = builder.shared_storage(storage);
            }
            if let Some(connectivity) = &connectivity {
                builder = builder.network_connectivity(connectivity.clone());
            }
            builder.build()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Watch of the aggregate counters.
    pub fn keyed_state(&self) -> watch::Receiver<KeyedReplicaState> {
        self.state_rx.clone()
    }

    pub fn current_keyed_state(&self) -> KeyedReplicaState {
        *self.state_rx.borrow()
    }

    /// The child for `key`, created (and possibly evicting another) if absent.
    pub async fn get_or_create(&self, key: K) -> Result<PhysicalReplica<T>, ReplicaError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(KeyedMessage::GetOrCreate { key, reply })
            .map_err(|_| ReplicaError::Closed)?;
        rx.await.map_err(|_| ReplicaError::Closed)
    }

    /// The child for `key`, if it currently exists.
    pub async fn get(&self, key: K) -> Option<PhysicalReplica<T>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(KeyedMessage::Get { key, reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn observe(
        &self,
        key: K,
        active: watch::Receiver<bool>,
    ) -> Result<Observer<T>, ReplicaError> {
        Ok(self.get_or_create(key).await?.observe(active))
    }

    pub fn refresh(&self, key: K) {
        self.apply(key, |replica| replica.refresh());
    }

    pub fn revalidate(&self, key: K) {
        self.apply(key, |replica| replica.revalidate());
    }

    pub async fn get_data(&self, key: K, force_refresh: bool) -> Result<T, ReplicaError> {
        self.get_or_create(key).await?.get_data(force_refresh).await
    }

    pub async fn set_data(&self, key: K, value: T) -> Result<(), ReplicaError> {
        self.get_or_create(key).await?.set_data(value).await
    }

    /// Transform the value for `key` if that child exists and has data.
    pub async fn mutate_data(
        &self,
        key: K,
        transform: impl FnOnce(&T) -> T + Send + 'static,
    ) -> Result<(), ReplicaError> {
        match self.get(key).await {
            Some(replica) => replica.mutate_data(transform).await,
            None => Ok(()),
        }
    }

    pub async fn invalidate(&self, key: K, mode: InvalidationMode) {
        if let Some(replica) = self.get(key).await {
            replica.invalidate(mode);
        }
    }

    pub async fn make_fresh(&self, key: K) {
        if let Some(replica) = self.get(key).await {
            replica.make_fresh();
        }
    }

    /// Clear the child for `key` if it exists.
    pub async fn clear(
        &self,
        key: K,
        mode: InvalidationMode,
        remove_from_storage: bool,
    ) -> Result<(), ReplicaError> {
        match self.get(key).await {
            Some(replica) => replica.clear(mode, remove_from_storage).await,
            None => Ok(()),
        }
    }

    pub async fn clear_error(&self, key: K) {
        if let Some(replica) = self.get(key).await {
            replica.clear_error();
        }
    }

    pub async fn with_optimistic_update<R, E, F>(
        &self,
        key: K,
        update: OptimisticUpdate<T>,
        block: F,
    ) -> Result<R, E>
    where
        F: Future<Output = Result<R, E>>,
        E: From<ReplicaError>,
    {
        match self.get(key).await {
            Some(replica) => replica.with_optimistic_update(update, block).await,
            None => block.await,
        }
    }

    pub async fn invalidate_all(&self, mode: InvalidationMode) {
        for (_, replica) in self.all().await {
            replica.invalidate(mode);
        }
    }

    /// Clear every child. Stops at the first storage failure.
    pub async fn clear_all(
        &self,
        mode: InvalidationMode,
        remove_from_storage: bool,
    ) -> Result<(), ReplicaError> {
        for (_, replica) in self.all().await {
            replica.clear(mode, remove_from_storage).await?;
        }
        Ok(())
    }

    /// Run `f` for every current child.
    pub async fn on_each_replica(&self, mut f: impl FnMut(&K, &PhysicalReplica<T>)) {
        for (key, replica) in self.all().await {
            f(&key, &replica);
        }
    }

    /// A single-resource view that follows whichever key `key` currently holds.
    pub fn with_key(&self, key: watch::Receiver<Option<K>>) -> KeyedView<K, T> {
        KeyedView::new(self.clone(), key)
    }

    fn apply(&self, key: K, action: impl FnOnce(&PhysicalReplica<T>) + Send + 'static) {
        let _ = self.tx.send(KeyedMessage::Apply {
            key,
            action: Box::new(action),
        });
    }

    async fn all(&self) -> Vec<(K, PhysicalReplica<T>)> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(KeyedMessage::All { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

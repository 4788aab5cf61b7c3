//! Public replica handles and observers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::Stream;

use crate::actor::{Message, ReplicaActor};
use crate::error::ReplicaError;
use crate::event::ReplicaEvent;
use crate::loader::{DataLoader, Fetcher};
use crate::optimistic::OptimisticUpdate;
use crate::settings::ReplicaSettings;
use crate::state::{InvalidationMode, ObserverId, ReplicaState};
use crate::storage::Storage;

/// Capacity of each replica's event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The read-side surface shared by every kind of replica.
#[async_trait]
pub trait Replica<T>: Send + Sync {
    /// Register an observer whose activity follows `active`.
    ///
    /// The observer is removed when the returned handle is dropped or when
    /// the sender side of `active` is dropped.
    fn observe(&self, active: watch::Receiver<bool>) -> Observer<T>;

    /// Fetch unless a fetch is already in flight.
    fn refresh(&self);

    /// Fetch only if data is missing or stale.
    fn revalidate(&self);

    /// Return fresh data, loading it first if needed.
    async fn get_data(&self, force_refresh: bool) -> Result<T, ReplicaError>;
}

/// A single-resource cache cell.
///
/// Cheap to clone; all clones address the same replica. The replica's
/// processing task lives until the last handle and observer are dropped.
pub struct PhysicalReplica<T> {
    name: Arc<str>,
    tx: UnboundedSender<Message<T>>,
    state_rx: watch::Receiver<ReplicaState<T>>,
    events_tx: broadcast::Sender<ReplicaEvent>,
}

impl<T> Clone for PhysicalReplica<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            state_rx: self.state_rx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

/// Builder for [`PhysicalReplica`].
pub struct ReplicaBuilder<T> {
    name: String,
    fetcher: Arc<dyn Fetcher<T>>,
    settings: ReplicaSettings,
    storage: Option<Arc<dyn Storage<T>>>,
    connectivity: Option<watch::Receiver<bool>>,
}

impl<T: Clone + Send + Sync + 'static> ReplicaBuilder<T> {
    pub fn settings(mut self, settings: ReplicaSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn storage(mut self, storage: impl Storage<T> + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    pub fn shared_storage(mut self, storage: Arc<dyn Storage<T>>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Signal that is `true` while the network is reachable.
    pub fn network_connectivity(mut self, connectivity: watch::Receiver<bool>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Spawn the replica's processing task. Must be called within a Tokio runtime.
    pub fn build(self) -> PhysicalReplica<T> {
        let name: Arc<str> = Arc::from(self.name);
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ReplicaState::empty(self.storage.is_some()));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let loader = DataLoader::new(Arc::clone(&name), self.fetcher, self.storage);
        let actor = ReplicaActor::new(
            Arc::clone(&name),
            self.settings,
            loader,
            state_tx,
            events_tx.clone(),
            tx.downgrade(),
            self.connectivity,
        );
        tokio::spawn(actor.run(rx));

        PhysicalReplica {
            name,
            tx,
            state_rx,
            events_tx,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> PhysicalReplica<T> {
    pub fn builder(name: impl Into<String>, fetcher: impl Fetcher<T> + 'static) -> ReplicaBuilder<T> {
        ReplicaBuilder {
            name: name.into(),
            fetcher: Arc::new(fetcher),
            settings: ReplicaSettings::default(),
            storage: None,
            connectivity: None,
        }
    }

    /// Create a replica without storage.
    pub fn new(
        name: impl Into<String>,
        settings: ReplicaSettings,
        fetcher: impl Fetcher<T> + 'static,
    ) -> Self {
        Self::builder(name, fetcher).settings(settings).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published state.
    pub fn current_state(&self) -> ReplicaState<T> {
        self.state_rx.borrow().clone()
    }

    /// Latest-value view of the state, without registering as an observer.
    pub fn state_watch(&self) -> watch::Receiver<ReplicaState<T>> {
        self.state_rx.clone()
    }

    /// Subscribe to transition events from now on.
    pub fn events(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events_tx.subscribe()
    }

    pub fn observe(&self, mut active: watch::Receiver<bool>) -> Observer<T> {
        let id = ObserverId::next();
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        let initially_active = *active.borrow_and_update();
        self.send(Message::AddObserver {
            id,
            active: initially_active,
            states: states_tx,
        });

        let weak = self.tx.downgrade();
        let activity = tokio::spawn(async move {
            loop {
                let message = match active.changed().await {
                    Ok(()) => Message::SetObserverActive {
                        id,
                        active: *active.borrow_and_update(),
                    },
                    Err(_) => Message::RemoveObserver { id },
                };
                let removing = matches!(message, Message::RemoveObserver { .. });
                let Some(tx) = weak.upgrade() else { break };
                if tx.send(message).is_err() || removing {
                    break;
                }
            }
        });

        Observer {
            id,
            states: states_rx,
            detach: Some(Detach::Replica {
                tx: self.tx.clone(),
                activity,
            }),
        }
    }

    pub fn refresh(&self) {
        self.send(Message::Refresh);
    }

    pub fn revalidate(&self) {
        self.send(Message::Revalidate);
    }

    pub async fn get_data(&self, force_refresh: bool) -> Result<T, ReplicaError> {
        self.request(|reply| Message::GetData {
            force_refresh,
            reply,
        })
        .await
    }

    /// Replace the cached value without fetching and persist it.
    pub async fn set_data(&self, value: T) -> Result<(), ReplicaError> {
        self.request(|reply| Message::SetData { value, reply }).await
    }

    /// Transform the cached value, if any, and persist the result.
    pub async fn mutate_data(
        &self,
        transform: impl FnOnce(&T) -> T + Send + 'static,
    ) -> Result<(), ReplicaError> {
        self.request(|reply| Message::MutateData {
            transform: Box::new(transform),
            reply,
        })
        .await
    }

    pub fn invalidate(&self, mode: InvalidationMode) {
        self.send(Message::Invalidate(mode));
    }

    pub fn make_fresh(&self) {
        self.send(Message::MakeFresh);
    }

    /// Cancel any load, drop data and error, then invalidate with `mode`.
    pub async fn clear(
        &self,
        mode: InvalidationMode,
        remove_from_storage: bool,
    ) -> Result<(), ReplicaError> {
        self.request(|reply| Message::Clear {
            mode,
            remove_from_storage,
            reply,
        })
        .await
    }

    pub fn clear_error(&self) {
        self.send(Message::ClearError);
    }

    /// Cancel the in-flight load, if any.
    pub fn cancel(&self) {
        self.send(Message::Cancel);
    }

    pub fn begin_optimistic_update(&self, update: OptimisticUpdate<T>) {
        self.send(Message::BeginOptimistic(update));
    }

    pub async fn commit_optimistic_update(
        &self,
        update: &OptimisticUpdate<T>,
    ) -> Result<(), ReplicaError> {
        let update = update.clone();
        self.request(|reply| Message::CommitOptimistic { update, reply })
            .await
    }

    pub fn rollback_optimistic_update(&self, update: &OptimisticUpdate<T>) {
        self.send(Message::RollbackOptimistic(update.id()));
    }

    /// Show `update` while `block` runs; commit it on success, roll it back on
    /// failure or if the returned future is dropped.
    pub async fn with_optimistic_update<R, E, F>(
        &self,
        update: OptimisticUpdate<T>,
        block: F,
    ) -> Result<R, E>
    where
        F: Future<Output = Result<R, E>>,
        E: From<ReplicaError>,
    {
        self.begin_optimistic_update(update.clone());
        let mut guard = RollbackGuard {
            tx: &self.tx,
            update_id: update.id(),
            armed: true,
        };

        let value = block.await?;
        guard.armed = false;
        self.commit_optimistic_update(&update).await?;
        Ok(value)
    }

    fn send(&self, message: Message<T>) {
        // The actor only stops once every sender is gone, so this cannot fail
        // while `self` is alive.
        let _ = self.tx.send(message);
    }

    async fn request<R>(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<R, ReplicaError>>) -> Message<T>,
    ) -> Result<R, ReplicaError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(message(reply))
            .map_err(|_| ReplicaError::Closed)?;
        rx.await.map_err(|_| ReplicaError::Closed)?
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Replica<T> for PhysicalReplica<T> {
    fn observe(&self, active: watch::Receiver<bool>) -> Observer<T> {
        PhysicalReplica::observe(self, active)
    }

    fn refresh(&self) {
        PhysicalReplica::refresh(self)
    }

    fn revalidate(&self) {
        PhysicalReplica::revalidate(self)
    }

    async fn get_data(&self, force_refresh: bool) -> Result<T, ReplicaError> {
        PhysicalReplica::get_data(self, force_refresh).await
    }
}

struct RollbackGuard<'a, T> {
    tx: &'a UnboundedSender<Message<T>>,
    update_id: u64,
    armed: bool,
}

impl<T> Drop for RollbackGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.send(Message::RollbackOptimistic(self.update_id));
        }
    }
}

/// How an observer detaches from its source when dropped.
pub(crate) enum Detach<T> {
    Replica {
        tx: UnboundedSender<Message<T>>,
        activity: JoinHandle<()>,
    },
    /// A forwarding task that owns the underlying observers.
    Task(JoinHandle<()>),
}

/// A registered observer and its stream of state snapshots.
///
/// The first snapshot is the replica's state at registration time; after
/// that every transition is delivered in order.
pub struct Observer<T> {
    id: ObserverId,
    states: UnboundedReceiver<ReplicaState<T>>,
    detach: Option<Detach<T>>,
}

impl<T> Observer<T> {
    pub(crate) fn forwarding(
        states: UnboundedReceiver<ReplicaState<T>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id: ObserverId::next(),
            states,
            detach: Some(Detach::Task(task)),
        }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Wait for the next snapshot. `None` once the observer is detached.
    pub async fn next_state(&mut self) -> Option<ReplicaState<T>> {
        self.states.recv().await
    }

    /// Take a queued snapshot without waiting.
    pub fn try_next_state(&mut self) -> Option<ReplicaState<T>> {
        self.states.try_recv().ok()
    }

    /// Unregister from the replica.
    pub fn stop_observing(self) {}
}

impl<T> Unpin for Observer<T> {}

impl<T> Stream for Observer<T> {
    type Item = ReplicaState<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.states.poll_recv(cx)
    }
}

impl<T> Drop for Observer<T> {
    fn drop(&mut self) {
        match self.detach.take() {
            Some(Detach::Replica { tx, activity }) => {
                activity.abort();
                let _ = tx.send(Message::RemoveObserver { id: self.id });
            }
            Some(Detach::Task(task)) => task.abort(),
            None => {}
        }
    }
}

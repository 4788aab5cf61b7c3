//! The serialized processing task that owns a replica's state.
//!
//! Every public operation and every internally generated event (loader
//! output, observer changes, timer firings) arrives as a [`Message`] on one
//! queue and is handled to completion before the next one is read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::ReplicaError;
use crate::event::{LoadingOutcome, ReplicaEvent};
use crate::freshness::{FreshnessChange, FreshnessController};
use crate::loader::{DataLoader, LoadToken, LoaderEvent};
use crate::observer::{ObserverCountChanged, ObserverLifecycle};
use crate::optimistic::{self, OptimisticUpdate};
use crate::settings::ReplicaSettings;
use crate::state::{InvalidationMode, ObserverId, ObservingStatus, ReplicaData, ReplicaState};
use crate::timer::{TimerSlot, TimerToken};

pub(crate) type Reply<R> = oneshot::Sender<Result<R, ReplicaError>>;

/// Transform applied by `mutate_data`.
pub(crate) type Mutation<T> = Box<dyn FnOnce(&T) -> T + Send>;

/// Background behaviors driven by the observer count reaching zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleTimer {
    CancelLoading,
    ClearData,
    ClearError,
}

pub(crate) enum Message<T> {
    AddObserver {
        id: ObserverId,
        active: bool,
        states: UnboundedSender<ReplicaState<T>>,
    },
    RemoveObserver {
        id: ObserverId,
    },
    SetObserverActive {
        id: ObserverId,
        active: bool,
    },
    Refresh,
    Revalidate,
    GetData {
        force_refresh: bool,
        reply: Reply<T>,
    },
    SetData {
        value: T,
        reply: Reply<()>,
    },
    MutateData {
        transform: Mutation<T>,
        reply: Reply<()>,
    },
    Invalidate(InvalidationMode),
    MakeFresh,
    Clear {
        mode: InvalidationMode,
        remove_from_storage: bool,
        reply: Reply<()>,
    },
    ClearError,
    Cancel,
    BeginOptimistic(OptimisticUpdate<T>),
    CommitOptimistic {
        update: OptimisticUpdate<T>,
        reply: Reply<()>,
    },
    RollbackOptimistic(u64),
    Loader {
        token: LoadToken,
        event: LoaderEvent<T>,
    },
    StaleTimer(TimerToken),
    IdleTimer {
        kind: IdleTimer,
        token: TimerToken,
    },
    NetworkReconnected,
}

pub(crate) struct ReplicaActor<T> {
    name: Arc<str>,
    settings: ReplicaSettings,
    state: ReplicaState<T>,
    lifecycle: ObserverLifecycle,
    observers: HashMap<ObserverId, UnboundedSender<ReplicaState<T>>>,
    loader: DataLoader<T>,
    freshness: FreshnessController,
    cancel_timer: TimerSlot,
    clear_timer: TimerSlot,
    clear_error_timer: TimerSlot,
    data_waiters: Vec<Reply<T>>,
    /// Outcome handed to `data_waiters` on the next publish.
    waiter_outcome: Option<Result<T, ReplicaError>>,
    state_tx: watch::Sender<ReplicaState<T>>,
    events_tx: broadcast::Sender<ReplicaEvent>,
    self_tx: WeakUnboundedSender<Message<T>>,
    connectivity_task: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> ReplicaActor<T> {
    pub(crate) fn new(
        name: Arc<str>,
        settings: ReplicaSettings,
        loader: DataLoader<T>,
        state_tx: watch::Sender<ReplicaState<T>>,
        events_tx: broadcast::Sender<ReplicaEvent>,
        self_tx: WeakUnboundedSender<Message<T>>,
        connectivity: Option<watch::Receiver<bool>>,
    ) -> Self {
        let state = ReplicaState::empty(loader.storage().is_some());
        let connectivity_task = connectivity
            .filter(|_| settings.revalidate_on_network_reconnect)
            .map(|rx| spawn_connectivity_watcher(rx, self_tx.clone()));

        Self {
            name,
            freshness: FreshnessController::new(settings.stale_time),
            settings,
            state,
            lifecycle: ObserverLifecycle::default(),
            observers: HashMap::new(),
            loader,
            cancel_timer: TimerSlot::default(),
            clear_timer: TimerSlot::default(),
            clear_error_timer: TimerSlot::default(),
            data_waiters: Vec::new(),
            waiter_outcome: None,
            state_tx,
            events_tx,
            self_tx,
            connectivity_task,
        }
    }

    pub(crate) async fn run(mut self, mut rx: UnboundedReceiver<Message<T>>) {
        debug!(replica = %self.name, "replica started");
        while let Some(message) = rx.recv().await {
            self.handle(message).await;
        }
        debug!(replica = %self.name, "replica closed");
    }

    async fn handle(&mut self, message: Message<T>) {
        match message {
            Message::AddObserver { id, active, states } => {
                self.observers.insert(id, states);
                match self.lifecycle.observer_added(id, active) {
                    Some(change) => self.on_observer_count_changed(change),
                    None => {
                        if let Some(states) = self.observers.get(&id) {
                            let _ = states.send(self.state.clone());
                        }
                    }
                }
            }
            Message::RemoveObserver { id } => {
                self.observers.remove(&id);
                if let Some(change) = self.lifecycle.observer_removed(id) {
                    self.on_observer_count_changed(change);
                }
            }
            Message::SetObserverActive { id, active } => {
                let change = if active {
                    self.lifecycle.observer_activated(id)
                } else {
                    self.lifecycle.observer_deactivated(id)
                };
                if let Some(change) = change {
                    self.on_observer_count_changed(change);
                }
            }
            Message::Refresh => self.start_loading(false),
            Message::Revalidate => self.revalidate(),
            Message::GetData {
                force_refresh,
                reply,
            } => self.get_data(force_refresh, reply),
            Message::SetData { value, reply } => {
                let result = self.set_data(value).await;
                let _ = reply.send(result);
            }
            Message::MutateData { transform, reply } => {
                let result = match self.state.data.as_ref() {
                    Some(data) => {
                        let value = transform(&data.value);
                        self.set_data(value).await
                    }
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Message::Invalidate(mode) => self.invalidate(mode),
            Message::MakeFresh => self.make_fresh(),
            Message::Clear {
                mode,
                remove_from_storage,
                reply,
            } => {
                let result = self.clear(mode, remove_from_storage).await;
                let _ = reply.send(result);
            }
            Message::ClearError => self.clear_error(),
            Message::Cancel => {
                if self.cancel_loading() {
                    self.publish();
                }
            }
            Message::BeginOptimistic(update) => {
                if optimistic::begin(self.state.data.as_mut(), update) {
                    self.publish();
                }
            }
            Message::CommitOptimistic { update, reply } => {
                let result = match optimistic::commit(self.state.data.as_mut(), &update) {
                    Some(value) => {
                        self.publish();
                        self.persist(&value).await
                    }
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Message::RollbackOptimistic(update_id) => {
                if optimistic::rollback(self.state.data.as_mut(), update_id) {
                    self.publish();
                }
            }
            Message::Loader { token, event } => self.on_loader_event(token, event),
            Message::StaleTimer(token) => {
                if let Some(change) = self.freshness.on_timer(token, self.state.data.as_mut()) {
                    self.on_freshness_change(change);
                    self.publish();
                }
            }
            Message::IdleTimer { kind, token } => self.on_idle_timer(kind, token).await,
            Message::NetworkReconnected => {
                if self.state.observing_state.status() == ObservingStatus::Active {
                    debug!(replica = %self.name, "network reconnected, revalidating");
                    self.revalidate();
                }
            }
        }
    }

    fn publish(&mut self) {
        let snapshot = self.state.clone();
        self.observers
            .retain(|_, states| states.send(snapshot.clone()).is_ok());
        self.state_tx.send_replace(snapshot);

        if let Some(outcome) = self.waiter_outcome.take() {
            for waiter in self.data_waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    fn emit(&self, event: ReplicaEvent) {
        let _ = self.events_tx.send(event);
    }

    fn start_loading(&mut self, data_requested: bool) {
        let preloading = self.state.observing_state.status() != ObservingStatus::Active;

        if self.state.loading {
            let requested = self.state.data_requested || data_requested;
            let preloading = self.state.preloading || preloading;
            if requested != self.state.data_requested || preloading != self.state.preloading {
                self.state.data_requested = requested;
                self.state.preloading = preloading;
                self.publish();
            }
            return;
        }

        debug!(
            replica = %self.name,
            from_storage = self.state.loading_from_storage_required,
            data_requested,
            preloading,
            "loading started"
        );
        self.loader.load(
            self.state.loading_from_storage_required,
            self.self_tx.clone(),
            |token, event| Message::Loader { token, event },
        );
        self.state.loading = true;
        self.state.data_requested = data_requested;
        self.state.preloading = preloading;
        self.emit(ReplicaEvent::LoadingStarted);
        self.publish();
    }

    fn revalidate(&mut self) {
        if !self.state.has_fresh_data() {
            self.start_loading(false);
        }
    }

    fn get_data(&mut self, force_refresh: bool, reply: Reply<T>) {
        if !force_refresh {
            if let Some(data) = self.state.data.as_ref().filter(|d| d.is_fresh) {
                let _ = reply.send(Ok(data.value_with_optimistic_updates()));
                return;
            }
        }
        self.data_waiters.push(reply);
        self.start_loading(true);
    }

    fn on_loader_event(&mut self, token: LoadToken, event: LoaderEvent<T>) {
        if !self.loader.is_current(token) {
            trace!(replica = %self.name, "dropping event from superseded load");
            return;
        }

        match event {
            LoaderEvent::StorageRead(stored) => {
                let found = stored.is_some();
                self.state.loading_from_storage_required = false;
                if let Some(value) = stored {
                    if self.state.data.is_none() {
                        self.state.data = Some(ReplicaData::new(value, false));
                    }
                }
                self.emit(ReplicaEvent::StorageRead { found });
                self.publish();
            }
            LoaderEvent::Finished(result) => {
                self.loader.finish(token);
                self.state.loading = false;
                self.state.data_requested = false;
                self.state.preloading = false;

                match result {
                    Ok(value) => {
                        let pending = self
                            .state
                            .data
                            .take()
                            .map(|d| d.optimistic_updates)
                            .unwrap_or_default();
                        let mut data = ReplicaData::new(value, false);
                        data.optimistic_updates = pending;
                        self.state.data = Some(data);
                        self.state.error = None;
                        self.state.loading_from_storage_required = false;

                        self.make_fresh_quiet();
                        self.waiter_outcome = self
                            .state
                            .data
                            .as_ref()
                            .map(|data| Ok(data.value_with_optimistic_updates()));
                        debug!(replica = %self.name, "loading finished");
                        self.emit(ReplicaEvent::LoadingFinished(LoadingOutcome::Success));
                    }
                    Err(error) => {
                        warn!(replica = %self.name, error = %error, "loading failed");
                        self.waiter_outcome = Some(Err(error.clone()));
                        self.state.error = Some(error.clone());
                        self.emit(ReplicaEvent::LoadingFinished(LoadingOutcome::Error(error)));
                    }
                }

                self.arm_idle_timers_if_unobserved();
                self.publish();
            }
        }
    }

    /// Returns true if a load was in flight.
    fn cancel_loading(&mut self) -> bool {
        if !self.state.loading {
            return false;
        }
        debug!(replica = %self.name, "loading canceled");
        self.loader.cancel();
        self.state.loading = false;
        self.state.data_requested = false;
        self.state.preloading = false;
        self.waiter_outcome = Some(Err(ReplicaError::Canceled));
        self.emit(ReplicaEvent::LoadingFinished(LoadingOutcome::Canceled));
        true
    }

    async fn set_data(&mut self, value: T) -> Result<(), ReplicaError> {
        let (is_fresh, pending) = match self.state.data.take() {
            Some(data) => (data.is_fresh, data.optimistic_updates),
            None => (false, Vec::new()),
        };
        let mut data = ReplicaData::new(value.clone(), is_fresh);
        data.optimistic_updates = pending;
        self.state.data = Some(data);
        self.state.loading_from_storage_required = false;
        self.arm_idle_timers_if_unobserved();
        self.publish();

        self.persist(&value).await
    }

    async fn persist(&self, value: &T) -> Result<(), ReplicaError> {
        let Some(storage) = self.loader.storage() else {
            return Ok(());
        };
        storage.write(value).await.map_err(|e| {
            warn!(replica = %self.name, error = %e, "failed to write storage");
            ReplicaError::from(e)
        })
    }

    fn invalidate(&mut self, mode: InvalidationMode) {
        if let Some(change) = self.freshness.invalidate(self.state.data.as_mut()) {
            self.on_freshness_change(change);
            self.publish();
        }
        if mode.should_refresh(self.state.observing_state.status()) {
            self.start_loading(false);
        }
    }

    fn make_fresh(&mut self) {
        if self.make_fresh_quiet() {
            self.publish();
        }
    }

    /// Mark fresh without publishing. Returns true if freshness changed.
    fn make_fresh_quiet(&mut self) -> bool {
        let change = self
            .freshness
            .make_fresh(self.state.data.as_mut(), self.self_tx.clone(), Message::StaleTimer);
        match change {
            Some(change) => {
                self.on_freshness_change(change);
                true
            }
            None => false,
        }
    }

    fn on_freshness_change(&self, change: FreshnessChange) {
        match change {
            FreshnessChange::BecameFresh => self.emit(ReplicaEvent::BecameFresh),
            FreshnessChange::BecameStale => {
                trace!(replica = %self.name, "data became stale");
                self.emit(ReplicaEvent::BecameStale)
            }
        }
    }

    async fn clear(
        &mut self,
        mode: InvalidationMode,
        remove_from_storage: bool,
    ) -> Result<(), ReplicaError> {
        self.cancel_loading();
        self.freshness.cancel();
        self.state.data = None;
        self.state.error = None;
        let has_storage = self.loader.storage().is_some();
        self.state.loading_from_storage_required = has_storage && !remove_from_storage;
        self.emit(ReplicaEvent::Cleared);
        self.publish();

        let result = match self.loader.storage() {
            Some(storage) if remove_from_storage => {
                storage.remove().await.map_err(ReplicaError::from)
            }
            _ => Ok(()),
        };

        self.invalidate(mode);
        result
    }

    fn clear_error(&mut self) {
        if self.state.error.take().is_some() {
            self.emit(ReplicaEvent::ClearedError);
            self.publish();
        }
    }

    fn on_observer_count_changed(&mut self, change: ObserverCountChanged) {
        self.state.observing_state = self.lifecycle.state().clone();
        trace!(
            replica = %self.name,
            count = change.count,
            active = change.active_count,
            "observer count changed"
        );
        self.emit(ReplicaEvent::ObserverCountChanged(change));

        if change.observer_added() {
            self.cancel_idle_timers();
        }
        if change.became_unobserved() {
            self.arm_idle_timers();
        }
        self.publish();

        if change.active_observer_added() && self.settings.revalidate_on_active_observer_added {
            self.revalidate();
        }
    }

    fn arm_idle_timers(&mut self) {
        for (kind, delay) in self.idle_timer_delays() {
            self.arm_idle_timer(kind, delay);
        }
    }

    /// Arms every idle timer that is not already pending. A timer that fired
    /// earlier is armed again even while a longer one is still running.
    fn arm_idle_timers_if_unobserved(&mut self) {
        if self.state.observing_state.observer_count() != 0 {
            return;
        }
        for (kind, delay) in self.idle_timer_delays() {
            if !self.idle_timer(kind).is_armed() {
                self.arm_idle_timer(kind, delay);
            }
        }
    }

    fn idle_timer_delays(&self) -> [(IdleTimer, Option<Duration>); 3] {
        [
            (IdleTimer::CancelLoading, self.settings.cancel_time),
            (IdleTimer::ClearData, self.settings.clear_time),
            (IdleTimer::ClearError, self.settings.clear_error_time),
        ]
    }

    fn arm_idle_timer(&mut self, kind: IdleTimer, delay: Option<Duration>) {
        let Some(delay) = delay else { return };
        let tx = self.self_tx.clone();
        self.idle_timer(kind)
            .arm(delay, tx, move |token| Message::IdleTimer { kind, token });
    }

    fn cancel_idle_timers(&mut self) {
        self.cancel_timer.cancel();
        self.clear_timer.cancel();
        self.clear_error_timer.cancel();
    }

    fn idle_timer(&mut self, kind: IdleTimer) -> &mut TimerSlot {
        match kind {
            IdleTimer::CancelLoading => &mut self.cancel_timer,
            IdleTimer::ClearData => &mut self.clear_timer,
            IdleTimer::ClearError => &mut self.clear_error_timer,
        }
    }

    async fn on_idle_timer(&mut self, kind: IdleTimer, token: TimerToken) {
        if !self.idle_timer(kind).fire(token) {
            return;
        }
        if self.state.observing_state.observer_count() > 0 {
            return;
        }

        match kind {
            IdleTimer::CancelLoading => {
                if self.state.loading && !self.state.data_requested && !self.state.preloading {
                    debug!(replica = %self.name, "canceling unobserved load");
                    self.cancel_loading();
                    self.publish();
                }
            }
            IdleTimer::ClearData => {
                let has_content = self.state.data.is_some() || self.state.error.is_some();
                if has_content && !self.state.loading {
                    debug!(replica = %self.name, "clearing unobserved data");
                    let remove = self.settings.clear_storage_on_auto_clear;
                    if let Err(e) = self.clear(InvalidationMode::DontRefresh, remove).await {
                        warn!(replica = %self.name, error = %e, "auto-clear failed to remove storage");
                    }
                }
            }
            IdleTimer::ClearError => self.clear_error(),
        }
    }
}

impl<T> Drop for ReplicaActor<T> {
    fn drop(&mut self) {
        if let Some(task) = self.connectivity_task.take() {
            task.abort();
        }
    }
}

fn spawn_connectivity_watcher<T: Send + 'static>(
    mut connectivity: watch::Receiver<bool>,
    tx: WeakUnboundedSender<Message<T>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connected = *connectivity.borrow_and_update();
        while connectivity.changed().await.is_ok() {
            let now = *connectivity.borrow_and_update();
            if now && !connected {
                let Some(tx) = tx.upgrade() else { break };
                if tx.send(Message::NetworkReconnected).is_err() {
                    break;
                }
            }
            connected = now;
        }
    })
}

//! Immutable state snapshots published by replicas.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::time::Instant;

use crate::ReplicaError;
use crate::optimistic::OptimisticUpdate;

/// Identifier of one observer registered on a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Allocate a process-unique observer id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ObserverId(NEXT.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// When a replica was last observed by an active observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservingTime {
    /// Never had an active observer.
    Never,
    /// The last active observer left at this instant.
    TimeInPast(Instant),
    /// Currently has at least one active observer.
    Now,
}

impl Ord for ObservingTime {
    fn cmp(&self, other: &Self) -> Ordering {
        use ObservingTime::*;
        match (self, other) {
            (Never, Never) | (Now, Now) => Ordering::Equal,
            (Never, _) | (_, Now) => Ordering::Less,
            (_, Never) | (Now, _) => Ordering::Greater,
            (TimeInPast(a), TimeInPast(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for ObservingTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Derived summary of an [`ObservingState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservingStatus {
    /// No observers at all.
    None,
    /// Observers exist but none is active.
    Inactive,
    /// At least one observer is active.
    Active,
}

/// Which observers a replica has and which of them are active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservingState {
    pub observer_ids: HashSet<ObserverId>,
    pub active_observer_ids: HashSet<ObserverId>,
    pub last_observing_time: ObservingTime,
}

impl Default for ObservingState {
    fn default() -> Self {
        Self {
            observer_ids: HashSet::new(),
            active_observer_ids: HashSet::new(),
            last_observing_time: ObservingTime::Never,
        }
    }
}

impl ObservingState {
    pub fn observer_count(&self) -> usize {
        self.observer_ids.len()
    }

    pub fn active_observer_count(&self) -> usize {
        self.active_observer_ids.len()
    }

    pub fn status(&self) -> ObservingStatus {
        if !self.active_observer_ids.is_empty() {
            ObservingStatus::Active
        } else if !self.observer_ids.is_empty() {
            ObservingStatus::Inactive
        } else {
            ObservingStatus::None
        }
    }
}

/// A cached value together with its freshness and pending optimistic updates.
#[derive(Clone)]
pub struct ReplicaData<T> {
    /// Committed value.
    pub value: T,
    pub is_fresh: bool,
    /// When `value` last changed.
    pub changing_date: Instant,
    /// Pending updates, oldest first.
    pub optimistic_updates: Vec<OptimisticUpdate<T>>,
}

impl<T: Clone> ReplicaData<T> {
    pub fn new(value: T, is_fresh: bool) -> Self {
        Self {
            value,
            is_fresh,
            changing_date: Instant::now(),
            optimistic_updates: Vec::new(),
        }
    }

    /// The committed value with every pending optimistic update applied in order.
    pub fn value_with_optimistic_updates(&self) -> T {
        self.optimistic_updates
            .iter()
            .fold(self.value.clone(), |value, update| update.apply(&value))
    }
}

impl<T: fmt::Debug> fmt::Debug for ReplicaData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaData")
            .field("value", &self.value)
            .field("is_fresh", &self.is_fresh)
            .field("changing_date", &self.changing_date)
            .field("optimistic_updates", &self.optimistic_updates.len())
            .finish()
    }
}

/// Snapshot of everything a replica knows about its resource.
#[derive(Clone)]
pub struct ReplicaState<T> {
    pub loading: bool,
    pub data: Option<ReplicaData<T>>,
    pub error: Option<ReplicaError>,
    pub observing_state: ObservingState,
    /// Some caller is waiting on `get_data` for the in-flight load.
    pub data_requested: bool,
    /// The in-flight load was started while no observer was active.
    pub preloading: bool,
    /// Storage has not been read since construction or the last clear.
    pub loading_from_storage_required: bool,
}

impl<T> ReplicaState<T> {
    /// Initial state of a replica.
    pub fn empty(has_storage: bool) -> Self {
        Self {
            loading: false,
            data: None,
            error: None,
            observing_state: ObservingState::default(),
            data_requested: false,
            preloading: false,
            loading_from_storage_required: has_storage,
        }
    }

    pub fn has_fresh_data(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.is_fresh)
    }

    /// No observers, no data, no error and nothing loading.
    pub fn is_idle(&self) -> bool {
        self.observing_state.observer_count() == 0
            && self.data.is_none()
            && self.error.is_none()
            && !self.loading
    }
}

impl<T: Clone> ReplicaState<T> {
    /// The displayed value, including pending optimistic updates.
    pub fn value(&self) -> Option<T> {
        self.data.as_ref().map(ReplicaData::value_with_optimistic_updates)
    }
}

impl<T: fmt::Debug> fmt::Debug for ReplicaState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaState")
            .field("loading", &self.loading)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("observing_state", &self.observing_state)
            .field("data_requested", &self.data_requested)
            .field("preloading", &self.preloading)
            .field(
                "loading_from_storage_required",
                &self.loading_from_storage_required,
            )
            .finish()
    }
}

/// Whether invalidation should also trigger a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationMode {
    DontRefresh,
    RefreshIfHasObservers,
    #[default]
    RefreshIfHasActiveObservers,
    RefreshAlways,
}

impl InvalidationMode {
    /// Whether a replica in `status` should refresh under this mode.
    pub fn should_refresh(self, status: ObservingStatus) -> bool {
        match self {
            InvalidationMode::DontRefresh => false,
            InvalidationMode::RefreshIfHasObservers => status != ObservingStatus::None,
            InvalidationMode::RefreshIfHasActiveObservers => status == ObservingStatus::Active,
            InvalidationMode::RefreshAlways => true,
        }
    }
}

/// Aggregate counters across the children of a keyed registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyedReplicaState {
    pub replica_count: usize,
    pub replica_with_observers_count: usize,
    pub replica_with_active_observers_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_observing_time_order() {
        let earlier = Instant::now();
        let later = earlier + Duration::from_secs(1);
        assert!(ObservingTime::Never < ObservingTime::TimeInPast(earlier));
        assert!(ObservingTime::TimeInPast(earlier) < ObservingTime::TimeInPast(later));
        assert!(ObservingTime::TimeInPast(later) < ObservingTime::Now);
        assert_eq!(ObservingTime::Now.cmp(&ObservingTime::Now), Ordering::Equal);
    }

    #[test]
    fn test_observing_status() {
        let mut state = ObservingState::default();
        assert_eq!(state.status(), ObservingStatus::None);

        let id = ObserverId::next();
        state.observer_ids.insert(id);
        assert_eq!(state.status(), ObservingStatus::Inactive);

        state.active_observer_ids.insert(id);
        assert_eq!(state.status(), ObservingStatus::Active);
    }

    #[test]
    fn test_invalidation_mode_should_refresh() {
        use InvalidationMode::*;
        use ObservingStatus as S;

        assert!(!DontRefresh.should_refresh(S::Active));
        assert!(RefreshIfHasObservers.should_refresh(S::Inactive));
        assert!(!RefreshIfHasObservers.should_refresh(S::None));
        assert!(RefreshIfHasActiveObservers.should_refresh(S::Active));
        assert!(!RefreshIfHasActiveObservers.should_refresh(S::Inactive));
        assert!(RefreshAlways.should_refresh(S::None));
    }

    #[test]
    fn test_empty_state_is_idle() {
        let state = ReplicaState::<String>::empty(true);
        assert!(state.is_idle());
        assert!(state.loading_from_storage_required);
        assert!(!state.has_fresh_data());
        assert!(state.value().is_none());
    }

    #[test]
    fn test_value_with_optimistic_updates_applies_in_order() {
        let mut data = ReplicaData::new(2, true);
        data.optimistic_updates
            .push(OptimisticUpdate::new(|v: &i32| v + 3));
        data.optimistic_updates
            .push(OptimisticUpdate::new(|v: &i32| v * 10));
        assert_eq!(data.value_with_optimistic_updates(), 50);
        assert_eq!(data.value, 2);
    }
}

//! Events describing replica transitions, in the order they occur.

use crate::ReplicaError;
use crate::observer::ObserverCountChanged;

/// How a load ended.
#[derive(Debug, Clone)]
pub enum LoadingOutcome {
    Success,
    Error(ReplicaError),
    Canceled,
}

/// Update event for replica event subscribers.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A load attempt started.
    LoadingStarted,
    /// Storage was consulted as the first step of a load.
    StorageRead { found: bool },
    /// A load attempt ended.
    LoadingFinished(LoadingOutcome),
    /// Data became fresh.
    BecameFresh,
    /// Data became stale.
    BecameStale,
    /// Data and error were dropped.
    Cleared,
    /// The error was dropped.
    ClearedError,
    /// Observer or active observer count changed.
    ObserverCountChanged(ObserverCountChanged),
}

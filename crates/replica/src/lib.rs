//! Observer-driven reactive data cache.
//!
//! A replica is a single-resource cache cell: it holds at most one value
//! of a resource fetched from a remote source, publishes every state change
//! to its observers, and decides on its own when to fetch, when data goes
//! stale and when unused data is dropped.
//!
//! ## Features
//!
//! - **Replica**: serialized state machine with single-flight loading
//! - **Observers**: active/inactive accounting that drives revalidation and idle timers
//! - **Freshness**: stale-time tracking and explicit invalidation
//! - **Optimistic updates**: provisional transforms with commit and rollback
//! - **Keyed replicas**: bounded per-key registry with pluggable eviction
//! - **Storage**: optional persistent first-read layer (memory or JSON file)
//! - **Client**: named registry owning the shared network connectivity signal

mod actor;
pub mod client;
mod error;
pub mod event;
mod freshness;
pub mod keyed;
mod keyed_view;
mod loader;
pub mod observer;
pub mod optimistic;
pub mod replica;
pub mod settings;
pub mod state;
pub mod storage;
mod timer;

pub use client::ReplicaClient;
pub use error::{BoxError, ClientError, ReplicaError, StorageError};
pub use event::{LoadingOutcome, ReplicaEvent};
pub use keyed::{
    EvictionStrategy, FnKeyedFetcher, KeyedFetcher, KeyedPhysicalReplica, KeyedReplicaBuilder,
    ReplicaFactory, ReplicaKey, StateComparator, keyed_fetcher_fn,
};
pub use keyed_view::KeyedView;
pub use loader::{Fetcher, FnFetcher, fetcher_fn};
pub use observer::ObserverCountChanged;
pub use optimistic::OptimisticUpdate;
pub use replica::{Observer, PhysicalReplica, Replica, ReplicaBuilder};
pub use settings::ReplicaSettings;
pub use state::{
    InvalidationMode, KeyedReplicaState, ObserverId, ObservingState, ObservingStatus,
    ObservingTime, ReplicaData, ReplicaState,
};
pub use storage::{JsonFileStorage, MemoryStorage, Storage};

//! A single-resource view over a keyed registry whose key changes over time.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::error::ReplicaError;
use crate::keyed::{KeyedPhysicalReplica, ReplicaKey};
use crate::replica::{Observer, Replica};
use crate::state::ReplicaState;

/// Follows the child selected by a key signal.
///
/// Observers of the view are attached to exactly one child at a time: when
/// the key changes they detach from the old child and attach to the new one
/// with the same activity signal. With no key selected, observers see an
/// empty state.
pub struct KeyedView<K, T> {
    keyed: KeyedPhysicalReplica<K, T>,
    key: watch::Receiver<Option<K>>,
}

impl<K: ReplicaKey, T: Clone + Send + Sync + 'static> KeyedView<K, T> {
    pub(crate) fn new(keyed: KeyedPhysicalReplica<K, T>, key: watch::Receiver<Option<K>>) -> Self {
        Self { keyed, key }
    }

    pub fn current_key(&self) -> Option<K> {
        self.key.borrow().clone()
    }
}

#[async_trait]
impl<K: ReplicaKey, T: Clone + Send + Sync + 'static> Replica<T> for KeyedView<K, T> {
    fn observe(&self, active: watch::Receiver<bool>) -> Observer<T> {
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        let keyed = self.keyed.clone();
        let mut key_rx = self.key.clone();

        let task = tokio::spawn(async move {
            let mut activity_probe = active.clone();
            let mut key_open = true;
            let mut current = key_rx.borrow_and_update().clone();

            loop {
                let mut child = match &current {
                    Some(key) => match keyed.observe(key.clone(), active.clone()).await {
                        Ok(observer) => Some(observer),
                        Err(_) => return,
                    },
                    None => {
                        if states_tx.send(ReplicaState::empty(false)).is_err() {
                            return;
                        }
                        None
                    }
                };

                loop {
                    tokio::select! {
                        changed = key_rx.changed(), if key_open => {
                            if changed.is_err() {
                                key_open = false;
                                continue;
                            }
                            let next = key_rx.borrow_and_update().clone();
                            if next != current {
                                trace!(from = ?current, to = ?next, "keyed view switching key");
                                current = next;
                                break;
                            }
                        }
                        state = next_child_state(&mut child) => match state {
                            Some(state) => {
                                if states_tx.send(state).is_err() {
                                    return;
                                }
                            }
                            None => return,
                        },
                        closed = activity_probe.changed() => {
                            if closed.is_err() {
                                return;
                            }
                        }
                    }
                }
                // `child` drops here, detaching from the old key.
            }
        });

        Observer::forwarding(states_rx, task)
    }

    fn refresh(&self) {
        if let Some(key) = self.current_key() {
            self.keyed.refresh(key);
        }
    }

    fn revalidate(&self) {
        if let Some(key) = self.current_key() {
            self.keyed.revalidate(key);
        }
    }

    async fn get_data(&self, force_refresh: bool) -> Result<T, ReplicaError> {
        let key = self.current_key().ok_or(ReplicaError::NoKey)?;
        self.keyed.get_data(key, force_refresh).await
    }
}

async fn next_child_state<T>(child: &mut Option<Observer<T>>) -> Option<ReplicaState<T>> {
    match child {
        Some(observer) => observer.next_state().await,
        None => std::future::pending().await,
    }
}

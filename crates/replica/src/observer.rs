//! Observer accounting for a single replica.

use tokio::time::Instant;

use crate::state::{ObserverId, ObservingState, ObservingTime};

/// Emitted whenever the observer count or the active observer count changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverCountChanged {
    pub count: usize,
    pub previous_count: usize,
    pub active_count: usize,
    pub previous_active_count: usize,
}

impl ObserverCountChanged {
    /// More observers than before, active or not.
    pub fn observer_added(&self) -> bool {
        self.count > self.previous_count
    }

    pub fn active_observer_added(&self) -> bool {
        self.active_count > self.previous_active_count
    }

    /// The last observer just left.
    pub fn became_unobserved(&self) -> bool {
        self.count == 0 && self.previous_count > 0
    }
}

/// Tracks which observers exist and which are active.
///
/// Pure bookkeeping: the owning replica applies the resulting
/// [`ObservingState`] and reacts to [`ObserverCountChanged`].
#[derive(Debug, Default)]
pub struct ObserverLifecycle {
    state: ObservingState,
}

impl ObserverLifecycle {
    pub fn state(&self) -> &ObservingState {
        &self.state
    }

    pub fn observer_added(&mut self, id: ObserverId, active: bool) -> Option<ObserverCountChanged> {
        self.update(|state| {
            state.observer_ids.insert(id);
            if active {
                state.active_observer_ids.insert(id);
            }
        })
    }

    pub fn observer_removed(&mut self, id: ObserverId) -> Option<ObserverCountChanged> {
        self.update(|state| {
            state.observer_ids.remove(&id);
            state.active_observer_ids.remove(&id);
        })
    }

    /// Activating an unknown observer is ignored.
    pub fn observer_activated(&mut self, id: ObserverId) -> Option<ObserverCountChanged> {
        self.update(|state| {
            if state.observer_ids.contains(&id) {
                state.active_observer_ids.insert(id);
            }
        })
    }

    pub fn observer_deactivated(&mut self, id: ObserverId) -> Option<ObserverCountChanged> {
        self.update(|state| {
            state.active_observer_ids.remove(&id);
        })
    }

    fn update(&mut self, change: impl FnOnce(&mut ObservingState)) -> Option<ObserverCountChanged> {
        let previous_count = self.state.observer_count();
        let previous_active_count = self.state.active_observer_count();

        change(&mut self.state);

        let count = self.state.observer_count();
        let active_count = self.state.active_observer_count();

        if active_count > 0 {
            self.state.last_observing_time = ObservingTime::Now;
        } else if previous_active_count > 0 {
            self.state.last_observing_time = ObservingTime::TimeInPast(Instant::now());
        }

        if count == previous_count && active_count == previous_active_count {
            return None;
        }

        Some(ObserverCountChanged {
            count,
            previous_count,
            active_count,
            previous_active_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_inactive_then_activate() {
        let mut lifecycle = ObserverLifecycle::default();
        let id = ObserverId::next();

        let added = lifecycle.observer_added(id, false).unwrap();
        assert!(added.observer_added());
        assert!(!added.active_observer_added());
        assert_eq!(lifecycle.state().last_observing_time, ObservingTime::Never);

        let activated = lifecycle.observer_activated(id).unwrap();
        assert!(activated.active_observer_added());
        assert!(!activated.observer_added());
        assert_eq!(lifecycle.state().last_observing_time, ObservingTime::Now);
    }

    #[test]
    fn test_repeated_activation_emits_nothing() {
        let mut lifecycle = ObserverLifecycle::default();
        let id = ObserverId::next();
        lifecycle.observer_added(id, true);
        assert!(lifecycle.observer_activated(id).is_none());
    }

    #[test]
    fn test_last_active_leaving_records_time() {
        let mut lifecycle = ObserverLifecycle::default();
        let id = ObserverId::next();
        lifecycle.observer_added(id, true);

        let removed = lifecycle.observer_removed(id).unwrap();
        assert!(removed.became_unobserved());
        assert!(matches!(
            lifecycle.state().last_observing_time,
            ObservingTime::TimeInPast(_)
        ));
    }

    #[test]
    fn test_activating_unknown_observer_is_ignored() {
        let mut lifecycle = ObserverLifecycle::default();
        assert!(lifecycle.observer_activated(ObserverId::next()).is_none());
        assert!(lifecycle.state().active_observer_ids.is_empty());
    }

    #[test]
    fn test_removing_unknown_observer_is_noop() {
        let mut lifecycle = ObserverLifecycle::default();
        lifecycle.observer_added(ObserverId::next(), false);
        assert!(lifecycle.observer_removed(ObserverId::next()).is_none());
        assert_eq!(lifecycle.state().observer_count(), 1);
    }
}

//! Optimistic updates: tentative transforms layered over the committed value.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

use crate::state::ReplicaData;

/// A tentative transform of a cached value.
///
/// Updates compare by identity: two clones of the same update are equal,
/// two updates built from identical closures are not.
pub struct OptimisticUpdate<T> {
    id: u64,
    transform: Arc<dyn Fn(&T) -> T + Send + Sync>,
}

impl<T> OptimisticUpdate<T> {
    pub fn new(transform: impl Fn(&T) -> T + Send + Sync + 'static) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            transform: Arc::new(transform),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn apply(&self, value: &T) -> T {
        (self.transform)(value)
    }
}

impl<T> Clone for OptimisticUpdate<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<T> PartialEq for OptimisticUpdate<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for OptimisticUpdate<T> {}

impl<T> fmt::Debug for OptimisticUpdate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OptimisticUpdate").field(&self.id).finish()
    }
}

/// Append `update` to the pending list.
///
/// Returns false without changing anything when there is no base value.
pub(crate) fn begin<T>(data: Option<&mut ReplicaData<T>>, update: OptimisticUpdate<T>) -> bool {
    match data {
        Some(data) => {
            data.optimistic_updates.push(update);
            true
        }
        None => false,
    }
}

/// Fold `update` into the committed value and drop it from the pending list.
///
/// Returns the new committed value, or `None` when there is no data.
pub(crate) fn commit<T: Clone>(
    data: Option<&mut ReplicaData<T>>,
    update: &OptimisticUpdate<T>,
) -> Option<T> {
    let data = data?;
    data.value = update.apply(&data.value);
    data.optimistic_updates.retain(|u| u != update);
    data.changing_date = Instant::now();
    Some(data.value.clone())
}

/// Drop `update` from the pending list without applying it.
pub(crate) fn rollback<T>(data: Option<&mut ReplicaData<T>>, update_id: u64) -> bool {
    match data {
        Some(data) => {
            let before = data.optimistic_updates.len();
            data.optimistic_updates.retain(|u| u.id() != update_id);
            data.optimistic_updates.len() != before
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn add(n: i64) -> OptimisticUpdate<i64> {
        OptimisticUpdate::new(move |v: &i64| v + n)
    }

    fn mul(n: i64) -> OptimisticUpdate<i64> {
        OptimisticUpdate::new(move |v: &i64| v.wrapping_mul(n))
    }

    #[test]
    fn test_identity_equality() {
        let a = add(1);
        let b = add(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_begin_without_data_is_noop() {
        assert!(!begin::<i64>(None, add(1)));
    }

    #[test]
    fn test_commit_applies_and_removes() {
        let mut data = ReplicaData::new(10, true);
        let u = add(5);
        begin(Some(&mut data), u.clone());
        assert_eq!(data.value_with_optimistic_updates(), 15);
        assert_eq!(data.value, 10);

        let committed = commit(Some(&mut data), &u);
        assert_eq!(committed, Some(15));
        assert!(data.optimistic_updates.is_empty());
        assert_eq!(data.value_with_optimistic_updates(), 15);
    }

    #[test]
    fn test_rollback_unknown_update() {
        let mut data = ReplicaData::new(1, true);
        assert!(!rollback(Some(&mut data), add(1).id()));
    }

    proptest! {
        #[test]
        fn rollback_restores_visible_value(base in -1000i64..1000, n in -50i64..50, others in prop::collection::vec(-5i64..5, 0..5)) {
            let mut data = ReplicaData::new(base, true);
            for o in &others {
                begin(Some(&mut data), add(*o));
            }
            let before = data.value_with_optimistic_updates();

            let u = mul(n);
            begin(Some(&mut data), u.clone());
            rollback(Some(&mut data), u.id());

            prop_assert_eq!(data.value_with_optimistic_updates(), before);
        }

        #[test]
        fn commit_matches_direct_application(base in -1000i64..1000, n in -50i64..50, noise in prop::collection::vec(-5i64..5, 0..5)) {
            let mut data = ReplicaData::new(base, true);
            let u = add(n);

            let mut interleaved = Vec::new();
            for (i, x) in noise.iter().enumerate() {
                let other = mul(*x);
                begin(Some(&mut data), other.clone());
                interleaved.push(other);
                if i == 0 {
                    begin(Some(&mut data), u.clone());
                }
            }
            if noise.is_empty() {
                begin(Some(&mut data), u.clone());
            }
            for other in &interleaved {
                rollback(Some(&mut data), other.id());
            }

            let committed = commit(Some(&mut data), &u);
            prop_assert_eq!(committed, Some(u.apply(&base)));
            prop_assert!(data.optimistic_updates.is_empty());
        }
    }
}

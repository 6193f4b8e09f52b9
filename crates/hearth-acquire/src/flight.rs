//! Keyed single-flight: concurrent callers for the same key share one
//! underlying future instead of each starting their own.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

/// Registry of in-flight operations keyed by `K`, each yielding a `V`.
pub struct SingleFlight<K, V: Clone> {
    calls: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `make()` for `key`, or join the call already in flight for it.
    ///
    /// Returns the shared output and whether this caller started the work.
    /// `make` is only invoked by the caller that starts the work. The entry is
    /// removed by whichever caller observes completion first, so the next call
    /// after completion starts fresh.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (fut, leader) = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fut = make().boxed().shared();
                    calls.insert(key.clone(), fut.clone());
                    (fut, true)
                }
            }
        };

        let value = fut.clone().await;

        let mut calls = self.calls.lock();
        if calls.get(&key).is_some_and(|current| current.ptr_eq(&fut)) {
            calls.remove(&key);
        }

        (value, leader)
    }

    /// Whether an operation for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.calls.lock().contains_key(key)
    }

    /// Number of distinct keys in flight.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

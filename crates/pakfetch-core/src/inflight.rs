//! Request coalescing.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

type Table<K, V> = Arc<Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>>;

/// Table of in-progress work keyed by request identity.
///
/// The first caller for a key runs the work; callers arriving while it is
/// in flight await the same outcome. The entry removes itself when the work
/// settles, so a later call starts fresh.
pub struct Inflight<K, V: Clone> {
    table: Table<K, V>,
}

impl<K, V> Inflight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key`, or join the run already in flight.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = table.get(&key) {
                existing.clone()
            } else {
                let table_ref = Arc::clone(&self.table);
                let cleanup_key = key.clone();
                let fut = work();
                let shared = async move {
                    let out = fut.await;
                    table_ref
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&cleanup_key);
                    out
                }
                .boxed()
                .shared();
                table.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Number of keys currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for Inflight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V: Clone> fmt::Debug for Inflight<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inflight").finish_non_exhaustive()
    }
}

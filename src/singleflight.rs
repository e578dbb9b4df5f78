//! Request coalescing and per-key locking.
//!
//! [`SingleFlight`] runs at most one future per key at a time; concurrent
//! callers for the same key wait on the same result. The entry is dropped as
//! soon as the call settles, success or failure, so the next caller starts a
//! fresh flight.
//!
//! [`KeyedLock`] serializes critical sections per key. Used to make
//! get-or-create of a certificate atomic per logical id.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};

/// Coalesces concurrent calls that share a key.
pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key` unless a call for that key is already in flight, in
    /// which case wait for and return its result.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = lock(&self.calls).entry(key.clone()).or_default().clone();
        let settle = Settle {
            calls: &self.calls,
            key,
            cell,
        };
        settle.cell.get_or_init(f).await.clone()
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a settled call from the map when the caller leaves.
struct Settle<'a, K: Eq + Hash, V> {
    calls: &'a Mutex<HashMap<K, Arc<OnceCell<V>>>>,
    key: K,
    cell: Arc<OnceCell<V>>,
}

impl<K: Eq + Hash, V> Drop for Settle<'_, K, V> {
    fn drop(&mut self) {
        let mut calls = lock(self.calls);
        let Some(current) = calls.get(&self.key) else {
            return;
        };
        if !Arc::ptr_eq(current, &self.cell) {
            return;
        }
        // Uninitialized means this caller was cancelled. The entry stays only
        // while other callers (each holding a reference besides the map's)
        // still wait on it and can take over the flight.
        if self.cell.initialized() || Arc::strong_count(current) <= 2 {
            calls.remove(&self.key);
        }
    }
}

/// One async mutex per key, created on demand and dropped when unused.
pub struct KeyedLock<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

/// Guard returned by [`KeyedLock::lock`].
pub struct KeyedGuard<'a, K: Eq + Hash> {
    owner: &'a KeyedLock<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty lock set.
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let mutex = lock(&self.locks).entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        lock(&self.locks).len()
    }

    /// True when no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock(&self.owner.locks);
        // Only the map holds a reference once nobody else is waiting.
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

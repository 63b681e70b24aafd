//! A mutex-guarded map for data that one worker routine produces and
//! other routines read, e.g. a guest name to reported-address
//! mapping filled in while guests boot. The intended discipline is a
//! single logical writer and arbitrary readers; the lock is only ever
//! held for the duration of one get or set, never across blocking
//! calls.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Debug)]
pub struct SharedMap<K, V> {
    inner: Arc<Mutex<BTreeMap<K, V>>>,
}

impl<K, V> Clone for SharedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Ord, V> Default for SharedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> SharedMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<K, V>> {
        self.inner.lock().unwrap()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    pub fn clear(&self) {
        self.lock().clear()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<K: Ord, V: Clone> SharedMap<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<K, V>
    where
        K: Clone,
    {
        self.lock().clone()
    }
}

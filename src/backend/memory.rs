use std::time::Duration;

use bytes::Bytes;
use glob_match::glob_match;

use super::{ready, Backend, BackendError, BackendFuture, SetCondition, SetOptions, Ttl};
use crate::store::Store;

/// A backend keeping everything in process, on top of [`Store`]. Every operation completes
/// before it returns.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Store,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend {
            store: Store::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: Bytes) -> BackendFuture<Option<Bytes>> {
        ready(Ok(self.store.lock().get(&key)))
    }

    fn set(&self, key: Bytes, value: Bytes, options: SetOptions) -> BackendFuture<bool> {
        let mut store = self.store.lock();

        let allowed = match options.condition {
            SetCondition::Always => true,
            SetCondition::IfMissing => !store.exists(&key),
            SetCondition::IfExists => store.exists(&key),
        };
        if !allowed {
            return ready(Ok(false));
        }

        match options.expire {
            Some(ttl) => store.set_with_ttl(key, value, ttl),
            None => store.set(key, value),
        }

        ready(Ok(true))
    }

    fn getset(&self, key: Bytes, value: Bytes) -> BackendFuture<Option<Bytes>> {
        let mut store = self.store.lock();
        let previous = store.get(&key);
        store.set(key, value);
        ready(Ok(previous))
    }

    fn getdel(&self, key: Bytes) -> BackendFuture<Option<Bytes>> {
        let value = self.store.lock().remove(&key).map(|value| value.data);
        ready(Ok(value))
    }

    fn mget(&self, keys: Vec<Bytes>) -> BackendFuture<Vec<Option<Bytes>>> {
        let store = self.store.lock();
        let values = keys.iter().map(|key| store.get(key)).collect();
        ready(Ok(values))
    }

    fn mset(&self, pairs: Vec<(Bytes, Bytes)>) -> BackendFuture<()> {
        let mut store = self.store.lock();
        for (key, value) in pairs {
            store.set(key, value);
        }
        ready(Ok(()))
    }

    fn del(&self, keys: Vec<Bytes>) -> BackendFuture<i64> {
        let mut store = self.store.lock();
        let removed = keys
            .iter()
            .filter(|key| store.remove(key).is_some())
            .count();
        ready(Ok(removed as i64))
    }

    fn exists(&self, keys: Vec<Bytes>) -> BackendFuture<i64> {
        let store = self.store.lock();
        // Repeated keys are counted once per mention.
        let found = keys.iter().filter(|key| store.exists(key)).count();
        ready(Ok(found as i64))
    }

    fn incr_by(&self, key: Bytes, increment: i64) -> BackendFuture<i64> {
        let result = self
            .store
            .lock()
            .incr_by(&key, increment)
            .map_err(BackendError::Server);
        ready(result)
    }

    fn append(&self, key: Bytes, value: Bytes) -> BackendFuture<i64> {
        let len = self.store.lock().append(&key, &value);
        ready(Ok(len as i64))
    }

    fn strlen(&self, key: Bytes) -> BackendFuture<i64> {
        let len = self.store.lock().get(&key).map_or(0, |value| value.len());
        ready(Ok(len as i64))
    }

    fn expire(&self, key: Bytes, ttl: Duration) -> BackendFuture<bool> {
        let mut store = self.store.lock();
        // A zero timeout deletes the key right away.
        let applied = if ttl.is_zero() {
            store.remove(&key).is_some()
        } else {
            store.expire(&key, ttl)
        };
        ready(Ok(applied))
    }

    fn persist(&self, key: Bytes) -> BackendFuture<bool> {
        ready(Ok(self.store.lock().persist(&key)))
    }

    fn ttl(&self, key: Bytes) -> BackendFuture<Ttl> {
        let ttl = match self.store.lock().ttl(&key) {
            None => Ttl::Missing,
            Some(None) => Ttl::Persistent,
            Some(Some(remaining)) => Ttl::Expires(remaining),
        };
        ready(Ok(ttl))
    }

    fn key_type(&self, key: Bytes) -> BackendFuture<String> {
        let name = if self.store.lock().exists(&key) {
            "string"
        } else {
            "none"
        };
        ready(Ok(name.to_string()))
    }

    fn keys(&self, pattern: Bytes) -> BackendFuture<Vec<Bytes>> {
        let pattern = String::from_utf8_lossy(&pattern);
        let store = self.store.lock();

        let mut keys: Vec<Bytes> = store
            .keys()
            .filter(|key| glob_match(&pattern, &String::from_utf8_lossy(key)))
            .cloned()
            .collect();
        keys.sort();

        ready(Ok(keys))
    }

    fn dbsize(&self) -> BackendFuture<i64> {
        ready(Ok(self.store.lock().size() as i64))
    }

    fn flushdb(&self) -> BackendFuture<()> {
        self.store.lock().clear();
        ready(Ok(()))
    }
}

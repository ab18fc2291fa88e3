use bytes::{Bytes, BytesMut};
use num_traits::CheckedAdd;
use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};

/// The Store is responsible for managing key-value pairs, with optional time-to-live settings for
/// each key. It automatically handles the expiration and removal of keys when their TTLs elapse.
/// The store is designed to be thread-safe, allowing it to be shared and cloned cheaply using
/// reference counting.
#[derive(Clone)]
pub struct Store {
    inner: Arc<InnerStore>,
}

impl Store {
    /// Creates an empty store. Must be called from within a tokio runtime, the expiration task is
    /// spawned on it.
    pub fn new() -> Store {
        let state = State {
            keys: HashMap::new(),
            ttls: BTreeSet::new(),
        };

        let waker = Arc::new(Notify::new());
        let inner = Arc::new(InnerStore {
            state: Mutex::new(state),
            waker,
        });

        tokio::spawn({
            let inner = Arc::downgrade(&inner);
            async move { remove_expired_keys(inner).await }
        });

        Self { inner }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InnerStore {
    state: Mutex<State>,
    waker: Arc<Notify>,
}

impl Drop for InnerStore {
    fn drop(&mut self) {
        // Lets the expiration task notice the store is gone.
        self.waker.notify_one();
    }
}

pub struct InnerStoreLocked<'a> {
    state: MutexGuard<'a, State>,
    waker: &'a Notify,
}

impl<'a> InnerStoreLocked<'a> {
    pub fn set(&mut self, key: Key, data: Bytes) {
        let value = Value {
            data,
            expires_at: None,
        };
        self.insert(key, value);
    }

    /// A `ttl` too large to be represented as a deadline never expires.
    pub fn set_with_ttl(&mut self, key: Key, data: Bytes, ttl: Duration) {
        let value = Value {
            data,
            expires_at: Instant::now().checked_add(ttl),
        };
        self.insert(key, value);
    }

    /// Updates the value of `key`, keeping its expiration.
    pub fn update(&mut self, key: Key, data: Bytes) {
        let expires_at = self.live(&key).and_then(|value| value.expires_at);
        self.insert(key, Value { data, expires_at });
    }

    fn insert(&mut self, key: Key, value: Value) {
        let expires_at = value.expires_at;
        if let Some(previous) = self.state.keys.insert(key.clone(), value) {
            if let Some(when) = previous.expires_at {
                self.state.ttls.remove(&(when, key.clone()));
            }
        }

        if let Some(when) = expires_at {
            self.state.ttls.insert((when, key.clone()));

            let next_to_expire = self.state.ttls.iter().next().map(|(_, key)| key);
            let expires_next = next_to_expire == Some(&key);
            if expires_next {
                self.waker.notify_one();
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.live(key).map(|v| v.data.clone())
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Value> {
        let value = self.state.keys.remove(key)?;
        if let Some(when) = value.expires_at {
            self.state
                .ttls
                .remove(&(when, Bytes::copy_from_slice(key)));
        }

        // A key that expired but was not collected yet is already gone.
        match value.expires_at {
            Some(when) if when <= Instant::now() => None,
            _ => Some(value),
        }
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.live(key).is_some()
    }

    pub fn size(&self) -> usize {
        let now = Instant::now();
        self.state
            .keys
            .values()
            .filter(|value| !value.expired(now))
            .count()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        let now = Instant::now();
        self.state
            .keys
            .iter()
            .filter(move |(_, value)| !value.expired(now))
            .map(|(key, _)| key)
    }

    pub fn clear(&mut self) {
        self.state.keys.clear();
        self.state.ttls.clear();
    }

    /// `None` when the key does not exist, `Some(None)` when it never expires.
    pub fn ttl(&self, key: &[u8]) -> Option<Option<Duration>> {
        let now = Instant::now();
        self.live(key)
            .map(|value| value.expires_at.map(|when| when.saturating_duration_since(now)))
    }

    pub fn expire(&mut self, key: &[u8], ttl: Duration) -> bool {
        match self.get(key) {
            Some(data) => {
                self.set_with_ttl(Bytes::copy_from_slice(key), data, ttl);
                true
            }
            None => false,
        }
    }

    /// Removes the expiration of `key`. Returns `false` if the key does not exist or has no
    /// expiration.
    pub fn persist(&mut self, key: &[u8]) -> bool {
        match self.live(key) {
            Some(Value {
                data,
                expires_at: Some(_),
            }) => {
                let data = data.clone();
                self.set(Bytes::copy_from_slice(key), data);
                true
            }
            _ => false,
        }
    }

    pub fn append(&mut self, key: &[u8], data: &[u8]) -> usize {
        let mut value = BytesMut::from(&self.get(key).unwrap_or_default()[..]);
        value.extend_from_slice(data);
        let len = value.len();

        self.update(Bytes::copy_from_slice(key), value.freeze());

        len
    }

    pub fn incr_by<T>(&mut self, key: &[u8], increment: T) -> Result<T, String>
    where
        T: FromStr + ToString + CheckedAdd + Default,
    {
        let err = "ERR value is not an integer or out of range";

        let value = match self.get(key) {
            Some(value) => std::str::from_utf8(value.as_ref())
                .map_err(|_| err.to_string())
                .and_then(|s| s.parse::<T>().map_err(|_| err.to_string()))?,
            None => T::default(),
        };

        let value = value
            .checked_add(&increment)
            .ok_or_else(|| "ERR increment or decrement would overflow".to_string())?;
        self.update(Bytes::copy_from_slice(key), value.to_string().into());

        Ok(value)
    }

    pub fn remove_expired_keys(&mut self) -> Option<Instant> {
        let now = Instant::now();

        let expired_keys: Vec<(Instant, Key)> = self
            .state
            .ttls
            .iter()
            .take_while(|(expires_at, _)| expires_at <= &now)
            .cloned()
            .collect();

        for (when, key) in expired_keys {
            self.state.keys.remove(&key);
            self.state.ttls.remove(&(when, key));
        }

        self.state
            .ttls
            .iter()
            .next()
            .map(|&(expires_at, _)| expires_at)
    }

    // The value of `key` unless it expired and is only waiting to be collected.
    fn live(&self, key: &[u8]) -> Option<&Value> {
        let now = Instant::now();
        self.state
            .keys
            .get(key)
            .filter(|value| !value.expired(now))
    }
}

impl Deref for Store {
    type Target = InnerStore;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl InnerStore {
    pub fn lock(&self) -> InnerStoreLocked<'_> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        InnerStoreLocked {
            state,
            waker: &self.waker,
        }
    }
}

type Key = Bytes;

pub struct Value {
    pub data: Bytes,
    pub expires_at: Option<Instant>,
}

impl Value {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |when| when <= now)
    }
}

pub struct State {
    keys: HashMap<Key, Value>,
    ttls: BTreeSet<(Instant, Key)>,
}

// Runs until the store is dropped.
async fn remove_expired_keys(store: std::sync::Weak<InnerStore>) {
    loop {
        let (next_expiration, waker) = {
            let Some(store) = store.upgrade() else {
                return;
            };
            let next_expiration = store.lock().remove_expired_keys();
            (next_expiration, store.waker.clone())
        };

        if let Some(next_expiration) = next_expiration {
            tokio::select! {
                _ = sleep_until(next_expiration) => {}
                _ = waker.notified() => {}
            }
        } else {
            waker.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;
    use tokio::time::Duration;

    #[tokio::test]
    async fn ttl() {
        time::pause();

        let store = Store::new();

        {
            let mut store = store.lock();

            store.set_with_ttl(
                Bytes::from("key1"),
                Bytes::from("value1"),
                Duration::from_secs(10),
            );

            store.set_with_ttl(
                Bytes::from("key2"),
                Bytes::from("value2"),
                Duration::from_secs(20),
            );
        }

        assert_eq!(store.lock().keys().count(), 2);

        time::advance(Duration::from_secs(10)).await;
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(store.lock().keys().count(), 1);
        assert!(store.lock().exists(b"key2"));

        time::advance(Duration::from_secs(20)).await;
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.lock().keys().count(), 0);

        {
            let mut store = store.lock();

            store.set_with_ttl(
                Bytes::from("key3"),
                Bytes::from("value3"),
                Duration::from_secs(20),
            );
        }

        assert_eq!(store.lock().keys().count(), 1);

        time::advance(Duration::from_secs(20)).await;
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.lock().keys().count(), 0);
    }

    #[tokio::test]
    async fn unrepresentable_ttl_never_expires() {
        let store = Store::new();
        let mut store = store.lock();

        store.set_with_ttl(Bytes::from("key"), Bytes::from("value"), Duration::MAX);

        assert_eq!(store.get(b"key"), Some(Bytes::from("value")));
        assert_eq!(store.ttl(b"key"), Some(None));
    }

    #[tokio::test]
    async fn overwrite_clears_ttl() {
        time::pause();

        let store = Store::new();
        {
            let mut store = store.lock();
            store.set_with_ttl(Bytes::from("key"), Bytes::from("1"), Duration::from_secs(5));
            store.set(Bytes::from("key"), Bytes::from("2"));
        }

        time::advance(Duration::from_secs(10)).await;
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(store.lock().get(b"key"), Some(Bytes::from("2")));
        assert_eq!(store.lock().ttl(b"key"), Some(None));
    }

    #[tokio::test]
    async fn persist_and_expire() {
        time::pause();

        let store = Store::new();
        let mut locked = store.lock();

        assert!(!locked.expire(b"missing", Duration::from_secs(1)));

        locked.set(Bytes::from("key"), Bytes::from("value"));
        assert!(!locked.persist(b"key"));
        assert!(locked.expire(b"key", Duration::from_secs(30)));
        assert_eq!(locked.ttl(b"key"), Some(Some(Duration::from_secs(30))));
        assert!(locked.persist(b"key"));
        assert_eq!(locked.ttl(b"key"), Some(None));
        assert_eq!(locked.ttl(b"missing"), None);
    }

    #[tokio::test]
    async fn incr_by() {
        let store = Store::new();
        let mut store = store.lock();

        assert_eq!(store.incr_by(b"counter", 5i64), Ok(5));
        assert_eq!(store.incr_by(b"counter", -7i64), Ok(-2));
        assert_eq!(store.get(b"counter"), Some(Bytes::from("-2")));

        store.set(Bytes::from("text"), Bytes::from("abc"));
        assert_eq!(
            store.incr_by(b"text", 1i64),
            Err("ERR value is not an integer or out of range".to_string())
        );

        store.set(Bytes::from("max"), Bytes::from(i64::MAX.to_string()));
        assert!(store.incr_by(b"max", 1i64).is_err());
    }

    #[tokio::test]
    async fn append_keeps_ttl() {
        time::pause();

        let store = Store::new();
        let mut store = store.lock();

        assert_eq!(store.append(b"key", b"Hello"), 5);
        store.set_with_ttl(Bytes::from("key"), Bytes::from("Hello"), Duration::from_secs(10));
        assert_eq!(store.append(b"key", b", World"), 12);

        assert_eq!(store.get(b"key"), Some(Bytes::from("Hello, World")));
        assert!(matches!(store.ttl(b"key"), Some(Some(_))));
    }
}

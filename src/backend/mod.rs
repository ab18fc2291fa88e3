pub mod memory;
pub mod upstream;

use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use thiserror::Error as ThisError;

pub use memory::MemoryBackend;
pub use upstream::UpstreamBackend;

pub type BackendFuture<T> = BoxFuture<'static, Result<T, BackendError>>;

#[derive(Debug, ThisError)]
pub enum BackendError {
    /// An error reply sent by the store, relayed to the client as is.
    #[error("{0}")]
    Server(String),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("upstream protocol error; {0}")]
    Protocol(String),
    #[error("upstream connection closed")]
    Closed,
    #[error("upstream io error")]
    Io(#[from] std::io::Error),
    #[error("upstream error")]
    Other(#[source] crate::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetCondition {
    #[default]
    Always,
    /// `NX`
    IfMissing,
    /// `XX`
    IfExists,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub expire: Option<Duration>,
    pub condition: SetCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// The store the proxy forwards to.
///
/// There is one asynchronous operation per supported verb. Operations start their work when
/// called and return a `'static` future, so a handler can hand it over without waiting on it.
/// Every operation defaults to [`BackendError::Unsupported`], backends only implement what they
/// can serve.
pub trait Backend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn get(&self, _key: Bytes) -> BackendFuture<Option<Bytes>> {
        unsupported("GET")
    }

    /// Returns whether the value was written, which depends on `options.condition`.
    fn set(&self, _key: Bytes, _value: Bytes, _options: SetOptions) -> BackendFuture<bool> {
        unsupported("SET")
    }

    fn getset(&self, _key: Bytes, _value: Bytes) -> BackendFuture<Option<Bytes>> {
        unsupported("GETSET")
    }

    fn getdel(&self, _key: Bytes) -> BackendFuture<Option<Bytes>> {
        unsupported("GETDEL")
    }

    fn mget(&self, _keys: Vec<Bytes>) -> BackendFuture<Vec<Option<Bytes>>> {
        unsupported("MGET")
    }

    fn mset(&self, _pairs: Vec<(Bytes, Bytes)>) -> BackendFuture<()> {
        unsupported("MSET")
    }

    fn del(&self, _keys: Vec<Bytes>) -> BackendFuture<i64> {
        unsupported("DEL")
    }

    fn exists(&self, _keys: Vec<Bytes>) -> BackendFuture<i64> {
        unsupported("EXISTS")
    }

    fn incr_by(&self, _key: Bytes, _increment: i64) -> BackendFuture<i64> {
        unsupported("INCRBY")
    }

    fn append(&self, _key: Bytes, _value: Bytes) -> BackendFuture<i64> {
        unsupported("APPEND")
    }

    fn strlen(&self, _key: Bytes) -> BackendFuture<i64> {
        unsupported("STRLEN")
    }

    fn expire(&self, _key: Bytes, _ttl: Duration) -> BackendFuture<bool> {
        unsupported("EXPIRE")
    }

    fn persist(&self, _key: Bytes) -> BackendFuture<bool> {
        unsupported("PERSIST")
    }

    fn ttl(&self, _key: Bytes) -> BackendFuture<Ttl> {
        unsupported("TTL")
    }

    /// The name of the type stored at `key`, `none` when the key does not exist.
    fn key_type(&self, _key: Bytes) -> BackendFuture<String> {
        unsupported("TYPE")
    }

    fn keys(&self, _pattern: Bytes) -> BackendFuture<Vec<Bytes>> {
        unsupported("KEYS")
    }

    fn dbsize(&self) -> BackendFuture<i64> {
        unsupported("DBSIZE")
    }

    fn flushdb(&self) -> BackendFuture<()> {
        unsupported("FLUSHDB")
    }
}

fn unsupported<T: Send + 'static>(verb: &'static str) -> BackendFuture<T> {
    future::ready(Err(BackendError::Unsupported(verb))).boxed()
}

fn ready<T: Send + 'static>(result: Result<T, BackendError>) -> BackendFuture<T> {
    future::ready(result).boxed()
}

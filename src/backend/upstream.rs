use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::{Backend, BackendError, BackendFuture, SetCondition, SetOptions, Ttl};
use crate::frame::ReplyCodec;
use crate::reply::Reply;

type UpstreamConnection = Framed<TcpStream, ReplyCodec>;

/// A backend forwarding every operation to a RESP speaking store over TCP.
///
/// Calls are spread round-robin over a fixed set of connections, each used by one call at a
/// time. Connections are opened on first use and dropped after any transport or protocol error,
/// the next call through that slot reconnects.
#[derive(Clone)]
pub struct UpstreamBackend {
    inner: Arc<Inner>,
}

struct Inner {
    address: String,
    connections: Vec<Mutex<Option<UpstreamConnection>>>,
    next: AtomicUsize,
}

impl UpstreamBackend {
    pub fn new(address: impl Into<String>, pool_size: usize) -> UpstreamBackend {
        let connections = (0..pool_size.max(1)).map(|_| Mutex::new(None)).collect();

        UpstreamBackend {
            inner: Arc::new(Inner {
                address: address.into(),
                connections,
                next: AtomicUsize::new(0),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Sends `tokens` upstream and turns the reply into `T`. Error replies become
    /// [`BackendError::Server`] and never reach `convert`.
    fn call<T, F>(&self, tokens: Vec<Bytes>, convert: F) -> BackendFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(Reply) -> Result<T, BackendError> + Send + 'static,
    {
        let inner = self.inner.clone();

        async move {
            match inner.execute(Reply::command(tokens)).await? {
                Reply::Error(message) => Err(BackendError::Server(message)),
                reply => convert(reply),
            }
        }
        .boxed()
    }
}

impl Inner {
    async fn execute(&self, command: Reply) -> Result<Reply, BackendError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        let mut slot = self.connections[index].lock().await;

        if slot.is_none() {
            let stream = TcpStream::connect(&self.address).await?;
            stream.set_nodelay(true)?;
            debug!("Connected to upstream {} (slot {})", self.address, index);
            *slot = Some(Framed::new(stream, ReplyCodec::default()));
        }
        let Some(connection) = slot.as_mut() else {
            return Err(BackendError::Closed);
        };

        let result = round_trip(connection, command).await;
        if let Err(err) = &result {
            warn!("Dropping upstream connection (slot {}): {}", index, err);
            *slot = None;
        }

        result
    }
}

async fn round_trip(
    connection: &mut UpstreamConnection,
    command: Reply,
) -> Result<Reply, BackendError> {
    connection.send(command).await.map_err(BackendError::Other)?;

    match connection.next().await {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(err)) => Err(BackendError::Protocol(err.to_string())),
        None => Err(BackendError::Closed),
    }
}

impl Backend for UpstreamBackend {
    fn name(&self) -> &'static str {
        "upstream"
    }

    fn get(&self, key: Bytes) -> BackendFuture<Option<Bytes>> {
        self.call(vec![verb("GET"), key], bulk)
    }

    fn set(&self, key: Bytes, value: Bytes, options: SetOptions) -> BackendFuture<bool> {
        let mut tokens = vec![verb("SET"), key, value];
        if let Some(ttl) = options.expire {
            tokens.push(verb("PX"));
            tokens.push(Bytes::from(ttl.as_millis().to_string()));
        }
        match options.condition {
            SetCondition::Always => {}
            SetCondition::IfMissing => tokens.push(verb("NX")),
            SetCondition::IfExists => tokens.push(verb("XX")),
        }

        // A condition that does not hold gets a null reply.
        self.call(tokens, |reply| match reply {
            Reply::Status(_) => Ok(true),
            Reply::Bulk(None) => Ok(false),
            reply => Err(unexpected(reply)),
        })
    }

    fn getset(&self, key: Bytes, value: Bytes) -> BackendFuture<Option<Bytes>> {
        self.call(vec![verb("GETSET"), key, value], bulk)
    }

    fn getdel(&self, key: Bytes) -> BackendFuture<Option<Bytes>> {
        self.call(vec![verb("GETDEL"), key], bulk)
    }

    fn mget(&self, keys: Vec<Bytes>) -> BackendFuture<Vec<Option<Bytes>>> {
        let mut tokens = vec![verb("MGET")];
        tokens.extend(keys);

        self.call(tokens, |reply| match reply {
            Reply::Array(Some(items)) => items.into_iter().map(bulk).collect(),
            reply => Err(unexpected(reply)),
        })
    }

    fn mset(&self, pairs: Vec<(Bytes, Bytes)>) -> BackendFuture<()> {
        let mut tokens = vec![verb("MSET")];
        for (key, value) in pairs {
            tokens.push(key);
            tokens.push(value);
        }
        self.call(tokens, ok)
    }

    fn del(&self, keys: Vec<Bytes>) -> BackendFuture<i64> {
        let mut tokens = vec![verb("DEL")];
        tokens.extend(keys);
        self.call(tokens, integer)
    }

    fn exists(&self, keys: Vec<Bytes>) -> BackendFuture<i64> {
        let mut tokens = vec![verb("EXISTS")];
        tokens.extend(keys);
        self.call(tokens, integer)
    }

    fn incr_by(&self, key: Bytes, increment: i64) -> BackendFuture<i64> {
        let tokens = vec![verb("INCRBY"), key, Bytes::from(increment.to_string())];
        self.call(tokens, integer)
    }

    fn append(&self, key: Bytes, value: Bytes) -> BackendFuture<i64> {
        self.call(vec![verb("APPEND"), key, value], integer)
    }

    fn strlen(&self, key: Bytes) -> BackendFuture<i64> {
        self.call(vec![verb("STRLEN"), key], integer)
    }

    fn expire(&self, key: Bytes, ttl: Duration) -> BackendFuture<bool> {
        let tokens = vec![verb("PEXPIRE"), key, Bytes::from(ttl.as_millis().to_string())];
        self.call(tokens, |reply| integer(reply).map(|applied| applied == 1))
    }

    fn persist(&self, key: Bytes) -> BackendFuture<bool> {
        self.call(vec![verb("PERSIST"), key], |reply| {
            integer(reply).map(|applied| applied == 1)
        })
    }

    fn ttl(&self, key: Bytes) -> BackendFuture<Ttl> {
        self.call(vec![verb("PTTL"), key], |reply| {
            Ok(match integer(reply)? {
                -2 => Ttl::Missing,
                -1 => Ttl::Persistent,
                millis => Ttl::Expires(Duration::from_millis(millis.max(0) as u64)),
            })
        })
    }

    fn key_type(&self, key: Bytes) -> BackendFuture<String> {
        self.call(vec![verb("TYPE"), key], |reply| match reply {
            Reply::Status(name) => Ok(name),
            reply => Err(unexpected(reply)),
        })
    }

    fn keys(&self, pattern: Bytes) -> BackendFuture<Vec<Bytes>> {
        self.call(vec![verb("KEYS"), pattern], |reply| match reply {
            Reply::Array(Some(items)) => items
                .into_iter()
                .map(|item| bulk(item)?.ok_or_else(|| unexpected(Reply::null())))
                .collect(),
            reply => Err(unexpected(reply)),
        })
    }

    fn dbsize(&self) -> BackendFuture<i64> {
        self.call(vec![verb("DBSIZE")], integer)
    }

    fn flushdb(&self) -> BackendFuture<()> {
        self.call(vec![verb("FLUSHDB")], ok)
    }
}

fn verb(name: &'static str) -> Bytes {
    Bytes::from_static(name.as_bytes())
}

fn bulk(reply: Reply) -> Result<Option<Bytes>, BackendError> {
    match reply {
        Reply::Bulk(value) => Ok(value),
        reply => Err(unexpected(reply)),
    }
}

fn integer(reply: Reply) -> Result<i64, BackendError> {
    match reply {
        Reply::Integer(value) => Ok(value),
        reply => Err(unexpected(reply)),
    }
}

fn ok(reply: Reply) -> Result<(), BackendError> {
    match reply {
        Reply::Status(_) => Ok(()),
        reply => Err(unexpected(reply)),
    }
}

fn unexpected(reply: Reply) -> BackendError {
    BackendError::Protocol(format!("unexpected reply {}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Answers every read with the next canned reply, closing the connection when a reply is
    // `None`.
    async fn fake_upstream(replies: Vec<Option<&'static str>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let mut replies = replies.into_iter();
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                loop {
                    if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                        break;
                    }
                    match replies.next() {
                        Some(Some(reply)) => socket.write_all(reply.as_bytes()).await.unwrap(),
                        _ => break,
                    }
                }
            }
        });

        address
    }

    #[tokio::test]
    async fn converts_replies() {
        let address = fake_upstream(vec![
            Some("$5\r\nvalue\r\n"),
            Some("$-1\r\n"),
            Some(":-1\r\n"),
            Some("+string\r\n"),
        ])
        .await;
        let backend = UpstreamBackend::new(address, 1);

        assert_eq!(
            backend.get(Bytes::from("k")).await.unwrap(),
            Some(Bytes::from("value"))
        );
        assert!(!backend
            .set(
                Bytes::from("k"),
                Bytes::from("v"),
                SetOptions {
                    condition: SetCondition::IfMissing,
                    ..Default::default()
                }
            )
            .await
            .unwrap());
        assert_eq!(
            backend.ttl(Bytes::from("k")).await.unwrap(),
            Ttl::Persistent
        );
        assert_eq!(
            backend.key_type(Bytes::from("k")).await.unwrap(),
            "string"
        );
    }

    #[tokio::test]
    async fn relays_error_replies() {
        let address = fake_upstream(vec![Some(
            "-WRONGTYPE Operation against a key holding the wrong kind of value\r\n",
        )])
        .await;
        let backend = UpstreamBackend::new(address, 1);

        let err = backend.strlen(Bytes::from("k")).await.unwrap_err();

        assert!(matches!(
            err,
            BackendError::Server(ref message) if message.starts_with("WRONGTYPE")
        ));
    }

    #[tokio::test]
    async fn reconnects_after_the_connection_closes() {
        let address = fake_upstream(vec![None, Some(":3\r\n")]).await;
        let backend = UpstreamBackend::new(address, 1);

        let err = backend.dbsize().await.unwrap_err();
        assert!(matches!(err, BackendError::Closed));

        assert_eq!(backend.dbsize().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unreachable_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let backend = UpstreamBackend::new(address, 2);

        assert!(matches!(
            backend.get(Bytes::from("k")).await,
            Err(BackendError::Io(_))
        ));
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, RedisError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};

use rustdis_proxy::backend::{Backend, BackendFuture, MemoryBackend};
use rustdis_proxy::config::Config;
use rustdis_proxy::proxy::Proxy;
use rustdis_proxy::server;

async fn start(config: Config, backend: Arc<dyn Backend>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let proxy = Proxy::new(&config, backend).unwrap();

    tokio::spawn(async move { server::serve(listener, proxy, &config).await });

    address
}

async fn start_memory() -> SocketAddr {
    start(Config::default(), Arc::new(MemoryBackend::new())).await
}

async fn client(address: SocketAddr) -> Result<MultiplexedConnection, RedisError> {
    let client = redis::Client::open(format!("redis://{}/", address))?;
    client.get_multiplexed_async_connection().await
}

/// A proxy serving from memory, and a proxy forwarding to another one.
async fn connect() -> Result<(MultiplexedConnection, MultiplexedConnection), RedisError> {
    let store = start_memory().await;
    let upstream_config = Config {
        upstream: Some(store.to_string()),
        ..Config::default()
    };
    let forwarding = start(
        upstream_config.clone(),
        Arc::new(rustdis_proxy::backend::UpstreamBackend::new(store.to_string(), 2)),
    )
    .await;
    let memory = start_memory().await;

    Ok((client(forwarding).await?, client(memory).await?))
}

/// Runs the same pipeline through the forwarding proxy and the memory proxy.
async fn test_compare<Res>(f: impl FnOnce(&mut redis::Pipeline))
where
    Res: std::fmt::Debug + PartialEq + Send + FromRedisValue,
{
    let (mut forwarding, mut memory) = connect().await.unwrap();

    let mut pipeline = redis::pipe();
    f(&mut pipeline);

    let forwarded: Result<Res, _> = pipeline.clone().query_async(&mut forwarding).await;
    let served: Result<Res, _> = pipeline.clone().query_async(&mut memory).await;

    assert!(forwarded.is_ok(), "Not Ok, use `test_compare_err` instead if expecting an error");
    assert!(served.is_ok(), "Not Ok, use `test_compare_err` instead if expecting an error");
    assert_eq!(forwarded, served);
}

/// When the server responds with an error, the client parses it into `Err(RedisError)`,
/// ignoring all the other values from previous commands in the pipeline.
async fn test_compare_err(f: impl FnOnce(&mut redis::Pipeline)) {
    let (mut forwarding, mut memory) = connect().await.unwrap();

    let mut pipeline = redis::pipe();
    f(&mut pipeline);

    type Res = Result<(), RedisError>;

    let forwarded: Res = pipeline.clone().query_async(&mut forwarding).await;
    let served: Res = pipeline.clone().query_async(&mut memory).await;

    assert!(forwarded.is_err(), "Not Err, use `test_compare` instead if expecting a value");
    assert!(served.is_err(), "Not Err, use `test_compare` instead if expecting a value");

    let forwarded = forwarded.unwrap_err();
    let served = served.unwrap_err();
    assert_eq!(forwarded.code(), served.code());
    assert_eq!(forwarded.detail(), served.detail());
}

#[tokio::test]
async fn test_set_and_get() {
    test_compare::<Vec<Option<String>>>(|p| {
        p.cmd("SET").arg("key_a").arg("value");
        p.cmd("GET").arg("key_a");
        p.cmd("GET").arg("key_b");
    })
    .await;
}

#[tokio::test]
async fn test_set_args() {
    test_compare::<Vec<Option<String>>>(|p| {
        p.cmd("SET").arg("key_a").arg("1").arg("NX");
        p.cmd("SET").arg("key_a").arg("2").arg("NX");
        p.cmd("SET").arg("key_b").arg("3").arg("XX");
        p.cmd("SET").arg("key_a").arg("4").arg("XX").arg("EX").arg(100);
        p.cmd("GET").arg("key_a");
        p.cmd("GET").arg("key_b");
    })
    .await;

    test_compare_err(|p| {
        p.cmd("SET").arg("key_a").arg("1").arg("NX").arg("XX");
    })
    .await;

    test_compare_err(|p| {
        p.cmd("SET").arg("key_a").arg("1").arg("EX").arg(0);
    })
    .await;
}

#[tokio::test]
async fn test_ttl() {
    test_compare::<Vec<i64>>(|p| {
        p.cmd("SET").arg("key").arg("value").arg("EX").arg(100).ignore();
        p.cmd("SET").arg("persistent").arg("value").ignore();
        p.cmd("TTL").arg("key");
        p.cmd("TTL").arg("persistent");
        p.cmd("TTL").arg("missing");
        p.cmd("PERSIST").arg("key");
        p.cmd("TTL").arg("key");
        p.cmd("EXPIRE").arg("key").arg(50);
        p.cmd("TTL").arg("key");
    })
    .await;
}

#[tokio::test]
async fn test_del() {
    test_compare::<Vec<i64>>(|p| {
        p.cmd("SET").arg("key_a").arg(1).ignore();
        p.cmd("SET").arg("key_b").arg(2).ignore();
        p.cmd("DEL").arg("key_a").arg("key_b").arg("key_c");
        p.cmd("EXISTS").arg("key_a").arg("key_b");
    })
    .await;

    test_compare_err(|p| {
        p.cmd("DEL");
    })
    .await;
}

#[tokio::test]
async fn test_incr_and_decr() {
    test_compare::<Vec<i64>>(|p| {
        p.cmd("INCR").arg("counter");
        p.cmd("INCRBY").arg("counter").arg(10);
        p.cmd("DECR").arg("counter");
        p.cmd("DECRBY").arg("counter").arg(-5);
        p.cmd("SET").arg("big").arg(i64::MAX - 1).ignore();
        p.cmd("INCR").arg("big");
    })
    .await;

    test_compare_err(|p| {
        p.cmd("SET").arg("text").arg("value").ignore();
        p.cmd("INCR").arg("text");
    })
    .await;

    test_compare_err(|p| {
        p.cmd("SET").arg("big").arg(i64::MAX).ignore();
        p.cmd("INCR").arg("big");
    })
    .await;
}

#[tokio::test]
async fn test_append_and_strlen() {
    test_compare::<Vec<i64>>(|p| {
        p.cmd("APPEND").arg("key").arg("Hello");
        p.cmd("APPEND").arg("key").arg(" World");
        p.cmd("STRLEN").arg("key");
        p.cmd("STRLEN").arg("missing");
    })
    .await;
}

#[tokio::test]
async fn test_getdel_and_getset() {
    test_compare::<Vec<Option<String>>>(|p| {
        p.cmd("SET").arg("key").arg("first");
        p.cmd("GETSET").arg("key").arg("second");
        p.cmd("GETDEL").arg("key");
        p.cmd("GETDEL").arg("key");
        p.cmd("GET").arg("key");
    })
    .await;
}

#[tokio::test]
async fn test_mset_and_mget() {
    test_compare::<(String, Vec<Option<String>>)>(|p| {
        p.cmd("MSET").arg("key_a").arg(1).arg("key_b").arg(2);
        p.cmd("MGET").arg("key_a").arg("key_c").arg("key_b");
    })
    .await;

    test_compare_err(|p| {
        p.cmd("MSET").arg("key_a").arg(1).arg("key_b");
    })
    .await;
}

#[tokio::test]
async fn test_keys_and_type() {
    test_compare::<(Vec<String>, String, String, i64)>(|p| {
        p.cmd("MSET")
            .arg("user:1")
            .arg("a")
            .arg("user:2")
            .arg("b")
            .arg("other")
            .arg("c")
            .ignore();
        p.cmd("KEYS").arg("user:*");
        p.cmd("TYPE").arg("user:1");
        p.cmd("TYPE").arg("missing");
        p.cmd("DBSIZE");
    })
    .await;
}

#[tokio::test]
async fn test_flushdb() {
    test_compare::<(String, i64)>(|p| {
        p.cmd("SET").arg("key").arg("value").ignore();
        p.cmd("FLUSHDB");
        p.cmd("DBSIZE");
    })
    .await;
}

#[tokio::test]
async fn test_unknown_command() {
    test_compare_err(|p| {
        p.cmd("GETRANGE").arg("key").arg(0).arg(1);
    })
    .await;
}

#[tokio::test]
async fn test_client_setname() {
    let address = start_memory().await;
    let mut connection = client(address).await.unwrap();

    let (_, name, list): (String, String, String) = redis::pipe()
        .cmd("CLIENT")
        .arg("SETNAME")
        .arg("integration")
        .cmd("CLIENT")
        .arg("GETNAME")
        .cmd("CLIENT")
        .arg("LIST")
        .query_async(&mut connection)
        .await
        .unwrap();

    assert_eq!(name, "integration");
    assert!(list.contains("name=integration"));
}

#[tokio::test]
async fn test_config_read_only() {
    let address = start_memory().await;
    let mut connection = client(address).await.unwrap();

    let _: () = redis::cmd("CONFIG")
        .arg("SET")
        .arg("read-only")
        .arg("yes")
        .query_async(&mut connection)
        .await
        .unwrap();

    let err = redis::cmd("SET")
        .arg("key")
        .arg("value")
        .query_async::<_, ()>(&mut connection)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("READONLY"));

    let value: Option<String> = redis::cmd("GET")
        .arg("key")
        .query_async(&mut connection)
        .await
        .unwrap();
    assert_eq!(value, None);
}

// Raw protocol scenarios.

async fn raw(address: SocketAddr) -> TcpStream {
    TcpStream::connect(address).await.unwrap()
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for replies")
        .unwrap();
    String::from_utf8(buf).unwrap()
}

async fn read_to_close(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("connection was not closed")
        .unwrap();
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn test_inline_ping() {
    let mut stream = raw(start_memory().await).await;

    stream.write_all(b"PING\r\n").await.unwrap();

    assert_eq!(read_exact(&mut stream, 7).await, "+PONG\r\n");
}

#[tokio::test]
async fn test_get_missing_key() {
    let mut stream = raw(start_memory().await).await;

    stream
        .write_all(b"*2\r\n$3\r\nGET\r\n$7\r\nmissing\r\n")
        .await
        .unwrap();

    assert_eq!(read_exact(&mut stream, 5).await, "$-1\r\n");
}

#[tokio::test]
async fn test_protocol_error_closes_the_connection() {
    let mut stream = raw(start_memory().await).await;

    stream.write_all(b"PING\r\n*2000000\r\n").await.unwrap();

    assert_eq!(
        read_to_close(&mut stream).await,
        "+PONG\r\n-ERR Protocol error: invalid multibulk length\r\n"
    );
}

#[tokio::test]
async fn test_quit_flushes_then_closes() {
    let mut stream = raw(start_memory().await).await;

    stream
        .write_all(b"SET k v\r\nQUIT\r\nGET k\r\n")
        .await
        .unwrap();

    assert_eq!(read_to_close(&mut stream).await, "+OK\r\n+OK\r\n");
}

#[tokio::test]
async fn test_half_closed_client_gets_every_reply() {
    let mut stream = raw(start_memory().await).await;

    stream
        .write_all(b"SET k v\r\nGET k\r\nPING\r\n")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    assert_eq!(
        read_to_close(&mut stream).await,
        "+OK\r\n$1\r\nv\r\n+PONG\r\n"
    );
}

// Answers `GET kN` with `vN`, after a delay that depends on the key.
struct DelayedBackend;

impl Backend for DelayedBackend {
    fn name(&self) -> &'static str {
        "delayed"
    }

    fn get(&self, key: Bytes) -> BackendFuture<Option<Bytes>> {
        let delay = match &key[..] {
            b"k1" => 80,
            b"k2" => 20,
            b"k3" => 40,
            b"slow" => 200,
            _ => 0,
        };

        async move {
            sleep(Duration::from_millis(delay)).await;
            let value = format!("v{}", String::from_utf8_lossy(&key[1..]));
            Ok(Some(Bytes::from(value)))
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_replies_keep_request_order() {
    let address = start(Config::default(), Arc::new(DelayedBackend)).await;
    let mut stream = raw(address).await;

    stream
        .write_all(b"GET k1\r\nGET k2\r\nGET k3\r\nPING\r\n")
        .await
        .unwrap();

    let expected = "$2\r\nv1\r\n$2\r\nv2\r\n$2\r\nv3\r\n+PONG\r\n";
    assert_eq!(read_exact(&mut stream, expected.len()).await, expected);
}

#[tokio::test]
async fn test_half_closed_client_waits_for_slow_replies() {
    let address = start(Config::default(), Arc::new(DelayedBackend)).await;
    let mut stream = raw(address).await;

    stream.write_all(b"GET k1\r\nPING\r\n").await.unwrap();
    stream.shutdown().await.unwrap();

    assert_eq!(read_to_close(&mut stream).await, "$2\r\nv1\r\n+PONG\r\n");
}

#[tokio::test]
async fn test_busy_replies_are_ordered() {
    let config = Config {
        max_queued_requests: 2,
        ..Config::default()
    };
    let address = start(config, Arc::new(DelayedBackend)).await;
    let mut stream = raw(address).await;

    stream
        .write_all(b"GET k1\r\nGET k2\r\nGET k3\r\nGET k4\r\n")
        .await
        .unwrap();

    let busy = "-BUSY too many requests queued on this connection\r\n";
    let expected = format!("$2\r\nv1\r\n$2\r\nv2\r\n{}{}", busy, busy);
    assert_eq!(read_exact(&mut stream, expected.len()).await, expected);
}

#[tokio::test]
async fn test_connections_are_independent() {
    let address = start(Config::default(), Arc::new(DelayedBackend)).await;
    let mut slow = raw(address).await;
    let mut fast = raw(address).await;

    slow.write_all(b"GET slow\r\n").await.unwrap();
    fast.write_all(b"GET k2\r\n").await.unwrap();

    // The fast connection is not held back by the slow one.
    let replied = timeout(Duration::from_millis(150), read_exact(&mut fast, 8)).await;
    assert_eq!(replied.unwrap(), "$2\r\nv2\r\n");
    assert_eq!(read_exact(&mut slow, 10).await, "$4\r\nvlow\r\n");
}

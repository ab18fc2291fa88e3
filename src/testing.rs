use std::sync::Arc;

use bytes::Bytes;

use crate::backend::MemoryBackend;
use crate::config::Config;
use crate::connection::ConnectionHandle;
use crate::proxy::Proxy;
use crate::reply::Reply;
use crate::request::Request;

pub fn proxy() -> Arc<Proxy> {
    proxy_with(Config::default())
}

pub fn proxy_with(config: Config) -> Arc<Proxy> {
    Proxy::new(&config, Arc::new(MemoryBackend::new())).unwrap()
}

pub fn request(tokens: &[&str]) -> Arc<Request> {
    Arc::new(Request::new(
        tokens
            .iter()
            .map(|token| Bytes::copy_from_slice(token.as_bytes()))
            .collect(),
    ))
}

pub fn connection(proxy: &Arc<Proxy>) -> ConnectionHandle {
    proxy.clients().register("127.0.0.1:50000".parse().unwrap())
}

/// Dispatches `tokens` on a fresh connection and waits for the reply.
pub async fn execute(proxy: &Arc<Proxy>, tokens: &[&str]) -> Reply {
    let connection = connection(proxy);
    let reply = execute_on(proxy, &connection, tokens).await;
    proxy.clients().unregister(connection.id());
    reply
}

pub async fn execute_on(proxy: &Arc<Proxy>, connection: &ConnectionHandle, tokens: &[&str]) -> Reply {
    let reply = proxy
        .dispatcher()
        .dispatch(proxy, &request(tokens), connection);

    match reply {
        Reply::Deferred(deferred) => deferred.resolve(proxy.pool()).await,
        reply => reply,
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::commands;
use crate::config::{Config, Settings};
use crate::connection::{Clients, ConnectionHandle, ConnectionId};
use crate::dispatch::Dispatcher;
use crate::pool::LazyPool;
use crate::queue::OrderingQueue;
use crate::registry::Registry;
use crate::reply::Reply;
use crate::request::Request;
use crate::Error;

pub const BUSY_ERROR: &str = "BUSY too many requests queued on this connection";

/// What the connection should do after a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop reading and close once the queued replies are written.
    Close,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub connections_received: AtomicU64,
    pub commands_processed: AtomicU64,
    pub rejected_busy: AtomicU64,
    pub dropped_timeout: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl Stats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything connections share: the backend, the command registry, the ordering queue and the
/// runtime settings.
pub struct Proxy {
    backend: Arc<dyn Backend>,
    settings: Settings,
    clients: Clients,
    dispatcher: Dispatcher,
    queue: OrderingQueue,
    pool: LazyPool,
    stats: Stats,
    started: Instant,
}

impl Proxy {
    /// Builds a proxy serving the default command set, with the renames of `config` applied.
    pub fn new(config: &Config, backend: Arc<dyn Backend>) -> Result<Arc<Proxy>, Error> {
        let mut registry = Registry::new();
        for descriptor in commands::descriptors() {
            registry.register(descriptor)?;
        }
        for (old, new) in &config.renames {
            registry.rename(old, new)?;
            debug!("Renamed command {} to {:?}", old, new);
        }

        Ok(Arc::new(Proxy {
            backend,
            settings: Settings::new(config),
            clients: Clients::new(),
            dispatcher: Dispatcher::new(registry),
            queue: OrderingQueue::new(),
            pool: LazyPool::new(config.lazy_pool_size),
            stats: Stats::default(),
            started: Instant::now(),
        }))
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn queue(&self) -> &OrderingQueue {
        &self.queue
    }

    pub fn pool(&self) -> &LazyPool {
        &self.pool
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn connection_opened(&self) {
        Stats::incr(&self.stats.connections_received);
    }

    /// Takes one decoded request of `connection` through its whole life: rejection checks,
    /// dispatch and hand over of its reply to the ordering queue.
    pub fn handle(self: &Arc<Self>, connection: &ConnectionHandle, request: Request) -> Flow {
        let request = Arc::new(request);
        let id = connection.id();

        if let Some(err) = request.protocol_error() {
            warn!("Protocol error: {}", err);
            Stats::incr(&self.stats.protocol_errors);
            self.respond(id, &request, Reply::error(err.to_string()));
            return Flow::Close;
        }

        let max_queued = self.settings.max_queued_requests();
        if max_queued > 0 && self.queue.in_flight(id) >= max_queued {
            Stats::incr(&self.stats.rejected_busy);
            self.respond(id, &request, Reply::error(BUSY_ERROR));
            return Flow::Continue;
        }

        if let Some(timeout) = self.settings.proxy_timeout() {
            let age = request.lifecycle().age();
            if age > timeout {
                debug!("Dropping request {} after waiting {:?}", request.id(), age);
                Stats::incr(&self.stats.dropped_timeout);
                return Flow::Continue;
            }
        }

        if let Err(err) = self.queue.track(id, request.clone()) {
            warn!("{}", err);
            return Flow::Continue;
        }

        let reply = self.dispatcher.dispatch(self, &request, connection);
        Stats::incr(&self.stats.commands_processed);
        self.finish(id, &request, reply);

        if connection.is_closing() {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    fn respond(self: &Arc<Self>, connection: ConnectionId, request: &Arc<Request>, reply: Reply) {
        if let Err(err) = self.queue.track(connection, request.clone()) {
            warn!("{}", err);
            return;
        }
        self.finish(connection, request, reply);
    }

    // Deferred replies reach the queue from whichever thread resolves them.
    fn finish(self: &Arc<Self>, connection: ConnectionId, request: &Arc<Request>, reply: Reply) {
        let request_id = request.id();

        match reply {
            Reply::Deferred(deferred) => {
                let proxy = Arc::clone(self);
                deferred.on_resolved(&self.pool, move |reply| {
                    proxy.queue.complete(connection, request_id, reply);
                    proxy.queue.drain_ready(connection);
                });
            }
            reply => {
                self.queue.complete(connection, request_id, reply);
                self.queue.drain_ready(connection);
            }
        }
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use thiserror::Error as ThisError;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::connection::ConnectionId;
use crate::reply::Reply;
use crate::request::{Request, Stage};

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum QueueError {
    #[error("request {id} tracked after request {last} on connection {connection}")]
    OutOfOrder {
        connection: ConnectionId,
        last: u64,
        id: u64,
    },
}

/// Keeps the replies of every open connection in request order.
///
/// Requests are tracked as they arrive and their replies may be completed in any order, from any
/// thread. Replies only leave through [`OrderingQueue::drain_ready`], which writes them to the
/// connection sink strictly by ascending request identifier. Once a connection is closed every
/// operation on it is a no-op, so late completions are dropped silently.
#[derive(Default)]
pub struct OrderingQueue {
    connections: Mutex<HashMap<ConnectionId, Arc<ReplyQueue>>>,
}

struct ReplyQueue {
    state: Mutex<State>,
    // Doubles as the drain lock, only one drain at a time pushes to the sink.
    sink: Mutex<UnboundedSender<Bytes>>,
    idle: Notify,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<u64, Entry>,
    last_tracked: u64,
    pending: usize,
}

struct Entry {
    request: Arc<Request>,
    reply: Option<Reply>,
}

impl OrderingQueue {
    pub fn new() -> OrderingQueue {
        Self::default()
    }

    /// Starts tracking `connection`. Encoded replies are pushed to `sink`, in order.
    pub fn on_connection_open(&self, connection: ConnectionId, sink: UnboundedSender<Bytes>) {
        let queue = Arc::new(ReplyQueue {
            state: Mutex::new(State::default()),
            sink: Mutex::new(sink),
            idle: Notify::new(),
        });

        lock(&self.connections).insert(connection, queue);
    }

    /// Forgets `connection` along with every reply it still waits for.
    pub fn on_connection_close(&self, connection: ConnectionId) {
        let Some(queue) = lock(&self.connections).remove(&connection) else {
            return;
        };

        let abandoned = lock(&queue.state).entries.len();
        if abandoned > 0 {
            debug!(
                "Discarding {} queued replies of connection {}",
                abandoned, connection
            );
        }
        queue.idle.notify_waiters();
    }

    /// Reserves the slot of `request`. Identifiers must increase on every call for a connection.
    pub fn track(&self, connection: ConnectionId, request: Arc<Request>) -> Result<(), QueueError> {
        let Some(queue) = self.get(connection) else {
            return Ok(());
        };

        let mut state = lock(&queue.state);
        let id = request.id();
        if id <= state.last_tracked {
            return Err(QueueError::OutOfOrder {
                connection,
                last: state.last_tracked,
                id,
            });
        }

        state.last_tracked = id;
        state.pending += 1;
        state.entries.insert(
            id,
            Entry {
                request,
                reply: None,
            },
        );

        Ok(())
    }

    /// Sets the reply of a tracked request. The first reply wins.
    pub fn complete(&self, connection: ConnectionId, request_id: u64, reply: Reply) {
        let Some(queue) = self.get(connection) else {
            trace!("Dropping reply to request {}, connection {} is gone", request_id, connection);
            return;
        };

        let mut state = lock(&queue.state);
        let Some(entry) = state.entries.get_mut(&request_id) else {
            return;
        };
        if entry.reply.is_some() {
            return;
        }

        entry.request.lifecycle().advance(Stage::Finalized);
        entry.reply = Some(reply);
        state.pending -= 1;
    }

    /// The number of tracked requests of `connection` still waiting for their reply.
    pub fn in_flight(&self, connection: ConnectionId) -> usize {
        self.get(connection)
            .map_or(0, |queue| lock(&queue.state).pending)
    }

    /// The number of tracked requests of `connection` not written yet, replied or not.
    pub fn queued(&self, connection: ConnectionId) -> usize {
        self.get(connection)
            .map_or(0, |queue| lock(&queue.state).entries.len())
    }

    /// Writes every reply that is next in line to the connection sink, stopping at the first
    /// request still waiting for its reply. Returns the number of replies written.
    pub fn drain_ready(&self, connection: ConnectionId) -> usize {
        let Some(queue) = self.get(connection) else {
            return 0;
        };

        let sink = lock(&queue.sink);

        let (ready, idle) = {
            let mut state = lock(&queue.state);
            let mut ready = Vec::new();
            while let Some(entry) = state.entries.first_entry() {
                if entry.get().reply.is_none() {
                    break;
                }
                ready.push(entry.remove());
            }
            (ready, state.entries.is_empty())
        };

        if !ready.is_empty() {
            let mut buf = BytesMut::new();
            for reply in ready.iter().filter_map(|entry| entry.reply.as_ref()) {
                reply.encode(&mut buf);
            }

            if sink.send(buf.freeze()).is_err() {
                debug!("Connection {} writer is gone, replies dropped", connection);
            }
        }
        drop(sink);

        if idle {
            queue.idle.notify_waiters();
        }

        ready.len()
    }

    /// Resolves once every tracked request of `connection` was written to the sink, or the
    /// connection is closed.
    pub async fn drained(&self, connection: ConnectionId) {
        let Some(queue) = self.get(connection) else {
            return;
        };

        loop {
            let notified = queue.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let open = lock(&self.connections).contains_key(&connection);
            if !open || lock(&queue.state).entries.is_empty() {
                return;
            }

            notified.await;
        }
    }

    fn get(&self, connection: ConnectionId) -> Option<Arc<ReplyQueue>> {
        lock(&self.connections).get(&connection).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

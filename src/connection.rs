use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use itertools::Itertools;
use tokio::time::Instant;

pub type ConnectionId = u64;

/// Identity and bookkeeping of one client connection, shared by the connection task and the
/// handlers running on its behalf. Clones point at the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInfo>,
}

struct ConnectionInfo {
    id: ConnectionId,
    address: SocketAddr,
    opened: Instant,
    session: Mutex<Session>,
    closing: AtomicBool,
}

#[derive(Default)]
struct Session {
    name: Option<String>,
    lib_name: Option<String>,
    lib_version: Option<String>,
    last_command: String,
}

impl ConnectionHandle {
    fn new(id: ConnectionId, address: SocketAddr) -> ConnectionHandle {
        ConnectionHandle {
            inner: Arc::new(ConnectionInfo {
                id,
                address,
                opened: Instant::now(),
                session: Mutex::new(Session::default()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    pub fn age(&self) -> std::time::Duration {
        self.inner.opened.elapsed()
    }

    pub fn name(&self) -> Option<String> {
        self.session().name.clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        self.session().name = name;
    }

    pub fn set_lib_name(&self, name: String) {
        self.session().lib_name = Some(name);
    }

    pub fn set_lib_version(&self, version: String) {
        self.session().lib_version = Some(version);
    }

    pub fn last_command(&self) -> String {
        self.session().last_command.clone()
    }

    pub fn set_last_command(&self, command: &str) {
        let mut session = self.session();
        session.last_command.clear();
        session.last_command.push_str(&command.to_ascii_lowercase());
    }

    /// Asks the connection to close once the replies of the requests it already received are
    /// written.
    pub fn close_after_reply(&self) {
        self.inner.closing.store(true, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// One line of `CLIENT LIST`.
    pub fn describe(&self) -> String {
        let session = self.session();
        format!(
            "id={} addr={} name={} age={} cmd={} lib-name={} lib-ver={}",
            self.inner.id,
            self.inner.address,
            session.name.as_deref().unwrap_or_default(),
            self.age().as_secs(),
            if session.last_command.is_empty() {
                "NULL"
            } else {
                session.last_command.as_str()
            },
            session.lib_name.as_deref().unwrap_or_default(),
            session.lib_version.as_deref().unwrap_or_default(),
        )
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .finish()
    }
}

/// The open connections.
pub struct Clients {
    next_id: AtomicU64,
    open: Mutex<BTreeMap<ConnectionId, ConnectionHandle>>,
}

impl Clients {
    pub fn new() -> Clients {
        Clients {
            next_id: AtomicU64::new(1),
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocates an identifier for a new connection from `address`.
    pub fn register(&self, address: SocketAddr) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle::new(id, address);
        self.open().insert(id, handle.clone());
        handle
    }

    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.open().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.open().get(&id).cloned()
    }

    /// Open connections, oldest first.
    pub fn list(&self) -> Vec<ConnectionHandle> {
        self.open().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.open().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `CLIENT LIST` text, one line per connection.
    pub fn render(&self) -> String {
        let lines = self.list().iter().map(ConnectionHandle::describe).join("\n");
        if lines.is_empty() {
            lines
        } else {
            lines + "\n"
        }
    }

    fn open(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, ConnectionHandle>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Clients {
    fn default() -> Self {
        Self::new()
    }
}

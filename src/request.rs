use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::codec::ProtocolError;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A decoded client request: the verb followed by its arguments, as raw bytes.
///
/// Every request gets a process-wide unique identifier when it is decoded. Since a connection
/// decodes its input sequentially, identifiers are strictly increasing within a connection.
pub struct Request {
    id: u64,
    tokens: Vec<Bytes>,
    error: Option<ProtocolError>,
    client_address: Option<SocketAddr>,
    lifecycle: Lifecycle,
}

impl Request {
    pub fn new(tokens: Vec<Bytes>) -> Request {
        Request {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            tokens,
            error: None,
            client_address: None,
            lifecycle: Lifecycle::new(),
        }
    }

    /// A request standing for malformed input.
    pub fn invalid(error: ProtocolError) -> Request {
        Request {
            error: Some(error),
            ..Request::new(Vec::new())
        }
    }

    pub fn with_client_address(mut self, address: SocketAddr) -> Request {
        self.client_address = Some(address);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tokens(&self) -> &[Bytes] {
        &self.tokens
    }

    pub fn verb(&self) -> Option<&Bytes> {
        self.tokens.first()
    }

    pub fn args(&self) -> &[Bytes] {
        self.tokens.get(1..).unwrap_or_default()
    }

    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    pub fn client_address(&self) -> Option<SocketAddr> {
        self.client_address
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Request");
        debug.field("id", &self.id);
        match &self.error {
            Some(error) => debug.field("error", error),
            None => debug.field(
                "tokens",
                &self
                    .tokens
                    .iter()
                    .map(|token| String::from_utf8_lossy(token))
                    .collect::<Vec<_>>(),
            ),
        };
        debug.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    DispatchStarted,
    DispatchFinished,
    /// The reply was handed to the ordering queue.
    Finalized,
}

const STAGES: [Stage; 4] = [
    Stage::Received,
    Stage::DispatchStarted,
    Stage::DispatchFinished,
    Stage::Finalized,
];

/// Monotonic timestamps of the stages a request goes through.
///
/// Stages are recorded once each and only forward: a stage can be skipped (a rejected request
/// goes straight from received to finalized) but never recorded after a later one.
#[derive(Debug)]
pub struct Lifecycle {
    stamps: [OnceLock<Instant>; 4],
}

impl Lifecycle {
    fn new() -> Lifecycle {
        let lifecycle = Lifecycle {
            stamps: [
                OnceLock::new(),
                OnceLock::new(),
                OnceLock::new(),
                OnceLock::new(),
            ],
        };
        let _ = lifecycle.stamps[Stage::Received as usize].set(Instant::now());
        lifecycle
    }

    /// Records `stage`. Returns `false` if it was already recorded or a later stage was.
    pub fn advance(&self, stage: Stage) -> bool {
        if self.current() >= stage {
            return false;
        }
        self.stamps[stage as usize].set(Instant::now()).is_ok()
    }

    /// The latest recorded stage.
    pub fn current(&self) -> Stage {
        STAGES
            .into_iter()
            .rev()
            .find(|stage| self.at(*stage).is_some())
            .unwrap_or(Stage::Received)
    }

    pub fn at(&self, stage: Stage) -> Option<Instant> {
        self.stamps[stage as usize].get().copied()
    }

    pub fn elapsed(&self, from: Stage, to: Stage) -> Option<Duration> {
        Some(self.at(to)?.saturating_duration_since(self.at(from)?))
    }

    /// Time since the request was decoded.
    pub fn age(&self) -> Duration {
        self.at(Stage::Received)
            .map(|received| received.elapsed())
            .unwrap_or_default()
    }

    /// Records the start of dispatch and returns a guard recording its end when dropped.
    pub fn dispatch(&self) -> DispatchGuard<'_> {
        self.advance(Stage::DispatchStarted);
        DispatchGuard { lifecycle: self }
    }
}

pub struct DispatchGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.advance(Stage::DispatchFinished);
    }
}

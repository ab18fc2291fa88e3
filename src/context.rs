use std::sync::Arc;

use crate::connection::ConnectionHandle;
use crate::request::Request;

tokio::task_local! {
    static CURRENT: Current;
}

/// What a handler is working on: the request being dispatched and the connection it came from.
#[derive(Clone, Debug)]
pub struct Current {
    pub request: Arc<Request>,
    pub connection: ConnectionHandle,
}

/// Runs `f` with `current` as the ambient context. The previous context is restored when `f`
/// returns or unwinds.
pub fn scope<F, R>(current: Current, f: F) -> R
where
    F: FnOnce() -> R,
{
    CURRENT.sync_scope(current, f)
}

/// The context of the dispatch in progress on this task, `None` outside of one.
pub fn current() -> Option<Current> {
    CURRENT.try_with(Clone::clone).ok()
}

pub fn connection() -> Option<ConnectionHandle> {
    CURRENT.try_with(|current| current.connection.clone()).ok()
}

pub fn request() -> Option<Arc<Request>> {
    CURRENT.try_with(|current| current.request.clone()).ok()
}

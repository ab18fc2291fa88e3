use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::error;

use crate::pool::LazyPool;
use crate::reply::Reply;

type Compute = Box<dyn FnOnce() -> Reply + Send>;
type Callback = Box<dyn FnOnce(Reply) + Send>;

/// A reply whose value is not known yet.
///
/// A deferred reply is either *lazy*, computed the first time somebody needs it, or
/// *completion-backed*, resolved through a [`Completer`] once a backend call finishes. Either way
/// it resolves exactly once: later resolutions are ignored and every reader observes the same
/// value. Clones share the same state.
#[derive(Clone)]
pub struct Deferred {
    shared: Arc<Shared>,
}

struct Shared {
    value: OnceLock<Reply>,
    source: Source,
}

enum Source {
    Lazy(Mutex<Option<Compute>>),
    Completion(Mutex<Vec<Callback>>),
}

/// Resolves a completion-backed [`Deferred`].
///
/// Dropping a completer without calling [`Completer::complete`] resolves the reply with an error,
/// so a waiting connection always gets an answer.
pub struct Completer {
    shared: Option<Arc<Shared>>,
}

impl Deferred {
    pub fn lazy<F>(compute: F) -> Deferred
    where
        F: FnOnce() -> Reply + Send + 'static,
    {
        Deferred {
            shared: Arc::new(Shared {
                value: OnceLock::new(),
                source: Source::Lazy(Mutex::new(Some(Box::new(compute)))),
            }),
        }
    }

    pub fn pending() -> (Deferred, Completer) {
        let shared = Arc::new(Shared {
            value: OnceLock::new(),
            source: Source::Completion(Mutex::new(Vec::new())),
        });

        let completer = Completer {
            shared: Some(shared.clone()),
        };

        (Deferred { shared }, completer)
    }

    /// Runs `fut` on the runtime and resolves with its output. A panicking future resolves with an
    /// error reply.
    pub fn spawn<F>(fut: F) -> Deferred
    where
        F: Future<Output = Reply> + Send + 'static,
    {
        let (deferred, completer) = Deferred::pending();

        tokio::spawn(async move {
            let reply = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(reply) => reply,
                Err(panic) => {
                    error!("backend call panicked: {}", panic_message(&*panic));
                    Reply::error("ERR backend call panicked")
                }
            };
            completer.complete(reply);
        });

        deferred
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.shared.source, Source::Lazy(_))
    }

    /// The resolved value, if any. Never triggers a computation.
    pub fn peek(&self) -> Option<Reply> {
        self.shared.value.get().cloned()
    }

    /// The resolved value. Lazy replies are computed on the calling thread if nobody did it yet;
    /// completion-backed replies return `None` until completed.
    pub fn force(&self) -> Option<Reply> {
        match &self.shared.source {
            Source::Lazy(compute) => Some(
                self.shared
                    .value
                    .get_or_init(|| {
                        let compute = lock(compute).take();
                        run_lazy(compute)
                    })
                    .clone(),
            ),
            Source::Completion(_) => self.peek(),
        }
    }

    /// Calls `callback` with the resolved value once it is available.
    ///
    /// Already resolved replies call back immediately on the current thread. Lazy replies are
    /// computed on `pool`, which falls back to the current thread when it is busy.
    /// Completion-backed replies call back from whichever task completes them.
    pub fn on_resolved<F>(&self, pool: &LazyPool, callback: F)
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        if let Some(value) = self.shared.value.get() {
            return callback(value.clone());
        }

        match &self.shared.source {
            Source::Lazy(_) => {
                let deferred = self.clone();
                pool.execute(move || {
                    if let Some(value) = deferred.force() {
                        callback(value);
                    }
                });
            }
            Source::Completion(waiters) => {
                let mut waiters = lock(waiters);
                // Checked again under the lock, `Shared::complete` takes the waiters after setting
                // the value.
                match self.shared.value.get() {
                    Some(value) => {
                        drop(waiters);
                        callback(value.clone());
                    }
                    None => waiters.push(Box::new(callback)),
                }
            }
        }
    }

    pub async fn resolve(&self, pool: &LazyPool) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.on_resolved(pool, move |reply| {
            let _ = tx.send(reply);
        });

        rx.await
            .unwrap_or_else(|_| Reply::error("ERR reply was dropped before it resolved"))
    }
}

impl Completer {
    pub fn complete(mut self, reply: Reply) {
        if let Some(shared) = self.shared.take() {
            shared.complete(reply);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Reply::error("ERR backend dropped the reply"));
        }
    }
}

impl Shared {
    fn complete(&self, reply: Reply) {
        if self.value.set(reply).is_err() {
            return;
        }

        let Source::Completion(waiters) = &self.source else {
            return;
        };

        let callbacks = std::mem::take(&mut *lock(waiters));
        if let Some(value) = self.value.get() {
            for callback in callbacks {
                callback(value.clone());
            }
        }
    }
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_lazy() { "lazy" } else { "completion" };
        f.debug_struct("Deferred")
            .field("kind", &kind)
            .field("value", &self.shared.value.get())
            .finish()
    }
}

fn run_lazy(compute: Option<Compute>) -> Reply {
    let Some(compute) = compute else {
        return Reply::error("ERR lazy reply has nothing to compute");
    };

    panic::catch_unwind(AssertUnwindSafe(compute)).unwrap_or_else(|panic| {
        error!("lazy reply panicked: {}", panic_message(&*panic));
        Reply::error("ERR lazy reply computation failed")
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

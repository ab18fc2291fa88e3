use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::trace;

/// Runs lazy reply computations.
///
/// The pool has at most `size` jobs in flight on the blocking thread pool and no queue: when every
/// slot is taken the job runs right away on the calling thread instead. A slow computation can
/// therefore only hold up the connection that asked for it.
#[derive(Clone, Debug)]
pub struct LazyPool {
    permits: Arc<Semaphore>,
}

impl LazyPool {
    pub fn new(size: usize) -> LazyPool {
        LazyPool {
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = self.permits.clone().try_acquire_owned();

        match (permit, Handle::try_current()) {
            (Ok(permit), Ok(handle)) => {
                handle.spawn_blocking(move || {
                    let _permit = permit;
                    job()
                });
            }
            _ => {
                trace!("lazy pool is busy, running on the caller");
                job()
            }
        }
    }
}

impl Default for LazyPool {
    fn default() -> Self {
        Self::new(1)
    }
}

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Where the engine runs each job.
///
/// `submit` must not block: the poll loop calls it inline and moves on to the
/// next job immediately.
pub trait TaskExecutor: Send + Sync {
    fn submit(&self, task: BoxFuture<'static, ()>);
}

/// Spawns one tokio task per job. The default executor.
#[derive(Debug, Clone, Default)]
pub struct TokioExecutor {
    handle: Option<Handle>,
}

impl TokioExecutor {
    /// Spawn onto the ambient runtime of the caller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn onto a specific runtime, e.g. a dedicated one for user functions.
    pub fn on(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl TaskExecutor for TokioExecutor {
    fn submit(&self, task: BoxFuture<'static, ()>) {
        match &self.handle {
            Some(handle) => {
                handle.spawn(task);
            }
            None => {
                tokio::spawn(task);
            }
        }
    }
}

/// Caps how many jobs execute at once.
///
/// Every job still gets its own task straight away; tasks over the limit wait
/// for a permit, so polling is never held up by a full pool.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    inner: TokioExecutor,
}

impl BoundedExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_executor(max_concurrent, TokioExecutor::new())
    }

    pub fn with_executor(max_concurrent: usize, inner: TokioExecutor) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            inner,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl TaskExecutor for BoundedExecutor {
    fn submit(&self, task: BoxFuture<'static, ()>) {
        let permits = Arc::clone(&self.permits);
        self.inner.submit(Box::pin(async move {
            // The semaphore is never closed; if it were, run anyway rather than drop the job.
            let _permit = permits.acquire_owned().await.ok();
            task.await;
        }));
    }
}

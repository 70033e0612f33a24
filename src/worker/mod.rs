//! Worker offload: a thin contract for running a blocking body off the loop
//! thread and resuming on it when the body returns.
//!
//! The engine does not own the pool; it borrows one through [`WorkerPool`].
//! The default implementation is backed by `tokio::task::spawn_blocking`.

use std::future::Future;
use std::pin::Pin;

/// A pending dispatch; resolves to the worker body's return value.
pub type DispatchFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Runs `body` on a worker thread and resolves once the loop thread
/// resumes. The engine never cancels a dispatched work item.
pub trait WorkerPool: Clone + Send + 'static {
    fn dispatch<F, T>(&self, body: F) -> DispatchFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;
}

/// A [`WorkerPool`] backed by Tokio's blocking thread pool.
#[derive(Clone, Default)]
pub struct TokioWorkerPool;

impl TokioWorkerPool {
    pub fn new() -> Self {
        TokioWorkerPool
    }
}

impl WorkerPool for TokioWorkerPool {
    fn dispatch<F, T>(&self, body: F) -> DispatchFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Box::pin(async move {
            match tokio::task::spawn_blocking(body).await {
                Ok(value) => value,
                Err(join_err) => std::panic::resume_unwind(join_err.into_panic()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_runs_body_off_thread_and_returns_value() {
        let pool = TokioWorkerPool::new();
        let result = pool.dispatch(|| 2 + 2).await;
        assert_eq!(result, 4);
    }
}

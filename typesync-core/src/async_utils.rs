//! Async utilities and patterns
//!
//! Provides single-flight deduplication, timeouts and owned background task groups

use crate::error::{ErrorContext, TypesyncError, TypesyncResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Deduplicates concurrent runs of the same async operation.
///
/// While a run is in flight every caller awaits the same shared future and
/// receives a clone of its output; once it completes the next call starts a
/// fresh run.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Join the in-flight run, or start one with `make`
    pub async fn run<F, Fut>(&self, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(in_flight) if in_flight.peek().is_none() => {
                    debug!("Joining in-flight operation");
                    in_flight.clone()
                }
                _ => {
                    let fresh = make().boxed().shared();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };

        let output = shared.await;

        let mut slot = self.slot.lock();
        if slot
            .as_ref()
            .map(|finished| finished.peek().is_some())
            .unwrap_or(false)
        {
            *slot = None;
        }

        output
    }

    /// Whether a run is currently in flight
    pub fn is_in_flight(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .map(|in_flight| in_flight.peek().is_none())
            .unwrap_or(false)
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Timeout wrapper for async operations
pub async fn with_timeout<F, T>(future: F, timeout_ms: u64, operation_name: &str) -> TypesyncResult<T>
where
    F: Future<Output = T>,
{
    match timeout(Duration::from_millis(timeout_ms), future).await {
        Ok(result) => Ok(result),
        Err(_) => Err(TypesyncError::Timeout {
            operation: operation_name.to_string(),
            duration_ms: timeout_ms,
            context: ErrorContext::new("async_utils")
                .with_operation("timeout")
                .with_metadata("timeout_ms", &timeout_ms.to_string())
                .with_suggestion("Check network connectivity")
                .with_suggestion("Verify service availability"),
        }),
    }
}

/// Background tasks owned by a component; aborted together on teardown or drop
#[derive(Default)]
pub struct TaskGroup {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task into the group
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Take ownership of an already spawned task
    pub fn adopt(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tasks still running
    pub fn active(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Abort every task in the group
    pub fn abort_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}

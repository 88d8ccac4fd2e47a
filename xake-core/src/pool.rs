//! The bounded-parallel worker pool with per-target memoisation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use xake_types::{ExecStatus, Target};

use crate::Error;

/// A target execution that many callers can join.
pub(crate) type SharedExec = Shared<BoxFuture<'static, Result<ExecStatus, Error>>>;

/// Bounded-concurrency executor.
///
/// Submitting a target that is already running (or done) in this run joins
/// the existing execution, so a recipe body runs at most once per build
/// invocation. The semaphore caps how many recipe bodies execute at once;
/// a body gives its permit back while it waits on `need`ed children.
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<Target, SharedExec>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(threads.max(1))),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a permit from the pool.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("worker pool semaphore closed")
    }

    /// Submit `target` for execution, or join the execution already in
    /// flight.
    pub fn submit<F>(&self, target: Target, make: F) -> SharedExec
    where
        F: FnOnce() -> BoxFuture<'static, Result<ExecStatus, Error>>,
    {
        let mut tasks = self.tasks.lock().expect("worker pool lock poisoned");
        if let Some(existing) = tasks.get(&target) {
            return existing.clone();
        }

        // Spawn onto the runtime so the task makes progress even while its
        // requester is suspended elsewhere.
        let handle = tokio::spawn(make());
        let shared = handle
            .map(|joined| joined.expect("build task panicked"))
            .boxed()
            .shared();
        tasks.insert(target, shared.clone());
        shared
    }
}

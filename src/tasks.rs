//! Per-camera task registry.
//!
//! Detection and recording sessions are tracked here so that concurrent
//! event handlers cannot launch duplicate tasks for the same key. The
//! check-and-insert happens under one lock, and every task gets a
//! cancellation token that offline handling can trip cooperatively.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of a start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

struct TaskHandle {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// Registry of named running tasks with atomic start-if-absent semantics.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task for `key` unless one is still running.
    ///
    /// The factory receives the task's cancellation token. Finished entries
    /// are reaped on every start attempt, so the map only ever holds live
    /// tasks plus those not yet swept.
    pub fn try_start<F, Fut>(&self, key: &str, make: F) -> StartOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.handle.is_finished());

        if tasks.contains_key(key) {
            return StartOutcome::AlreadyRunning;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(make(token.clone()));
        tasks.insert(key.to_string(), TaskHandle { handle, token });

        StartOutcome::Started
    }

    /// Cancel the running task for `key`, if any. Returns whether a live
    /// task was signalled.
    pub fn cancel(&self, key: &str) -> bool {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.handle.is_finished());
        match tasks.get(key) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked task.
    pub fn cancel_all(&self) {
        for task in self.tasks.lock().values() {
            task.token.cancel();
        }
    }

    /// Whether a live task exists for `key`.
    pub fn is_running(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .get(key)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of live tasks.
    pub fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }
}

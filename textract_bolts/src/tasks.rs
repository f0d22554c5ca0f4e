//! A bounded pool of named worker threads with cooperative cancellation.
//!
//! Every spawned task gets a [`CancellationToken`] and hands back a [`TaskHandle`] that can be
//! cancelled, polled for completion and joined.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::Error;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

/// Cooperative cancellation flag shared between a task and its handle
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<CancelState>);

impl CancellationToken {
    /// Create a token that is not cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.0.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request cancellation and wake every sleeper
    pub fn cancel(&self) {
        *self.flag() = true;
        self.0.wakeup.notify_all();
    }

    /// `true` once [`CancellationToken::cancel`] was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.flag()
    }

    /// Sleep for `duration`, waking up as soon as the token is cancelled.
    /// Returns `true` if the token got cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (cancelled, _timeout) = self
            .0
            .wakeup
            .wait_timeout_while(self.flag(), duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled
    }
}

/// Handle to a task spawned on a [`WorkerPool`]
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// The thread name of this task
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The token handed to the task
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Ask the task to stop at its next cancellation point
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `true` once the task body returned (or panicked)
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// `true` if called from the task's own thread
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }

    /// Wait for the task to finish.
    ///
    /// A task cannot join itself: from its own thread this fails with [`Error::IllegalState`]
    /// and the thread is left detached.
    pub fn join(mut self) -> Result<(), Error> {
        if self.is_current() {
            return Err(Error::illegal_state(format!(
                "task {} cannot join itself",
                self.name
            )));
        }
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::unknown(format!("task {} panicked", self.name))),
            None => Ok(()),
        }
    }
}

/// Releases a pool slot when the task is done, even if it panicked
struct SlotGuard {
    active: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs tasks on dedicated threads, never more than `capacity` at once
#[derive(Debug, Clone)]
pub struct WorkerPool {
    capacity: usize,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a new pool. A capacity of 0 is treated as 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The maximum number of concurrently running tasks
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of tasks currently running
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Spawn `task` on a new thread called `name`.
    ///
    /// Fails with [`Error::IllegalState`] if the pool is at capacity.
    pub fn spawn<F>(&self, name: &str, task: F) -> Result<TaskHandle, Error>
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        if !self.try_acquire() {
            return Err(Error::illegal_state(format!(
                "worker pool is full ({} tasks), not starting {name}",
                self.capacity
            )));
        }

        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let guard = SlotGuard {
            active: self.active.clone(),
            finished: finished.clone(),
        };
        let task_token = token.clone();

        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _guard = guard;
            task(&task_token);
        });

        match spawned {
            Ok(handle) => Ok(TaskHandle {
                name: name.to_string(),
                token,
                finished,
                handle: Some(handle),
            }),
            // The closure (and with it the guard) was dropped, so the slot is free again.
            Err(err) => Err(Error::unknown(format!("could not spawn {name}: {err}"))),
        }
    }
}

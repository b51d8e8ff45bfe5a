//! Single-consumer execution loop.
//!
//! The executor drains an [`ActionQueuer`] one item at a time. Every state
//! mutation dispatched through it is therefore totally ordered by enqueue
//! order. A failing or panicking item is logged and counted; the loop keeps
//! going.
//!
//! Lifecycle: `Created -> Running -> Stopping -> Stopped`. Stopping cancels
//! the loop's wait for the next item, lets the in-flight item finish, and
//! closes the queue, dropping whatever is still in it.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};
use crate::queue::ActionQueuer;

/// Executor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Constructed, loop not started.
    Created,
    /// Loop is draining the queue.
    Running,
    /// Loop was told to stop and is finishing the in-flight item.
    Stopping,
    /// Loop has exited, or stop gave up waiting for it.
    Stopped,
}

/// Counters for executed work items.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Items that completed successfully.
    pub executed: u64,
    /// Items that returned an error or panicked.
    pub failed: u64,
}

struct Shared {
    state: watch::Sender<ExecutorState>,
    executed: AtomicU64,
    failed: AtomicU64,
}

/// Background loop that runs queued work items one at a time.
pub struct ActionExecutor {
    queue: Arc<dyn ActionQueuer>,
    shared: Arc<Shared>,
    stopping: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActionExecutor {
    /// Create an executor draining `queue`.
    pub fn new(queue: Arc<dyn ActionQueuer>) -> Self {
        let (state, _) = watch::channel(ExecutorState::Created);
        Self {
            queue,
            shared: Arc::new(Shared {
                state,
                executed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            stopping: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        *self.shared.state.borrow()
    }

    /// Item counters so far.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            executed: self.shared.executed.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
        }
    }

    /// Spawn the consumer loop on the current tokio runtime.
    ///
    /// The loop runs until `shutdown` or [`stop`](Self::stop) cancels it.
    /// Starting twice fails with [`StateError::InvalidState`].
    pub fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StateError::InvalidState("action executor needs a tokio runtime".to_string())
        })?;

        let started = self.shared.state.send_if_modified(|state| {
            if *state == ExecutorState::Created {
                *state = ExecutorState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(StateError::InvalidState(format!(
                "action executor cannot start from {:?}",
                self.state()
            )));
        }

        let token = shutdown.child_token();
        *self.stopping.lock() = Some(token.clone());
        *self.task.lock() = Some(runtime.spawn(run(
            Arc::clone(&self.queue),
            Arc::clone(&self.shared),
            token,
        )));

        info!("action executor started");
        Ok(())
    }

    /// Stop the loop, waiting for the in-flight item until `timeout` fires.
    ///
    /// Never fails: on timeout the executor reports `Stopped` and the
    /// in-flight item is left to finish on its own.
    pub async fn stop(&self, timeout: &CancellationToken) {
        self.stop_until(timeout.cancelled()).await;
    }

    /// [`stop`](Self::stop) with a duration instead of a token.
    pub async fn stop_timeout(&self, timeout: Duration) {
        self.stop_until(tokio::time::sleep(timeout)).await;
    }

    async fn stop_until<F: Future<Output = ()>>(&self, deadline: F) {
        if self.state() == ExecutorState::Created {
            return;
        }

        self.shared.state.send_if_modified(|state| {
            if *state == ExecutorState::Running {
                *state = ExecutorState::Stopping;
                true
            } else {
                false
            }
        });

        if let Some(token) = self.stopping.lock().as_ref() {
            token.cancel();
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            tokio::select! {
                joined = task => {
                    if let Err(e) = joined {
                        warn!(error = %e, "action executor loop ended abnormally");
                    }
                }
                _ = deadline => {
                    warn!("action executor stop timed out, in-flight action left running");
                    self.queue.close();
                }
            }
        }

        self.shared.state.send_replace(ExecutorState::Stopped);
        info!(
            executed = self.shared.executed.load(Ordering::Acquire),
            failed = self.shared.failed.load(Ordering::Acquire),
            "action executor stopped"
        );
    }

    /// Wait until the executor reports `Stopped`.
    ///
    /// Returns immediately if the executor was never started.
    pub async fn stopped(&self) {
        let mut state = self.shared.state.subscribe();
        if *state.borrow() == ExecutorState::Created {
            return;
        }
        let _ = state
            .wait_for(|state| *state == ExecutorState::Stopped)
            .await;
    }
}

async fn run(queue: Arc<dyn ActionQueuer>, shared: Arc<Shared>, token: CancellationToken) {
    loop {
        let item = match queue.dequeue(&token).await {
            Ok(item) => item,
            Err(StateError::Cancelled(_)) => break,
            Err(e) => {
                warn!(error = %e, "action queue unavailable, executor exiting");
                break;
            }
        };

        // Own task per item: a panic surfaces as a JoinError instead of
        // tearing down the loop.
        let item_token = token.clone();
        match tokio::spawn(async move { item(item_token).await }).await {
            Ok(Ok(())) => {
                shared.executed.fetch_add(1, Ordering::AcqRel);
            }
            Ok(Err(e)) => {
                shared.failed.fetch_add(1, Ordering::AcqRel);
                warn!(error = %e, "action failed");
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::AcqRel);
                warn!(error = %e, "action panicked");
            }
        }
    }

    // Whatever is still queued will never run: drop it so completions resolve.
    if let Some(abandoned) = queue.close() {
        if abandoned > 0 {
            info!(abandoned, "queued actions abandoned at shutdown");
        }
    }

    shared.state.send_if_modified(|state| {
        if *state == ExecutorState::Running {
            *state = ExecutorState::Stopping;
            true
        } else {
            false
        }
    });
    shared.state.send_replace(ExecutorState::Stopped);
    debug!("action executor loop exited");
}

impl Drop for ActionExecutor {
    fn drop(&mut self) {
        if let Some(token) = self.stopping.lock().take() {
            token.cancel();
        }
    }
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

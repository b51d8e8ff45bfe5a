//! Dispatcher - the public entry point for state mutations.
//!
//! A dispatch wraps a transform as one work item that reads the current
//! value, applies the transform and writes the result back. The item runs on
//! the executor, so dispatched writes never race each other. Direct
//! [`State::write`](crate::state::State::write) calls bypass this ordering
//! and should not be mixed with dispatched writes to the same state.

use std::fmt;
use std::future::{ready, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StateError};
use crate::queue::{work_item, ActionQueuer, WorkItem};
use crate::registry::StateRegistry;
use crate::state::{StateKey, TypedState};

/// Dispatches state transforms through an action queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn ActionQueuer>,
    registry: Arc<StateRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher feeding `queue` and resolving states in `registry`.
    pub fn new(queue: Arc<dyn ActionQueuer>, registry: Arc<StateRegistry>) -> Self {
        Self { queue, registry }
    }

    /// The registry states are resolved in.
    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    /// Schedule `transform` against the state for `K` and return immediately.
    ///
    /// Registry errors surface here. Everything after that, including a
    /// panicking transform, is invisible to the caller. Must be called from
    /// within a tokio runtime.
    pub fn dispatch<K, F>(&self, transform: F) -> Result<()>
    where
        K: StateKey,
        F: FnOnce(K::Value) -> K::Value + Send + 'static,
    {
        let state = self.registry.typed::<K>()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StateError::InvalidState("dispatch needs a tokio runtime".to_string())
        })?;

        let item = transform_item(
            state,
            move |value| ready(transform(value)),
            CancellationToken::new(),
            None,
        );
        let queue = Arc::clone(&self.queue);
        runtime.spawn(async move {
            if let Err(e) = queue.enqueue(item, &CancellationToken::new()).await {
                warn!(state = K::NAME, error = %e, "dispatched action dropped");
            }
        });
        Ok(())
    }

    /// Schedule an async `transform` against the state for `K`.
    ///
    /// Waits for queue capacity, then returns a [`Completion`] that resolves
    /// once the transform has run and its result was written. If `cancel`
    /// fires while waiting for capacity the call fails with
    /// [`StateError::Cancelled`]; if it has fired by the time the item
    /// reaches the executor, the item is skipped and the completion resolves
    /// to [`StateError::Cancelled`].
    pub async fn dispatch_async<K, F, Fut>(
        &self,
        transform: F,
        cancel: &CancellationToken,
    ) -> Result<Completion>
    where
        K: StateKey,
        F: FnOnce(K::Value) -> Fut + Send + 'static,
        Fut: Future<Output = K::Value> + Send + 'static,
    {
        let state = self.registry.typed::<K>()?;
        let (done_tx, done_rx) = oneshot::channel();
        let item = transform_item(state, transform, cancel.clone(), Some(done_tx));

        self.queue.enqueue(item, cancel).await?;
        Ok(Completion {
            state_name: K::NAME,
            done: done_rx,
        })
    }
}

fn transform_item<T, F, Fut>(
    state: TypedState<T>,
    transform: F,
    cancel: CancellationToken,
    done: Option<oneshot::Sender<Result<()>>>,
) -> WorkItem
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    work_item(move |_shutdown| apply_transform(state, transform, cancel, done))
}

async fn apply_transform<T, F, Fut>(
    state: TypedState<T>,
    transform: F,
    cancel: CancellationToken,
    done: Option<oneshot::Sender<Result<()>>>,
) -> Result<()>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Fut,
    Fut: Future<Output = T>,
{
    if cancel.is_cancelled() {
        debug!(state = state.name(), "dispatched action skipped, caller cancelled");
        if let Some(done) = done {
            let _ = done.send(Err(StateError::Cancelled(format!(
                "action on {} cancelled before it ran",
                state.name()
            ))));
        }
        return Ok(());
    }

    let current = state.value()?;
    let next = transform(current).await;
    state.replace(next);

    if let Some(done) = done {
        let _ = done.send(Ok(()));
    }
    Ok(())
}

/// Resolves once a dispatched action has run.
///
/// Yields `Ok(())` after the write, [`StateError::Cancelled`] if the action
/// was skipped, and [`StateError::Aborted`] if it was dropped unrun or its
/// transform panicked. Dropping the completion does not cancel the action.
#[must_use = "a Completion does nothing unless awaited"]
pub struct Completion {
    state_name: &'static str,
    done: oneshot::Receiver<Result<()>>,
}

impl Completion {
    /// Name of the state the action targets.
    pub fn state_name(&self) -> &'static str {
        self.state_name
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state_name = self.state_name;
        Pin::new(&mut self.done).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(StateError::Aborted(format!(
                "action on {} ended before completing",
                state_name
            ))),
        })
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("state_name", &self.state_name)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

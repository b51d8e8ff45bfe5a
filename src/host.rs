//! Composition root.
//!
//! [`StateManagementBuilder`] wires a provider, a registry, a queue, a
//! dispatcher and an executor into one [`StateManagement`] handle. The
//! application then calls [`StateManagement::start`] with its shutdown
//! token; cancelling that token stops the executor.

use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DispatchConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, StateError};
use crate::executor::{ActionExecutor, ExecutorState, ExecutorStats};
use crate::memory::MemoryProvider;
use crate::provider::StateProvider;
use crate::queue::{ActionQueue, ActionQueuer};
use crate::registry::StateRegistry;

/// Builder for [`StateManagement`].
///
/// Defaults: an in-memory provider and an [`ActionQueue`] sized by the
/// configuration, or by [`DispatchConfig::default`] when none is set.
#[derive(Default)]
pub struct StateManagementBuilder {
    config: Option<DispatchConfig>,
    provider: Option<Arc<dyn StateProvider>>,
    queue: Option<Arc<dyn ActionQueuer>>,
}

impl StateManagementBuilder {
    /// Create a builder without configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach configuration.
    pub fn with_configuration(mut self, config: DispatchConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the state provider. The registry takes ownership of it.
    pub fn with_provider(mut self, provider: Arc<dyn StateProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Replace the action queue.
    pub fn with_queue(mut self, queue: Arc<dyn ActionQueuer>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Replace the action queue with one built by `factory`.
    pub fn with_queue_factory<F>(self, factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Arc<dyn ActionQueuer>>,
    {
        let queue = factory()?;
        Ok(self.with_queue(queue))
    }

    /// Replace the action queue with one built from the configuration.
    ///
    /// Fails with [`StateError::ConfigurationMissing`] if
    /// [`with_configuration`](Self::with_configuration) was not called first.
    pub fn with_configured_queue<F>(self, factory: F) -> Result<Self>
    where
        F: FnOnce(&DispatchConfig) -> Result<Arc<dyn ActionQueuer>>,
    {
        let config = self.config.as_ref().ok_or_else(|| {
            StateError::ConfigurationMissing(
                "builder has no configuration, call with_configuration first".to_string(),
            )
        })?;
        let queue = factory(config)?;
        Ok(self.with_queue(queue))
    }

    /// Build the pipeline. Nothing runs until [`StateManagement::start`].
    pub fn build(self) -> Result<StateManagement> {
        if let Some(config) = &self.config {
            config.validate()?;
        }

        let provider: Arc<dyn StateProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(MemoryProvider::new()),
        };
        let queue: Arc<dyn ActionQueuer> = match self.queue {
            Some(queue) => queue,
            None => {
                let config = self.config.clone().unwrap_or_default();
                Arc::new(ActionQueue::from_config(&config)?)
            }
        };

        debug!(provider = provider.kind(), "building state management");
        let registry = Arc::new(StateRegistry::new(provider));
        let dispatcher = Dispatcher::new(Arc::clone(&queue), Arc::clone(&registry));
        let executor = Arc::new(ActionExecutor::new(Arc::clone(&queue)));

        Ok(StateManagement {
            config: self.config,
            registry,
            queue,
            dispatcher,
            executor,
        })
    }
}

impl fmt::Debug for StateManagementBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManagementBuilder")
            .field("config", &self.config)
            .field("provider", &self.provider.as_ref().map(|p| p.kind()))
            .field("queue", &self.queue.is_some())
            .finish()
    }
}

/// A wired dispatch pipeline.
pub struct StateManagement {
    config: Option<DispatchConfig>,
    registry: Arc<StateRegistry>,
    queue: Arc<dyn ActionQueuer>,
    dispatcher: Dispatcher,
    executor: Arc<ActionExecutor>,
}

impl StateManagement {
    /// Start a builder.
    pub fn builder() -> StateManagementBuilder {
        StateManagementBuilder::new()
    }

    /// Configuration given to the builder, if any.
    pub fn config(&self) -> Option<&DispatchConfig> {
        self.config.as_ref()
    }

    /// The state registry.
    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    /// The action queue shared by dispatcher and executor.
    pub fn queue(&self) -> &Arc<dyn ActionQueuer> {
        &self.queue
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The executor.
    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    /// Executor lifecycle state.
    pub fn state(&self) -> ExecutorState {
        self.executor.state()
    }

    /// Executor counters.
    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Start the executor. Cancelling `shutdown` stops it.
    pub fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        self.executor.start(shutdown)?;
        info!(
            provider = self.registry.provider_kind(),
            "state management started"
        );
        Ok(())
    }

    /// Wait until the executor has stopped.
    pub async fn stopped(&self) {
        self.executor.stopped().await;
    }

    /// Dispose the registry and its provider.
    pub fn dispose(&self) {
        self.registry.dispose();
    }
}

impl fmt::Debug for StateManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManagement")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

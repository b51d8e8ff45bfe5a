//! # univrs-dispatch
//!
//! In-process observable state with a single-writer dispatch pipeline.
//!
//! Application state lives in named, type-erased [`State`] objects held by a
//! [`StateRegistry`]. Each state's storage comes from a pluggable
//! [`StateProvider`] that can be swapped at runtime without losing values or
//! subscribers. Mutations go through a [`Dispatcher`], which queues them on a
//! bounded [`ActionQueue`]; one [`ActionExecutor`] drains the queue, so
//! dispatched writes are applied one at a time in enqueue order.
//!
//! - **Subscriptions**: synchronous change callbacks, disposed on drop
//! - **Change feed**: broadcast [`ChangeEvent`] stream filtered by name
//! - **Backpressure**: a full queue makes producers wait, cancellably
//! - **Graceful shutdown**: the in-flight action finishes, the rest is abandoned
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use univrs_dispatch::{DispatchConfig, StateKey, StateManagement};
//!
//! struct Counter;
//!
//! impl StateKey for Counter {
//!     type Value = i64;
//!     const NAME: &'static str = "counter";
//! }
//!
//! #[tokio::main]
//! async fn main() -> univrs_dispatch::Result<()> {
//!     let management = StateManagement::builder()
//!         .with_configuration(DispatchConfig::from_env())
//!         .build()?;
//!
//!     let shutdown = CancellationToken::new();
//!     management.start(&shutdown)?;
//!
//!     let _subscription = management
//!         .registry()
//!         .subscribe::<Counter, _>(|n| println!("counter: {}", n))?;
//!
//!     management
//!         .dispatcher()
//!         .dispatch_async::<Counter, _, _>(|n| async move { n + 1 }, &shutdown)
//!         .await?
//!         .await?;
//!
//!     shutdown.cancel();
//!     management.stopped().await;
//!     management.dispose();
//!     Ok(())
//! }
//! ```
//!
//! ## Provider Hot-Swap
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use univrs_dispatch::{StateKey, StateRegistry, VersionedProvider};
//!
//! struct Title;
//!
//! impl StateKey for Title {
//!     type Value = String;
//!     const NAME: &'static str = "title";
//! }
//!
//! fn main() -> univrs_dispatch::Result<()> {
//!     let registry = StateRegistry::default();
//!     registry.typed::<Title>()?.replace("draft".to_string());
//!
//!     // Values and subscribers move to the new provider.
//!     registry.set_provider(Arc::new(VersionedProvider::new()))?;
//!     assert_eq!(registry.typed::<Title>()?.value()?, "draft");
//!     Ok(())
//! }
//! ```
//!
//! ## Watching Changes
//!
//! ```rust,no_run
//! use tokio_stream::StreamExt;
//! use univrs_dispatch::{state_value, StateRegistry};
//!
//! #[tokio::main]
//! async fn main() -> univrs_dispatch::Result<()> {
//!     let registry = StateRegistry::default();
//!     let mut changes = registry.watch("cart/*")?;
//!
//!     let cart = registry.get_or_create("cart/items", state_value(0u32))?;
//!     cart.write(state_value(3u32));
//!
//!     // Created, then Updated.
//!     for _ in 0..2 {
//!         if let Some(event) = changes.next().await {
//!             println!("{:?} {} v{}", event.event_type, event.name, event.version);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod binder;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod host;
pub mod memory;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod state;
pub mod watch;

// Re-export main types
pub use binder::{BindingBuilder, SubscriptionSet};
pub use config::{DispatchConfig, QUEUE_CAPACITY_DEFAULT, QUEUE_CAPACITY_KEY};
pub use dispatcher::{Completion, Dispatcher};
pub use error::{Result, StateError};
pub use executor::{ActionExecutor, ExecutorState, ExecutorStats};
pub use host::{StateManagement, StateManagementBuilder};
pub use memory::{CellInfo, MemoryCell, MemoryProvider, VersionedCell, VersionedProvider};
pub use provider::{StateCell, StateProvider, MAX_NAME_LENGTH};
pub use queue::{work_item, ActionQueue, ActionQueuer, WorkItem};
pub use registry::{EntryInfo, StateRegistry};
pub use state::{state_value, State, StateKey, StateValue, Subscription, TypedState};
pub use watch::{ChangeEvent, EventType, WatchStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::binder::{BindingBuilder, SubscriptionSet};
    pub use crate::config::DispatchConfig;
    pub use crate::dispatcher::{Completion, Dispatcher};
    pub use crate::error::{Result, StateError};
    pub use crate::executor::{ActionExecutor, ExecutorState};
    pub use crate::host::{StateManagement, StateManagementBuilder};
    pub use crate::memory::{MemoryProvider, VersionedProvider};
    pub use crate::provider::{StateCell, StateProvider};
    pub use crate::queue::{ActionQueue, ActionQueuer};
    pub use crate::registry::StateRegistry;
    pub use crate::state::{state_value, State, StateKey, StateValue, Subscription, TypedState};
    pub use crate::watch::{ChangeEvent, EventType, WatchStream};
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;

    struct Counter;

    impl StateKey for Counter {
        type Value = i64;
        const NAME: &'static str = "counter";
    }

    #[test]
    fn test_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<StateRegistry>();
        assert_send_sync::<State>();
        assert_send_sync::<Subscription>();
        assert_send_sync::<ActionQueue>();
        assert_send_sync::<ActionExecutor>();
        assert_send_sync::<Dispatcher>();
        assert_send_sync::<StateManagement>();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispatch_across_provider_swap() {
        let management = StateManagement::builder()
            .with_configuration(DispatchConfig::new(8))
            .build()
            .unwrap();
        let shutdown = CancellationToken::new();
        management.start(&shutdown).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = Arc::clone(&seen);
            management
                .registry()
                .subscribe::<Counter, _>(move |n| seen.lock().push(*n))
                .unwrap()
        };

        let increment = |dispatcher: Dispatcher| async move {
            dispatcher
                .dispatch_async::<Counter, _, _>(|n| async move { n + 1 }, &CancellationToken::new())
                .await
                .unwrap()
                .await
                .unwrap();
        };

        for _ in 0..5 {
            increment(management.dispatcher().clone()).await;
        }

        let versioned = Arc::new(VersionedProvider::new());
        management.registry().set_provider(versioned.clone()).unwrap();
        assert_eq!(management.registry().provider_kind(), "versioned");

        for _ in 0..5 {
            increment(management.dispatcher().clone()).await;
        }

        let counter = management.registry().typed::<Counter>().unwrap();
        assert_eq!(counter.value().unwrap(), 10);
        assert_eq!(*seen.lock(), (1..=10).collect::<Vec<i64>>());
        assert_eq!(versioned.write_count(), 5);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), management.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_change_feed_follows_dispatch() {
        let management = StateManagement::builder().build().unwrap();
        let shutdown = CancellationToken::new();
        management.start(&shutdown).unwrap();

        let mut changes = management.registry().watch("counter").unwrap();
        management
            .dispatcher()
            .dispatch_async::<Counter, _, _>(|n| async move { n + 2 }, &shutdown)
            .await
            .unwrap()
            .await
            .unwrap();

        let created = changes.next().await.unwrap();
        assert_eq!(created.event_type, EventType::Created);
        let updated = changes.next().await.unwrap();
        assert_eq!(updated.event_type, EventType::Updated);
        assert_eq!(updated.value_as::<i64>(), Some(&2));
        assert_eq!(updated.version, 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), management.stopped())
            .await
            .unwrap();
    }

    #[test]
    fn test_disposed_registry_rejects_creation() {
        let management = StateManagement::builder().build().unwrap();
        management.dispose();

        let err = management
            .registry()
            .get_or_create("late", state_value(0u8))
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyDisposed(_)));
    }
}

//! Declarative subscription binding.
//!
//! A consumer that depends on several states declares each dependency once
//! and gets back a [`SubscriptionSet`] that tears all of them down together.
//!
//! ```rust
//! use std::sync::Arc;
//! use univrs_dispatch::{BindingBuilder, StateKey, StateRegistry};
//!
//! struct Counter;
//!
//! impl StateKey for Counter {
//!     type Value = i64;
//!     const NAME: &'static str = "counter";
//! }
//!
//! # fn main() -> univrs_dispatch::Result<()> {
//! let registry = StateRegistry::default();
//! let bindings = BindingBuilder::new(&registry)
//!     .on::<Counter, _>(|n| println!("counter is now {}", n))
//!     .bind()?;
//!
//! registry.typed::<Counter>()?.replace(3);
//! bindings.dispose();
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::registry::StateRegistry;
use crate::state::{StateKey, Subscription};

type ChangeHook = Arc<dyn Fn(&str) + Send + Sync>;
type Binder = Box<dyn FnOnce(&StateRegistry, Option<ChangeHook>) -> Result<Subscription> + Send>;

/// Collects state dependencies and subscribes them in one step.
pub struct BindingBuilder<'a> {
    registry: &'a StateRegistry,
    names: Vec<&'static str>,
    binders: Vec<Binder>,
    on_any: Option<ChangeHook>,
}

impl<'a> BindingBuilder<'a> {
    /// Start a binding against `registry`.
    pub fn new(registry: &'a StateRegistry) -> Self {
        Self {
            registry,
            names: Vec::new(),
            binders: Vec::new(),
            on_any: None,
        }
    }

    /// Declare a dependency on `K`.
    ///
    /// A key declared twice keeps its first callback.
    pub fn on<K, F>(mut self, callback: F) -> Self
    where
        K: StateKey,
        F: Fn(&K::Value) + Send + Sync + 'static,
    {
        if self.names.contains(&K::NAME) {
            debug!(state = K::NAME, "duplicate binding ignored");
            return self;
        }

        self.names.push(K::NAME);
        self.binders.push(Box::new(move |registry, on_any| {
            let state = registry.typed::<K>()?;
            Ok(state.subscribe(move |value| {
                callback(value);
                if let Some(on_any) = &on_any {
                    on_any(K::NAME);
                }
            }))
        }));
        self
    }

    /// Run `hook` with the state name after any bound state changes.
    ///
    /// The hook runs after that state's own callback.
    pub fn on_any_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_any = Some(Arc::new(hook));
        self
    }

    /// Subscribe every declared dependency.
    ///
    /// If any subscription fails the ones already made are disposed and the
    /// error is returned.
    pub fn bind(self) -> Result<SubscriptionSet> {
        let mut subscriptions = Vec::with_capacity(self.binders.len());
        for binder in self.binders {
            subscriptions.push(binder(self.registry, self.on_any.clone())?);
        }

        debug!(states = ?self.names, "bindings attached");
        Ok(SubscriptionSet {
            names: self.names,
            subscriptions: Mutex::new(subscriptions),
            disposed: AtomicBool::new(false),
        })
    }
}

impl fmt::Debug for BindingBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingBuilder")
            .field("states", &self.names)
            .field("on_any", &self.on_any.is_some())
            .finish()
    }
}

/// Subscriptions created by [`BindingBuilder::bind`].
///
/// Disposed as a unit, explicitly or on drop.
#[must_use = "dropping a SubscriptionSet detaches every callback"]
pub struct SubscriptionSet {
    names: Vec<&'static str>,
    subscriptions: Mutex<Vec<Subscription>>,
    disposed: AtomicBool,
}

impl SubscriptionSet {
    /// Names of the bound states, in declaration order.
    pub fn state_names(&self) -> &[&'static str] {
        &self.names
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Whether no subscription is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Detach every callback. Later calls do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in &subscriptions {
            subscription.dispose();
        }
        debug!(count = subscriptions.len(), "bindings disposed");
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSet")
            .field("states", &self.names)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

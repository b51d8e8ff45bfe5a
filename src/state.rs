//! Named states, subscriptions and typed access.
//!
//! A [`State`] is the stable logical handle for one name. It owns the
//! subscriber list and the version counter, and delegates value storage to a
//! provider-created [`StateCell`] that the registry may swap out at any time.
//! Handles obtained before a swap keep working because only the cell changes.

use std::any::{type_name, Any};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::error::{Result, StateError};
use crate::provider::{StateCell, StateProvider};
use crate::watch::{ChangeEvent, WatchSender};

/// Type-erased state value. Cheap to clone.
pub type StateValue = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete value as a [`StateValue`].
pub fn state_value<T: Any + Send + Sync>(value: T) -> StateValue {
    Arc::new(value)
}

/// Explicit key for one logical state.
///
/// Each key maps to exactly one named state whose value has type `Value`.
/// The first lookup creates it with `Value::default()`.
///
/// ```rust
/// use univrs_dispatch::StateKey;
///
/// struct Counter;
///
/// impl StateKey for Counter {
///     type Value = i64;
///     const NAME: &'static str = "counter";
/// }
/// ```
pub trait StateKey: 'static {
    /// Value stored under this key.
    type Value: Clone + Default + Send + Sync + 'static;

    /// Unique state name.
    const NAME: &'static str;
}

type Callback = Arc<dyn Fn(&StateValue) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// A named, observable value cell.
pub struct State {
    name: String,
    cell: RwLock<Arc<dyn StateCell>>,
    subscribers: Arc<Mutex<Subscribers>>,
    version: AtomicU64,
    watcher: Option<WatchSender>,
}

impl State {
    /// Create a state over an existing storage cell.
    pub fn new(name: impl Into<String>, cell: Arc<dyn StateCell>) -> Self {
        Self {
            name: name.into(),
            cell: RwLock::new(cell),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            version: AtomicU64::new(0),
            watcher: None,
        }
    }

    /// Create a state whose writes are also published on a change feed.
    pub(crate) fn with_watcher(
        name: impl Into<String>,
        cell: Arc<dyn StateCell>,
        watcher: WatchSender,
    ) -> Self {
        Self {
            watcher: Some(watcher),
            ..Self::new(name, cell)
        }
    }

    /// The state name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of writes applied since creation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Read the current value.
    pub fn read(&self) -> StateValue {
        self.cell.read().read()
    }

    /// Read the current value as `T`.
    pub fn read_as<T: Clone + 'static>(&self) -> Result<T> {
        self.read()
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| StateError::TypeMismatch {
                name: self.name.clone(),
                expected: type_name::<T>(),
            })
    }

    /// Replace the value, then notify every subscriber in registration order.
    ///
    /// A panicking subscriber is logged and skipped; the remaining
    /// subscribers still run and the writer never observes the panic.
    pub fn write(&self, value: StateValue) {
        let version = {
            let cell = self.cell.read();
            cell.write(value.clone());
            self.version.fetch_add(1, Ordering::AcqRel) + 1
        };

        // Snapshot so callbacks may detach themselves without deadlocking.
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&value))).is_err() {
                warn!(state = %self.name, version, "state subscriber panicked");
            }
        }

        if let Some(watcher) = &self.watcher {
            watcher.send(ChangeEvent::updated(&self.name, value, version));
        }
    }

    /// Register a change callback.
    ///
    /// The callback stays attached until the returned [`Subscription`] is
    /// disposed or dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateValue) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.entries.push((id, Arc::new(callback)));

        Subscription {
            state_name: self.name.clone(),
            id,
            subscribers: Arc::downgrade(&self.subscribers),
            disposed: AtomicBool::new(false),
        }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().entries.len()
    }

    /// Move the value into a cell created by `provider`.
    ///
    /// Holds the cell lock for the whole migration so no concurrent write can
    /// land in the old cell after its value was copied. Returns the migrated
    /// value.
    pub(crate) fn rebind(&self, provider: &dyn StateProvider) -> StateValue {
        let mut cell = self.cell.write();
        let current = cell.read();
        *cell = provider.create_state(&self.name, current.clone());
        current
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("version", &self.version())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

/// Handle for one registered change callback.
///
/// Disposing detaches exactly that callback; disposing again is a no-op.
/// Dropping the handle disposes it. A notification already in flight when
/// the handle is disposed still runs to completion.
#[must_use = "dropping a Subscription detaches its callback"]
pub struct Subscription {
    state_name: String,
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
    disposed: AtomicBool,
}

impl Subscription {
    /// Name of the state this subscription observes.
    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Detach the callback.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }

    /// Keep the callback attached for the lifetime of the state.
    pub fn detach(self) {
        self.disposed.store(true, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("state_name", &self.state_name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Typed view over a [`State`].
pub struct TypedState<T> {
    state: Arc<State>,
    _value: PhantomData<fn() -> T>,
}

impl<T> TypedState<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(state: Arc<State>) -> Self {
        Self {
            state,
            _value: PhantomData,
        }
    }

    /// The state name.
    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Current value.
    pub fn value(&self) -> Result<T> {
        self.state.read_as::<T>()
    }

    /// Replace the value and notify subscribers.
    pub fn replace(&self, value: T) {
        self.state.write(state_value(value));
    }

    /// Register a typed change callback.
    ///
    /// Values of any other type written under the same name are ignored.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.state.subscribe(move |value| {
            if let Some(value) = value.downcast_ref::<T>() {
                callback(value);
            }
        })
    }

    /// The underlying erased state.
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }
}

impl<T> Clone for TypedState<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TypedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypedState").field(&self.state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    fn int_state(name: &str, initial: i64) -> State {
        let cell = MemoryProvider::new().create_state(name, state_value(initial));
        State::new(name, cell)
    }

    #[test]
    fn test_read_and_write() {
        let state = int_state("counter", 1);
        assert_eq!(state.read_as::<i64>().unwrap(), 1);
        assert_eq!(state.version(), 0);

        state.write(state_value(5_i64));
        assert_eq!(state.read_as::<i64>().unwrap(), 5);
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn test_read_as_wrong_type() {
        let state = int_state("counter", 1);
        let err = state.read_as::<String>().unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { .. }));
    }

    #[test]
    fn test_subscribers_run_in_order_and_survive_panics() {
        let state = int_state("fanout", 0);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let calls = Arc::clone(&calls);
            state.subscribe(move |v| {
                calls.lock().push(("first", *v.downcast_ref::<i64>().unwrap()))
            })
        };
        let second = state.subscribe(|_| panic!("subscriber failure"));
        let third = {
            let calls = Arc::clone(&calls);
            state.subscribe(move |v| {
                calls.lock().push(("third", *v.downcast_ref::<i64>().unwrap()))
            })
        };

        state.write(state_value(7_i64));

        assert_eq!(*calls.lock(), vec![("first", 7), ("third", 7)]);
        drop((first, second, third));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let state = int_state("unsub", 0);
        let hits = Arc::new(AtomicU64::new(0));

        let subscription = {
            let hits = Arc::clone(&hits);
            state.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let other = state.subscribe(|_| {});
        assert_eq!(state.subscriber_count(), 2);

        subscription.dispose();
        subscription.dispose();
        assert!(subscription.is_disposed());
        assert_eq!(state.subscriber_count(), 1);

        state.write(state_value(1_i64));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(other);
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn test_detach_keeps_callback() {
        let state = int_state("detached", 0);
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = Arc::clone(&hits);
            state
                .subscribe(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
        }

        state.write(state_value(1_i64));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(state.subscriber_count(), 1);
    }

    #[test]
    fn test_subscriber_can_dispose_itself_during_notification() {
        let state = Arc::new(int_state("self-detach", 0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicU64::new(0));

        let subscription = {
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            state.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = slot.lock().take() {
                    own.dispose();
                }
            })
        };
        *slot.lock() = Some(subscription);

        state.write(state_value(1_i64));
        state.write(state_value(2_i64));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn test_rebind_preserves_value_and_subscribers() {
        let state = int_state("rebind", 3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = Arc::clone(&seen);
            state.subscribe(move |v| seen.lock().push(*v.downcast_ref::<i64>().unwrap()))
        };

        let migrated = state.rebind(&MemoryProvider::new());
        assert_eq!(*migrated.downcast_ref::<i64>().unwrap(), 3);
        assert_eq!(state.read_as::<i64>().unwrap(), 3);

        state.write(state_value(4_i64));
        assert_eq!(*seen.lock(), vec![4]);
    }

    #[test]
    fn test_typed_state() {
        let typed: TypedState<String> = TypedState::new(Arc::new(State::new(
            "greeting",
            MemoryProvider::new().create_state("greeting", state_value(String::from("hi"))),
        )));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = Arc::clone(&seen);
            typed.subscribe(move |v: &String| seen.lock().push(v.clone()))
        };

        assert_eq!(typed.value().unwrap(), "hi");
        typed.replace("hello".to_string());
        assert_eq!(typed.value().unwrap(), "hello");
        assert_eq!(*seen.lock(), vec!["hello".to_string()]);
    }
}

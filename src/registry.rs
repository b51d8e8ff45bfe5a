//! StateRegistry - the name-to-state map bound to one active provider.
//!
//! Lookups of existing names only take the map's read lock. Creation and
//! provider swaps serialize on the provider lock, with a second lookup under
//! that lock so concurrent first access to a name creates exactly one state.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};
use crate::memory::MemoryProvider;
use crate::provider::{validate_name, StateProvider};
use crate::state::{state_value, State, StateKey, StateValue, Subscription, TypedState};
use crate::watch::{ChangeEvent, WatchSender, WatchStream, WATCH_CAPACITY_DEFAULT};

struct StateEntry {
    provider_kind: &'static str,
    state: Arc<State>,
    initial_value: StateValue,
}

struct ProviderRegistration {
    provider: Arc<dyn StateProvider>,
    owned: bool,
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// State name.
    pub name: String,
    /// [`StateProvider::kind`] of the provider backing the state.
    pub provider_kind: &'static str,
    /// State version at snapshot time.
    pub version: u64,
}

/// Thread-safe registry of named states.
///
/// Owned by whoever composes the application and shared by `Arc` with the
/// dispatcher. Dropping the registry disposes it.
pub struct StateRegistry {
    registration: Mutex<ProviderRegistration>,
    states: RwLock<HashMap<String, StateEntry>>,
    disposed: AtomicBool,
    watcher: WatchSender,
}

impl StateRegistry {
    /// Create a registry that owns `provider`.
    pub fn new(provider: Arc<dyn StateProvider>) -> Self {
        Self::with_watch_capacity(provider, WATCH_CAPACITY_DEFAULT)
    }

    /// Create a registry with a custom change feed capacity.
    pub fn with_watch_capacity(provider: Arc<dyn StateProvider>, capacity: usize) -> Self {
        Self {
            registration: Mutex::new(ProviderRegistration {
                provider,
                owned: true,
            }),
            states: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            watcher: WatchSender::new(capacity),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::AlreadyDisposed("state registry".to_string()));
        }
        Ok(())
    }

    /// Get the state for `name`, creating it with `initial_value` if absent.
    pub fn get_or_create(&self, name: &str, initial_value: StateValue) -> Result<Arc<State>> {
        self.get_or_create_with(name, move || initial_value)
    }

    /// Like [`get_or_create`](Self::get_or_create), building the initial
    /// value only when the state is actually created.
    pub fn get_or_create_with<F>(&self, name: &str, initial_value: F) -> Result<Arc<State>>
    where
        F: FnOnce() -> StateValue,
    {
        self.ensure_live()?;
        validate_name(name)?;

        if let Some(entry) = self.states.read().get(name) {
            return Ok(Arc::clone(&entry.state));
        }

        let registration = self.registration.lock();
        self.ensure_live()?;
        if let Some(entry) = self.states.read().get(name) {
            return Ok(Arc::clone(&entry.state));
        }

        let initial_value = initial_value();
        let provider_kind = registration.provider.kind();
        let cell = registration
            .provider
            .create_state(name, initial_value.clone());
        let state = Arc::new(State::with_watcher(name, cell, self.watcher.clone()));

        // Created must precede any Updated, so announce before publishing.
        self.watcher
            .send(ChangeEvent::created(name, initial_value.clone()));
        self.states.write().insert(
            name.to_string(),
            StateEntry {
                provider_kind,
                state: Arc::clone(&state),
                initial_value,
            },
        );
        drop(registration);

        debug!(state = %name, provider = provider_kind, "state created");
        Ok(state)
    }

    /// Get an existing state.
    pub fn get(&self, name: &str) -> Result<Option<Arc<State>>> {
        self.ensure_live()?;
        Ok(self
            .states
            .read()
            .get(name)
            .map(|entry| Arc::clone(&entry.state)))
    }

    /// Typed handle for `K`, creating the state with `K::Value::default()`.
    ///
    /// Fails with [`StateError::TypeMismatch`] if the name already holds a
    /// value of another type.
    pub fn typed<K: StateKey>(&self) -> Result<TypedState<K::Value>> {
        let state = self.get_or_create_with(K::NAME, || state_value(K::Value::default()))?;
        if !state.read().is::<K::Value>() {
            return Err(StateError::TypeMismatch {
                name: K::NAME.to_string(),
                expected: std::any::type_name::<K::Value>(),
            });
        }
        Ok(TypedState::new(state))
    }

    /// Subscribe to the state for `K`, creating it if needed.
    pub fn subscribe<K, F>(&self, callback: F) -> Result<Subscription>
    where
        K: StateKey,
        F: Fn(&K::Value) + Send + Sync + 'static,
    {
        Ok(self.typed::<K>()?.subscribe(callback))
    }

    /// Subscribe to an existing state by name.
    pub fn subscribe_named<F>(&self, name: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&StateValue) + Send + Sync + 'static,
    {
        match self.get(name)? {
            Some(state) => Ok(state.subscribe(callback)),
            None => Err(StateError::InvalidArgument(format!(
                "unknown state: {}",
                name
            ))),
        }
    }

    /// Replace the active provider and take ownership of it.
    pub fn set_provider(&self, provider: Arc<dyn StateProvider>) -> Result<()> {
        self.swap_provider(provider, true)
    }

    /// Replace the active provider without taking ownership of it.
    ///
    /// The registry never disposes a borrowed provider.
    pub fn set_borrowed_provider(&self, provider: Arc<dyn StateProvider>) -> Result<()> {
        self.swap_provider(provider, false)
    }

    fn swap_provider(&self, provider: Arc<dyn StateProvider>, owned: bool) -> Result<()> {
        self.ensure_live()?;

        let mut registration = self.registration.lock();
        self.ensure_live()?;

        let previous = std::mem::replace(
            &mut *registration,
            ProviderRegistration { provider, owned },
        );
        let kind = registration.provider.kind();

        let mut events = Vec::new();
        {
            let mut states = self.states.write();
            for (name, entry) in states.iter_mut() {
                let value = entry.state.rebind(registration.provider.as_ref());
                entry.provider_kind = kind;
                events.push(ChangeEvent::rebound(
                    name.as_str(),
                    value,
                    entry.state.version(),
                ));
            }
        }

        info!(
            provider = kind,
            previous = previous.provider.kind(),
            states = events.len(),
            "state provider replaced"
        );

        let same_provider = std::ptr::eq(
            Arc::as_ptr(&previous.provider) as *const (),
            Arc::as_ptr(&registration.provider) as *const (),
        );
        drop(registration);

        if previous.owned && !same_provider {
            dispose_provider(previous.provider.as_ref());
        }

        for event in events {
            self.watcher.send(event);
        }
        Ok(())
    }

    /// Kind of the active provider.
    pub fn provider_kind(&self) -> &'static str {
        self.registration.lock().provider.kind()
    }

    /// Initial value recorded for `name` when it was created.
    pub fn initial_value(&self, name: &str) -> Option<StateValue> {
        self.states
            .read()
            .get(name)
            .map(|entry| entry.initial_value.clone())
    }

    /// Snapshot of all entries, sorted by name.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let mut entries: Vec<EntryInfo> = self
            .states
            .read()
            .iter()
            .map(|(name, entry)| EntryInfo {
                name: name.clone(),
                provider_kind: entry.provider_kind,
                version: entry.state.version(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Whether a state exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.states.read().contains_key(name)
    }

    /// Number of named states.
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether the registry holds no states.
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Watch changes to states matching `pattern` (exact name or `prefix*`).
    pub fn watch(&self, pattern: &str) -> Result<WatchStream> {
        self.ensure_live()?;
        Ok(self.watcher.subscribe(pattern))
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Tear down the registry, disposing the active provider if owned.
    ///
    /// Idempotent. Provider errors are logged, never returned.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let registration = self.registration.lock();
        if registration.owned {
            dispose_provider(registration.provider.as_ref());
        }
        debug!("state registry disposed");
    }
}

fn dispose_provider(provider: &dyn StateProvider) {
    if let Err(e) = provider.dispose() {
        warn!(provider = provider.kind(), error = %e, "state provider dispose failed");
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new(Arc::new(MemoryProvider::new()))
    }
}

impl Drop for StateRegistry {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRegistry")
            .field("provider", &self.provider_kind())
            .field("states", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

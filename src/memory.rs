//! In-memory state providers.
//!
//! Neither provider is durable; values live as long as the process.
//! [`MemoryProvider`] is the default backend. [`VersionedProvider`] keeps
//! per-cell write metadata and is handy as a swap target.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::Result;
use crate::provider::{StateCell, StateProvider};
use crate::state::StateValue;

/// Plain in-memory storage cell.
pub struct MemoryCell {
    value: RwLock<StateValue>,
}

impl MemoryCell {
    /// Create a cell holding `value`.
    pub fn new(value: StateValue) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }
}

impl StateCell for MemoryCell {
    fn read(&self) -> StateValue {
        self.value.read().clone()
    }

    fn write(&self, value: StateValue) {
        *self.value.write() = value;
    }
}

/// Default provider: in-memory cells, no side effects, no-op disposal.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryProvider;

impl MemoryProvider {
    /// Create a new memory provider.
    pub fn new() -> Self {
        Self
    }
}

impl StateProvider for MemoryProvider {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn create_state(&self, _name: &str, initial_value: StateValue) -> Arc<dyn StateCell> {
        Arc::new(MemoryCell::new(initial_value))
    }
}

/// Write metadata for one [`VersionedCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellInfo {
    /// Writes since the cell was created. The initial value does not count.
    pub writes: u64,
    /// When the cell was created.
    pub created_at: SystemTime,
    /// When the cell was last written (creation time if never written).
    pub updated_at: SystemTime,
}

struct VersionedSlot {
    value: StateValue,
    info: CellInfo,
}

/// In-memory cell that tracks write count and timestamps.
pub struct VersionedCell {
    slot: RwLock<VersionedSlot>,
}

impl VersionedCell {
    /// Create a cell holding `value`.
    pub fn new(value: StateValue) -> Self {
        let now = SystemTime::now();
        Self {
            slot: RwLock::new(VersionedSlot {
                value,
                info: CellInfo {
                    writes: 0,
                    created_at: now,
                    updated_at: now,
                },
            }),
        }
    }

    /// Current write metadata.
    pub fn info(&self) -> CellInfo {
        self.slot.read().info
    }
}

impl StateCell for VersionedCell {
    fn read(&self) -> StateValue {
        self.slot.read().value.clone()
    }

    fn write(&self, value: StateValue) {
        let mut slot = self.slot.write();
        slot.value = value;
        slot.info.writes += 1;
        slot.info.updated_at = SystemTime::now();
    }
}

/// Provider of [`VersionedCell`]s.
///
/// Counts the cells it hands out and the writes they receive, and records
/// whether it has been disposed.
#[derive(Default)]
pub struct VersionedProvider {
    created: AtomicUsize,
    writes: Arc<AtomicU64>,
    disposed: AtomicBool,
}

struct CountingCell {
    inner: VersionedCell,
    writes: Arc<AtomicU64>,
}

impl StateCell for CountingCell {
    fn read(&self) -> StateValue {
        self.inner.read()
    }

    fn write(&self, value: StateValue) {
        self.inner.write(value);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl VersionedProvider {
    /// Create a new versioned provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cells created so far.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Total writes across all cells created by this provider.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Whether [`StateProvider::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl StateProvider for VersionedProvider {
    fn kind(&self) -> &'static str {
        "versioned"
    }

    fn create_state(&self, _name: &str, initial_value: StateValue) -> Arc<dyn StateCell> {
        self.created.fetch_add(1, Ordering::AcqRel);
        Arc::new(CountingCell {
            inner: VersionedCell::new(initial_value),
            writes: Arc::clone(&self.writes),
        })
    }

    fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

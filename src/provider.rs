//! StateProvider trait - the pluggable storage behind every named state.
//!
//! A provider only knows how to allocate storage cells. Deduplication by
//! name, subscriber bookkeeping and change notification live above it in
//! [`State`](crate::state::State) and [`StateRegistry`](crate::registry::StateRegistry),
//! so a provider can be swapped without touching either.

use std::sync::Arc;

use crate::error::{Result, StateError};
use crate::state::StateValue;

/// Maximum state name length in bytes.
pub const MAX_NAME_LENGTH: usize = 1024;

/// Validate that a state name is well-formed.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StateError::InvalidArgument(
            "state name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(StateError::InvalidArgument(format!(
            "state name exceeds maximum length of {} bytes",
            MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

/// A single provider-owned storage cell.
///
/// Reads never block on writers for longer than a value swap and never fail.
pub trait StateCell: Send + Sync {
    /// Return the current value.
    fn read(&self) -> StateValue;

    /// Replace the current value.
    fn write(&self, value: StateValue);
}

/// Backing implementation that creates storage for named states.
///
/// Calling [`create_state`](StateProvider::create_state) twice with the same
/// name yields two independent cells; the registry is responsible for keeping
/// one cell per name.
pub trait StateProvider: Send + Sync {
    /// Short identifier recorded on every registry entry this provider backs.
    fn kind(&self) -> &'static str;

    /// Create a storage cell for `name` holding `initial_value`.
    fn create_state(&self, name: &str, initial_value: StateValue) -> Arc<dyn StateCell>;

    /// Release provider resources.
    ///
    /// Called by the registry when an owned provider is replaced or the
    /// registry is torn down. Errors are logged and otherwise ignored.
    fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

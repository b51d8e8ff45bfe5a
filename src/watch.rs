//! Registry-wide change feed.
//!
//! Complements per-state callbacks with an async stream of every creation,
//! write and provider rebind, filtered by name pattern. The feed is lossy for
//! slow consumers: a lagging stream skips what it missed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

use crate::state::StateValue;

/// Default change feed capacity.
pub const WATCH_CAPACITY_DEFAULT: usize = 1024;

/// Type of change that occurred to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// State was created with its initial value.
    Created,
    /// State was written.
    Updated,
    /// State storage was moved to a new provider; the value is unchanged.
    Rebound,
}

/// A change to a named state.
#[derive(Clone)]
pub struct ChangeEvent {
    /// The state that changed.
    pub name: String,
    /// Type of change.
    pub event_type: EventType,
    /// Value after the change.
    pub value: StateValue,
    /// State version after the change.
    pub version: u64,
}

impl ChangeEvent {
    /// Create a new Created event.
    pub fn created(name: impl Into<String>, value: StateValue) -> Self {
        Self {
            name: name.into(),
            event_type: EventType::Created,
            value,
            version: 0,
        }
    }

    /// Create a new Updated event.
    pub fn updated(name: impl Into<String>, value: StateValue, version: u64) -> Self {
        Self {
            name: name.into(),
            event_type: EventType::Updated,
            value,
            version,
        }
    }

    /// Create a new Rebound event.
    pub fn rebound(name: impl Into<String>, value: StateValue, version: u64) -> Self {
        Self {
            name: name.into(),
            event_type: EventType::Rebound,
            value,
            version,
        }
    }

    /// The value as `T`, if it has that type.
    pub fn value_as<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("name", &self.name)
            .field("event_type", &self.event_type)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// A stream of change events for a specific pattern.
///
/// The pattern is an exact state name, or a prefix followed by `*`.
pub struct WatchStream {
    inner: BroadcastStream<ChangeEvent>,
    pattern: String,
}

impl WatchStream {
    /// Create a new watch stream for the given pattern.
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>, pattern: impl Into<String>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            pattern: pattern.into(),
        }
    }

    /// Get the pattern this stream is watching.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, name: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == self.pattern,
        }
    }
}

impl Stream for WatchStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(event)) => {
                    if self.matches(&event.name) {
                        return Poll::Ready(Some(event));
                    }
                }
                // Lagged: the skipped events are gone, keep reading.
                Some(Err(_)) => continue,
                None => return Poll::Ready(None),
            }
        }
    }
}

/// Handle for sending change events to watchers.
#[derive(Clone)]
pub struct WatchSender {
    sender: broadcast::Sender<ChangeEvent>,
}

impl WatchSender {
    /// Create a new watch sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all watchers.
    pub fn send(&self, event: ChangeEvent) {
        // No watchers is not an error.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events.
    pub fn subscribe(&self, pattern: impl Into<String>) -> WatchStream {
        WatchStream::new(self.sender.subscribe(), pattern)
    }

    /// Get the number of current watchers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WatchSender {
    fn default() -> Self {
        Self::new(WATCH_CAPACITY_DEFAULT)
    }
}

//! Dispatch configuration.
//!
//! The only option is the action queue capacity. Loading is tolerant: an
//! absent, unparseable or zero value falls back to the default.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// Default action queue capacity.
pub const QUEUE_CAPACITY_DEFAULT: usize = 100;

/// Configuration key holding the queue capacity.
pub const QUEUE_CAPACITY_KEY: &str = "QueueCapacity";

/// Environment variable read by [`DispatchConfig::from_env`].
pub const QUEUE_CAPACITY_ENV: &str = "UNIVRS_DISPATCH_QUEUE_CAPACITY";

/// Configuration for the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum queued actions before producers wait.
    #[serde(default = "default_queue_capacity", alias = "QueueCapacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    QUEUE_CAPACITY_DEFAULT
}

fn parse_capacity(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|capacity| *capacity > 0)
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl DispatchConfig {
    /// Create a configuration with the given queue capacity.
    pub fn new(queue_capacity: usize) -> Self {
        Self { queue_capacity }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(StateError::Configuration(
                "queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a key lookup, such as a host's configuration section.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_capacity = lookup(QUEUE_CAPACITY_KEY)
            .as_deref()
            .and_then(parse_capacity)
            .unwrap_or(QUEUE_CAPACITY_DEFAULT);
        Self { queue_capacity }
    }

    /// Load from the `UNIVRS_DISPATCH_QUEUE_CAPACITY` environment variable.
    pub fn from_env() -> Self {
        Self::from_lookup(|_| std::env::var(QUEUE_CAPACITY_ENV).ok())
    }

    /// Load from a JSON document, ignoring anything malformed.
    ///
    /// The capacity may be a number or a numeric string under
    /// `QueueCapacity` or `queue_capacity`.
    pub fn from_json(json: &str) -> Self {
        let document: serde_json::Value = match serde_json::from_str(json) {
            Ok(document) => document,
            Err(_) => return Self::default(),
        };

        Self::from_lookup(|key| {
            let value = document
                .get(key)
                .or_else(|| document.get("queue_capacity"))?;
            match value {
                serde_json::Value::Number(n) => Some(n.to_string()),
                serde_json::Value::String(s) => Some(s.clone()),
                _ => None,
            }
        })
    }

    /// Parse a JSON document, surfacing malformed input as an error.
    pub fn parse_json_strict(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

//! Configuration for the dispatcher, snapshot ingestion and event routing.
//!
//! All configs are plain structs with a `Default` and can be loaded from JSON.

use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult, ValidationError};

/// Which tracking states count as "present" for lifecycle purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresencePolicy {
    /// Only fully tracked entities are alive.
    #[default]
    TrackedOnly,
    /// Anything except `NotTracked` is alive.
    AnyPresence,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Per-subscriber buffer for each live stream. `None` buffers without bound
    /// so an attached consumer never misses an update.
    pub stream_capacity: Option<usize>,
    /// Per-subscriber buffer for the new-entities stream.
    pub batch_capacity: Option<usize>,
    /// Presence rule applied when filtering a snapshot.
    pub presence: PresencePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            stream_capacity: None,
            batch_capacity: None,
            presence: PresencePolicy::TrackedOnly,
        }
    }
}

impl DispatcherConfig {
    /// Checks capacities.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ZeroCapacity` for a bounded capacity of zero.
    pub fn validate(&self) -> StreamResult<()> {
        check_capacity("stream_capacity", self.stream_capacity)?;
        check_capacity("batch_capacity", self.batch_capacity)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the JSON is malformed or invalid.
    pub fn from_json(json: &str) -> StreamResult<Self> {
        let cfg: Self = parse_json(json)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Configuration of the snapshot source feeding a dispatcher worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Index of the sensor the snapshots come from. Index 0 is valid.
    pub sensor_index: i32,
    /// Max queued snapshots before producers block.
    pub queue_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            sensor_index: 0,
            queue_capacity: 64,
        }
    }
}

impl SourceConfig {
    /// Checks the sensor index and queue capacity.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::NegativeSensorIndex` for `sensor_index < 0`
    /// and `ValidationError::ZeroCapacity` for an empty queue.
    pub fn validate(&self) -> StreamResult<()> {
        if self.sensor_index < 0 {
            return Err(ValidationError::NegativeSensorIndex {
                index: self.sensor_index,
            }
            .into());
        }
        check_capacity("queue_capacity", Some(self.queue_capacity))
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the JSON is malformed or invalid.
    pub fn from_json(json: &str) -> StreamResult<Self> {
        let cfg: Self = parse_json(json)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Configuration of a shared event hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Per-subscriber buffer. `None` is unbounded.
    pub capacity: Option<usize>,
}

impl RouterConfig {
    /// Checks the capacity.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ZeroCapacity` for a bounded capacity of zero.
    pub fn validate(&self) -> StreamResult<()> {
        check_capacity("capacity", self.capacity)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the JSON is malformed or invalid.
    pub fn from_json(json: &str) -> StreamResult<Self> {
        let cfg: Self = parse_json(json)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn check_capacity(field: &str, capacity: Option<usize>) -> StreamResult<()> {
    if capacity == Some(0) {
        return Err(ValidationError::ZeroCapacity {
            field: field.to_string(),
        }
        .into());
    }
    Ok(())
}

fn parse_json<T: serde::de::DeserializeOwned>(json: &str) -> StreamResult<T> {
    serde_json::from_str(json).map_err(|e| {
        StreamError::Validation(ValidationError::InvalidConfig {
            reason: e.to_string(),
        })
    })
}

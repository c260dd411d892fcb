//! World configuration.

use serde::{Deserialize, Serialize};

use crate::storage::{DEFAULT_ENUM_INDEX_THRESHOLD, DEFAULT_LOGGED_FRAMES};
use crate::EcsError;

/// Capacity and storage tuning for a [`World`](crate::world::World).
///
/// Every column storage and archetype member array is allocated at
/// `max_entities` rows up front; growing past it requires an explicit
/// [`World::resize`](crate::world::World::resize).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Number of simultaneously live entities. Default: 1024.
    pub max_entities: usize,

    /// History depth of logged storages that do not set their own.
    /// Default: 15 frames.
    pub logged_frames: usize,

    /// Enum storages with more options than this look options up through a
    /// hash map instead of a linear scan. Default: 20.
    pub enum_index_threshold: usize,
}

impl WorldConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, EcsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_max_entities(mut self, max_entities: usize) -> Self {
        self.max_entities = max_entities;
        self
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            max_entities: 1024,
            logged_frames: DEFAULT_LOGGED_FRAMES,
            enum_index_threshold: DEFAULT_ENUM_INDEX_THRESHOLD,
        }
    }
}

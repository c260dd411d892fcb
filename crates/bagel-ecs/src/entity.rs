//! Entity identifiers, allocation and the entity → archetype directory.
//!
//! An [`Entity`] is a bare 32-bit index. Ids are unique while alive and are
//! reused after destruction, most-recently-freed first. There is no generation
//! counter: holding an id past its entity's destruction is the caller's bug.
//!
//! The [`EntityDirectory`] owns allocation and the location table. The table
//! is a [`SharedBuffer`] so executors can resolve an entity's archetype
//! without asking the primary thread.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::archetype::{ArchetypeId, DEFAULT_ARCHETYPE};
use crate::buffer::SharedBuffer;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// An entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(u32);

impl Entity {
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The raw index, which is also the row in every column storage.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityDirectory
// ---------------------------------------------------------------------------

/// Allocates entity ids and records each live entity's current archetype.
#[derive(Debug, Clone)]
pub struct EntityDirectory {
    /// Entity index -> archetype id. Dead slots point at the default archetype.
    locations: SharedBuffer<u32>,
    alive: Vec<bool>,
    /// Recycled ids, reused LIFO.
    free: Vec<u32>,
    /// Next never-used id.
    next: u32,
    live: usize,
}

impl EntityDirectory {
    /// A directory able to hold `capacity` simultaneous ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            locations: SharedBuffer::new(capacity),
            alive: vec![false; capacity],
            free: Vec::new(),
            next: 0,
            live: 0,
        }
    }

    /// Executor-side directory over a shared location table. It can resolve
    /// locations but never allocates.
    pub(crate) fn from_locations(locations: SharedBuffer<u32>) -> Self {
        let capacity = locations.len();
        Self {
            locations,
            alive: Vec::new(),
            free: Vec::new(),
            next: capacity as u32,
            live: 0,
        }
    }

    /// Allocate an id, preferring the most recently released one.
    pub fn allocate(&mut self) -> Result<Entity, EcsError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if (self.next as usize) < self.alive.len() => {
                let index = self.next;
                self.next += 1;
                index
            }
            None => {
                return Err(EcsError::CapacityExceeded {
                    what: "entity",
                    capacity: self.capacity(),
                })
            }
        };
        self.alive[index as usize] = true;
        self.locations.set(index as usize, DEFAULT_ARCHETYPE.0);
        self.live += 1;
        Ok(Entity(index))
    }

    /// Return an id to the free list. Returns `false` if it was not alive.
    pub fn release(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        self.alive[entity.slot()] = false;
        self.locations.set(entity.slot(), DEFAULT_ARCHETYPE.0);
        self.free.push(entity.0);
        self.live -= 1;
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.alive.get(entity.slot()).copied().unwrap_or(false)
    }

    /// The archetype an entity currently sits in, read from the shared table.
    #[inline]
    pub fn location(&self, entity: Entity) -> Option<ArchetypeId> {
        self.locations.get(entity.slot()).map(ArchetypeId)
    }

    #[inline]
    pub(crate) fn set_location(&self, entity: Entity, archetype: ArchetypeId) {
        self.locations.set(entity.slot(), archetype.0);
    }

    pub fn capacity(&self) -> usize {
        self.locations.len()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Highest id ever handed out plus one.
    pub fn allocated(&self) -> usize {
        self.next as usize
    }

    /// Live entities in ascending id order.
    pub fn iter_alive(&self) -> impl Iterator<Item = Entity> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, alive)| **alive)
            .map(|(i, _)| Entity(i as u32))
    }

    /// Reallocate the location table for a new capacity.
    pub fn resize(&mut self, capacity: usize) -> Result<(), EcsError> {
        if capacity < self.next as usize {
            return Err(EcsError::InvalidResize {
                requested: capacity,
                allocated: self.next as usize,
            });
        }
        self.locations = self.locations.resized(capacity);
        self.alive.resize(capacity, false);
        Ok(())
    }

    pub fn locations(&self) -> &SharedBuffer<u32> {
        &self.locations
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

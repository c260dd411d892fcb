//! Bagel ECS -- archetype-based Entity Component System with shared column storage.
//!
//! Entities are plain integer ids grouped into archetypes (one per distinct
//! component set). Component data lives in per-property column storages
//! indexed directly by entity id, so bulk iteration is a walk over an
//! archetype's packed member array plus direct column reads. Numeric columns
//! and membership arrays are shared buffers, which lets external executors
//! ("remote systems") receive a snapshot of the world without copying.
//!
//! # Quick Start
//!
//! ```
//! use bagel_ecs::prelude::*;
//!
//! let mut world = World::new(64);
//! let position = world.registry_mut().register_composite(
//!     "position",
//!     &[("x", StorageTypeId::F32), ("y", StorageTypeId::F32)],
//! ).unwrap();
//! let frozen = world.registry_mut().register("frozen").unwrap();
//!
//! let start = position.instance([Value::Number(1.0), Value::Number(2.0)]).unwrap();
//! let entity = world.spawn_with([ComponentArg::from(start)]).unwrap();
//!
//! let moving = world.register_query(QueryModifier::all([
//!     QueryModifier::with([position.id]),
//!     QueryModifier::without([frozen]),
//! ]));
//! assert_eq!(world.entities(moving).unwrap(), vec![entity]);
//!
//! world.increment(entity, position.property("x").unwrap(), 0.5).unwrap();
//! assert_eq!(world.get(entity, position.property("x").unwrap()).unwrap(), Value::Number(1.5));
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod blueprint;
pub mod buffer;
pub mod component;
pub mod config;
pub mod entity;
pub mod executor;
pub mod query;
pub mod relationship;
pub mod resource;
pub mod snapshot;
pub mod storage;
pub mod system;
pub mod value;
pub mod world;

use component::ComponentId;
use entity::Entity;
use storage::StorageTypeId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity is not alive (never spawned or already destroyed).
    #[error("entity {entity:?} is not alive")]
    DeadEntity { entity: Entity },

    /// A fixed-capacity structure is full. Call `World::resize` first.
    #[error("{what} capacity of {capacity} exceeded")]
    CapacityExceeded { what: &'static str, capacity: usize },

    /// An entity id falls outside the addressable range of a storage.
    #[error("entity {entity:?} is outside storage bounds (capacity {capacity})")]
    EntityOutOfBounds { entity: Entity, capacity: usize },

    /// No column storage has been created for this property id.
    #[error("no storage exists for property {property:?}")]
    UnknownStorage { property: ComponentId },

    /// A storage-type id was referenced that was never registered.
    #[error("storage type {storage_type:?} is not registered")]
    UnknownStorageType { storage_type: StorageTypeId },

    /// An archetype id does not belong to this graph.
    #[error("archetype {0:?} does not exist")]
    UnknownArchetype(archetype::ArchetypeId),

    /// A query id does not belong to this query engine.
    #[error("query {0} is not registered")]
    UnknownQuery(u32),

    /// A component or property name could not be resolved.
    #[error("component '{name}' is not registered")]
    UnknownComponent { name: String },

    /// A value of the wrong shape was written to a storage.
    #[error("storage of kind {kind} cannot hold {found}")]
    TypeMismatch { kind: &'static str, found: &'static str },

    /// An enum storage was given a value outside its option list.
    #[error("'{option}' is not one of the enum options [{options}]")]
    UnknownEnumOption { option: String, options: String },

    /// Enum storages index options with a single byte.
    #[error("enum storage supports at most 256 options, got {count}")]
    TooManyEnumOptions { count: usize },

    /// A system id was never handed out by this world.
    #[error("unknown system {id}")]
    UnknownSystem { id: u32 },

    /// The registry ran out of ids below the relationship range.
    #[error("cannot register '{name}': component ids are limited to {limit}")]
    RegistryExhausted { name: String, limit: u32 },

    /// A relationship kind or target does not fit the packed encoding.
    #[error("relationship (kind {kind}, target {target}) does not fit the packed encoding")]
    RelationshipOverflow { kind: u32, target: u32 },

    /// Stride must be at least one and the offset strictly below it.
    #[error("invalid stride {stride} with offset {offset}")]
    InvalidStride { stride: usize, offset: usize },

    /// Resizing below the number of already-allocated entity ids.
    #[error("cannot resize to {requested}: {allocated} entity ids are already allocated")]
    InvalidResize { requested: usize, allocated: usize },

    /// Rollback was requested on a storage that keeps no history.
    #[error("storage for property {property:?} is not logged")]
    NotLogged { property: ComponentId },

    /// A composite instance was built with the wrong number of values.
    #[error("component '{component}' has {expected} properties, got {found} values")]
    ArityMismatch { component: String, expected: usize, found: usize },

    /// Configuration could not be parsed.
    #[error("invalid world configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// An external executor failed or disconnected.
    #[error("executor failure: {0}")]
    Executor(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeGraph, ArchetypeId, DEFAULT_ARCHETYPE};
    pub use crate::blueprint::Blueprint;
    pub use crate::component::{
        ComponentArg, ComponentId, ComponentInstance, ComponentRegistry, ComponentSpec,
    };
    pub use crate::config::WorldConfig;
    pub use crate::entity::{Entity, EntityDirectory};
    pub use crate::executor::{ExecutorHandle, RemoteSystemId};
    pub use crate::query::{ComponentLookup, QueryFilter, QueryId, QueryModifier};
    pub use crate::relationship::{relationship, CHILD, PARENT};
    pub use crate::snapshot::{RemoteWorld, SnapshotPayload, StrideAssignment};
    pub use crate::storage::{ComponentStorage, Rollback, StorageKind, StorageOptions, StorageTypeId};
    pub use crate::system::{System, SystemId};
    pub use crate::value::Value;
    pub use crate::world::{EntityMut, World};
    pub use crate::EcsError;
}

//! Snapshot handoff to executors and the executor-side world view.
//!
//! A [`SnapshotPayload`] carries shared handles, not copies: every column
//! buffer, archetype member array and the entity directory are the same
//! memory the primary world uses. A [`RemoteWorld`] rebuilt from it can read
//! and write values and iterate queries, but never changes structure.

use std::collections::BTreeMap;

use crate::archetype::{ArchetypeGraph, ArchetypeState, GraphState};
use crate::component::{ComponentId, ComponentRegistry};
use crate::entity::Entity;
use crate::query::{GraphAccess, QueryEngine, QueryId, QueryModifier};
use crate::storage::{ComponentStorage, StorageOptions, StorageState, StorageTypes, Storages};
use crate::value::Value;
use crate::EcsError;

pub use crate::query::StrideAssignment;

/// Archetype announcement sent after the initial snapshot.
pub type NewArchetype = ArchetypeState;

/// Everything an executor needs to mirror a world.
#[derive(Debug, Clone)]
pub struct SnapshotPayload {
    pub component_ids: BTreeMap<String, ComponentId>,
    /// Custom storage types in registration order.
    pub custom_storages: Vec<StorageOptions>,
    pub storages: Vec<(ComponentId, StorageState)>,
    pub graph: GraphState,
    /// Slots this executor is responsible for.
    pub stride: StrideAssignment,
}

// ---------------------------------------------------------------------------
// RemoteWorld
// ---------------------------------------------------------------------------

/// Executor-side view of a world.
#[derive(Debug)]
pub struct RemoteWorld {
    registry: ComponentRegistry,
    storage_types: StorageTypes,
    storages: Storages,
    graph: ArchetypeGraph,
    queries: QueryEngine,
    stride: StrideAssignment,
}

impl RemoteWorld {
    pub fn from_snapshot(payload: SnapshotPayload) -> Result<Self, EcsError> {
        let mut registry = ComponentRegistry::new();
        registry.load_id_map(payload.component_ids)?;

        let mut storage_types = StorageTypes::default();
        for options in payload.custom_storages {
            storage_types.register(options)?;
        }

        let capacity = payload.graph.capacity;
        tracing::debug!(
            capacity,
            storages = payload.storages.len(),
            archetypes = payload.graph.archetypes.len(),
            stride = payload.stride.stride,
            offset = payload.stride.offset,
            "rebuilt remote world from snapshot"
        );
        Ok(Self {
            registry,
            storage_types,
            storages: Storages::from_states(capacity, payload.storages),
            graph: ArchetypeGraph::from_state(payload.graph),
            queries: QueryEngine::with_stride(payload.stride),
            stride: payload.stride,
        })
    }

    /// Adopt an archetype created on the primary after the snapshot and
    /// offer it to every registered query.
    pub fn apply_new_archetype(&mut self, archetype: NewArchetype) -> Result<(), EcsError> {
        let id = archetype.id;
        self.graph.apply_archetype(archetype)?;
        if let Some(archetype) = self.graph.archetype(id) {
            self.queries.on_archetype_created(archetype);
        }
        Ok(())
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Resolve a component or property id by name.
    pub fn component(&self, name: &str) -> Result<ComponentId, EcsError> {
        self.registry
            .lookup(name)
            .ok_or_else(|| EcsError::UnknownComponent {
                name: name.to_owned(),
            })
    }

    pub fn storage_types(&self) -> &StorageTypes {
        &self.storage_types
    }

    pub fn stride(&self) -> StrideAssignment {
        self.stride
    }

    pub fn capacity(&self) -> usize {
        self.graph.capacity()
    }

    // -- Queries ----------------------------------------------------------

    /// Register a query. It iterates with this executor's stride.
    pub fn register_query(&mut self, modifier: impl Into<QueryModifier>) -> QueryId {
        self.queries.register(&modifier.into(), &self.graph)
    }

    pub fn entities(&self, query: QueryId) -> Result<Vec<Entity>, EcsError> {
        self.queries.entities(query, &self.graph)
    }

    pub fn for_each<F>(&mut self, query: QueryId, visit: F) -> Result<(), EcsError>
    where
        F: FnMut(&mut RemoteWorld, Entity) -> Result<(), EcsError>,
    {
        let plan = self.queries.plan(query)?;
        plan.run(self, visit)
    }

    // -- Values -----------------------------------------------------------

    pub fn has(&self, entity: Entity, component: ComponentId) -> bool {
        self.graph
            .directory()
            .location(entity)
            .and_then(|id| self.graph.archetype(id))
            .is_some_and(|a| a.contains(component))
    }

    pub fn storage(&self, property: ComponentId) -> Result<&dyn ComponentStorage, EcsError> {
        self.storages.get(property)
    }

    pub fn get(&self, entity: Entity, property: ComponentId) -> Result<Value, EcsError> {
        self.storages.get(property)?.get(entity)
    }

    pub fn update(
        &mut self,
        entity: Entity,
        property: ComponentId,
        value: impl Into<Value>,
    ) -> Result<(), EcsError> {
        self.storages.get_mut(property)?.set(entity, value.into())
    }

    pub fn increment(&mut self, entity: Entity, property: ComponentId, amount: f64) -> Result<(), EcsError> {
        self.storages.get_mut(property)?.increment(entity, amount)
    }

    pub fn multiply(&mut self, entity: Entity, property: ComponentId, factor: f64) -> Result<(), EcsError> {
        self.storages.get_mut(property)?.multiply(entity, factor)
    }

    pub fn modulo(&mut self, entity: Entity, property: ComponentId, divisor: f64) -> Result<(), EcsError> {
        self.storages.get_mut(property)?.modulo(entity, divisor)
    }
}

impl GraphAccess for RemoteWorld {
    fn graph(&self) -> &ArchetypeGraph {
        &self.graph
    }
}

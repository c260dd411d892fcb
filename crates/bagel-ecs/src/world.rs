//! The [`World`] is the top-level container for the ECS. It owns the
//! component registry, the column storages, the archetype graph with its
//! entity directory, every registered query, typed resources and the
//! executors of remote systems.
//!
//! Structural changes (spawn, add, remove, destroy) go through the graph;
//! whenever one creates an archetype, the world offers it to every query and
//! broadcasts it to every executor before returning.

use std::any::Any;
use std::fmt;

use crate::archetype::{ArchetypeGraph, ArchetypeId, DEFAULT_ARCHETYPE};
use crate::blueprint::Blueprint;
use crate::component::{ComponentArg, ComponentId, ComponentRegistry, PropertyWrite};
use crate::config::WorldConfig;
use crate::entity::Entity;
use crate::executor::{ExecutorHandle, Executors, RemoteSystemId};
use crate::query::{GraphAccess, QueryEngine, QueryId, QueryModifier, StrideAssignment};
use crate::relationship::{self, CHILD, PARENT};
use crate::resource::Resources;
use crate::snapshot::SnapshotPayload;
use crate::storage::{
    ComponentStorage, Rollback, StorageKind, StorageOptions, StorageTypeId, StorageTypes, Storages,
};
use crate::system::{System, SystemId, Systems};
use crate::value::Value;
use crate::EcsError;

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The central ECS container.
pub struct World {
    config: WorldConfig,
    registry: ComponentRegistry,
    storage_types: StorageTypes,
    storages: Storages,
    graph: ArchetypeGraph,
    queries: QueryEngine,
    resources: Resources,
    systems: Systems,
    executors: Executors,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("max_entities", &self.config.max_entities)
            .field("entity_count", &self.entity_count())
            .field("archetype_count", &self.graph.len())
            .field("storages", &self.storages.len())
            .field("queries", &self.queries.len())
            .field("systems", &self.systems.len())
            .field("remote_systems", &self.executors.len())
            .finish()
    }
}

impl World {
    /// A world with room for `max_entities` live entities and default tuning.
    pub fn new(max_entities: usize) -> Self {
        Self::with_config(WorldConfig::default().with_max_entities(max_entities))
    }

    pub fn with_config(config: WorldConfig) -> Self {
        Self {
            registry: ComponentRegistry::new(),
            storage_types: StorageTypes::new(config.logged_frames, config.enum_index_threshold),
            storages: Storages::new(config.max_entities),
            graph: ArchetypeGraph::new(config.max_entities),
            queries: QueryEngine::new(),
            resources: Resources::new(),
            systems: Systems::new(),
            executors: Executors::new(),
            config,
        }
    }

    /// Settings the world was built with.
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Component names, ids and storages.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    /// Archetypes and entity locations. Mutate through the world so
    /// executors and queries stay in step.
    pub fn graph(&self) -> &ArchetypeGraph {
        &self.graph
    }

    pub fn capacity(&self) -> usize {
        self.graph.capacity()
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.graph.directory().len()
    }

    pub fn archetype_count(&self) -> usize {
        self.graph.len()
    }

    // -- Structural plumbing ----------------------------------------------

    fn archetype_created(&mut self, id: ArchetypeId) {
        if let Some(archetype) = self.graph.archetype(id) {
            self.queries.on_archetype_created(archetype);
            self.executors.broadcast(&archetype.state());
        }
    }

    /// Announce every archetype the graph created, even when the structural
    /// change that created it failed afterwards.
    fn announce_created(&mut self) {
        for id in self.graph.take_created() {
            self.archetype_created(id);
        }
    }

    fn write_property(&mut self, entity: Entity, write: PropertyWrite) -> Result<(), EcsError> {
        let (storage, created) =
            self.storages
                .get_or_create(write.property, write.storage_type, &self.storage_types)?;
        if created {
            self.executors.mark_dirty();
        }
        // Null means "not provided" except where the column can hold it.
        if write.value.is_null() && storage.kind() != StorageKind::Nullable {
            return Ok(());
        }
        storage.set(entity, write.value)
    }

    fn ensure_alive(&self, entity: Entity) -> Result<(), EcsError> {
        if self.is_alive(entity) {
            Ok(())
        } else {
            Err(EcsError::DeadEntity { entity })
        }
    }

    // -- Entities ---------------------------------------------------------

    /// Spawn an entity with no components.
    pub fn spawn(&mut self) -> Result<Entity, EcsError> {
        self.graph.spawn()
    }

    /// Spawn an entity and attach each component in order. If any attach
    /// fails the entity is despawned and its id freed again.
    pub fn spawn_with<I>(&mut self, components: I) -> Result<Entity, EcsError>
    where
        I: IntoIterator,
        I::Item: Into<ComponentArg>,
    {
        let entity = self.spawn()?;
        let attached = components
            .into_iter()
            .try_for_each(|component| self.add(entity, component));
        if let Err(err) = attached {
            self.graph.despawn(entity);
            return Err(err);
        }
        Ok(entity)
    }

    /// Remove the entity from its archetype and free its id for reuse.
    /// Column values are left in place. Destroying a dead entity is a no-op.
    pub fn destroy(&mut self, entity: Entity) -> Result<(), EcsError> {
        if !self.graph.despawn(entity) {
            tracing::warn!(entity = ?entity, "destroy of dead entity ignored");
        }
        Ok(())
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.graph.directory().is_alive(entity)
    }

    /// Capability handle for one live entity.
    pub fn entity_mut(&mut self, entity: Entity) -> Result<EntityMut<'_>, EcsError> {
        self.ensure_alive(entity)?;
        Ok(EntityMut {
            world: self,
            entity,
        })
    }

    /// Every live entity, in id order.
    pub fn alive_entities(&self) -> Vec<Entity> {
        self.graph.directory().iter_alive().collect()
    }

    // -- Components -------------------------------------------------------

    /// Attach a component. Its property values are written before the
    /// entity moves, so queries never see it without its data. Adding a
    /// component the entity already has changes nothing.
    pub fn add(&mut self, entity: Entity, component: impl Into<ComponentArg>) -> Result<(), EcsError> {
        let component = component.into();
        self.ensure_alive(entity)?;
        if !self.graph.has_component(entity, component.id()) {
            for write in component.property_writes(&self.registry) {
                self.write_property(entity, write)?;
            }
        }
        let transition = self.graph.entity_add_component(entity, component.id());
        self.announce_created();
        transition.map(|_| ())
    }

    /// Attach a data-less component.
    pub fn tag(&mut self, entity: Entity, component: ComponentId) -> Result<(), EcsError> {
        self.add(entity, ComponentArg::Tag(component))
    }

    /// Detach a component and clear its property values. Removing a
    /// component the entity does not have changes nothing.
    pub fn remove(&mut self, entity: Entity, component: ComponentId) -> Result<(), EcsError> {
        let transition = self.graph.entity_remove_component(entity, component);
        self.announce_created();
        if transition?.is_none() {
            return Ok(());
        }

        let properties = match self.registry.spec(component) {
            Some(spec) => spec.property_ids,
            None => vec![component],
        };
        for property in properties {
            if let Ok(storage) = self.storages.get_mut(property) {
                storage.delete(entity)?;
            }
        }
        Ok(())
    }

    pub fn has(&self, entity: Entity, component: ComponentId) -> bool {
        self.graph.has_component(entity, component)
    }

    /// Sorted component set of a live entity.
    pub fn components(&self, entity: Entity) -> Result<&[ComponentId], EcsError> {
        self.graph
            .location(entity)
            .and_then(|id| self.graph.archetype(id))
            .map(|a| a.components())
            .ok_or(EcsError::DeadEntity { entity })
    }

    // -- Values -----------------------------------------------------------

    pub fn get(&self, entity: Entity, property: ComponentId) -> Result<Value, EcsError> {
        self.ensure_alive(entity)?;
        self.storages.get(property)?.get(entity)
    }

    pub fn update(
        &mut self,
        entity: Entity,
        property: ComponentId,
        value: impl Into<Value>,
    ) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        self.storages.get_mut(property)?.set(entity, value.into())
    }

    pub fn increment(&mut self, entity: Entity, property: ComponentId, amount: f64) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        self.storages.get_mut(property)?.increment(entity, amount)
    }

    pub fn multiply(&mut self, entity: Entity, property: ComponentId, factor: f64) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        self.storages.get_mut(property)?.multiply(entity, factor)
    }

    pub fn modulo(&mut self, entity: Entity, property: ComponentId, divisor: f64) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        self.storages.get_mut(property)?.modulo(entity, divisor)
    }

    /// Column storage of a property, if any value was ever attached for it.
    pub fn storage(&self, property: ComponentId) -> Result<&dyn ComponentStorage, EcsError> {
        self.storages.get(property)
    }

    pub fn storage_types(&self) -> &StorageTypes {
        &self.storage_types
    }

    /// Register a custom storage type (logged, enum, nullable, ranged).
    /// Equal options share one id.
    pub fn register_storage(&mut self, options: StorageOptions) -> Result<StorageTypeId, EcsError> {
        self.storage_types.register(options)
    }

    // -- Queries ----------------------------------------------------------

    pub fn register_query(&mut self, modifier: impl Into<QueryModifier>) -> QueryId {
        self.queries.register(&modifier.into(), &self.graph)
    }

    /// Evaluate a modifier once without registering it.
    pub fn query(&self, modifier: impl Into<QueryModifier>) -> Vec<Entity> {
        QueryEngine::evaluate(&modifier.into(), &self.graph)
    }

    /// Matching entities in visit order, honoring the query's stride.
    pub fn entities(&self, query: QueryId) -> Result<Vec<Entity>, EcsError> {
        self.queries.entities(query, &self.graph)
    }

    /// Visit every matching entity. The visitor gets the whole world and may
    /// change the current entity's components or destroy it.
    pub fn for_each<F>(&mut self, query: QueryId, visit: F) -> Result<(), EcsError>
    where
        F: FnMut(&mut World, Entity) -> Result<(), EcsError>,
    {
        let plan = self.queries.plan(query)?;
        plan.run(self, visit)
    }

    /// Visit entities that started matching since they were last reported.
    pub fn for_each_added<F>(&mut self, query: QueryId, mut visit: F) -> Result<(), EcsError>
    where
        F: FnMut(&mut World, Entity) -> Result<(), EcsError>,
    {
        self.queries.refresh(query, &self.graph)?;
        for entity in self.queries.take_added(query)? {
            visit(self, entity)?;
        }
        Ok(())
    }

    /// Visit entities that stopped matching since they were last reported.
    pub fn for_each_removed<F>(&mut self, query: QueryId, mut visit: F) -> Result<(), EcsError>
    where
        F: FnMut(&mut World, Entity) -> Result<(), EcsError>,
    {
        self.queries.refresh(query, &self.graph)?;
        for entity in self.queries.take_removed(query)? {
            visit(self, entity)?;
        }
        Ok(())
    }

    /// Both differential passes over one scan. Removals are reported first.
    pub fn for_each_changed<A, R>(
        &mut self,
        query: QueryId,
        mut on_added: A,
        mut on_removed: R,
    ) -> Result<(), EcsError>
    where
        A: FnMut(&mut World, Entity) -> Result<(), EcsError>,
        R: FnMut(&mut World, Entity) -> Result<(), EcsError>,
    {
        self.queries.refresh(query, &self.graph)?;
        let removed = self.queries.take_removed(query)?;
        let added = self.queries.take_added(query)?;
        for entity in removed {
            on_removed(self, entity)?;
        }
        for entity in added {
            on_added(self, entity)?;
        }
        Ok(())
    }

    pub fn set_stride(&mut self, query: QueryId, stride: usize, offset: usize) -> Result<(), EcsError> {
        self.queries.set_stride(query, stride, offset)
    }

    pub fn reset_stride(&mut self, query: QueryId) -> Result<(), EcsError> {
        self.queries.reset_stride(query)
    }

    // -- Capacity and frames ----------------------------------------------

    /// Reallocate every storage and membership array for `max_entities`
    /// rows. Values survive; executors are resynced before their next update.
    pub fn resize(&mut self, max_entities: usize) -> Result<(), EcsError> {
        self.graph.resize(max_entities)?;
        self.storages.resize(max_entities);
        self.config.max_entities = max_entities;
        self.executors.mark_dirty();
        tracing::debug!(max_entities, storages = self.storages.len(), "resized world");
        Ok(())
    }

    /// Close the current frame for every history-keeping storage.
    pub fn advance_frame(&mut self) {
        self.storages.advance_frame();
    }

    /// Roll one logged property back `frames` frames.
    pub fn rollback(
        &mut self,
        property: ComponentId,
        frames: usize,
        truncate: bool,
    ) -> Result<Rollback, EcsError> {
        match self.storages.get_mut(property)?.rollback(frames, truncate) {
            Some(result) => result,
            None => Err(EcsError::NotLogged { property }),
        }
    }

    /// Roll every logged property back `frames` frames.
    pub fn rollback_all(
        &mut self,
        frames: usize,
        truncate: bool,
    ) -> Result<Vec<(ComponentId, Rollback)>, EcsError> {
        let mut reports = Vec::new();
        for (property, storage) in self.storages.iter_mut() {
            if let Some(result) = storage.rollback(frames, truncate) {
                reports.push((property, result?));
            }
        }
        Ok(reports)
    }

    // -- Relationships ----------------------------------------------------

    /// Attach the relationship `(kind, target)`, optionally with a value.
    pub fn relate(
        &mut self,
        entity: Entity,
        kind: ComponentId,
        target: Entity,
        data: Option<Value>,
    ) -> Result<ComponentId, EcsError> {
        let id = relationship::relationship(kind, target)?;
        let component = match data {
            Some(value) => ComponentArg::Value(id, value),
            None => ComponentArg::Tag(id),
        };
        self.add(entity, component)?;
        Ok(id)
    }

    pub fn unrelate(&mut self, entity: Entity, kind: ComponentId, target: Entity) -> Result<(), EcsError> {
        let id = relationship::relationship(kind, target)?;
        self.remove(entity, id)
    }

    /// Every target the entity relates to by `kind`.
    pub fn related_all(&self, entity: Entity, kind: ComponentId) -> Result<Vec<Entity>, EcsError> {
        Ok(relationship::related_all(self.components(entity)?, kind).collect())
    }

    pub fn related_single(&self, entity: Entity, kind: ComponentId) -> Result<Option<Entity>, EcsError> {
        Ok(relationship::related_single(self.components(entity)?, kind))
    }

    /// Link `child` under `parent`, detaching it from any previous parent.
    pub fn add_child(&mut self, parent: Entity, child: Entity) -> Result<(), EcsError> {
        self.ensure_alive(parent)?;
        if let Some(previous) = self.parent(child)? {
            if previous == parent {
                return Ok(());
            }
            self.remove_child(previous, child)?;
        }
        self.relate(parent, CHILD, child, None)?;
        self.relate(child, PARENT, parent, None)?;
        Ok(())
    }

    pub fn remove_child(&mut self, parent: Entity, child: Entity) -> Result<(), EcsError> {
        self.unrelate(parent, CHILD, child)?;
        self.unrelate(child, PARENT, parent)
    }

    pub fn children(&self, entity: Entity) -> Result<Vec<Entity>, EcsError> {
        self.related_all(entity, CHILD)
    }

    pub fn parent(&self, entity: Entity) -> Result<Option<Entity>, EcsError> {
        self.related_single(entity, PARENT)
    }

    // -- Blueprints -------------------------------------------------------

    /// Resolve the archetype of a component bundle once, keeping the
    /// bundle's values as spawn defaults.
    pub fn blueprint<I>(&mut self, components: I) -> Result<Blueprint, EcsError>
    where
        I: IntoIterator,
        I::Item: Into<ComponentArg>,
    {
        let components: Vec<ComponentArg> = components.into_iter().map(Into::into).collect();
        let ids: Vec<ComponentId> = components.iter().map(ComponentArg::id).collect();
        let defaults: Vec<PropertyWrite> = components
            .iter()
            .flat_map(|c| c.property_writes(&self.registry))
            .collect();
        for write in &defaults {
            self.storage_types.kind(write.storage_type)?;
        }

        let (archetype, _) = self.graph.get_or_create(&ids);
        self.announce_created();
        let components = self
            .graph
            .archetype(archetype)
            .map(|a| a.components().to_vec())
            .ok_or(EcsError::UnknownArchetype(archetype))?;
        Ok(Blueprint {
            archetype,
            components,
            defaults,
        })
    }

    pub fn spawn_blueprint(&mut self, blueprint: &Blueprint) -> Result<Entity, EcsError> {
        self.spawn_blueprint_with(blueprint, [])
    }

    /// Spawn from a blueprint, replacing some default values.
    pub fn spawn_blueprint_with(
        &mut self,
        blueprint: &Blueprint,
        overrides: impl IntoIterator<Item = (ComponentId, Value)>,
    ) -> Result<Entity, EcsError> {
        let matches = self
            .graph
            .archetype(blueprint.archetype)
            .is_some_and(|a| a.components() == blueprint.components());
        if !matches {
            return Err(EcsError::UnknownArchetype(blueprint.archetype));
        }

        let registry = &self.registry;
        let writes = blueprint.writes_with(overrides, |property, value| {
            registry
                .storage_type(property)
                .unwrap_or_else(|| StorageTypeId::infer(value))
        });

        let entity = self.graph.spawn()?;
        let placed = writes
            .into_iter()
            .try_for_each(|write| self.write_property(entity, write))
            .and_then(|()| {
                self.graph
                    .move_without_graph(entity, DEFAULT_ARCHETYPE, blueprint.archetype)
            });
        if let Err(err) = placed {
            self.graph.despawn(entity);
            return Err(err);
        }
        Ok(entity)
    }

    // -- Resources --------------------------------------------------------

    /// Insert a typed singleton, returning the one it replaced.
    pub fn insert_resource<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.resources.insert(value)
    }

    pub fn resource<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.resources.get()
    }

    pub fn resource_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.resources.get_mut()
    }

    pub fn remove_resource<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.resources.remove()
    }

    // -- Local systems ----------------------------------------------------

    /// Add a system, enabled. Its `init` runs immediately; if it fails the
    /// system is not added.
    pub fn add_system(&mut self, mut system: impl System + 'static) -> Result<SystemId, EcsError> {
        system.init(self)?;
        let id = self.systems.push(Box::new(system));
        tracing::debug!(system = ?id, name = self.systems.name(id)?, "added system");
        Ok(id)
    }

    pub fn enable_system(&mut self, id: SystemId) -> Result<(), EcsError> {
        self.systems.set_enabled(id, true)
    }

    /// Skip the system on later updates. It keeps its queries.
    pub fn disable_system(&mut self, id: SystemId) -> Result<(), EcsError> {
        self.systems.set_enabled(id, false)
    }

    pub fn systems(&self) -> &Systems {
        &self.systems
    }

    /// Run every enabled system once, in registration order. Stops at the
    /// first error; systems after it do not run this update.
    pub fn update_systems(&mut self) -> Result<(), EcsError> {
        for id in self.systems.enabled() {
            let Some(mut system) = self.systems.take(id)? else {
                continue;
            };
            let result = system.update(self);
            self.systems.restore(id, system);
            if let Err(err) = result {
                tracing::warn!(system = ?id, name = self.systems.name(id)?, error = %err, "system update failed");
                return Err(err);
            }
        }
        Ok(())
    }

    // -- Remote systems ---------------------------------------------------

    /// Shared-handle snapshot of the world for one executor.
    pub fn snapshot(&self, stride: StrideAssignment) -> SnapshotPayload {
        SnapshotPayload {
            component_ids: self.registry.id_map().clone(),
            custom_storages: self.storage_types.custom().to_vec(),
            storages: self.storages.states(),
            graph: self.graph.state(),
            stride,
        }
    }

    /// Attach a remote system run by `executors`. Executor `i` of `n` is
    /// assigned stride `n`, offset `i`, and receives its snapshot before
    /// this returns.
    pub fn add_remote_system(
        &mut self,
        executors: Vec<Box<dyn ExecutorHandle>>,
    ) -> Result<RemoteSystemId, EcsError> {
        if executors.is_empty() {
            return Err(EcsError::InvalidStride {
                stride: 0,
                offset: 0,
            });
        }
        let id = self.executors.push(executors);
        self.sync_remote_system(id)?;
        Ok(id)
    }

    /// Resubmit a fresh snapshot to every executor of the group.
    pub fn sync_remote_system(&mut self, id: RemoteSystemId) -> Result<(), EcsError> {
        let count = self.executors.group_size(id)?;
        let payloads = (0..count)
            .map(|offset| Ok(self.snapshot(StrideAssignment::new(count, offset)?)))
            .collect::<Result<Vec<_>, EcsError>>()?;
        tracing::debug!(remote_system = id.0, executors = count, "submitting snapshots");
        self.executors.submit(id, payloads)
    }

    /// Run one update of a remote system and wait for every executor.
    pub fn update_remote_system(&mut self, id: RemoteSystemId) -> Result<(), EcsError> {
        if self.executors.needs_sync(id)? {
            self.sync_remote_system(id)?;
        }
        self.executors.run(id)
    }

    /// Update every remote system in attachment order.
    pub fn update_remote_systems(&mut self) -> Result<(), EcsError> {
        let ids: Vec<RemoteSystemId> = self.executors.ids().collect();
        for id in ids {
            self.update_remote_system(id)?;
        }
        Ok(())
    }

    pub fn remote_system_count(&self) -> usize {
        self.executors.len()
    }

    pub fn executors(&self) -> &Executors {
        &self.executors
    }
}

impl GraphAccess for World {
    fn graph(&self) -> &ArchetypeGraph {
        &self.graph
    }
}

// ---------------------------------------------------------------------------
// EntityMut
// ---------------------------------------------------------------------------

/// A live entity together with mutable access to its world.
pub struct EntityMut<'w> {
    world: &'w mut World,
    entity: Entity,
}

impl<'w> EntityMut<'w> {
    pub fn id(&self) -> Entity {
        self.entity
    }

    pub fn world(&mut self) -> &mut World {
        self.world
    }

    pub fn add(&mut self, component: impl Into<ComponentArg>) -> Result<&mut Self, EcsError> {
        self.world.add(self.entity, component)?;
        Ok(self)
    }

    pub fn tag(&mut self, component: ComponentId) -> Result<&mut Self, EcsError> {
        self.world.tag(self.entity, component)?;
        Ok(self)
    }

    pub fn remove(&mut self, component: ComponentId) -> Result<&mut Self, EcsError> {
        self.world.remove(self.entity, component)?;
        Ok(self)
    }

    pub fn has(&self, component: ComponentId) -> bool {
        self.world.has(self.entity, component)
    }

    pub fn components(&self) -> Result<&[ComponentId], EcsError> {
        self.world.components(self.entity)
    }

    pub fn get(&self, property: ComponentId) -> Result<Value, EcsError> {
        self.world.get(self.entity, property)
    }

    pub fn update(&mut self, property: ComponentId, value: impl Into<Value>) -> Result<&mut Self, EcsError> {
        self.world.update(self.entity, property, value)?;
        Ok(self)
    }

    pub fn increment(&mut self, property: ComponentId, amount: f64) -> Result<&mut Self, EcsError> {
        self.world.increment(self.entity, property, amount)?;
        Ok(self)
    }

    pub fn relate(
        &mut self,
        kind: ComponentId,
        target: Entity,
        data: Option<Value>,
    ) -> Result<&mut Self, EcsError> {
        self.world.relate(self.entity, kind, target, data)?;
        Ok(self)
    }

    pub fn related_all(&self, kind: ComponentId) -> Result<Vec<Entity>, EcsError> {
        self.world.related_all(self.entity, kind)
    }

    pub fn add_child(&mut self, child: Entity) -> Result<&mut Self, EcsError> {
        self.world.add_child(self.entity, child)?;
        Ok(self)
    }

    pub fn children(&self) -> Result<Vec<Entity>, EcsError> {
        self.world.children(self.entity)
    }

    pub fn parent(&self) -> Result<Option<Entity>, EcsError> {
        self.world.parent(self.entity)
    }

    pub fn destroy(self) -> Result<(), EcsError> {
        self.world.destroy(self.entity)
    }
}

impl fmt::Debug for EntityMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityMut").field(&self.entity).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::ArchetypeState;
    use crate::component::ComponentSpec;
    use crate::snapshot::RemoteWorld;
    use std::sync::{Arc, Mutex};

    struct Fixture {
        world: World,
        position: ComponentSpec,
        health: ComponentId,
        frozen: ComponentId,
    }

    fn setup_world() -> Fixture {
        let mut world = World::new(16);
        let position = world.registry_mut().register_composite(
            "position",
            &[("x", StorageTypeId::F32), ("y", StorageTypeId::F32)],
        ).unwrap();
        let health = world.registry_mut().register_value("health", StorageTypeId::I32).unwrap();
        let frozen = world.registry_mut().register("frozen").unwrap();
        Fixture {
            world,
            position,
            health,
            frozen,
        }
    }

    fn at(spec: &ComponentSpec, x: f64, y: f64) -> ComponentArg {
        spec.instance([Value::Number(x), Value::Number(y)])
            .unwrap()
            .into()
    }

    fn sorted(mut v: Vec<Entity>) -> Vec<Entity> {
        v.sort();
        v
    }

    #[test]
    fn add_has_remove() {
        let Fixture {
            mut world, frozen, ..
        } = setup_world();
        let e = world.spawn().unwrap();
        assert!(!world.has(e, frozen));
        world.tag(e, frozen).unwrap();
        assert!(world.has(e, frozen));
        world.remove(e, frozen).unwrap();
        assert!(!world.has(e, frozen));
        assert!(world.components(e).unwrap().is_empty());
    }

    #[test]
    fn composite_values_round_trip_through_columns() {
        let Fixture {
            mut world, position, ..
        } = setup_world();
        let e = world.spawn_with([at(&position, 1.0, 2.0)]).unwrap();
        let x = position.property("x").unwrap();
        let y = position.property("y").unwrap();

        world.increment(e, x, 0.5).unwrap();
        world.multiply(e, y, 3.0).unwrap();
        assert_eq!(world.get(e, x).unwrap(), Value::Number(1.5));
        assert_eq!(world.get(e, y).unwrap(), Value::Number(6.0));
        world.modulo(e, y, 4.0).unwrap();
        assert_eq!(world.get(e, y).unwrap(), Value::Number(2.0));
        assert_eq!(world.storage(x).unwrap().storage_type(), StorageTypeId::F32);
    }

    #[test]
    fn duplicate_add_keeps_existing_values() {
        let Fixture {
            mut world, health, ..
        } = setup_world();
        let e = world.spawn_with([(health, 10)]).unwrap();
        world.add(e, (health, 99)).unwrap();
        assert_eq!(world.get(e, health).unwrap(), Value::Number(10.0));
        // Removing twice is equally harmless.
        world.remove(e, health).unwrap();
        world.remove(e, health).unwrap();
        assert!(!world.has(e, health));
    }

    #[test]
    fn unknown_storage_and_dead_entities_are_errors() {
        let Fixture {
            mut world, health, ..
        } = setup_world();
        let e = world.spawn().unwrap();
        assert!(matches!(
            world.get(e, health),
            Err(EcsError::UnknownStorage { .. })
        ));
        assert!(matches!(
            world.update(e, health, 3),
            Err(EcsError::UnknownStorage { .. })
        ));

        world.destroy(e).unwrap();
        assert!(matches!(world.tag(e, health), Err(EcsError::DeadEntity { .. })));
        assert!(matches!(world.get(e, health), Err(EcsError::DeadEntity { .. })));
        assert!(world.entity_mut(e).is_err());
        // Destroying again only warns.
        world.destroy(e).unwrap();
    }

    #[test]
    fn destroyed_ids_are_reused_last_in_first_out() {
        let mut world = World::new(8);
        let a = world.spawn().unwrap();
        let b = world.spawn().unwrap();
        world.destroy(a).unwrap();
        world.destroy(b).unwrap();
        assert_eq!(world.spawn().unwrap(), b);
        assert_eq!(world.spawn().unwrap(), a);
        assert_eq!(world.entity_count(), 2);
    }

    #[test]
    fn queries_see_archetypes_created_later() {
        let Fixture {
            mut world,
            position,
            frozen,
            ..
        } = setup_world();
        let moving = world.register_query(QueryModifier::all([
            QueryModifier::with([position.id]),
            QueryModifier::without([frozen]),
        ]));
        assert!(world.entities(moving).unwrap().is_empty());

        let a = world.spawn_with([at(&position, 0.0, 0.0)]).unwrap();
        let b = world
            .spawn_with([at(&position, 1.0, 1.0), ComponentArg::Tag(frozen)])
            .unwrap();
        assert_eq!(world.entities(moving).unwrap(), vec![a]);

        world.remove(b, frozen).unwrap();
        assert_eq!(sorted(world.entities(moving).unwrap()), vec![a, b]);
        assert_eq!(world.query(QueryModifier::with([frozen])), Vec::<Entity>::new());
    }

    #[test]
    fn for_each_may_remove_the_current_entity() {
        let Fixture {
            mut world, frozen, ..
        } = setup_world();
        let spawned: Vec<Entity> = (0..5)
            .map(|_| world.spawn_with([frozen]).unwrap())
            .collect();
        let q = world.register_query(frozen);

        let mut visited = Vec::new();
        world
            .for_each(q, |world, e| {
                visited.push(e);
                world.remove(e, frozen)
            })
            .unwrap();
        assert_eq!(sorted(visited), spawned);
        assert!(world.entities(q).unwrap().is_empty());
    }

    #[test]
    fn stride_shards_cover_every_entity_once() {
        let Fixture {
            mut world, frozen, ..
        } = setup_world();
        for _ in 0..10 {
            world.spawn_with([frozen]).unwrap();
        }
        let q = world.register_query(frozen);
        let mut all = Vec::new();
        for offset in 0..3 {
            world.set_stride(q, 3, offset).unwrap();
            all.extend(world.entities(q).unwrap());
        }
        world.reset_stride(q).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(sorted(all), sorted(world.entities(q).unwrap()));
    }

    #[test]
    fn added_and_removed_are_reported_once() {
        let Fixture {
            mut world, frozen, ..
        } = setup_world();
        let q = world.register_query(frozen);
        let e = world.spawn_with([frozen]).unwrap();

        let mut added = Vec::new();
        world
            .for_each_added(q, |_, e| {
                added.push(e);
                Ok(())
            })
            .unwrap();
        assert_eq!(added, vec![e]);

        world.remove(e, frozen).unwrap();
        // An added pass in between must not swallow the removal.
        world.for_each_added(q, |_, _| panic!("nothing was added")).unwrap();

        let mut removed = Vec::new();
        world
            .for_each_removed(q, |_, e| {
                removed.push(e);
                Ok(())
            })
            .unwrap();
        assert_eq!(removed, vec![e]);
        world.for_each_removed(q, |_, _| panic!("already reported")).unwrap();
    }

    #[test]
    fn for_each_changed_reports_both_directions() {
        let Fixture {
            mut world, frozen, ..
        } = setup_world();
        let q = world.register_query(frozen);
        let a = world.spawn_with([frozen]).unwrap();
        world.for_each_changed(q, |_, _| Ok(()), |_, _| Ok(())).unwrap();

        world.destroy(a).unwrap();
        let b = world.spawn().unwrap();
        let c = world.spawn_with([frozen]).unwrap();
        let log = std::cell::RefCell::new(Vec::new());
        world
            .for_each_changed(
                q,
                |_, e| {
                    log.borrow_mut().push(("added", e));
                    Ok(())
                },
                |_, e| {
                    log.borrow_mut().push(("removed", e));
                    Ok(())
                },
            )
            .unwrap();
        // `a` was recycled into `b` (no frozen); `c` is new.
        assert_eq!(b, a);
        assert_eq!(log.into_inner(), vec![("removed", a), ("added", c)]);
    }

    #[test]
    fn resize_round_trip_keeps_values() {
        let Fixture {
            mut world,
            position,
            health,
            ..
        } = setup_world();
        let spawned: Vec<Entity> = (0..16)
            .map(|i| world.spawn_with([(health, i)]).unwrap())
            .collect();
        assert!(matches!(
            world.spawn(),
            Err(EcsError::CapacityExceeded { .. })
        ));

        world.resize(32).unwrap();
        let extra = world.spawn_with([at(&position, 5.0, 6.0)]).unwrap();
        for (i, e) in spawned.iter().enumerate() {
            assert_eq!(world.get(*e, health).unwrap(), Value::Number(i as f64));
        }
        assert_eq!(
            world.get(extra, position.property("y").unwrap()).unwrap(),
            Value::Number(6.0)
        );
        assert!(matches!(
            world.resize(4),
            Err(EcsError::InvalidResize { .. })
        ));
    }

    #[test]
    fn logged_property_rolls_back() {
        let mut world = World::new(4);
        let logged = world
            .register_storage(StorageOptions::Logged {
                backing: StorageTypeId::F64,
                depth: None,
            })
            .unwrap();
        let score = world.registry_mut().register_value("score", logged).unwrap();
        let e = world.spawn_with([(score, 10)]).unwrap();
        world.advance_frame();
        world.update(e, score, 20).unwrap();
        world.advance_frame();
        world.update(e, score, 30).unwrap();

        let report = world.rollback(score, 1, false).unwrap();
        assert_eq!(report.frames, 1);
        assert_eq!(world.get(e, score).unwrap(), Value::Number(10.0));

        let reports = world.rollback_all(0, true).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, score);
    }

    #[test]
    fn rollback_of_plain_column_is_rejected() {
        let Fixture {
            mut world, health, ..
        } = setup_world();
        world.spawn_with([(health, 1)]).unwrap();
        assert!(matches!(
            world.rollback(health, 1, false),
            Err(EcsError::NotLogged { .. })
        ));
    }

    #[test]
    fn enum_storage_through_the_world() {
        let mut world = World::new(4);
        let mood = world
            .register_storage(StorageOptions::Enum {
                options: vec!["calm".into(), "angry".into()],
            })
            .unwrap();
        let temper = world.registry_mut().register_value("temper", mood).unwrap();
        let e = world.spawn_with([(temper, "angry")]).unwrap();
        assert_eq!(world.get(e, temper).unwrap(), Value::from("angry"));
        assert!(matches!(
            world.update(e, temper, "sleepy"),
            Err(EcsError::UnknownEnumOption { .. })
        ));
    }

    #[test]
    fn null_attach_marks_recycled_nullable_slot() {
        let mut world = World::new(4);
        let nullable = world
            .register_storage(StorageOptions::Nullable {
                backing: StorageTypeId::I16,
            })
            .unwrap();
        let target = world.registry_mut().register_value("target", nullable).unwrap();

        let a = world.spawn_with([(target, 5)]).unwrap();
        world.destroy(a).unwrap();
        let b = world.spawn_with([(target, Value::Null)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(world.get(b, target).unwrap(), Value::Null);

        // Non-nullable columns still treat null as "not provided".
        let Fixture {
            mut world, health, ..
        } = setup_world();
        let e = world.spawn_with([(health, 3)]).unwrap();
        world.remove(e, health).unwrap();
        world.add(e, (health, Value::Null)).unwrap();
        assert!(world.has(e, health));
    }

    #[test]
    fn failed_spawn_with_frees_the_entity() {
        let Fixture {
            mut world, frozen, ..
        } = setup_world();
        let mood = world
            .register_storage(StorageOptions::Enum {
                options: vec!["calm".into()],
            })
            .unwrap();
        let temper = world.registry_mut().register_value("temper", mood).unwrap();

        assert!(matches!(
            world.spawn_with([(temper, "furious")]),
            Err(EcsError::UnknownEnumOption { .. })
        ));
        assert_eq!(world.entity_count(), 0);

        // The first component lands before the second one fails.
        assert!(world
            .spawn_with([ComponentArg::from(frozen), ComponentArg::from((temper, "furious"))])
            .is_err());
        assert_eq!(world.entity_count(), 0);
        assert!(world.query(QueryModifier::with([frozen])).is_empty());

        let e = world.spawn_with([(temper, "calm")]).unwrap();
        assert_eq!(e, Entity::new(0));
        assert_eq!(world.alive_entities(), vec![e]);
    }

    #[test]
    fn hierarchy_links_both_ways() {
        let mut world = World::new(8);
        let root = world.spawn().unwrap();
        let other = world.spawn().unwrap();
        let child = world.spawn().unwrap();

        world.add_child(root, child).unwrap();
        assert_eq!(world.children(root).unwrap(), vec![child]);
        assert_eq!(world.parent(child).unwrap(), Some(root));

        // Reparenting detaches from the old parent.
        world.add_child(other, child).unwrap();
        assert!(world.children(root).unwrap().is_empty());
        assert_eq!(world.parent(child).unwrap(), Some(other));

        let has_parent = world.register_query(relationship::has_parent());
        assert_eq!(world.entities(has_parent).unwrap(), vec![child]);

        world.remove_child(other, child).unwrap();
        assert_eq!(world.parent(child).unwrap(), None);
        assert!(world.entities(has_parent).unwrap().is_empty());
    }

    #[test]
    fn relationships_can_carry_data() {
        let mut world = World::new(8);
        let likes = world.registry_mut().register("likes").unwrap();
        let a = world.spawn().unwrap();
        let b = world.spawn().unwrap();
        let id = world.relate(a, likes, b, Some(Value::Number(0.75))).unwrap();
        assert_eq!(world.get(a, id).unwrap(), Value::Number(0.75));
        assert_eq!(world.related_single(a, likes).unwrap(), Some(b));
        world.unrelate(a, likes, b).unwrap();
        assert!(world.related_all(a, likes).unwrap().is_empty());
    }

    #[test]
    fn blueprints_spawn_straight_into_their_archetype() {
        let Fixture {
            mut world,
            position,
            health,
            frozen,
        } = setup_world();
        let bp = world
            .blueprint([at(&position, 1.0, 1.0), (health, 100).into(), frozen.into()])
            .unwrap();
        let q = world.register_query(QueryModifier::with([position.id, health, frozen]));

        let plain = world.spawn_blueprint(&bp).unwrap();
        let hurt = world
            .spawn_blueprint_with(&bp, [(health, Value::Number(40.0))])
            .unwrap();
        assert_eq!(world.graph().location(plain), Some(bp.archetype()));
        assert_eq!(world.get(plain, health).unwrap(), Value::Number(100.0));
        assert_eq!(world.get(hurt, health).unwrap(), Value::Number(40.0));
        assert_eq!(sorted(world.entities(q).unwrap()), vec![plain, hurt]);
        // No edge from the default archetype was recorded.
        assert_eq!(
            world.graph().archetype(DEFAULT_ARCHETYPE).unwrap().add_edge(position.id),
            None
        );
    }

    #[test]
    fn blueprint_spawn_failure_leaves_no_entity() {
        let mut world = World::new(2);
        let tag = world.registry_mut().register("tag").unwrap();
        let bp = world.blueprint([tag]).unwrap();
        world.spawn_blueprint(&bp).unwrap();
        world.spawn_blueprint(&bp).unwrap();
        assert!(world.spawn_blueprint(&bp).is_err());
        assert_eq!(world.entity_count(), 2);
    }

    #[test]
    fn entity_mut_chains() {
        let Fixture {
            mut world,
            health,
            frozen,
            ..
        } = setup_world();
        let child = world.spawn().unwrap();
        let e = world.spawn().unwrap();
        world
            .entity_mut(e)
            .unwrap()
            .add((health, 5))
            .unwrap()
            .tag(frozen)
            .unwrap()
            .increment(health, 2.0)
            .unwrap()
            .add_child(child)
            .unwrap();
        assert_eq!(world.get(e, health).unwrap(), Value::Number(7.0));
        assert!(world.has(e, frozen));
        assert_eq!(world.parent(child).unwrap(), Some(e));
        world.entity_mut(e).unwrap().destroy().unwrap();
        assert!(!world.is_alive(e));
    }

    #[test]
    fn resources_are_keyed_by_type() {
        #[derive(Debug, PartialEq)]
        struct Tick(u64);
        let mut world = World::new(1);
        assert!(world.insert_resource(Tick(1)).is_none());
        world.resource_mut::<Tick>().unwrap().0 += 1;
        assert_eq!(world.resource::<Tick>(), Some(&Tick(2)));
        assert_eq!(world.remove_resource::<Tick>(), Some(Tick(2)));
        assert!(world.resource::<Tick>().is_none());
    }

    // -- Remote systems -----------------------------------------------------

    #[derive(Default)]
    struct Calls {
        snapshots: Vec<StrideAssignment>,
        archetypes: Vec<ArchetypeState>,
        updates: usize,
    }

    /// Executor that runs nothing and records what it was sent.
    struct RecordingExecutor {
        calls: Arc<Mutex<Calls>>,
        fail_broadcast: bool,
    }

    impl ExecutorHandle for RecordingExecutor {
        fn submit_snapshot(&mut self, payload: SnapshotPayload) -> Result<(), EcsError> {
            self.calls.lock().unwrap().snapshots.push(payload.stride);
            Ok(())
        }

        fn signal_update(&mut self) -> Result<(), EcsError> {
            Ok(())
        }

        fn await_update_complete(&mut self) -> Result<(), EcsError> {
            self.calls.lock().unwrap().updates += 1;
            Ok(())
        }

        fn broadcast_new_archetype(&mut self, archetype: ArchetypeState) -> Result<(), EcsError> {
            if self.fail_broadcast {
                return Err(EcsError::Executor("unreachable".into()));
            }
            self.calls.lock().unwrap().archetypes.push(archetype);
            Ok(())
        }
    }

    fn recording(n: usize, fail_broadcast: bool) -> (Vec<Box<dyn ExecutorHandle>>, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let handles = (0..n)
            .map(|_| {
                Box::new(RecordingExecutor {
                    calls: Arc::clone(&calls),
                    fail_broadcast,
                }) as Box<dyn ExecutorHandle>
            })
            .collect();
        (handles, calls)
    }

    #[test]
    fn executors_get_disjoint_strides_and_new_archetypes() {
        let Fixture {
            mut world, frozen, ..
        } = setup_world();
        let (handles, calls) = recording(3, false);
        let id = world.add_remote_system(handles).unwrap();
        {
            let calls = calls.lock().unwrap();
            let offsets: Vec<usize> = calls.snapshots.iter().map(|s| s.offset).collect();
            assert_eq!(offsets, vec![0, 1, 2]);
            assert!(calls.snapshots.iter().all(|s| s.stride == 3));
        }

        world.spawn_with([frozen]).unwrap();
        assert_eq!(calls.lock().unwrap().archetypes.len(), 3);

        world.update_remote_system(id).unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.updates, 3);
        // Tags create no storage, so no resync was needed.
        assert_eq!(calls.snapshots.len(), 3);
    }

    #[test]
    fn storage_creation_and_failed_broadcasts_force_resync() {
        let Fixture {
            mut world,
            health,
            frozen,
            ..
        } = setup_world();
        let (handles, calls) = recording(1, false);
        let id = world.add_remote_system(handles).unwrap();
        world.spawn_with([(health, 1)]).unwrap();
        world.update_remote_system(id).unwrap();
        assert_eq!(calls.lock().unwrap().snapshots.len(), 2);

        let (broken, broken_calls) = recording(2, true);
        let broken_id = world.add_remote_system(broken).unwrap();
        world.spawn_with([frozen]).unwrap();
        world.update_remote_systems().unwrap();
        assert_eq!(broken_calls.lock().unwrap().snapshots.len(), 4);
        assert_eq!(broken_calls.lock().unwrap().updates, 2);
        assert!(!world.executors.needs_sync(broken_id).unwrap());
        assert!(world.add_remote_system(Vec::new()).is_err());
    }

    #[test]
    fn remote_world_shares_memory_with_the_primary() {
        let Fixture {
            mut world,
            position,
            frozen,
            ..
        } = setup_world();
        let e = world.spawn_with([at(&position, 1.0, 2.0)]).unwrap();
        let mut remote = RemoteWorld::from_snapshot(world.snapshot(StrideAssignment::FULL)).unwrap();

        let x = remote.component("position.x").unwrap();
        assert_eq!(x, position.property("x").unwrap());
        let q = remote.register_query(QueryModifier::with([position.id]));
        remote
            .for_each(q, |remote, e| remote.increment(e, x, 10.0))
            .unwrap();
        assert_eq!(world.get(e, x).unwrap(), Value::Number(11.0));

        // Structural changes on the primary show through the shared buffers
        // once the new archetype has been applied.
        world.tag(e, frozen).unwrap();
        let created = world.graph().location(e).unwrap();
        remote
            .apply_new_archetype(world.graph().archetype(created).unwrap().state())
            .unwrap();
        assert_eq!(remote.entities(q).unwrap(), vec![e]);
        assert!(remote.has(e, frozen));
    }
}

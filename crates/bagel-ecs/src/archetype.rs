//! Archetypes and the transition graph between them.
//!
//! An [`Archetype`] is one distinct component set plus the packed list of
//! entities that currently have exactly that set. Archetypes are nodes of the
//! [`ArchetypeGraph`]; adding or removing one component moves an entity along
//! an edge. Edges are discovered lazily and memoized per archetype, so the
//! steady-state cost of a transition is one hash lookup plus a swap-remove.
//!
//! Packed member arrays are [`SharedBuffer`]s with the length in slot 0 and
//! members in slots `1..=len`. They never grow on their own: pushing past the
//! capacity is an error and the world must be resized first.

use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::buffer::SharedBuffer;
use crate::component::ComponentId;
use crate::entity::{Entity, EntityDirectory};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype within a graph. Ids are creation indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchetypeId(pub u32);

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

/// The empty component set. Every spawned entity starts here.
pub const DEFAULT_ARCHETYPE: ArchetypeId = ArchetypeId(0);

// ---------------------------------------------------------------------------
// PackedEntities
// ---------------------------------------------------------------------------

/// Length-prefixed member array with swap-remove.
#[derive(Debug, Clone)]
pub struct PackedEntities {
    buffer: SharedBuffer<u32>,
}

impl PackedEntities {
    /// Empty array with room for `capacity` members.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: SharedBuffer::new(capacity + 1),
        }
    }

    pub(crate) fn from_buffer(buffer: SharedBuffer<u32>) -> Self {
        Self { buffer }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.get(0).unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len().saturating_sub(1)
    }

    /// Member at packed position `index` (0-based).
    #[inline]
    pub fn get(&self, index: usize) -> Option<Entity> {
        if index < self.len() {
            self.buffer.get(index + 1).map(Entity::new)
        } else {
            None
        }
    }

    /// Append a member. The array never grows; a full one fails with `CapacityExceeded`.
    pub fn push(&self, entity: Entity) -> Result<(), EcsError> {
        let len = self.len();
        if len >= self.capacity() {
            return Err(EcsError::CapacityExceeded {
                what: "archetype",
                capacity: self.capacity(),
            });
        }
        self.buffer.set(len + 1, entity.index());
        self.buffer.set(0, (len + 1) as u32);
        Ok(())
    }

    /// Swap-remove `entity`. Returns `false` if it was not a member.
    pub fn remove(&self, entity: Entity) -> bool {
        let len = self.len();
        let Some(slot) = (1..=len).find(|&i| self.buffer.get(i) == Some(entity.index())) else {
            return false;
        };
        if let Some(last) = self.buffer.get(len) {
            self.buffer.set(slot, last);
        }
        self.buffer.set(0, (len - 1) as u32);
        true
    }

    /// Linear scan.
    pub fn contains(&self, entity: Entity) -> bool {
        (1..=self.len()).any(|i| self.buffer.get(i) == Some(entity.index()))
    }

    /// Members at the time of the call, in packed order.
    pub fn to_vec(&self) -> Vec<Entity> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }

    /// Copy into a fresh buffer of `capacity`, keeping members in order.
    pub fn resized(&self, capacity: usize) -> Self {
        Self {
            buffer: self.buffer.resized(capacity + 1),
        }
    }

    pub fn buffer(&self) -> &SharedBuffer<u32> {
        &self.buffer
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// One distinct component set and its members.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    /// Sorted, deduplicated.
    components: Vec<ComponentId>,
    entities: PackedEntities,
    /// Graph clock value of the last membership change.
    stamp: Arc<AtomicCell<u64>>,
    added: HashMap<ComponentId, ArchetypeId>,
    removed: HashMap<ComponentId, ArchetypeId>,
}

impl Archetype {
    fn new(id: ArchetypeId, components: Vec<ComponentId>, capacity: usize) -> Self {
        Self {
            id,
            components,
            entities: PackedEntities::new(capacity),
            stamp: Arc::new(AtomicCell::new(0)),
            added: HashMap::new(),
            removed: HashMap::new(),
        }
    }

    /// Index of this archetype in its graph.
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Sorted, deduplicated component set.
    pub fn components(&self) -> &[ComponentId] {
        &self.components
    }

    /// Binary search over the component set.
    pub fn contains(&self, component: ComponentId) -> bool {
        self.components.binary_search(&component).is_ok()
    }

    pub fn entities(&self) -> &PackedEntities {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Clock value of the last membership change (0 if never changed).
    pub fn last_modified(&self) -> u64 {
        self.stamp.load()
    }

    /// Memoized destination of adding `component`, if already discovered.
    pub fn add_edge(&self, component: ComponentId) -> Option<ArchetypeId> {
        self.added.get(&component).copied()
    }

    pub fn remove_edge(&self, component: ComponentId) -> Option<ArchetypeId> {
        self.removed.get(&component).copied()
    }

    /// Shared handles for executors.
    pub fn state(&self) -> ArchetypeState {
        ArchetypeState {
            id: self.id,
            components: self.components.clone(),
            entities: self.entities.buffer().clone(),
            stamp: Arc::clone(&self.stamp),
        }
    }

    fn from_state(state: ArchetypeState) -> Self {
        Self {
            id: state.id,
            components: state.components,
            entities: PackedEntities::from_buffer(state.entities),
            stamp: state.stamp,
            added: HashMap::new(),
            removed: HashMap::new(),
        }
    }
}

/// Shareable view of an archetype, sent to executors.
#[derive(Debug, Clone)]
pub struct ArchetypeState {
    pub id: ArchetypeId,
    pub components: Vec<ComponentId>,
    /// Length-prefixed member buffer.
    pub entities: SharedBuffer<u32>,
    pub stamp: Arc<AtomicCell<u64>>,
}

/// Shareable view of a whole graph.
#[derive(Debug, Clone)]
pub struct GraphState {
    pub archetypes: Vec<ArchetypeState>,
    /// Entity index -> archetype id.
    pub entity_archetypes: SharedBuffer<u32>,
    pub capacity: usize,
}

// ---------------------------------------------------------------------------
// ArchetypeGraph
// ---------------------------------------------------------------------------

/// Result of a structural change that actually moved an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ArchetypeId,
    pub to: ArchetypeId,
    /// Set when the destination archetype did not exist before this call.
    pub created: Option<ArchetypeId>,
}

/// All archetypes of a world plus the entity directory.
#[derive(Debug)]
pub struct ArchetypeGraph {
    archetypes: Vec<Archetype>,
    directory: EntityDirectory,
    clock: u64,
    capacity: usize,
    /// Created archetypes not yet announced to queries and executors.
    unannounced: Vec<ArchetypeId>,
}

impl ArchetypeGraph {
    /// A graph holding only the default archetype.
    pub fn new(capacity: usize) -> Self {
        Self {
            archetypes: vec![Archetype::new(DEFAULT_ARCHETYPE, Vec::new(), capacity)],
            directory: EntityDirectory::new(capacity),
            clock: 0,
            capacity,
            unannounced: Vec::new(),
        }
    }

    /// Rebuild over shared buffers. The result resolves locations and
    /// membership but cannot allocate entities.
    pub fn from_state(state: GraphState) -> Self {
        Self {
            archetypes: state.archetypes.into_iter().map(Archetype::from_state).collect(),
            directory: EntityDirectory::from_locations(state.entity_archetypes),
            clock: 0,
            capacity: state.capacity,
            unannounced: Vec::new(),
        }
    }

    pub fn state(&self) -> GraphState {
        GraphState {
            archetypes: self.archetypes.iter().map(Archetype::state).collect(),
            entity_archetypes: self.directory.locations().clone(),
            capacity: self.capacity,
        }
    }

    /// Append an archetype created elsewhere. Archetypes must arrive in
    /// creation order; already-known ids are ignored.
    pub fn apply_archetype(&mut self, state: ArchetypeState) -> Result<(), EcsError> {
        let next = self.archetypes.len() as u32;
        if state.id.0 < next {
            return Ok(());
        }
        if state.id.0 > next {
            return Err(EcsError::Executor(format!(
                "archetype {:?} received before archetype {}",
                state.id, next
            )));
        }
        self.archetypes.push(Archetype::from_state(state));
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.0 as usize)
    }

    /// Entity id to archetype mapping.
    pub fn directory(&self) -> &EntityDirectory {
        &self.directory
    }

    /// Archetype of a live entity.
    pub fn location(&self, entity: Entity) -> Option<ArchetypeId> {
        if self.directory.is_alive(entity) {
            self.directory.location(entity)
        } else {
            None
        }
    }

    pub fn has_component(&self, entity: Entity, component: ComponentId) -> bool {
        self.location(entity)
            .and_then(|id| self.archetype(id))
            .is_some_and(|a| a.contains(component))
    }

    /// Find the archetype with exactly `components` (sorted, deduplicated).
    pub fn find(&self, components: &[ComponentId]) -> Option<ArchetypeId> {
        self.archetypes
            .iter()
            .filter(|a| a.components.len() == components.len())
            .find(|a| a.components == components)
            .map(|a| a.id)
    }

    /// Archetype with exactly this set, creating it if needed. The flag is
    /// `true` when it was created by this call.
    pub fn get_or_create(&mut self, components: &[ComponentId]) -> (ArchetypeId, bool) {
        let mut set = components.to_vec();
        set.sort_unstable();
        set.dedup();
        match self.find(&set) {
            Some(id) => (id, false),
            None => (self.create(set), true),
        }
    }

    fn create(&mut self, components: Vec<ComponentId>) -> ArchetypeId {
        let id = ArchetypeId(self.archetypes.len() as u32);
        tracing::debug!(archetype = ?id, components = ?components, "created archetype");
        self.archetypes
            .push(Archetype::new(id, components, self.capacity));
        self.unannounced.push(id);
        id
    }

    /// Drain archetypes created since the last call, in creation order.
    /// Includes archetypes whose triggering move then failed.
    pub fn take_created(&mut self) -> Vec<ArchetypeId> {
        std::mem::take(&mut self.unannounced)
    }

    fn touch(&mut self, id: ArchetypeId) {
        self.clock += 1;
        if let Some(archetype) = self.archetypes.get(id.0 as usize) {
            archetype.stamp.store(self.clock);
        }
    }

    /// Allocate an entity in the default archetype.
    pub fn spawn(&mut self) -> Result<Entity, EcsError> {
        self.spawn_into(DEFAULT_ARCHETYPE)
    }

    /// Allocate an entity directly into `archetype`.
    pub fn spawn_into(&mut self, archetype: ArchetypeId) -> Result<Entity, EcsError> {
        let target = self
            .archetype(archetype)
            .ok_or(EcsError::UnknownArchetype(archetype))?;
        if target.len() >= target.entities.capacity() {
            return Err(EcsError::CapacityExceeded {
                what: "archetype",
                capacity: target.entities.capacity(),
            });
        }
        let entity = self.directory.allocate()?;
        self.archetypes[archetype.0 as usize].entities.push(entity)?;
        self.directory.set_location(entity, archetype);
        self.touch(archetype);
        Ok(entity)
    }

    /// Drop the entity from its archetype and free its id. Returns `false`
    /// if it was not alive.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        let Some(current) = self.location(entity) else {
            return false;
        };
        self.archetypes[current.0 as usize].entities.remove(entity);
        self.touch(current);
        self.directory.release(entity)
    }

    fn relocate(&mut self, entity: Entity, from: ArchetypeId, to: ArchetypeId) -> Result<(), EcsError> {
        if from == to {
            return Ok(());
        }
        let dest = &self.archetypes[to.0 as usize].entities;
        if dest.len() >= dest.capacity() {
            return Err(EcsError::CapacityExceeded {
                what: "archetype",
                capacity: dest.capacity(),
            });
        }
        self.archetypes[from.0 as usize].entities.remove(entity);
        self.archetypes[to.0 as usize].entities.push(entity)?;
        self.directory.set_location(entity, to);
        self.touch(from);
        self.touch(to);
        Ok(())
    }

    /// Move an entity between archetypes without consulting or recording
    /// graph edges. `from` is expected to be the entity's current archetype.
    pub fn move_without_graph(
        &mut self,
        entity: Entity,
        from: ArchetypeId,
        to: ArchetypeId,
    ) -> Result<(), EcsError> {
        let current = self.location(entity).ok_or(EcsError::DeadEntity { entity })?;
        if current != from {
            tracing::warn!(
                entity = ?entity,
                expected = ?from,
                actual = ?current,
                "move source is not the entity's archetype, moving from the actual one"
            );
        }
        if self.archetype(to).is_none() {
            return Err(EcsError::UnknownArchetype(to));
        }
        self.relocate(entity, current, to)
    }

    /// Add `component` to the entity's set. `Ok(None)` means it already had
    /// the component and nothing changed.
    pub fn entity_add_component(
        &mut self,
        entity: Entity,
        component: ComponentId,
    ) -> Result<Option<Transition>, EcsError> {
        let from = self.location(entity).ok_or(EcsError::DeadEntity { entity })?;
        let source = &self.archetypes[from.0 as usize];
        if source.contains(component) {
            tracing::warn!(
                entity = ?entity,
                component = ?component,
                "entity already has component, add ignored"
            );
            return Ok(None);
        }

        let (to, created) = match source.add_edge(component) {
            Some(to) => (to, false),
            None => {
                let mut set = source.components.clone();
                let at = set.binary_search(&component).unwrap_or_else(|i| i);
                set.insert(at, component);
                let (to, created) = match self.find(&set) {
                    Some(id) => (id, false),
                    None => (self.create(set), true),
                };
                self.archetypes[from.0 as usize].added.insert(component, to);
                self.archetypes[to.0 as usize].removed.insert(component, from);
                (to, created)
            }
        };

        self.relocate(entity, from, to)?;
        Ok(Some(Transition {
            from,
            to,
            created: created.then_some(to),
        }))
    }

    /// Remove `component` from the entity's set. `Ok(None)` means it did not
    /// have the component.
    pub fn entity_remove_component(
        &mut self,
        entity: Entity,
        component: ComponentId,
    ) -> Result<Option<Transition>, EcsError> {
        let from = self.location(entity).ok_or(EcsError::DeadEntity { entity })?;
        let source = &self.archetypes[from.0 as usize];
        if !source.contains(component) {
            tracing::warn!(
                entity = ?entity,
                component = ?component,
                "entity does not have component, remove ignored"
            );
            return Ok(None);
        }

        let (to, created) = match source.remove_edge(component) {
            Some(to) => (to, false),
            None => {
                let set: Vec<ComponentId> = source
                    .components
                    .iter()
                    .copied()
                    .filter(|&c| c != component)
                    .collect();
                let (to, created) = match self.find(&set) {
                    Some(id) => (id, false),
                    None => (self.create(set), true),
                };
                self.archetypes[from.0 as usize].removed.insert(component, to);
                self.archetypes[to.0 as usize].added.insert(component, from);
                (to, created)
            }
        };

        self.relocate(entity, from, to)?;
        Ok(Some(Transition {
            from,
            to,
            created: created.then_some(to),
        }))
    }

    /// Reallocate every packed array and the directory for a new capacity.
    /// Contents and lengths are preserved; shared handles go stale.
    pub fn resize(&mut self, capacity: usize) -> Result<(), EcsError> {
        self.directory.resize(capacity)?;
        for archetype in &mut self.archetypes {
            archetype.entities = archetype.entities.resized(capacity);
        }
        self.capacity = capacity;
        tracing::debug!(capacity, archetypes = self.archetypes.len(), "resized archetype graph");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const A: ComponentId = ComponentId(10);
    const B: ComponentId = ComponentId(11);

    #[test]
    fn packed_swap_remove() {
        let packed = PackedEntities::new(4);
        for i in 0..4 {
            packed.push(Entity::new(i)).unwrap();
        }
        assert!(packed.push(Entity::new(9)).is_err());
        assert!(packed.remove(Entity::new(1)));
        assert_eq!(packed.to_vec(), vec![Entity::new(0), Entity::new(3), Entity::new(2)]);
        // The last member is found too.
        assert!(packed.remove(Entity::new(2)));
        assert!(!packed.remove(Entity::new(2)));
        assert_eq!(packed.len(), 2);
    }

    #[test]
    fn spawn_lands_in_default_archetype() {
        let mut graph = ArchetypeGraph::new(8);
        let e = graph.spawn().unwrap();
        assert_eq!(graph.location(e), Some(DEFAULT_ARCHETYPE));
        assert!(graph.archetype(DEFAULT_ARCHETYPE).unwrap().entities().contains(e));
    }

    #[test]
    fn add_then_remove_follows_memoized_edges() {
        let mut graph = ArchetypeGraph::new(8);
        let e = graph.spawn().unwrap();

        let t = graph.entity_add_component(e, A).unwrap().unwrap();
        assert_eq!(t.from, DEFAULT_ARCHETYPE);
        assert_eq!(t.created, Some(t.to));
        assert!(graph.has_component(e, A));

        let back = graph.entity_remove_component(e, A).unwrap().unwrap();
        assert_eq!(back.to, DEFAULT_ARCHETYPE);
        assert_eq!(back.created, None);

        // Second entity reuses the edge discovered by the first.
        let f = graph.spawn().unwrap();
        let again = graph.entity_add_component(f, A).unwrap().unwrap();
        assert_eq!(again.to, t.to);
        assert_eq!(again.created, None);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn transitions_are_order_independent() {
        let mut graph = ArchetypeGraph::new(8);
        let x = graph.spawn().unwrap();
        let y = graph.spawn().unwrap();
        graph.entity_add_component(x, A).unwrap();
        graph.entity_add_component(x, B).unwrap();
        graph.entity_add_component(y, B).unwrap();
        graph.entity_add_component(y, A).unwrap();
        assert_eq!(graph.location(x), graph.location(y));
        assert_eq!(graph.find(&[A, B]), graph.location(x));
    }

    #[test]
    fn redundant_changes_are_no_ops() {
        let mut graph = ArchetypeGraph::new(4);
        let e = graph.spawn().unwrap();
        graph.entity_add_component(e, A).unwrap();
        assert_eq!(graph.entity_add_component(e, A).unwrap(), None);
        assert_eq!(graph.entity_remove_component(e, B).unwrap(), None);
    }

    #[test]
    fn dead_entities_are_rejected() {
        let mut graph = ArchetypeGraph::new(4);
        let e = graph.spawn().unwrap();
        assert!(graph.despawn(e));
        assert!(!graph.despawn(e));
        assert!(matches!(
            graph.entity_add_component(e, A),
            Err(EcsError::DeadEntity { .. })
        ));
        assert!(graph.archetype(DEFAULT_ARCHETYPE).unwrap().is_empty());
    }

    #[test]
    fn creation_is_queued_even_when_the_move_fails() {
        let mut graph = ArchetypeGraph::new(4);
        let e = graph.spawn().unwrap();
        graph.entity_add_component(e, A).unwrap();
        let with_a = graph.location(e).unwrap();
        assert_eq!(graph.take_created(), vec![with_a]);
        assert!(graph.take_created().is_empty());

        // New archetypes from here on get no room for members.
        graph.capacity = 0;
        assert!(matches!(
            graph.entity_add_component(e, B),
            Err(EcsError::CapacityExceeded { .. })
        ));
        assert_eq!(graph.location(e), Some(with_a));
        let created = graph.take_created();
        assert_eq!(created.len(), 1);
        assert_eq!(graph.archetype(created[0]).unwrap().components(), &[A, B]);
    }

    #[test]
    fn get_or_create_normalizes_sets() {
        let mut graph = ArchetypeGraph::new(4);
        let (id, created) = graph.get_or_create(&[B, A, B]);
        assert!(created);
        assert_eq!(graph.archetype(id).unwrap().components(), &[A, B]);
        assert_eq!(graph.get_or_create(&[A, B]), (id, false));
    }

    #[test]
    fn move_without_graph_records_no_edges() {
        let mut graph = ArchetypeGraph::new(4);
        let (target, _) = graph.get_or_create(&[A]);
        let e = graph.spawn().unwrap();
        graph.move_without_graph(e, DEFAULT_ARCHETYPE, target).unwrap();
        assert_eq!(graph.location(e), Some(target));
        assert_eq!(graph.archetype(DEFAULT_ARCHETYPE).unwrap().add_edge(A), None);
    }

    #[test]
    fn stamps_advance_on_membership_change() {
        let mut graph = ArchetypeGraph::new(4);
        let before = graph.archetype(DEFAULT_ARCHETYPE).unwrap().last_modified();
        let e = graph.spawn().unwrap();
        let after = graph.archetype(DEFAULT_ARCHETYPE).unwrap().last_modified();
        assert!(after > before);
        let t = graph.entity_add_component(e, A).unwrap().unwrap();
        assert!(graph.archetype(t.to).unwrap().last_modified() > after);
    }

    #[test]
    fn resize_preserves_membership() {
        let mut graph = ArchetypeGraph::new(2);
        let a = graph.spawn().unwrap();
        let b = graph.spawn().unwrap();
        graph.entity_add_component(b, A).unwrap();
        assert!(graph.spawn().is_err());

        graph.resize(4).unwrap();
        let c = graph.spawn().unwrap();
        assert_eq!(graph.location(a), Some(DEFAULT_ARCHETYPE));
        assert!(graph.has_component(b, A));
        assert_eq!(
            graph.archetype(DEFAULT_ARCHETYPE).unwrap().entities().to_vec(),
            vec![a, c]
        );
    }

    #[test]
    fn state_round_trip_shares_membership() {
        let mut graph = ArchetypeGraph::new(4);
        let e = graph.spawn().unwrap();
        let remote = ArchetypeGraph::from_state(graph.state());
        let t = graph.entity_add_component(e, A).unwrap().unwrap();

        let mut remote = remote;
        remote
            .apply_archetype(graph.archetype(t.to).unwrap().state())
            .unwrap();
        assert_eq!(remote.directory().location(e), Some(t.to));
        assert_eq!(remote.archetype(t.to).unwrap().entities().to_vec(), vec![e]);
    }
}

//! Query modifiers, compiled filters and the live query engine.
//!
//! A [`QueryModifier`] tree compiles into a [`QueryFilter`]: a `tester` that
//! decides from an archetype's component set alone, plus an optional
//! `narrower` for conditions that depend on other entities (relationships,
//! hierarchy). Registered queries keep the list of archetypes whose set passes
//! the tester; the list only grows, as new archetypes are offered to every
//! query on creation.
//!
//! Iteration walks each matching archetype's packed array from the last slot
//! to the first. That order makes it safe for the visitor to swap-remove the
//! entity it is looking at.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::archetype::{Archetype, ArchetypeGraph, ArchetypeId};
use crate::component::ComponentId;
use crate::entity::Entity;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentLookup
// ---------------------------------------------------------------------------

/// Read access to the component set of any entity, used by narrowers.
pub trait ComponentLookup {
    /// Sorted component ids of the entity's archetype.
    fn components_of(&self, entity: Entity) -> Option<&[ComponentId]>;

    fn has_component(&self, entity: Entity, component: ComponentId) -> bool {
        self.components_of(entity)
            .is_some_and(|set| set.binary_search(&component).is_ok())
    }
}

/// Anything that owns an archetype graph. Lets one iteration routine serve
/// both the primary world and executor-side replicas.
pub trait GraphAccess {
    fn graph(&self) -> &ArchetypeGraph;
}

impl GraphAccess for ArchetypeGraph {
    fn graph(&self) -> &ArchetypeGraph {
        self
    }
}

impl ComponentLookup for ArchetypeGraph {
    fn components_of(&self, entity: Entity) -> Option<&[ComponentId]> {
        let id = self.directory().location(entity)?;
        self.archetype(id).map(Archetype::components)
    }
}

// ---------------------------------------------------------------------------
// QueryModifier / QueryFilter
// ---------------------------------------------------------------------------

/// Decides from a component set alone.
pub type Tester = Arc<dyn Fn(&[ComponentId]) -> bool + Send + Sync>;

/// Per-entity refinement with access to other entities' component sets.
pub type Narrower = Arc<dyn Fn(&dyn ComponentLookup, Entity) -> bool + Send + Sync>;

/// Declarative query description.
#[derive(Clone)]
pub enum QueryModifier {
    /// Every listed component present.
    With(Vec<ComponentId>),
    /// No listed component present.
    Without(Vec<ComponentId>),
    Not(Box<QueryModifier>),
    /// Conjunction. Empty matches everything.
    All(Vec<QueryModifier>),
    /// Arbitrary test over the component set.
    Predicate(Tester),
    /// A modifier further restricted per entity.
    Narrowed(Box<QueryModifier>, Narrower),
}

impl QueryModifier {
    pub fn with(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        QueryModifier::With(ids.into_iter().collect())
    }

    pub fn without(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        QueryModifier::Without(ids.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: QueryModifier) -> Self {
        QueryModifier::Not(Box::new(inner))
    }

    pub fn all(modifiers: impl IntoIterator<Item = QueryModifier>) -> Self {
        QueryModifier::All(modifiers.into_iter().collect())
    }

    pub fn predicate(test: impl Fn(&[ComponentId]) -> bool + Send + Sync + 'static) -> Self {
        QueryModifier::Predicate(Arc::new(test))
    }

    pub fn narrowed(
        inner: QueryModifier,
        narrower: impl Fn(&dyn ComponentLookup, Entity) -> bool + Send + Sync + 'static,
    ) -> Self {
        QueryModifier::Narrowed(Box::new(inner), Arc::new(narrower))
    }

    /// Matches every archetype.
    pub fn any() -> Self {
        QueryModifier::All(Vec::new())
    }

    pub fn compile(&self) -> QueryFilter {
        match self {
            QueryModifier::With(ids) => {
                let ids = ids.clone();
                QueryFilter::from_tester(move |set: &[ComponentId]| {
                    ids.iter().all(|id| set.binary_search(id).is_ok())
                })
            }
            QueryModifier::Without(ids) => {
                let ids = ids.clone();
                QueryFilter::from_tester(move |set: &[ComponentId]| {
                    !ids.iter().any(|id| set.binary_search(id).is_ok())
                })
            }
            QueryModifier::Predicate(test) => QueryFilter {
                tester: Arc::clone(test),
                narrower: None,
            },
            QueryModifier::Narrowed(inner, narrower) => {
                let inner = inner.compile();
                let narrower = match inner.narrower {
                    Some(first) => {
                        let second = Arc::clone(narrower);
                        Arc::new(move |lookup: &dyn ComponentLookup, e: Entity| {
                            first(lookup, e) && second(lookup, e)
                        }) as Narrower
                    }
                    None => Arc::clone(narrower),
                };
                QueryFilter {
                    tester: inner.tester,
                    narrower: Some(narrower),
                }
            }
            QueryModifier::All(modifiers) => {
                let compiled: Vec<QueryFilter> = modifiers.iter().map(Self::compile).collect();
                let testers: Vec<Tester> = compiled.iter().map(|f| Arc::clone(&f.tester)).collect();
                let narrowers: Vec<Narrower> =
                    compiled.into_iter().filter_map(|f| f.narrower).collect();
                QueryFilter {
                    tester: Arc::new(move |set: &[ComponentId]| testers.iter().all(|t| t(set))),
                    narrower: (!narrowers.is_empty()).then(|| {
                        Arc::new(move |lookup: &dyn ComponentLookup, e: Entity| {
                            narrowers.iter().all(|n| n(lookup, e))
                        }) as Narrower
                    }),
                }
            }
            QueryModifier::Not(inner) => {
                let inner = inner.compile();
                match inner.narrower {
                    None => {
                        let tester = inner.tester;
                        QueryFilter::from_tester(move |set: &[ComponentId]| !tester(set))
                    }
                    // The negation depends on the entity, so every archetype
                    // passes and the whole inner test moves to the narrower.
                    Some(narrower) => {
                        let tester = inner.tester;
                        QueryFilter {
                            tester: Arc::new(|_: &[ComponentId]| true),
                            narrower: Some(Arc::new(move |lookup: &dyn ComponentLookup, e: Entity| {
                                let set = lookup.components_of(e).unwrap_or(&[]);
                                !(tester(set) && narrower(lookup, e))
                            }) as Narrower),
                        }
                    }
                }
            }
        }
    }
}

impl From<ComponentId> for QueryModifier {
    fn from(id: ComponentId) -> Self {
        QueryModifier::With(vec![id])
    }
}

impl fmt::Debug for QueryModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryModifier::With(ids) => f.debug_tuple("With").field(ids).finish(),
            QueryModifier::Without(ids) => f.debug_tuple("Without").field(ids).finish(),
            QueryModifier::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            QueryModifier::All(ms) => f.debug_tuple("All").field(ms).finish(),
            QueryModifier::Predicate(_) => f.write_str("Predicate(..)"),
            QueryModifier::Narrowed(inner, _) => {
                f.debug_tuple("Narrowed").field(inner).field(&"..").finish()
            }
        }
    }
}

/// Compiled form of a [`QueryModifier`].
#[derive(Clone)]
pub struct QueryFilter {
    tester: Tester,
    narrower: Option<Narrower>,
}

impl QueryFilter {
    fn from_tester(tester: impl Fn(&[ComponentId]) -> bool + Send + Sync + 'static) -> Self {
        Self {
            tester: Arc::new(tester),
            narrower: None,
        }
    }

    pub fn matches_archetype(&self, components: &[ComponentId]) -> bool {
        (self.tester)(components)
    }

    pub fn has_narrower(&self) -> bool {
        self.narrower.is_some()
    }

    /// Full test of one entity: archetype set, then narrower.
    pub fn matches_entity(&self, lookup: &dyn ComponentLookup, entity: Entity) -> bool {
        let Some(set) = lookup.components_of(entity) else {
            return false;
        };
        self.matches_archetype(set) && self.narrower.as_ref().map_or(true, |n| n(lookup, entity))
    }
}

impl fmt::Debug for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilter")
            .field("narrowed", &self.narrower.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stride
// ---------------------------------------------------------------------------

/// Which slots of each packed array a query visits: every `stride`-th slot
/// counting back from the last, skipping the first `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrideAssignment {
    pub stride: usize,
    pub offset: usize,
}

impl StrideAssignment {
    pub const FULL: Self = Self {
        stride: 1,
        offset: 0,
    };

    pub fn new(stride: usize, offset: usize) -> Result<Self, EcsError> {
        if stride == 0 || offset >= stride {
            return Err(EcsError::InvalidStride { stride, offset });
        }
        Ok(Self { stride, offset })
    }
}

impl Default for StrideAssignment {
    fn default() -> Self {
        Self::FULL
    }
}

// ---------------------------------------------------------------------------
// QueryEngine
// ---------------------------------------------------------------------------

/// Handle to a registered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub u32);

#[derive(Debug)]
struct QueryState {
    filter: QueryFilter,
    archetypes: Vec<ArchetypeId>,
    stride: StrideAssignment,
    /// Entities reported present by the last differential pass.
    present: HashMap<Entity, ArchetypeId>,
    /// Archetype stamp seen by the last differential pass.
    checked: HashMap<ArchetypeId, u64>,
    pending_added: Vec<Entity>,
    pending_removed: Vec<Entity>,
}

/// Snapshot of what an iteration pass needs, detached from the engine so
/// the visitor can mutate the world.
#[derive(Clone)]
pub struct IterationPlan {
    archetypes: Vec<ArchetypeId>,
    stride: StrideAssignment,
    narrower: Option<Narrower>,
}

impl IterationPlan {
    /// Visit matching entities with mutable access to `ctx`.
    ///
    /// The packed length is re-read after every visit, so removing the
    /// current entity (or any entity already visited) is safe. Entities
    /// added during the pass may or may not be visited.
    pub fn run<C, F>(&self, ctx: &mut C, mut visit: F) -> Result<(), EcsError>
    where
        C: GraphAccess,
        F: FnMut(&mut C, Entity) -> Result<(), EcsError>,
    {
        for &id in &self.archetypes {
            let Some(len) = ctx.graph().archetype(id).map(Archetype::len) else {
                continue;
            };
            let mut cursor = len.checked_sub(1 + self.stride.offset);
            while let Some(index) = cursor {
                let graph = ctx.graph();
                let entity = graph.archetype(id).and_then(|a| a.entities().get(index));
                if let Some(entity) = entity {
                    let lookup: &dyn ComponentLookup = graph;
                    let pass = self.narrower.as_ref().map_or(true, |n| n(lookup, entity));
                    if pass {
                        visit(ctx, entity)?;
                    }
                }
                cursor = index.checked_sub(self.stride.stride);
            }
        }
        Ok(())
    }

    /// Matching entities in visit order.
    pub fn collect(&self, graph: &ArchetypeGraph) -> Vec<Entity> {
        let mut out = Vec::new();
        for &id in &self.archetypes {
            let Some(archetype) = graph.archetype(id) else {
                continue;
            };
            let packed = archetype.entities();
            let mut cursor = packed.len().checked_sub(1 + self.stride.offset);
            while let Some(index) = cursor {
                if let Some(entity) = packed.get(index) {
                    if self.narrower.as_ref().map_or(true, |n| n(graph as &dyn ComponentLookup, entity)) {
                        out.push(entity);
                    }
                }
                cursor = index.checked_sub(self.stride.stride);
            }
        }
        out
    }
}

/// Owns every registered query and keeps them in sync with the graph.
#[derive(Debug, Default)]
pub struct QueryEngine {
    queries: Vec<QueryState>,
    /// Stride given to newly registered queries.
    default_stride: StrideAssignment,
}

impl QueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose queries start with `stride` (executor side).
    pub fn with_stride(stride: StrideAssignment) -> Self {
        Self {
            queries: Vec::new(),
            default_stride: stride,
        }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    fn state(&self, id: QueryId) -> Result<&QueryState, EcsError> {
        self.queries
            .get(id.0 as usize)
            .ok_or(EcsError::UnknownQuery(id.0))
    }

    fn state_mut(&mut self, id: QueryId) -> Result<&mut QueryState, EcsError> {
        self.queries
            .get_mut(id.0 as usize)
            .ok_or(EcsError::UnknownQuery(id.0))
    }

    /// Register a query and match it against every existing archetype.
    pub fn register(&mut self, modifier: &QueryModifier, graph: &ArchetypeGraph) -> QueryId {
        let filter = modifier.compile();
        let archetypes = graph
            .archetypes()
            .iter()
            .filter(|a| filter.matches_archetype(a.components()))
            .map(Archetype::id)
            .collect();
        let id = QueryId(self.queries.len() as u32);
        self.queries.push(QueryState {
            filter,
            archetypes,
            stride: self.default_stride,
            present: HashMap::new(),
            checked: HashMap::new(),
            pending_added: Vec::new(),
            pending_removed: Vec::new(),
        });
        id
    }

    /// Offer a freshly created archetype to every query.
    pub fn on_archetype_created(&mut self, archetype: &Archetype) {
        for query in &mut self.queries {
            if query.filter.matches_archetype(archetype.components())
                && !query.archetypes.contains(&archetype.id())
            {
                query.archetypes.push(archetype.id());
            }
        }
    }

    pub fn matching_archetypes(&self, id: QueryId) -> Result<&[ArchetypeId], EcsError> {
        Ok(&self.state(id)?.archetypes)
    }

    pub fn filter(&self, id: QueryId) -> Result<&QueryFilter, EcsError> {
        Ok(&self.state(id)?.filter)
    }

    pub fn stride(&self, id: QueryId) -> Result<StrideAssignment, EcsError> {
        Ok(self.state(id)?.stride)
    }

    pub fn set_stride(&mut self, id: QueryId, stride: usize, offset: usize) -> Result<(), EcsError> {
        let assignment = StrideAssignment::new(stride, offset)?;
        self.state_mut(id)?.stride = assignment;
        Ok(())
    }

    pub fn reset_stride(&mut self, id: QueryId) -> Result<(), EcsError> {
        self.state_mut(id)?.stride = StrideAssignment::FULL;
        Ok(())
    }

    pub fn plan(&self, id: QueryId) -> Result<IterationPlan, EcsError> {
        let state = self.state(id)?;
        Ok(IterationPlan {
            archetypes: state.archetypes.clone(),
            stride: state.stride,
            narrower: state.filter.narrower.clone(),
        })
    }

    /// Current matching entities, honoring stride.
    pub fn entities(&self, id: QueryId, graph: &ArchetypeGraph) -> Result<Vec<Entity>, EcsError> {
        Ok(self.plan(id)?.collect(graph))
    }

    /// Scan for entities that entered or left the query since the previous
    /// scan and queue them. Added and removed share one present set; an
    /// entity that leaves before its arrival was taken (or comes back before
    /// its departure was taken) cancels out instead of being queued twice.
    ///
    /// Archetypes whose stamp has not moved are skipped, unless the query has
    /// a narrower (relational state can change without any stamp moving).
    /// Differential scans ignore stride.
    pub fn refresh(&mut self, id: QueryId, graph: &ArchetypeGraph) -> Result<(), EcsError> {
        let state = self.state_mut(id)?;
        let rescan_all = state.filter.narrower.is_some();
        let mut rescanned: HashSet<ArchetypeId> = HashSet::new();
        let mut seen: HashSet<Entity> = HashSet::new();
        let mut entered = Vec::new();

        for &archetype_id in &state.archetypes {
            let Some(archetype) = graph.archetype(archetype_id) else {
                continue;
            };
            let stamp = archetype.last_modified();
            if !rescan_all && state.checked.get(&archetype_id) == Some(&stamp) {
                continue;
            }
            state.checked.insert(archetype_id, stamp);
            rescanned.insert(archetype_id);

            let packed = archetype.entities();
            for index in (0..packed.len()).rev() {
                let Some(entity) = packed.get(index) else {
                    continue;
                };
                if let Some(narrower) = &state.filter.narrower {
                    if !narrower(graph as &dyn ComponentLookup, entity) {
                        continue;
                    }
                }
                seen.insert(entity);
                if state.present.insert(entity, archetype_id).is_none() {
                    entered.push(entity);
                }
            }
        }

        // An entity that moved between two matching archetypes was re-seen
        // above and now sits under its new archetype, so it is not gone.
        let mut gone: Vec<Entity> = state
            .present
            .iter()
            .filter(|(e, a)| rescanned.contains(a) && !seen.contains(e))
            .map(|(e, _)| *e)
            .collect();
        gone.sort_unstable();

        for entity in entered {
            match state.pending_removed.iter().position(|e| *e == entity) {
                Some(i) => {
                    state.pending_removed.remove(i);
                }
                None => state.pending_added.push(entity),
            }
        }
        for entity in gone {
            state.present.remove(&entity);
            match state.pending_added.iter().position(|e| *e == entity) {
                Some(i) => {
                    state.pending_added.remove(i);
                }
                None => state.pending_removed.push(entity),
            }
        }
        Ok(())
    }

    /// Drain entities queued as added by [`refresh`](Self::refresh).
    pub fn take_added(&mut self, id: QueryId) -> Result<Vec<Entity>, EcsError> {
        Ok(std::mem::take(&mut self.state_mut(id)?.pending_added))
    }

    /// Drain entities queued as removed by [`refresh`](Self::refresh).
    pub fn take_removed(&mut self, id: QueryId) -> Result<Vec<Entity>, EcsError> {
        Ok(std::mem::take(&mut self.state_mut(id)?.pending_removed))
    }

    /// Evaluate a modifier once against the current graph, without
    /// registering it. Full stride.
    pub fn evaluate(modifier: &QueryModifier, graph: &ArchetypeGraph) -> Vec<Entity> {
        let filter = modifier.compile();
        let plan = IterationPlan {
            archetypes: graph
                .archetypes()
                .iter()
                .filter(|a| filter.matches_archetype(a.components()))
                .map(Archetype::id)
                .collect(),
            stride: StrideAssignment::FULL,
            narrower: filter.narrower,
        };
        plan.collect(graph)
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
    const C: ComponentId = ComponentId(12);

    fn setup_graph() -> (ArchetypeGraph, Vec<Entity>) {
        let mut graph = ArchetypeGraph::new(16);
        let mut entities = Vec::new();
        for sets in [&[A][..], &[A, B], &[B], &[A, C]] {
            let e = graph.spawn().unwrap();
            for &c in sets {
                graph.entity_add_component(e, c).unwrap();
            }
            entities.push(e);
        }
        (graph, entities)
    }

    fn sorted(mut v: Vec<Entity>) -> Vec<Entity> {
        v.sort();
        v
    }

    #[test]
    fn with_and_without() {
        let (graph, e) = setup_graph();
        let mut engine = QueryEngine::new();
        let q = engine.register(
            &QueryModifier::all([QueryModifier::with([A]), QueryModifier::without([B])]),
            &graph,
        );
        assert_eq!(sorted(engine.entities(q, &graph).unwrap()), vec![e[0], e[3]]);
    }

    #[test]
    fn empty_all_matches_every_archetype() {
        let (graph, _) = setup_graph();
        let filter = QueryModifier::any().compile();
        assert!(graph
            .archetypes()
            .iter()
            .all(|a| filter.matches_archetype(a.components())));
    }

    #[test]
    fn not_inverts_tester() {
        let (graph, e) = setup_graph();
        let mut engine = QueryEngine::new();
        let q = engine.register(
            &QueryModifier::all([
                QueryModifier::with([A]),
                QueryModifier::not(QueryModifier::with([C])),
            ]),
            &graph,
        );
        assert_eq!(sorted(engine.entities(q, &graph).unwrap()), vec![e[0], e[1]]);
    }

    #[test]
    fn not_over_narrowed_moves_test_to_narrower() {
        let (graph, e) = setup_graph();
        let target = e[2];
        let narrowed = QueryModifier::narrowed(QueryModifier::with([B]), move |_, entity| {
            entity == target
        });
        let filter = QueryModifier::not(narrowed).compile();
        assert!(filter.has_narrower());
        assert!(filter.matches_entity(&graph, e[1]));
        assert!(!filter.matches_entity(&graph, e[2]));
        assert!(filter.matches_entity(&graph, e[0]));
    }

    #[test]
    fn queries_pick_up_new_archetypes() {
        let (mut graph, _) = setup_graph();
        let mut engine = QueryEngine::new();
        let q = engine.register(&QueryModifier::with([C]), &graph);
        assert_eq!(engine.matching_archetypes(q).unwrap().len(), 1);

        let e = graph.spawn().unwrap();
        let t = graph.entity_add_component(e, C).unwrap().unwrap();
        let created = t.created.unwrap();
        engine.on_archetype_created(graph.archetype(created).unwrap());
        engine.on_archetype_created(graph.archetype(created).unwrap());
        assert_eq!(engine.matching_archetypes(q).unwrap().len(), 2);
        assert!(engine.entities(q, &graph).unwrap().contains(&e));
    }

    #[test]
    fn stride_validation() {
        let (graph, _) = setup_graph();
        let mut engine = QueryEngine::new();
        let q = engine.register(&QueryModifier::any(), &graph);
        assert!(matches!(
            engine.set_stride(q, 0, 0),
            Err(EcsError::InvalidStride { .. })
        ));
        assert!(engine.set_stride(q, 2, 2).is_err());
        engine.set_stride(q, 2, 1).unwrap();
        assert_eq!(engine.stride(q).unwrap(), StrideAssignment { stride: 2, offset: 1 });
        engine.reset_stride(q).unwrap();
        assert_eq!(engine.stride(q).unwrap(), StrideAssignment::FULL);
        assert!(matches!(
            engine.entities(QueryId(9), &graph),
            Err(EcsError::UnknownQuery(9))
        ));
    }

    #[test]
    fn iteration_walks_back_to_front() {
        let mut graph = ArchetypeGraph::new(8);
        let spawned: Vec<Entity> = (0..4).map(|_| graph.spawn().unwrap()).collect();
        let mut engine = QueryEngine::new();
        let q = engine.register(&QueryModifier::any(), &graph);
        let mut expected = spawned.clone();
        expected.reverse();
        assert_eq!(engine.entities(q, &graph).unwrap(), expected);
    }

    #[test]
    fn refresh_reports_each_change_once() {
        let (mut graph, e) = setup_graph();
        let mut engine = QueryEngine::new();
        let q = engine.register(&QueryModifier::with([B]), &graph);

        engine.refresh(q, &graph).unwrap();
        assert_eq!(sorted(engine.take_added(q).unwrap()), vec![e[1], e[2]]);
        assert!(engine.take_removed(q).unwrap().is_empty());

        engine.refresh(q, &graph).unwrap();
        assert!(engine.take_added(q).unwrap().is_empty());

        graph.entity_remove_component(e[1], B).unwrap();
        engine.refresh(q, &graph).unwrap();
        assert!(engine.take_added(q).unwrap().is_empty());
        assert_eq!(engine.take_removed(q).unwrap(), vec![e[1]]);
        assert!(engine.take_removed(q).unwrap().is_empty());
    }

    #[test]
    fn moving_between_matching_archetypes_is_not_a_change() {
        let (mut graph, e) = setup_graph();
        let mut engine = QueryEngine::new();
        let q = engine.register(&QueryModifier::with([A]), &graph);
        engine.refresh(q, &graph).unwrap();
        engine.take_added(q).unwrap();

        // e[0] moves from {A} to {A, B}, both already known to the query.
        graph.entity_add_component(e[0], B).unwrap();
        engine.refresh(q, &graph).unwrap();
        assert!(engine.take_added(q).unwrap().is_empty());
        assert!(engine.take_removed(q).unwrap().is_empty());
    }

    #[test]
    fn leave_and_return_between_takes_cancels_out() {
        let (mut graph, e) = setup_graph();
        let mut engine = QueryEngine::new();
        let q = engine.register(&QueryModifier::with([C]), &graph);
        engine.refresh(q, &graph).unwrap();
        assert_eq!(engine.take_added(q).unwrap(), vec![e[3]]);

        graph.entity_remove_component(e[3], C).unwrap();
        engine.refresh(q, &graph).unwrap();
        graph.entity_add_component(e[3], C).unwrap();
        engine.refresh(q, &graph).unwrap();
        assert!(engine.take_added(q).unwrap().is_empty());
        assert!(engine.take_removed(q).unwrap().is_empty());
    }

    #[test]
    fn evaluate_without_registering() {
        let (graph, e) = setup_graph();
        let found = QueryEngine::evaluate(&QueryModifier::with([A, C]), &graph);
        assert_eq!(found, vec![e[3]]);
    }
}

//! Entity-to-entity relationships packed into component ids.
//!
//! A relationship "entity has `kind` pointing at `target`" is an ordinary
//! component whose id is `kind << RELATIONSHIP_SHIFT | target`. Archetype
//! membership therefore encodes relationships for free, and queries can
//! filter on them with the same testers as any other component.
//!
//! Plain registry ids stay below `1 << RELATIONSHIP_SHIFT`, so their kind bits
//! are zero and they are never mistaken for relationships.

use crate::component::ComponentId;
use crate::entity::Entity;
use crate::query::{ComponentLookup, QueryModifier};
use crate::EcsError;

/// Bits reserved for the target entity.
pub const RELATIONSHIP_SHIFT: u32 = 20;

/// Largest entity id that can be a relationship target.
pub const MAX_RELATIONSHIP_TARGET: u32 = (1 << RELATIONSHIP_SHIFT) - 1;

/// Largest component id usable as a relationship kind.
pub const MAX_RELATIONSHIP_KIND: u32 = u32::MAX >> RELATIONSHIP_SHIFT;

/// Built-in kind: "has child `target`".
pub const CHILD: ComponentId = ComponentId(1);

/// Built-in kind: "has parent `target`".
pub const PARENT: ComponentId = ComponentId(2);

pub(crate) const CHILD_NAME: &str = "bagel.child";
pub(crate) const PARENT_NAME: &str = "bagel.parent";

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Component id of the relationship `(kind, target)`.
pub fn relationship(kind: ComponentId, target: Entity) -> Result<ComponentId, EcsError> {
    if kind.0 == 0 || kind.0 > MAX_RELATIONSHIP_KIND || target.index() > MAX_RELATIONSHIP_TARGET {
        return Err(EcsError::RelationshipOverflow {
            kind: kind.0,
            target: target.index(),
        });
    }
    Ok(ComponentId(kind.0 << RELATIONSHIP_SHIFT | target.index()))
}

/// Kind bits of `id`, if it encodes a relationship.
pub fn relationship_kind(id: ComponentId) -> Option<ComponentId> {
    let kind = id.0 >> RELATIONSHIP_SHIFT;
    (kind != 0).then_some(ComponentId(kind))
}

/// Target of `id`, if it encodes a relationship.
pub fn relationship_target(id: ComponentId) -> Option<Entity> {
    relationship_kind(id).map(|_| Entity::new(id.0 & MAX_RELATIONSHIP_TARGET))
}

pub fn is_relationship_of(id: ComponentId, kind: ComponentId) -> bool {
    kind.0 != 0 && id.0 >> RELATIONSHIP_SHIFT == kind.0
}

/// Every target of `kind` found in a component set.
pub fn related_all(components: &[ComponentId], kind: ComponentId) -> impl Iterator<Item = Entity> + '_ {
    components
        .iter()
        .filter(move |id| is_relationship_of(**id, kind))
        .filter_map(|id| relationship_target(*id))
}

/// First target of `kind` in a component set.
pub fn related_single(components: &[ComponentId], kind: ComponentId) -> Option<Entity> {
    related_all(components, kind).next()
}

// ---------------------------------------------------------------------------
// Query modifiers
// ---------------------------------------------------------------------------

/// Entities related by `kind` to exactly `target`.
pub fn with_relationship(kind: ComponentId, target: Entity) -> Result<QueryModifier, EcsError> {
    Ok(QueryModifier::with([relationship(kind, target)?]))
}

/// Entities with at least one relationship of `kind`, whatever the target.
pub fn with_any_relationship(kind: ComponentId) -> QueryModifier {
    QueryModifier::predicate(move |set| set.iter().any(|id| is_relationship_of(*id, kind)))
}

/// Entities that have a parent.
pub fn has_parent() -> QueryModifier {
    with_any_relationship(PARENT)
}

/// Direct children of `parent`.
pub fn child_of(parent: Entity) -> Result<QueryModifier, EcsError> {
    with_relationship(PARENT, parent)
}

/// Entities whose parent matches `requirement`. Nests, so
/// `parent_matching(parent_matching(m))` tests the grandparent.
pub fn parent_matching(requirement: QueryModifier) -> QueryModifier {
    let filter = requirement.compile();
    QueryModifier::narrowed(has_parent(), move |lookup: &dyn ComponentLookup, entity| {
        lookup
            .components_of(entity)
            .and_then(|set| related_single(set, PARENT))
            .is_some_and(|parent| filter.matches_entity(lookup, parent))
    })
}

/// Entities that have at least one child.
pub fn has_children() -> QueryModifier {
    with_any_relationship(CHILD)
}

/// The parent of `child`.
pub fn parent_of(child: Entity) -> Result<QueryModifier, EcsError> {
    with_relationship(CHILD, child)
}

/// Entities with at least one child matching `requirement`.
pub fn child_matching(requirement: QueryModifier) -> QueryModifier {
    let filter = requirement.compile();
    QueryModifier::narrowed(has_children(), move |lookup: &dyn ComponentLookup, entity| {
        let Some(set) = lookup.components_of(entity) else {
            return false;
        };
        related_all(set, CHILD).any(|child| filter.matches_entity(lookup, child))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::ArchetypeGraph;
    use crate::query::QueryEngine;

    const MARK: ComponentId = ComponentId(10);
    const LIKES: ComponentId = ComponentId(11);

    #[test]
    fn encode_and_decode() {
        let id = relationship(LIKES, Entity::new(42)).unwrap();
        assert_eq!(relationship_kind(id), Some(LIKES));
        assert_eq!(relationship_target(id), Some(Entity::new(42)));
        assert!(is_relationship_of(id, LIKES));
        assert!(!is_relationship_of(id, MARK));
        assert_eq!(relationship_kind(MARK), None);
    }

    #[test]
    fn overflow_is_loud() {
        assert!(matches!(
            relationship(LIKES, Entity::new(MAX_RELATIONSHIP_TARGET + 1)),
            Err(EcsError::RelationshipOverflow { .. })
        ));
        assert!(relationship(ComponentId(MAX_RELATIONSHIP_KIND + 1), Entity::new(0)).is_err());
        assert!(relationship(ComponentId(0), Entity::new(0)).is_err());
        assert!(relationship(ComponentId(MAX_RELATIONSHIP_KIND), Entity::new(MAX_RELATIONSHIP_TARGET)).is_ok());
    }

    fn link(graph: &mut ArchetypeGraph, parent: Entity, child: Entity) {
        graph
            .entity_add_component(parent, relationship(CHILD, child).unwrap())
            .unwrap();
        graph
            .entity_add_component(child, relationship(PARENT, parent).unwrap())
            .unwrap();
    }

    #[test]
    fn hierarchy_modifiers() {
        let mut graph = ArchetypeGraph::new(8);
        let root = graph.spawn().unwrap();
        let mid = graph.spawn().unwrap();
        let leaf = graph.spawn().unwrap();
        let loner = graph.spawn().unwrap();
        graph.entity_add_component(root, MARK).unwrap();
        link(&mut graph, root, mid);
        link(&mut graph, mid, leaf);

        let mut engine = QueryEngine::new();
        let mut run = |m: QueryModifier, graph: &ArchetypeGraph| {
            let q = engine.register(&m, graph);
            let mut v = engine.entities(q, graph).unwrap();
            v.sort();
            v
        };

        assert_eq!(run(has_parent(), &graph), vec![mid, leaf]);
        assert_eq!(run(has_children(), &graph), vec![root, mid]);
        assert_eq!(run(child_of(mid).unwrap(), &graph), vec![leaf]);
        assert_eq!(run(parent_of(mid).unwrap(), &graph), vec![root]);
        assert_eq!(run(parent_matching(QueryModifier::with([MARK])), &graph), vec![mid]);
        assert_eq!(
            run(parent_matching(parent_matching(QueryModifier::with([MARK]))), &graph),
            vec![leaf]
        );
        assert_eq!(run(child_matching(has_children()), &graph), vec![root]);
        assert_eq!(
            run(QueryModifier::not(has_parent()), &graph),
            vec![root, loner]
        );
    }

    #[test]
    fn related_helpers() {
        let set = [
            MARK,
            relationship(LIKES, Entity::new(3)).unwrap(),
            relationship(LIKES, Entity::new(5)).unwrap(),
        ];
        let all: Vec<Entity> = related_all(&set, LIKES).collect();
        assert_eq!(all, vec![Entity::new(3), Entity::new(5)]);
        assert_eq!(related_single(&set, LIKES), Some(Entity::new(3)));
        assert_eq!(related_single(&set, CHILD), None);
    }
}

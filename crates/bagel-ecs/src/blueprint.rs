//! Prefab entity layouts.
//!
//! A [`Blueprint`] is built by [`World::blueprint`](crate::world::World::blueprint)
//! and pins down an archetype plus default property values. Spawning from it
//! skips the per-component transition walk: defaults are written first, then
//! the entity is moved from the default archetype straight to the target.

use crate::archetype::ArchetypeId;
use crate::component::{ComponentId, PropertyWrite};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Blueprint {
    pub(crate) archetype: ArchetypeId,
    pub(crate) components: Vec<ComponentId>,
    pub(crate) defaults: Vec<PropertyWrite>,
}

impl Blueprint {
    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    /// Sorted membership ids.
    pub fn components(&self) -> &[ComponentId] {
        &self.components
    }

    pub fn defaults(&self) -> &[PropertyWrite] {
        &self.defaults
    }

    /// Default writes with `overrides` applied. An override for a property
    /// without a default is appended; its storage type is taken from
    /// `fallback` when it has to be created.
    pub(crate) fn writes_with(
        &self,
        overrides: impl IntoIterator<Item = (ComponentId, Value)>,
        fallback: impl Fn(ComponentId, &Value) -> crate::storage::StorageTypeId,
    ) -> Vec<PropertyWrite> {
        let mut writes = self.defaults.clone();
        for (property, value) in overrides {
            match writes.iter_mut().find(|w| w.property == property) {
                Some(write) => write.value = value,
                None => writes.push(PropertyWrite {
                    property,
                    storage_type: fallback(property, &value),
                    value,
                }),
            }
        }
        writes
    }
}

//! Component kind registration and property layout.
//!
//! Every component kind gets a [`ComponentId`] from the [`ComponentRegistry`].
//! A composite component (one with named scalar fields) additionally gets one
//! id per field: the composite id decides archetype membership, the property
//! ids key the column storages. Ids are handed out monotonically starting at
//! 1 and are never reused, which is what the packed relationship encoding
//! relies on.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::relationship::{CHILD, CHILD_NAME, PARENT, PARENT_NAME, RELATIONSHIP_SHIFT};
use crate::storage::StorageTypeId;
use crate::value::Value;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// First id the registry refuses to hand out. Larger ids carry relationship
/// kind bits.
pub const MAX_COMPONENT_ID: u32 = 1 << RELATIONSHIP_SHIFT;

/// Identifier of a component kind or of a single property of a composite.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub u32);

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentSpec / ComponentInstance
// ---------------------------------------------------------------------------

/// Layout of a registered composite component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Membership id used by archetypes and queries.
    pub id: ComponentId,
    pub name: String,
    pub property_names: Vec<String>,
    /// Storage key of each field, parallel to `property_names`.
    pub property_ids: Vec<ComponentId>,
    pub property_storage_types: Vec<StorageTypeId>,
}

impl ComponentSpec {
    /// Property id of the named field.
    pub fn property(&self, field: &str) -> Option<ComponentId> {
        self.property_names
            .iter()
            .position(|n| n == field)
            .map(|i| self.property_ids[i])
    }

    /// Build an instance from values given in field order.
    pub fn instance(
        &self,
        values: impl IntoIterator<Item = Value>,
    ) -> Result<ComponentInstance, EcsError> {
        let values: Vec<Value> = values.into_iter().collect();
        if values.len() != self.property_ids.len() {
            return Err(EcsError::ArityMismatch {
                component: self.name.clone(),
                expected: self.property_ids.len(),
                found: values.len(),
            });
        }
        Ok(ComponentInstance {
            spec: self.clone(),
            values,
        })
    }

    /// Build an instance from named fields. Unnamed fields are left null,
    /// which means "not written" when the instance is attached.
    pub fn instance_from<'a>(
        &self,
        fields: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<ComponentInstance, EcsError> {
        let mut values = vec![Value::Null; self.property_ids.len()];
        for (field, value) in fields {
            let index = self
                .property_names
                .iter()
                .position(|n| n == field)
                .ok_or_else(|| EcsError::UnknownComponent {
                    name: format!("{}.{}", self.name, field),
                })?;
            values[index] = value;
        }
        Ok(ComponentInstance {
            spec: self.clone(),
            values,
        })
    }
}

/// Values for every property of a composite component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentInstance {
    pub spec: ComponentSpec,
    pub values: Vec<Value>,
}

// ---------------------------------------------------------------------------
// ComponentArg
// ---------------------------------------------------------------------------

/// Anything that can be attached to an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentArg {
    /// Membership only, no data.
    Tag(ComponentId),
    /// A single value stored under the component's own id.
    Value(ComponentId, Value),
    /// A composite with one value per property.
    Instance(ComponentInstance),
}

/// One column write produced by resolving a [`ComponentArg`].
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyWrite {
    pub property: ComponentId,
    pub storage_type: StorageTypeId,
    pub value: Value,
}

impl ComponentArg {
    /// The membership id this argument adds to an archetype.
    pub fn id(&self) -> ComponentId {
        match self {
            ComponentArg::Tag(id) | ComponentArg::Value(id, _) => *id,
            ComponentArg::Instance(instance) => instance.spec.id,
        }
    }

    /// Column writes this argument implies. Null composite fields are kept
    /// so the caller still creates their storages.
    pub fn property_writes(&self, registry: &ComponentRegistry) -> Vec<PropertyWrite> {
        match self {
            ComponentArg::Tag(_) => Vec::new(),
            ComponentArg::Value(id, value) => vec![PropertyWrite {
                property: *id,
                storage_type: registry
                    .storage_type(*id)
                    .unwrap_or_else(|| StorageTypeId::infer(value)),
                value: value.clone(),
            }],
            ComponentArg::Instance(instance) => instance
                .spec
                .property_ids
                .iter()
                .zip(&instance.spec.property_storage_types)
                .zip(&instance.values)
                .map(|((&property, &storage_type), value)| PropertyWrite {
                    property,
                    storage_type,
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

impl From<ComponentId> for ComponentArg {
    fn from(id: ComponentId) -> Self {
        ComponentArg::Tag(id)
    }
}

impl From<ComponentInstance> for ComponentArg {
    fn from(instance: ComponentInstance) -> Self {
        ComponentArg::Instance(instance)
    }
}

impl<V: Into<Value>> From<(ComponentId, V)> for ComponentArg {
    fn from((id, value): (ComponentId, V)) -> Self {
        ComponentArg::Value(id, value.into())
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Name → id table plus the property layout of composite components.
///
/// Registering an already-known name returns the existing id. Composite
/// properties are keyed `"<component>.<field>"` in the id table, so an id map
/// loaded from another registry resolves them to the same ids.
#[derive(Debug, Clone)]
pub struct ComponentRegistry {
    ids: BTreeMap<String, ComponentId>,
    names: HashMap<ComponentId, String>,
    /// Composite name -> ordered field layout.
    composites: BTreeMap<String, Vec<(String, StorageTypeId)>>,
    /// Storage type of value components and composite properties, by key.
    value_types: HashMap<String, StorageTypeId>,
    next_id: u32,
}

impl ComponentRegistry {
    /// A registry holding only the built-in relationship kinds.
    pub fn new() -> Self {
        let mut registry = Self {
            ids: BTreeMap::new(),
            names: HashMap::new(),
            composites: BTreeMap::new(),
            value_types: HashMap::new(),
            next_id: 1,
        };
        registry.insert_reserved();
        registry
    }

    fn insert_reserved(&mut self) {
        for (name, id) in [(CHILD_NAME, CHILD), (PARENT_NAME, PARENT)] {
            if !self.ids.contains_key(name) {
                self.ids.insert(name.to_owned(), id);
                self.names.insert(id, name.to_owned());
            }
            self.next_id = self.next_id.max(id.0 + 1);
        }
    }

    fn allocate(&mut self, name: &str) -> Result<ComponentId, EcsError> {
        if let Some(&id) = self.ids.get(name) {
            return Ok(id);
        }
        // Ids at or above the limit would decode as relationship pairs.
        if self.next_id >= MAX_COMPONENT_ID {
            return Err(EcsError::RegistryExhausted {
                name: name.to_owned(),
                limit: MAX_COMPONENT_ID,
            });
        }
        let id = ComponentId(self.next_id);
        self.next_id += 1;
        self.ids.insert(name.to_owned(), id);
        self.names.insert(id, name.to_owned());
        Ok(id)
    }

    /// Register a tag-like or foreign component by name.
    pub fn register(&mut self, name: &str) -> Result<ComponentId, EcsError> {
        self.allocate(name)
    }

    /// Register a component keyed by a Rust type.
    pub fn register_type<T: 'static>(&mut self) -> Result<ComponentId, EcsError> {
        self.allocate(std::any::type_name::<T>())
    }

    /// Register a single-value component stored under its own id.
    pub fn register_value(
        &mut self,
        name: &str,
        storage_type: StorageTypeId,
    ) -> Result<ComponentId, EcsError> {
        let id = self.allocate(name)?;
        self.value_types.insert(name.to_owned(), storage_type);
        Ok(id)
    }

    /// Register a composite component with one property per field.
    pub fn register_composite(
        &mut self,
        name: &str,
        fields: &[(&str, StorageTypeId)],
    ) -> Result<ComponentSpec, EcsError> {
        let mut spec = ComponentSpec {
            id: self.allocate(name)?,
            name: name.to_owned(),
            property_names: Vec::with_capacity(fields.len()),
            property_ids: Vec::with_capacity(fields.len()),
            property_storage_types: Vec::with_capacity(fields.len()),
        };
        for (field, storage_type) in fields {
            let key = property_key(name, field);
            spec.property_names.push((*field).to_owned());
            spec.property_ids.push(self.allocate(&key)?);
            spec.property_storage_types.push(*storage_type);
            self.value_types.insert(key, *storage_type);
        }
        self.composites.insert(
            name.to_owned(),
            fields.iter().map(|(f, t)| ((*f).to_owned(), *t)).collect(),
        );
        Ok(spec)
    }

    fn build_spec(&self, name: &str) -> Option<ComponentSpec> {
        let fields = self.composites.get(name)?;
        let mut spec = ComponentSpec {
            id: *self.ids.get(name)?,
            name: name.to_owned(),
            property_names: Vec::with_capacity(fields.len()),
            property_ids: Vec::with_capacity(fields.len()),
            property_storage_types: Vec::with_capacity(fields.len()),
        };
        for (field, storage_type) in fields {
            spec.property_names.push(field.clone());
            spec.property_ids.push(*self.ids.get(&property_key(name, field))?);
            spec.property_storage_types.push(*storage_type);
        }
        Some(spec)
    }

    pub fn lookup(&self, name: &str) -> Option<ComponentId> {
        self.ids.get(name).copied()
    }

    pub fn lookup_type<T: 'static>(&self) -> Option<ComponentId> {
        self.lookup(std::any::type_name::<T>())
    }

    pub fn name(&self, id: ComponentId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Layout of the composite with membership id `id`.
    pub fn spec(&self, id: ComponentId) -> Option<ComponentSpec> {
        self.build_spec(self.name(id)?)
    }

    pub fn spec_by_name(&self, name: &str) -> Option<ComponentSpec> {
        self.build_spec(name)
    }

    /// Declared storage type of a value component or composite property.
    pub fn storage_type(&self, property: ComponentId) -> Option<StorageTypeId> {
        self.value_types.get(self.name(property)?).copied()
    }

    /// The full name → id table.
    pub fn id_map(&self) -> &BTreeMap<String, ComponentId> {
        &self.ids
    }

    /// Replace the id table wholesale. Later registrations continue after the
    /// largest loaded id, and composite fields missing from the map get fresh
    /// ids.
    pub fn load_id_map(&mut self, map: BTreeMap<String, ComponentId>) -> Result<(), EcsError> {
        self.next_id = map.values().map(|id| id.0 + 1).max().unwrap_or(1);
        self.names = map.iter().map(|(name, id)| (*id, name.clone())).collect();
        self.ids = map;
        self.insert_reserved();

        let keys: Vec<String> = self
            .composites
            .iter()
            .flat_map(|(name, fields)| {
                std::iter::once(name.clone())
                    .chain(fields.iter().map(move |(f, _)| property_key(name, f)))
            })
            .collect();
        for key in keys {
            self.allocate(&key)?;
        }
        Ok(())
    }

    /// Number of ids handed out (including reserved ones).
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn property_key(component: &str, field: &str) -> String {
    format!("{component}.{field}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

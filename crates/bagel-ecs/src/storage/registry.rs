//! Storage type table and the per-property storage set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::{
    AnyStorage, BoolStorage, ComponentStorage, EnumStorage, LoggedStorage, NullableStorage,
    NumericStorage, RangedStorage, StorageKind, StorageState, StorageTypeId,
};
use crate::component::ComponentId;
use crate::EcsError;

/// History depth of logged storages unless configured otherwise.
pub const DEFAULT_LOGGED_FRAMES: usize = 15;

/// Option count above which enum storages switch to a hash lookup.
pub const DEFAULT_ENUM_INDEX_THRESHOLD: usize = 20;

// ---------------------------------------------------------------------------
// StorageOptions
// ---------------------------------------------------------------------------

/// Configuration of a custom storage type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageOptions {
    /// Keep per-frame history for rollback. `depth: None` uses the world's
    /// configured depth.
    Logged {
        backing: StorageTypeId,
        #[serde(default)]
        depth: Option<usize>,
    },
    Enum { options: Vec<String> },
    Nullable { backing: StorageTypeId },
    Ranged { backing: StorageTypeId, capacity: usize },
}

impl StorageOptions {
    pub fn kind(&self) -> StorageKind {
        match self {
            StorageOptions::Logged { .. } => StorageKind::Logged,
            StorageOptions::Enum { .. } => StorageKind::Enum,
            StorageOptions::Nullable { .. } => StorageKind::Nullable,
            StorageOptions::Ranged { .. } => StorageKind::Ranged,
        }
    }

    fn backing(&self) -> Option<StorageTypeId> {
        match self {
            StorageOptions::Logged { backing, .. }
            | StorageOptions::Nullable { backing }
            | StorageOptions::Ranged { backing, .. } => Some(*backing),
            StorageOptions::Enum { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// StorageTypes
// ---------------------------------------------------------------------------

/// Built-in storage types plus registered custom configurations.
#[derive(Debug, Clone)]
pub struct StorageTypes {
    /// Indexed by `id - StorageTypeId::FIRST_CUSTOM`.
    custom: Vec<StorageOptions>,
    /// Serialized options -> id, so equal requests share one type.
    memo: HashMap<String, StorageTypeId>,
    logged_frames: usize,
    enum_index_threshold: usize,
}

impl StorageTypes {
    pub fn new(logged_frames: usize, enum_index_threshold: usize) -> Self {
        Self {
            custom: Vec::new(),
            memo: HashMap::new(),
            logged_frames,
            enum_index_threshold,
        }
    }

    /// Register a custom storage type, or return the id of an equal one.
    pub fn register(&mut self, options: StorageOptions) -> Result<StorageTypeId, EcsError> {
        let key = serde_json::to_string(&options)?;
        if let Some(&id) = self.memo.get(&key) {
            return Ok(id);
        }
        if let Some(backing) = options.backing() {
            self.kind(backing)?;
        }
        if let StorageOptions::Enum { options } = &options {
            if options.len() > 256 {
                return Err(EcsError::TooManyEnumOptions {
                    count: options.len(),
                });
            }
        }
        let id = StorageTypeId(StorageTypeId::FIRST_CUSTOM + self.custom.len() as u32);
        tracing::debug!(storage_type = ?id, kind = %options.kind(), "registered custom storage type");
        self.custom.push(options);
        self.memo.insert(key, id);
        Ok(id)
    }

    pub fn options(&self, id: StorageTypeId) -> Option<&StorageOptions> {
        let index = id.0.checked_sub(StorageTypeId::FIRST_CUSTOM)?;
        self.custom.get(index as usize)
    }

    pub fn kind(&self, id: StorageTypeId) -> Result<StorageKind, EcsError> {
        id.builtin_kind()
            .or_else(|| self.options(id).map(StorageOptions::kind))
            .ok_or(EcsError::UnknownStorageType { storage_type: id })
    }

    /// Registered custom configurations, in id order.
    pub fn custom(&self) -> &[StorageOptions] {
        &self.custom
    }

    /// Build an empty storage of type `id` with `capacity` rows.
    pub fn instantiate(
        &self,
        id: StorageTypeId,
        capacity: usize,
    ) -> Result<Box<dyn ComponentStorage>, EcsError> {
        if let Some(kind) = id.builtin_kind() {
            return Ok(match kind {
                StorageKind::F64 => Box::new(NumericStorage::<f64>::new(id, capacity)),
                StorageKind::F32 => Box::new(NumericStorage::<f32>::new(id, capacity)),
                StorageKind::I8 => Box::new(NumericStorage::<i8>::new(id, capacity)),
                StorageKind::I16 => Box::new(NumericStorage::<i16>::new(id, capacity)),
                StorageKind::I32 => Box::new(NumericStorage::<i32>::new(id, capacity)),
                StorageKind::U8 => Box::new(NumericStorage::<u8>::new(id, capacity)),
                StorageKind::U16 => Box::new(NumericStorage::<u16>::new(id, capacity)),
                StorageKind::U32 => Box::new(NumericStorage::<u32>::new(id, capacity)),
                StorageKind::Bool => Box::new(BoolStorage::new(id, capacity)),
                _ => Box::new(AnyStorage::new(id, capacity)),
            });
        }
        let options = self
            .options(id)
            .ok_or(EcsError::UnknownStorageType { storage_type: id })?;
        Ok(match options {
            StorageOptions::Logged { backing, depth } => Box::new(LoggedStorage::new(
                id,
                self.instantiate(*backing, capacity)?,
                depth.unwrap_or(self.logged_frames),
            )),
            StorageOptions::Enum { options } => Box::new(EnumStorage::new(
                id,
                options.clone(),
                capacity,
                self.enum_index_threshold,
            )?),
            StorageOptions::Nullable { backing } => {
                Box::new(NullableStorage::new(id, self.instantiate(*backing, capacity)?))
            }
            StorageOptions::Ranged {
                backing,
                capacity: ranged,
            } => Box::new(RangedStorage::new(id, self.instantiate(*backing, *ranged)?)),
        })
    }
}

impl Default for StorageTypes {
    fn default() -> Self {
        Self::new(DEFAULT_LOGGED_FRAMES, DEFAULT_ENUM_INDEX_THRESHOLD)
    }
}

// ---------------------------------------------------------------------------
// Storages
// ---------------------------------------------------------------------------

/// One lazily-created storage per property id.
///
/// Keyed by a map rather than a dense vector: relationship ids carrying data
/// sit far above the registry's id range.
#[derive(Debug, Default)]
pub struct Storages {
    columns: BTreeMap<ComponentId, Box<dyn ComponentStorage>>,
    capacity: usize,
}

impl Storages {
    pub fn new(capacity: usize) -> Self {
        Self {
            columns: BTreeMap::new(),
            capacity,
        }
    }

    /// Rebuild from exported states, sharing their buffers.
    pub fn from_states(capacity: usize, states: Vec<(ComponentId, StorageState)>) -> Self {
        Self {
            columns: states
                .into_iter()
                .map(|(property, state)| (property, state.restore()))
                .collect(),
            capacity,
        }
    }

    pub fn contains(&self, property: ComponentId) -> bool {
        self.columns.contains_key(&property)
    }

    /// The storage for `property`, created with `storage_type` if missing.
    /// Returns whether it was created.
    pub fn get_or_create(
        &mut self,
        property: ComponentId,
        storage_type: StorageTypeId,
        types: &StorageTypes,
    ) -> Result<(&mut dyn ComponentStorage, bool), EcsError> {
        let created = !self.contains(property);
        if created {
            let storage = types.instantiate(storage_type, self.capacity)?;
            tracing::debug!(
                property = ?property,
                storage_type = ?storage_type,
                "created column storage"
            );
            self.columns.insert(property, storage);
        }
        Ok((self.get_mut(property)?, created))
    }

    pub fn get(&self, property: ComponentId) -> Result<&dyn ComponentStorage, EcsError> {
        self.columns
            .get(&property)
            .map(|s| &**s)
            .ok_or(EcsError::UnknownStorage { property })
    }

    pub fn get_mut(&mut self, property: ComponentId) -> Result<&mut dyn ComponentStorage, EcsError> {
        match self.columns.get_mut(&property) {
            Some(storage) => Ok(&mut **storage),
            None => Err(EcsError::UnknownStorage { property }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentId, &dyn ComponentStorage)> + '_ {
        self.columns.iter().map(|(id, s)| (*id, &**s))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ComponentId, &mut Box<dyn ComponentStorage>)> + '_ {
        self.columns.iter_mut().map(|(id, s)| (*id, s))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        for (_, storage) in self.iter_mut() {
            storage.resize(capacity);
        }
    }

    pub fn advance_frame(&mut self) {
        for (_, storage) in self.iter_mut() {
            storage.advance_frame();
        }
    }

    /// Shared-handle export of every storage.
    pub fn states(&self) -> Vec<(ComponentId, StorageState)> {
        self.iter().map(|(id, s)| (id, s.state())).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::value::Value;

    #[test]
    fn custom_types_are_memoized_by_options() {
        let mut types = StorageTypes::default();
        let a = types
            .register(StorageOptions::Enum {
                options: vec!["a".into(), "b".into()],
            })
            .unwrap();
        let b = types
            .register(StorageOptions::Enum {
                options: vec!["a".into(), "b".into()],
            })
            .unwrap();
        let c = types
            .register(StorageOptions::Nullable {
                backing: StorageTypeId::F32,
            })
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, StorageTypeId(StorageTypeId::FIRST_CUSTOM));
        assert_ne!(a, c);
        assert_eq!(types.kind(c).unwrap(), StorageKind::Nullable);
    }

    #[test]
    fn unknown_backing_is_rejected() {
        let mut types = StorageTypes::default();
        assert!(matches!(
            types.register(StorageOptions::Nullable {
                backing: StorageTypeId(99)
            }),
            Err(EcsError::UnknownStorageType { .. })
        ));
    }

    #[test]
    fn nested_wrappers_instantiate() {
        let mut types = StorageTypes::new(4, 20);
        let nullable = types
            .register(StorageOptions::Nullable {
                backing: StorageTypeId::I16,
            })
            .unwrap();
        let logged = types
            .register(StorageOptions::Logged {
                backing: nullable,
                depth: None,
            })
            .unwrap();
        let mut storage = types.instantiate(logged, 8).unwrap();
        assert_eq!(storage.kind(), StorageKind::Logged);
        storage.set(Entity::new(1), Value::Null).unwrap();
        assert_eq!(storage.get(Entity::new(1)).unwrap(), Value::Null);
    }

    #[test]
    fn ranged_uses_its_own_capacity() {
        let mut types = StorageTypes::default();
        let ranged = types
            .register(StorageOptions::Ranged {
                backing: StorageTypeId::U8,
                capacity: 4,
            })
            .unwrap();
        let mut storages = Storages::new(1000);
        let (storage, created) = storages
            .get_or_create(ComponentId(5), ranged, &types)
            .unwrap();
        assert!(created);
        assert_eq!(storage.capacity(), 4);
        storages.resize(2000);
        assert_eq!(storages.get(ComponentId(5)).unwrap().capacity(), 4);
    }

    #[test]
    fn unknown_storage_is_an_error() {
        let storages = Storages::new(4);
        assert!(matches!(
            storages.get(ComponentId(3)),
            Err(EcsError::UnknownStorage { property: ComponentId(3) })
        ));
    }

    #[test]
    fn get_or_create_reuses_existing_storage() {
        let types = StorageTypes::default();
        let mut storages = Storages::new(4);
        let (_, created) = storages
            .get_or_create(ComponentId(7), StorageTypeId::F64, &types)
            .unwrap();
        assert!(created);
        let (storage, created) = storages
            .get_or_create(ComponentId(7), StorageTypeId::BOOL, &types)
            .unwrap();
        assert!(!created);
        assert_eq!(storage.kind(), StorageKind::F64);
        assert_eq!(storages.len(), 1);
        assert_eq!(storages.states().len(), 1);
    }
}

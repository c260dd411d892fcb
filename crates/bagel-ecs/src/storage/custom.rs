//! Wrapper columns that change how a backing column is addressed or encoded.

use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::{mismatch, ComponentStorage, StorageData, StorageKind, StorageState, StorageTypeId};
use crate::buffer::SharedBuffer;
use crate::entity::Entity;
use crate::value::Value;
use crate::EcsError;

// ---------------------------------------------------------------------------
// NullableStorage
// ---------------------------------------------------------------------------

/// Adds an explicit null to any backing column.
///
/// Null entities are tracked in a side set; the backing column keeps whatever
/// it held before. Deleting does not touch the null set.
#[derive(Debug)]
pub struct NullableStorage {
    storage_type: StorageTypeId,
    backing: Box<dyn ComponentStorage>,
    nulls: Arc<RwLock<HashSet<u32>>>,
}

impl NullableStorage {
    pub fn new(storage_type: StorageTypeId, backing: Box<dyn ComponentStorage>) -> Self {
        Self::from_parts(storage_type, backing, Arc::default())
    }

    pub(crate) fn from_parts(
        storage_type: StorageTypeId,
        backing: Box<dyn ComponentStorage>,
        nulls: Arc<RwLock<HashSet<u32>>>,
    ) -> Self {
        Self {
            storage_type,
            backing,
            nulls,
        }
    }

    pub fn is_null(&self, entity: Entity) -> bool {
        self.nulls.read().contains(&entity.index())
    }
}

impl ComponentStorage for NullableStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Nullable
    }

    fn storage_type(&self) -> StorageTypeId {
        self.storage_type
    }

    fn capacity(&self) -> usize {
        self.backing.capacity()
    }

    fn get(&self, entity: Entity) -> Result<Value, EcsError> {
        if self.is_null(entity) {
            return Ok(Value::Null);
        }
        self.backing.get(entity)
    }

    fn set(&mut self, entity: Entity, value: Value) -> Result<(), EcsError> {
        if value.is_null() {
            // Bounds are still the backing column's.
            self.backing.get(entity)?;
            self.nulls.write().insert(entity.index());
            return Ok(());
        }
        self.backing.set(entity, value)?;
        self.nulls.write().remove(&entity.index());
        Ok(())
    }

    fn delete(&mut self, entity: Entity) -> Result<(), EcsError> {
        self.backing.delete(entity)
    }

    fn resize(&mut self, capacity: usize) {
        self.backing.resize(capacity);
    }

    fn apply_numeric(&mut self, entity: Entity, op: &dyn Fn(f64) -> f64) -> Result<(), EcsError> {
        if self.is_null(entity) {
            return Err(mismatch(StorageKind::Nullable, &Value::Null));
        }
        self.backing.apply_numeric(entity, op)
    }

    fn advance_frame(&mut self) {
        self.backing.advance_frame();
    }

    fn rollback(&mut self, frames: usize, truncate: bool) -> Option<Result<Rollback, EcsError>> {
        self.backing.rollback(frames, truncate)
    }

    fn state(&self) -> StorageState {
        StorageState {
            storage_type: self.storage_type,
            data: StorageData::Nullable {
                backing: Box::new(self.backing.state()),
                nulls: Arc::clone(&self.nulls),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// EnumStorage
// ---------------------------------------------------------------------------

/// Stores one of a fixed list of string options as a one-byte index.
#[derive(Debug)]
pub struct EnumStorage {
    storage_type: StorageTypeId,
    indices: SharedBuffer<u8>,
    options: Arc<[String]>,
    /// Option -> index, built only for option lists above the threshold.
    lookup: Option<HashMap<String, u8>>,
    index_threshold: usize,
}

impl EnumStorage {
    pub fn new(
        storage_type: StorageTypeId,
        options: Vec<String>,
        capacity: usize,
        index_threshold: usize,
    ) -> Result<Self, EcsError> {
        if options.len() > 256 {
            return Err(EcsError::TooManyEnumOptions {
                count: options.len(),
            });
        }
        Ok(Self::from_parts(
            storage_type,
            SharedBuffer::new(capacity),
            options.into(),
            index_threshold,
        ))
    }

    pub(crate) fn from_parts(
        storage_type: StorageTypeId,
        indices: SharedBuffer<u8>,
        options: Arc<[String]>,
        index_threshold: usize,
    ) -> Self {
        let lookup = (options.len() > index_threshold).then(|| {
            options
                .iter()
                .enumerate()
                .map(|(i, o)| (o.clone(), i as u8))
                .collect()
        });
        Self {
            storage_type,
            indices,
            options,
            lookup,
            index_threshold,
        }
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    fn position(&self, option: &str) -> Option<u8> {
        match &self.lookup {
            Some(map) => map.get(option).copied(),
            None => self
                .options
                .iter()
                .position(|o| o == option)
                .map(|i| i as u8),
        }
    }
}

impl ComponentStorage for EnumStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Enum
    }

    fn storage_type(&self) -> StorageTypeId {
        self.storage_type
    }

    fn capacity(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, entity: Entity) -> Result<Value, EcsError> {
        let index = self
            .indices
            .get(entity.slot())
            .ok_or(EcsError::EntityOutOfBounds {
                entity,
                capacity: self.indices.len(),
            })?;
        Ok(self
            .options
            .get(index as usize)
            .map_or(Value::Null, |o| Value::Text(o.clone())))
    }

    fn set(&mut self, entity: Entity, value: Value) -> Result<(), EcsError> {
        let option = value
            .as_str()
            .ok_or_else(|| mismatch(StorageKind::Enum, &value))?;
        let index = self
            .position(option)
            .ok_or_else(|| EcsError::UnknownEnumOption {
                option: option.to_owned(),
                options: self.options.join(", "),
            })?;
        if self.indices.set(entity.slot(), index) {
            Ok(())
        } else {
            Err(EcsError::EntityOutOfBounds {
                entity,
                capacity: self.indices.len(),
            })
        }
    }

    fn delete(&mut self, _entity: Entity) -> Result<(), EcsError> {
        Ok(())
    }

    fn resize(&mut self, capacity: usize) {
        self.indices = self.indices.resized(capacity);
    }

    fn state(&self) -> StorageState {
        StorageState {
            storage_type: self.storage_type,
            data: StorageData::Enum {
                indices: self.indices.clone(),
                options: Arc::clone(&self.options),
                index_threshold: self.index_threshold,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// RangedStorage
// ---------------------------------------------------------------------------

/// Column for components that only a contiguous band of entity ids carries.
///
/// The first entity written becomes row 0 of a backing column sized to the
/// ranged capacity. The backing column never follows world resizes.
#[derive(Debug)]
pub struct RangedStorage {
    storage_type: StorageTypeId,
    backing: Box<dyn ComponentStorage>,
    first: Arc<AtomicCell<Option<u32>>>,
}

impl RangedStorage {
    pub fn new(storage_type: StorageTypeId, backing: Box<dyn ComponentStorage>) -> Self {
        Self::from_parts(storage_type, backing, Arc::new(AtomicCell::new(None)))
    }

    pub(crate) fn from_parts(
        storage_type: StorageTypeId,
        backing: Box<dyn ComponentStorage>,
        first: Arc<AtomicCell<Option<u32>>>,
    ) -> Self {
        Self {
            storage_type,
            backing,
            first,
        }
    }

    /// First entity id of the band, once anything has been written.
    pub fn first(&self) -> Option<Entity> {
        self.first.load().map(Entity::new)
    }

    /// Backing row for `entity`. `claim` anchors the band on first use.
    fn row(&self, entity: Entity, claim: bool) -> Result<Option<Entity>, EcsError> {
        let first = match self.first.load() {
            Some(first) => first,
            None if claim => {
                self.first.store(Some(entity.index()));
                entity.index()
            }
            None => return Ok(None),
        };
        let capacity = self.backing.capacity();
        match entity.index().checked_sub(first) {
            Some(row) if (row as usize) < capacity => Ok(Some(Entity::new(row))),
            _ => Err(EcsError::EntityOutOfBounds { entity, capacity }),
        }
    }
}

impl ComponentStorage for RangedStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Ranged
    }

    fn storage_type(&self) -> StorageTypeId {
        self.storage_type
    }

    fn capacity(&self) -> usize {
        self.backing.capacity()
    }

    fn get(&self, entity: Entity) -> Result<Value, EcsError> {
        match self.row(entity, false)? {
            Some(row) => self.backing.get(row),
            None => Ok(Value::Null),
        }
    }

    fn set(&mut self, entity: Entity, value: Value) -> Result<(), EcsError> {
        match self.row(entity, true)? {
            Some(row) => self.backing.set(row, value),
            None => Ok(()),
        }
    }

    fn delete(&mut self, entity: Entity) -> Result<(), EcsError> {
        match self.row(entity, false)? {
            Some(row) => self.backing.delete(row),
            None => Ok(()),
        }
    }

    fn resize(&mut self, _capacity: usize) {}

    fn apply_numeric(&mut self, entity: Entity, op: &dyn Fn(f64) -> f64) -> Result<(), EcsError> {
        match self.row(entity, false)? {
            Some(row) => self.backing.apply_numeric(row, op),
            None => Err(mismatch(StorageKind::Ranged, &Value::Null)),
        }
    }

    fn state(&self) -> StorageState {
        StorageState {
            storage_type: self.storage_type,
            data: StorageData::Ranged {
                backing: Box::new(self.backing.state()),
                first: Arc::clone(&self.first),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// LoggedStorage
// ---------------------------------------------------------------------------

/// Outcome of a [`LoggedStorage::rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollback {
    /// Frames the caller asked for.
    pub requested: usize,
    /// Frames actually rolled back after clamping to the history depth.
    pub frames: usize,
    pub clamped: bool,
    /// Number of entity values restored.
    pub restored: usize,
}

/// Keeps a ring of per-frame baselines so values can be rolled back.
///
/// Slot 0 of the ring is the current frame. The first write to an entity in
/// a frame records the value it had at frame start; later writes in the same
/// frame record nothing.
#[derive(Debug)]
pub struct LoggedStorage {
    storage_type: StorageTypeId,
    backing: Box<dyn ComponentStorage>,
    frames: VecDeque<Option<HashMap<Entity, Value>>>,
    depth: usize,
}

impl LoggedStorage {
    pub fn new(storage_type: StorageTypeId, backing: Box<dyn ComponentStorage>, depth: usize) -> Self {
        Self {
            storage_type,
            backing,
            frames: VecDeque::with_capacity(depth + 1),
            depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Frames currently held in the ring.
    pub fn history_len(&self) -> usize {
        self.frames.len()
    }

    fn record(&mut self, entity: Entity) -> Result<(), EcsError> {
        if self.frames.is_empty() {
            self.frames.push_front(None);
        }
        let recorded = self
            .frames
            .front()
            .and_then(Option::as_ref)
            .is_some_and(|frame| frame.contains_key(&entity));
        if recorded {
            return Ok(());
        }
        let baseline = self.backing.get(entity)?;
        if let Some(slot) = self.frames.front_mut() {
            slot.get_or_insert_with(HashMap::new).insert(entity, baseline);
        }
        Ok(())
    }

    /// Restore every value to what it was at the start of the frame `frames`
    /// frames ago. With `truncate`, the replayed history is discarded.
    pub fn rollback_frames(&mut self, frames: usize, truncate: bool) -> Result<Rollback, EcsError> {
        let clamped = frames > self.depth;
        if clamped {
            tracing::warn!(
                requested = frames,
                depth = self.depth,
                "rollback exceeds logged history depth, clamping"
            );
        }
        let n = frames.min(self.depth);
        let replay = (n + 1).min(self.frames.len());

        // Newest first, so the oldest baseline is the one left standing.
        let mut restored = 0;
        for slot in self.frames.iter().take(replay) {
            if let Some(frame) = slot {
                for (entity, value) in frame {
                    self.backing.set(*entity, value.clone())?;
                    restored += 1;
                }
            }
        }
        if truncate {
            self.frames.drain(..replay);
        }
        Ok(Rollback {
            requested: frames,
            frames: n,
            clamped,
            restored,
        })
    }
}

impl ComponentStorage for LoggedStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Logged
    }

    fn storage_type(&self) -> StorageTypeId {
        self.storage_type
    }

    fn capacity(&self) -> usize {
        self.backing.capacity()
    }

    fn get(&self, entity: Entity) -> Result<Value, EcsError> {
        self.backing.get(entity)
    }

    fn set(&mut self, entity: Entity, value: Value) -> Result<(), EcsError> {
        self.record(entity)?;
        self.backing.set(entity, value)
    }

    fn delete(&mut self, entity: Entity) -> Result<(), EcsError> {
        self.record(entity)?;
        self.backing.delete(entity)
    }

    fn resize(&mut self, capacity: usize) {
        self.backing.resize(capacity);
    }

    fn apply_numeric(&mut self, entity: Entity, op: &dyn Fn(f64) -> f64) -> Result<(), EcsError> {
        self.record(entity)?;
        self.backing.apply_numeric(entity, op)
    }

    fn advance_frame(&mut self) {
        self.frames.push_front(None);
        self.frames.truncate(self.depth.max(1));
        self.backing.advance_frame();
    }

    fn rollback(&mut self, frames: usize, truncate: bool) -> Option<Result<Rollback, EcsError>> {
        Some(self.rollback_frames(frames, truncate))
    }

    fn state(&self) -> StorageState {
        StorageState {
            storage_type: self.storage_type,
            data: StorageData::Logged {
                backing: Box::new(self.backing.state()),
                depth: self.depth,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AnyStorage, NumericStorage};

    fn f64_column(capacity: usize) -> Box<dyn ComponentStorage> {
        Box::new(NumericStorage::<f64>::new(StorageTypeId::F64, capacity))
    }

    #[test]
    fn nullable_tracks_nulls_separately() {
        let mut s = NullableStorage::new(StorageTypeId(10), f64_column(4));
        let e = Entity::new(2);
        s.set(e, Value::Number(5.0)).unwrap();
        s.set(e, Value::Null).unwrap();
        assert_eq!(s.get(e).unwrap(), Value::Null);

        // Delete keeps the null marker.
        s.delete(e).unwrap();
        assert!(s.is_null(e));

        s.set(e, Value::Number(1.0)).unwrap();
        assert_eq!(s.get(e).unwrap(), Value::Number(1.0));
        assert!(s.set(Entity::new(9), Value::Null).is_err());
        assert!(s.increment(Entity::new(0), 1.0).is_ok());
    }

    #[test]
    fn enum_round_trips_options() {
        let options = vec!["idle".to_owned(), "run".to_owned()];
        let mut s = EnumStorage::new(StorageTypeId(11), options, 4, 20).unwrap();
        let e = Entity::new(3);
        assert_eq!(s.get(e).unwrap(), Value::Text("idle".into()));
        s.set(e, Value::from("run")).unwrap();
        assert_eq!(s.get(e).unwrap(), Value::Text("run".into()));
        assert!(matches!(
            s.set(e, Value::from("fly")),
            Err(EcsError::UnknownEnumOption { .. })
        ));
    }

    #[test]
    fn enum_above_threshold_uses_map() {
        let options: Vec<String> = (0..30).map(|i| format!("o{i}")).collect();
        let mut s = EnumStorage::new(StorageTypeId(11), options, 2, 20).unwrap();
        assert!(s.lookup.is_some());
        s.set(Entity::new(1), Value::from("o29")).unwrap();
        assert_eq!(s.get(Entity::new(1)).unwrap(), Value::Text("o29".into()));
    }

    #[test]
    fn enum_rejects_too_many_options() {
        let options: Vec<String> = (0..257).map(|i| i.to_string()).collect();
        assert!(matches!(
            EnumStorage::new(StorageTypeId(11), options, 1, 20),
            Err(EcsError::TooManyEnumOptions { count: 257 })
        ));
    }

    #[test]
    fn ranged_anchors_on_first_write() {
        let mut s = RangedStorage::new(StorageTypeId(12), f64_column(3));
        assert_eq!(s.get(Entity::new(100)).unwrap(), Value::Null);

        s.set(Entity::new(100), Value::Number(1.0)).unwrap();
        s.set(Entity::new(102), Value::Number(3.0)).unwrap();
        assert_eq!(s.first(), Some(Entity::new(100)));
        assert_eq!(s.get(Entity::new(102)).unwrap(), Value::Number(3.0));

        assert!(matches!(
            s.get(Entity::new(99)),
            Err(EcsError::EntityOutOfBounds { capacity: 3, .. })
        ));
        assert!(s.set(Entity::new(103), Value::Number(0.0)).is_err());

        s.resize(1);
        assert_eq!(s.capacity(), 3);
    }

    #[test]
    fn logged_rollback_restores_frame_start() {
        let mut s = LoggedStorage::new(StorageTypeId(13), f64_column(2), 15);
        let e = Entity::new(0);
        s.set(e, Value::Number(10.0)).unwrap();
        s.advance_frame();
        s.set(e, Value::Number(20.0)).unwrap();
        s.advance_frame();
        s.set(e, Value::Number(30.0)).unwrap();

        let report = s.rollback_frames(1, false).unwrap();
        assert_eq!(s.get(e).unwrap(), Value::Number(10.0));
        assert_eq!(report.frames, 1);
        assert!(!report.clamped);
        assert_eq!(s.history_len(), 3);
    }

    #[test]
    fn logged_first_write_per_frame_wins() {
        let mut s = LoggedStorage::new(StorageTypeId(13), f64_column(1), 4);
        let e = Entity::new(0);
        s.set(e, Value::Number(1.0)).unwrap();
        s.advance_frame();
        s.set(e, Value::Number(2.0)).unwrap();
        s.increment(e, 5.0).unwrap();
        s.rollback_frames(0, true).unwrap();
        assert_eq!(s.get(e).unwrap(), Value::Number(1.0));
        assert_eq!(s.history_len(), 1);
    }

    #[test]
    fn logged_rollback_clamps_and_evicts() {
        let mut s = LoggedStorage::new(StorageTypeId(13), f64_column(1), 2);
        let e = Entity::new(0);
        for v in [1.0, 2.0, 3.0, 4.0] {
            s.set(e, Value::Number(v)).unwrap();
            s.advance_frame();
        }
        assert_eq!(s.history_len(), 2);

        let report = s.rollback_frames(10, true).unwrap();
        assert!(report.clamped);
        assert_eq!(report.frames, 2);
        // Only the baseline recorded before writing 4 survived eviction.
        assert_eq!(s.get(e).unwrap(), Value::Number(3.0));
        assert_eq!(s.history_len(), 0);
    }

    #[test]
    fn logged_over_any_column() {
        let backing = Box::new(AnyStorage::new(StorageTypeId::ANY, 1));
        let mut s = LoggedStorage::new(StorageTypeId(13), backing, 3);
        let e = Entity::new(0);
        s.set(e, Value::from("a")).unwrap();
        s.advance_frame();
        s.set(e, Value::from("b")).unwrap();
        s.rollback_frames(0, false).unwrap();
        assert_eq!(s.get(e).unwrap(), Value::from("a"));
    }
}

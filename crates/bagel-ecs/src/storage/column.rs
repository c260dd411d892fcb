//! Plain columns: fixed-width numeric, boolean, and free-form values.

use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;

use super::{mismatch, ComponentStorage, SharedValues, StorageData, StorageKind, StorageState, StorageTypeId};
use crate::buffer::SharedBuffer;
use crate::entity::Entity;
use crate::value::Value;
use crate::EcsError;

fn out_of_bounds(entity: Entity, capacity: usize) -> EcsError {
    EcsError::EntityOutOfBounds { entity, capacity }
}

// ---------------------------------------------------------------------------
// Scalar
// ---------------------------------------------------------------------------

/// Element type of a numeric column.
pub trait Scalar: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    const KIND: StorageKind;

    fn to_f64(self) -> f64;

    /// Convert back, wrapping integers to the column width.
    fn from_f64(value: f64) -> Self;

    fn into_data(buffer: SharedBuffer<Self>) -> StorageData;
}

macro_rules! impl_scalar_float {
    ($t:ty, $kind:ident) => {
        impl Scalar for $t {
            const KIND: StorageKind = StorageKind::$kind;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }

            fn into_data(buffer: SharedBuffer<Self>) -> StorageData {
                StorageData::$kind(buffer)
            }
        }
    };
}

macro_rules! impl_scalar_int {
    ($t:ty, $kind:ident) => {
        impl Scalar for $t {
            const KIND: StorageKind = StorageKind::$kind;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                (value as i64) as $t
            }

            fn into_data(buffer: SharedBuffer<Self>) -> StorageData {
                StorageData::$kind(buffer)
            }
        }
    };
}

impl_scalar_float!(f64, F64);
impl_scalar_float!(f32, F32);
impl_scalar_int!(i8, I8);
impl_scalar_int!(i16, I16);
impl_scalar_int!(i32, I32);
impl_scalar_int!(u8, U8);
impl_scalar_int!(u16, U16);
impl_scalar_int!(u32, U32);

// ---------------------------------------------------------------------------
// NumericStorage
// ---------------------------------------------------------------------------

/// Column of one numeric width.
#[derive(Debug)]
pub struct NumericStorage<T: Scalar> {
    storage_type: StorageTypeId,
    data: SharedBuffer<T>,
}

impl<T: Scalar> NumericStorage<T> {
    pub fn new(storage_type: StorageTypeId, capacity: usize) -> Self {
        Self::from_buffer(storage_type, SharedBuffer::new(capacity))
    }

    pub fn from_buffer(storage_type: StorageTypeId, data: SharedBuffer<T>) -> Self {
        Self { storage_type, data }
    }

    /// Typed read without going through [`Value`].
    #[inline]
    pub fn read(&self, entity: Entity) -> Option<T> {
        self.data.get(entity.slot())
    }

    pub fn buffer(&self) -> &SharedBuffer<T> {
        &self.data
    }
}

impl<T: Scalar> ComponentStorage for NumericStorage<T> {
    fn kind(&self) -> StorageKind {
        T::KIND
    }

    fn storage_type(&self) -> StorageTypeId {
        self.storage_type
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn get(&self, entity: Entity) -> Result<Value, EcsError> {
        self.read(entity)
            .map(|v| Value::Number(v.to_f64()))
            .ok_or_else(|| out_of_bounds(entity, self.data.len()))
    }

    fn set(&mut self, entity: Entity, value: Value) -> Result<(), EcsError> {
        let n = value.as_f64().ok_or_else(|| mismatch(T::KIND, &value))?;
        if self.data.set(entity.slot(), T::from_f64(n)) {
            Ok(())
        } else {
            Err(out_of_bounds(entity, self.data.len()))
        }
    }

    fn delete(&mut self, _entity: Entity) -> Result<(), EcsError> {
        Ok(())
    }

    fn resize(&mut self, capacity: usize) {
        self.data = self.data.resized(capacity);
    }

    fn apply_numeric(&mut self, entity: Entity, op: &dyn Fn(f64) -> f64) -> Result<(), EcsError> {
        let current = self
            .read(entity)
            .ok_or_else(|| out_of_bounds(entity, self.data.len()))?;
        self.data.set(entity.slot(), T::from_f64(op(current.to_f64())));
        Ok(())
    }

    fn state(&self) -> StorageState {
        StorageState {
            storage_type: self.storage_type,
            data: T::into_data(self.data.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// BoolStorage
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BoolStorage {
    storage_type: StorageTypeId,
    data: SharedBuffer<bool>,
}

impl BoolStorage {
    pub fn new(storage_type: StorageTypeId, capacity: usize) -> Self {
        Self::from_buffer(storage_type, SharedBuffer::new(capacity))
    }

    pub fn from_buffer(storage_type: StorageTypeId, data: SharedBuffer<bool>) -> Self {
        Self { storage_type, data }
    }
}

impl ComponentStorage for BoolStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Bool
    }

    fn storage_type(&self) -> StorageTypeId {
        self.storage_type
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn get(&self, entity: Entity) -> Result<Value, EcsError> {
        self.data
            .get(entity.slot())
            .map(Value::Bool)
            .ok_or_else(|| out_of_bounds(entity, self.data.len()))
    }

    fn set(&mut self, entity: Entity, value: Value) -> Result<(), EcsError> {
        let b = value
            .as_bool()
            .ok_or_else(|| mismatch(StorageKind::Bool, &value))?;
        if self.data.set(entity.slot(), b) {
            Ok(())
        } else {
            Err(out_of_bounds(entity, self.data.len()))
        }
    }

    fn delete(&mut self, _entity: Entity) -> Result<(), EcsError> {
        Ok(())
    }

    fn resize(&mut self, capacity: usize) {
        self.data = self.data.resized(capacity);
    }

    fn state(&self) -> StorageState {
        StorageState {
            storage_type: self.storage_type,
            data: StorageData::Bool(self.data.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// AnyStorage
// ---------------------------------------------------------------------------

/// Fallback column holding arbitrary values.
#[derive(Debug)]
pub struct AnyStorage {
    storage_type: StorageTypeId,
    values: SharedValues,
}

impl AnyStorage {
    pub fn new(storage_type: StorageTypeId, capacity: usize) -> Self {
        Self::from_shared(
            storage_type,
            Arc::new(RwLock::new(vec![Value::Null; capacity])),
        )
    }

    pub fn from_shared(storage_type: StorageTypeId, values: SharedValues) -> Self {
        Self {
            storage_type,
            values,
        }
    }
}

impl ComponentStorage for AnyStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Any
    }

    fn storage_type(&self) -> StorageTypeId {
        self.storage_type
    }

    fn capacity(&self) -> usize {
        self.values.read().len()
    }

    fn get(&self, entity: Entity) -> Result<Value, EcsError> {
        let values = self.values.read();
        values
            .get(entity.slot())
            .cloned()
            .ok_or_else(|| out_of_bounds(entity, values.len()))
    }

    fn set(&mut self, entity: Entity, value: Value) -> Result<(), EcsError> {
        let mut values = self.values.write();
        let capacity = values.len();
        let slot = values
            .get_mut(entity.slot())
            .ok_or_else(|| out_of_bounds(entity, capacity))?;
        *slot = value;
        Ok(())
    }

    fn delete(&mut self, entity: Entity) -> Result<(), EcsError> {
        if let Some(slot) = self.values.write().get_mut(entity.slot()) {
            *slot = Value::Null;
        }
        Ok(())
    }

    /// Resizes in place, so shared handles stay valid.
    fn resize(&mut self, capacity: usize) {
        self.values.write().resize(capacity, Value::Null);
    }

    fn state(&self) -> StorageState {
        StorageState {
            storage_type: self.storage_type,
            data: StorageData::Any(Arc::clone(&self.values)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_set_get_and_type_check() {
        let mut s = NumericStorage::<f32>::new(StorageTypeId::F32, 4);
        s.set(Entity::new(1), Value::Number(2.5)).unwrap();
        assert_eq!(s.get(Entity::new(1)).unwrap(), Value::Number(2.5));
        assert_eq!(s.get(Entity::new(0)).unwrap(), Value::Number(0.0));
        assert!(matches!(
            s.set(Entity::new(1), Value::Text("x".into())),
            Err(EcsError::TypeMismatch { kind: "f32", found: "text" })
        ));
        assert!(matches!(
            s.get(Entity::new(4)),
            Err(EcsError::EntityOutOfBounds { capacity: 4, .. })
        ));
    }

    #[test]
    fn integer_columns_wrap() {
        let mut s = NumericStorage::<u8>::new(StorageTypeId::U8, 2);
        let e = Entity::new(0);
        s.set(e, Value::Number(250.0)).unwrap();
        s.increment(e, 10.0).unwrap();
        assert_eq!(s.read(e), Some(4));

        let mut s = NumericStorage::<i8>::new(StorageTypeId::I8, 2);
        s.set(e, Value::Number(-7.9)).unwrap();
        assert_eq!(s.read(e), Some(-7));
    }

    #[test]
    fn multiply_and_truncated_modulo() {
        let mut s = NumericStorage::<f64>::new(StorageTypeId::F64, 1);
        let e = Entity::new(0);
        s.set(e, Value::Number(-7.0)).unwrap();
        s.modulo(e, 3.0).unwrap();
        assert_eq!(s.read(e), Some(-1.0));
        s.multiply(e, 4.0).unwrap();
        assert_eq!(s.read(e), Some(-4.0));
    }

    #[test]
    fn resize_preserves_values() {
        let mut s = NumericStorage::<i32>::new(StorageTypeId::I32, 2);
        s.set(Entity::new(1), Value::Number(42.0)).unwrap();
        s.resize(8);
        assert_eq!(s.capacity(), 8);
        assert_eq!(s.read(Entity::new(1)), Some(42));
    }

    #[test]
    fn bool_column() {
        let mut s = BoolStorage::new(StorageTypeId::BOOL, 2);
        s.set(Entity::new(1), Value::Bool(true)).unwrap();
        assert_eq!(s.get(Entity::new(1)).unwrap(), Value::Bool(true));
        assert!(s.set(Entity::new(1), Value::Number(1.0)).is_err());
        assert!(s.increment(Entity::new(1), 1.0).is_err());
    }

    #[test]
    fn any_column_shares_in_place_resize() {
        let mut s = AnyStorage::new(StorageTypeId::ANY, 1);
        let state = s.state();
        s.set(Entity::new(0), Value::Text("hi".into())).unwrap();
        s.resize(3);
        s.set(Entity::new(2), Value::Bool(false)).unwrap();

        let restored = state.restore();
        assert_eq!(restored.capacity(), 3);
        assert_eq!(restored.get(Entity::new(0)).unwrap(), Value::Text("hi".into()));

        s.delete(Entity::new(0)).unwrap();
        assert_eq!(restored.get(Entity::new(0)).unwrap(), Value::Null);
    }

    #[test]
    fn restored_numeric_shares_buffer() {
        let mut s = NumericStorage::<u16>::new(StorageTypeId::U16, 3);
        let mut remote = s.state().restore();
        remote.set(Entity::new(2), Value::Number(9.0)).unwrap();
        assert_eq!(s.read(Entity::new(2)), Some(9));
        s.increment(Entity::new(2), 1.0).unwrap();
        assert_eq!(remote.get(Entity::new(2)).unwrap(), Value::Number(10.0));
    }
}

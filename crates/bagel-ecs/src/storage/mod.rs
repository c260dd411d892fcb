//! Per-property column storage.
//!
//! Every property id owns one [`ComponentStorage`], a dense buffer indexed by
//! entity id. Plain columns ([`NumericStorage`], [`BoolStorage`],
//! [`AnyStorage`]) hold the data; wrapper columns ([`NullableStorage`],
//! [`EnumStorage`], [`RangedStorage`], [`LoggedStorage`]) own a backing column
//! and change how values are encoded or tracked.
//!
//! Storages can be exported to a [`StorageState`] that shares their buffers,
//! and rebuilt from one on another thread.

mod column;
mod custom;
mod registry;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;

use crate::buffer::SharedBuffer;
use crate::entity::Entity;
use crate::value::Value;
use crate::EcsError;

pub use column::{AnyStorage, BoolStorage, NumericStorage, Scalar};
pub use custom::{EnumStorage, LoggedStorage, NullableStorage, RangedStorage, Rollback};
pub use registry::{StorageOptions, StorageTypes, Storages, DEFAULT_ENUM_INDEX_THRESHOLD, DEFAULT_LOGGED_FRAMES};

// ---------------------------------------------------------------------------
// StorageKind / StorageTypeId
// ---------------------------------------------------------------------------

/// Underlying representation of a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    Any,
    F64,
    F32,
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
    Bool,
    Logged,
    Enum,
    Nullable,
    Ranged,
}

impl StorageKind {
    pub fn name(self) -> &'static str {
        match self {
            StorageKind::Any => "any",
            StorageKind::F64 => "f64",
            StorageKind::F32 => "f32",
            StorageKind::I8 => "i8",
            StorageKind::I16 => "i16",
            StorageKind::I32 => "i32",
            StorageKind::U8 => "u8",
            StorageKind::U16 => "u16",
            StorageKind::U32 => "u32",
            StorageKind::Bool => "bool",
            StorageKind::Logged => "logged",
            StorageKind::Enum => "enum",
            StorageKind::Nullable => "nullable",
            StorageKind::Ranged => "ranged",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifier of a storage type: a built-in kind or a registered custom
/// configuration (e.g. an enum with a particular option list).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageTypeId(pub u32);

impl StorageTypeId {
    pub const ANY: Self = Self(0);
    pub const F64: Self = Self(1);
    pub const F32: Self = Self(2);
    pub const I8: Self = Self(3);
    pub const I16: Self = Self(4);
    pub const I32: Self = Self(5);
    pub const U8: Self = Self(6);
    pub const U16: Self = Self(7);
    pub const U32: Self = Self(8);
    pub const BOOL: Self = Self(9);
    /// Alias for `F64`.
    pub const NUMBER: Self = Self::F64;
    /// Entity references are stored as `u32`.
    pub const ENTITY: Self = Self::U32;

    /// First id handed out to custom storage types.
    pub const FIRST_CUSTOM: u32 = 10;

    /// Kind of a built-in type id.
    pub fn builtin_kind(self) -> Option<StorageKind> {
        Some(match self.0 {
            0 => StorageKind::Any,
            1 => StorageKind::F64,
            2 => StorageKind::F32,
            3 => StorageKind::I8,
            4 => StorageKind::I16,
            5 => StorageKind::I32,
            6 => StorageKind::U8,
            7 => StorageKind::U16,
            8 => StorageKind::U32,
            9 => StorageKind::Bool,
            _ => return None,
        })
    }

    /// Storage type used when a value is written without a declared type.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Number(_) => Self::F64,
            Value::Bool(_) => Self::BOOL,
            _ => Self::ANY,
        }
    }
}

impl fmt::Debug for StorageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.builtin_kind() {
            Some(kind) => write!(f, "StorageTypeId({kind})"),
            None => write!(f, "StorageTypeId({})", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentStorage
// ---------------------------------------------------------------------------

/// A column of property values indexed by entity id.
pub trait ComponentStorage: fmt::Debug + Send + Sync {
    fn kind(&self) -> StorageKind;

    fn storage_type(&self) -> StorageTypeId;

    /// Number of addressable rows.
    fn capacity(&self) -> usize;

    fn get(&self, entity: Entity) -> Result<Value, EcsError>;

    fn set(&mut self, entity: Entity, value: Value) -> Result<(), EcsError>;

    /// Clear the entity's value where the representation allows it.
    /// Fixed-width columns keep their bytes.
    fn delete(&mut self, entity: Entity) -> Result<(), EcsError>;

    fn resize(&mut self, capacity: usize);

    /// Read-modify-write of a numeric value.
    fn apply_numeric(&mut self, entity: Entity, op: &dyn Fn(f64) -> f64) -> Result<(), EcsError> {
        let current = self.get(entity)?;
        let n = current.as_f64().ok_or(EcsError::TypeMismatch {
            kind: self.kind().name(),
            found: current.kind_name(),
        })?;
        self.set(entity, Value::Number(op(n)))
    }

    fn increment(&mut self, entity: Entity, amount: f64) -> Result<(), EcsError> {
        self.apply_numeric(entity, &|v| v + amount)
    }

    fn multiply(&mut self, entity: Entity, factor: f64) -> Result<(), EcsError> {
        self.apply_numeric(entity, &|v| v * factor)
    }

    /// Truncated remainder (sign follows the dividend).
    fn modulo(&mut self, entity: Entity, divisor: f64) -> Result<(), EcsError> {
        self.apply_numeric(entity, &|v| v % divisor)
    }

    /// Frame boundary hook. Only history-keeping storages react.
    fn advance_frame(&mut self) {}

    /// Restore values from recorded history. `None` if the storage keeps none.
    fn rollback(&mut self, _frames: usize, _truncate: bool) -> Option<Result<Rollback, EcsError>> {
        None
    }

    /// Export shared handles to this storage's buffers.
    fn state(&self) -> StorageState;
}

pub(crate) fn mismatch(kind: StorageKind, value: &Value) -> EcsError {
    EcsError::TypeMismatch {
        kind: kind.name(),
        found: value.kind_name(),
    }
}

// ---------------------------------------------------------------------------
// StorageState
// ---------------------------------------------------------------------------

/// Values of an `ANY` column, shared behind a lock.
pub type SharedValues = Arc<RwLock<Vec<Value>>>;

/// A storage's buffers and wrapper state, shareable across threads.
#[derive(Debug, Clone)]
pub struct StorageState {
    pub storage_type: StorageTypeId,
    pub data: StorageData,
}

/// Representation-specific payload of a [`StorageState`].
#[derive(Debug, Clone)]
pub enum StorageData {
    F64(SharedBuffer<f64>),
    F32(SharedBuffer<f32>),
    I8(SharedBuffer<i8>),
    I16(SharedBuffer<i16>),
    I32(SharedBuffer<i32>),
    U8(SharedBuffer<u8>),
    U16(SharedBuffer<u16>),
    U32(SharedBuffer<u32>),
    Bool(SharedBuffer<bool>),
    Any(SharedValues),
    Enum {
        indices: SharedBuffer<u8>,
        options: Arc<[String]>,
        index_threshold: usize,
    },
    Nullable {
        backing: Box<StorageState>,
        nulls: Arc<RwLock<HashSet<u32>>>,
    },
    Ranged {
        backing: Box<StorageState>,
        first: Arc<AtomicCell<Option<u32>>>,
    },
    Logged {
        backing: Box<StorageState>,
        depth: usize,
    },
}

impl StorageState {
    pub fn kind(&self) -> StorageKind {
        match &self.data {
            StorageData::F64(_) => StorageKind::F64,
            StorageData::F32(_) => StorageKind::F32,
            StorageData::I8(_) => StorageKind::I8,
            StorageData::I16(_) => StorageKind::I16,
            StorageData::I32(_) => StorageKind::I32,
            StorageData::U8(_) => StorageKind::U8,
            StorageData::U16(_) => StorageKind::U16,
            StorageData::U32(_) => StorageKind::U32,
            StorageData::Bool(_) => StorageKind::Bool,
            StorageData::Any(_) => StorageKind::Any,
            StorageData::Enum { .. } => StorageKind::Enum,
            StorageData::Nullable { .. } => StorageKind::Nullable,
            StorageData::Ranged { .. } => StorageKind::Ranged,
            StorageData::Logged { .. } => StorageKind::Logged,
        }
    }

    /// Rebuild a storage over the same buffers. Logged history is not part
    /// of the state, so a restored logged storage starts with an empty ring.
    pub fn restore(self) -> Box<dyn ComponentStorage> {
        let ty = self.storage_type;
        match self.data {
            StorageData::F64(b) => Box::new(NumericStorage::from_buffer(ty, b)),
            StorageData::F32(b) => Box::new(NumericStorage::from_buffer(ty, b)),
            StorageData::I8(b) => Box::new(NumericStorage::from_buffer(ty, b)),
            StorageData::I16(b) => Box::new(NumericStorage::from_buffer(ty, b)),
            StorageData::I32(b) => Box::new(NumericStorage::from_buffer(ty, b)),
            StorageData::U8(b) => Box::new(NumericStorage::from_buffer(ty, b)),
            StorageData::U16(b) => Box::new(NumericStorage::from_buffer(ty, b)),
            StorageData::U32(b) => Box::new(NumericStorage::from_buffer(ty, b)),
            StorageData::Bool(b) => Box::new(BoolStorage::from_buffer(ty, b)),
            StorageData::Any(values) => Box::new(AnyStorage::from_shared(ty, values)),
            StorageData::Enum {
                indices,
                options,
                index_threshold,
            } => Box::new(EnumStorage::from_parts(ty, indices, options, index_threshold)),
            StorageData::Nullable { backing, nulls } => {
                Box::new(NullableStorage::from_parts(ty, backing.restore(), nulls))
            }
            StorageData::Ranged { backing, first } => {
                Box::new(RangedStorage::from_parts(ty, backing.restore(), first))
            }
            StorageData::Logged { backing, depth } => {
                Box::new(LoggedStorage::new(ty, backing.restore(), depth))
            }
        }
    }
}

//! Component types, the archetype bitset, and the per-store type registry.
//!
//! Component types are plain-old-data: chunk compaction and command payloads
//! move them as raw bytes, so [`Component`] requires `Copy`. Each registered
//! type gets one bit in a fixed-width [`ComponentFlags`] bitset; an archetype
//! is identified by the bitset of its component set.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use crate::chunk::CHUNK_ALIGN;
use crate::StoreError;

/// Maximum number of distinct component types per store (one bit each).
pub const MAX_COMPONENT_TYPES: usize = 64;

/// Marker trait for data stored in chunk columns.
///
/// Blanket-implemented for every `Copy + Send + Sync + 'static` type. Data
/// with ownership semantics belongs behind an id or handle component.
pub trait Component: Copy + Send + Sync + 'static {}

impl<T: Copy + Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// ComponentFlag / ComponentFlags
// ---------------------------------------------------------------------------

/// The bit index assigned to one registered component type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentFlag(pub(crate) u8);

impl ComponentFlag {
    /// This flag as a one-bit set.
    #[inline]
    pub fn bit(self) -> ComponentFlags {
        ComponentFlags(1u64 << self.0)
    }

    /// The raw bit index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentFlag({})", self.0)
    }
}

/// A set of component types, one bit per registered type.
///
/// Identifies an archetype: two entities share an archetype exactly when
/// their flag sets are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComponentFlags(u64);

impl ComponentFlags {
    pub const EMPTY: ComponentFlags = ComponentFlags(0);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, flag: ComponentFlag) -> bool {
        self.0 & (1u64 << flag.0) != 0
    }

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub fn contains_all(self, other: ComponentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: ComponentFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, flag: ComponentFlag) {
        self.0 |= 1u64 << flag.0;
    }

    #[inline]
    pub fn remove(&mut self, flag: ComponentFlag) {
        self.0 &= !(1u64 << flag.0);
    }

    #[inline]
    pub fn union(self, other: ComponentFlags) -> ComponentFlags {
        ComponentFlags(self.0 | other.0)
    }

    #[inline]
    pub fn intersection(self, other: ComponentFlags) -> ComponentFlags {
        ComponentFlags(self.0 & other.0)
    }

    /// Bits of `self` not set in `other`.
    #[inline]
    pub fn difference(self, other: ComponentFlags) -> ComponentFlags {
        ComponentFlags(self.0 & !other.0)
    }

    /// Number of set bits.
    #[inline]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate set bits in ascending flag order.
    pub fn iter(self) -> impl Iterator<Item = ComponentFlag> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let idx = bits.trailing_zeros() as u8;
            bits &= bits - 1;
            Some(ComponentFlag(idx))
        })
    }
}

impl fmt::Debug for ComponentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentFlags({:#b})", self.0)
    }
}

impl FromIterator<ComponentFlag> for ComponentFlags {
    fn from_iter<I: IntoIterator<Item = ComponentFlag>>(iter: I) -> Self {
        let mut flags = ComponentFlags::EMPTY;
        for flag in iter {
            flags.insert(flag);
        }
        flags
    }
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// Metadata recorded for one registered component type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub flag: ComponentFlag,
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
    type_id: TypeId,
}

impl TypeInfo {
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

/// Store-scoped mapping from Rust types to component flags.
///
/// Owned by an `Entities` instance, never a process global: two stores can
/// assign the same type different bits, and resetting a store resets its
/// registry with it.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_type: HashMap<TypeId, ComponentFlag>,
    infos: Vec<TypeInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, or return its existing flag. Idempotent.
    ///
    /// Fails with [`StoreError::CompOverflow`] once all
    /// [`MAX_COMPONENT_TYPES`] bits are assigned, and with
    /// [`StoreError::AlignOverflow`] for types aligned beyond what chunk
    /// storage can guarantee.
    pub fn register<T: Component>(&mut self) -> Result<ComponentFlag, StoreError> {
        let type_id = TypeId::of::<T>();
        if let Some(&flag) = self.by_type.get(&type_id) {
            return Ok(flag);
        }
        let align = std::mem::align_of::<T>();
        if align > CHUNK_ALIGN {
            return Err(StoreError::AlignOverflow {
                align,
                max: CHUNK_ALIGN,
            });
        }
        if self.infos.len() >= MAX_COMPONENT_TYPES {
            return Err(StoreError::CompOverflow {
                max: MAX_COMPONENT_TYPES as u32,
            });
        }
        let flag = ComponentFlag(self.infos.len() as u8);
        self.infos.push(TypeInfo {
            flag,
            name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            align,
            type_id,
        });
        self.by_type.insert(type_id, flag);
        Ok(flag)
    }

    /// The flag assigned to `T`, if registered.
    pub fn flag_of<T: Component>(&self) -> Option<ComponentFlag> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// The flag assigned to a type id, if registered.
    pub(crate) fn flag_by_type_id(&self, type_id: TypeId) -> Option<ComponentFlag> {
        self.by_type.get(&type_id).copied()
    }

    /// Metadata for a registered flag.
    pub fn info(&self, flag: ComponentFlag) -> &TypeInfo {
        &self.infos[flag.index()]
    }

    /// All registered types in flag order.
    pub fn infos(&self) -> &[TypeInfo] {
        &self.infos
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Forget every registration. Flags handed out before the reset must not
    /// be used against the registry afterwards.
    pub fn reset(&mut self) {
        self.by_type.clear();
        self.infos.clear();
    }
}

// ---------------------------------------------------------------------------
// TypeKey
// ---------------------------------------------------------------------------

/// A deferred reference to a component type.
///
/// Captures a monomorphized register-or-lookup function at record time so a
/// command buffer can name `T` without access to any registry, and the
/// executor can resolve (registering if needed) when the buffer drains.
#[derive(Clone, Copy, Debug)]
pub struct TypeKey {
    type_id: TypeId,
    resolve: fn(&mut TypeRegistry) -> Result<ComponentFlag, StoreError>,
    size: usize,
}

impl TypeKey {
    pub fn of<T: Component>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            resolve: TypeRegistry::register::<T>,
            size: std::mem::size_of::<T>(),
        }
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Byte size of the named type.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Resolve to a flag, registering the type if it is new to `registry`.
    pub fn resolve(&self, registry: &mut TypeRegistry) -> Result<ComponentFlag, StoreError> {
        (self.resolve)(registry)
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for TypeKey {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! The aggregate entity store.
//!
//! [`Entities`] owns the handle table, type registry, chunk pool, archetype
//! registry, and the per-index location table, and exposes entity lifecycle
//! plus typed component access. Every structural mutation funnels through one
//! primitive, `change_archetype_raw`: compute the target bitset, write in
//! place when it is unchanged, otherwise append to the target archetype, copy
//! surviving columns, and swap-remove from the source with a location fix-up
//! for the entity that filled the vacated row.
//!
//! # Safety
//!
//! This module contains `unsafe` code for typed reads/writes through raw
//! column pointers. Soundness rests on the type registry: a column for flag
//! `F` only ever holds values of the Rust type registered to `F`, and
//! `Component` types are `Copy`, so byte copies never skip drops.

use std::ptr;

use crate::archetype::{ArchetypeId, ArchetypeRegistry};
use crate::chunk::ChunkPool;
use crate::component::{Component, ComponentFlag, ComponentFlags, TypeRegistry};
use crate::config::StoreConfig;
use crate::entity::{Entity, HandleTable};
use crate::StoreError;

/// Where a committed entity's row lives.
#[derive(Debug, Clone, Copy)]
struct EntityLocation {
    archetype: u32,
    chunk_slot: u32,
    row: u32,
}

const NO_LOCATION: EntityLocation = EntityLocation {
    archetype: u32::MAX,
    chunk_slot: u32::MAX,
    row: u32::MAX,
};

/// A type-erased component value to write during an archetype change.
#[derive(Clone, Copy)]
pub(crate) struct ComponentWrite {
    pub flag: ComponentFlag,
    pub ptr: *const u8,
    pub size: usize,
}

/// The entity/component store.
#[derive(Debug)]
pub struct Entities {
    config: StoreConfig,
    handles: HandleTable,
    types: TypeRegistry,
    pool: ChunkPool,
    archetypes: ArchetypeRegistry,
    /// Indexed by entity index; meaningful only while that index is committed.
    locations: Vec<EntityLocation>,
}

impl Entities {
    /// Build a store with its own empty type registry.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_registry(config, TypeRegistry::new())
    }

    /// Build a store around a pre-populated type registry.
    pub fn with_registry(config: StoreConfig, types: TypeRegistry) -> Self {
        let pool = ChunkPool::new(config.max_chunks, config.chunk_bytes);
        let archetypes = ArchetypeRegistry::new(config.max_archetypes);
        let handles = HandleTable::new(config.max_entities);
        Self {
            config,
            handles,
            types,
            pool,
            archetypes,
            locations: Vec::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub(crate) fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// Drop every entity, archetype, chunk, and type registration, returning
    /// the store to its freshly constructed state. Idempotent.
    pub fn reset(&mut self) {
        self.handles = HandleTable::new(self.config.max_entities);
        self.types.reset();
        self.pool = ChunkPool::new(self.config.max_chunks, self.config.chunk_bytes);
        self.archetypes = ArchetypeRegistry::new(self.config.max_archetypes);
        self.locations.clear();
    }

    // -- lifecycle ----------------------------------------------------------

    /// Hand out a reserved handle. The entity holds no components and no
    /// storage until committed.
    pub fn reserve(&mut self) -> Result<Entity, StoreError> {
        self.handles.reserve()
    }

    /// Reserve and immediately commit to the empty archetype.
    pub fn spawn(&mut self) -> Result<Entity, StoreError> {
        let entity = self.handles.reserve()?;
        self.change_archetype_raw(entity, &[], ComponentFlags::EMPTY)?;
        Ok(entity)
    }

    /// Commit a reserved entity to the empty archetype. No-op when already
    /// committed.
    pub fn commit(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.change_archetype_raw(entity, &[], ComponentFlags::EMPTY)
    }

    /// Destroy a handle, releasing its row if committed. Idempotent:
    /// returns `false` for handles that are already dead.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.handles.exists(entity) {
            return false;
        }
        if self.handles.committed(entity) {
            let loc = self.locations[entity.index() as usize];
            self.detach_row(loc);
            self.locations[entity.index() as usize] = NO_LOCATION;
        }
        self.handles.destroy(entity)
    }

    pub fn exists(&self, entity: Entity) -> bool {
        self.handles.exists(entity)
    }

    pub fn committed(&self, entity: Entity) -> bool {
        self.handles.committed(entity)
    }

    /// Number of committed entities.
    pub fn count(&self) -> u32 {
        self.handles.committed_count()
    }

    /// Number of live (reserved + committed) handles.
    pub fn live_count(&self) -> u32 {
        self.handles.live_count()
    }

    // -- components ---------------------------------------------------------

    /// Register `T` without touching any entity. Idempotent.
    pub fn register_component<T: Component>(&mut self) -> Result<ComponentFlag, StoreError> {
        self.types.register::<T>()
    }

    /// Add (or overwrite) one component, committing a reserved entity.
    ///
    /// When the entity already has `T` the value is written in place with no
    /// archetype transition.
    pub fn add<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), StoreError> {
        let flag = self.types.register::<T>()?;
        let write = ComponentWrite {
            flag,
            ptr: &value as *const T as *const u8,
            size: std::mem::size_of::<T>(),
        };
        self.change_archetype_raw(entity, std::slice::from_ref(&write), ComponentFlags::EMPTY)
    }

    /// Remove one component. Removing an absent (or never registered)
    /// component is a no-op.
    pub fn remove<T: Component>(&mut self, entity: Entity) -> Result<(), StoreError> {
        let Some(flag) = self.types.flag_of::<T>() else {
            return if self.handles.exists(entity) {
                Ok(())
            } else {
                Err(StoreError::DeadEntity(entity))
            };
        };
        self.change_archetype_raw(entity, &[], flag.bit())
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.component_ptr_of::<T>(entity).is_some()
    }

    /// Read one component value.
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let ptr = self.component_ptr_of::<T>(entity)?;
        // Safety: the column for T's flag stores T values; the row is live
        // and aligned per the chunk layout.
        Some(unsafe { &*(ptr as *const T) })
    }

    /// Mutate one component value in place.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let ptr = self.component_ptr_of::<T>(entity)?;
        // Safety: as `get`, plus &mut self gives exclusive access.
        Some(unsafe { &mut *(ptr as *mut T) })
    }

    /// The entity's current component set (empty for reserved entities).
    pub fn flags_of(&self, entity: Entity) -> ComponentFlags {
        if !self.handles.committed(entity) {
            return ComponentFlags::EMPTY;
        }
        let loc = self.locations[entity.index() as usize];
        self.archetypes
            .archetype(ArchetypeId(loc.archetype))
            .flags()
    }

    // -- structural primitive ----------------------------------------------

    /// Move `entity` to the archetype `(current | adds) \ remove`, writing
    /// the supplied component values.
    ///
    /// Commits a reserved entity. When the bitset is unchanged the values are
    /// written in place. On error nothing has been mutated: the target row is
    /// acquired before the source row is touched.
    pub(crate) fn change_archetype_raw(
        &mut self,
        entity: Entity,
        adds: &[ComponentWrite],
        remove: ComponentFlags,
    ) -> Result<(), StoreError> {
        if !self.handles.exists(entity) {
            return Err(StoreError::DeadEntity(entity));
        }
        let was_committed = self.handles.committed(entity);
        let current = if was_committed {
            let loc = self.locations[entity.index() as usize];
            self.archetypes
                .archetype(ArchetypeId(loc.archetype))
                .flags()
        } else {
            ComponentFlags::EMPTY
        };
        let add_flags: ComponentFlags = adds.iter().map(|w| w.flag).collect();
        let target = current.union(add_flags).difference(remove);

        if was_committed && target == current {
            let loc = self.locations[entity.index() as usize];
            let arch = self.archetypes.archetype(ArchetypeId(loc.archetype));
            for write in adds {
                if !target.contains(write.flag) {
                    continue; // added and removed in the same change
                }
                let dst = arch
                    .component_ptr(&self.pool, loc.chunk_slot, loc.row, write.flag)
                    .expect("target flag present in unchanged archetype");
                // Safety: dst is the live row's column slot for this flag;
                // src supplies exactly `size` bytes of the registered type.
                unsafe { ptr::copy_nonoverlapping(write.ptr, dst, write.size) };
            }
            return Ok(());
        }

        let target_id =
            self.archetypes
                .get_or_create(target, &self.types, self.config.chunk_bytes)?;
        let (new_slot, new_row) = self
            .archetypes
            .archetype_mut(target_id)
            .push_row(&mut self.pool, entity.index())?;

        if was_committed {
            let loc = self.locations[entity.index() as usize];
            let survivors = current.intersection(target);
            for flag in survivors.iter() {
                let src_arch = self.archetypes.archetype(ArchetypeId(loc.archetype));
                let dst_arch = self.archetypes.archetype(target_id);
                let src = src_arch
                    .component_ptr(&self.pool, loc.chunk_slot, loc.row, flag)
                    .expect("surviving flag present in source");
                let dst = dst_arch
                    .component_ptr(&self.pool, new_slot, new_row, flag)
                    .expect("surviving flag present in target");
                let size = self.types.info(flag).size;
                // Safety: both pointers address this flag's column slot at a
                // live row; source and target rows are in different chunks.
                unsafe { ptr::copy_nonoverlapping(src, dst, size) };
            }
        }
        for write in adds {
            if !target.contains(write.flag) {
                continue; // added and removed in the same change
            }
            let dst = self
                .archetypes
                .archetype(target_id)
                .component_ptr(&self.pool, new_slot, new_row, write.flag)
                .expect("added flag present in target");
            // Safety: as the in-place branch.
            unsafe { ptr::copy_nonoverlapping(write.ptr, dst, write.size) };
        }

        let old_loc = was_committed.then(|| self.locations[entity.index() as usize]);
        self.ensure_location_slot(entity.index());
        self.locations[entity.index() as usize] = EntityLocation {
            archetype: target_id.0,
            chunk_slot: new_slot,
            row: new_row,
        };
        if let Some(loc) = old_loc {
            self.detach_row(loc);
        }
        self.handles.mark_committed(entity)?;
        Ok(())
    }

    fn detach_row(&mut self, loc: EntityLocation) {
        let arch = self.archetypes.archetype_mut(ArchetypeId(loc.archetype));
        if let Some(moved) = arch.swap_remove_row(&mut self.pool, loc.chunk_slot, loc.row) {
            let moved_loc = &mut self.locations[moved as usize];
            debug_assert_eq!(moved_loc.chunk_slot, loc.chunk_slot);
            moved_loc.row = loc.row;
        }
    }

    fn ensure_location_slot(&mut self, index: u32) {
        if self.locations.len() <= index as usize {
            self.locations.resize(index as usize + 1, NO_LOCATION);
        }
    }

    fn component_ptr_of<T: Component>(&self, entity: Entity) -> Option<*mut u8> {
        if !self.handles.committed(entity) {
            return None;
        }
        let flag = self.types.flag_of::<T>()?;
        let loc = self.locations[entity.index() as usize];
        self.archetypes
            .archetype(ArchetypeId(loc.archetype))
            .component_ptr(&self.pool, loc.chunk_slot, loc.row, flag)
    }

    // -- internals shared with query/exec/pool ------------------------------

    pub(crate) fn arch_registry(&self) -> &ArchetypeRegistry {
        &self.archetypes
    }

    pub(crate) fn chunk_pool(&self) -> &ChunkPool {
        &self.pool
    }

    pub(crate) fn handle_for_index(&self, index: u32) -> Entity {
        self.handles.handle_at(index)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

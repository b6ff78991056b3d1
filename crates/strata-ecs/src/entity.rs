//! Entity handles and the generational slot table.
//!
//! An [`Entity`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. The generation is bumped
//! every time an index is recycled, which allows immediate stale-handle
//! detection. The [`HandleTable`] adds a fixed capacity, a reserved/committed
//! distinction, and permanent retirement of slots whose generation counter
//! would otherwise wrap.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::StoreError;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity(u64);

/// Generation value reserved as the "no entity" sentinel. A slot whose
/// generation would reach this value on destroy is retired instead of reused.
pub const INVALID_GENERATION: u32 = u32::MAX;

impl Entity {
    /// The "no entity" sentinel. Never refers to a live slot.
    pub const NONE: Entity = Entity::new(u32::MAX, INVALID_GENERATION);

    /// Construct an `Entity` from an index and generation.
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether this handle is the [`Entity::NONE`] sentinel.
    #[inline]
    pub fn is_none(self) -> bool {
        self.generation() == INVALID_GENERATION
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Entity(none)")
        } else {
            write!(f, "Entity({}v{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// HandleTable
// ---------------------------------------------------------------------------

/// Lifecycle state of one index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// On the free list, available for reuse.
    Free,
    /// Handed out by `reserve`, not yet holding an archetype.
    Reserved,
    /// Holding an archetype (possibly the empty one).
    Committed,
    /// Generation counter exhausted. Never handed out again.
    Saturated,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    state: SlotState,
}

/// Generational slot map with a fixed entity capacity.
///
/// Free indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index. A slot whose generation
/// increment would reach [`INVALID_GENERATION`] is marked [`SlotState::Saturated`]
/// and permanently retired, trading capacity for the guarantee that two live
/// handles never alias.
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    max_entities: u32,
    /// Reserved + committed slots.
    live: u32,
    /// Committed slots only.
    committed: u32,
    saturated: u32,
}

impl HandleTable {
    /// Create a table that will hand out at most `max_entities` simultaneous
    /// handles. Slots are materialized lazily as indices are first used.
    pub fn new(max_entities: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            max_entities,
            live: 0,
            committed: 0,
            saturated: 0,
        }
    }

    /// Hand out a fresh handle in the `Reserved` state.
    ///
    /// Pops the free list if possible, otherwise extends the slot vector up
    /// to the configured maximum.
    pub fn reserve(&mut self) -> Result<Entity, StoreError> {
        if let Some(index) = self.free.pop_front() {
            let slot = &mut self.slots[index as usize];
            debug_assert_eq!(slot.state, SlotState::Free);
            slot.state = SlotState::Reserved;
            self.live += 1;
            return Ok(Entity::new(index, slot.generation));
        }
        if self.slots.len() as u32 >= self.max_entities {
            return Err(StoreError::EntityOverflow {
                max: self.max_entities,
            });
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            state: SlotState::Reserved,
        });
        self.live += 1;
        Ok(Entity::new(index, 0))
    }

    /// Return a handle to the free list, bumping the slot's generation so any
    /// outstanding copies become stale.
    ///
    /// Returns `false` if the handle was already dead (idempotent, not an
    /// error). When the generation increment would reach the invalid sentinel
    /// the slot is retired permanently instead of recycled.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        // Index the field directly so the slot borrow stays disjoint from
        // the counters and the free list.
        let Some(slot) = self.slots.get_mut(entity.index() as usize) else {
            return false;
        };
        let live = matches!(slot.state, SlotState::Reserved | SlotState::Committed);
        if !live || slot.generation != entity.generation() {
            return false;
        }
        let was_committed = slot.state == SlotState::Committed;
        slot.generation += 1;
        self.live -= 1;
        if was_committed {
            self.committed -= 1;
        }
        if slot.generation == INVALID_GENERATION {
            slot.state = SlotState::Saturated;
            self.saturated += 1;
        } else {
            slot.state = SlotState::Free;
            self.free.push_back(entity.index());
        }
        true
    }

    /// Whether `entity` refers to a live (reserved or committed) slot.
    pub fn exists(&self, entity: Entity) -> bool {
        self.slot(entity).is_some()
    }

    /// Whether `entity` is live and has been committed to an archetype.
    pub fn committed(&self, entity: Entity) -> bool {
        matches!(self.slot(entity), Some(s) if s.state == SlotState::Committed)
    }

    /// Transition a reserved slot to committed. Committing an already
    /// committed entity is a no-op.
    pub fn mark_committed(&mut self, entity: Entity) -> Result<(), StoreError> {
        let Some(slot) = self.slots.get_mut(entity.index() as usize) else {
            return Err(StoreError::DeadEntity(entity));
        };
        let live = matches!(slot.state, SlotState::Reserved | SlotState::Committed);
        if !live || slot.generation != entity.generation() {
            return Err(StoreError::DeadEntity(entity));
        }
        if slot.state == SlotState::Reserved {
            slot.state = SlotState::Committed;
            self.committed += 1;
        }
        Ok(())
    }

    /// The current full handle for a known-live slot index.
    ///
    /// Used by iteration, which stores bare indices in chunk columns.
    pub(crate) fn handle_at(&self, index: u32) -> Entity {
        let slot = &self.slots[index as usize];
        debug_assert!(matches!(
            slot.state,
            SlotState::Reserved | SlotState::Committed
        ));
        Entity::new(index, slot.generation)
    }

    /// Number of live (reserved + committed) handles.
    pub fn live_count(&self) -> u32 {
        self.live
    }

    /// Number of committed handles.
    pub fn committed_count(&self) -> u32 {
        self.committed
    }

    /// Number of permanently retired slots.
    pub fn saturated_count(&self) -> u32 {
        self.saturated
    }

    /// Configured maximum number of simultaneous handles.
    pub fn capacity(&self) -> u32 {
        self.max_entities
    }

    // -- internal helpers ---------------------------------------------------

    fn slot(&self, entity: Entity) -> Option<&Slot> {
        let slot = self.slots.get(entity.index() as usize)?;
        let live = matches!(slot.state, SlotState::Reserved | SlotState::Committed);
        (live && slot.generation == entity.generation()).then_some(slot)
    }

    /// Test hook: force a slot's generation to a chosen value.
    #[cfg(test)]
    fn force_generation(&mut self, index: u32, generation: u32) {
        self.slots[index as usize].generation = generation;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

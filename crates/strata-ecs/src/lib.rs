//! Strata ECS -- a fixed-capacity, archetype-indexed entity/component store.
//!
//! Entities are generational handles into chunked Structure-of-Arrays
//! storage: one archetype per distinct component set, each archetype holding
//! its rows in fixed-size chunks from a pre-allocated pool. Every capacity
//! (entities, component types, archetypes, chunks, command buffer streams) is
//! fixed at construction; exceeding one is a typed error at the violating
//! call, never a reallocation.
//!
//! Mutations can be applied directly through [`Entities`](entities::Entities)
//! or recorded into fixed-capacity [`CmdBuf`](cmd::CmdBuf)s -- one per worker
//! via [`CmdPool`](pool::CmdPool) for lock-free parallel recording -- and
//! drained deterministically by [`Exec`](exec::Exec).
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Copy, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Copy, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut store = Entities::new(StoreConfig::default());
//! let entity = store.spawn()?;
//! store.add(entity, Position { x: 0.0, y: 0.0 })?;
//! store.add(entity, Velocity { dx: 1.0, dy: 0.0 })?;
//!
//! for (_entity, (pos, vel)) in store.query_mut::<(&mut Position, &Velocity)>() {
//!     pos.x += vel.dx;
//! }
//! assert_eq!(store.get::<Position>(entity), Some(&Position { x: 1.0, y: 0.0 }));
//! # Ok::<(), strata_ecs::StoreError>(())
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
#[allow(unsafe_code)]
pub mod chunk;
#[allow(unsafe_code)]
pub mod cmd;
pub mod component;
pub mod config;
#[allow(unsafe_code)]
pub mod entities;
pub mod entity;
#[allow(unsafe_code)]
pub mod exec;
pub mod pool;
#[allow(unsafe_code)]
pub mod query;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store and command buffer operations.
///
/// Every variant is a capacity bound or liveness check; none of them leave
/// partial mutations behind.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The handle table is at its configured maximum of live entities.
    #[error("entity capacity exhausted ({max} live handles)")]
    EntityOverflow { max: u32 },

    /// All component type bits are assigned.
    #[error("component type capacity exhausted ({max} types)")]
    CompOverflow { max: u32 },

    /// Creating a new distinct component set would exceed the archetype bound.
    #[error("archetype capacity exhausted ({max} distinct component sets)")]
    ArchOverflow { max: u32 },

    /// The chunk pool has no free blocks.
    #[error("chunk pool exhausted ({max} chunks)")]
    ChunkOverflow { max: u32 },

    /// A single row of the requested component set does not fit in one chunk.
    #[error("component set does not fit one row in a {chunk_bytes}-byte chunk")]
    RowOverflow { chunk_bytes: usize },

    /// A component's alignment exceeds what chunk storage guarantees.
    #[error("component alignment {align} exceeds the chunk alignment {max}")]
    AlignOverflow { align: usize, max: usize },

    /// A command buffer append would exceed one of its stream capacities.
    #[error("command buffer overflow in the {dimension} dimension")]
    CmdBufOverflow { dimension: cmd::CmdDimension },

    /// A command buffer's pre-reserved entity stack is empty.
    #[error("reserved-entity stack is empty")]
    ReservedEntityUnderflow,

    /// The operation addressed a stale or never-reserved handle.
    #[error("entity {0} is not alive")]
    DeadEntity(entity::Entity),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::cmd::{CmdBuf, CmdOp, INLINE_PAYLOAD_MAX};
    pub use crate::component::{Component, ComponentFlag, ComponentFlags, TypeKey, TypeRegistry};
    pub use crate::config::{CmdBufConfig, StoreConfig};
    pub use crate::entities::Entities;
    pub use crate::entity::Entity;
    pub use crate::exec::Exec;
    pub use crate::pool::CmdPool;
    pub use crate::query::{Query, QueryItem, QueryIter, QueryIterMut};
    pub use crate::StoreError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

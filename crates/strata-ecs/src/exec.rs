//! Deterministic command execution.
//!
//! [`Exec`] drains a [`CmdBuf`] against an [`Entities`] store: batches apply
//! in recorded order, and each batch is first folded to its net effect --
//! the last added value per component type wins, a later add cancels an
//! earlier remove of the same type (and vice versa), and `destroy` overrides
//! everything else in the batch, including its events. The surviving
//! structural changes land in a single archetype transition per batch, then
//! the batch's events fire in append order against registered handlers.
//!
//! A batch whose target entity died earlier in the drain (or before it) is
//! skipped with a warning; that interleaving is the recorder's hazard, not an
//! error. Store-level capacity errors abort the drain and leave already
//! applied batches in place.
//!
//! # Safety
//!
//! This module contains `unsafe` code to reinterpret event payload bytes as
//! the concrete `Copy` type a handler was registered for.

use std::any::TypeId;
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::cmd::{CmdBuf, CmdOp};
use crate::component::{Component, ComponentFlags, TypeKey};
use crate::entities::{ComponentWrite, Entities};
use crate::entity::Entity;
use crate::StoreError;

type EventHandler = Box<dyn FnMut(&mut Entities, Entity, &[u8])>;

/// Applies command buffers to a store.
#[derive(Default)]
pub struct Exec {
    handlers: HashMap<TypeId, EventHandler>,
}

impl Exec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for events of type `T`, replacing any previous
    /// one. Handlers get full store access; they run strictly after the
    /// batch's structural changes.
    pub fn on_event<T, F>(&mut self, mut handler: F)
    where
        T: Component,
        F: FnMut(&mut Entities, Entity, &T) + 'static,
    {
        self.handlers.insert(
            TypeId::of::<T>(),
            Box::new(move |store, entity, bytes| {
                debug_assert_eq!(bytes.len(), std::mem::size_of::<T>());
                // Safety: the executor only routes payloads recorded under
                // T's TypeId here; arena/inline payloads may be unaligned,
                // so read a copy.
                let value = unsafe { (bytes.as_ptr() as *const T).read_unaligned() };
                handler(store, entity, &value);
            }),
        );
    }

    /// Drain one buffer in deterministic batch order, then clear it (which
    /// refills its reserved-entity stack from `store`).
    ///
    /// On error the buffer is left unclear and batches already applied stay
    /// applied; recovery policy belongs to the caller.
    pub fn run(&mut self, store: &mut Entities, buf: &mut CmdBuf) -> Result<(), StoreError> {
        {
            let mut ops = buf.ops().peekable();
            while let Some(&(entity, _)) = ops.peek() {
                let mut destroyed = false;
                let mut commit_seen = false;
                let mut adds: Vec<(TypeKey, &[u8])> = Vec::new();
                let mut removes: Vec<TypeKey> = Vec::new();
                let mut events: Vec<(TypeKey, &[u8])> = Vec::new();
                while let Some(&(next_entity, _)) = ops.peek() {
                    if next_entity != entity {
                        break;
                    }
                    let (_, op) = ops.next().expect("peeked");
                    match op {
                        CmdOp::Add { key, bytes } => {
                            match adds.iter_mut().find(|(k, _)| *k == key) {
                                Some(slot) => slot.1 = bytes,
                                None => adds.push((key, bytes)),
                            }
                            removes.retain(|k| *k != key);
                        }
                        CmdOp::Remove { key } => {
                            adds.retain(|(k, _)| *k != key);
                            if !removes.contains(&key) {
                                removes.push(key);
                            }
                        }
                        CmdOp::Event { key, bytes } => events.push((key, bytes)),
                        CmdOp::Destroy => destroyed = true,
                        CmdOp::Commit => commit_seen = true,
                    }
                }

                if !store.exists(entity) {
                    warn!(%entity, "skipping command batch for dead entity");
                    continue;
                }
                if destroyed {
                    store.destroy(entity);
                    continue;
                }
                if !adds.is_empty() || !removes.is_empty() || commit_seen {
                    let mut remove_flags = ComponentFlags::EMPTY;
                    for key in &removes {
                        // Removing a never-registered type is a no-op.
                        if let Some(flag) = store.types().flag_by_type_id(key.type_id()) {
                            remove_flags.insert(flag);
                        }
                    }
                    let mut writes = Vec::with_capacity(adds.len());
                    for (key, bytes) in &adds {
                        debug_assert_eq!(bytes.len(), key.size());
                        let flag = key.resolve(store.types_mut())?;
                        writes.push(ComponentWrite {
                            flag,
                            ptr: bytes.as_ptr(),
                            size: key.size(),
                        });
                    }
                    store.change_archetype_raw(entity, &writes, remove_flags)?;
                }
                for (key, bytes) in &events {
                    match self.handlers.get_mut(&key.type_id()) {
                        Some(handler) => handler(store, entity, bytes),
                        None => debug!(%entity, "event with no registered handler"),
                    }
                }
            }
        }
        buf.clear(store)
    }

    /// Drain several buffers in the given order. Batches targeting the same
    /// entity from different buffers interact in exactly that order.
    pub fn run_all(&mut self, store: &mut Entities, bufs: &mut [CmdBuf]) -> Result<(), StoreError> {
        for buf in bufs {
            self.run(store, buf)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Exec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exec")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! The fixed-capacity command buffer.
//!
//! A [`CmdBuf`] is an append-only encoded log of deferred structural
//! mutations. Recording touches no store state (component types are carried
//! as [`TypeKey`]s, entities come from a pre-reserved stack), which is what
//! makes per-worker buffers lock-free during parallel recording.
//!
//! Capacity is five independent dimensions, all fixed at construction: the
//! operation tag stream, the argument stream, the payload byte arena, the
//! destroy list, and the reserved-entity stack. Every append checks the
//! dimensions it would touch before mutating anything; failure is
//! [`StoreError::CmdBufOverflow`] naming the dimension, and the buffer stays
//! valid and usable.
//!
//! Consecutive operations targeting the same entity merge into one batch;
//! batches never reorder. The executor folds each batch to its net effect.
//!
//! # Safety
//!
//! This module contains `unsafe` code for raw byte encoding of `Copy`
//! payloads and for dereferencing interned `&'static` payload pointers.

use std::fmt;
use std::ptr;

use crate::component::{Component, TypeKey};
use crate::config::CmdBufConfig;
use crate::entities::Entities;
use crate::entity::Entity;
use crate::StoreError;

/// Payloads at most this large are copied inline into the argument slot;
/// larger ones go to the byte arena. A tuning knob, not an architectural
/// constant.
pub const INLINE_PAYLOAD_MAX: usize = 16;

/// The capacity dimension a [`StoreError::CmdBufOverflow`] ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdDimension {
    Ops,
    Args,
    Bytes,
    Destroys,
    Reserved,
}

impl fmt::Display for CmdDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmdDimension::Ops => "ops",
            CmdDimension::Args => "args",
            CmdDimension::Bytes => "bytes",
            CmdDimension::Destroys => "destroys",
            CmdDimension::Reserved => "reserved",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdTag {
    Add,
    Remove,
    Event,
    Destroy,
    Commit,
}

#[derive(Debug, Clone, Copy)]
enum Payload {
    None,
    Inline {
        len: u8,
        bytes: [u8; INLINE_PAYLOAD_MAX],
    },
    Arena {
        offset: u32,
        len: u32,
    },
    /// Caller-interned payload. Only ever built from `&'static` data.
    Ptr {
        ptr: *const u8,
        len: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct CmdArg {
    key: TypeKey,
    payload: Payload,
}

/// A maximal run of consecutive operations targeting one entity.
#[derive(Debug, Clone, Copy)]
struct Batch {
    entity: Entity,
    tag_start: u32,
    tag_len: u32,
}

/// One decoded operation, yielded in recorded order by [`CmdBuf::ops`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmdOp<'a> {
    Add { key: TypeKey, bytes: &'a [u8] },
    Remove { key: TypeKey },
    Event { key: TypeKey, bytes: &'a [u8] },
    Destroy,
    Commit,
}

/// Fixed-capacity encoded command log.
#[derive(Debug)]
pub struct CmdBuf {
    config: CmdBufConfig,
    tags: Vec<CmdTag>,
    args: Vec<CmdArg>,
    bytes: Vec<u8>,
    destroys: Vec<Entity>,
    /// Pre-reserved handles, popped from the back.
    reserved: Vec<Entity>,
    batches: Vec<Batch>,
}

// Payload::Ptr pointers come from `&'static T`, so moving the buffer to
// another thread cannot outlive the data they point at.
#[allow(unsafe_code)]
unsafe impl Send for CmdBuf {}

impl CmdBuf {
    /// Build a buffer and pre-fill its reserved-entity stack from `store`.
    ///
    /// Every vector is allocated at full capacity here; appends never
    /// reallocate. Fails when the store cannot supply `max_reserved` handles.
    pub fn new(config: CmdBufConfig, store: &mut Entities) -> Result<Self, StoreError> {
        let mut buf = Self {
            tags: Vec::with_capacity(config.max_ops as usize),
            args: Vec::with_capacity(config.max_args as usize),
            bytes: Vec::with_capacity(config.max_bytes),
            destroys: Vec::with_capacity(config.max_destroys as usize),
            reserved: Vec::with_capacity(config.max_reserved as usize),
            batches: Vec::new(),
            config,
        };
        buf.refill_reserved(store)?;
        Ok(buf)
    }

    pub fn config(&self) -> &CmdBufConfig {
        &self.config
    }

    // -- recording ----------------------------------------------------------

    /// Pop a pre-reserved entity handle. Lock-free: never touches the store.
    pub fn reserve(&mut self) -> Result<Entity, StoreError> {
        self.reserved.pop().ok_or(StoreError::ReservedEntityUnderflow)
    }

    /// Record `add` with the value captured by copy.
    pub fn add_by_val<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), StoreError> {
        self.push_with_payload(entity, CmdTag::Add, TypeKey::of::<T>(), &value)
    }

    /// Record `add` with the value interned by pointer; no bytes are copied.
    pub fn add_by_ptr<T: Component>(
        &mut self,
        entity: Entity,
        value: &'static T,
    ) -> Result<(), StoreError> {
        self.ensure(1, 1, 0, 0)?;
        let payload = Payload::Ptr {
            ptr: value as *const T as *const u8,
            len: std::mem::size_of::<T>() as u32,
        };
        self.push_tag(entity, CmdTag::Add);
        self.args.push(CmdArg {
            key: TypeKey::of::<T>(),
            payload,
        });
        Ok(())
    }

    /// Record `remove`. Carries the type but no payload.
    pub fn remove<T: Component>(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.ensure(1, 1, 0, 0)?;
        self.push_tag(entity, CmdTag::Remove);
        self.args.push(CmdArg {
            key: TypeKey::of::<T>(),
            payload: Payload::None,
        });
        Ok(())
    }

    /// Record an extension event. Encoded exactly like `add`; the executor
    /// routes it to the handler registered for `T` instead of storage.
    pub fn event<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), StoreError> {
        self.push_with_payload(entity, CmdTag::Event, TypeKey::of::<T>(), &value)
    }

    /// Pointer-interned variant of [`event`](Self::event).
    pub fn event_by_ptr<T: Component>(
        &mut self,
        entity: Entity,
        value: &'static T,
    ) -> Result<(), StoreError> {
        self.ensure(1, 1, 0, 0)?;
        let payload = Payload::Ptr {
            ptr: value as *const T as *const u8,
            len: std::mem::size_of::<T>() as u32,
        };
        self.push_tag(entity, CmdTag::Event);
        self.args.push(CmdArg {
            key: TypeKey::of::<T>(),
            payload,
        });
        Ok(())
    }

    /// Record `destroy`.
    pub fn destroy(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.ensure(1, 0, 0, 1)?;
        self.push_tag(entity, CmdTag::Destroy);
        self.destroys.push(entity);
        Ok(())
    }

    /// Record `commit` (finalize a reserved entity into the empty archetype
    /// if nothing else in its batch gives it components).
    pub fn commit(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.ensure(1, 0, 0, 0)?;
        self.push_tag(entity, CmdTag::Commit);
        Ok(())
    }

    // -- introspection ------------------------------------------------------

    /// Recorded operations in order. Consecutive ops share an entity exactly
    /// when they were merged into one batch.
    pub fn ops(&self) -> OpsIter<'_> {
        OpsIter {
            buf: self,
            batch_idx: 0,
            tag_off: 0,
            arg_cursor: 0,
        }
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Number of batches the operations folded into.
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Handles still available to [`reserve`](Self::reserve).
    pub fn reserved_remaining(&self) -> u32 {
        self.reserved.len() as u32
    }

    /// Highest fractional utilization across the five capacity dimensions.
    ///
    /// The reserved dimension counts handles consumed, so a freshly refilled
    /// buffer reports 0.0 and a buffer that popped its whole stack reports
    /// at least 1.0.
    pub fn worst_case_usage(&self) -> f32 {
        let frac = |used: usize, cap: usize| {
            if cap == 0 {
                0.0
            } else {
                used as f32 / cap as f32
            }
        };
        let reserved_used = self.config.max_reserved as usize - self.reserved.len();
        frac(self.tags.len(), self.config.max_ops as usize)
            .max(frac(self.args.len(), self.config.max_args as usize))
            .max(frac(self.bytes.len(), self.config.max_bytes))
            .max(frac(self.destroys.len(), self.config.max_destroys as usize))
            .max(frac(reserved_used, self.config.max_reserved as usize))
    }

    /// Reset all streams (keeping allocations) and refill the reserved stack
    /// from `store`.
    pub fn clear(&mut self, store: &mut Entities) -> Result<(), StoreError> {
        self.tags.clear();
        self.args.clear();
        self.bytes.clear();
        self.destroys.clear();
        self.batches.clear();
        self.refill_reserved(store)
    }

    // -- internals ----------------------------------------------------------

    fn refill_reserved(&mut self, store: &mut Entities) -> Result<(), StoreError> {
        while self.reserved.len() < self.config.max_reserved as usize {
            self.reserved.push(store.reserve()?);
        }
        Ok(())
    }

    /// Check every dimension an append would touch. Nothing is mutated on
    /// failure.
    fn ensure(
        &self,
        ops: usize,
        args: usize,
        bytes: usize,
        destroys: usize,
    ) -> Result<(), StoreError> {
        if self.tags.len() + ops > self.config.max_ops as usize {
            return Err(StoreError::CmdBufOverflow {
                dimension: CmdDimension::Ops,
            });
        }
        if self.args.len() + args > self.config.max_args as usize {
            return Err(StoreError::CmdBufOverflow {
                dimension: CmdDimension::Args,
            });
        }
        if self.bytes.len() + bytes > self.config.max_bytes {
            return Err(StoreError::CmdBufOverflow {
                dimension: CmdDimension::Bytes,
            });
        }
        if self.destroys.len() + destroys > self.config.max_destroys as usize {
            return Err(StoreError::CmdBufOverflow {
                dimension: CmdDimension::Destroys,
            });
        }
        Ok(())
    }

    fn push_with_payload<T: Component>(
        &mut self,
        entity: Entity,
        tag: CmdTag,
        key: TypeKey,
        value: &T,
    ) -> Result<(), StoreError> {
        let size = std::mem::size_of::<T>();
        let arena_bytes = if size > INLINE_PAYLOAD_MAX { size } else { 0 };
        self.ensure(1, 1, arena_bytes, 0)?;
        let src = value as *const T as *const u8;
        let payload = if size <= INLINE_PAYLOAD_MAX {
            let mut bytes = [0u8; INLINE_PAYLOAD_MAX];
            // Safety: T is Copy with size <= INLINE_PAYLOAD_MAX; src is a
            // live value of T.
            unsafe { ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), size) };
            Payload::Inline {
                len: size as u8,
                bytes,
            }
        } else {
            let offset = self.bytes.len();
            // Safety: capacity was pre-allocated to max_bytes and `ensure`
            // verified offset + size stays within it.
            unsafe {
                ptr::copy_nonoverlapping(src, self.bytes.as_mut_ptr().add(offset), size);
                self.bytes.set_len(offset + size);
            }
            Payload::Arena {
                offset: offset as u32,
                len: size as u32,
            }
        };
        self.push_tag(entity, tag);
        self.args.push(CmdArg { key, payload });
        Ok(())
    }

    fn push_tag(&mut self, entity: Entity, tag: CmdTag) {
        match self.batches.last_mut() {
            Some(last) if last.entity == entity => last.tag_len += 1,
            _ => self.batches.push(Batch {
                entity,
                tag_start: self.tags.len() as u32,
                tag_len: 1,
            }),
        }
        self.tags.push(tag);
    }

    fn payload_bytes<'a>(&'a self, payload: &'a Payload) -> &'a [u8] {
        match payload {
            Payload::None => &[],
            Payload::Inline { len, bytes } => &bytes[..*len as usize],
            Payload::Arena { offset, len } => {
                &self.bytes[*offset as usize..(*offset + *len) as usize]
            }
            // Safety: Ptr payloads are only built from `&'static T`, so the
            // data is live and `len` bytes long.
            Payload::Ptr { ptr, len } => {
                #[allow(unsafe_code)]
                unsafe {
                    std::slice::from_raw_parts(*ptr, *len as usize)
                }
            }
        }
    }
}

/// Iterator over recorded operations; see [`CmdBuf::ops`].
pub struct OpsIter<'a> {
    buf: &'a CmdBuf,
    batch_idx: usize,
    tag_off: u32,
    arg_cursor: usize,
}

impl<'a> Iterator for OpsIter<'a> {
    type Item = (Entity, CmdOp<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let batch = self.buf.batches.get(self.batch_idx)?;
            if self.tag_off >= batch.tag_len {
                self.batch_idx += 1;
                self.tag_off = 0;
                continue;
            }
            let tag = self.buf.tags[(batch.tag_start + self.tag_off) as usize];
            self.tag_off += 1;
            let op = match tag {
                CmdTag::Add | CmdTag::Event => {
                    let arg = &self.buf.args[self.arg_cursor];
                    self.arg_cursor += 1;
                    let bytes = self.buf.payload_bytes(&arg.payload);
                    if tag == CmdTag::Add {
                        CmdOp::Add {
                            key: arg.key,
                            bytes,
                        }
                    } else {
                        CmdOp::Event {
                            key: arg.key,
                            bytes,
                        }
                    }
                }
                CmdTag::Remove => {
                    let arg = &self.buf.args[self.arg_cursor];
                    self.arg_cursor += 1;
                    CmdOp::Remove { key: arg.key }
                }
                CmdTag::Destroy => CmdOp::Destroy,
                CmdTag::Commit => CmdOp::Commit,
            };
            return Some((batch.entity, op));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Small(u32);

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Big {
        data: [f32; 8], // 32 bytes, beyond the inline threshold
    }

    fn store() -> Entities {
        Entities::new(StoreConfig {
            max_entities: 128,
            ..StoreConfig::default()
        })
    }

    fn tiny_config() -> CmdBufConfig {
        CmdBufConfig {
            max_ops: 4,
            max_args: 4,
            max_bytes: 64,
            max_destroys: 2,
            max_reserved: 2,
        }
    }

    #[test]
    fn records_in_order_with_payloads() {
        let mut store = store();
        let mut buf = CmdBuf::new(tiny_config(), &mut store).unwrap();
        let e = buf.reserve().unwrap();
        buf.add_by_val(e, Small(7)).unwrap();
        buf.remove::<Big>(e).unwrap();
        buf.commit(e).unwrap();

        let ops: Vec<_> = buf.ops().collect();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].0, e);
        match ops[0].1 {
            CmdOp::Add { key, bytes } => {
                assert_eq!(key, TypeKey::of::<Small>());
                assert_eq!(bytes, 7u32.to_ne_bytes());
            }
            ref other => panic!("expected Add, got {other:?}"),
        }
        assert!(matches!(ops[1].1, CmdOp::Remove { key } if key == TypeKey::of::<Big>()));
        assert!(matches!(ops[2].1, CmdOp::Commit));
    }

    #[test]
    fn large_payload_lands_in_arena() {
        let mut store = store();
        let mut buf = CmdBuf::new(tiny_config(), &mut store).unwrap();
        let e = buf.reserve().unwrap();
        let value = Big { data: [1.5; 8] };
        buf.add_by_val(e, value).unwrap();
        assert_eq!(buf.bytes.len(), std::mem::size_of::<Big>());
        let (_, op) = buf.ops().next().unwrap();
        match op {
            CmdOp::Add { bytes, .. } => assert_eq!(bytes.len(), 32),
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn ptr_payload_copies_nothing() {
        static VALUE: Big = Big { data: [2.0; 8] };
        let mut store = store();
        let mut buf = CmdBuf::new(tiny_config(), &mut store).unwrap();
        let e = buf.reserve().unwrap();
        buf.add_by_ptr(e, &VALUE).unwrap();
        assert_eq!(buf.bytes.len(), 0);
        let (_, op) = buf.ops().next().unwrap();
        match op {
            CmdOp::Add { bytes, .. } => {
                assert_eq!(bytes.as_ptr(), &VALUE as *const Big as *const u8);
            }
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn consecutive_same_entity_ops_share_a_batch() {
        let mut store = store();
        let mut buf = CmdBuf::new(tiny_config(), &mut store).unwrap();
        let a = buf.reserve().unwrap();
        let b = buf.reserve().unwrap();
        buf.add_by_val(a, Small(1)).unwrap();
        buf.add_by_val(a, Small(2)).unwrap();
        buf.commit(b).unwrap();
        buf.destroy(a).unwrap();
        // a,a | b | a -- interleaving splits the run.
        assert_eq!(buf.batch_count(), 3);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn each_dimension_overflows_independently() {
        let mut store = store();
        let config = CmdBufConfig {
            max_ops: 2,
            max_args: 8,
            max_bytes: 1024,
            max_destroys: 8,
            max_reserved: 1,
        };
        let mut buf = CmdBuf::new(config, &mut store).unwrap();
        let e = buf.reserve().unwrap();
        buf.commit(e).unwrap();
        buf.commit(e).unwrap();
        assert!(matches!(
            buf.commit(e),
            Err(StoreError::CmdBufOverflow {
                dimension: CmdDimension::Ops
            })
        ));

        // Destroy list bound, separate from ops.
        let mut buf = CmdBuf::new(
            CmdBufConfig {
                max_ops: 8,
                max_destroys: 1,
                max_reserved: 1,
                ..tiny_config()
            },
            &mut store,
        )
        .unwrap();
        let e = buf.reserve().unwrap();
        buf.destroy(e).unwrap();
        assert!(matches!(
            buf.destroy(e),
            Err(StoreError::CmdBufOverflow {
                dimension: CmdDimension::Destroys
            })
        ));

        // Arena bound.
        let mut buf = CmdBuf::new(
            CmdBufConfig {
                max_ops: 8,
                max_args: 8,
                max_bytes: 40,
                max_destroys: 2,
                max_reserved: 1,
            },
            &mut store,
        )
        .unwrap();
        let e = buf.reserve().unwrap();
        buf.add_by_val(e, Big { data: [0.0; 8] }).unwrap();
        assert!(matches!(
            buf.add_by_val(e, Big { data: [0.0; 8] }),
            Err(StoreError::CmdBufOverflow {
                dimension: CmdDimension::Bytes
            })
        ));
        // The buffer is still usable for fitting appends.
        buf.add_by_val(e, Small(1)).unwrap();
    }

    #[test]
    fn reserve_underflows_when_stack_is_spent() {
        let mut store = store();
        let mut buf = CmdBuf::new(tiny_config(), &mut store).unwrap();
        buf.reserve().unwrap();
        buf.reserve().unwrap();
        assert!(matches!(
            buf.reserve(),
            Err(StoreError::ReservedEntityUnderflow)
        ));
    }

    #[test]
    fn worst_case_usage_tracks_the_tightest_dimension() {
        let mut store = store();
        let mut buf = CmdBuf::new(tiny_config(), &mut store).unwrap();
        assert_eq!(buf.worst_case_usage(), 0.0);
        let e = buf.reserve().unwrap();
        // Reserved: 1/2 consumed.
        assert_eq!(buf.worst_case_usage(), 0.5);
        buf.add_by_val(e, Big { data: [0.0; 8] }).unwrap();
        // Arena: 32/64; ops 1/4; args 1/4; reserved still 1/2.
        assert_eq!(buf.worst_case_usage(), 0.5);
        buf.destroy(e).unwrap();
        // Destroys: 1/2 -- still 0.5 -- then 2/2 dominates.
        buf.destroy(e).unwrap();
        assert_eq!(buf.worst_case_usage(), 1.0);
    }

    #[test]
    fn clear_resets_streams_and_refills_reserved() {
        let mut store = store();
        let mut buf = CmdBuf::new(tiny_config(), &mut store).unwrap();
        let e = buf.reserve().unwrap();
        buf.add_by_val(e, Big { data: [0.0; 8] }).unwrap();
        buf.destroy(e).unwrap();
        buf.clear(&mut store).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.batch_count(), 0);
        assert_eq!(buf.reserved_remaining(), 2);
        assert_eq!(buf.worst_case_usage(), 0.0);
    }

    #[test]
    fn new_fails_when_store_cannot_supply_reserves() {
        let mut store = Entities::new(StoreConfig {
            max_entities: 1,
            ..StoreConfig::default()
        });
        let result = CmdBuf::new(tiny_config(), &mut store); // wants 2 handles
        assert!(matches!(result, Err(StoreError::EntityOverflow { .. })));
    }

    #[test]
    fn zero_sized_payload_is_inline() {
        #[derive(Clone, Copy)]
        struct Marker;
        let mut store = store();
        let mut buf = CmdBuf::new(tiny_config(), &mut store).unwrap();
        let e = buf.reserve().unwrap();
        buf.add_by_val(e, Marker).unwrap();
        let (_, op) = buf.ops().next().unwrap();
        assert!(matches!(op, CmdOp::Add { bytes: &[], .. }));
    }
}

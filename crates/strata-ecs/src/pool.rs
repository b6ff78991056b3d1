//! Per-worker command buffer pool and the parallel recording driver.
//!
//! [`CmdPool`] owns one [`CmdBuf`] per worker. [`CmdPool::for_each_par`]
//! runs a query across a rayon scope with one task per worker: each task
//! walks a disjoint set of chunks and records exclusively
//! into its own buffer, so the parallel phase needs no locks. Structural
//! mutations are only recorded, never applied, which keeps chunk layout
//! stable for the whole phase; mutating component *values* through `&mut T`
//! query items is allowed because the chunk partitions are disjoint.
//!
//! [`drain`](CmdPool::drain) then applies the buffers serially in
//! worker-index order, which makes a parallel frame deterministic for a fixed
//! worker count.

use crate::cmd::CmdBuf;
use crate::component::ComponentFlags;
use crate::config::CmdBufConfig;
use crate::entities::Entities;
use crate::entity::Entity;
use crate::exec::Exec;
use crate::query::{matching_archetypes, Query};
use crate::StoreError;

/// A fixed set of per-worker command buffers.
#[derive(Debug)]
pub struct CmdPool {
    bufs: Vec<CmdBuf>,
}

impl CmdPool {
    /// Build `workers` buffers, each with its own reserved-entity stack.
    pub fn new(
        workers: usize,
        config: CmdBufConfig,
        store: &mut Entities,
    ) -> Result<Self, StoreError> {
        assert!(workers >= 1, "CmdPool needs at least one worker");
        let bufs = (0..workers)
            .map(|_| CmdBuf::new(config.clone(), store))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { bufs })
    }

    pub fn workers(&self) -> usize {
        self.bufs.len()
    }

    /// One worker's buffer, for serial recording outside the parallel phase.
    pub fn buf_mut(&mut self, worker: usize) -> &mut CmdBuf {
        &mut self.bufs[worker]
    }

    pub fn bufs(&self) -> &[CmdBuf] {
        &self.bufs
    }

    /// Highest [`CmdBuf::worst_case_usage`] across the member buffers.
    pub fn worst_case_usage(&self) -> f32 {
        self.bufs
            .iter()
            .map(CmdBuf::worst_case_usage)
            .fold(0.0, f32::max)
    }

    /// Run `f` over every entity matched by `Q`, in parallel, one task per
    /// worker.
    ///
    /// Each invocation gets the worker's own buffer, the entity handle, and
    /// the query items for one row. `Q` may contain `&mut T` items: the
    /// exclusive `store` borrow plus disjoint per-worker chunk partitions
    /// make in-place value mutation sound. `f` must not touch the store
    /// beyond the items it is handed; structural changes go into the buffer.
    ///
    /// Capacity errors hit during recording are returned per worker, in
    /// worker-index order, after the scope completes.
    pub fn for_each_par<Q, F>(&mut self, store: &mut Entities, f: F) -> Result<(), StoreError>
    where
        Q: Query,
        F: for<'w> Fn(&mut CmdBuf, Entity, Q::Item<'w>) -> Result<(), StoreError> + Sync,
    {
        Q::validate_access(store);
        let Some(require) = Q::required_flags(store) else {
            return Ok(());
        };
        let archetypes = matching_archetypes(store, require, ComponentFlags::EMPTY);

        // One job per non-empty chunk; chunk lengths are frozen for the
        // whole phase because nothing structural is applied.
        let mut jobs: Vec<(u32, u32, u32)> = Vec::new();
        for &arch_idx in &archetypes {
            let arch = &store.arch_registry().archetypes()[arch_idx as usize];
            for (chunk_slot, slot) in arch.chunks().iter().enumerate() {
                if slot.len > 0 {
                    jobs.push((arch_idx, chunk_slot as u32, slot.len));
                }
            }
        }
        if jobs.is_empty() {
            return Ok(());
        }

        let per_worker = jobs.len().div_ceil(self.bufs.len());
        let groups: Vec<&[(u32, u32, u32)]> = jobs.chunks(per_worker).collect();
        let store_ref: &Entities = store;
        let mut results: Vec<Result<(), StoreError>> = groups.iter().map(|_| Ok(())).collect();
        rayon::scope(|scope| {
            for ((buf, group), outcome) in self
                .bufs
                .iter_mut()
                .zip(groups.iter().copied())
                .zip(results.iter_mut())
            {
                let f = &f;
                scope.spawn(move |_| {
                    'jobs: for &(arch_idx, chunk_slot, len) in group {
                        let arch = &store_ref.arch_registry().archetypes()[arch_idx as usize];
                        for row in 0..len {
                            let index =
                                arch.entity_index_at(store_ref.chunk_pool(), chunk_slot, row);
                            let entity = store_ref.handle_for_index(index);
                            let item = Q::fetch_row(store_ref, arch_idx, chunk_slot, row);
                            if let Err(err) = f(buf, entity, item) {
                                *outcome = Err(err);
                                break 'jobs;
                            }
                        }
                    }
                });
            }
        });
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Apply every buffer serially in worker-index order, clearing each as
    /// it drains.
    pub fn drain(&mut self, exec: &mut Exec, store: &mut Entities) -> Result<(), StoreError> {
        for buf in &mut self.bufs {
            exec.run(store, buf)?;
        }
        Ok(())
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
    struct Pos {
        x: f32,
    }

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Vel {
        dx: f32,
    }

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Scored;

    fn store_with(n: u32) -> Entities {
        let mut store = Entities::new(StoreConfig {
            max_entities: 1024,
            max_archetypes: 16,
            max_chunks: 64,
            chunk_bytes: 256,
        });
        for i in 0..n {
            let e = store.spawn().unwrap();
            store.add(e, Pos { x: i as f32 }).unwrap();
            store.add(e, Vel { dx: 1.0 }).unwrap();
        }
        store
    }

    #[test]
    fn parallel_record_then_drain_applies_everything() {
        let mut store = store_with(100);
        let mut pool = CmdPool::new(4, CmdBufConfig::default(), &mut store).unwrap();
        let mut exec = Exec::new();

        pool.for_each_par::<(&Pos,), _>(&mut store, |buf, entity, (pos,)| {
            if pos.x >= 50.0 {
                buf.add_by_val(entity, Scored)
            } else {
                Ok(())
            }
        })
        .unwrap();
        pool.drain(&mut exec, &mut store).unwrap();

        let scored = store.query::<(&Scored,)>().count();
        assert_eq!(scored, 50);
        // Buffers drained and refilled.
        assert_eq!(pool.worst_case_usage(), 0.0);
    }

    #[test]
    fn workers_mutate_values_in_place_while_recording() {
        let mut store = store_with(40);
        let mut pool = CmdPool::new(3, CmdBufConfig::default(), &mut store).unwrap();

        pool.for_each_par::<(&mut Pos, &Vel), _>(&mut store, |_buf, _e, (pos, vel)| {
            pos.x += vel.dx * 2.0;
            Ok(())
        })
        .unwrap();

        let mut xs: Vec<f32> = store.query::<(&Pos,)>().map(|(_, (p,))| p.x).collect();
        xs.sort_by(f32::total_cmp);
        let expected: Vec<f32> = (0..40).map(|i| i as f32 + 2.0).collect();
        assert_eq!(xs, expected);
    }

    #[test]
    fn parallel_destroys_fold_deterministically() {
        let mut store = store_with(30);
        let mut pool = CmdPool::new(2, CmdBufConfig::default(), &mut store).unwrap();
        let mut exec = Exec::new();

        pool.for_each_par::<(&Pos,), _>(&mut store, |buf, entity, (pos,)| {
            if (pos.x as u32) % 3 == 0 {
                buf.destroy(entity)
            } else {
                Ok(())
            }
        })
        .unwrap();
        pool.drain(&mut exec, &mut store).unwrap();
        assert_eq!(store.count(), 20);
    }

    #[test]
    fn reserved_stacks_spawn_from_workers() {
        let mut store = store_with(0);
        let mut pool = CmdPool::new(2, CmdBufConfig::default(), &mut store).unwrap();
        let mut exec = Exec::new();

        for worker in 0..2 {
            let buf = pool.buf_mut(worker);
            let e = buf.reserve().unwrap();
            buf.add_by_val(e, Pos { x: worker as f32 }).unwrap();
        }
        pool.drain(&mut exec, &mut store).unwrap();
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn recording_error_surfaces_after_the_scope() {
        let mut store = store_with(20);
        let tight = CmdBufConfig {
            max_ops: 2,
            max_args: 2,
            max_bytes: 64,
            max_destroys: 2,
            max_reserved: 1,
        };
        let mut pool = CmdPool::new(1, tight, &mut store).unwrap();
        let result = pool.for_each_par::<(&Pos,), _>(&mut store, |buf, entity, _| {
            buf.add_by_val(entity, Scored)
        });
        assert!(matches!(result, Err(StoreError::CmdBufOverflow { .. })));
    }
}

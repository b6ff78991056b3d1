//! Archetype storage: column layout inside fixed chunks, row operations, and
//! the bounded archetype registry.
//!
//! All entities sharing one component bitset live in one [`Archetype`]. The
//! archetype owns an ordered list of chunks from the [`ChunkPool`]; inside a
//! chunk, storage is SoA: a `u32` entity-index column at offset 0, then one
//! aligned column per component in flag order. Removal swap-compacts within
//! the chunk, so occupied rows are always the prefix `0..len`.
//!
//! # Safety
//!
//! This module contains `unsafe` code for raw column reads and writes. The
//! invariants are upheld by [`ChunkLayout`]: every column's byte range lies
//! inside the chunk, is aligned to the component's declared alignment, and
//! does not overlap any other column.

use std::collections::HashMap;
use std::ptr;

use tracing::debug;

use crate::chunk::{ChunkPool, CHUNK_ALIGN};
use crate::component::{ComponentFlag, ComponentFlags, TypeRegistry};
use crate::StoreError;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype within a store. Indexes `ArchetypeRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// ChunkLayout
// ---------------------------------------------------------------------------

/// Byte placement of one component column within a chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ColumnLayout {
    pub flag: ComponentFlag,
    pub offset: usize,
    pub size: usize,
}

/// Column placement for one archetype, shared by all its chunks.
#[derive(Debug, Clone)]
pub(crate) struct ChunkLayout {
    /// Columns sorted by flag index.
    columns: Vec<ColumnLayout>,
    rows_per_chunk: u32,
}

impl ChunkLayout {
    /// Compute the maximal-row layout for `flags` inside `chunk_bytes`.
    ///
    /// Fails with [`StoreError::RowOverflow`] when even a single row does
    /// not fit, so the archetype transition that asked for the layout can
    /// surface a typed error instead of creating the archetype.
    pub fn compute(
        flags: ComponentFlags,
        types: &TypeRegistry,
        chunk_bytes: usize,
    ) -> Result<Self, StoreError> {
        let infos: Vec<_> = flags.iter().map(|f| types.info(f)).collect();
        // Chunk bases are CHUNK_ALIGN-aligned and registration rejects types
        // aligned beyond that, so offsets aligned within the chunk are
        // aligned absolutely.
        debug_assert!(infos.iter().all(|i| i.align <= CHUNK_ALIGN));
        let row_bytes: usize = 4 + infos.iter().map(|i| i.size).sum::<usize>();

        // Upper bound ignores padding; walk down until the padded layout fits.
        let mut rows = chunk_bytes / row_bytes;
        let mut columns = Vec::new();
        loop {
            if rows == 0 {
                return Err(StoreError::RowOverflow { chunk_bytes });
            }
            columns.clear();
            let mut offset = 4 * rows; // entity-index column
            let mut fits = true;
            for info in &infos {
                offset = align_up(offset, info.align);
                columns.push(ColumnLayout {
                    flag: info.flag,
                    offset,
                    size: info.size,
                });
                offset += info.size * rows;
                if offset > chunk_bytes {
                    fits = false;
                    break;
                }
            }
            if fits && offset <= chunk_bytes {
                break;
            }
            rows -= 1;
        }
        debug_assert!(columns.windows(2).all(|w| w[0].flag < w[1].flag));
        Ok(Self {
            columns,
            rows_per_chunk: rows as u32,
        })
    }

    #[inline]
    pub fn rows_per_chunk(&self) -> u32 {
        self.rows_per_chunk
    }

    pub fn column(&self, flag: ComponentFlag) -> Option<&ColumnLayout> {
        self.columns
            .binary_search_by_key(&flag, |c| c.flag)
            .ok()
            .map(|i| &self.columns[i])
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// One chunk's worth of rows: which pool block, and how many rows are live.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkSlot {
    pub chunk: u32,
    pub len: u32,
}

/// All entities sharing one component bitset, stored across chunks.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    flags: ComponentFlags,
    layout: ChunkLayout,
    chunks: Vec<ChunkSlot>,
    total: u32,
}

impl Archetype {
    fn new(id: ArchetypeId, flags: ComponentFlags, layout: ChunkLayout) -> Self {
        Self {
            id,
            flags,
            layout,
            chunks: Vec::new(),
            total: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> ComponentFlags {
        self.flags
    }

    /// Total live rows across all chunks.
    #[inline]
    pub fn len(&self) -> u32 {
        self.total
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub(crate) fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub(crate) fn chunks(&self) -> &[ChunkSlot] {
        &self.chunks
    }

    /// Append a row for `entity_index`, acquiring a chunk if none has space.
    ///
    /// Returns the `(chunk_slot, row)` coordinates of the new row. Nothing is
    /// mutated when chunk acquisition fails.
    pub(crate) fn push_row(
        &mut self,
        pool: &mut ChunkPool,
        entity_index: u32,
    ) -> Result<(u32, u32), StoreError> {
        let slot = match self
            .chunks
            .iter()
            .position(|c| c.len < self.layout.rows_per_chunk)
        {
            Some(slot) => slot,
            None => {
                let chunk = pool.acquire()?;
                debug!(archetype = self.id.0, chunk, "acquired chunk");
                self.chunks.push(ChunkSlot { chunk, len: 0 });
                self.chunks.len() - 1
            }
        };
        let row = self.chunks[slot].len;
        let base = pool.block_ptr(self.chunks[slot].chunk);
        // Safety: row < rows_per_chunk, so the write is inside the entity column.
        unsafe {
            (base as *mut u32).add(row as usize).write(entity_index);
        }
        self.chunks[slot].len += 1;
        self.total += 1;
        Ok((slot as u32, row))
    }

    /// Remove the row at `(chunk_slot, row)` by swapping the chunk's last row
    /// into its place.
    ///
    /// Returns the entity index that now occupies `row`, if any. An emptied
    /// tail chunk is released back to the pool; an emptied interior chunk is
    /// kept and refilled by later pushes, so chunk slot indices held in
    /// entity locations stay valid.
    pub(crate) fn swap_remove_row(
        &mut self,
        pool: &mut ChunkPool,
        chunk_slot: u32,
        row: u32,
    ) -> Option<u32> {
        let slot = &mut self.chunks[chunk_slot as usize];
        let last = slot.len - 1;
        let base = pool.block_ptr(slot.chunk);
        let moved = if row != last {
            // Safety: row and last are both live rows of this chunk; column
            // byte ranges are in bounds per the layout.
            unsafe {
                for col in &self.layout.columns {
                    let col_base = base.add(col.offset);
                    ptr::copy_nonoverlapping(
                        col_base.add(last as usize * col.size),
                        col_base.add(row as usize * col.size),
                        col.size,
                    );
                }
                let entities = base as *mut u32;
                let moved_index = entities.add(last as usize).read();
                entities.add(row as usize).write(moved_index);
                Some(moved_index)
            }
        } else {
            None
        };
        slot.len -= 1;
        self.total -= 1;
        while let Some(tail) = self.chunks.last() {
            if tail.len != 0 {
                break;
            }
            let chunk = tail.chunk;
            self.chunks.pop();
            pool.release(chunk);
            debug!(archetype = self.id.0, chunk, "released chunk");
        }
        moved
    }

    /// Entity index stored at a live row.
    #[inline]
    pub(crate) fn entity_index_at(&self, pool: &ChunkPool, chunk_slot: u32, row: u32) -> u32 {
        let slot = &self.chunks[chunk_slot as usize];
        debug_assert!(row < slot.len);
        // Safety: row is live, the read stays in the entity column.
        unsafe { (pool.block_ptr(slot.chunk) as *const u32).add(row as usize).read() }
    }

    /// Raw pointer to one component value at a live row, or `None` when the
    /// archetype does not store `flag`.
    #[inline]
    pub(crate) fn component_ptr(
        &self,
        pool: &ChunkPool,
        chunk_slot: u32,
        row: u32,
        flag: ComponentFlag,
    ) -> Option<*mut u8> {
        let col = self.layout.column(flag)?;
        let slot = &self.chunks[chunk_slot as usize];
        debug_assert!(row < slot.len);
        // Safety: the column byte range is inside the chunk per the layout.
        Some(unsafe {
            pool.block_ptr(slot.chunk)
                .add(col.offset + row as usize * col.size)
        })
    }
}

// ---------------------------------------------------------------------------
// ArchetypeRegistry
// ---------------------------------------------------------------------------

/// Bitset-to-archetype map, bounded by `max_archetypes`.
///
/// A bitset that was ever materialized keeps its id for the lifetime of the
/// store, even when all of its chunks have been released.
#[derive(Debug)]
pub struct ArchetypeRegistry {
    archetypes: Vec<Archetype>,
    by_flags: HashMap<ComponentFlags, ArchetypeId>,
    max_archetypes: u32,
}

impl ArchetypeRegistry {
    pub fn new(max_archetypes: u32) -> Self {
        Self {
            archetypes: Vec::new(),
            by_flags: HashMap::new(),
            max_archetypes,
        }
    }

    /// Look up the archetype for `flags`, if one was ever created.
    pub fn get(&self, flags: ComponentFlags) -> Option<ArchetypeId> {
        self.by_flags.get(&flags).copied()
    }

    /// Look up or create the archetype for `flags`.
    ///
    /// Re-requesting an existing bitset always succeeds; only a new distinct
    /// bitset can fail with [`StoreError::ArchOverflow`].
    pub fn get_or_create(
        &mut self,
        flags: ComponentFlags,
        types: &TypeRegistry,
        chunk_bytes: usize,
    ) -> Result<ArchetypeId, StoreError> {
        if let Some(id) = self.by_flags.get(&flags) {
            return Ok(*id);
        }
        if self.archetypes.len() as u32 >= self.max_archetypes {
            return Err(StoreError::ArchOverflow {
                max: self.max_archetypes,
            });
        }
        let id = ArchetypeId(self.archetypes.len() as u32);
        let layout = ChunkLayout::compute(flags, types, chunk_bytes)?;
        debug!(
            archetype = id.0,
            ?flags,
            rows_per_chunk = layout.rows_per_chunk(),
            "created archetype"
        );
        self.archetypes.push(Archetype::new(id, flags, layout));
        self.by_flags.insert(flags, id);
        Ok(id)
    }

    #[inline]
    pub fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }

    #[inline]
    pub(crate) fn archetype_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Pos {
        x: f64,
        y: f64,
    }

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Hp(u8);

    fn registry_with_types() -> (TypeRegistry, ComponentFlag, ComponentFlag) {
        let mut types = TypeRegistry::new();
        let pos = types.register::<Pos>().unwrap();
        let hp = types.register::<Hp>().unwrap();
        (types, pos, hp)
    }

    unsafe fn write_at<T: Copy>(arch: &Archetype, pool: &ChunkPool, slot: u32, row: u32, flag: ComponentFlag, value: T) {
        let ptr = arch.component_ptr(pool, slot, row, flag).unwrap();
        (ptr as *mut T).write(value);
    }

    unsafe fn read_at<T: Copy>(arch: &Archetype, pool: &ChunkPool, slot: u32, row: u32, flag: ComponentFlag) -> T {
        let ptr = arch.component_ptr(pool, slot, row, flag).unwrap();
        (ptr as *const T).read()
    }

    #[test]
    fn layout_is_aligned_and_maximal() {
        let (types, pos, hp) = registry_with_types();
        let flags = pos.bit().union(hp.bit());
        let layout = ChunkLayout::compute(flags, &types, 1024).unwrap();
        let pos_col = layout.column(pos).unwrap();
        let hp_col = layout.column(hp).unwrap();
        assert_eq!(pos_col.offset % std::mem::align_of::<Pos>(), 0);
        let rows = layout.rows_per_chunk() as usize;
        // Rows must fit: entity column + both component columns.
        assert!(hp_col.offset + rows <= 1024);
        // And be maximal: one more row of raw bytes must not fit.
        let row_bytes = 4 + std::mem::size_of::<Pos>() + 1;
        assert!((rows + 1) * row_bytes > 1024);
    }

    #[test]
    fn empty_bitset_layout_holds_entities_only() {
        let types = TypeRegistry::new();
        let layout = ChunkLayout::compute(ComponentFlags::EMPTY, &types, 256).unwrap();
        assert_eq!(layout.rows_per_chunk(), 64);
    }

    #[test]
    fn layout_rejects_oversized_rows() {
        let (types, pos, hp) = registry_with_types();
        // 4 + 16 + 1 bytes per row does not fit a 16-byte chunk.
        assert!(matches!(
            ChunkLayout::compute(pos.bit().union(hp.bit()), &types, 16),
            Err(StoreError::RowOverflow { chunk_bytes: 16 })
        ));
    }

    #[test]
    fn push_and_read_rows() {
        let (types, pos, hp) = registry_with_types();
        let mut pool = ChunkPool::new(4, 1024);
        let mut reg = ArchetypeRegistry::new(8);
        let id = reg
            .get_or_create(pos.bit().union(hp.bit()), &types, 1024)
            .unwrap();
        let arch = reg.archetype_mut(id);

        let (s0, r0) = arch.push_row(&mut pool, 10).unwrap();
        let (s1, r1) = arch.push_row(&mut pool, 11).unwrap();
        assert_eq!((s0, r0), (0, 0));
        assert_eq!((s1, r1), (0, 1));
        assert_eq!(arch.len(), 2);
        assert_eq!(arch.entity_index_at(&pool, s1, r1), 11);

        unsafe {
            write_at(arch, &pool, s0, r0, pos, Pos { x: 1.0, y: 2.0 });
            write_at(arch, &pool, s1, r1, hp, Hp(7));
            assert_eq!(read_at::<Pos>(arch, &pool, s0, r0, pos), Pos { x: 1.0, y: 2.0 });
            assert_eq!(read_at::<Hp>(arch, &pool, s1, r1, hp), Hp(7));
        }
    }

    #[test]
    fn swap_remove_moves_last_row() {
        let (types, pos, _hp) = registry_with_types();
        let mut pool = ChunkPool::new(4, 1024);
        let mut reg = ArchetypeRegistry::new(8);
        let id = reg.get_or_create(pos.bit(), &types, 1024).unwrap();
        let arch = reg.archetype_mut(id);

        for i in 0..3 {
            let (s, r) = arch.push_row(&mut pool, i).unwrap();
            unsafe { write_at(arch, &pool, s, r, pos, Pos { x: i as f64, y: 0.0 }) };
        }
        // Remove the middle row; entity 2 must move into it, values intact.
        let moved = arch.swap_remove_row(&mut pool, 0, 1);
        assert_eq!(moved, Some(2));
        assert_eq!(arch.len(), 2);
        assert_eq!(arch.entity_index_at(&pool, 0, 1), 2);
        unsafe {
            assert_eq!(read_at::<Pos>(arch, &pool, 0, 1, pos), Pos { x: 2.0, y: 0.0 });
        }
        // Removing the (new) last row moves nothing.
        assert_eq!(arch.swap_remove_row(&mut pool, 0, 1), None);
    }

    #[test]
    fn rows_spill_into_second_chunk() {
        let (types, pos, _) = registry_with_types();
        // Small chunks: 4 + 16 bytes per row, 64-byte chunk => 3 rows.
        let mut pool = ChunkPool::new(4, 64);
        let mut reg = ArchetypeRegistry::new(8);
        let id = reg.get_or_create(pos.bit(), &types, 64).unwrap();
        let arch = reg.archetype_mut(id);
        let rows = arch.layout().rows_per_chunk();

        for i in 0..=rows {
            arch.push_row(&mut pool, i).unwrap();
        }
        assert_eq!(arch.chunks().len(), 2);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn emptied_tail_chunk_returns_to_pool() {
        let (types, pos, _) = registry_with_types();
        let mut pool = ChunkPool::new(4, 64);
        let mut reg = ArchetypeRegistry::new(8);
        let id = reg.get_or_create(pos.bit(), &types, 64).unwrap();
        let arch = reg.archetype_mut(id);
        let rows = arch.layout().rows_per_chunk();

        // Fill chunk 0 and put one row into chunk 1.
        for i in 0..=rows {
            arch.push_row(&mut pool, i).unwrap();
        }
        let before = pool.free_count();
        arch.swap_remove_row(&mut pool, 1, 0);
        assert_eq!(arch.chunks().len(), 1);
        assert_eq!(pool.free_count(), before + 1);
    }

    #[test]
    fn registry_is_bounded_but_idempotent() {
        let (types, pos, hp) = registry_with_types();
        let mut reg = ArchetypeRegistry::new(2);
        let a = reg.get_or_create(pos.bit(), &types, 1024).unwrap();
        let b = reg.get_or_create(hp.bit(), &types, 1024).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            reg.get_or_create(pos.bit().union(hp.bit()), &types, 1024),
            Err(StoreError::ArchOverflow { max: 2 })
        ));
        // Existing bitsets still resolve after the failure.
        assert_eq!(reg.get_or_create(pos.bit(), &types, 1024).unwrap(), a);
        assert_eq!(reg.get(hp.bit()), Some(b));
    }
}

//! Typed queries over chunked storage.
//!
//! Queries resolve which archetypes contain the required component set and
//! yield `(Entity, (&C1, &C2, ...))` per matching row, walking archetype,
//! then chunk, then row.
//!
//! ## Soundness
//!
//! Read-only queries (`&T`) use [`Entities::query`] which takes `&self`.
//! Mutable queries (`&mut T`) use [`Entities::query_mut`] which takes
//! `&mut self`, guaranteeing exclusive access to the store and preventing
//! aliasing UB. [`CmdPool::for_each_par`](crate::pool::CmdPool::for_each_par)
//! reuses the same fetch path under its own exclusivity argument (disjoint
//! chunk partitions behind `&mut Entities`).

use crate::component::{Component, ComponentFlag, ComponentFlags};
use crate::entities::Entities;
use crate::entity::Entity;

// ---------------------------------------------------------------------------
// QueryItem -- one element of a query tuple
// ---------------------------------------------------------------------------

/// One element of a query fetch: `&T` (read) or `&mut T` (write).
pub trait QueryItem {
    /// The output type yielded per row.
    type Item<'w>;
    /// Whether this item borrows mutably.
    const MUTABLE: bool;
    /// The flag of the accessed component type, if registered.
    fn component_flag(store: &Entities) -> Option<ComponentFlag>;
    /// Fetch one item from a live row.
    ///
    /// For `&T` items this is safe with `&Entities`. For `&mut T` items the
    /// caller must guarantee exclusive access to the row (via `&mut Entities`
    /// at a higher level, or disjoint chunk partitioning).
    fn fetch(store: &Entities, arch: u32, chunk_slot: u32, row: u32) -> Self::Item<'_>;
}

impl<T: Component> QueryItem for &T {
    type Item<'w> = &'w T;
    const MUTABLE: bool = false;

    fn component_flag(store: &Entities) -> Option<ComponentFlag> {
        store.types().flag_of::<T>()
    }

    fn fetch(store: &Entities, arch: u32, chunk_slot: u32, row: u32) -> Self::Item<'_> {
        let flag = store.types().flag_of::<T>().unwrap();
        let ptr = store.arch_registry().archetypes()[arch as usize]
            .component_ptr(store.chunk_pool(), chunk_slot, row, flag)
            .unwrap();
        // Safety: the column for this flag stores T values; the row is live.
        #[allow(unsafe_code)]
        unsafe {
            &*(ptr as *const T)
        }
    }
}

// Safety of the mutable impl: only reachable through `Entities::query_mut`
// (which holds `&mut Entities`) or `CmdPool::for_each_par` (which holds
// `&mut Entities` and hands each worker disjoint chunks). In both cases no
// other reference to the row exists, making the cast sound.
impl<T: Component> QueryItem for &mut T {
    type Item<'w> = &'w mut T;
    const MUTABLE: bool = true;

    fn component_flag(store: &Entities) -> Option<ComponentFlag> {
        store.types().flag_of::<T>()
    }

    fn fetch(store: &Entities, arch: u32, chunk_slot: u32, row: u32) -> Self::Item<'_> {
        let flag = store.types().flag_of::<T>().unwrap();
        let ptr = store.arch_registry().archetypes()[arch as usize]
            .component_ptr(store.chunk_pool(), chunk_slot, row, flag)
            .unwrap();
        // Safety: exclusive access guaranteed by the caller, see above.
        #[allow(unsafe_code)]
        unsafe {
            &mut *(ptr as *mut T)
        }
    }
}

// ---------------------------------------------------------------------------
// Query -- a tuple of QueryItems
// ---------------------------------------------------------------------------

/// A tuple of query items: `(&A, &B)`, `(&mut A, &B)`, etc. (1 to 4 items).
pub trait Query {
    /// The per-row output type.
    type Item<'w>;
    /// Whether any item borrows mutably.
    const HAS_MUTABLE: bool;
    /// The required component set. `None` when some type was never
    /// registered (the query then matches nothing).
    fn required_flags(store: &Entities) -> Option<ComponentFlags>;
    /// Panic when the same component type is accessed mutably more than
    /// once, or both mutably and immutably.
    fn validate_access(store: &Entities);
    /// Fetch one row.
    fn fetch_row(store: &Entities, arch: u32, chunk_slot: u32, row: u32) -> Self::Item<'_>;
}

fn validate_no_access_conflicts(items: &[(bool, Option<ComponentFlag>)]) {
    let mut mutable: Vec<ComponentFlag> = Vec::new();
    let mut read: Vec<ComponentFlag> = Vec::new();
    for &(is_mutable, flag) in items {
        let Some(flag) = flag else { continue };
        if is_mutable {
            if mutable.contains(&flag) {
                panic!("query contains duplicate mutable access to the same component type");
            }
            if read.contains(&flag) {
                panic!(
                    "query contains overlapping read and mutable access to the same component type"
                );
            }
            mutable.push(flag);
        } else {
            if mutable.contains(&flag) {
                panic!(
                    "query contains overlapping read and mutable access to the same component type"
                );
            }
            read.push(flag);
        }
    }
}

macro_rules! impl_query_tuple {
    ($($name:ident),+) => {
        impl<$($name: QueryItem),+> Query for ($($name,)+) {
            type Item<'w> = ($($name::Item<'w>,)+);
            const HAS_MUTABLE: bool = $($name::MUTABLE)||+;

            fn required_flags(store: &Entities) -> Option<ComponentFlags> {
                let mut flags = ComponentFlags::EMPTY;
                $(flags.insert($name::component_flag(store)?);)+
                Some(flags)
            }

            fn validate_access(store: &Entities) {
                let items = [
                    $(($name::MUTABLE, $name::component_flag(store)),)+
                ];
                validate_no_access_conflicts(&items);
            }

            fn fetch_row(store: &Entities, arch: u32, chunk_slot: u32, row: u32) -> Self::Item<'_> {
                ($($name::fetch(store, arch, chunk_slot, row),)+)
            }
        }
    };
}

impl_query_tuple!(A);
impl_query_tuple!(A, B);
impl_query_tuple!(A, B, C);
impl_query_tuple!(A, B, C, D);

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Archetype indices whose bitsets satisfy `require` and avoid `without`.
pub(crate) fn matching_archetypes(
    store: &Entities,
    require: ComponentFlags,
    without: ComponentFlags,
) -> Vec<u32> {
    store
        .arch_registry()
        .archetypes()
        .iter()
        .filter(|a| a.flags().contains_all(require) && !a.flags().intersects(without))
        .map(|a| a.id().0)
        .collect()
}

/// Iterator yielding `(Entity, Q::Item)` for all matching rows.
pub struct QueryIter<'w, Q: Query> {
    store: &'w Entities,
    archetypes: Vec<u32>,
    arch_cursor: usize,
    chunk_cursor: u32,
    row_cursor: u32,
    _marker: std::marker::PhantomData<Q>,
}

impl<'w, Q: Query> QueryIter<'w, Q> {
    pub(crate) fn new(store: &'w Entities, archetypes: Vec<u32>) -> Self {
        Self {
            store,
            archetypes,
            arch_cursor: 0,
            chunk_cursor: 0,
            row_cursor: 0,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<'w, Q: Query> Iterator for QueryIter<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let arch_idx = *self.archetypes.get(self.arch_cursor)?;
            let arch = &self.store.arch_registry().archetypes()[arch_idx as usize];
            match arch.chunks().get(self.chunk_cursor as usize) {
                Some(slot) if self.row_cursor < slot.len => {
                    let row = self.row_cursor;
                    let chunk_slot = self.chunk_cursor;
                    self.row_cursor += 1;
                    let index = arch.entity_index_at(self.store.chunk_pool(), chunk_slot, row);
                    let entity = self.store.handle_for_index(index);
                    let item = Q::fetch_row(self.store, arch_idx, chunk_slot, row);
                    return Some((entity, item));
                }
                Some(_) => {
                    self.chunk_cursor += 1;
                    self.row_cursor = 0;
                }
                None => {
                    self.arch_cursor += 1;
                    self.chunk_cursor = 0;
                    self.row_cursor = 0;
                }
            }
        }
    }
}

/// Iterator yielding `(Entity, Q::Item)` for mutable queries.
///
/// Borrows `&mut Entities` at construction, so the lifetime `'w` is tied to
/// the exclusive borrow and `&mut T` items cannot alias.
pub struct QueryIterMut<'w, Q: Query> {
    inner: QueryIter<'w, Q>,
}

impl<'w, Q: Query> QueryIterMut<'w, Q> {
    /// The caller must derive `store` from a `&mut Entities` borrow covering `'w`.
    pub(crate) fn new(store: &'w Entities, archetypes: Vec<u32>) -> Self {
        Self {
            inner: QueryIter::new(store, archetypes),
        }
    }
}

impl<'w, Q: Query> Iterator for QueryIterMut<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

// ---------------------------------------------------------------------------
// Entities query methods
// ---------------------------------------------------------------------------

impl Entities {
    /// Run a read-only query over all matching entities.
    ///
    /// # Panics
    ///
    /// Panics if the query contains mutable items; use
    /// [`query_mut`](Self::query_mut) instead.
    ///
    /// ```ignore
    /// for (entity, (pos, vel)) in store.query::<(&Pos, &Vel)>() {
    ///     println!("{entity}: {pos:?} {vel:?}");
    /// }
    /// ```
    pub fn query<Q: Query>(&self) -> QueryIter<'_, Q> {
        assert!(
            !Q::HAS_MUTABLE,
            "Entities::query() cannot be used with mutable query items (&mut T). \
             Use Entities::query_mut() instead, which requires &mut self."
        );
        self.query_filtered::<Q>(ComponentFlags::EMPTY)
    }

    /// Read-only query that additionally skips archetypes containing any of
    /// the `without` flags.
    pub fn query_filtered<Q: Query>(&self, without: ComponentFlags) -> QueryIter<'_, Q> {
        assert!(!Q::HAS_MUTABLE, "use query_mut for mutable query items");
        let archetypes = match Q::required_flags(self) {
            Some(require) => matching_archetypes(self, require, without),
            None => Vec::new(),
        };
        QueryIter::new(self, archetypes)
    }

    /// Run a query that may mutate components, under exclusive store access.
    ///
    /// # Panics
    ///
    /// Panics if the same component type appears mutably more than once in
    /// the tuple.
    ///
    /// ```ignore
    /// for (_entity, (pos, vel)) in store.query_mut::<(&mut Pos, &Vel)>() {
    ///     pos.x += vel.dx;
    /// }
    /// ```
    pub fn query_mut<Q: Query>(&mut self) -> QueryIterMut<'_, Q> {
        Q::validate_access(self);
        let archetypes = match Q::required_flags(self) {
            Some(require) => matching_archetypes(self, require, ComponentFlags::EMPTY),
            None => Vec::new(),
        };
        QueryIterMut::new(self, archetypes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

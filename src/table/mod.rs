//! # Table
//!
//! Generational handles into slot arrays owned by the host process.
//!
//! The host allocates, recycles and relocates slots on its own schedule. Every slot carries a salt that changes each time the slot is reused,
//! and an [`Identity`] remembers the salt it was issued under. Resolving an identity checks the live salt on every access,
//! so holding on to an identity past the lifetime of the record it named fails with [`HandleError::StaleHandle`] instead of reading the new occupant.
//!
//! This module only ever reads slots. Layout is asked from a [`TableProvider`] on every call and never cached.

pub mod deref;
pub mod header;
pub mod tag;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use thiserror::Error;

pub use self::deref::{Bound, Dereferenceable, HostPtr};
pub use self::header::{HeaderProvider, TableHeader};
pub use self::tag::{Category, InvalidTag, Tag, Tagged};

/// Generation tag of a slot
pub type Salt = u16;

/// Salt of an unoccupied slot
pub const EMPTY: Salt = 0;

/// One cell of a host table
///
/// Mirrors the host's memory layout: the salt comes first, the record follows. The host's stride may be larger than this struct.
#[repr(C)]
pub struct Slot<T> {
    /// Live salt, [`EMPTY`] when the slot is free
    pub salt: Salt,
    /// The record
    pub payload: T,
}

/// Errors when resolving or looking up identities
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    /// The slot was recycled or freed since the identity was issued
    #[error("identity {index}:{salt:#06x} is stale (live salt {live:#06x})")]
    StaleHandle {
        /// Slot index
        index: u16,
        /// Salt captured by the identity
        salt: Salt,
        /// Salt currently in the slot
        live: Salt,
    },
    /// The index lies outside the table's current bounds
    #[error("index {index} is outside the table ({count} slots)")]
    OutOfRange {
        /// Slot index
        index: u16,
        /// Current slot count
        count: usize,
    },
    /// No occupied slot matched
    #[error("no matching entry")]
    NotFound,
    /// The host has not allocated the table
    #[error("table is not allocated")]
    Unavailable,
    /// The host's slot stride cannot hold a [`Slot<T>`]
    #[error("slot stride {stride} is smaller than the {required}-byte slot")]
    LayoutMismatch {
        /// Stride reported by the provider
        stride: usize,
        /// Size of the slot type
        required: usize,
    },
    /// A host pointer was null
    #[error("null host pointer")]
    Null,
}

/// Index and salt of one occupancy of a slot
///
/// Raw form packs the salt in the high half and the index in the low half; `0xFFFF_FFFF` is the host's "none".
pub struct Identity<T> {
    /// Slot index
    index: u16,
    /// Salt at issuance
    salt: Salt,
    /// Record type this identity names
    _marker: PhantomData<fn() -> T>,
}

impl<T> Identity<T> {
    /// Raw value the host uses for "no identity"
    pub const NONE: u32 = u32::MAX;

    /// Creates an identity from its parts
    pub const fn new(index: u16, salt: Salt) -> Self {
        Self {
            index,
            salt,
            _marker: PhantomData,
        }
    }

    /// Unpacks a raw identity, `None` for [`Self::NONE`]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::NONE {
            None
        } else {
            Some(Self::new(raw as u16, (raw >> 16) as Salt))
        }
    }

    /// Packs the identity the way the host stores it
    pub const fn to_raw(self) -> u32 {
        (self.salt as u32) << 16 | self.index as u32
    }

    /// Slot index
    pub const fn index(self) -> u16 {
        self.index
    }

    /// Salt captured when the identity was issued
    pub const fn salt(self) -> Salt {
        self.salt
    }

    /// Reinterprets the identity as naming a different record type
    pub const fn cast<U>(self) -> Identity<U> {
        Identity::new(self.index, self.salt)
    }
}

impl<T> Clone for Identity<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Identity<T> {}

impl<T> PartialEq for Identity<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.salt == other.salt
    }
}
impl<T> Eq for Identity<T> {}

impl<T> Hash for Identity<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_raw().hash(state);
    }
}

impl<T> fmt::Debug for Identity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}:{:#06x})", self.index, self.salt)
    }
}

/// Where a table's slots currently live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableLayout {
    /// Address of slot 0
    pub base: usize,
    /// Distance between consecutive slots
    pub stride: usize,
    /// Number of slots
    pub count: usize,
}

/// Reports the current layout of one host table
///
/// # Safety
///
/// A returned layout must describe `count` readable slots, `stride` bytes apart starting at `base`, each laid out as a [`Slot<T>`]
/// for the record type the table is used with. The memory must stay mapped while references handed out by [`HandleTable`] are alive.
pub unsafe trait TableProvider {
    /// Current layout, `None` while the host has no table allocated
    fn layout(&self) -> Option<TableLayout>;
}

unsafe impl<P: TableProvider + ?Sized> TableProvider for &P {
    fn layout(&self) -> Option<TableLayout> {
        (**self).layout()
    }
}

/// Typed, validating view over a host table
pub struct HandleTable<T, P> {
    /// Source of the table's layout
    provider: P,
    /// Record type
    _marker: PhantomData<fn() -> T>,
}

impl<T, P: TableProvider> HandleTable<T, P> {
    /// Creates a view over the table `provider` describes
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            _marker: PhantomData,
        }
    }

    /// The underlying provider
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Fetches and checks the current layout
    fn layout(&self) -> Result<TableLayout, HandleError> {
        let layout = self.provider.layout().ok_or(HandleError::Unavailable)?;
        let required = mem::size_of::<Slot<T>>();
        if layout.stride < required {
            return Err(HandleError::LayoutMismatch {
                stride: layout.stride,
                required,
            });
        }
        Ok(layout)
    }

    /// Pointer to slot `index`; the caller checks bounds
    fn slot(layout: &TableLayout, index: usize) -> *const Slot<T> {
        (layout.base + index * layout.stride) as *const Slot<T>
    }

    /// Reads a slot's salt in one shot
    ///
    /// # Safety
    ///
    /// `slot` must come from [`Self::slot`] with an in-bounds index
    unsafe fn live_salt(slot: *const Slot<T>) -> Salt {
        ptr::read_volatile(ptr::addr_of!((*slot).salt))
    }

    /// Number of slots the table currently has, `0` when unallocated
    pub fn len(&self) -> usize {
        self.layout().map_or(0, |layout| layout.count)
    }

    /// Returns `true` when the table has no slots
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves `identity` to its record.
    ///
    /// Succeeds only while the slot is occupied under the identity's salt.
    pub fn resolve(&self, identity: Identity<T>) -> Result<&T, HandleError> {
        let layout = self.layout()?;
        let index = identity.index();
        if usize::from(index) >= layout.count {
            return Err(HandleError::OutOfRange {
                index,
                count: layout.count,
            });
        }
        let slot = Self::slot(&layout, index.into());
        // Safety: the index is in bounds and the provider vouches for the layout
        unsafe {
            let live = Self::live_salt(slot);
            if live == EMPTY || live != identity.salt() {
                return Err(HandleError::StaleHandle {
                    index,
                    salt: identity.salt(),
                    live,
                });
            }
            Ok(&(*slot).payload)
        }
    }

    /// Returns `true` if `identity` currently resolves
    pub fn contains(&self, identity: Identity<T>) -> bool {
        self.resolve(identity).is_ok()
    }

    /// Iterates occupied slots whose record satisfies `predicate`.
    ///
    /// The layout is captured once, so the iterator is a snapshot. Identities it yields must be resolved again before later use.
    /// Fails with `Unavailable` or `LayoutMismatch` when the table cannot be walked at all.
    pub fn iter<F>(&self, predicate: F) -> Result<Iter<'_, T, P, F>, HandleError>
    where
        F: Fn(&T) -> bool,
    {
        Ok(Iter {
            table: self,
            layout: self.layout()?,
            next: 0,
            predicate,
        })
    }

    /// Iterates every occupied slot
    pub fn occupied(&self) -> Result<Iter<'_, T, P, fn(&T) -> bool>, HandleError> {
        let any: fn(&T) -> bool = |_| true;
        self.iter(any)
    }

    /// Binds `identity` to this table
    pub fn bind(&self, identity: Identity<T>) -> Bound<'_, T, P> {
        Bound::new(self, identity)
    }
}

/// Iterator over occupied slots, see [`HandleTable::iter`]
///
/// Cloning or calling [`Iter::restart`] starts over from slot 0 of the same snapshot.
pub struct Iter<'t, T, P, F> {
    /// Table being walked
    table: &'t HandleTable<T, P>,
    /// Layout at the time the iterator was created
    layout: TableLayout,
    /// Next slot index to look at
    next: usize,
    /// Filter on records
    predicate: F,
}

impl<T, P, F> Iter<'_, T, P, F> {
    /// Rewinds to the first slot
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl<T, P, F: Clone> Clone for Iter<'_, T, P, F> {
    fn clone(&self) -> Self {
        Self {
            table: self.table,
            layout: self.layout,
            next: 0,
            predicate: self.predicate.clone(),
        }
    }
}

impl<'t, T, P, F> Iterator for Iter<'t, T, P, F>
where
    P: TableProvider,
    F: Fn(&T) -> bool,
{
    type Item = (Identity<T>, &'t T);

    fn next(&mut self) -> Option<Self::Item> {
        let layout = self.layout;
        // identities only address the first 64k slots
        let count = layout.count.min(usize::from(u16::MAX) + 1);
        while self.next < count {
            let index = self.next;
            self.next += 1;
            let slot = HandleTable::<T, P>::slot(&layout, index);
            // Safety: the index is in bounds of the captured layout
            unsafe {
                let salt = HandleTable::<T, P>::live_salt(slot);
                if salt == EMPTY {
                    continue;
                }
                let record = &(*slot).payload;
                if (self.predicate)(record) {
                    return Some((Identity::new(index as u16, salt), record));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;
    use crate::testing::HostArray;

    #[derive(Default, Debug, PartialEq)]
    struct Unit {
        health: u32,
    }

    #[test]
    fn test_raw_identity() {
        let identity = Identity::<Unit>::new(3, 0xe174);
        assert_eq!(identity.to_raw(), 0xe174_0003);
        assert_eq!(Identity::<Unit>::from_raw(0xe174_0003), Some(identity));
        assert_eq!(Identity::<Unit>::from_raw(Identity::<Unit>::NONE), None);
    }

    #[test]
    fn test_resolve() {
        let host = HostArray::new(4);
        host.occupy(1, 5, Unit { health: 100 });
        let table = HandleTable::<Unit, _>::new(&host);

        assert_eq!(table.resolve(Identity::new(1, 5)), Ok(&Unit { health: 100 }));
        assert!(table.contains(Identity::new(1, 5)));
    }

    #[test]
    /// An identity issued before a recycle never resolves to the new occupant
    fn test_stale_handle() {
        let host = HostArray::new(4);
        host.occupy(2, 5, Unit { health: 100 });
        let table = HandleTable::<Unit, _>::new(&host);
        let identity = Identity::new(2, 5);
        assert!(table.resolve(identity).is_ok());

        host.vacate(2);
        assert_eq!(
            table.resolve(identity),
            Err(HandleError::StaleHandle {
                index: 2,
                salt: 5,
                live: EMPTY
            })
        );

        host.occupy(2, 7, Unit { health: 1 });
        assert_eq!(
            table.resolve(identity),
            Err(HandleError::StaleHandle {
                index: 2,
                salt: 5,
                live: 7
            })
        );
        assert_eq!(table.resolve(Identity::new(2, 7)), Ok(&Unit { health: 1 }));
    }

    #[test]
    fn test_empty_salt_never_resolves() {
        let host = HostArray::<Unit>::new(2);
        let table = HandleTable::<Unit, _>::new(&host);
        assert!(matches!(
            table.resolve(Identity::new(0, EMPTY)),
            Err(HandleError::StaleHandle { .. })
        ));
    }

    #[test]
    fn test_out_of_range() {
        let host = HostArray::new(4);
        host.occupy(3, 9, Unit::default());
        let table = HandleTable::<Unit, _>::new(&host);

        for salt in [EMPTY, 9, 0xffff] {
            assert_eq!(
                table.resolve(Identity::new(4, salt)),
                Err(HandleError::OutOfRange { index: 4, count: 4 })
            );
        }
    }

    /// Provider for a table the host has not allocated yet
    struct Unallocated;
    unsafe impl TableProvider for Unallocated {
        fn layout(&self) -> Option<TableLayout> {
            None
        }
    }

    #[test]
    fn test_unavailable() {
        let table = HandleTable::<Unit, _>::new(Unallocated);
        assert_eq!(table.resolve(Identity::new(0, 1)), Err(HandleError::Unavailable));
        assert!(table.is_empty());
        assert!(matches!(table.occupied(), Err(HandleError::Unavailable)));
    }

    /// Provider whose stride is too small for the record type
    struct Cramped(usize);
    unsafe impl TableProvider for Cramped {
        fn layout(&self) -> Option<TableLayout> {
            Some(TableLayout {
                base: self.0,
                stride: 2,
                count: 1,
            })
        }
    }

    #[test]
    fn test_layout_mismatch() {
        let table = HandleTable::<Unit, _>::new(Cramped(0x1000));
        assert_eq!(
            table.resolve(Identity::new(0, 1)),
            Err(HandleError::LayoutMismatch {
                stride: 2,
                required: mem::size_of::<Slot<Unit>>()
            })
        );
        assert!(matches!(
            table.iter(|unit: &Unit| unit.health > 0),
            Err(HandleError::LayoutMismatch { stride: 2, .. })
        ));
    }

    #[test]
    fn test_iter() {
        let host = HostArray::new(6);
        host.occupy(0, 1, Unit { health: 10 });
        host.occupy(2, 2, Unit { health: 0 });
        host.occupy(5, 3, Unit { health: 30 });
        let table = HandleTable::<Unit, _>::new(&host);

        let alive: Vec<_> = table
            .iter(|unit: &Unit| unit.health > 0)
            .unwrap()
            .map(|(identity, unit)| (identity, unit.health))
            .collect();
        assert_eq!(
            alive,
            [(Identity::new(0, 1), 10), (Identity::new(5, 3), 30)]
        );

        let mut iter = table.occupied().unwrap();
        assert_eq!(iter.by_ref().count(), 3);
        assert_eq!(iter.next(), None);
        iter.restart();
        assert_eq!(iter.clone().count(), 3);
        assert_eq!(iter.count(), 3);
    }

    #[test]
    /// Identities yielded by an earlier pass go stale when the host recycles behind it
    fn test_iter_snapshot_revalidation() {
        let host = HostArray::new(2);
        host.occupy(1, 4, Unit { health: 5 });
        let table = HandleTable::<Unit, _>::new(&host);

        let (identity, _) = table.occupied().unwrap().next().unwrap();
        host.occupy(1, 6, Unit { health: 8 });
        assert!(table.resolve(identity).is_err());
    }
}

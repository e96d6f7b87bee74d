//! Uniform access to host records through wrappers that may fail to dereference

use std::fmt;

use super::{HandleError, HandleTable, Identity, TableProvider};

/// Wrappers that lead to a record which may no longer be there
///
/// Everything goes through one explicit accessor; nothing dereferences implicitly.
pub trait Dereferenceable {
    /// Record type
    type Target: ?Sized;

    /// Reaches the record, checking whatever validity the wrapper tracks
    fn try_deref(&self) -> Result<&Self::Target, HandleError>;

    /// Returns `true` if the record is currently reachable
    fn is_live(&self) -> bool {
        self.try_deref().is_ok()
    }

    /// Applies `f` to the record if it is reachable
    fn with<R>(&self, f: impl FnOnce(&Self::Target) -> R) -> Result<R, HandleError> {
        self.try_deref().map(f)
    }
}

/// An identity bound to the table it came from; every access resolves it again
pub struct Bound<'t, T, P> {
    /// Table the identity belongs to
    table: &'t HandleTable<T, P>,
    /// Identity to resolve
    identity: Identity<T>,
}

impl<'t, T, P> Bound<'t, T, P> {
    /// Binds `identity` to `table`
    pub fn new(table: &'t HandleTable<T, P>, identity: Identity<T>) -> Self {
        Self { table, identity }
    }

    /// The bound identity
    pub fn identity(&self) -> Identity<T> {
        self.identity
    }
}

impl<T, P> Clone for Bound<'_, T, P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T, P> Copy for Bound<'_, T, P> {}

impl<T, P: TableProvider> Dereferenceable for Bound<'_, T, P> {
    type Target = T;

    fn try_deref(&self) -> Result<&T, HandleError> {
        self.table.resolve(self.identity)
    }
}

impl<T, P> fmt::Debug for Bound<'_, T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Bound").field(&self.identity).finish()
    }
}

/// Typed pointer into host memory
pub struct HostPtr<T> {
    /// Address of the record, possibly null
    ptr: *const T,
}

impl<T> HostPtr<T> {
    /// Wraps a host pointer
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must point to a valid `T` that outlives the wrapper
    pub unsafe fn new(ptr: *const T) -> Self {
        Self { ptr }
    }

    /// Returns `true` if the pointer is null
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// The raw pointer
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }
}

impl<T> Dereferenceable for HostPtr<T> {
    type Target = T;

    fn try_deref(&self) -> Result<&T, HandleError> {
        // Safety: validity of non-null pointers is guaranteed by the caller of `new`
        unsafe { self.ptr.as_ref() }.ok_or(HandleError::Null)
    }
}

impl<T> fmt::Debug for HostPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostPtr({:p})", self.ptr)
    }
}

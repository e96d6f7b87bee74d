//! Tables described by a header living in host memory
//!
//! Hosts typically keep a global pointer to a header that records the table's capacity, slot size and data pointer.
//! The header belongs to the host, which may reallocate it or the slot data at any time, so both are re-read on every call.

use std::ffi::CStr;
use std::ptr;

use super::{Dereferenceable, HostPtr, TableLayout, TableProvider};

/// Bookkeeping the host keeps for one table
///
/// Only interpreted here; the host is the sole writer.
#[repr(C)]
#[derive(Debug)]
pub struct TableHeader {
    /// NUL-terminated table name
    pub name: [u8; 32],
    /// Number of slots
    pub capacity: u16,
    /// Size of one slot in bytes
    pub stride: u16,
    /// Number of occupied slots
    pub active: u16,
    /// Where the host will look for a free slot next
    pub next_free: u16,
    /// Slot data, null until the host allocates the table
    pub data: *mut u8,
}

impl TableHeader {
    /// Table name up to the first NUL, empty if it is not valid UTF-8
    pub fn name(&self) -> &str {
        CStr::from_bytes_until_nul(&self.name)
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or_default()
    }

    /// Slot layout described by the header, `None` without slot data
    pub fn layout(&self) -> Option<TableLayout> {
        if self.data.is_null() {
            return None;
        }
        Some(TableLayout {
            base: self.data as usize,
            stride: self.stride.into(),
            count: self.capacity.into(),
        })
    }

    /// Index the host will try next when allocating
    pub fn free_hint(&self) -> u16 {
        self.next_free
    }
}

/// Provider reading a host global that points to a [`TableHeader`]
pub struct HeaderProvider {
    /// Address of the host's `TableHeader *` variable
    global: usize,
}

impl HeaderProvider {
    /// Creates a provider for the header pointer stored at `global`
    ///
    /// # Safety
    ///
    /// `global` must stay readable as a pointer, and whenever that pointer is non-null it must point to a live [`TableHeader`]
    /// describing slot data that stays mapped while records resolved through it are in use.
    pub unsafe fn new(global: usize) -> Self {
        Self { global }
    }

    /// The header the host currently publishes
    pub fn header(&self) -> HostPtr<TableHeader> {
        // Safety: guaranteed by the caller of `new`
        unsafe {
            let header = ptr::read_volatile(self.global as *const *const TableHeader);
            HostPtr::new(header)
        }
    }
}

unsafe impl TableProvider for HeaderProvider {
    fn layout(&self) -> Option<TableLayout> {
        let header = self.header();
        header.try_deref().ok()?.layout()
    }
}

//! This module contains a byte patcher

use std::ptr;

use super::{MemoryError, Patcher};

/// Patcher that copies bytes directly to and from memory.
/// This patcher never fails; the target range must already be readable and writable.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}

unsafe impl Patcher for BytePatcher {
    unsafe fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        // Safety: caller must pass in an `address` that is valid for the full length of `buf`
        ptr::copy(address as *const u8, buf.as_mut_ptr(), buf.len());
        Ok(())
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        // Safety: caller must ensure that `address` is writable
        ptr::copy(bytes.as_ptr(), address as *mut u8, bytes.len());
        Ok(())
    }
}

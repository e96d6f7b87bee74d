//! # Patcher
//!
//! This module covers patchers, which read and write raw bytes in the host process.
//! Everything that touches process memory on behalf of a [`Patch`](crate::patch::Patch) goes through a [`Patcher`].

pub mod byte;
pub mod mem;

use thiserror::Error;

/// Errors raised by a [`Patcher`] while accessing memory
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    Protection(#[from] region::Error),
    /// The range is not backed by accessible memory
    #[error("memory at 0x{address:X} (size: {len}) is not accessible")]
    Unmapped {
        /// Start of the inaccessible range
        address: usize,
        /// Length of the requested access
        len: usize,
    },
    /// The writer refused to modify the range
    #[error("write to 0x{address:X} (size: {len}) was rejected")]
    Rejected {
        /// Start of the rejected range
        address: usize,
        /// Length of the rejected write
        len: usize,
    },
}

/// Reads and writes bytes at arbitrary addresses of the current process
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that `read` and `write` touch exactly the requested range
/// and report failure instead of faulting whenever it can detect an inaccessible range.
pub unsafe trait Patcher: Send + Sync {
    /// Copies `buf.len()` bytes starting at `address` into `buf`.
    ///
    /// # Safety
    ///
    /// `address` must be valid for reads of `buf.len()` bytes, unless the implementor documents otherwise
    unsafe fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copies `bytes` to `address`.
    ///
    /// # Safety
    ///
    /// `address` must be valid for writes of `bytes.len()` bytes, and nothing tracked by Rust may alias the range
    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError>;
}

unsafe impl<P: Patcher + ?Sized> Patcher for &P {
    unsafe fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read(address, buf)
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        (**self).write(address, bytes)
    }
}

//! This module contains a patcher which adjusts memory permissions to patch read-only code

use region::Protection;

use super::{MemoryError, Patcher};

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the access, and then reverting the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the length of the access to determine how many pages to change permissions for,
/// pairing `PermissionWrapper` with a patcher that touches more memory than requested is undefined behavior.
///
/// As always, casting a `&T` or `&mut T` to an address for use with `PermissionWrapper` can result in undefined behavior because rust assumes `&T` will never change and `&mut T` will only be changed via that reference.
/// The address **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

/// Maps `region` failures for the range at `address` onto [`MemoryError`]
fn classify(address: usize, len: usize) -> impl Fn(region::Error) -> MemoryError {
    move |e| match e {
        region::Error::UnmappedRegion => MemoryError::Unmapped { address, len },
        e => MemoryError::Protection(e),
    }
}

unsafe impl<P: Patcher> Patcher for PermissionWrapper<P> {
    unsafe fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        if buf.is_empty() {
            return Ok(());
        }
        let ptr = address as *const u8;
        let mut readable = true;
        for region in region::query_range(ptr, buf.len()).map_err(classify(address, buf.len()))? {
            let region = region.map_err(classify(address, buf.len()))?;
            readable &= region.protection().contains(Protection::READ);
        }
        if readable {
            return self.patcher.read(address, buf);
        }
        let _guard = region::protect_with_handle(ptr, buf.len(), Protection::all())
            .map_err(classify(address, buf.len()))?;
        self.patcher.read(address, buf)
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        if bytes.is_empty() {
            return Ok(());
        }
        // the guard puts the original protection back once the write is done
        let _guard = region::protect_with_handle(address as *const u8, bytes.len(), Protection::all())
            .map_err(classify(address, bytes.len()))?;
        self.patcher.write(address, bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::hint::black_box;

    use region::Protection;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::mem::PermissionWrapper;
    use crate::patcher::{MemoryError, Patcher};

    /// Global immutables are stored in a read-only section in the binary
    static DATA: [u8; 4] = *b"1234";

    /// Asserts that nothing in the range is writable
    fn assert_read_only(address: usize, len: usize) {
        for region in region::query_range(address as *const u8, len).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert!(!region.protection().contains(Protection::WRITE));
        }
    }

    #[test]
    /// Test write and read-back functionality on writable memory
    fn test_write() {
        let mut data = vec![1u8, 2, 3, 4].into_boxed_slice();
        let address = data.as_mut_ptr() as usize;

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        unsafe { wrapper.write(address, &[4, 3, 2, 1]).unwrap() };

        let mut read = [0u8; 4];
        unsafe { wrapper.read(address, &mut read).unwrap() };
        assert_eq!(read, [4, 3, 2, 1]);
    }

    #[test]
    /// Tests to ensure permissions are actually set and reverted
    fn test_perms() {
        // Normally, writing to this global would result in a segfault, but PermissionWrapper changes the permissions to be writable so that no fault occurs
        let address = black_box(DATA.as_ptr()) as usize;
        let size = DATA.len();
        let wrapper = PermissionWrapper::new(BytePatcher::new());

        // sanity check
        let mut read = [0u8; 4];
        unsafe { wrapper.read(address, &mut read).unwrap() };
        assert_eq!(read, *b"1234");
        assert_read_only(address, size);

        unsafe { wrapper.write(address, &[4, 3, 2, 1]).unwrap() };
        unsafe { wrapper.read(address, &mut read).unwrap() };
        assert_eq!(read, [4, 3, 2, 1]);

        // make sure permissions reverted correctly after the write
        assert_read_only(address, size);

        // put the original data back so the static is untouched for anything else
        unsafe { wrapper.write(address, b"1234").unwrap() };
        unsafe { wrapper.read(address, &mut read).unwrap() };
        assert_eq!(read, *b"1234");
        assert_read_only(address, size);
    }

    #[test]
    /// Writes to an unmapped page are reported instead of faulting
    fn test_unmapped() {
        let wrapper = PermissionWrapper::new(BytePatcher::new());
        let result = unsafe { wrapper.write(0x10, &[0xCC]) };
        assert!(matches!(
            result,
            Err(MemoryError::Unmapped { .. }) | Err(MemoryError::Protection(_))
        ));
    }
}

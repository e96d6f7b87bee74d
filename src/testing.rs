//! Test fixtures: a simulated address space and a host-owned slot array

use std::mem;
use std::ops::Range;
use std::ptr;
use std::sync::Mutex;

use crate::patcher::{MemoryError, Patcher};
use crate::table::{Salt, Slot, TableLayout, TableProvider, EMPTY};

/// Address space backed by a plain buffer mapped at `base`
///
/// Writes overlapping a read-only range are rejected before any byte changes, and every accepted write is logged.
pub(crate) struct FakeMemory {
    /// Address of the first byte
    base: usize,
    /// Contents
    bytes: Mutex<Vec<u8>>,
    /// Ranges that reject writes
    read_only: Mutex<Vec<Range<usize>>>,
    /// Start address of every accepted write
    writes: Mutex<Vec<usize>>,
    /// Writes left before every further write is rejected, unlimited when `None`
    budget: Mutex<Option<usize>>,
}

impl FakeMemory {
    /// Maps `len` bytes of `int3` at `base`
    pub fn new(base: usize, len: usize) -> Self {
        Self {
            base,
            bytes: Mutex::new(vec![0xcc; len]),
            read_only: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            budget: Mutex::new(None),
        }
    }

    /// Sets memory without going through the patcher
    pub fn set(&self, address: usize, data: &[u8]) {
        let offset = address - self.base;
        self.bytes.lock().unwrap()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Reads memory without going through the patcher
    pub fn get(&self, address: usize, len: usize) -> Vec<u8> {
        let offset = address - self.base;
        self.bytes.lock().unwrap()[offset..offset + len].to_vec()
    }

    /// Makes `range` reject writes
    pub fn protect(&self, range: Range<usize>) {
        self.read_only.lock().unwrap().push(range);
    }

    /// Makes everything writable again
    pub fn unprotect(&self) {
        self.read_only.lock().unwrap().clear();
    }

    /// Accepts `count` more writes, then rejects all of them
    pub fn fail_writes_after(&self, count: usize) {
        *self.budget.lock().unwrap() = Some(count);
    }

    /// Start addresses of every accepted write, in order
    pub fn writes(&self) -> Vec<usize> {
        self.writes.lock().unwrap().clone()
    }

    /// Resolves `address..address + len` to buffer offsets
    fn offsets(&self, address: usize, len: usize) -> Result<Range<usize>, MemoryError> {
        let size = self.bytes.lock().unwrap().len();
        let start = address.checked_sub(self.base);
        match start {
            Some(start) if start + len <= size => Ok(start..start + len),
            _ => Err(MemoryError::Unmapped { address, len }),
        }
    }
}

unsafe impl Patcher for FakeMemory {
    unsafe fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.offsets(address, buf.len())?;
        buf.copy_from_slice(&self.bytes.lock().unwrap()[range]);
        Ok(())
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let range = self.offsets(address, bytes.len())?;
        let end = address + bytes.len();
        let rejected = self
            .read_only
            .lock()
            .unwrap()
            .iter()
            .any(|ro| ro.start < end && address < ro.end);
        let mut budget = self.budget.lock().unwrap();
        if rejected || *budget == Some(0) {
            return Err(MemoryError::Rejected {
                address,
                len: bytes.len(),
            });
        }
        if let Some(left) = budget.as_mut() {
            *left -= 1;
        }
        self.bytes.lock().unwrap()[range].copy_from_slice(bytes);
        self.writes.lock().unwrap().push(address);
        Ok(())
    }
}

/// Slot array standing in for a table owned by the host process
///
/// Tests play the host's part by occupying and recycling slots through `&self`, the way the host mutates memory the crate only reads.
pub(crate) struct HostArray<T> {
    /// Slot storage, owned by this struct
    slots: *mut Slot<T>,
    /// Number of slots
    count: usize,
}

impl<T: Default> HostArray<T> {
    /// Allocates `count` empty slots
    pub fn new(count: usize) -> Self {
        let slots: Box<[Slot<T>]> = (0..count)
            .map(|_| Slot {
                salt: EMPTY,
                payload: T::default(),
            })
            .collect();
        Self {
            slots: Box::into_raw(slots) as *mut Slot<T>,
            count,
        }
    }
}

impl<T> HostArray<T> {
    /// Places `payload` in slot `index` under `salt`
    pub fn occupy(&self, index: usize, salt: Salt, payload: T) {
        assert!(index < self.count);
        unsafe {
            let slot = self.slots.add(index);
            let old = mem::replace(&mut (*slot).payload, payload);
            drop(old);
            ptr::write_volatile(ptr::addr_of_mut!((*slot).salt), salt);
        }
    }

    /// Marks slot `index` free
    pub fn vacate(&self, index: usize) {
        assert!(index < self.count);
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.slots.add(index)).salt), EMPTY) };
    }
}

impl<T> Drop for HostArray<T> {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.slots, self.count)));
        }
    }
}

unsafe impl<T> TableProvider for HostArray<T> {
    fn layout(&self) -> Option<TableLayout> {
        Some(TableLayout {
            base: self.slots as usize,
            stride: mem::size_of::<Slot<T>>(),
            count: self.count,
        })
    }
}

//! # Trampoline
//!
//! Executable copies of detoured code, so the original behaviour stays reachable while a detour is installed

use std::ptr;

use region::Protection;

use crate::code::x64::{jmp_abs, JMP_ABS_LEN};

/// Relocated copy of the bytes a detour replaced, followed by an absolute jump back to the rest of the original code
///
/// The bytes are copied verbatim. Whoever requests a trampoline guarantees they form whole, position-independent instructions.
pub struct Trampoline {
    /// Executable buffer holding the copied code
    buffer: region::Allocation,
    /// Number of meaningful bytes in `buffer`
    len: usize,
}

// The buffer is only written while building and is read-only afterwards
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    /// Builds a trampoline executing `original` and then jumping to `resume`
    pub fn build(original: &[u8], resume: usize) -> Result<Self, region::Error> {
        let len = original.len() + JMP_ABS_LEN;
        let mut buffer = region::alloc(len, Protection::READ_WRITE)?;
        let jmp = jmp_abs(resume);
        unsafe {
            let data = buffer.as_mut_ptr::<u8>();
            // Safety: `buffer` was just allocated with room for both copies
            ptr::copy_nonoverlapping(original.as_ptr(), data, original.len());
            ptr::copy_nonoverlapping(jmp.as_ptr(), data.add(original.len()), JMP_ABS_LEN);
            region::protect(data as *const u8, len, Protection::READ_EXECUTE)?;
        }
        Ok(Self { buffer, len })
    }

    /// Returns a pointer to the relocated code.
    ///
    /// This pointer is directly callable and will act as if you're calling the original unpatched code
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    /// Length of the relocated code including the jump back
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the trampoline holds no code, which never happens for a built trampoline
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The trampoline's code as bytes
    pub fn code(&self) -> &[u8] {
        // Safety: `len` bytes were initialized in `build` and the buffer stays readable
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }
}

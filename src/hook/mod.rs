//! # Hook
//!
//! This module covers detours, which redirect execution from one location to another

pub mod trampoline;

use crate::code::x64::{call_abs, call_rel32, jmp_abs, jmp_rel32, NOP};

pub use self::trampoline::Trampoline;

/// How a detour transfers control to its destination
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Execution continues at the destination and never comes back to the patch site
    Jump,
    /// The destination is called and execution resumes right after the patch site
    Call,
}

/// Redirects execution at a patch site to `destination`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Detour {
    /// Where execution is sent
    pub destination: usize,
    /// Transfer kind
    pub flow: Flow,
    /// Whether to build a [`Trampoline`] so the replaced code stays callable
    pub trampoline: bool,
}

impl Detour {
    /// Creates a detour jumping to `destination`
    pub fn jump(destination: usize) -> Self {
        Self {
            destination,
            flow: Flow::Jump,
            trampoline: false,
        }
    }

    /// Creates a detour calling `destination`
    pub fn call(destination: usize) -> Self {
        Self {
            destination,
            flow: Flow::Call,
            trampoline: false,
        }
    }

    /// Requests a trampoline for the replaced code
    pub fn with_trampoline(mut self) -> Self {
        self.trampoline = true;
        self
    }

    /// Encodes this detour for placement at `source`.
    ///
    /// A 5-byte relative branch is used when the destination is in range, the absolute form otherwise.
    /// The result is padded with `nop`s up to `min_len` so no partial instruction is left behind.
    pub fn encode(&self, source: usize, min_len: usize) -> Vec<u8> {
        let mut code = match self.flow {
            Flow::Jump => jmp_rel32(source, self.destination)
                .map(Vec::from)
                .unwrap_or_else(|| jmp_abs(self.destination).into()),
            Flow::Call => call_rel32(source, self.destination)
                .map(Vec::from)
                .unwrap_or_else(|| call_abs(self.destination).into()),
        };
        if code.len() < min_len {
            code.resize(min_len, NOP);
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::x64::{CALL_ABS_LEN, JMP_ABS_LEN};

    #[test]
    fn test_encode_near() {
        let code = Detour::jump(0x2000).encode(0x1000, 7);
        assert_eq!(code, [0xe9, 0xfb, 0x0f, 0x00, 0x00, NOP, NOP]);

        let code = Detour::call(0x1000).encode(0x1000, 0);
        assert_eq!(code, [0xe8, 0xfb, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_encode_far() {
        let far = 0x7fff_0000_0000;
        let code = Detour::jump(far).encode(0x1000, 5);
        assert_eq!(code.len(), JMP_ABS_LEN);
        assert_eq!(code[..2], [0xff, 0x25]);

        let code = Detour::call(far).encode(0x1000, 5);
        assert_eq!(code.len(), CALL_ABS_LEN);
        assert_eq!(code[..2], [0xff, 0x15]);
    }
}

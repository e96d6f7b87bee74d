//! # Patch
//!
//! A patch is a single reversible modification of process memory at a fixed address.
//! [`PatchDescriptor`]s describe what should change, [`Patch::apply`] performs the change and keeps everything needed to undo it.

use std::borrow::Cow;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::hook::{Detour, Trampoline};
use crate::patcher::{MemoryError, Patcher};

/// What a patch writes at its target
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replacement {
    /// Literal bytes
    Bytes(Cow<'static, [u8]>),
    /// A control flow redirection, encoded for the target address when applied
    Detour(Detour),
}

/// Immutable description of a patch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchDescriptor {
    /// Identifier reported when this patch fails to install
    pub id: Cow<'static, str>,
    /// Address to modify
    pub target: usize,
    /// Bytes that must be present at `target` before patching
    pub expected: Cow<'static, [u8]>,
    /// What to write at `target`
    pub replacement: Replacement,
}

impl PatchDescriptor {
    /// Describes a literal byte replacement
    pub fn bytes(
        id: impl Into<Cow<'static, str>>,
        target: usize,
        expected: impl Into<Cow<'static, [u8]>>,
        replacement: impl Into<Cow<'static, [u8]>>,
    ) -> Self {
        Self {
            id: id.into(),
            target,
            expected: expected.into(),
            replacement: Replacement::Bytes(replacement.into()),
        }
    }

    /// Describes a detour replacing `expected` at `target`
    pub fn detour(
        id: impl Into<Cow<'static, str>>,
        target: usize,
        expected: impl Into<Cow<'static, [u8]>>,
        detour: Detour,
    ) -> Self {
        Self {
            id: id.into(),
            target,
            expected: expected.into(),
            replacement: Replacement::Detour(detour),
        }
    }

    /// Produces the bytes this descriptor writes at its target
    pub fn encode(&self) -> Cow<'_, [u8]> {
        match &self.replacement {
            Replacement::Bytes(bytes) => Cow::Borrowed(bytes),
            Replacement::Detour(detour) => {
                Cow::Owned(detour.encode(self.target, self.expected.len()))
            }
        }
    }
}

/// Errors raised while applying or restoring a patch
#[derive(Debug, Error)]
pub enum PatchError {
    /// The target does not hold the expected bytes; it is already patched or the host is a different build
    #[error("bytes at 0x{target:X} do not match: expected {expected:02X?}, found {found:02X?}")]
    VerificationMismatch {
        /// Patch target
        target: usize,
        /// Bytes the descriptor expected
        expected: Vec<u8>,
        /// Bytes actually present
        found: Vec<u8>,
    },
    /// The target could not be read
    #[error("failed to read memory at 0x{address:X}")]
    ReadFailure {
        /// Start of the read
        address: usize,
        /// Underlying memory error
        source: MemoryError,
    },
    /// The target could not be written
    #[error("failed to write memory at 0x{address:X}")]
    WriteFailure {
        /// Start of the write
        address: usize,
        /// Underlying memory error
        source: MemoryError,
    },
    /// Memory read back after a restore differs from the saved bytes
    #[error("restored bytes at 0x{target:X} did not stick")]
    RestoreMismatch {
        /// Patch target
        target: usize,
    },
    /// A detour needing a trampoline does not fit in the bytes it replaces
    #[error("detour at 0x{target:X} needs {needed} bytes but only {available} are replaced")]
    DetourTooLong {
        /// Patch target
        target: usize,
        /// Size of the encoded detour
        needed: usize,
        /// Size of the expected original bytes
        available: usize,
    },
    /// Executable memory for a trampoline could not be set up
    #[error("failed to build trampoline")]
    Trampoline(#[from] region::Error),
}

/// An applied patch
///
/// Owns the only copy of the bytes it overwrote. Restoring is idempotent.
/// Dropping a patch that is still installed leaks its trampoline, since the patched code may still jump into it.
pub struct Patch {
    /// Identifier copied from the descriptor
    id: Cow<'static, str>,
    /// Patched address
    target: usize,
    /// Bytes that were at `target` before patching, as long as the replacement
    original: Box<[u8]>,
    /// Whether the replacement is currently in place
    installed: AtomicBool,
    /// Callable copy of the replaced code, for detours that asked for one
    trampoline: Option<Trampoline>,
}

impl Patch {
    /// Verifies and applies `descriptor`.
    ///
    /// Reads enough bytes to cover both the expected original and the replacement, checks the expected prefix,
    /// builds a trampoline if requested, then writes the replacement.
    ///
    /// # Safety
    ///
    /// `descriptor.target` must be valid for the supplied patcher for the full length of the patch,
    /// and nothing may execute the range while it is being rewritten.
    pub unsafe fn apply<P: Patcher + ?Sized>(
        descriptor: &PatchDescriptor,
        patcher: &P,
    ) -> Result<Self, PatchError> {
        let target = descriptor.target;
        let expected: &[u8] = &descriptor.expected;
        let replacement = descriptor.encode();

        let mut original = vec![0u8; replacement.len().max(expected.len())];
        patcher
            .read(target, &mut original)
            .map_err(|source| PatchError::ReadFailure {
                address: target,
                source,
            })?;
        if original[..expected.len()] != *expected {
            return Err(PatchError::VerificationMismatch {
                target,
                expected: expected.to_vec(),
                found: original[..expected.len()].to_vec(),
            });
        }

        let trampoline = match &descriptor.replacement {
            Replacement::Detour(detour) if detour.trampoline => {
                if replacement.len() > expected.len() {
                    return Err(PatchError::DetourTooLong {
                        target,
                        needed: replacement.len(),
                        available: expected.len(),
                    });
                }
                Some(Trampoline::build(expected, target + expected.len())?)
            }
            _ => None,
        };

        // only what gets overwritten needs to come back
        original.truncate(replacement.len());

        patcher
            .write(target, &replacement)
            .map_err(|source| PatchError::WriteFailure {
                address: target,
                source,
            })?;
        debug!(patch = %descriptor.id, target, len = replacement.len(), "applied patch");

        Ok(Self {
            id: descriptor.id.clone(),
            target,
            original: original.into_boxed_slice(),
            installed: AtomicBool::new(true),
            trampoline,
        })
    }

    /// Writes the saved bytes back if the patch is installed; does nothing otherwise.
    ///
    /// With `verify` set, the bytes are read back and compared. A failed restore leaves the patch marked installed so it can be retried.
    ///
    /// # Safety
    ///
    /// The target must still be valid for `patcher`, and reverting must be safe for whatever currently executes there.
    pub unsafe fn restore<P: Patcher + ?Sized>(
        &self,
        patcher: &P,
        verify: bool,
    ) -> Result<(), PatchError> {
        if !self.is_installed() {
            return Ok(());
        }
        patcher
            .write(self.target, &self.original)
            .map_err(|source| PatchError::WriteFailure {
                address: self.target,
                source,
            })?;
        if verify {
            let mut check = vec![0u8; self.original.len()];
            patcher
                .read(self.target, &mut check)
                .map_err(|source| PatchError::ReadFailure {
                    address: self.target,
                    source,
                })?;
            if *check != *self.original {
                return Err(PatchError::RestoreMismatch {
                    target: self.target,
                });
            }
        }
        self.installed.store(false, Ordering::Release);
        debug!(patch = %self.id, target = self.target, "restored patch");
        Ok(())
    }

    /// Identifier of the descriptor this patch was applied from
    pub fn id(&self) -> &Cow<'static, str> {
        &self.id
    }

    /// Patched address
    pub fn target(&self) -> usize {
        self.target
    }

    /// Bytes the patch overwrote
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Number of bytes the patch overwrote
    pub fn len(&self) -> usize {
        self.original.len()
    }

    /// Returns `true` for a patch that wrote nothing
    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    /// Whether the replacement is currently in place
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Callable copy of the replaced code, if the patch is a detour that requested one
    pub fn trampoline(&self) -> Option<&Trampoline> {
        self.trampoline.as_ref()
    }
}

impl Drop for Patch {
    fn drop(&mut self) {
        if !self.is_installed() {
            return;
        }
        if let Some(trampoline) = self.trampoline.take() {
            warn!(patch = %self.id, target = self.target, "dropping installed patch, leaking its trampoline");
            mem::forget(trampoline);
        }
    }
}

impl std::fmt::Debug for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patch")
            .field("id", &self.id)
            .field("target", &format_args!("{:#x}", self.target))
            .field("original", &self.original)
            .field("installed", &self.is_installed())
            .finish()
    }
}

//! # Manager
//!
//! Owns every installed [`Patch`] and unwinds them as a whole.
//!
//! Patches are installed in batches that either apply completely or leave no trace, and are torn down last-installed-first.
//! The registry only ever grows at its tail and never moves what it already holds, so a [`PatchGroup`] handed out by
//! one install can be read without locking while other installs continue.

use std::borrow::Cow;
use std::slice;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::patch::{Patch, PatchDescriptor, PatchError};
use crate::patcher::byte::BytePatcher;
use crate::patcher::mem::PermissionWrapper;
use crate::patcher::Patcher;

/// Behaviour knobs for a [`PatchManager`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Read memory back after every restore and report bytes that did not stick
    pub verify_restore: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            verify_restore: true,
        }
    }
}

/// A batch install failed
///
/// Everything the batch applied before the failure has been rolled back, except the patches listed in `unrolled`,
/// whose restore failed as well and which are still in place at their targets.
#[derive(Debug, Error)]
#[error("patch `{id}` (#{position} in batch) failed to install")]
pub struct BatchError {
    /// Identifier of the failing descriptor
    pub id: Cow<'static, str>,
    /// Position of the failing descriptor within the batch
    pub position: usize,
    /// Why it failed
    pub source: PatchError,
    /// Identifiers of earlier patches from the batch that could not be rolled back, newest first
    pub unrolled: Vec<Cow<'static, str>>,
}

impl BatchError {
    /// Returns `true` if the batch left nothing applied
    pub fn is_clean(&self) -> bool {
        self.unrolled.is_empty()
    }
}

/// Contiguous run of patches installed by one batch
///
/// Does not own the patches. A group stops resolving once the manager is torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchGroup {
    /// Registry index of the first patch
    start: usize,
    /// Number of patches
    len: usize,
    /// Teardown epoch the group was issued in
    epoch: u64,
}

impl PatchGroup {
    /// Number of patches in the group
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a group from an empty batch
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Outcome of restoring a run of patches
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Patches that are no longer installed
    pub restored: usize,
    /// Identifiers of patches whose restore failed
    pub failed: Vec<Cow<'static, str>>,
}

impl TeardownReport {
    /// Returns `true` if every patch was restored
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registry of installed patches
///
/// `install_batch` and `teardown` are serialized by one lock held for their full duration.
pub struct PatchManager<P: Patcher> {
    /// Writer used for every apply and restore
    patcher: P,
    /// Behaviour knobs
    config: ManagerConfig,
    /// Every patch ever installed, in installation order
    patches: boxcar::Vec<Patch>,
    /// Index of the first live patch; everything before it was torn down
    base: AtomicUsize,
    /// Bumped by every teardown that retires patches
    epoch: AtomicU64,
    /// Serializes mutation
    lock: Mutex<()>,
}

impl<P: Patcher> PatchManager<P> {
    /// Creates an empty manager writing through `patcher`
    pub fn new(patcher: P) -> Self {
        Self::with_config(patcher, ManagerConfig::default())
    }

    /// Creates an empty manager with explicit configuration
    pub fn with_config(patcher: P, config: ManagerConfig) -> Self {
        Self {
            patcher,
            config,
            patches: boxcar::Vec::new(),
            base: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            lock: Mutex::new(()),
        }
    }

    /// Takes the mutation lock
    ///
    /// A panic while holding it cannot leave the registry inconsistent, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The writer this manager patches through
    pub fn patcher(&self) -> &P {
        &self.patcher
    }

    /// Installs a single patch as a batch of one
    ///
    /// # Safety
    ///
    /// See [`Self::install_batch`]
    pub unsafe fn install(&self, descriptor: &PatchDescriptor) -> Result<PatchGroup, BatchError> {
        self.install_batch(slice::from_ref(descriptor))
    }

    /// Applies `descriptors` in order, all or nothing.
    ///
    /// On the first failure everything applied by this call is restored in reverse order, the registry is left untouched,
    /// and the failing descriptor is reported. On success the patches are appended to the registry.
    ///
    /// # Safety
    ///
    /// Every descriptor target must be valid for this manager's patcher (see [`Patch::apply`]).
    pub unsafe fn install_batch(
        &self,
        descriptors: &[PatchDescriptor],
    ) -> Result<PatchGroup, BatchError> {
        let _lock = self.lock();

        let mut applied = Vec::with_capacity(descriptors.len());
        for (position, descriptor) in descriptors.iter().enumerate() {
            match Patch::apply(descriptor, &self.patcher) {
                Ok(patch) => applied.push(patch),
                Err(source) => {
                    error!(patch = %descriptor.id, position, error = %source, "patch failed to install");
                    let unrolled = self.rollback(applied);
                    return Err(BatchError {
                        id: descriptor.id.clone(),
                        position,
                        source,
                        unrolled,
                    });
                }
            }
        }

        let start = self.patches.count();
        let len = applied.len();
        for patch in applied {
            self.patches.push(patch);
        }
        info!(patches = len, "installed patch batch");

        Ok(PatchGroup {
            start,
            len,
            epoch: self.epoch.load(Ordering::Acquire),
        })
    }

    /// Undoes a partially applied batch, newest first, and returns the ids that stayed in place
    unsafe fn rollback(&self, applied: Vec<Patch>) -> Vec<Cow<'static, str>> {
        warn!(patches = applied.len(), "rolling back partial batch");
        let mut unrolled = Vec::new();
        for patch in applied.into_iter().rev() {
            if let Err(error) = patch.restore(&self.patcher, self.config.verify_restore) {
                error!(patch = %patch.id(), %error, "failed to roll back patch, target stays modified");
                unrolled.push(patch.id().clone());
            }
        }
        unrolled
    }

    /// Restores every live patch in reverse installation order and empties the registry.
    ///
    /// Best effort: a patch that fails to restore is logged and reported, and the unwind carries on with the rest.
    ///
    /// Emptying is logical. Retired patches keep their memory, one page or more per trampoline, until the manager drops, so a
    /// manager that is never dropped (such as [`global`]) grows with every install made through it, across teardowns.
    pub fn teardown(&self) -> TeardownReport {
        let _lock = self.lock();

        let base = self.base.load(Ordering::Acquire);
        let end = self.patches.count();
        if base == end {
            return TeardownReport::default();
        }

        let report = self.restore_range(base, end);
        self.base.store(end, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        info!(
            restored = report.restored,
            failed = report.failed.len(),
            "tore down patches"
        );
        report
    }

    /// Restores the patches of `group` in reverse order without removing them from the registry.
    ///
    /// Returns `None` if the group predates a teardown.
    pub fn restore_group(&self, group: &PatchGroup) -> Option<TeardownReport> {
        let _lock = self.lock();
        if group.epoch != self.epoch.load(Ordering::Acquire) {
            return None;
        }
        Some(self.restore_range(group.start, group.start + group.len))
    }

    /// Restores `start..end` newest first; the caller holds the lock
    fn restore_range(&self, start: usize, end: usize) -> TeardownReport {
        let mut report = TeardownReport::default();
        for index in (start..end).rev() {
            let Some(patch) = self.patches.get(index) else {
                continue;
            };
            // Safety: the target was valid when the patch was applied, which `install_batch` callers vouched for
            match unsafe { patch.restore(&self.patcher, self.config.verify_restore) } {
                Ok(()) => report.restored += 1,
                Err(error) => {
                    warn!(patch = %patch.id(), %error, "failed to restore patch, continuing");
                    report.failed.push(patch.id().clone());
                }
            }
        }
        report
    }

    /// Patches of an issued group, in installation order.
    ///
    /// Lock-free. Returns `None` if the group predates a teardown.
    pub fn group(&self, group: &PatchGroup) -> Option<impl Iterator<Item = &Patch> + '_> {
        if group.epoch != self.epoch.load(Ordering::Acquire) {
            return None;
        }
        Some((group.start..group.start + group.len).filter_map(move |index| self.patches.get(index)))
    }

    /// Live patches in installation order
    pub fn patches(&self) -> impl Iterator<Item = &Patch> + '_ {
        let base = self.base.load(Ordering::Acquire);
        let end = self.patches.count();
        (base..end).filter_map(move |index| self.patches.get(index))
    }

    /// Number of live patches
    pub fn len(&self) -> usize {
        let _lock = self.lock();
        self.patches.count() - self.base.load(Ordering::Acquire)
    }

    /// Returns `true` when no patches are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: Patcher> Drop for PatchManager<P> {
    fn drop(&mut self) {
        // patches still installed after this leak their trampolines when the registry drops
        self.teardown();
    }
}

/// Patcher used by the process-wide manager
pub type ProcessPatcher = PermissionWrapper<BytePatcher>;

lazy_static! {
    static ref PATCHES: PatchManager<ProcessPatcher> =
        PatchManager::new(PermissionWrapper::new(BytePatcher::new()));
}

/// The process-wide manager, created on first use and never dropped
pub fn global() -> &'static PatchManager<ProcessPatcher> {
    &PATCHES
}

/// Installs one patch through the process-wide manager
///
/// # Safety
///
/// See [`PatchManager::install_batch`]
pub unsafe fn install(descriptor: &PatchDescriptor) -> Result<PatchGroup, BatchError> {
    PATCHES.install(descriptor)
}

/// Installs a batch through the process-wide manager
///
/// # Safety
///
/// See [`PatchManager::install_batch`]
pub unsafe fn install_batch(descriptors: &[PatchDescriptor]) -> Result<PatchGroup, BatchError> {
    PATCHES.install_batch(descriptors)
}

/// Tears down every patch of the process-wide manager
pub fn teardown() -> TeardownReport {
    PATCHES.teardown()
}

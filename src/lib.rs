#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod code;
pub mod hook;
pub mod manager;
pub mod patch;
pub mod patcher;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{BatchError, ManagerConfig, PatchGroup, PatchManager, TeardownReport};
pub use patch::{Patch, PatchDescriptor, PatchError, Replacement};
pub use table::{HandleError, HandleTable, Identity};

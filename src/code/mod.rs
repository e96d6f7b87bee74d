//! # Code
//!
//! Machine code encoders used to build detours and trampolines

pub mod x64;

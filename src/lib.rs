//! parisc-unwind: frame unwinding, linker stub classification and inferior
//! function calls for PA-RISC (HP-UX SOM/ELF and Linux).
//!
//! The traced process is reached through [`TargetAccess`] and the loaded
//! modules through [`ObjectFile`]; [`Session`] ties them together and
//! caches what it derives.
//!
//! # Module overview
//!
//! ## Machine model
//!
//! - [`error`]: Error types used throughout the crate.
//! - [`types`]: Addresses, frame ids and frame kinds.
//! - [`bitfield`]: Instruction field extraction and immediate decoding.
//! - [`registers`]: Register numbering and register sets.
//! - [`abi`]: 32- and 64-bit calling conventions.
//!
//! ## Object files
//!
//! - [`target`]: Target/object traits and the unwinding [`Session`].
//! - [`objfile`]: ELF objects on disk and a static image target.
//! - [`symbols`]: Minimal symbol lookup.
//! - [`unwind_table`]: Unwind descriptor decoding and lookup.
//!
//! ## Code analysis
//!
//! - [`pattern`]: Instruction pattern matching for stubs and trampolines.
//! - [`prologue`]: Prologue analysis and skipping.
//! - [`stub`]: Linker stub classification and trampoline skipping.
//!
//! ## Frames and calls
//!
//! - [`frame`]: Frame caches, unwinders and backtraces.
//! - [`sigtramp`]: Linux signal frames.
//! - [`call`]: Call dummy construction for inferior function calls.

pub mod abi;
pub mod bitfield;
pub mod call;
pub mod error;
pub mod frame;
pub mod objfile;
pub mod pattern;
pub mod prologue;
pub mod registers;
pub mod sigtramp;
pub mod stub;
pub mod symbols;
pub mod target;
pub mod types;
pub mod unwind_table;

#[cfg(test)]
mod testutil;

pub use call::{CallDummyPlan, TrampolineChoice};
pub use error::{Error, Result};
pub use frame::{Frame, FrameCache, SavedRegister};
pub use objfile::{ElfObject, StaticImage};
pub use registers::RegisterSet;
pub use target::{Abi, ObjectFile, Os, Session, TargetAccess, TargetConfig};
pub use types::{FrameId, FrameKind, VirtAddr};
pub use unwind_table::{UnwindDescriptor, UnwindTable};

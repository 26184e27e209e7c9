//! A machine-code generation backend for a managed-language runtime.
//!
//! This crate turns a target-independent [`listing::Listing`] (instructions,
//! operands, labels, and a lexical [`frame::Frame`] of blocks/parts/
//! variables) into machine code for a concrete [`isa::TargetIsa`], through a
//! [`transform`] pipeline and a two-pass [`output`] assembler. The generated
//! code carries a [`output::GcCodeRef`] side table describing every embedded
//! pointer, so a moving collector can relocate it with [`patch::write_ptr`],
//! and a [`dwarf`] unwind table so an in-flight exception can find it.
//!
//! What this crate does *not* do: parse or type-check a source language,
//! implement a garbage collector, or dispatch OS-level exceptions. It
//! produces code and the metadata a GC and an unwinder need; it does not
//! implement either.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub mod compile;
pub mod dwarf;
pub mod error;
pub mod frame;
pub mod instruction;
pub mod isa;
pub mod label;
pub mod opcode;
pub mod operand;
pub mod output;
pub mod patch;
pub mod reg;
pub mod refs;
pub mod size;
pub mod transform;

mod listing;

pub use crate::compile::{compile, CompiledFunction};
pub use crate::error::{CodegenResult, Error, PatchError};
pub use crate::frame::{Block, FreeOpt, Part, Variable};
pub use crate::label::Label;
pub use crate::listing::{CatchEntry, Entry, Listing};
pub use crate::output::{CodeInfo, CodeOutput, GcCodeRef, LabelOutput, Output, RefKind, NOT_EMBEDDED};
pub use crate::refs::{RefId, RefManager, Reference};

/// The crate's semantic version, exposed for embedders that record it
/// alongside generated code (diagnostics, crash dumps).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

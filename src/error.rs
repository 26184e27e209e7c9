//! Error taxonomy for IR construction and assembly.
//!
//! Every fallible operation in this crate returns `Result<_, Error>`. Errors
//! are raised eagerly at the point of the offending IR-construction or
//! assembly call and are never silently swallowed; see `spec.md` §7.

use crate::label::Label;
use thiserror::Error;

/// The unified error type for IR construction and assembly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An operand does not satisfy an opcode's constraint: wrong size, not
    /// readable/writable where required, or an illegal addressing mode.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Use of an invalid block, part, or variable handle.
    #[error("frame error: {0}")]
    FrameError(String),

    /// Attempt to enter a block whose parent is not the currently active
    /// block.
    #[error("block begin error: {0}")]
    BlockBeginError(String),

    /// Attempt to close a block that is not the innermost active block.
    #[error("block end error: {0}")]
    BlockEndError(String),

    /// The same label was marked twice.
    #[error("label {0} marked more than once")]
    DuplicateLabelError(Label),

    /// A label was referenced but never marked.
    #[error("label {0} was referenced but never marked")]
    UnusedLabelError(Label),

    /// A variable was referenced from a part where it is not accessible.
    #[error("variable {var} is not accessible from part {part}")]
    VariableUseError {
        /// The variable's dense id, rendered for diagnostics.
        var: u32,
        /// The part's dense id, rendered for diagnostics.
        part: u32,
    },
}

/// The result type threaded through IR-builder and assembler APIs.
pub type CodegenResult<T> = Result<T, Error>;

/// Errors from the runtime-side reference patcher. Per `spec.md` §7, these
/// are unrecoverable: a patch failure indicates a corrupt `GcCodeRef` table
/// and the caller must abort rather than attempt to continue execution on
/// code whose embedded pointers may be stale.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// The byte slot at a patch site does not contain a recognized
    /// short-jump or long-jump encoding.
    #[error("unrecognized jump encoding at offset {0}")]
    UnrecognizedJumpEncoding(u32),

    /// `pointer` does not fit in the addressable range implied by `kind`.
    #[error("relative offset out of i32 range at offset {0}")]
    RelativeOutOfRange(u32),

    /// The offset recorded in a `GcCodeRef` lies outside the code
    /// allocation's byte range.
    #[error("reference offset {offset} out of bounds for code of size {size}")]
    OffsetOutOfBounds {
        /// Offset recorded in the reference.
        offset: u32,
        /// Size of the code allocation being patched.
        size: u32,
    },
}

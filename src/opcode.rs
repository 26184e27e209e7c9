//! The virtual opcode set. Each variant names one operation the assembler
//! (`crate::isa`) knows how to lower to machine bytes; `crate::instruction`
//! validates operand shape per opcode at construction time.

use std::fmt;

/// A virtual instruction opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// No-op; carries no operands. Used as a placeholder after peephole
    /// deletion and to anchor a label at the very end of a listing.
    Nop,
    /// `dest = src`.
    Mov,
    /// `dest = &src` (src must be `Relative`, `Variable`, or `Reference`).
    Lea,
    /// `dest += src`.
    Add,
    /// `dest += src + CF`.
    Adc,
    /// `dest -= src`.
    Sub,
    /// `dest -= src + CF`.
    Sbb,
    /// `dest &= src`.
    And,
    /// `dest |= src`.
    Or,
    /// `dest ^= src`.
    Xor,
    /// Compute flags for `dest - src` without writing `dest`.
    Cmp,
    /// Compute flags for `dest & src` without writing `dest`.
    Test,
    /// `dest = -dest`.
    Neg,
    /// `dest = !dest`.
    Not,
    /// `dest <<= src` (src is a byte-sized shift count).
    Shl,
    /// `dest >>= src`, logical (src is byte-sized).
    Shr,
    /// `dest >>= src`, arithmetic (src is byte-sized).
    Sar,
    /// `(edx:eax or rdx:rax) *= src`.
    Mul,
    /// `(edx:eax or rdx:rax) *= src`, signed.
    Imul,
    /// `dest = condFlag ? 1 : 0` (byte dest, `CondFlag` src).
    SetCond,
    /// Unconditional jump to the label/relative/register target.
    Jmp,
    /// Conditional jump, condition carried alongside the instruction.
    JmpCond,
    /// Call through a label, reference, or register.
    Call,
    /// Return, popping `src` (a constant) extra bytes of arguments.
    Ret,
    /// Push `src` onto the stack.
    Push,
    /// Pop into `dest`.
    Pop,
    /// Mark the start of a lexical block (`dest` is the `Part` operand).
    Begin,
    /// Mark the end of a lexical block.
    End,
    /// Function entry prolog (expanded by the transform pipeline).
    Prolog,
    /// Function exit epilog (expanded by the transform pipeline).
    Epilog,
    /// Raise an exception (used by scenario-style tests to exercise the
    /// unwind path without a full exception ABI).
    ThrowError,
    /// Pass `src` as the next outgoing call argument.
    FnParam,
    /// Call the function named by `dest` with the FnParams queued since the
    /// previous `FnCall`/`Call`.
    FnCall,
    /// Register-to-register data movement float variant (`movss`).
    MovSs,
    /// `dest += src`, float.
    AddSs,
    /// `dest -= src`, float.
    SubSs,
    /// `dest *= src`, float.
    MulSs,
    /// `dest /= src`, float.
    DivSs,
    /// Compare float operands, setting flags (`ucomiss`).
    UComiSs,
    /// Convert a signed integer to float.
    CvtSi2Ss,
    /// Convert (truncating) a float to signed integer.
    CvtTSs2Si,
    /// Add an external reference to the listing's GC-reference set without
    /// emitting code (used for references only consumed by metadata, e.g.
    /// a catch table's exception-type reference).
    AddRef,
    /// Release a previously added reference.
    ReleaseRef,
    /// Emit raw data bytes (`dest` unused, `src` is a `Constant`).
    Dat,
}

/// How an instruction's `dest` operand is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestMode {
    /// `dest` is unused (e.g. `Jmp`, `Ret`, `Dat`).
    None,
    /// `dest` is only read (e.g. `Cmp`, `Push`, `ThrowError`).
    Read,
    /// `dest` is only written (e.g. `SetCond`, `Pop`, `Mov`).
    Write,
    /// `dest` is both read and written (e.g. `Add`, `Shl`).
    ReadWrite,
}

impl DestMode {
    /// Whether this mode requires a readable `dest` operand.
    pub fn reads(self) -> bool {
        matches!(self, DestMode::Read | DestMode::ReadWrite)
    }

    /// Whether this mode requires a writable `dest` operand.
    pub fn writes(self) -> bool {
        matches!(self, DestMode::Write | DestMode::ReadWrite)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Opcode {
    /// The fixed `destMode` every instance of this opcode uses. `JmpCond`
    /// reads its `dest` as the branch target in `Jmp`'s style encoding
    /// family, so it's grouped with `Jmp` here (`DestMode::None`; the
    /// target is conventionally stored as `dest`, which is read-only as
    /// data rather than read as a register value).
    pub fn dest_mode(self) -> DestMode {
        use Opcode::*;
        match self {
            Nop | Begin | End | Prolog | Epilog | AddRef | ReleaseRef | Dat | FnParam
            | FnCall => DestMode::None,
            Jmp | JmpCond | Call | Ret | Push | ThrowError | Cmp | Test | UComiSs => {
                DestMode::Read
            }
            Mov | Lea | Pop | SetCond | CvtSi2Ss | CvtTSs2Si => DestMode::Write,
            Add | Adc | Sub | Sbb | And | Or | Xor | Neg | Not | Shl | Shr | Sar | Mul | Imul
            | MovSs | AddSs | SubSs | MulSs | DivSs => DestMode::ReadWrite,
        }
    }

    /// True for the unconditional/conditional jump family.
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::JmpCond)
    }

    /// True for opcodes that unconditionally transfer control or return,
    /// clearing register liveness in the backward liveness scan.
    pub fn clears_liveness(self) -> bool {
        matches!(
            self,
            Opcode::Jmp
                | Opcode::Begin
                | Opcode::End
                | Opcode::Prolog
                | Opcode::Call
                | Opcode::FnCall
                | Opcode::Ret
        )
    }

    /// True for call-family opcodes, which additionally re-add
    /// caller-saved registers to the live set after clearing it (via
    /// `TargetIsa::caller_saved`).
    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call | Opcode::FnCall)
    }
}

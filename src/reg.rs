//! Register enumeration shared by the x86 and x86-64 backends.
//!
//! Encodings follow the hardware ModR/M.reg field numbering (`rax`=0 ...
//! `rdi`=7, `r8`=8 ... `r15`=15), matching what `cranelift-codegen`'s
//! generated `isa/x86/registers.rs` parses (`rax` -> 0, `rbx` -> 3, `rcx`
//! -> 1, `rdx` -> 2, `rsi` -> 6, `rdi` -> 7, ...).

use crate::size::Size;
use std::fmt;

/// The three scratch pointer registers the backend reserves for its own use
/// during lowering (64-bit splitting, immediate materialization). Never
/// allocated to user-visible values by the transform pipeline.
pub const PTR_A: Reg = Reg::Rax;
/// Second scratch register.
pub const PTR_B: Reg = Reg::Rcx;
/// Third scratch register.
pub const PTR_C: Reg = Reg::Rdx;

/// A machine register, named by its widest (64-bit) form; narrower views are
/// obtained with [`Reg::as_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    /// `rax`.
    Rax,
    /// `rcx`.
    Rcx,
    /// `rdx`.
    Rdx,
    /// `rbx`.
    Rbx,
    /// `rsp`, the stack pointer.
    Rsp,
    /// `rbp`, the frame pointer.
    Rbp,
    /// `rsi`.
    Rsi,
    /// `rdi`.
    Rdi,
    /// `r8`.
    R8,
    /// `r9`.
    R9,
    /// `r10`.
    R10,
    /// `r11`.
    R11,
    /// `r12`.
    R12,
    /// `r13`.
    R13,
    /// `r14`.
    R14,
    /// `r15`.
    R15,
    /// `xmm0`.
    Xmm0,
    /// `xmm1`.
    Xmm1,
    /// `xmm2`.
    Xmm2,
    /// `xmm3`.
    Xmm3,
    /// `xmm4`.
    Xmm4,
    /// `xmm5`.
    Xmm5,
    /// `xmm6`.
    Xmm6,
    /// `xmm7`.
    Xmm7,
}

/// All general-purpose integer registers available on x86 (32-bit mode):
/// the low eight only, `r8`-`r15` and the xmm bank require x86-64 / SSE.
pub const X86_GPR: &[Reg] = &[
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rsp,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
];

/// All general-purpose integer registers available on x86-64.
pub const X64_GPR: &[Reg] = &[
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rsp,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// Caller-saved (volatile) integer registers under the SysV x86-64 calling
/// convention, used by `removeFnRegs` to clear liveness across a call.
pub const X64_CALLER_SAVED: &[Reg] = &[
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// Callee-saved (non-volatile) integer registers under the SysV x86-64
/// calling convention, excluding `rsp`/`rbp` (the frame pointer machinery
/// already preserves those). A function that writes one of these must
/// restore its entry value before returning.
pub const X64_CALLEE_SAVED: &[Reg] = &[Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Callee-saved integer registers under the cdecl convention `isa::x86`
/// assumes, excluding `esp`/`ebp`.
pub const X86_CALLEE_SAVED: &[Reg] = &[Reg::Rbx, Reg::Rsi, Reg::Rdi];

impl Reg {
    /// Hardware encoding (the low 3 bits go in ModR/M or SIB; bit 3 is the
    /// REX.R/X/B extension bit on x86-64).
    pub fn encoding(self) -> u8 {
        match self {
            Reg::Rax | Reg::Xmm0 => 0,
            Reg::Rcx | Reg::Xmm1 => 1,
            Reg::Rdx | Reg::Xmm2 => 2,
            Reg::Rbx | Reg::Xmm3 => 3,
            Reg::Rsp | Reg::Xmm4 => 4,
            Reg::Rbp | Reg::Xmm5 => 5,
            Reg::Rsi | Reg::Xmm6 => 6,
            Reg::Rdi | Reg::Xmm7 => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::R13 => 13,
            Reg::R14 => 14,
            Reg::R15 => 15,
        }
    }

    /// True for registers only encodable with a REX prefix (x86-64 only).
    pub fn needs_rex(self) -> bool {
        self.encoding() >= 8
    }

    /// True for the xmm bank.
    pub fn is_xmm(self) -> bool {
        matches!(
            self,
            Reg::Xmm0
                | Reg::Xmm1
                | Reg::Xmm2
                | Reg::Xmm3
                | Reg::Xmm4
                | Reg::Xmm5
                | Reg::Xmm6
                | Reg::Xmm7
        )
    }

    /// Return a [`Size`]-tagged view of this register: `sByte`, `sInt`,
    /// `sLong`, or `sPtr`. The identity of the register is unchanged; only
    /// the width at which an instruction reads/writes it differs, so this
    /// is a no-op at the type level and exists to document intent at call
    /// sites (`mov al, ...` vs `mov eax, ...` share `Reg::Rax`).
    pub fn as_size(self, size: Size) -> SizedReg {
        SizedReg { reg: self, size }
    }

    /// The DWARF register number used by `gimli::write` CFI directives,
    /// under the SysV x86-64 numbering (rax=0, rdx=1, rcx=2, rbx=3, rsi=4,
    /// rdi=5, rbp=6, rsp=7, r8-r15=8-15).
    pub fn dwarf_number(self) -> u16 {
        match self {
            Reg::Rax => 0,
            Reg::Rdx => 1,
            Reg::Rcx => 2,
            Reg::Rbx => 3,
            Reg::Rsi => 4,
            Reg::Rdi => 5,
            Reg::Rbp => 6,
            Reg::Rsp => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::R13 => 13,
            Reg::R14 => 14,
            Reg::R15 => 15,
            Reg::Xmm0
            | Reg::Xmm1
            | Reg::Xmm2
            | Reg::Xmm3
            | Reg::Xmm4
            | Reg::Xmm5
            | Reg::Xmm6
            | Reg::Xmm7 => 17 + (self.encoding() as u16),
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
            Reg::Xmm0 => "xmm0",
            Reg::Xmm1 => "xmm1",
            Reg::Xmm2 => "xmm2",
            Reg::Xmm3 => "xmm3",
            Reg::Xmm4 => "xmm4",
            Reg::Xmm5 => "xmm5",
            Reg::Xmm6 => "xmm6",
            Reg::Xmm7 => "xmm7",
        };
        f.write_str(name)
    }
}

/// A register paired with the width it is being accessed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedReg {
    /// The underlying register.
    pub reg: Reg,
    /// The width at which it's accessed.
    pub size: Size,
}

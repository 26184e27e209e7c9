//! Instructions: immutable `(opcode, dest, destMode, src)` tuples, built
//! only through validating factory functions. See `spec.md` §3/§4.C.

use crate::error::{CodegenResult, Error};
use crate::opcode::{DestMode, Opcode};
use crate::operand::{CondFlag, Kind, Operand};
use crate::reg::Reg;
use crate::size::{Size, S_BYTE, S_PTR};

/// One immutable instruction: an opcode plus a `dest`/`src` operand pair and
/// the mode under which `dest` is used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    opcode: Opcode,
    dest: Operand,
    dest_mode: DestMode,
    src: Operand,
    /// Set only for `Opcode::JmpCond`; the condition under test.
    cond: Option<CondFlag>,
}

impl Instruction {
    /// The opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The destination operand.
    pub fn dest(&self) -> Operand {
        self.dest
    }

    /// The mode `dest` is used under.
    pub fn dest_mode(&self) -> DestMode {
        self.dest_mode
    }

    /// The source operand.
    pub fn src(&self) -> Operand {
        self.src
    }

    /// The branch condition, for `JmpCond`.
    pub fn cond(&self) -> Option<CondFlag> {
        self.cond
    }

    /// Rewrite `dest`/`src`, preserving `opcode`/`dest_mode`/`cond`. Used by
    /// the transform pipeline's variable-resolution pass, which only ever
    /// swaps an `Operand::Variable` for the `Operand::Relative` it resolves
    /// to — a substitution that preserves size and satisfies every check
    /// `Instruction::build` already ran on the original operand, so
    /// re-validating here would be redundant.
    pub(crate) fn with_operands(&self, dest: Operand, src: Operand) -> Instruction {
        Instruction { dest, src, ..*self }
    }

    /// Construct and validate an instruction generically. Most callers
    /// should prefer the per-opcode factory functions below, which fill in
    /// `destMode` automatically and add opcode-specific checks.
    fn build(opcode: Opcode, dest: Operand, src: Operand) -> CodegenResult<Instruction> {
        let dest_mode = opcode.dest_mode();

        if src != Operand::None && !src.readable() {
            return Err(Error::InvalidValue(format!(
                "{}: src operand is not readable",
                opcode
            )));
        }
        if dest_mode.reads() && !dest.readable() {
            return Err(Error::InvalidValue(format!(
                "{}: dest operand must be readable",
                opcode
            )));
        }
        if dest_mode.writes() && !dest.writable() {
            return Err(Error::InvalidValue(format!(
                "{}: dest operand must be writable",
                opcode
            )));
        }

        // Arithmetic family: dest and src must agree on size when both are
        // sized operands.
        if is_arithmetic(opcode) {
            if let (Some(ds), Some(ss)) = (dest.size(), src.size()) {
                if ds.current() != ss.current() {
                    return Err(Error::InvalidValue(format!(
                        "{}: dest/src size mismatch ({} vs {})",
                        opcode,
                        ds.current(),
                        ss.current()
                    )));
                }
            }
        }

        match opcode {
            Opcode::Lea => {
                if dest.size().map(|s| s.current()) != Some(S_PTR.current()) {
                    return Err(Error::InvalidValue("lea: dest must be pointer-sized".into()));
                }
                match src.kind() {
                    Kind::Relative | Kind::Variable | Kind::Reference => {}
                    _ => {
                        return Err(Error::InvalidValue(
                            "lea: src must be relative, variable, or reference".into(),
                        ))
                    }
                }
            }
            Opcode::Jmp | Opcode::Call => {
                // A `Label` target has no `size()` and is always legal; a
                // sized target (register, reference, relative) must be
                // pointer-sized.
                if let Some(sz) = dest.size() {
                    if sz.current() != S_PTR.current() {
                        return Err(Error::InvalidValue(format!(
                            "{}: target must be pointer-sized",
                            opcode
                        )));
                    }
                }
            }
            Opcode::Shl | Opcode::Shr | Opcode::Sar => {
                if let Some(sz) = src.size() {
                    if sz.current() != S_BYTE.current() {
                        return Err(Error::InvalidValue(format!(
                            "{}: shift count must be byte-sized",
                            opcode
                        )));
                    }
                }
            }
            _ => {}
        }

        Ok(Instruction {
            opcode,
            dest,
            dest_mode,
            src,
            cond: None,
        })
    }
}

fn is_arithmetic(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Add
            | Opcode::Adc
            | Opcode::Sub
            | Opcode::Sbb
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Cmp
            | Opcode::Test
            | Opcode::Mov
            | Opcode::AddSs
            | Opcode::SubSs
            | Opcode::MulSs
            | Opcode::DivSs
            | Opcode::MovSs
            | Opcode::UComiSs
    )
}

macro_rules! binop_factory {
    ($name:ident, $opcode:expr) => {
        /// Build a
        #[doc = stringify!($opcode)]
        /// instruction.
        pub fn $name(dest: Operand, src: Operand) -> CodegenResult<Instruction> {
            Instruction::build($opcode, dest, src)
        }
    };
}

binop_factory!(mov, Opcode::Mov);
binop_factory!(lea, Opcode::Lea);
binop_factory!(add, Opcode::Add);
binop_factory!(adc, Opcode::Adc);
binop_factory!(sub, Opcode::Sub);
binop_factory!(sbb, Opcode::Sbb);
binop_factory!(and, Opcode::And);
binop_factory!(or, Opcode::Or);
binop_factory!(xor, Opcode::Xor);
binop_factory!(cmp, Opcode::Cmp);
binop_factory!(test, Opcode::Test);
binop_factory!(shl, Opcode::Shl);
binop_factory!(shr, Opcode::Shr);
binop_factory!(sar, Opcode::Sar);
binop_factory!(mul, Opcode::Mul);
binop_factory!(imul, Opcode::Imul);
binop_factory!(movss, Opcode::MovSs);
binop_factory!(addss, Opcode::AddSs);
binop_factory!(subss, Opcode::SubSs);
binop_factory!(mulss, Opcode::MulSs);
binop_factory!(divss, Opcode::DivSs);
binop_factory!(ucomiss, Opcode::UComiSs);

/// `dest = -dest`.
pub fn neg(dest: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Neg, dest, Operand::None)
}

/// `dest = !dest`.
pub fn not(dest: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Not, dest, Operand::None)
}

/// `dest = src as i32/i64`.
pub fn cvtsi2ss(dest: Operand, src: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::CvtSi2Ss, dest, src)
}

/// `dest = src as i32/i64` (truncating float-to-int conversion).
pub fn cvttss2si(dest: Operand, src: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::CvtTSs2Si, dest, src)
}

/// `dest = condFlag ? 1 : 0`.
pub fn set_cond(dest: Operand, cond: CondFlag) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::SetCond, dest, Operand::CondFlag(cond))
}

/// An unconditional jump to `target` (a `Label`, `Reference`, or pointer
/// register).
pub fn jmp(target: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Jmp, target, Operand::None)
}

/// A conditional jump to `target`, taken when `cond` holds.
pub fn jmp_cond(cond: CondFlag, target: Operand) -> CodegenResult<Instruction> {
    let mut inst = Instruction::build(Opcode::JmpCond, target, Operand::None)?;
    inst.cond = Some(cond);
    Ok(inst)
}

/// Call through `target` (a `Label`, `Reference`, or pointer register).
pub fn call(target: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Call, target, Operand::None)
}

/// Return, popping `extra_bytes` of caller-pushed arguments.
pub fn ret(extra_bytes: i64) -> CodegenResult<Instruction> {
    Instruction::build(
        Opcode::Ret,
        Operand::constant(extra_bytes, crate::size::S_INT),
        Operand::None,
    )
}

/// Push `src` onto the stack.
pub fn push(src: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Push, src, Operand::None)
}

/// Pop into `dest`.
pub fn pop(dest: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Pop, dest, Operand::None)
}

/// Mark the start of lexical block `part`.
pub fn begin(part: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Begin, part, Operand::None)
}

/// Mark the end of the innermost active lexical block.
pub fn end() -> CodegenResult<Instruction> {
    Instruction::build(Opcode::End, Operand::None, Operand::None)
}

/// Function entry prolog.
pub fn prolog() -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Prolog, Operand::None, Operand::None)
}

/// Function exit epilog.
pub fn epilog() -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Epilog, Operand::None, Operand::None)
}

/// Raise an exception (used by tests exercising destructor-on-exception
/// behavior without modeling a full source-language throw expression).
pub fn throw_error(info: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::ThrowError, info, Operand::None)
}

/// Queue `src` as the next outgoing call argument.
pub fn fn_param(src: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::FnParam, Operand::None, src)
}

/// Call the function named by `target`, consuming the `FnParam`s queued
/// since the previous call.
pub fn fn_call(target: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::FnCall, Operand::None, target)
}

/// Register `r` as an extra GC-visible reference without emitting any
/// bytes.
pub fn add_ref(r: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::AddRef, Operand::None, r)
}

/// Release a previously `add_ref`'d reference.
pub fn release_ref(r: Operand) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::ReleaseRef, Operand::None, r)
}

/// Emit `bytes` worth of raw data (as a sequence of `dat` instructions, one
/// per constant) at the current position.
pub fn dat(value: i64, size: Size) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Dat, Operand::None, Operand::constant(value, size))
}

/// A no-op. Carries no operands and is eliminated before size computation,
/// but may carry labels.
pub fn nop() -> Instruction {
    Instruction {
        opcode: Opcode::Nop,
        dest: Operand::None,
        dest_mode: DestMode::None,
        src: Operand::None,
        cond: None,
    }
}

/// Build a raw `(reg, reg)` move, the idiom the liveness analysis
/// recognizes as zeroing `dest` rather than reading it (`xor r, r`).
pub fn zero_idiom(r: Reg) -> CodegenResult<Instruction> {
    Instruction::build(Opcode::Xor, Operand::reg(r), Operand::reg(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::S_INT;

    #[test]
    fn lea_requires_pointer_dest() {
        let src = Operand::relative(Reg::Rbp, -8, S_INT).unwrap();
        assert!(lea(Operand::reg(Reg::Rax), src).is_ok());
        // eax viewed as sInt would still report pointer-sized in this
        // model since registers aren't narrowed at the type level; a
        // non-pointer-kind dest is what's actually rejected.
        assert!(lea(Operand::constant(0, S_INT), src).is_err());
    }

    #[test]
    fn lea_rejects_non_address_src() {
        let err = lea(Operand::reg(Reg::Rax), Operand::reg(Reg::Rbx));
        assert!(err.is_err());
    }

    #[test]
    fn shift_count_must_be_byte_sized() {
        let dest = Operand::reg(Reg::Rax);
        let bad = Operand::constant(1, S_INT);
        let good = Operand::constant(1, S_BYTE);
        assert!(shl(dest, bad).is_err());
        assert!(shl(dest, good).is_ok());
    }

    #[test]
    fn arithmetic_requires_matching_sizes() {
        let dest = Operand::reg(Reg::Rax);
        let src = Operand::constant(1, S_BYTE);
        assert!(add(dest, src).is_err());
    }

    #[test]
    fn dest_mode_validated_for_cmp() {
        // cmp only reads dest, so a constant dest is fine.
        assert!(cmp(Operand::constant(1, S_INT), Operand::constant(1, S_INT)).is_ok());
    }

    #[test]
    fn pop_requires_writable_dest() {
        assert!(pop(Operand::constant(0, S_INT)).is_err());
        assert!(pop(Operand::reg(Reg::Rax)).is_ok());
    }
}

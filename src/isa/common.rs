//! The instruction encoder shared by `isa::x86` and `isa::x64`. x86-64
//! differs from x86 only in pointer width and the availability of a REX
//! prefix (to reach `r8`-`r15` and to request a 64-bit operand size);
//! everything else about the legacy encoding is identical, so both ISAs
//! call through here with `rex_capable` set accordingly.

use super::encoding::{modrm_mem, modrm_reg, needs_rex, rex};
use crate::error::{CodegenResult, Error};
use crate::instruction::Instruction;
use crate::opcode::Opcode;
use crate::operand::{CondFlag, Operand};
use crate::output::{Output, RefKind};
use crate::reg::Reg;
use cranelift_entity::EntityRef;
use std::convert::TryFrom;

fn cond_code(c: CondFlag) -> u8 {
    match c {
        CondFlag::Overflow => 0x0,
        CondFlag::NoOverflow => 0x1,
        CondFlag::Below => 0x2,
        CondFlag::AboveEqual => 0x3,
        CondFlag::Equal => 0x4,
        CondFlag::NotEqual => 0x5,
        CondFlag::BelowEqual => 0x6,
        CondFlag::Above => 0x7,
        CondFlag::Less => 0xc,
        CondFlag::GreaterEqual => 0xd,
        CondFlag::LessEqual => 0xe,
        CondFlag::Greater => 0xf,
    }
}

/// `(opcode-extension-or-reg-field, legacy-opcode-byte)` for the
/// reg/reg and reg/imm forms of the arithmetic family sharing x86's
/// classic `/digit` ModR/M extension encoding.
fn arith_ext(op: Opcode) -> Option<u8> {
    match op {
        Opcode::Add => Some(0),
        Opcode::Or => Some(1),
        Opcode::Adc => Some(2),
        Opcode::Sbb => Some(3),
        Opcode::And => Some(4),
        Opcode::Sub => Some(5),
        Opcode::Xor => Some(6),
        Opcode::Cmp => Some(7),
        _ => None,
    }
}

fn shift_ext(op: Opcode) -> Option<u8> {
    match op {
        Opcode::Shl => Some(4),
        Opcode::Shr => Some(5),
        Opcode::Sar => Some(7),
        _ => None,
    }
}

fn emit_rex_if_needed(
    out: &mut dyn Output,
    rex_capable: bool,
    w: bool,
    r: Reg,
    rm: Option<Reg>,
) -> CodegenResult<()> {
    let need = w || needs_rex(r) || rm.map(needs_rex).unwrap_or(false);
    if need {
        if !rex_capable {
            return Err(Error::InvalidValue(
                "instruction requires a REX prefix on a target with no REX support".into(),
            ));
        }
        out.put_byte(rex(
            w,
            needs_rex(r),
            false,
            rm.map(needs_rex).unwrap_or(false),
        ));
    }
    Ok(())
}

fn is_8_byte(o: &Operand) -> bool {
    o.size().map(|s| s.current() == 8).unwrap_or(false)
}

fn reg_of(o: Operand) -> CodegenResult<Reg> {
    match o {
        Operand::Register(r) => Ok(r),
        _ => Err(Error::InvalidValue("expected a register operand".into())),
    }
}

/// Encode (or, under `LabelOutput`, just size) one instruction. `rex_capable`
/// is `true` for x86-64, `false` for 32-bit x86 (where any 8-byte operand or
/// `r8`-`r15` register is a construction-time bug, since the transform
/// pipeline's 64-bit splitting pass must have already removed them).
pub fn encode_common(
    inst: &Instruction,
    out: &mut dyn Output,
    rex_capable: bool,
) -> CodegenResult<()> {
    let dest = inst.dest();
    let src = inst.src();

    match inst.opcode() {
        Opcode::Nop => out.put_byte(0x90),

        Opcode::Begin | Opcode::End => {
            // Pure bookkeeping; no bytes. Scope bounds are recovered from
            // the frame, not from the instruction stream, when building
            // the DWARF FDE and the destructor call sequence.
        }

        Opcode::Prolog | Opcode::Epilog => {
            return Err(Error::InvalidValue(
                "prolog/epilog must be lowered by the transform pipeline before assembly".into(),
            ));
        }

        Opcode::ThrowError | Opcode::FnParam | Opcode::FnCall | Opcode::AddRef
        | Opcode::ReleaseRef => {
            return Err(Error::InvalidValue(format!(
                "{} is a pseudo-op; the transform pipeline must lower it before assembly",
                inst.opcode()
            )));
        }

        Opcode::Dat => {
            if let Operand::Constant { value, size } = src {
                for byte_idx in 0..size.current() {
                    out.put_byte((value >> (8 * byte_idx)) as u8);
                }
            } else {
                return Err(Error::InvalidValue("dat: src must be a constant".into()));
            }
        }

        Opcode::Mov => encode_mov(dest, src, out, rex_capable)?,
        Opcode::Lea => encode_lea(dest, src, out, rex_capable)?,

        op if arith_ext(op).is_some() => {
            let ext = arith_ext(op).unwrap();
            encode_arith(ext, dest, src, out, rex_capable)?;
        }

        Opcode::Test => encode_test(dest, src, out, rex_capable)?,

        Opcode::Neg | Opcode::Not => {
            let r = reg_of(dest)?;
            let w = rex_capable && is_8_byte(&dest);
            emit_rex_if_needed(out, rex_capable, w, r, None)?;
            out.put_byte(0xf7);
            let ext = if inst.opcode() == Opcode::Neg { 3 } else { 2 };
            out.put_byte(modrm_reg(ext, r));
        }

        op if shift_ext(op).is_some() => {
            let ext = shift_ext(op).unwrap();
            let r = reg_of(dest)?;
            let w = rex_capable && is_8_byte(&dest);
            emit_rex_if_needed(out, rex_capable, w, r, None)?;
            match src {
                Operand::Constant { value, .. } if value == 1 => {
                    out.put_byte(0xd1);
                    out.put_byte(modrm_reg(ext, r));
                }
                Operand::Constant { value, .. } => {
                    out.put_byte(0xc1);
                    out.put_byte(modrm_reg(ext, r));
                    out.put_byte(value as u8);
                }
                Operand::Register(Reg::Rcx) => {
                    out.put_byte(0xd3);
                    out.put_byte(modrm_reg(ext, r));
                }
                _ => {
                    return Err(Error::InvalidValue(
                        "shift count must be an immediate or cl".into(),
                    ))
                }
            }
        }

        Opcode::Mul | Opcode::Imul => {
            let r = reg_of(src)?;
            let w = rex_capable && is_8_byte(&src);
            emit_rex_if_needed(out, rex_capable, w, r, None)?;
            out.put_byte(0xf7);
            let ext = if inst.opcode() == Opcode::Mul { 4 } else { 5 };
            out.put_byte(modrm_reg(ext, r));
        }

        Opcode::SetCond => {
            let r = reg_of(dest)?;
            let cond = inst
                .cond()
                .ok_or_else(|| Error::InvalidValue("setCond: missing condition".into()))?;
            emit_rex_if_needed(out, rex_capable, false, r, None)?;
            out.put_byte(0x0f);
            out.put_byte(0x90 + cond_code(cond));
            out.put_byte(modrm_reg(0, r));
        }

        Opcode::Jmp => encode_jump_or_call(dest, None, out, rex_capable)?,
        Opcode::JmpCond => encode_jump_or_call(dest, inst.cond(), out, rex_capable)?,
        Opcode::Call => encode_call(dest, out, rex_capable)?,

        Opcode::Ret => {
            if let Operand::Constant { value, .. } = dest {
                if value == 0 {
                    out.put_byte(0xc3);
                } else {
                    out.put_byte(0xc2);
                    out.put_int(value as i32);
                    // imm16 in the real encoding; storing a full i32 here
                    // is harmless since the assembler never reads it back,
                    // but keep it deliberate: only the low 16 bits matter.
                }
            } else {
                return Err(Error::InvalidValue("ret: dest must be a constant".into()));
            }
        }

        Opcode::Push => {
            let r = reg_of(dest)?;
            if needs_rex(r) {
                out.put_byte(rex(false, false, false, true));
            }
            out.put_byte(0x50 + (r.encoding() & 0b111));
        }
        Opcode::Pop => {
            let r = reg_of(dest)?;
            if needs_rex(r) {
                out.put_byte(rex(false, false, false, true));
            }
            out.put_byte(0x58 + (r.encoding() & 0b111));
        }

        Opcode::MovSs | Opcode::AddSs | Opcode::SubSs | Opcode::MulSs | Opcode::DivSs
        | Opcode::UComiSs => encode_sse(inst.opcode(), dest, src, out)?,

        Opcode::CvtSi2Ss => encode_cvtsi2ss(dest, src, out)?,
        Opcode::CvtTSs2Si => encode_cvttss2si(dest, src, out)?,

        // Every other opcode is an arithmetic or shift op already handled
        // by the `arith_ext`/`shift_ext` guard arms above; the match
        // guards above are exhaustive for them but the compiler can't
        // prove that statically.
        op @ (Opcode::Add
        | Opcode::Adc
        | Opcode::Sub
        | Opcode::Sbb
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor
        | Opcode::Cmp
        | Opcode::Shl
        | Opcode::Shr
        | Opcode::Sar) => unreachable!("{:?} already handled by a guard arm above", op),
    }
    Ok(())
}

fn encode_mov(
    dest: Operand,
    src: Operand,
    out: &mut dyn Output,
    rex_capable: bool,
) -> CodegenResult<()> {
    match (dest, src) {
        (Operand::Register(d), Operand::Register(s)) => {
            let w = rex_capable && is_8_byte(&dest);
            emit_rex_if_needed(out, rex_capable, w, s, Some(d))?;
            out.put_byte(0x89);
            out.put_byte(modrm_reg(s.encoding() & 0b111, d));
        }
        (Operand::Register(d), Operand::Constant { value, .. }) => {
            let w = rex_capable && is_8_byte(&dest);
            emit_rex_if_needed(out, rex_capable, w, d, None)?;
            if w {
                out.put_byte(0xb8 + (d.encoding() & 0b111));
                out.put_ptr_word(value);
            } else {
                out.put_byte(0xb8 + (d.encoding() & 0b111));
                out.put_int(value as i32);
            }
        }
        (Operand::Register(d), Operand::Relative { base, offset, .. }) => {
            emit_rex_if_needed(out, rex_capable, false, d, Some(base))?;
            out.put_byte(0x8b);
            emit_mem_operand(d.encoding() & 0b111, base, offset, out);
        }
        (Operand::Relative { base, offset, .. }, Operand::Register(s)) => {
            emit_rex_if_needed(out, rex_capable, false, s, Some(base))?;
            out.put_byte(0x89);
            emit_mem_operand(s.encoding() & 0b111, base, offset, out);
        }
        (Operand::Register(d), Operand::Reference(r)) => {
            emit_rex_if_needed(out, rex_capable, rex_capable, d, None)?;
            out.put_byte(0xb8 + (d.encoding() & 0b111));
            out.put_ref(RefKind::RawPtr, r.index(), out.pointer_size());
        }
        _ => {
            return Err(Error::InvalidValue(
                "mov: unsupported operand combination".into(),
            ))
        }
    }
    Ok(())
}

fn emit_mem_operand(reg_field: u8, base: Reg, offset: i32, out: &mut dyn Output) {
    if offset == 0 && base != Reg::Rbp && base != Reg::R13 {
        out.put_byte(modrm_mem(reg_field, base, 0b00));
    } else if (-128..=127).contains(&offset) {
        out.put_byte(modrm_mem(reg_field, base, 0b01));
        out.put_byte(offset as i8 as u8);
    } else {
        out.put_byte(modrm_mem(reg_field, base, 0b10));
        out.put_int(offset);
    }
}

fn encode_lea(
    dest: Operand,
    src: Operand,
    out: &mut dyn Output,
    rex_capable: bool,
) -> CodegenResult<()> {
    let d = reg_of(dest)?;
    match src {
        Operand::Relative { base, offset, .. } => {
            emit_rex_if_needed(out, rex_capable, rex_capable, d, Some(base))?;
            out.put_byte(0x8d);
            emit_mem_operand(d.encoding() & 0b111, base, offset, out);
        }
        _ => {
            return Err(Error::InvalidValue(
                "lea: only [reg+offset] sources are supported".into(),
            ))
        }
    }
    Ok(())
}

fn encode_arith(
    ext: u8,
    dest: Operand,
    src: Operand,
    out: &mut dyn Output,
    rex_capable: bool,
) -> CodegenResult<()> {
    match (dest, src) {
        (Operand::Register(d), Operand::Register(s)) => {
            let w = rex_capable && is_8_byte(&dest);
            emit_rex_if_needed(out, rex_capable, w, s, Some(d))?;
            // `ext*8 + 1` is the classic `/r` reg/reg opcode for this
            // family (e.g. `add` = 0x01, `sub` = 0x29, `xor` = 0x31).
            out.put_byte(ext * 8 + 1);
            out.put_byte(modrm_reg(s.encoding() & 0b111, d));
        }
        (Operand::Register(d), Operand::Constant { value, .. }) => {
            let w = rex_capable && is_8_byte(&dest);
            emit_rex_if_needed(out, rex_capable, w, d, None)?;
            out.put_byte(0x81);
            out.put_byte(modrm_reg(ext, d));
            out.put_int(value as i32);
        }
        _ => {
            return Err(Error::InvalidValue(
                "arithmetic: unsupported operand combination".into(),
            ))
        }
    }
    Ok(())
}

fn encode_test(
    dest: Operand,
    src: Operand,
    out: &mut dyn Output,
    rex_capable: bool,
) -> CodegenResult<()> {
    match (dest, src) {
        (Operand::Register(d), Operand::Register(s)) => {
            let w = rex_capable && is_8_byte(&dest);
            emit_rex_if_needed(out, rex_capable, w, s, Some(d))?;
            out.put_byte(0x85);
            out.put_byte(modrm_reg(s.encoding() & 0b111, d));
        }
        (Operand::Register(d), Operand::Constant { value, .. }) => {
            let w = rex_capable && is_8_byte(&dest);
            emit_rex_if_needed(out, rex_capable, w, d, None)?;
            out.put_byte(0xf7);
            out.put_byte(modrm_reg(0, d));
            out.put_int(value as i32);
        }
        _ => return Err(Error::InvalidValue("test: unsupported operands".into())),
    }
    Ok(())
}

/// `spec.md` §4.F: short (`eb`/`7x`) jumps to a same-listing label are 2
/// bytes, long (`e9`/`0f8x`) jumps are 5/6 bytes. The caller doesn't know
/// the final displacement until label offsets are fixed, so pass 1 always
/// reserves the long form (the conservative upper bound) and pass 2 emits
/// whichever form the resolved displacement actually fits, which is safe
/// because pass 1's count is only ever used to *allocate* the code object.
///
/// A jump to an external `Operand::Reference` is a different case (§4.G):
/// on x86-64 it reserves the 6-byte `jump`-kind patch slot so the
/// reference patcher can rewrite it after a GC move without widening the
/// instruction; on x86 it falls back to a plain 32-bit relative `e9`, the
/// same as this function already does for a same-listing label.
fn encode_jump_or_call(
    target: Operand,
    cond: Option<CondFlag>,
    out: &mut dyn Output,
    rex_capable: bool,
) -> CodegenResult<()> {
    match target {
        Operand::Label(label) => {
            if out.label_offset(label).is_err() {
                // Sizing pass: reserve the long form.
                match cond {
                    None => {
                        out.put_byte(0xe9);
                        out.put_int(0);
                    }
                    Some(_) => {
                        out.put_byte(0x0f);
                        out.put_byte(0x80);
                        out.put_int(0);
                    }
                }
                return Ok(());
            }
            let target_off = out.label_offset(label)?;
            let long_len = if cond.is_some() { 6 } else { 5 };
            let short_len = 2;
            let short_rel = target_off as i64 - (out.position() as i64 + short_len);
            if (-128..=127).contains(&short_rel) {
                match cond {
                    None => out.put_byte(0xeb),
                    Some(c) => out.put_byte(0x70 + cond_code(c)),
                }
                out.put_byte(short_rel as i8 as u8);
            } else {
                let long_rel = target_off as i64 - (out.position() as i64 + long_len);
                let long_rel = i32::try_from(long_rel).map_err(|_| {
                    Error::InvalidValue(format!("branch to {} out of i32 range", label))
                })?;
                match cond {
                    None => out.put_byte(0xe9),
                    Some(c) => {
                        out.put_byte(0x0f);
                        out.put_byte(0x80 + cond_code(c));
                    }
                }
                out.put_int(long_rel);
            }
        }
        Operand::Register(r) => {
            if cond.is_some() {
                return Err(Error::InvalidValue(
                    "conditional jump through a register is not supported".into(),
                ));
            }
            out.put_byte(0xff);
            out.put_byte(modrm_reg(4, r));
        }
        Operand::Reference(rid) => {
            if cond.is_some() {
                return Err(Error::InvalidValue(
                    "conditional jump through a reference is not supported".into(),
                ));
            }
            if rex_capable {
                out.put_byte(0x48);
                out.put_byte(0xe9);
                out.put_ref(RefKind::Jump, rid.index(), 4);
            } else {
                out.put_byte(0xe9);
                out.put_ref(RefKind::RelativePtr, rid.index(), 4);
            }
        }
        _ => return Err(Error::InvalidValue("jmp: unsupported target".into())),
    }
    Ok(())
}

fn encode_call(target: Operand, out: &mut dyn Output, rex_capable: bool) -> CodegenResult<()> {
    match target {
        Operand::Label(label) => {
            if out.label_offset(label).is_err() {
                out.put_byte(0xe8);
                out.put_int(0);
                return Ok(());
            }
            let target_off = out.label_offset(label)?;
            let rel = target_off as i64 - (out.position() as i64 + 5);
            let rel = i32::try_from(rel)
                .map_err(|_| Error::InvalidValue(format!("call to {} out of i32 range", label)))?;
            out.put_byte(0xe8);
            out.put_int(rel);
        }
        Operand::Register(r) => {
            out.put_byte(0xff);
            out.put_byte(modrm_reg(2, r));
        }
        Operand::Reference(rid) => {
            // `spec.md` §4.G: on x86-64 this is a `jump`-kind patch slot
            // (`48 e8 <disp32>`/`ff 15 <disp32>`, chosen by the patcher at
            // patch time), not a plain relative call, so the reference
            // patcher can still redirect it after a GC move without
            // shifting any following code. x86 has no such fallback and
            // keeps the plain relative form.
            if rex_capable {
                out.put_byte(0x48);
                out.put_byte(0xe8);
                out.put_ref(RefKind::Jump, rid.index(), 4);
            } else {
                out.put_byte(0xe8);
                out.put_ref(RefKind::RelativePtr, rid.index(), 4);
            }
        }
        _ => return Err(Error::InvalidValue("call: unsupported target".into())),
    }
    Ok(())
}

fn encode_sse(op: Opcode, dest: Operand, src: Operand, out: &mut dyn Output) -> CodegenResult<()> {
    let d = reg_of(dest)?;
    let s = reg_of(src)?;
    let opbyte = match op {
        Opcode::MovSs => 0x10,
        Opcode::AddSs => 0x58,
        Opcode::SubSs => 0x5c,
        Opcode::MulSs => 0x59,
        Opcode::DivSs => 0x5e,
        Opcode::UComiSs => 0x2e,
        _ => unreachable!(),
    };
    if op != Opcode::UComiSs {
        out.put_byte(0xf3);
    }
    if needs_rex(d) || needs_rex(s) {
        out.put_byte(rex(false, needs_rex(d), false, needs_rex(s)));
    }
    out.put_byte(0x0f);
    out.put_byte(opbyte);
    out.put_byte(modrm_reg(d.encoding() & 0b111, s));
    Ok(())
}

fn encode_cvtsi2ss(dest: Operand, src: Operand, out: &mut dyn Output) -> CodegenResult<()> {
    let d = reg_of(dest)?;
    let s = reg_of(src)?;
    out.put_byte(0xf3);
    if is_8_byte(&src) || needs_rex(d) || needs_rex(s) {
        out.put_byte(rex(is_8_byte(&src), needs_rex(d), false, needs_rex(s)));
    }
    out.put_byte(0x0f);
    out.put_byte(0x2a);
    out.put_byte(modrm_reg(d.encoding() & 0b111, s));
    Ok(())
}

fn encode_cvttss2si(dest: Operand, src: Operand, out: &mut dyn Output) -> CodegenResult<()> {
    let d = reg_of(dest)?;
    let s = reg_of(src)?;
    out.put_byte(0xf3);
    if is_8_byte(&dest) || needs_rex(d) || needs_rex(s) {
        out.put_byte(rex(is_8_byte(&dest), needs_rex(d), false, needs_rex(s)));
    }
    out.put_byte(0x0f);
    out.put_byte(0x2c);
    out.put_byte(modrm_reg(d.encoding() & 0b111, s));
    Ok(())
}

//! Two independent lowering passes that run before stack layout:
//!
//! - [`split_64bit_operands`]: on x86 (no native 64-bit GPRs), rewrites
//!   every instruction touching an 8-byte operand into a pair of 32-bit
//!   instructions over its low/high dwords.
//! - [`lower_fn_calls`]: expands the `FnParam`/`FnCall` queued-argument
//!   pseudo-ops into concrete `push`/`mov`/`call` sequences per the
//!   target's calling convention, and `ThrowError`/`AddRef`/`ReleaseRef`
//!   into instructions `isa::encode` actually accepts.
//!
//! See `spec.md` §4.D.

use crate::error::{CodegenResult, Error};
use crate::instruction::{self, Instruction};
use crate::isa::{CallConv, ParamLoc, TargetIsa};
use crate::listing::{Entry, Listing};
use crate::opcode::Opcode;
use crate::operand::Operand;
use crate::reg::Reg;
use crate::refs::RefId;
use crate::size::S_INT;
use smallvec::SmallVec;

/// Split every instruction with an 8-byte operand into a low/high dword
/// pair. A no-op on targets with native 64-bit registers; callers only
/// invoke this when `isa.pointer_size() == 4`.
pub fn split_64bit_operands(listing: &mut Listing) -> CodegenResult<()> {
    let old = std::mem::take(listing.entries_mut());
    let mut new_entries = Vec::with_capacity(old.len());
    for entry in old {
        let expanded = split_instruction(&entry.inst)?;
        match expanded {
            Some(insts) => {
                let mut iter = insts.into_iter();
                let first = iter
                    .next()
                    .expect("a split always produces at least one instruction");
                new_entries.push(Entry {
                    inst: first,
                    labels: entry.labels,
                });
                for inst in iter {
                    new_entries.push(Entry {
                        inst,
                        labels: SmallVec::new(),
                    });
                }
            }
            None => new_entries.push(entry),
        }
    }
    *listing.entries_mut() = new_entries;
    Ok(())
}

fn is_8_bytes(op: Operand) -> bool {
    op.size().map(|s| s.size32() == 8).unwrap_or(false)
}

fn split_instruction(inst: &Instruction) -> CodegenResult<Option<Vec<Instruction>>> {
    if !is_8_bytes(inst.dest()) && !is_8_bytes(inst.src()) {
        return Ok(None);
    }

    match inst.opcode() {
        Opcode::Mov => {
            let (dl, dh) = split_operand(inst.dest())?;
            let (sl, sh) = split_operand(inst.src())?;
            Ok(Some(vec![
                instruction::mov(dl, sl)?,
                instruction::mov(dh, sh)?,
            ]))
        }
        Opcode::Add => {
            let (dl, dh) = split_operand(inst.dest())?;
            let (sl, sh) = split_operand(inst.src())?;
            Ok(Some(vec![
                instruction::add(dl, sl)?,
                instruction::adc(dh, sh)?,
            ]))
        }
        Opcode::Sub => {
            let (dl, dh) = split_operand(inst.dest())?;
            let (sl, sh) = split_operand(inst.src())?;
            Ok(Some(vec![
                instruction::sub(dl, sl)?,
                instruction::sbb(dh, sh)?,
            ]))
        }
        Opcode::And | Opcode::Or | Opcode::Xor => {
            let (dl, dh) = split_operand(inst.dest())?;
            let (sl, sh) = split_operand(inst.src())?;
            let build: fn(Operand, Operand) -> CodegenResult<Instruction> = match inst.opcode() {
                Opcode::And => instruction::and,
                Opcode::Or => instruction::or,
                _ => instruction::xor,
            };
            Ok(Some(vec![build(dl, sl)?, build(dh, sh)?]))
        }
        Opcode::Neg => {
            let (dl, dh) = split_operand(inst.dest())?;
            // Two's complement of a double-word pair: invert both halves,
            // then add one with carry propagating from low to high.
            Ok(Some(vec![
                instruction::not(dl)?,
                instruction::not(dh)?,
                instruction::add(dl, Operand::constant(1, S_INT))?,
                instruction::adc(dh, Operand::constant(0, S_INT))?,
            ]))
        }
        Opcode::Not => {
            let (dl, dh) = split_operand(inst.dest())?;
            Ok(Some(vec![instruction::not(dl)?, instruction::not(dh)?]))
        }
        Opcode::Push => {
            let (sl, sh) = split_operand(inst.dest())?;
            // Stack grows down; pushing the high half first leaves the low
            // half at the lower address, matching how a little-endian
            // 8-byte value's two dwords are addressed once on the stack.
            Ok(Some(vec![instruction::push(sh)?, instruction::push(sl)?]))
        }
        Opcode::Pop => {
            let (dl, dh) = split_operand(inst.dest())?;
            Ok(Some(vec![instruction::pop(dl)?, instruction::pop(dh)?]))
        }
        Opcode::Dat => {
            let (sl, sh) = split_operand(inst.src())?;
            Ok(Some(vec![
                dat_from(sl)?,
                dat_from(sh)?,
            ]))
        }
        Opcode::Cmp | Opcode::Test | Opcode::Shl | Opcode::Shr | Opcode::Sar | Opcode::Mul
        | Opcode::Imul => Err(Error::InvalidValue(format!(
            "{}: 64-bit operands must be expressed as explicit 32-bit \
             high/low operations with branches before reaching this \
             pipeline on a 32-bit target",
            inst.opcode()
        ))),
        _ => Err(Error::InvalidValue(format!(
            "{}: does not support an 8-byte operand on a 32-bit target",
            inst.opcode()
        ))),
    }
}

fn dat_from(op: Operand) -> CodegenResult<Instruction> {
    match op {
        Operand::Constant { value, size } => instruction::dat(value, size),
        _ => Err(Error::InvalidValue(
            "dat: split high/low half must be a constant".into(),
        )),
    }
}

/// Split one 8-byte operand into its low and high 32-bit halves.
fn split_operand(op: Operand) -> CodegenResult<(Operand, Operand)> {
    match op {
        Operand::Variable { var, offset, size } if size.size32() == 8 => Ok((
            Operand::Variable {
                var,
                offset,
                size: S_INT,
            },
            Operand::Variable {
                var,
                offset: offset + 4,
                size: S_INT,
            },
        )),
        Operand::Relative { base, offset, size } if size.size32() == 8 => Ok((
            Operand::Relative {
                base,
                offset,
                size: S_INT,
            },
            Operand::Relative {
                base,
                offset: offset + 4,
                size: S_INT,
            },
        )),
        Operand::Constant { value, size } if size.size32() == 8 => Ok((
            Operand::constant(value, S_INT),
            Operand::constant(value >> 32, S_INT),
        )),
        Operand::None => Ok((Operand::None, Operand::None)),
        other if other.size().map(|s| s.size32()) != Some(8) => Ok((other, Operand::None)),
        other => Err(Error::InvalidValue(format!(
            "cannot split an 8-byte {:?} operand into 32-bit halves",
            other.kind()
        ))),
    }
}

/// Lower `FnParam`/`FnCall` queued-argument pseudo-ops into concrete
/// `push`/`mov`/`call` sequences, and `ThrowError`/`AddRef`/`ReleaseRef`
/// into instructions the assembler accepts. Returns the references named
/// by every `AddRef` seen, for the caller to keep alive in the code
/// object's aux reference array (`crate::output::CodeOutput::set_aux_refs_ptr`'s
/// reserved slot) independent of whether they're embedded in code bytes.
pub fn lower_fn_calls(listing: &mut Listing, isa: &dyn TargetIsa) -> CodegenResult<Vec<RefId>> {
    let old = std::mem::take(listing.entries_mut());
    let mut new_entries = Vec::with_capacity(old.len());
    let mut pending_params: Vec<Operand> = Vec::new();
    let mut extra_refs = Vec::new();
    let mut throw_target: Option<RefId> = None;

    for entry in old {
        match entry.inst.opcode() {
            Opcode::FnParam => {
                pending_params.push(entry.inst.src());
                // A label queued onto a FnParam still needs somewhere to
                // land; attach it to the first instruction of the call this
                // param feeds, by carrying it forward via a synthetic nop
                // when no lowered instruction would otherwise exist yet.
                if !entry.labels.is_empty() {
                    new_entries.push(Entry {
                        inst: instruction::nop(),
                        labels: entry.labels,
                    });
                }
            }
            Opcode::FnCall => {
                let params = std::mem::take(&mut pending_params);
                let insts = lower_call(&params, entry.inst.src(), isa)?;
                push_lowered(&mut new_entries, insts, entry.labels);
            }
            Opcode::ThrowError => {
                let target = *throw_target.get_or_insert_with(|| {
                    listing.refs().create(Some("raiseException"))
                });
                let insts = lower_call(&[entry.inst.dest()], Operand::Reference(target), isa)?;
                push_lowered(&mut new_entries, insts, entry.labels);
            }
            Opcode::AddRef => {
                if let Operand::Reference(r) = entry.inst.src() {
                    extra_refs.push(r);
                }
                if !entry.labels.is_empty() {
                    new_entries.push(Entry {
                        inst: instruction::nop(),
                        labels: entry.labels,
                    });
                }
            }
            Opcode::ReleaseRef => {
                if !entry.labels.is_empty() {
                    new_entries.push(Entry {
                        inst: instruction::nop(),
                        labels: entry.labels,
                    });
                }
            }
            _ => new_entries.push(entry),
        }
    }

    *listing.entries_mut() = new_entries;
    Ok(extra_refs)
}

fn push_lowered(
    new_entries: &mut Vec<Entry>,
    insts: Vec<Instruction>,
    labels: SmallVec<[crate::label::Label; 2]>,
) {
    let mut iter = insts.into_iter();
    let first = iter
        .next()
        .expect("a lowered call always produces at least one instruction");
    new_entries.push(Entry {
        inst: first,
        labels,
    });
    for inst in iter {
        new_entries.push(Entry {
            inst,
            labels: SmallVec::new(),
        });
    }
}

/// Build a `push`/`mov`/`call`[`/add rsp`] sequence invoking `target` with
/// `params`, per `isa`'s calling convention. Shared by `FnCall` lowering and
/// the prolog pass's block-exit destructor dispatch, which needs the exact
/// same argument-passing rules for a one-argument destructor call.
pub(super) fn lower_call(
    params: &[Operand],
    target: Operand,
    isa: &dyn TargetIsa,
) -> CodegenResult<Vec<Instruction>> {
    let mut out = Vec::new();
    let mut stack_args = Vec::new();

    for (i, &p) in params.iter().enumerate() {
        match isa.first_param_loc(i) {
            ParamLoc::Reg(r) => out.push(instruction::mov(Operand::reg(r), p)?),
            ParamLoc::Stack(_) => stack_args.push(p),
        }
    }

    // Pushed right-to-left so the first stack argument ends up nearest the
    // return address, matching cdecl/SysV stack-argument order. Windows
    // fastcall's shadow space is a fixed `sub rsp, 32` the prolog/epilog
    // pass reserves, not pushes, so callers with more than four integer
    // arguments under that convention are outside what this lowering
    // handles.
    for &p in stack_args.iter().rev() {
        out.push(instruction::push(p)?);
    }

    out.push(instruction::call(target)?);

    if !stack_args.is_empty() && isa.call_conv() != CallConv::WindowsFastcall {
        let ptr_size = isa.pointer_size();
        out.push(instruction::add(
            Operand::reg(Reg::Rsp),
            // `Operand::size()` reports every register as pointer-sized
            // regardless of target, so the cleanup constant must be
            // `S_PTR`-sized too or `Instruction::build`'s same-size check
            // for the arithmetic family rejects this pairing.
            Operand::constant((stack_args.len() as i64) * ptr_size as i64, crate::size::S_PTR),
        )?);
    }

    Ok(out)
}

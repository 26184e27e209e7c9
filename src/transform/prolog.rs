//! Prolog/epilog expansion and block-exit destructor dispatch: the pass
//! that turns the `Prolog`/`Epilog`/`Begin`/`End` pseudo-ops into concrete
//! instructions, now that [`StackLayout`] has fixed every variable's frame
//! offset. Runs after `compute_layout` and `resolve_variables`, so the
//! destructor calls this pass synthesizes build `Relative` operands
//! directly from `layout` rather than `Operand::Variable` (which nothing
//! downstream resolves anymore by this point). See `spec.md` §4.D
//! ("Prolog/Epilog") and §4.C ("Destructors").

use super::layout::StackLayout;
use super::lower64::lower_call;
use crate::error::CodegenResult;
use crate::frame::{Frame, FreeOpt, Part};
use crate::instruction::{self, Instruction};
use crate::isa::{ParamLoc, TargetIsa};
use crate::label::Label;
use crate::listing::{Entry, Listing};
use crate::opcode::Opcode;
use crate::operand::Operand;
use crate::reg::{Reg, PTR_A};
use crate::size::{Size, S_PTR};
use smallvec::SmallVec;

/// Byte offsets the DWARF FDE builder needs once assembly fixes them: where
/// `push rbp` lands, where `rbp` becomes the function's frame pointer, where
/// each preserved register's spill store lands, and where each epilog's
/// `pop rbp` lands. A function's CFA is `rbp+16` from `set_rbp_at` onward
/// (`spec.md` §6); each `epilog_at` entry is where the CFA reverts to
/// tracking `rsp+8` once the frame pointer has been popped.
#[derive(Debug, Clone)]
pub struct PrologLabels {
    /// Marks the `push rbp` instruction.
    pub push_rbp_at: Label,
    /// Marks the `mov rbp, rsp` instruction immediately after it.
    pub set_rbp_at: Label,
    /// One label per entry in [`StackLayout::preserved`], marking that
    /// register's spill-store instruction.
    pub preserve_at: Vec<Label>,
    /// One label per lowered `Epilog`, marking its `pop rbp` instruction. A
    /// listing with more than one early-return epilog lowers to more than
    /// one entry here.
    pub epilog_at: Vec<Label>,
}

/// Expand every `Prolog`/`Epilog`/`Begin`/`End` in `listing` in place.
pub fn expand(
    listing: &mut Listing,
    isa: &dyn TargetIsa,
    layout: &StackLayout,
) -> CodegenResult<PrologLabels> {
    let push_rbp_at = listing.create_label();
    let set_rbp_at = listing.create_label();
    let preserve_at: Vec<Label> = layout.preserved().iter().map(|_| listing.create_label()).collect();
    let mut epilog_at: Vec<Label> = Vec::new();

    let old = std::mem::take(listing.entries_mut());
    let mut new_entries = Vec::with_capacity(old.len());
    let mut open_parts: Vec<Part> = Vec::new();

    for entry in old {
        match entry.inst.opcode() {
            Opcode::Prolog => {
                let (insts, preserve_indices) = build_prolog(listing.frame(), isa, layout)?;
                push_labeled(&mut new_entries, insts, entry.labels, |i| {
                    if i == 0 {
                        SmallVec::from_slice(&[push_rbp_at])
                    } else if i == 1 {
                        SmallVec::from_slice(&[set_rbp_at])
                    } else if let Some(k) = preserve_indices.iter().position(|&idx| idx == i) {
                        SmallVec::from_slice(&[preserve_at[k]])
                    } else {
                        SmallVec::new()
                    }
                });
            }
            Opcode::Epilog => {
                let (insts, pop_index) = build_epilog(layout)?;
                let this_epilog_at = listing.create_label();
                epilog_at.push(this_epilog_at);
                push_labeled(&mut new_entries, insts, entry.labels, |i| {
                    if i == pop_index {
                        SmallVec::from_slice(&[this_epilog_at])
                    } else {
                        SmallVec::new()
                    }
                });
            }
            Opcode::Begin => {
                if let Operand::PartRef(part) = entry.inst.dest() {
                    open_parts.push(part);
                }
                carry_labels(&mut new_entries, entry.labels);
            }
            Opcode::End => {
                let insts = match open_parts.pop() {
                    Some(part) => build_block_exit(listing.frame(), part, layout, isa)?,
                    None => Vec::new(),
                };
                if insts.is_empty() {
                    carry_labels(&mut new_entries, entry.labels);
                } else {
                    push_labeled(&mut new_entries, insts, entry.labels, |_| SmallVec::new());
                }
            }
            _ => new_entries.push(entry),
        }
    }

    *listing.entries_mut() = new_entries;
    Ok(PrologLabels {
        push_rbp_at,
        set_rbp_at,
        preserve_at,
        epilog_at,
    })
}

/// Attach any labels an erased pseudo-op carried to a synthetic `Nop`, so
/// they still resolve to a real byte position once assembled.
fn carry_labels(new_entries: &mut Vec<Entry>, labels: SmallVec<[Label; 2]>) {
    if !labels.is_empty() {
        new_entries.push(Entry {
            inst: instruction::nop(),
            labels,
        });
    }
}

fn push_labeled(
    new_entries: &mut Vec<Entry>,
    insts: Vec<Instruction>,
    first_labels: SmallVec<[Label; 2]>,
    mut extra_labels_for: impl FnMut(usize) -> SmallVec<[Label; 2]>,
) {
    for (i, inst) in insts.into_iter().enumerate() {
        let mut labels = extra_labels_for(i);
        if i == 0 {
            labels.extend(first_labels.iter().copied());
        }
        new_entries.push(Entry { inst, labels });
    }
}

/// `push rbp; mov rbp, rsp; sub rsp, frameSize; <spill each register this
/// function body writes that the calling convention requires preserved>;
/// <spill each register-arriving parameter to its home in the frame>`.
///
/// Returns the built instructions alongside the index (within that vec) of
/// each preserved register's spill store, in the same order as
/// `layout.preserved()`, so `expand` can attach a DWARF-tracking label to
/// each one.
fn build_prolog(
    frame: &Frame,
    isa: &dyn TargetIsa,
    layout: &StackLayout,
) -> CodegenResult<(Vec<Instruction>, Vec<usize>)> {
    let mut out = vec![
        instruction::push(Operand::reg(Reg::Rbp))?,
        instruction::mov(Operand::reg(Reg::Rbp), Operand::reg(Reg::Rsp))?,
    ];
    if layout.frame_size > 0 {
        out.push(instruction::sub(
            Operand::reg(Reg::Rsp),
            Operand::constant(layout.frame_size as i64, S_PTR),
        )?);
    }

    let mut preserve_indices = Vec::with_capacity(layout.preserved().len());
    for &(reg, offset) in layout.preserved() {
        out.push(instruction::mov(
            Operand::relative(Reg::Rbp, offset, S_PTR)?,
            Operand::reg(reg),
        )?);
        preserve_indices.push(out.len() - 1);
    }

    let params = frame.params();
    for (i, &v) in params.iter().enumerate() {
        if let ParamLoc::Reg(r) = layout.param_loc(i) {
            // The spill slot is pointer-wide (see `layout::compute_layout`),
            // matching `Operand::Register`'s fixed `S_PTR` reported size; a
            // read that only needs the parameter's declared narrower size
            // addresses the low bytes of this same slot.
            out.push(instruction::mov(
                Operand::relative(Reg::Rbp, layout.offset_of(v), S_PTR)?,
                Operand::reg(r),
            )?);
        }
    }

    Ok((out, preserve_indices))
}

/// `<restore each preserved register, reverse of the prolog's spill order>;
/// mov rsp, rbp; pop rbp; ret 0`.
///
/// Returns the built instructions alongside the index of the `pop rbp`
/// instruction, so `expand` can attach the label marking where the CFA
/// reverts to `rsp`-relative tracking.
fn build_epilog(layout: &StackLayout) -> CodegenResult<(Vec<Instruction>, usize)> {
    let mut out = Vec::new();
    for &(reg, offset) in layout.preserved().iter().rev() {
        out.push(instruction::mov(
            Operand::reg(reg),
            Operand::relative(Reg::Rbp, offset, S_PTR)?,
        )?);
    }
    out.push(instruction::mov(Operand::reg(Reg::Rsp), Operand::reg(Reg::Rbp))?);
    let pop_index = out.len();
    out.push(instruction::pop(Operand::reg(Reg::Rbp))?);
    out.push(instruction::ret(0)?);
    Ok((out, pop_index))
}

/// Destructor dispatch for every `onBlockExit`-armed, non-`inactive`
/// variable declared directly in `part`, called in reverse declaration
/// order (unwound LIFO, mirroring how a constructed chain of locals is
/// torn down).
fn build_block_exit(
    frame: &Frame,
    part: Part,
    layout: &StackLayout,
    isa: &dyn TargetIsa,
) -> CodegenResult<Vec<Instruction>> {
    let mut out = Vec::new();
    let vars = frame.vars_in_part(part).unwrap_or(&[]);
    for &v in vars.iter().rev() {
        let opt = frame.var_opt(v);
        if !opt.contains(FreeOpt::ON_BLOCK_EXIT) || opt.contains(FreeOpt::INACTIVE) {
            continue;
        }
        let Some(free_fn) = frame.var_free_fn(v) else {
            continue;
        };
        let arg = if opt.contains(FreeOpt::BY_POINTER) {
            let byte_size = frame
                .var_size(v)
                .for_pointer_size(isa.pointer_size())
                .max(1);
            let slot = Operand::relative(Reg::Rbp, layout.offset_of(v), Size::scalar(byte_size))?;
            out.push(instruction::lea(Operand::reg(PTR_A), slot)?);
            Operand::reg(PTR_A)
        } else {
            // A by-value argument that ends up in a register must match
            // `Operand::Register`'s fixed `S_PTR` reported size (see
            // `build_prolog`'s spill slots for the same constraint); the
            // variable's own declared width only matters for in-memory
            // reads, not register traffic.
            Operand::relative(Reg::Rbp, layout.offset_of(v), S_PTR)?
        };
        out.extend(lower_call(&[arg], Operand::Reference(free_fn), isa)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x64::X64;
    use crate::isa::CallConv;
    use crate::size::S_LONG;
    use crate::transform::layout::compute_layout;

    fn isa() -> X64 {
        X64::new(CallConv::SystemV)
    }

    #[test]
    fn prolog_pushes_rbp_sets_it_and_reserves_the_frame() {
        let mut l = Listing::new();
        let part = l.frame().first_part(l.frame().root()).unwrap();
        l.create_var(part, S_LONG, None, FreeOpt::empty()).unwrap();
        l.push(instruction::prolog().unwrap()).unwrap();
        let isa = isa();
        let layout = compute_layout(&l, &isa, &[]);
        let prolog_labels = expand(&mut l, &isa, &layout).unwrap();

        assert_eq!(l.entries()[0].inst.opcode(), Opcode::Push);
        assert!(l.entries()[0].labels.contains(&prolog_labels.push_rbp_at));
        assert_eq!(l.entries()[1].inst.opcode(), Opcode::Mov);
        assert!(l.entries()[1].labels.contains(&prolog_labels.set_rbp_at));
        assert_eq!(l.entries()[2].inst.opcode(), Opcode::Sub);
    }

    #[test]
    fn prolog_spills_register_parameters() {
        let mut l = Listing::new();
        l.create_param(S_LONG);
        l.push(instruction::prolog().unwrap()).unwrap();
        let isa = isa();
        let layout = compute_layout(&l, &isa, &[]);
        expand(&mut l, &isa, &layout).unwrap();
        // push, mov rbp, one spill mov (no locals, so no `sub rsp`).
        assert_eq!(l.entries().len(), 3);
        assert_eq!(l.entries()[2].inst.opcode(), Opcode::Mov);
        assert_eq!(l.entries()[2].inst.dest(), Operand::relative(Reg::Rbp, layout.offset_of(*l.frame().params().first().unwrap()), S_PTR).unwrap());
    }

    #[test]
    fn epilog_restores_stack_and_returns() {
        let mut l = Listing::new();
        l.push(instruction::epilog().unwrap()).unwrap();
        let isa = isa();
        let layout = compute_layout(&l, &isa, &[]);
        expand(&mut l, &isa, &layout).unwrap();
        assert_eq!(l.entries()[0].inst.opcode(), Opcode::Mov);
        assert_eq!(l.entries()[1].inst.opcode(), Opcode::Pop);
        assert_eq!(l.entries()[2].inst.opcode(), Opcode::Ret);
    }

    #[test]
    fn block_exit_calls_destructor_for_on_block_exit_variable() {
        let mut l = Listing::new();
        let root = l.frame().root();
        let part = l.frame().first_part(root).unwrap();
        let dtor = l.refs().create(Some("dtor"));
        l.create_var(part, S_LONG, Some(dtor), FreeOpt::ON_BLOCK_EXIT)
            .unwrap();
        l.push(instruction::begin(Operand::PartRef(part)).unwrap())
            .unwrap();
        l.push(instruction::end().unwrap()).unwrap();
        let isa = isa();
        let layout = compute_layout(&l, &isa, &[]);
        expand(&mut l, &isa, &layout).unwrap();
        assert!(l.entries().iter().any(|e| e.inst.opcode() == Opcode::Call));
    }

    #[test]
    fn inactive_variable_is_not_destructed_on_block_exit() {
        let mut l = Listing::new();
        let root = l.frame().root();
        let part = l.frame().first_part(root).unwrap();
        let dtor = l.refs().create(Some("dtor"));
        l.create_var(
            part,
            S_LONG,
            Some(dtor),
            FreeOpt::ON_BLOCK_EXIT | FreeOpt::INACTIVE,
        )
        .unwrap();
        l.push(instruction::begin(Operand::PartRef(part)).unwrap())
            .unwrap();
        l.push(instruction::end().unwrap()).unwrap();
        let isa = isa();
        let layout = compute_layout(&l, &isa, &[]);
        expand(&mut l, &isa, &layout).unwrap();
        assert!(!l.entries().iter().any(|e| e.inst.opcode() == Opcode::Call));
    }

    #[test]
    fn by_pointer_destructor_takes_the_slots_address() {
        let mut l = Listing::new();
        let root = l.frame().root();
        let part = l.frame().first_part(root).unwrap();
        let dtor = l.refs().create(Some("dtor"));
        l.create_var(
            part,
            S_LONG,
            Some(dtor),
            FreeOpt::ON_BLOCK_EXIT | FreeOpt::BY_POINTER,
        )
        .unwrap();
        l.push(instruction::begin(Operand::PartRef(part)).unwrap())
            .unwrap();
        l.push(instruction::end().unwrap()).unwrap();
        let isa = isa();
        let layout = compute_layout(&l, &isa, &[]);
        expand(&mut l, &isa, &layout).unwrap();
        assert!(l.entries().iter().any(|e| e.inst.opcode() == Opcode::Lea));
    }

    #[test]
    fn preserved_register_is_spilled_in_prolog_and_restored_in_epilog() {
        let mut l = Listing::new();
        l.push(instruction::prolog().unwrap()).unwrap();
        l.push(instruction::mov(Operand::reg(Reg::Rbx), Operand::constant(1, S_LONG)).unwrap())
            .unwrap();
        l.push(instruction::epilog().unwrap()).unwrap();
        let isa = isa();
        let layout = compute_layout(&l, &isa, &[Reg::Rbx]);
        let prolog_labels = expand(&mut l, &isa, &layout).unwrap();

        // push rbp; mov rbp, rsp; sub rsp, frameSize; mov [rbp+off], rbx
        assert_eq!(l.entries()[3].inst.opcode(), Opcode::Mov);
        assert_eq!(
            l.entries()[3].inst.dest(),
            Operand::relative(Reg::Rbp, layout.preserved()[0].1, S_PTR).unwrap()
        );
        assert_eq!(l.entries()[3].inst.src(), Operand::reg(Reg::Rbx));
        assert_eq!(prolog_labels.preserve_at.len(), 1);
        assert!(l.entries()[3].labels.contains(&prolog_labels.preserve_at[0]));

        // The restore must precede `mov rsp, rbp; pop rbp; ret`, and must
        // read back the exact slot the prolog stored into.
        let restore_at = l
            .entries()
            .iter()
            .position(|e| {
                e.inst.opcode() == Opcode::Mov
                    && e.inst.dest() == Operand::reg(Reg::Rbx)
                    && matches!(e.inst.src(), Operand::Relative { .. })
            })
            .unwrap();
        assert_eq!(
            l.entries()[restore_at].inst.src(),
            Operand::relative(Reg::Rbp, layout.preserved()[0].1, S_PTR).unwrap()
        );
        let pop_at = l
            .entries()
            .iter()
            .position(|e| e.inst.opcode() == Opcode::Pop)
            .unwrap();
        assert!(restore_at < pop_at);
        assert_eq!(prolog_labels.epilog_at.len(), 1);
        assert!(l.entries()[pop_at].labels.contains(&prolog_labels.epilog_at[0]));
    }

    #[test]
    fn no_preserved_registers_means_no_spill_or_restore() {
        let mut l = Listing::new();
        l.push(instruction::prolog().unwrap()).unwrap();
        l.push(instruction::epilog().unwrap()).unwrap();
        let isa = isa();
        let layout = compute_layout(&l, &isa, &[]);
        let prolog_labels = expand(&mut l, &isa, &layout).unwrap();
        assert!(prolog_labels.preserve_at.is_empty());
        // push, mov rbp, mov rsp, pop, ret: no frame-size sub, no preserve.
        assert_eq!(l.entries().len(), 5);
    }
}

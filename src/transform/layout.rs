//! Stack-slot assignment: lays out every local below the saved frame
//! pointer and records where each parameter arrives. See `spec.md` §4.D.

use crate::error::CodegenResult;
use crate::frame::Variable;
use crate::isa::{ParamLoc, TargetIsa};
use crate::listing::Listing;
use crate::operand::Operand;
use crate::reg::Reg;
use cranelift_entity::{EntityRef, SecondaryMap};

/// Where one hidden exception-handling slot lives, relative to `rbp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhSlots {
    /// Offset of the "current part id" slot, updated on every `begin`/
    /// `end` so an in-flight exception knows which destructors are armed.
    pub current_part_id: i32,
    /// Offset of the "block pointer" slot, the address the exception
    /// dispatcher resumes into once it selects a catch clause.
    pub block_pointer: i32,
}

/// Where each variable in a listing's frame lives once compiled.
pub struct StackLayout {
    /// `rbp`-relative byte offset of every variable, local or parameter.
    /// A register-arriving parameter's offset is its spill home, filled by
    /// the prolog; a stack-arriving parameter's offset is its incoming
    /// location directly (`8 + ` the calling convention's stack offset, to
    /// skip the pushed return address).
    offsets: SecondaryMap<Variable, i32>,
    /// Total bytes of stack storage below the saved frame pointer
    /// (locals plus register-parameter spill homes), 16-byte aligned (the
    /// SysV stack-alignment requirement at `call` boundaries).
    pub frame_size: u32,
    /// Present iff the listing's frame requires exception-driven
    /// destructor dispatch (`Listing::eh_clean` or `Listing::eh_catch`).
    pub eh_slots: Option<EhSlots>,
    param_locs: Vec<ParamLoc>,
    /// Every register the prolog must spill to its own stack slot because
    /// the function body writes it and the calling convention requires the
    /// caller to see it unchanged on return, paired with its `rbp`-relative
    /// offset. Same order as [`crate::transform::liveness::used_callee_saved_registers`]
    /// returned them in.
    preserved: Vec<(Reg, i32)>,
}

impl StackLayout {
    /// The `rbp`-relative offset of variable `v`, local or parameter.
    pub fn offset_of(&self, v: Variable) -> i32 {
        self.offsets[v]
    }

    /// Where the `index`th parameter arrives on entry, per the ISA's
    /// calling convention — a register the prolog must spill, or an
    /// incoming stack location that's already `v`'s home.
    pub fn param_loc(&self, index: usize) -> ParamLoc {
        self.param_locs[index]
    }

    /// Every register the prolog spills for later restoration, with its
    /// `rbp`-relative slot offset.
    pub fn preserved(&self) -> &[(Reg, i32)] {
        &self.preserved
    }
}

/// Compute the stack layout for `listing` under `isa`'s calling
/// convention.
///
/// Locals are packed downward from the saved frame pointer in declaration
/// order, each aligned to its own size (self-aligned, capped at the
/// platform maximum — the same rule [`crate::size::Size`] enforces for
/// struct layout, applied here to the stack instead). The two hidden
/// exception-handling slots, when needed, are placed first so they sit at
/// a frame-size-independent offset the unwinder's generated dispatch code
/// can hardcode.
pub fn compute_layout(listing: &Listing, isa: &dyn TargetIsa, preserved_regs: &[Reg]) -> StackLayout {
    let mut offsets = SecondaryMap::new();
    let mut cursor: i32 = 0;

    let eh_slots = if listing.eh_clean() || listing.eh_catch() {
        cursor -= 8;
        let current_part_id = cursor;
        cursor -= 8;
        let block_pointer = cursor;
        Some(EhSlots {
            current_part_id,
            block_pointer,
        })
    } else {
        None
    };

    let frame = listing.frame();
    let pointer_size = isa.pointer_size();
    for i in 0..frame.block_count() {
        let block = crate::frame::Block::new(i);
        layout_block(frame, block, pointer_size, &mut offsets, &mut cursor);
    }

    let params = frame.params();
    let param_locs: Vec<ParamLoc> = (0..params.len())
        .map(|i| isa.first_param_loc(i))
        .collect();

    // Parameters share the same `offsets` map as locals, so later lowering
    // can resolve an `Operand::Variable` without caring whether it names a
    // local or a parameter. A register-arriving parameter needs a spill
    // home carved out of the frame; the slot is always a full pointer wide
    // regardless of the parameter's declared type, since `Operand::Register`
    // has no narrower view in this model (every GPR reports `S_PTR` from
    // `Operand::size`) and the prolog spills the whole register. A
    // stack-arriving parameter already has a home on the caller's side of
    // the saved `rbp`, so it just gets that fixed positive offset.
    let ptr_size = isa.pointer_size() as i32;
    for (i, &v) in params.iter().enumerate() {
        match param_locs[i] {
            ParamLoc::Reg(_) => {
                cursor -= ptr_size;
                cursor -= cursor.rem_euclid(ptr_size);
                offsets[v] = cursor;
            }
            ParamLoc::Stack(off) => {
                offsets[v] = 8 + off;
            }
        }
    }

    // Preserved registers get their own pointer-sized, pointer-aligned slot
    // below the locals and parameter spill homes, folded into the same
    // `frame_size` rounding as everything else so the 16-byte `call`-site
    // alignment invariant holds regardless of how many registers a given
    // function happens to write.
    let mut preserved = Vec::with_capacity(preserved_regs.len());
    for &r in preserved_regs {
        cursor -= ptr_size;
        cursor -= cursor.rem_euclid(ptr_size);
        preserved.push((r, cursor));
    }

    let frame_size = round_up_16((-cursor) as u32);

    StackLayout {
        offsets,
        frame_size,
        eh_slots,
        param_locs,
        preserved,
    }
}

/// Rewrite every `Operand::Variable` in `listing` into the `Operand::Relative`
/// it resolves to under `layout`, now that every variable — local or
/// parameter — has a fixed `rbp`-relative offset. Must run after
/// `compute_layout` and before `isa.encode` sees the listing: `isa::encode`
/// only understands `Relative` memory operands, not frame-relative
/// variables.
pub fn resolve_variables(listing: &mut Listing, layout: &StackLayout) -> CodegenResult<()> {
    for entry in listing.entries_mut() {
        let dest = resolve_operand(entry.inst.dest(), layout)?;
        let src = resolve_operand(entry.inst.src(), layout)?;
        entry.inst = entry.inst.with_operands(dest, src);
    }
    Ok(())
}

fn resolve_operand(op: Operand, layout: &StackLayout) -> CodegenResult<Operand> {
    match op {
        Operand::Variable { var, offset, size } => {
            Operand::relative(Reg::Rbp, layout.offset_of(var) + offset, size)
        }
        other => Ok(other),
    }
}

fn layout_block(
    frame: &crate::frame::Frame,
    block: crate::frame::Block,
    pointer_size: u32,
    offsets: &mut SecondaryMap<Variable, i32>,
    cursor: &mut i32,
) {
    let parts = match frame.parts_of(block) {
        Ok(p) => p,
        Err(_) => return,
    };
    for &part in parts {
        let vars = frame.vars_in_part(part).unwrap_or(&[]);
        for &v in vars {
            let size = frame.var_size(v).for_pointer_size(pointer_size).max(1);
            let align = size.min(8) as i32;
            *cursor -= size as i32;
            // Round the slot's own address down to its alignment.
            *cursor -= cursor.rem_euclid(align);
            offsets[v] = *cursor;
        }
    }
}

fn round_up_16(n: u32) -> u32 {
    (n + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FreeOpt;
    use crate::isa::CallConv;
    use crate::isa::x64::X64;
    use crate::size::S_LONG;

    #[test]
    fn locals_get_distinct_negative_offsets() {
        let mut listing = Listing::new();
        let root = listing.frame().root();
        let part = listing.frame().first_part(root).unwrap();
        let v0 = listing.create_var(part, S_LONG, None, FreeOpt::empty()).unwrap();
        let v1 = listing.create_var(part, S_LONG, None, FreeOpt::empty()).unwrap();
        let isa = X64::new(CallConv::SystemV);
        let layout = compute_layout(&listing, &isa, &[]);
        assert_ne!(layout.offset_of(v0), layout.offset_of(v1));
        assert!(layout.offset_of(v0) < 0);
        assert!(layout.offset_of(v1) < 0);
    }

    #[test]
    fn frame_size_is_16_byte_aligned() {
        let mut listing = Listing::new();
        let root = listing.frame().root();
        let part = listing.frame().first_part(root).unwrap();
        listing.create_var(part, S_LONG, None, FreeOpt::empty()).unwrap();
        let isa = X64::new(CallConv::SystemV);
        let layout = compute_layout(&listing, &isa, &[]);
        assert_eq!(layout.frame_size % 16, 0);
    }

    #[test]
    fn register_param_gets_a_spill_slot_distinct_from_locals() {
        let mut listing = Listing::new();
        let root = listing.frame().root();
        let part = listing.frame().first_part(root).unwrap();
        let p0 = listing.create_param(S_LONG);
        let v0 = listing.create_var(part, S_LONG, None, FreeOpt::empty()).unwrap();
        let isa = X64::new(CallConv::SystemV);
        let layout = compute_layout(&listing, &isa, &[]);
        assert!(layout.offset_of(p0) < 0);
        assert_ne!(layout.offset_of(p0), layout.offset_of(v0));
        assert!(matches!(layout.param_loc(0), crate::isa::ParamLoc::Reg(_)));
    }

    #[test]
    fn stack_param_offset_skips_the_return_address() {
        let mut listing = Listing::new();
        // SysV passes the first six integer params in registers, so push
        // seven to force the seventh onto the incoming stack.
        let params: Vec<_> = (0..7).map(|_| listing.create_param(S_LONG)).collect();
        let isa = X64::new(CallConv::SystemV);
        let layout = compute_layout(&listing, &isa, &[]);
        let last = *params.last().unwrap();
        match layout.param_loc(6) {
            crate::isa::ParamLoc::Stack(off) => {
                assert_eq!(layout.offset_of(last), 8 + off);
            }
            crate::isa::ParamLoc::Reg(_) => panic!("expected the 7th integer param on the stack"),
        }
    }

    #[test]
    fn resolve_variables_rewrites_to_rbp_relative_operand() {
        use crate::instruction;

        let mut listing = Listing::new();
        let root = listing.frame().root();
        let part = listing.frame().first_part(root).unwrap();
        let v = listing.create_var(part, S_LONG, None, FreeOpt::empty()).unwrap();
        listing
            .push(
                instruction::mov(
                    Operand::Variable { var: v, offset: 0, size: S_LONG },
                    Operand::constant(1, S_LONG),
                )
                .unwrap(),
            )
            .unwrap();
        let isa = X64::new(CallConv::SystemV);
        let layout = compute_layout(&listing, &isa, &[]);
        let want = layout.offset_of(v);
        resolve_variables(&mut listing, &layout).unwrap();
        match listing.entries()[0].inst.dest() {
            Operand::Relative { base, offset, .. } => {
                assert_eq!(base, Reg::Rbp);
                assert_eq!(offset, want);
            }
            other => panic!("expected a resolved Relative operand, got {:?}", other),
        }
    }

    #[test]
    fn eh_slots_reserved_when_destructor_is_exception_armed() {
        let mut listing = Listing::new();
        let root = listing.frame().root();
        let part = listing.frame().first_part(root).unwrap();
        let free_fn = listing.refs().create(Some("dtor"));
        listing
            .create_var(part, S_LONG, Some(free_fn), FreeOpt::ON_EXCEPTION)
            .unwrap();
        let isa = X64::new(CallConv::SystemV);
        let layout = compute_layout(&listing, &isa, &[]);
        assert!(layout.eh_slots.is_some());
    }

    #[test]
    fn preserved_registers_get_distinct_slots_folded_into_frame_size() {
        let listing = Listing::new();
        let isa = X64::new(CallConv::SystemV);
        let layout = compute_layout(&listing, &isa, &[Reg::Rbx, Reg::R12]);
        let slots = layout.preserved();
        assert_eq!(slots.len(), 2);
        assert_ne!(slots[0].1, slots[1].1);
        assert!(slots[0].1 < 0 && slots[1].1 < 0);
        assert_eq!(layout.frame_size % 16, 0);
        assert!(layout.frame_size >= 16);
    }
}

//! Backward register-liveness scan over a listing's straight-line
//! instruction stream. See `spec.md` §4.D ("Liveness").
//!
//! This is a single linear backward pass, not a fixpoint over a control-flow
//! graph: every opcode that transfers control (`Opcode::clears_liveness`)
//! resets the live set, so liveness here answers "what must this
//! instruction and everything between it and the next control transfer
//! preserve", which is what the destructor-call and spill-avoidance callers
//! in the rest of the pipeline need. A real register allocator would want
//! full CFG liveness; this backend never allocates registers itself (see
//! `spec.md` Non-goals), so the simpler approximation is sufficient.

use crate::instruction::Instruction;
use crate::isa::TargetIsa;
use crate::listing::Listing;
use crate::opcode::{DestMode, Opcode};
use crate::operand::Operand;
use crate::reg::Reg;

/// The set of machine registers live at one point in a listing, as a
/// bitset over all 24 `Reg` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveSet(u32);

impl LiveSet {
    /// The empty set.
    pub fn empty() -> LiveSet {
        LiveSet(0)
    }

    /// Whether `r` is live.
    pub fn contains(&self, r: Reg) -> bool {
        self.0 & (1 << reg_bit(r)) != 0
    }

    /// Mark `r` live.
    pub fn insert(&mut self, r: Reg) {
        self.0 |= 1 << reg_bit(r);
    }

    /// Mark `r` not live.
    pub fn remove(&mut self, r: Reg) {
        self.0 &= !(1 << reg_bit(r));
    }

    /// Every register currently live, in `Reg` declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Reg> + '_ {
        ALL_REGS.iter().copied().filter(move |&r| self.contains(r))
    }
}

const ALL_REGS: [Reg; 24] = [
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
    Reg::Xmm0,
    Reg::Xmm1,
    Reg::Xmm2,
    Reg::Xmm3,
    Reg::Xmm4,
    Reg::Xmm5,
    Reg::Xmm6,
    Reg::Xmm7,
];

fn reg_bit(r: Reg) -> u32 {
    use Reg::*;
    match r {
        Rax => 0,
        Rcx => 1,
        Rdx => 2,
        Rbx => 3,
        Rsp => 4,
        Rbp => 5,
        Rsi => 6,
        Rdi => 7,
        R8 => 8,
        R9 => 9,
        R10 => 10,
        R11 => 11,
        R12 => 12,
        R13 => 13,
        R14 => 14,
        R15 => 15,
        Xmm0 => 16,
        Xmm1 => 17,
        Xmm2 => 18,
        Xmm3 => 19,
        Xmm4 => 20,
        Xmm5 => 21,
        Xmm6 => 22,
        Xmm7 => 23,
    }
}

/// Compute the live-before set of every instruction in `listing`, indexed
/// the same as `listing.entries()`.
pub fn analyze_liveness(listing: &Listing, isa: &dyn TargetIsa) -> Vec<LiveSet> {
    let entries = listing.entries();
    let mut result = vec![LiveSet::empty(); entries.len()];
    let mut live = LiveSet::empty();

    for i in (0..entries.len()).rev() {
        let inst = &entries[i].inst;

        if inst.opcode().clears_liveness() {
            live = LiveSet::empty();
        }
        if inst.opcode().is_call() {
            for &r in isa.caller_saved() {
                live.insert(r);
            }
        }

        if is_zero_idiom(inst) {
            if let Operand::Register(r) = inst.dest() {
                live.remove(r);
            }
        } else {
            remove_def(&mut live, inst.dest(), inst.dest_mode());
            add_dest_uses(&mut live, inst.dest(), inst.dest_mode());
            add_operand_uses(&mut live, inst.src());
        }

        result[i] = live;
    }

    result
}

/// `xor r, r` is the idiom this backend's instruction emitters use to zero
/// a register; the liveness scan must not treat it as reading `r`'s old
/// value, or every register zeroed this way would appear live one
/// instruction too early.
fn is_zero_idiom(inst: &Instruction) -> bool {
    matches!(
        (inst.opcode(), inst.dest(), inst.src()),
        (Opcode::Xor, Operand::Register(d), Operand::Register(s)) if d == s
    )
}

fn remove_def(live: &mut LiveSet, dest: Operand, mode: DestMode) {
    if mode.writes() {
        if let Operand::Register(r) = dest {
            live.remove(r);
        }
    }
}

fn add_dest_uses(live: &mut LiveSet, dest: Operand, mode: DestMode) {
    match dest {
        Operand::Register(r) if mode.reads() => live.insert(r),
        // A memory destination's base register is read to compute the
        // address even when the memory contents are write-only.
        Operand::Relative { base, .. } => live.insert(base),
        _ => {}
    }
}

fn add_operand_uses(live: &mut LiveSet, op: Operand) {
    match op {
        Operand::Register(r) => live.insert(r),
        Operand::Relative { base, .. } => live.insert(base),
        _ => {}
    }
}

/// Every callee-saved register (per `isa.callee_saved()`) that `listing`'s
/// body writes anywhere, in `isa.callee_saved()` order. Grounds the prolog
/// pass's preserve-slot allocation: a register nothing ever writes needs no
/// spill. Mirrors the original backend's `allUsedRegisters` scan, which
/// walks every instruction and collects the registers seen in `destWrite`
/// mode.
pub fn used_callee_saved_registers(listing: &Listing, isa: &dyn TargetIsa) -> Vec<Reg> {
    let mut used = LiveSet::empty();
    for entry in listing.entries() {
        let inst = &entry.inst;
        if inst.dest_mode().writes() {
            if let Operand::Register(r) = inst.dest() {
                used.insert(r);
            }
        }
    }
    isa.callee_saved()
        .iter()
        .copied()
        .filter(|&r| used.contains(r))
        .collect()
}

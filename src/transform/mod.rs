//! The transform pipeline: the sequence of listing-to-listing lowering
//! passes that run between IR construction and assembly. See `spec.md`
//! §4.D ("Transform Pipeline").
//!
//! Each pass owns one concern and runs in a fixed order: 64-bit operand
//! splitting (x86 only) and call lowering before stack layout, since both
//! can introduce new variable references; the used-register scan right
//! after, since it must see every register write call lowering introduces
//! before stack layout carves out preserve slots for them; stack layout
//! before variable resolution, since resolving an `Operand::Variable` needs
//! its offset;
//! variable resolution before prolog/epilog expansion, since the
//! destructor calls the prolog pass synthesizes build `Relative` operands
//! directly and nothing later would resolve a `Variable` one; prolog/
//! epilog before liveness, since liveness must see the real `push`/`pop`
//! traffic the prolog/epilog and destructor calls contribute. This mirrors
//! `cranelift-codegen`'s legalize-then-relax-then-emit pipeline shape
//! (`binemit/relaxation.rs`), adapted to a pipeline of listing rewrites
//! rather than in-place `Function` legalization.

mod layout;
mod liveness;
mod lower64;
mod prolog;

pub use layout::{compute_layout, resolve_variables, StackLayout};
pub use liveness::{analyze_liveness, used_callee_saved_registers, LiveSet};
pub use prolog::PrologLabels;

use crate::error::CodegenResult;
use crate::isa::TargetIsa;
use crate::listing::Listing;
use crate::refs::RefId;

/// Every artifact the transform pipeline hands to the assembler: the
/// rewritten listing is mutated in place, and the remaining fields record
/// what assembly and DWARF generation need but can't recompute from the
/// listing alone.
pub struct TransformResult {
    /// Final stack-slot assignment.
    pub layout: StackLayout,
    /// Labels marking the prolog's `push rbp` / post-`mov rbp, rsp` points,
    /// used to build the function's DWARF FDE after assembly fixes their
    /// byte offsets.
    pub prolog_labels: PrologLabels,
    /// Per-instruction live-register sets, backward liveness order.
    pub liveness: Vec<LiveSet>,
    /// References named by the listing's `AddRef` instructions, to keep
    /// alive in the code object's aux reference array independent of
    /// whether they're embedded anywhere in the emitted code bytes.
    pub extra_refs: Vec<RefId>,
}

/// Run every lowering pass over `listing` for `isa`, in order. After this
/// returns, `listing` contains only instructions `isa.encode` accepts
/// (no `Prolog`/`Epilog`/`FnCall`/... pseudo-ops) and is ready for the
/// two-pass assembler in [`crate::output`].
pub fn run(listing: &mut Listing, isa: &dyn TargetIsa) -> CodegenResult<TransformResult> {
    if isa.pointer_size() == 4 {
        lower64::split_64bit_operands(listing)?;
    }
    let extra_refs = lower64::lower_fn_calls(listing, isa)?;

    let preserved_regs = liveness::used_callee_saved_registers(listing, isa);
    let layout = layout::compute_layout(listing, isa, &preserved_regs);
    layout::resolve_variables(listing, &layout)?;
    let prolog_labels = prolog::expand(listing, isa, &layout)?;
    let liveness = liveness::analyze_liveness(listing, isa);

    Ok(TransformResult {
        layout,
        prolog_labels,
        liveness,
        extra_refs,
    })
}

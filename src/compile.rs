//! Top-level compilation entry point: runs the transform pipeline over a
//! listing, then drives the two-pass assembler to produce machine code and
//! its `GcCodeRef` side table. See `spec.md` §4.E and §6 (the `Arena`
//! façade's `transform`/`output` hooks).
//!
//! Grounded on `cranelift-codegen`'s `Context::compile` (`context.rs`): a
//! single persistent-free function that owns the whole
//! legalize-then-emit pipeline, so a caller never has to sequence the
//! passes itself or learn the two-pass assembler's internal offset-table
//! handoff.

use crate::dwarf::fde::FrameShape;
use crate::error::{CodegenResult, Error};
use crate::isa::TargetIsa;
use crate::listing::Listing;
use crate::output::{CodeOutput, GcCodeRef, LabelOutput, Output};
use crate::transform::{self, TransformResult};

/// Everything [`compile`] produces for one listing: the function's machine
/// code, the `GcCodeRef`s a moving collector must keep in sync, and the
/// prolog shape the caller needs to build this function's DWARF FDE.
pub struct CompiledFunction {
    /// The function's machine code bytes.
    pub code: Vec<u8>,
    /// Every embedded pointer the code carries, for [`crate::patch::patch_code`].
    pub refs: Vec<GcCodeRef>,
    /// Where this function's `push rbp`/`mov rbp, rsp` landed, for
    /// [`crate::dwarf::fde::build_fde`].
    pub frame_shape: FrameShape,
    /// What the transform pipeline computed along the way (stack layout,
    /// liveness, extra GC references from `AddRef`), kept in case the
    /// caller needs it for diagnostics or a second compilation pass.
    pub transform: TransformResult,
}

/// Lower `listing` for `isa` and assemble it into machine code.
///
/// Runs [`transform::run`] to rewrite `listing` into `isa.encode`-ready
/// instructions, then assembles it twice: once with [`LabelOutput`] to fix
/// label offsets and size the code object, once with [`CodeOutput`] to emit
/// the real bytes and the `GcCodeRef` table. This mirrors `spec.md` §4.E's
/// size-pass/emission-pass split — pass 1 cannot know a branch's final
/// displacement before every label's offset is fixed, so pass 2 replays the
/// identical instruction stream now that they are.
pub fn compile(listing: &mut Listing, isa: &dyn TargetIsa) -> CodegenResult<CompiledFunction> {
    let transform_result = transform::run(listing, isa)?;

    let mut sizing = LabelOutput::new(isa.pointer_size());
    assemble_into(listing, isa, &mut sizing)?;
    let info = sizing.info();
    let offsets = sizing.offsets().clone();

    let mut code = vec![0u8; info.size as usize];
    let mut emitting = CodeOutput::new(&mut code, &offsets, info.refs, isa.pointer_size());
    assemble_into(listing, isa, &mut emitting)?;
    let refs = emitting.finish()?;

    let push_rbp_at = offsets[transform_result.prolog_labels.push_rbp_at]
        .ok_or(Error::UnusedLabelError(transform_result.prolog_labels.push_rbp_at))?;
    let set_rbp_at = offsets[transform_result.prolog_labels.set_rbp_at]
        .ok_or(Error::UnusedLabelError(transform_result.prolog_labels.set_rbp_at))?;
    let preserve_at = transform_result
        .prolog_labels
        .preserve_at
        .iter()
        .zip(transform_result.layout.preserved())
        .map(|(&label, &(reg, rbp_offset))| {
            offsets[label]
                .map(|off| (off, reg, rbp_offset))
                .ok_or(Error::UnusedLabelError(label))
        })
        .collect::<CodegenResult<Vec<_>>>()?;
    let epilogs = transform_result
        .prolog_labels
        .epilog_at
        .iter()
        .map(|&label| offsets[label].ok_or(Error::UnusedLabelError(label)))
        .collect::<CodegenResult<Vec<_>>>()?;
    let frame_shape = FrameShape {
        push_rbp_at,
        set_rbp_at,
        preserve_at,
        epilogs,
        length: info.size,
    };

    Ok(CompiledFunction {
        code,
        refs,
        frame_shape,
        transform: transform_result,
    })
}

fn assemble_into(listing: &Listing, isa: &dyn TargetIsa, out: &mut dyn Output) -> CodegenResult<()> {
    for entry in listing.entries() {
        for &label in &entry.labels {
            out.mark_label(label);
        }
        isa.encode(&entry.inst, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FreeOpt;
    use crate::instruction;
    use crate::isa::x64::X64;
    use crate::isa::CallConv;
    use crate::operand::Operand;
    use crate::reg::Reg;
    use crate::size::S_LONG;
    use cranelift_entity::EntityRef;

    fn isa() -> X64 {
        X64::new(CallConv::SystemV)
    }

    #[test]
    fn compiles_a_trivial_function_to_nonempty_code() {
        let mut l = Listing::new();
        l.push(instruction::prolog().unwrap()).unwrap();
        l.push(
            instruction::mov(Operand::reg(Reg::Rax), Operand::constant(1, S_LONG)).unwrap(),
        )
        .unwrap();
        l.push(instruction::epilog().unwrap()).unwrap();

        let compiled = compile(&mut l, &isa()).unwrap();
        assert!(!compiled.code.is_empty());
        assert_eq!(compiled.frame_shape.length as usize, compiled.code.len());
        assert!(compiled.frame_shape.push_rbp_at < compiled.frame_shape.set_rbp_at);
    }

    #[test]
    fn destructor_call_produces_a_reference_to_the_free_function() {
        let mut l = Listing::new();
        let root = l.frame().root();
        let part = l.frame().first_part(root).unwrap();
        let dtor = l.refs().create(Some("dtor"));
        l.create_var(part, S_LONG, Some(dtor), FreeOpt::ON_BLOCK_EXIT)
            .unwrap();
        l.push(instruction::prolog().unwrap()).unwrap();
        l.push(instruction::begin(Operand::PartRef(part)).unwrap())
            .unwrap();
        l.push(instruction::end().unwrap()).unwrap();
        l.push(instruction::epilog().unwrap()).unwrap();

        let compiled = compile(&mut l, &isa()).unwrap();
        // Slots 0/1 are the reserved unwindInfo/aux-refs placeholders; a
        // real RelativePtr reference to the destructor should follow.
        assert!(compiled
            .refs
            .iter()
            .any(|r| r.pointer == dtor.index() as usize));
    }
}

//! Builds the DWARF CIE/FDE unwind records for one function.
//!
//! Grounded on `cranelift-codegen`'s
//! `isa/aarch64/inst/unwind/systemv.rs`, which drives `gimli::write`'s
//! `CommonInformationEntry`/`FrameDescriptionEntry`/`CallFrameInstruction`
//! rather than hand-encoding LEB128 call-frame opcodes. The backend here
//! targets x86/x86-64 System V, so the CIE's return-address register and
//! initial CFA rule differ from the aarch64 original, but the
//! construction shape — one CIE shared by every function, one FDE per
//! function listing its prolog's frame-pointer push/adjust and the
//! destructor table's personality routine when one is needed — is the
//! same.

use crate::error::{CodegenResult, Error};
use crate::reg::Reg;
use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, EhFrame, EndianVec,
    FrameDescriptionEntry,
};
use gimli::{Encoding, Format, Register, RunTimeEndian};

/// DWARF code alignment factor: call-frame offsets below are expressed in
/// units of this many bytes (`1` since x86 instructions aren't fixed
/// width).
const CODE_ALIGNMENT_FACTOR: u8 = 1;
/// DWARF data alignment factor: a `push` grows the stack downward by a
/// full pointer word.
const DATA_ALIGNMENT_FACTOR: i8 = -8;

fn encoding() -> Encoding {
    Encoding {
        address_size: 8,
        format: Format::Dwarf32,
        version: 1,
    }
}

/// Build the one CIE shared by every x86-64 System V function this
/// backend emits: initial CFA is `rsp + 8` (the return address just
/// pushed by `call`), return address lives in the `rip` pseudo-register
/// slot DWARF assigns number 16.
pub fn create_cie() -> CommonInformationEntry {
    let mut entry = CommonInformationEntry::new(
        encoding(),
        CODE_ALIGNMENT_FACTOR,
        DATA_ALIGNMENT_FACTOR,
        Register(16), // return address
    );
    let rsp = Register(Reg::Rsp.dwarf_number());
    entry.add_instruction(CallFrameInstruction::Cfa(rsp, 8));
    entry
}

/// The prolog/epilog shape a listing's `Prolog`/`Epilog` pseudo-ops lower
/// to, as recorded by the transform pipeline for FDE construction: `push
/// rbp; mov rbp, rsp` at offset `push_rbp_at`/`set_rbp_at`, any callee-saved
/// registers the prolog spilled (`preserve_at`), and each epilog's `pop
/// rbp` (`epilogs`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameShape {
    /// Byte offset of the `push rbp` instruction.
    pub push_rbp_at: u32,
    /// Byte offset immediately after `mov rbp, rsp`.
    pub set_rbp_at: u32,
    /// One entry per register the prolog spills: the byte offset of its
    /// store instruction, the register, and its `rbp`-relative slot offset.
    pub preserve_at: Vec<(u32, Reg, i32)>,
    /// Byte offset of each epilog's `pop rbp`, where the CFA reverts to
    /// `rsp`-relative tracking.
    pub epilogs: Vec<u32>,
    /// Total function length in bytes.
    pub length: u32,
}

/// Build the FDE for one function whose prolog follows [`FrameShape`].
/// The caller associates it with a CIE by passing both to
/// [`gimli::write::FrameTable::add_fde`]; this backend's code objects move
/// and the FDE table is rebuilt (not relocated) on every GC move, so the
/// address here is always a placeholder [`Address::Constant`] rewritten
/// by [`crate::dwarf::table`] once the function's real address is known.
pub fn build_fde(shape: FrameShape) -> FrameDescriptionEntry {
    let mut fde = FrameDescriptionEntry::new(Address::Constant(0), shape.length);

    let rbp = Register(Reg::Rbp.dwarf_number());

    // After `push rbp`: CFA is now `rsp + 16` (return address + saved rbp).
    fde.add_instruction(shape.push_rbp_at, CallFrameInstruction::CfaOffset(16));
    fde.add_instruction(shape.push_rbp_at, CallFrameInstruction::Offset(rbp, -16));
    // After `mov rbp, rsp`: CFA tracked relative to rbp instead of rsp, so
    // it stays correct across further stack adjustments (locals, calls).
    fde.add_instruction(shape.set_rbp_at, CallFrameInstruction::CfaRegister(rbp));

    // Each preserved register's home is `rbp + rbp_offset`; `Offset` wants
    // a CFA-relative displacement, and the CFA is `rbp + 16` from
    // `set_rbp_at` onward (mirrors the `-16` above for `rbp` itself).
    for &(offset, reg, rbp_offset) in &shape.preserve_at {
        let dwarf_reg = Register(reg.dwarf_number());
        fde.add_instruction(
            offset,
            CallFrameInstruction::Offset(dwarf_reg, rbp_offset - 16),
        );
    }

    // Once `pop rbp` has run, the frame pointer is gone and the CFA must
    // track `rsp` again, exactly as it did on function entry.
    let rsp = Register(Reg::Rsp.dwarf_number());
    for &epilog_offset in &shape.epilogs {
        fde.add_instruction(epilog_offset, CallFrameInstruction::Cfa(rsp, 8));
    }

    fde
}

/// Serialize a CIE and its FDEs into a `.eh_frame`-shaped byte buffer
/// using the host's native endianness, the form the FDE table stores and
/// the unwinder walks.
pub fn write_frame_table(
    cie: CommonInformationEntry,
    fdes: Vec<FrameDescriptionEntry>,
) -> CodegenResult<Vec<u8>> {
    let mut table = gimli::write::FrameTable::default();
    let cie_id = table.add_cie(cie);
    for fde in fdes {
        table.add_fde(cie_id, fde);
    }
    let mut eh_frame = EhFrame::from(EndianVec::new(native_endian()));
    table
        .write_eh_frame(&mut eh_frame)
        .map_err(|e| Error::InvalidValue(format!("failed to encode DWARF frame table: {}", e)))?;
    Ok(eh_frame.0.into_vec())
}

fn native_endian() -> RunTimeEndian {
    if cfg!(target_endian = "little") {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_table_encodes_without_error() {
        let cie = create_cie();
        let shape = FrameShape {
            push_rbp_at: 0,
            set_rbp_at: 3,
            preserve_at: vec![],
            epilogs: vec![],
            length: 32,
        };
        let mut table = gimli::write::FrameTable::default();
        let cie_id = table.add_cie(cie);
        let fde = build_fde(shape);
        table.add_fde(cie_id, fde);
        let mut eh_frame = EhFrame::from(EndianVec::new(native_endian()));
        assert!(table.write_eh_frame(&mut eh_frame).is_ok());
        assert!(!eh_frame.0.into_vec().is_empty());
    }

    #[test]
    fn frame_table_encodes_preserved_registers_and_epilogs() {
        let cie = create_cie();
        let shape = FrameShape {
            push_rbp_at: 0,
            set_rbp_at: 3,
            preserve_at: vec![(6, Reg::Rbx, -8)],
            epilogs: vec![20],
            length: 32,
        };
        let mut table = gimli::write::FrameTable::default();
        let cie_id = table.add_cie(cie);
        let fde = build_fde(shape);
        table.add_fde(cie_id, fde);
        let mut eh_frame = EhFrame::from(EndianVec::new(native_endian()));
        assert!(table.write_eh_frame(&mut eh_frame).is_ok());
        assert!(!eh_frame.0.into_vec().is_empty());
    }
}

//! The two output visitors that drive assembly: [`LabelOutput`] (pass 1,
//! fixes label offsets and counts GC references) and [`CodeOutput`] (pass
//! 2, writes machine bytes into an allocated code object and records every
//! embedded pointer). See `spec.md` §3 ("GC Code Reference") and §4.E.

use crate::error::{CodegenResult, Error};
use crate::label::Label;
use cranelift_entity::SecondaryMap;
use std::convert::TryFrom;

/// The kind of embedded pointer one [`GcCodeRef`] describes, and therefore
/// how [`crate::patch::write_ptr`] must rewrite it on code relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Slot is inert; skipped by the patcher. Used for unused trailing
    /// table entries.
    Disabled,
    /// A raw absolute pointer: write `pointer` verbatim.
    RawPtr,
    /// A 32-bit relative displacement to an external `pointer`, computed
    /// relative to the byte immediately following the 4-byte field.
    RelativePtr,
    /// Identical rewrite rule to `RelativePtr`; kept as a distinct variant
    /// because the two arise from different call sites (`putRelative` on a
    /// label vs. on a reference) and the GC inspects `kind` for
    /// diagnostics.
    Relative,
    /// `pointer` holds an offset *within this same code allocation*; write
    /// `code_base + pointer` as an absolute address.
    Inside,
    /// Identical semantics to `Relative`, naming the common case where the
    /// displacement target is a label within the same listing
    /// ("relative-here").
    RelativeHere,
    /// A compact short/long jump or call slot; see `spec.md` §4.G.
    Jump,
    /// Slot 0 of every code allocation's reference table: the pointer to
    /// this function's DWARF FDE, updated by the FDE table on relocation.
    UnwindInfo,
}

/// One entry in a code allocation's GC-reference side table: the byte
/// offset of an embedded pointer, its rewrite `kind`, and the logical value
/// the GC must keep alive (or, for `Inside`, the intra-allocation offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcCodeRef {
    /// Byte offset into the code allocation.
    pub offset: u32,
    /// How to interpret/rewrite `pointer`.
    pub kind: RefKind,
    /// The value to keep the in-code bytes synchronized with. For `Inside`
    /// this is an offset into the same allocation rather than an absolute
    /// address.
    pub pointer: usize,
}

/// Sentinel `offset` marking a `GcCodeRef` that names a value the runtime
/// looks up directly by table index rather than an address embedded
/// somewhere in the code bytes (the reserved `unwindInfo`/aux-array
/// slots). [`crate::patch::write_ptr`] skips these rather than treating
/// `offset` as a real byte position to rewrite.
pub const NOT_EMBEDDED: u32 = u32::MAX;

impl GcCodeRef {
    /// A disabled placeholder entry.
    pub fn disabled() -> GcCodeRef {
        GcCodeRef {
            offset: NOT_EMBEDDED,
            kind: RefKind::Disabled,
            pointer: 0,
        }
    }
}

/// Byte size totals accumulated by [`LabelOutput`], handed to
/// [`CodeOutput::new`] so pass 2 can allocate an exactly-sized code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeInfo {
    /// Total bytes pass 1 computed for the function body.
    pub size: u32,
    /// Number of `GcCodeRef` entries pass 1 counted (not including the two
    /// reserved slots).
    pub refs: u32,
}

/// An output sink that the assembler writes bytes and records references
/// to. Implemented identically in semantics by both passes so the same
/// assembler code drives both; [`LabelOutput`] only counts, [`CodeOutput`]
/// only emits.
pub trait Output {
    /// Append one byte.
    fn put_byte(&mut self, b: u8);
    /// Append a little-endian 32-bit word.
    fn put_int(&mut self, v: i32);
    /// Append a little-endian pointer-sized word (4 or 8 bytes, per the
    /// target this output is assembling for).
    fn put_ptr_word(&mut self, v: i64);
    /// Record that label `id`'s definition site has been reached — i.e.
    /// the *next* byte emitted is label `id`'s address.
    fn mark_label(&mut self, id: Label);
    /// The previously recorded offset of `id`. Only meaningful on pass 2;
    /// pass 1 never calls this (relative displacements aren't known until
    /// offsets are fixed).
    fn label_offset(&self, id: Label) -> CodegenResult<u32>;
    /// The current write position, in bytes from the start of the
    /// function.
    fn position(&self) -> u32;
    /// Word size of the target this output is assembling for (4 or 8).
    fn pointer_size(&self) -> u32;
    /// Record a `GcCodeRef` covering the next `width` bytes (which are
    /// *not* separately emitted by the caller — recording a reference
    /// always also reserves its bytes).
    fn put_ref(&mut self, kind: RefKind, pointer: usize, width: u32);
}

/// Pass 1: counts bytes and fixes label offsets without writing any bytes.
pub struct LabelOutput {
    size: u32,
    refs: u32,
    offsets: SecondaryMap<Label, Option<u32>>,
    pointer_size: u32,
}

impl LabelOutput {
    /// Create a pass-1 output for a target with the given pointer width (4
    /// or 8).
    pub fn new(pointer_size: u32) -> Self {
        LabelOutput {
            size: 0,
            refs: 0,
            offsets: SecondaryMap::new(),
            pointer_size,
        }
    }

    /// The totals accumulated so far, for handing to `CodeOutput::new`.
    pub fn info(&self) -> CodeInfo {
        CodeInfo {
            size: self.size,
            refs: self.refs,
        }
    }

    /// The recorded offset table, for handing to `CodeOutput::new`.
    pub fn offsets(&self) -> &SecondaryMap<Label, Option<u32>> {
        &self.offsets
    }
}

impl Output for LabelOutput {
    fn put_byte(&mut self, _b: u8) {
        self.size += 1;
    }

    fn put_int(&mut self, _v: i32) {
        self.size += 4;
    }

    fn put_ptr_word(&mut self, _v: i64) {
        self.size += self.pointer_size;
    }

    fn mark_label(&mut self, id: Label) {
        self.offsets[id] = Some(self.size);
    }

    fn label_offset(&self, _id: Label) -> CodegenResult<u32> {
        // Pass 1 never needs a label's offset to compute a relative
        // displacement: `putRelative` still contributes a fixed 4 bytes to
        // `size` regardless of the eventual value, so callers should not
        // query this during pass 1. If they do, there is nothing useful to
        // return yet.
        Err(Error::FrameError(
            "label offsets are not available during the counting pass".into(),
        ))
    }

    fn position(&self) -> u32 {
        self.size
    }

    fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    fn put_ref(&mut self, _kind: RefKind, _pointer: usize, width: u32) {
        self.size += width;
        self.refs += 1;
    }
}

/// Pass 2: writes machine bytes into a pre-sized buffer and records every
/// embedded pointer into a `GcCodeRef` table.
///
/// Slot 0 of the reference table is reserved for the DWARF `unwindInfo`
/// reference (the FDE pointer); slot 1 is reserved for the raw pointer to
/// this listing's auxiliary reference array. Both are filled in by the
/// caller after assembly, not by the assembler itself.
pub struct CodeOutput<'a> {
    code: &'a mut [u8],
    pos: u32,
    offsets: &'a SecondaryMap<Label, Option<u32>>,
    refs: Vec<GcCodeRef>,
    pointer_size: u32,
}

impl<'a> CodeOutput<'a> {
    /// Create a pass-2 output writing into `code` (already allocated to the
    /// exact size `LabelOutput` computed), using the label offsets `table`
    /// fixed in pass 1. `expected_refs` sizes the reference vector's
    /// capacity (`refs + 2`, per `spec.md` §4.E); the two reserved slots
    /// are pushed immediately as `Disabled` placeholders for the caller to
    /// overwrite.
    pub fn new(
        code: &'a mut [u8],
        offsets: &'a SecondaryMap<Label, Option<u32>>,
        expected_refs: u32,
        pointer_size: u32,
    ) -> Self {
        let mut refs = Vec::with_capacity(expected_refs as usize + 2);
        refs.push(GcCodeRef::disabled()); // slot 0: unwindInfo
        refs.push(GcCodeRef::disabled()); // slot 1: aux reference array
        CodeOutput {
            code,
            pos: 0,
            offsets,
            refs,
            pointer_size,
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let start = self.pos as usize;
        self.code[start..start + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len() as u32;
    }

    /// Finish assembly, returning the completed reference table. Errors if
    /// fewer bytes were written than the buffer's length (pass 2 must
    /// produce exactly the size pass 1 computed; `spec.md` §5's ordering
    /// guarantee).
    pub fn finish(self) -> CodegenResult<Vec<GcCodeRef>> {
        if self.pos as usize != self.code.len() {
            return Err(Error::FrameError(format!(
                "pass 2 emitted {} bytes, pass 1 computed {}",
                self.pos,
                self.code.len()
            )));
        }
        Ok(self.refs)
    }

    /// Overwrite reference slot 0 (`unwindInfo`) once the FDE has been
    /// built.
    pub fn set_unwind_info_ref(&mut self, pointer: usize) {
        self.refs[0] = GcCodeRef {
            offset: NOT_EMBEDDED,
            kind: RefKind::UnwindInfo,
            pointer,
        };
    }

    /// Overwrite reference slot 1 (the auxiliary reference array pointer).
    pub fn set_aux_refs_ptr(&mut self, pointer: usize) {
        self.refs[1] = GcCodeRef {
            offset: NOT_EMBEDDED,
            kind: RefKind::RawPtr,
            pointer,
        };
    }

    /// Emit `int32(labelOffset(id) - (currentPos + 4))`: a PC-relative
    /// branch/call displacement to a label in the same listing.
    pub fn put_relative_label(&mut self, id: Label) -> CodegenResult<()> {
        let target = self.label_offset(id)?;
        let here = self.pos + 4;
        let rel = target as i64 - here as i64;
        let rel = i32::try_from(rel)
            .map_err(|_| Error::InvalidValue(format!("relative branch to {} out of range", id)))?;
        self.put_int(rel);
        Ok(())
    }

    /// Record an `Inside` reference whose `pointer` field is `labelOffset(id)`
    /// and emit a pointer-sized placeholder; the patcher resolves it to
    /// `code_base + offset` on every move.
    pub fn put_address_of_label(&mut self, id: Label) -> CodegenResult<()> {
        let target = self.label_offset(id)?;
        self.put_ref(RefKind::Inside, target as usize, self.pointer_size);
        Ok(())
    }
}

impl<'a> Output for CodeOutput<'a> {
    fn put_byte(&mut self, b: u8) {
        self.write_bytes(&[b]);
    }

    fn put_int(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn put_ptr_word(&mut self, v: i64) {
        if self.pointer_size == 8 {
            self.write_bytes(&v.to_le_bytes());
        } else {
            self.write_bytes(&(v as i32).to_le_bytes());
        }
    }

    fn mark_label(&mut self, _id: Label) {
        // Offsets are already fixed from pass 1; nothing to record.
    }

    fn label_offset(&self, id: Label) -> CodegenResult<u32> {
        self.offsets[id].ok_or(Error::UnusedLabelError(id))
    }

    fn position(&self) -> u32 {
        self.pos
    }

    fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    fn put_ref(&mut self, kind: RefKind, pointer: usize, width: u32) {
        let offset = self.pos;
        self.refs.push(GcCodeRef {
            offset,
            kind,
            pointer,
        });
        // Reserve the bytes with zeros; the patcher fills in the real
        // value on the first `codeUpdatePtrs` call after allocation.
        self.pos += width;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_output_counts_bytes_and_refs() {
        let mut out = LabelOutput::new(8);
        out.put_byte(0x90);
        out.put_int(0);
        out.put_ref(RefKind::RawPtr, 0, 8);
        assert_eq!(out.info().size, 1 + 4 + 8);
        assert_eq!(out.info().refs, 1);
    }

    #[test]
    fn mark_label_records_current_size() {
        let mut out = LabelOutput::new(8);
        out.put_byte(0x90);
        let lbl = Label::new(1);
        out.mark_label(lbl);
        assert_eq!(out.offsets()[lbl], Some(1));
    }

    #[test]
    fn code_output_rejects_short_emission() {
        let mut buf = [0u8; 4];
        let offsets = SecondaryMap::new();
        let out = CodeOutput::new(&mut buf, &offsets, 0, 8);
        // wrote nothing into a 4-byte buffer
        assert!(out.finish().is_err());
    }

    #[test]
    fn code_output_reserves_two_slots() {
        let mut buf = [0u8; 0];
        let offsets = SecondaryMap::new();
        let out = CodeOutput::new(&mut buf, &offsets, 3, 8);
        let refs = out.finish().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].kind, RefKind::Disabled);
    }
}

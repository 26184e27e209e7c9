//! The reference patcher: rewrites embedded pointers in a code allocation
//! after the garbage collector moves something the code refers to. See
//! `spec.md` §4.G ("Reference Patcher") and §3 ("GC Code Reference").
//!
//! This module is the runtime-facing half of [`crate::output::GcCodeRef`]:
//! `output` builds the side table while assembling, `patch` consumes it
//! every time the GC calls back in after a move. A patch failure here is
//! unrecoverable — the code object's embedded pointers would otherwise be
//! silently stale — so every fallible path returns [`PatchError`] rather
//! than clamping or skipping.

use crate::error::PatchError;
use crate::output::{GcCodeRef, RefKind, NOT_EMBEDDED};
use std::convert::TryFrom;

/// Byte stride reserved per `GcCodeRef` in the side table that `spec.md`
/// §4.E allocates directly after a code object's bytes. Only the `jump`
/// kind's indirect fallback needs this: it addresses `&ref.pointer`
/// itself, so patching more than one jump-kind reference in the same code
/// object must give each one a distinct, stable address to point at.
const REF_ENTRY_STRIDE: usize = 16;

/// Rewrite every reference in `refs` in place within `code`, given the
/// code allocation's own base address `code_base` (used by `Inside`
/// references, and to compute PC-relative displacements for `Relative`/
/// `RelativeHere`/`RelativePtr` references and the `jump` kind's direct
/// form).
pub fn patch_code(code: &mut [u8], code_base: usize, refs: &[GcCodeRef]) -> Result<(), PatchError> {
    let ref_table_addr = code_base + code.len();
    for (i, r) in refs.iter().enumerate() {
        write_ptr_at(code, code_base, ref_table_addr + i * REF_ENTRY_STRIDE, r)?;
    }
    Ok(())
}

/// Rewrite the single embedded pointer described by `r`. Equivalent to
/// `patch_code` with a one-element slice, for callers patching references
/// one at a time; the `jump` kind's indirect fallback still gets a valid
/// (if arbitrary, for a lone reference) address to point at.
pub fn write_ptr(code: &mut [u8], code_base: usize, r: &GcCodeRef) -> Result<(), PatchError> {
    let ref_addr = code_base + code.len();
    write_ptr_at(code, code_base, ref_addr, r)
}

/// `ref_addr` is the simulated address of `r.pointer` itself, used only by
/// the `jump` kind's indirect fallback. A `NOT_EMBEDDED` offset means `r`
/// is a pure side-table entry (the reserved `unwindInfo`/aux-array slots)
/// the runtime reads directly by index rather than an address the patcher
/// must rewrite in place, so it is skipped.
fn write_ptr_at(
    code: &mut [u8],
    code_base: usize,
    ref_addr: usize,
    r: &GcCodeRef,
) -> Result<(), PatchError> {
    if r.offset == NOT_EMBEDDED {
        return Ok(());
    }
    match r.kind {
        RefKind::Disabled => Ok(()),
        RefKind::RawPtr => write_raw(code, r.offset, r.pointer as u64),
        RefKind::RelativePtr | RefKind::Relative => {
            write_relative32(code, r.offset, r.pointer, code_base)
        }
        RefKind::RelativeHere => write_relative32(code, r.offset, r.pointer, code_base),
        RefKind::Inside => {
            let abs = code_base
                .checked_add(r.pointer)
                .ok_or(PatchError::OffsetOutOfBounds {
                    offset: r.offset,
                    size: code.len() as u32,
                })?;
            write_raw(code, r.offset, abs as u64)
        }
        RefKind::Jump => write_jump(code, r.offset, r.pointer, code_base, ref_addr),
        RefKind::UnwindInfo => write_raw(code, r.offset, r.pointer as u64),
    }
}

fn slot<'a>(code: &'a mut [u8], offset: u32, width: usize) -> Result<&'a mut [u8], PatchError> {
    let start = offset as usize;
    let end = start
        .checked_add(width)
        .ok_or(PatchError::OffsetOutOfBounds {
            offset,
            size: code.len() as u32,
        })?;
    if end > code.len() {
        return Err(PatchError::OffsetOutOfBounds {
            offset,
            size: code.len() as u32,
        });
    }
    Ok(&mut code[start..end])
}

fn write_raw(code: &mut [u8], offset: u32, value: u64) -> Result<(), PatchError> {
    // Raw pointer slots always reserve a full pointer-sized word at
    // assembly time (`Output::put_ptr_word`), so the patch site is always
    // 8 bytes wide regardless of target pointer width.
    let bytes = value.to_le_bytes();
    let dst = slot(code, offset, 8)?;
    dst.copy_from_slice(&bytes);
    Ok(())
}

fn write_relative32(
    code: &mut [u8],
    offset: u32,
    pointer: usize,
    code_base: usize,
) -> Result<(), PatchError> {
    let here = code_base
        .checked_add(offset as usize + 4)
        .ok_or(PatchError::OffsetOutOfBounds {
            offset,
            size: code.len() as u32,
        })?;
    let rel = pointer as i64 - here as i64;
    let rel32 = i32::try_from(rel).map_err(|_| PatchError::RelativeOutOfRange(offset))?;
    let dst = slot(code, offset, 4)?;
    dst.copy_from_slice(&rel32.to_le_bytes());
    Ok(())
}

/// Rewrite a `jump`-kind patch slot (`spec.md` §4.G, x86-64 only): 2 opcode
/// bytes at `offset - 2` followed by a 4-byte displacement at `offset`,
/// either `48 e8`/`48 e9` (direct relative call/jmp) or `ff 15`/`ff 25`
/// (indirect call/jmp through `&ref.pointer`). Reads and writes the full
/// 8-byte word spanning those 6 bytes plus the 2 bytes right after them —
/// always legally addressable, since the side table is allocated directly
/// after the code — so the two trailing bytes are preserved untouched and
/// the whole rewrite can be applied as one word-sized store.
///
/// Whichever form was already there is irrelevant; the form is chosen
/// fresh from whether the direct displacement still fits 32 bits, since a
/// GC move can make a previously out-of-range target reachable again (or
/// vice versa).
fn write_jump(
    code: &mut [u8],
    offset: u32,
    pointer: usize,
    code_base: usize,
    ref_addr: usize,
) -> Result<(), PatchError> {
    let off = offset as usize;
    let oob = || PatchError::OffsetOutOfBounds {
        offset,
        size: code.len() as u32,
    };
    let start = off.checked_sub(2).ok_or_else(oob)?;
    let end = start.checked_add(8).ok_or_else(oob)?;
    if end > code.len() {
        return Err(oob());
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&code[start..end]);
    let original = u64::from_le_bytes(word);

    let call = match original & 0xffff {
        0xe848 | 0x15ff => true,
        0xe948 | 0x25ff => false,
        _ => return Err(PatchError::UnrecognizedJumpEncoding(offset)),
    };
    let trailing = original & (0xffffu64 << 48);

    let here = (code_base + start + 6) as i64;
    let direct_delta = pointer as i64 - here;
    let rewritten = if let Ok(delta) = i32::try_from(direct_delta) {
        let opcode: u64 = if call { 0xe848 } else { 0xe948 };
        trailing | opcode | (u64::from(delta as u32) << 16)
    } else {
        let indirect_delta = ref_addr as i64 - here;
        let delta = i32::try_from(indirect_delta).map_err(|_| PatchError::RelativeOutOfRange(offset))?;
        let opcode: u64 = if call { 0x15ff } else { 0x25ff };
        trailing | opcode | (u64::from(delta as u32) << 16)
    };

    code[start..end].copy_from_slice(&rewritten.to_le_bytes());
    Ok(())
}

//! End-to-end tests exercising the transform pipeline, the two-pass
//! assembler, the reference patcher, and the DWARF FDE table together,
//! the way a real embedder would chain them rather than unit-testing
//! each module's pieces in isolation.

use backend_codegen::dwarf::{build_fde, create_cie, write_frame_table, FdeTable};
use backend_codegen::frame::FreeOpt;
use backend_codegen::instruction;
use backend_codegen::isa::x64::X64;
use backend_codegen::isa::x86::X86;
use backend_codegen::isa::CallConv;
use backend_codegen::operand::{CondFlag, Operand};
use backend_codegen::output::{GcCodeRef, RefKind};
use backend_codegen::patch::patch_code;
use backend_codegen::reg::Reg;
use backend_codegen::size::S_LONG;
use backend_codegen::{compile, opcode::Opcode, Listing};

fn x64() -> X64 {
    X64::new(CallConv::SystemV)
}

fn x86() -> X86 {
    X86::new(CallConv::SystemV)
}

/// Scenario: summing two 64-bit locals on a target with no native 64-bit
/// registers must lower to an `add`/`adc` pair over the low/high dwords,
/// not silently truncate to 32 bits.
#[test]
fn sums_two_64_bit_locals_via_add_adc_pair_on_x86() {
    let mut l = Listing::new();
    let part = l.frame().first_part(l.frame().root()).unwrap();
    let a = l.create_var(part, S_LONG, None, FreeOpt::empty()).unwrap();
    let b = l.create_var(part, S_LONG, None, FreeOpt::empty()).unwrap();
    let a_op = Operand::variable_at(a, 8, 0, S_LONG, 8).unwrap();
    let b_op = Operand::variable_at(b, 8, 0, S_LONG, 8).unwrap();

    l.push(instruction::prolog().unwrap()).unwrap();
    l.push(instruction::add(a_op, b_op).unwrap()).unwrap();
    l.push(instruction::epilog().unwrap()).unwrap();

    let isa = x86();
    let compiled = compile(&mut l, &isa).unwrap();
    assert!(!compiled.code.is_empty());

    let opcodes: Vec<Opcode> = l.entries().iter().map(|e| e.inst.opcode()).collect();
    let add_at = opcodes.iter().position(|&o| o == Opcode::Add).unwrap();
    // The low-dword add must be immediately followed by the high-dword
    // adc; splitting any other way would drop the carry.
    assert_eq!(opcodes[add_at + 1], Opcode::Adc);
}

/// Scenario: a call site must not clobber a value the caller needs to
/// survive it. Liveness marks callee-saved registers as live across a
/// call and caller-saved ones as free to reuse.
#[test]
fn liveness_proves_callee_saved_registers_survive_a_call() {
    let mut l = Listing::new();
    let target = l.refs().create(Some("helper"));
    l.push(instruction::prolog().unwrap()).unwrap();
    l.push(instruction::mov(Operand::reg(Reg::Rbx), Operand::constant(7, S_LONG)).unwrap())
        .unwrap();
    l.push(instruction::fn_call(Operand::Reference(target)).unwrap())
        .unwrap();
    l.push(instruction::epilog().unwrap()).unwrap();

    let isa = x64();
    let compiled = compile(&mut l, &isa).unwrap();

    let call_at = l
        .entries()
        .iter()
        .position(|e| e.inst.opcode() == Opcode::Call)
        .unwrap();
    let live_before_call = compiled.transform.liveness[call_at];
    assert!(live_before_call.contains(Reg::Rbx));
    assert!(!live_before_call.contains(Reg::Rax));
}

/// Scenario: every one of the twelve condition codes must assemble to a
/// distinct, round-trippable conditional jump, not collapse to a shared
/// encoding that would silently pick the wrong branch.
#[test]
fn every_condition_flag_assembles_to_a_distinct_conditional_jump() {
    let mut seen = std::collections::HashSet::new();
    for &cond in CondFlag::ALL.iter() {
        let mut l = Listing::new();
        let target = l.create_label();
        l.push(instruction::prolog().unwrap()).unwrap();
        l.push(instruction::cmp(Operand::reg(Reg::Rax), Operand::reg(Reg::Rcx)).unwrap())
            .unwrap();
        l.push(instruction::jmp_cond(cond, Operand::Label(target)).unwrap())
            .unwrap();
        l.queue_label(target);
        l.push(instruction::epilog().unwrap()).unwrap();

        let compiled = compile(&mut l, &x64()).unwrap();
        assert!(seen.insert(compiled.code.clone()), "{:?} collided with another condition's encoding", cond);
    }
    assert_eq!(seen.len(), CondFlag::ALL.len());
}

/// Scenario: a destructor armed `onException` is not dispatched by inline
/// code (that's the unwinder's job, reading `ehClean`/the catch table
/// after a `throwError`), but the listing must still mark the function as
/// needing unwind-time cleanup and must still raise through exactly one
/// lowered call, so the runtime has exactly one place to hook in.
#[test]
fn on_exception_destructor_is_visible_to_the_unwinder_and_raise_happens_once() {
    let mut l = Listing::new();
    let root = l.frame().root();
    let part = l.frame().first_part(root).unwrap();
    let dtor = l.refs().create(Some("dtor"));
    l.create_var(part, S_LONG, Some(dtor), FreeOpt::ON_EXCEPTION)
        .unwrap();
    assert!(l.eh_clean());

    l.push(instruction::prolog().unwrap()).unwrap();
    l.push(instruction::throw_error(Operand::constant(1, S_LONG)).unwrap())
        .unwrap();
    l.push(instruction::epilog().unwrap()).unwrap();

    let compiled = compile(&mut l, &x64()).unwrap();
    let calls = l
        .entries()
        .iter()
        .filter(|e| e.inst.opcode() == Opcode::Call)
        .count();
    assert_eq!(calls, 1, "throwError must lower to exactly one call");
    assert!(!compiled.refs.is_empty());
}

/// Scenario: after the GC moves the code object containing a call to an
/// external reference, patching with the new base must leave the call
/// pointing at the same absolute target, not the old one.
#[test]
fn patching_after_a_gc_move_keeps_a_relative_call_pointed_at_its_target() {
    let mut l = Listing::new();
    let target = l.refs().create(Some("helper"));
    l.push(instruction::prolog().unwrap()).unwrap();
    l.push(instruction::fn_call(Operand::Reference(target)).unwrap())
        .unwrap();
    l.push(instruction::epilog().unwrap()).unwrap();

    let isa = x64();
    let compiled = compile(&mut l, &isa).unwrap();
    let call_ref = compiled
        .refs
        .iter()
        .find(|r| r.kind == RefKind::Jump)
        .expect("fn_call must record a jump-kind reference to its target on x86-64");

    // Close enough to both code bases below that the jump slot's short
    // (direct relative) form applies; the indirect fallback for targets
    // outside 32-bit relative range is covered in `patch::tests`.
    let target_addr = 0x5000usize;
    let mut code_at_old_base = compiled.code.clone();
    let old_base = 0x1000;
    let old_ref = GcCodeRef {
        pointer: target_addr,
        ..*call_ref
    };
    patch_code(&mut code_at_old_base, old_base, &[old_ref]).unwrap();

    let mut code_at_new_base = compiled.code.clone();
    let new_base = 0x9000;
    patch_code(&mut code_at_new_base, new_base, &[old_ref]).unwrap();

    // Same logical target, different code bases: the encoded displacement
    // must differ, and each must resolve back to `target_addr`.
    let read_rel = |code: &[u8], base: usize| -> i64 {
        let off = old_ref.offset as usize;
        let rel = i32::from_le_bytes([code[off], code[off + 1], code[off + 2], code[off + 3]]);
        base as i64 + off as i64 + 4 + rel as i64
    };
    assert_eq!(read_rel(&code_at_old_base, old_base), target_addr as i64);
    assert_eq!(read_rel(&code_at_new_base, new_base), target_addr as i64);
    let opcode_at = |code: &[u8]| &code[old_ref.offset as usize - 2..old_ref.offset as usize];
    assert_eq!(opcode_at(&code_at_old_base), &[0x48, 0xe8]);
    assert_eq!(opcode_at(&code_at_new_base), &[0x48, 0xe8]);
    assert_ne!(
        &code_at_old_base[old_ref.offset as usize..old_ref.offset as usize + 4],
        &code_at_new_base[old_ref.offset as usize..old_ref.offset as usize + 4]
    );
}

/// Scenario: a lookup racing a `relocate` call must see either the old or
/// the new location, never a torn/missing entry, and after the move the
/// table must answer queries at the new address.
#[test]
fn fde_table_lookup_succeeds_after_concurrent_relocation() {
    let mut l = Listing::new();
    l.push(instruction::prolog().unwrap()).unwrap();
    l.push(instruction::epilog().unwrap()).unwrap();
    let compiled = compile(&mut l, &x64()).unwrap();

    let cie = create_cie();
    let fde = build_fde(compiled.frame_shape);
    let table_bytes = write_frame_table(cie, vec![fde]).unwrap();
    assert!(!table_bytes.is_empty());

    let table = std::sync::Arc::new(FdeTable::new());
    let old_start = 0x4000;
    let new_start = 0x8000;
    table.insert(old_start, compiled.code.len(), 0);
    assert_eq!(table.find(old_start + 1), Some(0));

    let t = table.clone();
    let mover = std::thread::spawn(move || {
        t.relocate(old_start, new_start);
    });
    let reader = {
        let t = table.clone();
        std::thread::spawn(move || {
            // Either answer is acceptable mid-race; the table must never
            // panic or return a torn read.
            let _ = t.find(old_start + 1);
            let _ = t.find(new_start + 1);
        })
    };
    mover.join().unwrap();
    reader.join().unwrap();

    assert_eq!(table.find(new_start + 1), Some(0));
    assert_eq!(table.find(old_start + 1), None);
}

/// Scenario: `Listing::deep_copy` must assemble to byte-identical code —
/// copying a listing is not allowed to perturb label ids, frame layout,
/// or instruction order.
#[test]
fn deep_copy_assembles_to_identical_code() {
    let mut l = Listing::new();
    let part = l.frame().first_part(l.frame().root()).unwrap();
    let dtor = l.refs().create(Some("dtor"));
    l.create_var(part, S_LONG, Some(dtor), FreeOpt::ON_BLOCK_EXIT)
        .unwrap();
    l.push(instruction::prolog().unwrap()).unwrap();
    l.push(instruction::begin(Operand::PartRef(part)).unwrap())
        .unwrap();
    l.push(instruction::end().unwrap()).unwrap();
    l.push(instruction::epilog().unwrap()).unwrap();

    let mut copy = l.deep_copy();
    let isa = x64();
    let original = compile(&mut l, &isa).unwrap();
    let cloned = compile(&mut copy, &isa).unwrap();

    assert_eq!(original.code, cloned.code);
    assert_eq!(original.frame_shape, cloned.frame_shape);
}

/// Scenario: a function body that writes a callee-saved register must
/// physically spill it in the prolog and restore it in the epilog — not
/// just prove it live across the call via `liveness`, but actually emit
/// the `mov [rbp+off], rbx` / `mov rbx, [rbp+off]` pair and record a
/// matching DWARF `Offset` directive the unwinder can use to recover the
/// caller's `rbx` if this function's frame is unwound mid-body.
#[test]
fn callee_saved_register_write_is_physically_preserved_across_the_call() {
    let mut l = Listing::new();
    let target = l.refs().create(Some("helper"));
    l.push(instruction::prolog().unwrap()).unwrap();
    l.push(instruction::mov(Operand::reg(Reg::Rbx), Operand::constant(42, S_LONG)).unwrap())
        .unwrap();
    l.push(instruction::fn_call(Operand::Reference(target)).unwrap())
        .unwrap();
    l.push(instruction::epilog().unwrap()).unwrap();

    let isa = x64();
    let compiled = compile(&mut l, &isa).unwrap();

    let store_to_slot = l.entries().iter().position(|e| {
        e.inst.opcode() == Opcode::Mov
            && e.inst.src() == Operand::reg(Reg::Rbx)
            && matches!(e.inst.dest(), Operand::Relative { .. })
    });
    assert!(store_to_slot.is_some(), "prolog must spill rbx to a stack slot");

    let restore_from_slot = l.entries().iter().position(|e| {
        e.inst.opcode() == Opcode::Mov
            && e.inst.dest() == Operand::reg(Reg::Rbx)
            && matches!(e.inst.src(), Operand::Relative { .. })
    });
    assert!(restore_from_slot.is_some(), "epilog must restore rbx from its stack slot");
    assert!(store_to_slot.unwrap() < restore_from_slot.unwrap());

    assert_eq!(compiled.frame_shape.preserve_at.len(), 1);
    assert_eq!(compiled.frame_shape.preserve_at[0].1, Reg::Rbx);
    assert_eq!(compiled.frame_shape.epilogs.len(), 1);

    let cie = create_cie();
    let fde = build_fde(compiled.frame_shape.clone());
    let table_bytes = write_frame_table(cie, vec![fde]).unwrap();
    assert!(!table_bytes.is_empty());
}

/// Scenario: patching a code object twice with the same reference values
/// is idempotent — a second `patch_code` call with unchanged pointers
/// must leave the bytes exactly as the first call left them.
#[test]
fn patching_twice_with_unchanged_pointers_is_a_no_op() {
    let mut l = Listing::new();
    let target = l.refs().create(Some("helper"));
    l.push(instruction::prolog().unwrap()).unwrap();
    l.push(instruction::fn_call(Operand::Reference(target)).unwrap())
        .unwrap();
    l.push(instruction::epilog().unwrap()).unwrap();

    let compiled = compile(&mut l, &x64()).unwrap();
    let mut code = compiled.code.clone();
    let refs: Vec<GcCodeRef> = compiled
        .refs
        .iter()
        .map(|r| GcCodeRef {
            pointer: 0x5000_0000,
            ..*r
        })
        .collect();

    patch_code(&mut code, 0x1000, &refs).unwrap();
    let after_first = code.clone();
    patch_code(&mut code, 0x1000, &refs).unwrap();
    assert_eq!(after_first, code);
}

//! The 32-bit x86 target. Every function parameter is passed on the stack
//! (cdecl-style); there is no REX prefix, so `r8`-`r15` and the upper xmm
//! half are unreachable — the transform pipeline's 64-bit splitting pass
//! never produces references to them when targeting this ISA.

use super::{encode_common, CallConv, ParamLoc, TargetIsa};
use crate::error::CodegenResult;
use crate::instruction::Instruction;
use crate::operand::Operand;
use crate::output::{Output, RefKind};
use crate::reg::{Reg, X86_CALLEE_SAVED, X86_GPR};
use cranelift_entity::EntityRef;

/// Caller-saved registers under the cdecl convention this ISA assumes.
const X86_CALLER_SAVED: &[Reg] = &[Reg::Rax, Reg::Rcx, Reg::Rdx];

/// The 32-bit x86 target ISA.
pub struct X86 {
    call_conv: CallConv,
}

impl X86 {
    /// Create an x86 ISA instance for `call_conv`.
    pub fn new(call_conv: CallConv) -> Self {
        X86 { call_conv }
    }
}

impl TargetIsa for X86 {
    fn pointer_size(&self) -> u32 {
        4
    }

    fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    fn gpr_registers(&self) -> &'static [Reg] {
        X86_GPR
    }

    fn caller_saved(&self) -> &'static [Reg] {
        X86_CALLER_SAVED
    }

    fn callee_saved(&self) -> &'static [Reg] {
        X86_CALLEE_SAVED
    }

    fn first_param_loc(&self, index: usize) -> ParamLoc {
        // cdecl: every argument on the stack, above the saved return
        // address, in left-to-right declaration order.
        ParamLoc::Stack((index as i32) * 4)
    }

    fn encode(&self, inst: &Instruction, out: &mut dyn Output) -> CodegenResult<()> {
        encode_common(inst, out, false)
    }

    fn emit_redirect(&self, target: Operand, out: &mut dyn Output) -> CodegenResult<()> {
        match target {
            Operand::Reference(rid) => {
                out.put_byte(0xe9);
                out.put_ref(RefKind::RelativePtr, rid.index(), 4);
                Ok(())
            }
            Operand::Label(label) => {
                if let Ok(off) = out.label_offset(label) {
                    let rel = off as i64 - (out.position() as i64 + 5);
                    out.put_byte(0xe9);
                    out.put_int(rel as i32);
                } else {
                    out.put_byte(0xe9);
                    out.put_int(0);
                }
                Ok(())
            }
            _ => Err(crate::error::Error::InvalidValue(
                "redirect target must be a reference or label".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_all_on_the_stack() {
        let isa = X86::new(CallConv::SystemV);
        assert_eq!(isa.first_param_loc(0), ParamLoc::Stack(0));
        assert_eq!(isa.first_param_loc(1), ParamLoc::Stack(4));
    }
}

//! The x86-64 (SysV and Windows fastcall) target.

use super::{encode_common, CallConv, ParamLoc, TargetIsa};
use crate::error::CodegenResult;
use crate::instruction::Instruction;
use crate::operand::Operand;
use crate::output::{Output, RefKind};
use crate::reg::{Reg, X64_CALLEE_SAVED, X64_CALLER_SAVED, X64_GPR};
use cranelift_entity::EntityRef;

/// The x86-64 target ISA.
pub struct X64 {
    call_conv: CallConv,
}

impl X64 {
    /// Create an x86-64 ISA instance for `call_conv`.
    pub fn new(call_conv: CallConv) -> Self {
        X64 { call_conv }
    }

    fn sysv_int_params() -> &'static [Reg] {
        &[
            Reg::Rdi,
            Reg::Rsi,
            Reg::Rdx,
            Reg::Rcx,
            Reg::R8,
            Reg::R9,
        ]
    }

    fn fastcall_int_params() -> &'static [Reg] {
        &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9]
    }
}

impl TargetIsa for X64 {
    fn pointer_size(&self) -> u32 {
        8
    }

    fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    fn gpr_registers(&self) -> &'static [Reg] {
        X64_GPR
    }

    fn caller_saved(&self) -> &'static [Reg] {
        X64_CALLER_SAVED
    }

    fn callee_saved(&self) -> &'static [Reg] {
        X64_CALLEE_SAVED
    }

    fn first_param_loc(&self, index: usize) -> ParamLoc {
        let regs = match self.call_conv {
            CallConv::SystemV => Self::sysv_int_params(),
            CallConv::WindowsFastcall => Self::fastcall_int_params(),
        };
        if let Some(&r) = regs.get(index) {
            ParamLoc::Reg(r)
        } else {
            let stack_index = index - regs.len();
            let shadow = if self.call_conv == CallConv::WindowsFastcall {
                32
            } else {
                0
            };
            ParamLoc::Stack(shadow + (stack_index as i32) * 8)
        }
    }

    fn encode(&self, inst: &Instruction, out: &mut dyn Output) -> CodegenResult<()> {
        encode_common(inst, out, true)
    }

    fn emit_redirect(&self, target: Operand, out: &mut dyn Output) -> CodegenResult<()> {
        // `jmp rel32` / `jmp [reference]` to the new entry point, tail-call
        // style: no frame is set up, so a redirected call is indistinguishable
        // from having called the new code directly.
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
    fn sysv_first_four_params_are_registers() {
        let isa = X64::new(CallConv::SystemV);
        assert_eq!(isa.first_param_loc(0), ParamLoc::Reg(Reg::Rdi));
        assert_eq!(isa.first_param_loc(1), ParamLoc::Reg(Reg::Rsi));
    }

    #[test]
    fn sysv_seventh_param_spills_to_stack() {
        let isa = X64::new(CallConv::SystemV);
        assert_eq!(isa.first_param_loc(6), ParamLoc::Stack(0));
    }

    #[test]
    fn fastcall_reserves_shadow_space() {
        let isa = X64::new(CallConv::WindowsFastcall);
        assert_eq!(isa.first_param_loc(4), ParamLoc::Stack(32));
    }
}

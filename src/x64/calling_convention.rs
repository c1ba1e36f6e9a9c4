// This module implements the register part of the System V AMD64 calling convention as used by
// the generated methods and by the calls they make. Integral and address arguments are passed
// in RDI, RSI, RDX, RCX, R8 and R9; float and double arguments in XMM0 through XMM7, each bank
// counted independently. Results come back in RAX or XMM0. Arguments that would be passed on
// the stack are reported as unassignable so that lowering can refuse the signature.

//! System V x86-64 argument assignment.

use crate::codegen::emitter::{ArgAssignment, CCAssigner, RegBank};
use crate::tree::DataType;

/// Number of general purpose argument registers.
pub const GP_ARG_COUNT: usize = 6;
/// Number of XMM argument registers.
pub const XMM_ARG_COUNT: usize = 8;

#[derive(Debug, Default, Clone)]
pub struct SysVAssigner {
    gp_used: usize,
    xmm_used: usize,
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, ty: DataType) -> Option<ArgAssignment> {
        if ty.is_integral() {
            if self.gp_used == GP_ARG_COUNT {
                return None;
            }
            self.gp_used += 1;
            Some(ArgAssignment {
                bank: RegBank::GeneralPurpose,
                index: self.gp_used - 1,
            })
        } else if ty.is_floating() {
            if self.xmm_used == XMM_ARG_COUNT {
                return None;
            }
            self.xmm_used += 1;
            Some(ArgAssignment {
                bank: RegBank::Vector,
                index: self.xmm_used - 1,
            })
        } else {
            None
        }
    }
}

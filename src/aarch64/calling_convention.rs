//! AAPCS64 argument assignment: integral arguments in `x0`-`x7`, floating
//! point arguments in `v0`-`v7`, results in `x0` / `v0`.

use crate::codegen::emitter::{ArgAssignment, CCAssigner, RegBank};
use crate::tree::DataType;

pub const GP_ARG_COUNT: usize = 8;
pub const FP_ARG_COUNT: usize = 8;

#[derive(Debug, Default, Clone)]
pub struct Aapcs64Assigner {
    ngrn: usize,
    nsrn: usize,
}

impl CCAssigner for Aapcs64Assigner {
    fn assign_arg(&mut self, ty: DataType) -> Option<ArgAssignment> {
        let (bank, next, limit) = if ty.is_integral() {
            (RegBank::GeneralPurpose, &mut self.ngrn, GP_ARG_COUNT)
        } else if ty.is_floating() {
            (RegBank::Vector, &mut self.nsrn, FP_ARG_COUNT)
        } else {
            return None;
        };
        if *next == limit {
            return None;
        }
        *next += 1;
        Some(ArgAssignment {
            bank,
            index: *next - 1,
        })
    }
}

// This module provides the AArch64 instruction encoder used by tree lowering. Every instruction
// is a fixed 32-bit word assembled from its base opcode and register and immediate fields, then
// appended little-endian to the code buffer. A direct branch is B/BL with a 26-bit word offset;
// an indirect branch materializes the absolute target in x16 with MOVZ and three MOVKs and
// branches through BR/BLR. Branches to labels that are not bound yet leave placeholder fields
// that are patched once the whole method has been emitted. Frame slots are addressed from sp
// with the scaled unsigned-offset load/store forms; other offsets go through x17.

//! AArch64 instruction encoding.
//!
//! Pool registers are `x9`-`x15` for general purpose values and `v16`-`v31`
//! for floats and vectors, none of which are callee-saved. `x16` and `x17`
//! are scratch.

use super::calling_convention::Aapcs64Assigner;
use crate::codegen::emitter::{
    Access, ArgAssignment, Base, Emitter, FloatOp, IntOp, Label, Labels, Reg,
};
use crate::core::error::{CodeGenError, CodeGenResult};
use crate::cpu::{BranchForm, Isa, LaneType, VectorOp};
use crate::tree::{Condition, DataType};
use log::trace;

const GP_BASE: u32 = 9;
const GP_COUNT: usize = 7;
const FP_BASE: u32 = 16;
const FP_COUNT: usize = 16;
const SP: u32 = 31;
const ZR: u32 = 31;
const IP0: u32 = 16;
const IP1: u32 = 17;
const FP: u32 = 29;

/// MOVZ plus three MOVKs.
const MOV_ABS_WORDS: usize = 4;

mod op {
    pub const MOVZ_X: u32 = 0xD280_0000;
    pub const MOVK_X: u32 = 0xF280_0000;
    pub const MOVZ_W: u32 = 0x5280_0000;
    pub const MOVK_W: u32 = 0x7280_0000;
    pub const ORR_X: u32 = 0xAA00_0000;
    pub const ORR_V16B: u32 = 0x4EA0_1C00;
    pub const FMOV_D_X: u32 = 0x9E67_0000;
    pub const FMOV_S_W: u32 = 0x1E27_0000;

    pub const ADD_X: u32 = 0x8B00_0000;
    pub const SUB_X: u32 = 0xCB00_0000;
    pub const MUL_X: u32 = 0x9B00_7C00;
    pub const AND_X: u32 = 0x8A00_0000;
    pub const EOR_X: u32 = 0xCA00_0000;
    pub const LSLV_X: u32 = 0x9AC0_2000;
    pub const LSRV_X: u32 = 0x9AC0_2400;
    pub const ASRV_X: u32 = 0x9AC0_2800;
    pub const RORV_X: u32 = 0x9AC0_2C00;
    pub const CMP_X: u32 = 0xEB00_001F;
    /// Clears the 64-bit `sf` bit of the data processing forms above.
    pub const SF: u32 = 0x8000_0000;

    pub const ADD_IMM_X: u32 = 0x9100_0000;
    pub const SUB_IMM_X: u32 = 0xD100_0000;

    pub const FADD_S: u32 = 0x1E20_2800;
    pub const FSUB_S: u32 = 0x1E20_3800;
    pub const FMUL_S: u32 = 0x1E20_0800;
    pub const FDIV_S: u32 = 0x1E20_1800;
    pub const FSQRT_S: u32 = 0x1E21_C000;
    /// Selects the double precision variant of the scalar forms above.
    pub const FTYPE_D: u32 = 0x0040_0000;

    pub const ADD_V: u32 = 0x4E20_8400;
    pub const SUB_V: u32 = 0x6E20_8400;
    pub const MUL_V: u32 = 0x4E20_9C00;
    pub const FADD_V: u32 = 0x4E20_D400;
    pub const FSUB_V: u32 = 0x4EA0_D400;
    pub const FMUL_V: u32 = 0x6E20_DC00;
    pub const FDIV_V: u32 = 0x6E20_FC00;

    pub const B: u32 = 0x1400_0000;
    pub const BL: u32 = 0x9400_0000;
    pub const B_COND: u32 = 0x5400_0000;
    pub const BR: u32 = 0xD61F_0000;
    pub const BLR: u32 = 0xD63F_0000;
    pub const RET: u32 = 0xD65F_03C0;
    pub const STP_PRE_FP_LR: u32 = 0xA9BF_7BFD;
    pub const LDP_POST_FP_LR: u32 = 0xA8C1_7BFD;
}

/// Unsigned scaled offset load/store opcodes and their scale.
fn memory_op(access: Access, load: bool) -> (u32, u32) {
    match (access, load) {
        (Access::I8, true) => (0x39C0_0000, 0),
        (Access::I16, true) => (0x79C0_0000, 1),
        (Access::I32, true) => (0xB940_0000, 2),
        (Access::I64, true) => (0xF940_0000, 3),
        (Access::F32, true) => (0xBD40_0000, 2),
        (Access::F64, true) => (0xFD40_0000, 3),
        (Access::V128, true) => (0x3DC0_0000, 4),
        (Access::I8, false) => (0x3900_0000, 0),
        (Access::I16, false) => (0x7900_0000, 1),
        (Access::I32, false) => (0xB900_0000, 2),
        (Access::I64, false) => (0xF900_0000, 3),
        (Access::F32, false) => (0xBD00_0000, 2),
        (Access::F64, false) => (0xFD00_0000, 3),
        (Access::V128, false) => (0x3D80_0000, 4),
    }
}

fn cond_code(cond: Condition) -> u32 {
    match cond {
        Condition::Eq => 0x0,
        Condition::Ne => 0x1,
        Condition::Ge => 0xA,
        Condition::Lt => 0xB,
        Condition::Gt => 0xC,
        Condition::Le => 0xD,
    }
}

fn rrr(base: u32, d: u32, n: u32, m: u32) -> u32 {
    base | (m << 16) | (n << 5) | d
}

fn scalable_offset(offset: i32, scale: u32) -> Option<u32> {
    let offset = u32::try_from(offset).ok()?;
    if offset % (1 << scale) != 0 {
        return None;
    }
    let imm = offset >> scale;
    (imm < 4096).then_some(imm)
}

#[derive(Debug, Clone, Copy)]
enum Fixup {
    /// B with a 26-bit word offset.
    Branch26 { at: usize, label: Label },
    /// MOVZ/MOVK sequence materializing the label's absolute address.
    Absolute { at: usize, label: Label },
}

pub struct A64Emitter {
    base: u64,
    code: Vec<u8>,
    labels: Labels,
    fixups: Vec<Fixup>,
}

fn gp(index: u8) -> CodeGenResult<u32> {
    if (index as usize) < GP_COUNT {
        Ok(GP_BASE + index as u32)
    } else {
        Err(bad_register(Reg::Gp(index)))
    }
}

fn fp(index: u8) -> CodeGenResult<u32> {
    if (index as usize) < FP_COUNT {
        Ok(FP_BASE + index as u32)
    } else {
        Err(bad_register(Reg::Fp(index)))
    }
}

fn bad_register(reg: Reg) -> CodeGenError {
    CodeGenError::Encoding(format!("{reg:?} is outside the AArch64 register pool"))
}

/// Hardware number of a pool register, checked against the access's bank.
fn checked(access: Access, reg: Reg) -> CodeGenResult<u32> {
    if access.bank() != reg.bank() {
        return Err(CodeGenError::Encoding(format!("{access:?} access cannot use {reg:?}")));
    }
    match reg {
        Reg::Gp(i) => gp(i),
        Reg::Fp(i) => fp(i),
    }
}

impl A64Emitter {
    fn emit(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    fn here(&self) -> u64 {
        self.base.wrapping_add(self.code.len() as u64)
    }

    fn word_at(&self, at: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.code[at..at + 4]);
        u32::from_le_bytes(bytes)
    }

    fn patch(&mut self, at: usize, word: u32) {
        self.code[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    /// MOVZ/MOVK of every non-zero halfword.
    fn mov_wide(&mut self, rd: u32, value: u64, wide: bool) {
        let (movz, movk, halves) = if wide {
            (op::MOVZ_X, op::MOVK_X, 4)
        } else {
            (op::MOVZ_W, op::MOVK_W, 2)
        };
        let part = |i: u32| ((value >> (16 * i)) & 0xFFFF) as u32;
        let first = (0..halves).find(|i| part(*i) != 0).unwrap_or(0);
        self.emit(movz | (first << 21) | (part(first) << 5) | rd);
        for i in (first + 1)..halves {
            if part(i) != 0 {
                self.emit(movk | (i << 21) | (part(i) << 5) | rd);
            }
        }
    }

    /// Fixed-length MOVZ + 3 MOVK, so the value can be patched later.
    fn mov_abs(&mut self, rd: u32, value: u64) {
        self.emit(op::MOVZ_X | (((value & 0xFFFF) as u32) << 5) | rd);
        for i in 1..MOV_ABS_WORDS as u32 {
            let part = ((value >> (16 * i)) & 0xFFFF) as u32;
            self.emit(op::MOVK_X | (i << 21) | (part << 5) | rd);
        }
    }

    fn memory(&mut self, access: Access, load: bool, rt: u32, base: Base, offset: i32) -> CodeGenResult<()> {
        let (opcode, scale) = memory_op(access, load);
        let rn = match base {
            Base::Frame => SP,
            Base::Reg(r) => gp(r)?,
        };
        match scalable_offset(offset, scale) {
            Some(imm) => self.emit(opcode | (imm << 10) | (rn << 5) | rt),
            None if base == Base::Frame => {
                return Err(CodeGenError::Encoding(format!("frame offset {offset} out of range")))
            }
            None => {
                self.mov_wide(IP1, offset as i64 as u64, true);
                self.emit(rrr(op::ADD_X, IP1, rn, IP1));
                self.emit(opcode | (IP1 << 5) | rt);
            }
        }
        Ok(())
    }

    fn arg(&self, arg: ArgAssignment, access: Access) -> CodeGenResult<u32> {
        if arg.index >= 8 || access.bank() != arg.bank {
            return Err(CodeGenError::Encoding(format!("{access:?} access cannot use argument {arg:?}")));
        }
        Ok(arg.index as u32)
    }

    fn emit_jump(&mut self, target: Label, form: BranchForm) -> CodeGenResult<()> {
        let at = self.code.len();
        match (form, self.labels.offset(target)) {
            (BranchForm::Direct, Some(offset)) => {
                let word = branch26(op::B, offset as i64 - at as i64)?;
                self.emit(word);
            }
            (BranchForm::Direct, None) => {
                self.emit(op::B);
                self.fixups.push(Fixup::Branch26 { at, label: target });
            }
            (BranchForm::Indirect, known) => {
                self.mov_abs(IP0, known.map_or(0, |off| self.base.wrapping_add(off as u64)));
                if known.is_none() {
                    self.fixups.push(Fixup::Absolute { at, label: target });
                }
                self.emit(op::BR | (IP0 << 5));
            }
        }
        Ok(())
    }
}

fn branch26(opcode: u32, delta: i64) -> CodeGenResult<u32> {
    let words = delta / 4;
    if delta % 4 != 0 || !(-(1 << 25)..(1 << 25)).contains(&words) {
        return Err(CodeGenError::Encoding(format!("branch offset {delta:#x} out of range")));
    }
    Ok(opcode | (words as u32 & 0x03FF_FFFF))
}

impl Emitter for A64Emitter {
    type Assigner = Aapcs64Assigner;

    const ISA: Isa = Isa::Aarch64;
    const GP_POOL: usize = GP_COUNT;
    const FP_POOL: usize = FP_COUNT;
    const COND_SKIP: u64 = 4;

    fn new(base: u64) -> CodeGenResult<Self> {
        Ok(A64Emitter {
            base,
            code: Vec::new(),
            labels: Labels::default(),
            fixups: Vec::new(),
        })
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn offset(&mut self) -> CodeGenResult<usize> {
        Ok(self.code.len())
    }

    fn new_label(&mut self) -> Label {
        self.labels.create()
    }

    fn bind(&mut self, label: Label) -> CodeGenResult<()> {
        self.labels.bind(label, self.code.len())
    }

    fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.offset(label)
    }

    fn prologue(&mut self, frame_size: u32) -> CodeGenResult<()> {
        if frame_size > 4095 {
            return Err(CodeGenError::unsupported(
                "method",
                DataType::NoType,
                format!("frame of {frame_size} bytes exceeds a single sp adjustment"),
            ));
        }
        self.emit(op::STP_PRE_FP_LR);
        self.emit(op::ADD_IMM_X | (SP << 5) | FP);
        if frame_size > 0 {
            self.emit(op::SUB_IMM_X | (frame_size << 10) | (SP << 5) | SP);
        }
        Ok(())
    }

    fn epilogue(&mut self) -> CodeGenResult<()> {
        self.emit(op::ADD_IMM_X | (FP << 5) | SP);
        self.emit(op::LDP_POST_FP_LR);
        self.emit(op::RET);
        Ok(())
    }

    fn spill_arg(&mut self, arg: ArgAssignment, access: Access, offset: i32) -> CodeGenResult<()> {
        let rt = self.arg(arg, access)?;
        self.memory(access, false, rt, Base::Frame, offset)
    }

    fn load_arg(&mut self, arg: ArgAssignment, access: Access, offset: i32) -> CodeGenResult<()> {
        let rt = self.arg(arg, access)?;
        self.memory(access, true, rt, Base::Frame, offset)
    }

    fn load(&mut self, access: Access, dst: Reg, base: Base, offset: i32) -> CodeGenResult<()> {
        let rt = checked(access, dst)?;
        self.memory(access, true, rt, base, offset)
    }

    fn store(&mut self, access: Access, src: Reg, base: Base, offset: i32) -> CodeGenResult<()> {
        let rt = checked(access, src)?;
        self.memory(access, false, rt, base, offset)
    }

    fn mov_imm(&mut self, dst: u8, value: i64, wide: bool) -> CodeGenResult<()> {
        let rd = gp(dst)?;
        let value = if wide { value as u64 } else { value as u32 as u64 };
        self.mov_wide(rd, value, wide);
        Ok(())
    }

    fn fmov_imm(&mut self, dst: u8, bits: u64, double: bool) -> CodeGenResult<()> {
        let rd = fp(dst)?;
        self.mov_wide(IP0, bits, double);
        let fmov = if double { op::FMOV_D_X } else { op::FMOV_S_W };
        self.emit(fmov | (IP0 << 5) | rd);
        Ok(())
    }

    fn int_op(&mut self, iop: IntOp, wide: bool, dst: u8, rhs: u8) -> CodeGenResult<()> {
        let (d, m) = (gp(dst)?, gp(rhs)?);
        let base = match iop {
            IntOp::Add => op::ADD_X,
            IntOp::Sub => op::SUB_X,
            IntOp::Mul => op::MUL_X,
            IntOp::And => op::AND_X,
            IntOp::Or => op::ORR_X,
            IntOp::Xor => op::EOR_X,
            IntOp::Shl => op::LSLV_X,
            IntOp::Shr => op::ASRV_X,
            IntOp::UShr => op::LSRV_X,
            IntOp::Ror => op::RORV_X,
            IntOp::Rol => {
                return Err(CodeGenError::Encoding(
                    "AArch64 has no rotate-left instruction".to_string(),
                ))
            }
        };
        let base = if wide { base } else { base & !op::SF };
        self.emit(rrr(base, d, d, m));
        Ok(())
    }

    fn int_neg(&mut self, wide: bool, dst: u8) -> CodeGenResult<()> {
        let d = gp(dst)?;
        let base = if wide { op::SUB_X } else { op::SUB_X & !op::SF };
        self.emit(rrr(base, d, ZR, d));
        Ok(())
    }

    fn float_op(&mut self, fop: FloatOp, double: bool, dst: u8, rhs: u8) -> CodeGenResult<()> {
        let (d, m) = (fp(dst)?, fp(rhs)?);
        let base = match fop {
            FloatOp::Add => op::FADD_S,
            FloatOp::Sub => op::FSUB_S,
            FloatOp::Mul => op::FMUL_S,
            FloatOp::Div => op::FDIV_S,
        };
        let ftype = if double { op::FTYPE_D } else { 0 };
        self.emit(rrr(base | ftype, d, d, m));
        Ok(())
    }

    fn float_sqrt(&mut self, double: bool, dst: u8) -> CodeGenResult<()> {
        let d = fp(dst)?;
        let ftype = if double { op::FTYPE_D } else { 0 };
        self.emit(op::FSQRT_S | ftype | (d << 5) | d);
        Ok(())
    }

    fn vector_op(&mut self, vop: VectorOp, lane: LaneType, dst: u8, rhs: u8) -> CodeGenResult<()> {
        let (d, m) = (fp(dst)?, fp(rhs)?);
        let size = match lane {
            LaneType::I8 => 0,
            LaneType::I16 | LaneType::F32 => 1,
            LaneType::I32 => 2,
            LaneType::I64 | LaneType::F64 => 3,
        };
        // integer forms take log2 of the lane size, float forms a single sz bit
        let base = match (vop, lane.is_float()) {
            (VectorOp::Add, false) => op::ADD_V | (size << 22),
            (VectorOp::Sub, false) => op::SUB_V | (size << 22),
            (VectorOp::Mul, false) if lane != LaneType::I64 => op::MUL_V | (size << 22),
            (VectorOp::Add, true) => op::FADD_V | ((size & 2) << 21),
            (VectorOp::Sub, true) => op::FSUB_V | ((size & 2) << 21),
            (VectorOp::Mul, true) => op::FMUL_V | ((size & 2) << 21),
            (VectorOp::Div, true) => op::FDIV_V | ((size & 2) << 21),
            _ => {
                return Err(CodeGenError::Encoding(format!(
                    "no AArch64 instruction for {} on {lane:?} lanes",
                    vop.mnemonic()
                )))
            }
        };
        self.emit(rrr(base, d, d, m));
        Ok(())
    }

    fn compare(&mut self, wide: bool, lhs: u8, rhs: u8) -> CodeGenResult<()> {
        let (n, m) = (gp(lhs)?, gp(rhs)?);
        let base = if wide { op::CMP_X } else { op::CMP_X & !op::SF };
        self.emit(base | (m << 16) | (n << 5));
        Ok(())
    }

    fn jump(&mut self, target: Label, form: BranchForm) -> CodeGenResult<()> {
        self.emit_jump(target, form)
    }

    fn branch_if(&mut self, cond: Condition, target: Label, form: BranchForm) -> CodeGenResult<()> {
        let jump_words = match form {
            BranchForm::Direct => 1,
            BranchForm::Indirect => MOV_ABS_WORDS as u32 + 1,
        };
        let skip = 1 + jump_words;
        self.emit(op::B_COND | (skip << 5) | cond_code(cond.invert()));
        self.emit_jump(target, form)
    }

    fn call(&mut self, target: u64, form: BranchForm) -> CodeGenResult<()> {
        trace!("call {target:#x} ({form:?})");
        match form {
            BranchForm::Direct => {
                let word = branch26(op::BL, target as i64 - self.here() as i64)?;
                self.emit(word);
            }
            BranchForm::Indirect => {
                self.mov_abs(IP0, target);
                self.emit(op::BLR | (IP0 << 5));
            }
        }
        Ok(())
    }

    fn move_result(&mut self, src: Reg) -> CodeGenResult<()> {
        match src {
            Reg::Gp(i) => {
                let s = gp(i)?;
                self.emit(rrr(op::ORR_X, 0, ZR, s));
            }
            Reg::Fp(i) => {
                let s = fp(i)?;
                self.emit(rrr(op::ORR_V16B, 0, s, s));
            }
        }
        Ok(())
    }

    fn take_result(&mut self, dst: Reg) -> CodeGenResult<()> {
        match dst {
            Reg::Gp(i) => {
                let d = gp(i)?;
                self.emit(rrr(op::ORR_X, d, ZR, 0));
            }
            Reg::Fp(i) => {
                let d = fp(i)?;
                self.emit(rrr(op::ORR_V16B, d, 0, 0));
            }
        }
        Ok(())
    }

    fn finish(mut self) -> CodeGenResult<Vec<u8>> {
        for fixup in std::mem::take(&mut self.fixups) {
            match fixup {
                Fixup::Branch26 { at, label } => {
                    let target = self.labels.resolve(label)?;
                    let word = branch26(self.word_at(at), target as i64 - at as i64)?;
                    self.patch(at, word);
                }
                Fixup::Absolute { at, label } => {
                    let value = self.base.wrapping_add(self.labels.resolve(label)? as u64);
                    for i in 0..MOV_ABS_WORDS {
                        let slot = at + 4 * i;
                        let part = ((value >> (16 * i)) & 0xFFFF) as u32;
                        let word = (self.word_at(slot) & !(0xFFFF << 5)) | (part << 5);
                        self.patch(slot, word);
                    }
                }
            }
        }
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn frame_setup_and_teardown() {
        let mut e = A64Emitter::new(0).unwrap();
        e.prologue(32).unwrap();
        e.epilogue().unwrap();
        let w = words(&e.finish().unwrap());
        // stp x29, x30, [sp, #-16]!; mov x29, sp; sub sp, sp, #32
        assert_eq!(&w[..3], &[0xA9BF_7BFD, 0x9100_03FD, 0xD100_83FF]);
        // mov sp, x29; ldp x29, x30, [sp], #16; ret
        assert_eq!(&w[3..], &[0x9100_03BF, 0xA8C1_7BFD, 0xD65F_03C0]);
    }

    #[test]
    fn large_frames_are_refused() {
        let mut e = A64Emitter::new(0).unwrap();
        assert!(matches!(e.prologue(8192), Err(CodeGenError::Unsupported { .. })));
    }

    #[test]
    fn arithmetic_words() {
        let mut e = A64Emitter::new(0).unwrap();
        e.int_op(IntOp::Add, true, 0, 1).unwrap();
        e.int_op(IntOp::Sub, false, 0, 1).unwrap();
        e.int_op(IntOp::Ror, false, 2, 3).unwrap();
        e.int_neg(false, 1).unwrap();
        e.float_op(FloatOp::Add, true, 0, 1).unwrap();
        e.vector_op(VectorOp::Add, LaneType::F64, 0, 1).unwrap();
        e.vector_op(VectorOp::Add, LaneType::I8, 0, 1).unwrap();
        e.vector_op(VectorOp::Mul, LaneType::F32, 0, 1).unwrap();
        assert!(e.int_op(IntOp::Rol, true, 0, 1).is_err());
        assert!(e.vector_op(VectorOp::Mul, LaneType::I64, 0, 1).is_err());
        let w = words(&e.finish().unwrap());
        assert_eq!(w[0], 0x8B0A_0129); // add x9, x9, x10
        assert_eq!(w[1], 0x4B0A_0129); // sub w9, w9, w10
        assert_eq!(w[2], 0x1ACC_2D6B); // ror w11, w11, w12
        assert_eq!(w[3], 0x4B0A_03EA); // neg w10, w10
        assert_eq!(w[4], 0x1E71_2A10); // fadd d16, d16, d17
        assert_eq!(w[5], 0x4E71_D610); // fadd v16.2d, v16.2d, v17.2d
        assert_eq!(w[6], 0x4E31_8610); // add v16.16b, v16.16b, v17.16b
        assert_eq!(w[7], 0x6E31_DE10); // fmul v16.4s, v16.4s, v17.4s
    }

    #[test]
    fn frame_loads_scale_their_offsets() {
        let mut e = A64Emitter::new(0).unwrap();
        e.load(Access::I64, Reg::Gp(0), Base::Frame, 16).unwrap();
        e.store(Access::V128, Reg::Fp(1), Base::Frame, 32).unwrap();
        e.load(Access::I8, Reg::Gp(2), Base::Reg(0), 3).unwrap();
        assert!(e.load(Access::I64, Reg::Gp(0), Base::Frame, 12).is_err());
        assert!(e.load(Access::F64, Reg::Gp(0), Base::Frame, 8).is_err());
        let w = words(&e.finish().unwrap());
        assert_eq!(w[0], 0xF940_0BE9); // ldr x9, [sp, #16]
        assert_eq!(w[1], 0x3D80_0BF1); // str q17, [sp, #32]
        assert_eq!(w[2], 0x39C0_0D2B); // ldrsb w11, [x9, #3]
    }

    #[test]
    fn unaligned_pointer_offsets_go_through_ip1() {
        let mut e = A64Emitter::new(0).unwrap();
        e.load(Access::I32, Reg::Gp(0), Base::Reg(1), -4).unwrap();
        let w = words(&e.finish().unwrap());
        // movz x17 / movk x17 x3, add x17, x10, x17, ldr w9, [x17]
        assert_eq!(w.len(), 6);
        assert_eq!(w[4], 0x8B11_0151);
        assert_eq!(w[5], 0xB940_0229);
    }

    #[test]
    fn branches_are_patched() {
        let mut e = A64Emitter::new(0x1_0000).unwrap();
        let top = e.new_label();
        let end = e.new_label();
        e.bind(top).unwrap();
        e.compare(true, 0, 1).unwrap();
        e.branch_if(Condition::Lt, end, BranchForm::Direct).unwrap();
        e.jump(top, BranchForm::Direct).unwrap();
        e.jump(end, BranchForm::Indirect).unwrap();
        e.bind(end).unwrap();
        let end_offset = e.label_offset(end).unwrap() as u64;
        let w = words(&e.finish().unwrap());

        assert_eq!(w[0], 0xEB0A_013F); // cmp x9, x10
        assert_eq!(w[1], 0x5400_004A); // b.ge .+8
        assert_eq!(w[2], 0x1400_0000 | (end_offset as u32 - 8) / 4);
        assert_eq!(w[3], 0x1400_0000 | (-3i32 as u32 & 0x03FF_FFFF)); // b top
        let target = 0x1_0000 + end_offset;
        let imm = |word: u32| ((word >> 5) & 0xFFFF) as u64;
        let value = (4..8).fold(0u64, |acc, i| acc | (imm(w[i]) << (16 * (i - 4))));
        assert_eq!(value, target);
        assert_eq!(w[8], 0xD61F_0200); // br x16
    }

    #[test]
    fn calls_pick_encoding_by_form() {
        let mut e = A64Emitter::new(0x4000).unwrap();
        e.call(0x4000 + 0x100, BranchForm::Direct).unwrap();
        e.call(0xdead_beef_0000, BranchForm::Indirect).unwrap();
        let w = words(&e.finish().unwrap());
        assert_eq!(w[0], 0x9400_0040); // bl .+0x100
        assert_eq!(w[1], 0xD280_0010); // movz x16, #0
        assert_eq!(w[5], 0xD63F_0200); // blr x16
    }
}

// This module provides the x86-64 instruction encoder used by tree lowering. Straight-line code
// is built with the iced-x86 CodeAssembler and flushed to bytes at the current address whenever
// the exact position of the next instruction matters, which is at every label and every branch.
// Branches and calls are encoded one instruction at a time with the iced-x86 Encoder against
// their final address: a direct branch is a rel32 JMP/CALL, an indirect branch materializes the
// absolute target in R11 and jumps or calls through it. Branches to labels that are not bound
// yet are recorded as fixups and patched in place once the whole method has been emitted.
// Conditional branches are an inverted short Jcc that skips over the unconditional form.

//! x86-64 instruction encoding using iced-x86.
//!
//! Pool registers map onto caller-saved registers only: `rax rdx rsi rdi r8 r9 r10`
//! for general purpose values and `xmm0`-`xmm14` for floats and vectors. `rcx`
//! holds shift counts and `r11` is scratch.

use super::calling_convention::SysVAssigner;
use crate::codegen::emitter::{
    Access, ArgAssignment, Base, Emitter, FloatOp, IntOp, Label, Labels, Reg, RegBank,
};
use crate::core::error::{CodeGenError, CodeGenResult};
use crate::cpu::{BranchForm, Isa, LaneType, VectorOp};
use crate::tree::Condition;
use iced_x86::code_asm::*;
use iced_x86::{Code, Encoder, Instruction, Register};
use log::trace;

const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];
const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];
const GP16: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];
const GP8: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];
const XMM: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

/// Hardware numbers of the general purpose pool.
const GP_POOL_REGS: [usize; 7] = [0, 2, 6, 7, 8, 9, 10];
/// Hardware numbers of the System V integer argument registers.
const GP_ARG_REGS: [usize; 6] = [7, 6, 2, 1, 8, 9];
const XMM_POOL: usize = 15;

/// `mov r11, imm64` followed by `jmp r11` / `call r11`.
const INDIRECT_LEN: u64 = 13;
const DIRECT_LEN: u64 = 5;

/// A concrete register.
#[derive(Debug, Clone, Copy)]
enum Phys {
    Gp(usize),
    Xmm(usize),
}

#[derive(Debug, Clone, Copy)]
enum Fixup {
    /// rel32 field at `at`, relative to the end of the field.
    Rel32 { at: usize, label: Label },
    /// imm64 field at `at` holding the label's absolute address.
    Abs64 { at: usize, label: Label },
}

pub struct X64Emitter {
    base: u64,
    code: Vec<u8>,
    asm: CodeAssembler,
    labels: Labels,
    fixups: Vec<Fixup>,
}

fn pool_reg(reg: Reg) -> CodeGenResult<Phys> {
    match reg {
        Reg::Gp(i) => GP_POOL_REGS
            .get(i as usize)
            .map(|n| Phys::Gp(*n))
            .ok_or_else(|| bad_register(reg)),
        Reg::Fp(i) if (i as usize) < XMM_POOL => Ok(Phys::Xmm(i as usize)),
        Reg::Fp(_) => Err(bad_register(reg)),
    }
}

fn arg_reg(arg: ArgAssignment) -> CodeGenResult<Phys> {
    match arg.bank {
        RegBank::GeneralPurpose => GP_ARG_REGS
            .get(arg.index)
            .map(|n| Phys::Gp(*n))
            .ok_or_else(|| CodeGenError::Encoding(format!("no argument register {}", arg.index))),
        RegBank::Vector if arg.index < 8 => Ok(Phys::Xmm(arg.index)),
        RegBank::Vector => Err(CodeGenError::Encoding(format!("no argument register xmm{}", arg.index))),
    }
}

fn bad_register(reg: Reg) -> CodeGenError {
    CodeGenError::Encoding(format!("{reg:?} is outside the x86-64 register pool"))
}

fn gp(index: u8) -> CodeGenResult<usize> {
    match pool_reg(Reg::Gp(index))? {
        Phys::Gp(n) => Ok(n),
        Phys::Xmm(_) => Err(bad_register(Reg::Gp(index))),
    }
}

fn xmm(index: u8) -> CodeGenResult<AsmRegisterXmm> {
    match pool_reg(Reg::Fp(index))? {
        Phys::Xmm(n) => Ok(XMM[n]),
        Phys::Gp(_) => Err(bad_register(Reg::Fp(index))),
    }
}

fn jcc(cond: Condition) -> Code {
    match cond {
        Condition::Eq => Code::Je_rel8_64,
        Condition::Ne => Code::Jne_rel8_64,
        Condition::Lt => Code::Jl_rel8_64,
        Condition::Ge => Code::Jge_rel8_64,
        Condition::Gt => Code::Jg_rel8_64,
        Condition::Le => Code::Jle_rel8_64,
    }
}

impl X64Emitter {
    /// Assembles the pending CodeAssembler instructions at the current address.
    fn flush(&mut self) -> CodeGenResult<()> {
        if self.asm.instructions().is_empty() {
            return Ok(());
        }
        let ip = self.base.wrapping_add(self.code.len() as u64);
        let bytes = self.asm.assemble(ip)?;
        self.code.extend_from_slice(&bytes);
        self.asm.reset();
        Ok(())
    }

    /// Encodes one instruction at its final address; returns its offset.
    fn encode(&mut self, instruction: &Instruction) -> CodeGenResult<usize> {
        self.flush()?;
        let at = self.code.len();
        let mut encoder = Encoder::try_new(64)?;
        encoder.encode(instruction, self.base.wrapping_add(at as u64))?;
        self.code.extend_from_slice(&encoder.take_buffer());
        Ok(at)
    }

    fn memory(&self, base: Base, offset: i32) -> CodeGenResult<AsmMemoryOperand> {
        Ok(match base {
            Base::Reg(r) => GP64[gp(r)?] + offset,
            Base::Frame => rsp + offset,
        })
    }

    fn load_phys(&mut self, access: Access, dst: Phys, m: AsmMemoryOperand) -> CodeGenResult<()> {
        match (access, dst) {
            (Access::I8, Phys::Gp(d)) => self.asm.movsx(GP32[d], byte_ptr(m))?,
            (Access::I16, Phys::Gp(d)) => self.asm.movsx(GP32[d], word_ptr(m))?,
            (Access::I32, Phys::Gp(d)) => self.asm.mov(GP32[d], dword_ptr(m))?,
            (Access::I64, Phys::Gp(d)) => self.asm.mov(GP64[d], qword_ptr(m))?,
            (Access::F32, Phys::Xmm(d)) => self.asm.movss(XMM[d], dword_ptr(m))?,
            (Access::F64, Phys::Xmm(d)) => self.asm.movq(XMM[d], qword_ptr(m))?,
            (Access::V128, Phys::Xmm(d)) => self.asm.movdqu(XMM[d], xmmword_ptr(m))?,
            _ => return Err(bank_mismatch(access, dst)),
        }
        Ok(())
    }

    fn store_phys(&mut self, access: Access, src: Phys, m: AsmMemoryOperand) -> CodeGenResult<()> {
        match (access, src) {
            (Access::I8, Phys::Gp(s)) => self.asm.mov(byte_ptr(m), GP8[s])?,
            (Access::I16, Phys::Gp(s)) => self.asm.mov(word_ptr(m), GP16[s])?,
            (Access::I32, Phys::Gp(s)) => self.asm.mov(dword_ptr(m), GP32[s])?,
            (Access::I64, Phys::Gp(s)) => self.asm.mov(qword_ptr(m), GP64[s])?,
            (Access::F32, Phys::Xmm(s)) => self.asm.movss(dword_ptr(m), XMM[s])?,
            (Access::F64, Phys::Xmm(s)) => self.asm.movq(qword_ptr(m), XMM[s])?,
            (Access::V128, Phys::Xmm(s)) => self.asm.movdqu(xmmword_ptr(m), XMM[s])?,
            _ => return Err(bank_mismatch(access, src)),
        }
        Ok(())
    }

    /// Emits the unconditional part of a jump, direct or through r11.
    fn emit_jump(&mut self, target: Label, form: BranchForm) -> CodeGenResult<()> {
        let known = self.labels.offset(target).map(|off| self.base.wrapping_add(off as u64));
        match form {
            BranchForm::Direct => {
                let next = self.base.wrapping_add(self.offset()? as u64 + DIRECT_LEN);
                let instruction = Instruction::with_branch(Code::Jmp_rel32_64, known.unwrap_or(next))?;
                let at = self.encode(&instruction)?;
                if known.is_none() {
                    self.fixups.push(Fixup::Rel32 { at: at + 1, label: target });
                }
            }
            BranchForm::Indirect => {
                let instruction = Instruction::with2(Code::Mov_r64_imm64, Register::R11, known.unwrap_or(0))?;
                let at = self.encode(&instruction)?;
                if known.is_none() {
                    self.fixups.push(Fixup::Abs64 { at: at + 2, label: target });
                }
                self.encode(&Instruction::with1(Code::Jmp_rm64, Register::R11)?)?;
            }
        }
        Ok(())
    }
}

fn bank_mismatch(access: Access, reg: Phys) -> CodeGenError {
    CodeGenError::Encoding(format!("{access:?} access cannot use {reg:?}"))
}

impl Emitter for X64Emitter {
    type Assigner = SysVAssigner;

    const ISA: Isa = Isa::X86_64;
    const GP_POOL: usize = GP_POOL_REGS.len();
    const FP_POOL: usize = XMM_POOL;
    const COND_SKIP: u64 = 2;

    fn new(base: u64) -> CodeGenResult<Self> {
        Ok(X64Emitter {
            base,
            code: Vec::new(),
            asm: CodeAssembler::new(64)?,
            labels: Labels::default(),
            fixups: Vec::new(),
        })
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn offset(&mut self) -> CodeGenResult<usize> {
        self.flush()?;
        Ok(self.code.len())
    }

    fn new_label(&mut self) -> Label {
        self.labels.create()
    }

    fn bind(&mut self, label: Label) -> CodeGenResult<()> {
        let offset = self.offset()?;
        self.labels.bind(label, offset)
    }

    fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.offset(label)
    }

    fn prologue(&mut self, frame_size: u32) -> CodeGenResult<()> {
        self.asm.push(rbp)?;
        self.asm.mov(rbp, rsp)?;
        if frame_size > 0 {
            let size = i32::try_from(frame_size)
                .map_err(|_| CodeGenError::Encoding(format!("frame of {frame_size} bytes")))?;
            self.asm.sub(rsp, size)?;
        }
        Ok(())
    }

    fn epilogue(&mut self) -> CodeGenResult<()> {
        self.asm.mov(rsp, rbp)?;
        self.asm.pop(rbp)?;
        self.asm.ret()?;
        Ok(())
    }

    fn spill_arg(&mut self, arg: ArgAssignment, access: Access, offset: i32) -> CodeGenResult<()> {
        let src = arg_reg(arg)?;
        self.store_phys(access, src, rsp + offset)
    }

    fn load_arg(&mut self, arg: ArgAssignment, access: Access, offset: i32) -> CodeGenResult<()> {
        let dst = arg_reg(arg)?;
        self.load_phys(access, dst, rsp + offset)
    }

    fn load(&mut self, access: Access, dst: Reg, base: Base, offset: i32) -> CodeGenResult<()> {
        let m = self.memory(base, offset)?;
        self.load_phys(access, pool_reg(dst)?, m)
    }

    fn store(&mut self, access: Access, src: Reg, base: Base, offset: i32) -> CodeGenResult<()> {
        let m = self.memory(base, offset)?;
        self.store_phys(access, pool_reg(src)?, m)
    }

    fn mov_imm(&mut self, dst: u8, value: i64, wide: bool) -> CodeGenResult<()> {
        let d = gp(dst)?;
        if wide {
            self.asm.mov(GP64[d], value)?;
        } else {
            self.asm.mov(GP32[d], value as i32)?;
        }
        Ok(())
    }

    fn fmov_imm(&mut self, dst: u8, bits: u64, double: bool) -> CodeGenResult<()> {
        let x = xmm(dst)?;
        if double {
            self.asm.mov(r11, bits)?;
            self.asm.movq(x, r11)?;
        } else {
            self.asm.mov(r11d, bits as u32)?;
            self.asm.movd(x, r11d)?;
        }
        Ok(())
    }

    fn int_op(&mut self, op: IntOp, wide: bool, dst: u8, rhs: u8) -> CodeGenResult<()> {
        let (d, r) = (gp(dst)?, gp(rhs)?);
        macro_rules! alu {
            ($op:ident) => {
                if wide {
                    self.asm.$op(GP64[d], GP64[r])?
                } else {
                    self.asm.$op(GP32[d], GP32[r])?
                }
            };
        }
        macro_rules! by_cl {
            ($op:ident) => {{
                self.asm.mov(ecx, GP32[r])?;
                if wide {
                    self.asm.$op(GP64[d], cl)?
                } else {
                    self.asm.$op(GP32[d], cl)?
                }
            }};
        }
        match op {
            IntOp::Add => alu!(add),
            IntOp::Sub => alu!(sub),
            IntOp::Mul => alu!(imul_2),
            IntOp::And => alu!(and),
            IntOp::Or => alu!(or),
            IntOp::Xor => alu!(xor),
            IntOp::Shl => by_cl!(shl),
            IntOp::Shr => by_cl!(sar),
            IntOp::UShr => by_cl!(shr),
            IntOp::Rol => by_cl!(rol),
            IntOp::Ror => by_cl!(ror),
        }
        Ok(())
    }

    fn int_neg(&mut self, wide: bool, dst: u8) -> CodeGenResult<()> {
        let d = gp(dst)?;
        if wide {
            self.asm.neg(GP64[d])?;
        } else {
            self.asm.neg(GP32[d])?;
        }
        Ok(())
    }

    fn float_op(&mut self, op: FloatOp, double: bool, dst: u8, rhs: u8) -> CodeGenResult<()> {
        let (d, r) = (xmm(dst)?, xmm(rhs)?);
        match (op, double) {
            (FloatOp::Add, false) => self.asm.addss(d, r)?,
            (FloatOp::Add, true) => self.asm.addsd(d, r)?,
            (FloatOp::Sub, false) => self.asm.subss(d, r)?,
            (FloatOp::Sub, true) => self.asm.subsd(d, r)?,
            (FloatOp::Mul, false) => self.asm.mulss(d, r)?,
            (FloatOp::Mul, true) => self.asm.mulsd(d, r)?,
            (FloatOp::Div, false) => self.asm.divss(d, r)?,
            (FloatOp::Div, true) => self.asm.divsd(d, r)?,
        }
        Ok(())
    }

    fn float_sqrt(&mut self, double: bool, dst: u8) -> CodeGenResult<()> {
        let d = xmm(dst)?;
        if double {
            self.asm.sqrtsd(d, d)?;
        } else {
            self.asm.sqrtss(d, d)?;
        }
        Ok(())
    }

    fn vector_op(&mut self, op: VectorOp, lane: LaneType, dst: u8, rhs: u8) -> CodeGenResult<()> {
        let (d, r) = (xmm(dst)?, xmm(rhs)?);
        match (op, lane) {
            (VectorOp::Add, LaneType::I8) => self.asm.paddb(d, r)?,
            (VectorOp::Add, LaneType::I16) => self.asm.paddw(d, r)?,
            (VectorOp::Add, LaneType::I32) => self.asm.paddd(d, r)?,
            (VectorOp::Add, LaneType::I64) => self.asm.paddq(d, r)?,
            (VectorOp::Add, LaneType::F32) => self.asm.addps(d, r)?,
            (VectorOp::Add, LaneType::F64) => self.asm.addpd(d, r)?,
            (VectorOp::Sub, LaneType::I8) => self.asm.psubb(d, r)?,
            (VectorOp::Sub, LaneType::I16) => self.asm.psubw(d, r)?,
            (VectorOp::Sub, LaneType::I32) => self.asm.psubd(d, r)?,
            (VectorOp::Sub, LaneType::I64) => self.asm.psubq(d, r)?,
            (VectorOp::Sub, LaneType::F32) => self.asm.subps(d, r)?,
            (VectorOp::Sub, LaneType::F64) => self.asm.subpd(d, r)?,
            (VectorOp::Mul, LaneType::I16) => self.asm.pmullw(d, r)?,
            (VectorOp::Mul, LaneType::I32) => self.asm.pmulld(d, r)?,
            (VectorOp::Mul, LaneType::F32) => self.asm.mulps(d, r)?,
            (VectorOp::Mul, LaneType::F64) => self.asm.mulpd(d, r)?,
            (VectorOp::Div, LaneType::F32) => self.asm.divps(d, r)?,
            (VectorOp::Div, LaneType::F64) => self.asm.divpd(d, r)?,
            _ => {
                return Err(CodeGenError::Encoding(format!(
                    "no x86-64 instruction for {} on {lane:?} lanes",
                    op.mnemonic()
                )))
            }
        }
        Ok(())
    }

    fn compare(&mut self, wide: bool, lhs: u8, rhs: u8) -> CodeGenResult<()> {
        let (l, r) = (gp(lhs)?, gp(rhs)?);
        if wide {
            self.asm.cmp(GP64[l], GP64[r])?;
        } else {
            self.asm.cmp(GP32[l], GP32[r])?;
        }
        Ok(())
    }

    fn jump(&mut self, target: Label, form: BranchForm) -> CodeGenResult<()> {
        self.emit_jump(target, form)
    }

    fn branch_if(&mut self, cond: Condition, target: Label, form: BranchForm) -> CodeGenResult<()> {
        let jump_len = match form {
            BranchForm::Direct => DIRECT_LEN,
            BranchForm::Indirect => INDIRECT_LEN,
        };
        let skip = self.base.wrapping_add(self.offset()? as u64 + Self::COND_SKIP + jump_len);
        self.encode(&Instruction::with_branch(jcc(cond.invert()), skip)?)?;
        self.emit_jump(target, form)
    }

    fn call(&mut self, target: u64, form: BranchForm) -> CodeGenResult<()> {
        trace!("call {target:#x} ({form:?})");
        match form {
            BranchForm::Direct => {
                self.encode(&Instruction::with_branch(Code::Call_rel32_64, target)?)?;
            }
            BranchForm::Indirect => {
                self.encode(&Instruction::with2(Code::Mov_r64_imm64, Register::R11, target)?)?;
                self.encode(&Instruction::with1(Code::Call_rm64, Register::R11)?)?;
            }
        }
        Ok(())
    }

    fn move_result(&mut self, src: Reg) -> CodeGenResult<()> {
        match pool_reg(src)? {
            Phys::Gp(0) | Phys::Xmm(0) => {}
            Phys::Gp(s) => self.asm.mov(rax, GP64[s])?,
            Phys::Xmm(s) => self.asm.movaps(xmm0, XMM[s])?,
        }
        Ok(())
    }

    fn take_result(&mut self, dst: Reg) -> CodeGenResult<()> {
        match pool_reg(dst)? {
            Phys::Gp(0) | Phys::Xmm(0) => {}
            Phys::Gp(d) => self.asm.mov(GP64[d], rax)?,
            Phys::Xmm(d) => self.asm.movaps(XMM[d], xmm0)?,
        }
        Ok(())
    }

    fn finish(mut self) -> CodeGenResult<Vec<u8>> {
        self.flush()?;
        for fixup in std::mem::take(&mut self.fixups) {
            match fixup {
                Fixup::Rel32 { at, label } => {
                    let target = self.labels.resolve(label)? as i64;
                    let rel = i32::try_from(target - (at as i64 + 4)).map_err(|_| {
                        CodeGenError::Encoding(format!("rel32 fixup at {at:#x} out of range"))
                    })?;
                    self.code[at..at + 4].copy_from_slice(&rel.to_le_bytes());
                }
                Fixup::Abs64 { at, label } => {
                    let target = self.base.wrapping_add(self.labels.resolve(label)? as u64);
                    self.code[at..at + 8].copy_from_slice(&target.to_le_bytes());
                }
            }
        }
        Ok(self.code)
    }
}

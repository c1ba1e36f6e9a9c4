//! Tree lowering.
//!
//! Walks each treetop depth-first. A node evaluated at depth `d` produces its
//! value in pool register `d` of its bank; its first child is evaluated at the
//! same depth and its second at `d + 1`. Registers still holding a pending
//! operand are tracked so that calls can save and restore them.

use super::emitter::{
    assign_args, Access, ArgAssignment, Base, Emitter, FloatOp, IntOp, Label, Reg, RegBank,
};
use super::frame::FrameLayout;
use super::{verify, CompileOptions, MachineCode, VectorFallback};
use crate::core::error::{CodeGenError, CodeGenResult};
use crate::cpu::{select_form, BranchForm, Cpu, VectorOp, VectorSupport};
use crate::tree::{DataType, Immediate, Method, Node, Opcode, VECTOR_BYTES};
use log::{debug, trace};

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    direct: usize,
    indirect: usize,
    scalarized: usize,
}

struct Lowering<'a, E: Emitter> {
    cpu: &'a Cpu,
    options: &'a CompileOptions,
    asm: E,
    frame: FrameLayout,
    blocks: Vec<Label>,
    epilogue: Label,
    /// Bytes reserved for the method; unbound labels land below `base + code_limit`.
    code_limit: u64,
    held: Vec<Reg>,
    call_level: usize,
    counters: Counters,
}

/// Lowers a verified method into machine code for `E`'s ISA at `base`.
pub(crate) fn lower<E: Emitter>(
    method: &Method,
    cpu: &Cpu,
    options: &CompileOptions,
    base: u64,
    code_limit: u64,
) -> CodeGenResult<MachineCode> {
    verify::verify(method)?;

    let params = assign_args::<E::Assigner>(&method.params).ok_or_else(|| {
        CodeGenError::unsupported(
            "method",
            method.return_type,
            format!("parameters {:?} cannot all be passed in argument registers", method.params),
        )
    })?;
    let frame = FrameLayout::plan(method, E::GP_POOL.max(E::FP_POOL));
    let mut asm = E::new(base)?;
    let blocks = method.blocks.iter().map(|_| asm.new_label()).collect();
    let epilogue = asm.new_label();

    debug!(
        "lowering {} for {} at {:#x}: {} blocks, frame {} bytes",
        method.symbol(),
        E::ISA,
        base,
        method.blocks.len(),
        frame.size
    );

    let mut lowering = Lowering {
        cpu,
        options,
        asm,
        frame,
        blocks,
        epilogue,
        code_limit,
        held: Vec::new(),
        call_level: 0,
        counters: Counters::default(),
    };
    lowering.method(method, &params)?;

    let Lowering { asm, counters, .. } = lowering;
    let bytes = asm.finish()?;
    trace!("{} bytes of {} code", bytes.len(), E::ISA);
    Ok(MachineCode {
        isa: E::ISA,
        base,
        bytes,
        direct_branches: counters.direct,
        indirect_branches: counters.indirect,
        scalarized_ops: counters.scalarized,
    })
}

/// Access used for 8-byte parameter and argument slots.
fn slot_access(ty: DataType) -> Access {
    match ty {
        DataType::Float => Access::F32,
        DataType::Double => Access::F64,
        _ => Access::I64,
    }
}

impl<'a, E: Emitter> Lowering<'a, E> {
    fn method(&mut self, method: &Method, params: &[ArgAssignment]) -> CodeGenResult<()> {
        self.asm.prologue(self.frame.size)?;
        for (i, (arg, ty)) in params.iter().zip(&method.params).enumerate() {
            self.asm.spill_arg(*arg, slot_access(*ty), self.frame.param(i))?;
        }

        let last_block = method.blocks.len() - 1;
        for (b, block) in method.blocks.iter().enumerate() {
            self.asm.bind(self.blocks[b])?;
            for (t, tree) in block.trees.iter().enumerate() {
                let last = b == last_block && t + 1 == block.trees.len();
                debug!("  [{}] {} ({} nodes)", block.label(b), tree.mnemonic(), tree.size());
                self.treetop(tree, last)?;
            }
        }

        self.asm.bind(self.epilogue)?;
        self.asm.epilogue()
    }

    fn treetop(&mut self, tree: &Node, last: bool) -> CodeGenResult<()> {
        match tree.opcode {
            Opcode::StoreIndirect => {
                let addr = self.operand(&tree.children[0], 0)?;
                let value = self.eval(&tree.children[1], 1)?;
                self.release();
                self.asm
                    .store(Access::of(tree.ty), value, Base::Reg(addr.index()), tree.offset())
            }
            Opcode::Return => {
                if let Some(child) = tree.children.first() {
                    let value = self.eval(child, 0)?;
                    self.asm.move_result(value)?;
                }
                if !last {
                    self.jump_to(self.epilogue)?;
                }
                Ok(())
            }
            Opcode::Goto => {
                let target = self.target(tree)?;
                self.jump_to(target)
            }
            Opcode::IfCmp(cond) => {
                let lhs = self.operand(&tree.children[0], 0)?;
                let rhs = self.eval(&tree.children[1], 1)?;
                self.release();
                self.asm.compare(tree.ty.is_wide(), lhs.index(), rhs.index())?;
                let target = self.target(tree)?;
                let form = self.label_form(target, E::COND_SKIP)?;
                self.asm.branch_if(cond, target, form)
            }
            Opcode::Call => self.call(tree, 0).map(|_| ()),
            _ => self.eval(tree, 0).map(|_| ()),
        }
    }

    /// Evaluates a node whose value must survive evaluation of a sibling.
    fn operand(&mut self, node: &Node, depth: usize) -> CodeGenResult<Reg> {
        let reg = self.eval(node, depth)?;
        self.held.push(reg);
        Ok(reg)
    }

    fn release(&mut self) {
        self.held.pop();
    }

    fn reg_for(&self, ty: DataType, depth: usize) -> CodeGenResult<Reg> {
        let (available, reg) = match RegBank::of(ty) {
            RegBank::GeneralPurpose => (E::GP_POOL, Reg::Gp(depth as u8)),
            RegBank::Vector => (E::FP_POOL, Reg::Fp(depth as u8)),
        };
        if depth >= available {
            return Err(CodeGenError::RegisterPressure {
                depth: depth + 1,
                available,
            });
        }
        Ok(reg)
    }

    fn eval(&mut self, node: &Node, depth: usize) -> CodeGenResult<Reg> {
        if node.opcode == Opcode::Call {
            return self.call(node, depth)?.ok_or_else(|| {
                CodeGenError::unsupported(node.mnemonic(), node.ty, "call without a result used as a value")
            });
        }

        let dst = self.reg_for(node.ty, depth)?;
        let d = dst.index();
        match (node.opcode, node.imm) {
            (Opcode::Load, Immediate::Parm(p)) => {
                let slot = self.frame.param(p as usize);
                self.asm.load(Access::of(node.ty), dst, Base::Frame, slot)?;
            }
            (Opcode::Const, Immediate::Int(v)) => self.asm.mov_imm(d, v, node.ty.is_wide())?,
            (Opcode::Const, Immediate::Float(v)) => match node.ty {
                DataType::Double => self.asm.fmov_imm(d, v.to_bits(), true)?,
                _ => self.asm.fmov_imm(d, (v as f32).to_bits() as u64, false)?,
            },
            (Opcode::LoadIndirect, _) => {
                let addr = self.eval(&node.children[0], depth)?;
                self.asm
                    .load(Access::of(node.ty), dst, Base::Reg(addr.index()), node.offset())?;
            }
            (Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div, _) if node.ty.is_vector() => {
                self.vector_binary(node, depth)?;
            }
            (Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div, _) if node.ty.is_floating() => {
                let op = match node.opcode {
                    Opcode::Add => FloatOp::Add,
                    Opcode::Sub => FloatOp::Sub,
                    Opcode::Mul => FloatOp::Mul,
                    _ => FloatOp::Div,
                };
                let rhs = self.binary(node, depth)?;
                self.asm.float_op(op, node.ty == DataType::Double, d, rhs)?;
            }
            (
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::UShr,
                _,
            ) => {
                let op = match node.opcode {
                    Opcode::Add => IntOp::Add,
                    Opcode::Sub => IntOp::Sub,
                    Opcode::Mul => IntOp::Mul,
                    Opcode::And => IntOp::And,
                    Opcode::Or => IntOp::Or,
                    Opcode::Xor => IntOp::Xor,
                    Opcode::Shl => IntOp::Shl,
                    Opcode::Shr => IntOp::Shr,
                    _ => IntOp::UShr,
                };
                let rhs = self.binary(node, depth)?;
                self.asm.int_op(op, node.ty.is_wide(), d, rhs)?;
            }
            (Opcode::Rol, _) => self.rotate_left(node, depth)?,
            (Opcode::Neg, _) => {
                self.eval(&node.children[0], depth)?;
                self.asm.int_neg(node.ty.is_wide(), d)?;
            }
            (Opcode::Sqrt, _) => {
                if !self.cpu.supports_hardware_sqrt() {
                    return Err(CodeGenError::UnsupportedCapability {
                        opcode: node.mnemonic(),
                        ty: node.ty,
                        capability: "a hardware square root instruction".to_string(),
                    });
                }
                self.eval(&node.children[0], depth)?;
                self.asm.float_sqrt(node.ty == DataType::Double, d)?;
            }
            _ => {
                return Err(CodeGenError::unsupported(
                    node.mnemonic(),
                    node.ty,
                    "not a value-producing operation",
                ))
            }
        }
        Ok(dst)
    }

    /// Evaluates both children; returns the pool index of the right operand.
    fn binary(&mut self, node: &Node, depth: usize) -> CodeGenResult<u8> {
        self.operand(&node.children[0], depth)?;
        let rhs = self.eval(&node.children[1], depth + 1)?;
        self.release();
        Ok(rhs.index())
    }

    fn rotate_left(&mut self, node: &Node, depth: usize) -> CodeGenResult<()> {
        let wide = node.ty.is_wide();
        let (left, right) = if wide {
            (self.cpu.supports_64bit_rotate(true), self.cpu.supports_64bit_rotate(false))
        } else {
            (self.cpu.supports_32bit_rotate(true), self.cpu.supports_32bit_rotate(false))
        };
        if !left && !right {
            return Err(CodeGenError::UnsupportedCapability {
                opcode: node.mnemonic(),
                ty: node.ty,
                capability: "a rotate instruction".to_string(),
            });
        }

        let d = depth as u8;
        let count = self.binary(node, depth)?;
        if left {
            self.asm.int_op(IntOp::Rol, wide, d, count)
        } else {
            // rotl(x, n) == rotr(x, -n) modulo the width
            self.asm.int_neg(false, count)?;
            self.asm.int_op(IntOp::Ror, wide, d, count)
        }
    }

    fn vector_binary(&mut self, node: &Node, depth: usize) -> CodeGenResult<()> {
        let (Some(lane), Some(op)) = (node.ty.lane_type(), node.opcode.vector_op()) else {
            return Err(CodeGenError::unsupported(node.mnemonic(), node.ty, "not a vector operation"));
        };
        let width = self.cpu.vector_width_bits();
        if width != VECTOR_BYTES * 8 {
            return Err(CodeGenError::unsupported(
                node.mnemonic(),
                node.ty,
                format!("target vectors are {width} bits wide"),
            ));
        }

        let native = self.cpu.supports_vector_op(op, lane);
        if !native && self.options.vector_fallback == VectorFallback::Fail {
            let capability = match self.cpu.vector_op_support(op, lane) {
                VectorSupport::RequiresFeature(f) => f.name().to_string(),
                _ => format!("a native {} instruction for {} lanes", op.mnemonic(), node.ty),
            };
            return Err(CodeGenError::UnsupportedCapability {
                opcode: node.mnemonic(),
                ty: node.ty,
                capability,
            });
        }

        let rhs = self.binary(node, depth)?;
        if native {
            self.asm.vector_op(op, lane, depth as u8, rhs)
        } else {
            self.scalarize(op, node.ty, depth)
        }
    }

    /// Applies `op` lane by lane through the frame's lane buffers.
    fn scalarize(&mut self, op: VectorOp, ty: DataType, depth: usize) -> CodeGenResult<()> {
        let (Some(element), Some(lane)) = (ty.element_type(), ty.lane_type()) else {
            return Err(CodeGenError::unsupported("scalarize", ty, "not a vector type"));
        };
        debug!("scalarizing {} on {} lanes of {}", op.mnemonic(), ty.lanes(), element);
        self.counters.scalarized += 1;

        let d = depth as u8;
        let (a, b) = (self.frame.scratch(0), self.frame.scratch(1));
        self.asm.store(Access::V128, Reg::Fp(d), Base::Frame, a)?;
        self.asm.store(Access::V128, Reg::Fp(d + 1), Base::Frame, b)?;

        let lhs = self.reg_for(element, depth)?;
        let rhs = self.reg_for(element, depth + 1)?;
        let access = Access::lane(lane);
        for i in 0..ty.lanes() {
            let off = (i * lane.bytes()) as i32;
            self.asm.load(access, lhs, Base::Frame, a + off)?;
            self.asm.load(access, rhs, Base::Frame, b + off)?;
            if lane.is_float() {
                let fop = match op {
                    VectorOp::Add => FloatOp::Add,
                    VectorOp::Sub => FloatOp::Sub,
                    VectorOp::Mul => FloatOp::Mul,
                    VectorOp::Div => FloatOp::Div,
                };
                self.asm.float_op(fop, element == DataType::Double, d, d + 1)?;
            } else {
                let iop = match op {
                    VectorOp::Add => IntOp::Add,
                    VectorOp::Sub => IntOp::Sub,
                    VectorOp::Mul => IntOp::Mul,
                    VectorOp::Div => {
                        return Err(CodeGenError::unsupported(op.mnemonic(), ty, "integer vector division"))
                    }
                };
                self.asm.int_op(iop, element.is_wide(), d, d + 1)?;
            }
            self.asm.store(access, lhs, Base::Frame, a + off)?;
        }
        self.asm.load(Access::V128, Reg::Fp(d), Base::Frame, a)
    }

    fn call(&mut self, node: &Node, depth: usize) -> CodeGenResult<Option<Reg>> {
        let Immediate::Address(target) = node.imm else {
            return Err(CodeGenError::unsupported(node.mnemonic(), node.ty, "call without a target"));
        };
        let types: Vec<DataType> = node.children.iter().map(|c| c.ty).collect();
        let args = assign_args::<E::Assigner>(&types).ok_or_else(|| {
            CodeGenError::unsupported(
                node.mnemonic(),
                node.ty,
                format!("{} arguments do not fit in argument registers", types.len()),
            )
        })?;
        let result = match node.ty {
            DataType::NoType => None,
            ty => Some(self.reg_for(ty, depth)?),
        };

        let level = self.call_level;
        self.call_level += 1;
        for (j, child) in node.children.iter().enumerate() {
            let value = self.eval(child, depth)?;
            let slot = self.frame.staging(level, j);
            self.asm.store(slot_access(child.ty), value, Base::Frame, slot)?;
        }
        self.call_level -= 1;

        let saved = self.held.clone();
        for (k, reg) in saved.iter().enumerate() {
            self.asm
                .store(Access::whole(reg.bank()), *reg, Base::Frame, self.frame.spill(k))?;
        }
        for (j, (arg, ty)) in args.iter().zip(&types).enumerate() {
            self.asm.load_arg(*arg, slot_access(*ty), self.frame.staging(level, j))?;
        }

        let form = self.call_form(target)?;
        self.asm.call(target, form)?;
        if let Some(dst) = result {
            self.asm.take_result(dst)?;
        }
        for (k, reg) in saved.iter().enumerate() {
            self.asm
                .load(Access::whole(reg.bank()), *reg, Base::Frame, self.frame.spill(k))?;
        }
        Ok(result)
    }

    fn target(&self, tree: &Node) -> CodeGenResult<Label> {
        match tree.imm {
            Immediate::Target(t) => self.blocks.get(t).copied().ok_or_else(|| {
                CodeGenError::unsupported(tree.mnemonic(), tree.ty, format!("no block {t}"))
            }),
            _ => Err(CodeGenError::unsupported(tree.mnemonic(), tree.ty, "branch without a target")),
        }
    }

    fn jump_to(&mut self, label: Label) -> CodeGenResult<()> {
        let form = self.label_form(label, 0)?;
        self.asm.jump(label, form)
    }

    /// Chooses the encoding of an unconditional branch placed `lead` bytes past
    /// the current offset.
    fn label_form(&mut self, label: Label, lead: u64) -> CodeGenResult<BranchForm> {
        let here = self.asm.offset()? as u64;
        let source = self.address(here + lead)?;
        let target = match self.asm.label_offset(label) {
            Some(offset) => self.address(offset as u64)?,
            None => self.address(self.code_limit)?,
        };
        let form = select_form(self.cpu.branch_limits(), target, source);
        self.count(form);
        trace!("branch {source:#x} -> {target:#x}: {form:?}");
        Ok(form)
    }

    fn call_form(&mut self, target: u64) -> CodeGenResult<BranchForm> {
        let here = self.asm.offset()? as u64;
        let source = self.address(here)?;
        let form = select_form(self.cpu.branch_limits(), target, source);
        self.count(form);
        debug!("call {source:#x} -> {target:#x}: {form:?}");
        Ok(form)
    }

    /// Absolute address of `offset` bytes into the method.
    fn address(&self, offset: u64) -> CodeGenResult<u64> {
        let base = self.asm.base();
        base.checked_add(offset).ok_or(CodeGenError::AddressSpace {
            base,
            limit: self.code_limit,
        })
    }

    fn count(&mut self, form: BranchForm) {
        match form {
            BranchForm::Direct => self.counters.direct += 1,
            BranchForm::Indirect => self.counters.indirect += 1,
        }
    }
}

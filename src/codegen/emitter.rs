//! The seam between ISA-independent lowering and the per-ISA encoders.
//!
//! Lowering speaks in pool registers (indices into a per-bank register pool),
//! frame offsets and labels; an [`Emitter`] maps those onto concrete registers
//! and instruction encodings. Each ISA has exactly one implementation, and
//! lowering is instantiated once per ISA.

use crate::core::error::CodeGenResult;
use crate::cpu::{BranchForm, Isa, LaneType, VectorOp};
use crate::tree::{Condition, DataType};

/// Register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    GeneralPurpose,
    /// Scalar floating point and 128-bit vectors.
    Vector,
}

impl RegBank {
    pub fn of(ty: DataType) -> RegBank {
        if ty.is_integral() {
            RegBank::GeneralPurpose
        } else {
            RegBank::Vector
        }
    }
}

/// A register from one of the emitter's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Gp(u8),
    Fp(u8),
}

impl Reg {
    pub fn bank(self) -> RegBank {
        match self {
            Reg::Gp(_) => RegBank::GeneralPurpose,
            Reg::Fp(_) => RegBank::Vector,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Reg::Gp(i) | Reg::Fp(i) => i,
        }
    }
}

/// Width and kind of a memory access. Narrow integer loads sign-extend to 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl Access {
    pub fn of(ty: DataType) -> Access {
        match ty {
            DataType::Int8 => Access::I8,
            DataType::Int16 => Access::I16,
            DataType::Int32 => Access::I32,
            DataType::Int64 | DataType::Address | DataType::NoType => Access::I64,
            DataType::Float => Access::F32,
            DataType::Double => Access::F64,
            _ => Access::V128,
        }
    }

    /// Access covering a whole register of the value's bank when it is
    /// saved to an 8-byte slot (or 16-byte slot for the vector bank).
    pub fn whole(bank: RegBank) -> Access {
        match bank {
            RegBank::GeneralPurpose => Access::I64,
            RegBank::Vector => Access::V128,
        }
    }

    pub fn lane(lane: LaneType) -> Access {
        match lane {
            LaneType::I8 => Access::I8,
            LaneType::I16 => Access::I16,
            LaneType::I32 => Access::I32,
            LaneType::I64 => Access::I64,
            LaneType::F32 => Access::F32,
            LaneType::F64 => Access::F64,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            Access::I8 => 1,
            Access::I16 => 2,
            Access::I32 | Access::F32 => 4,
            Access::I64 | Access::F64 => 8,
            Access::V128 => 16,
        }
    }

    pub fn bank(self) -> RegBank {
        match self {
            Access::I8 | Access::I16 | Access::I32 | Access::I64 => RegBank::GeneralPurpose,
            _ => RegBank::Vector,
        }
    }
}

/// Base of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    /// General purpose pool register holding an address.
    Reg(u8),
    /// The method's frame; offsets are non-negative.
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
    Rol,
    Ror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) usize);

/// Argument register assigned by a calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgAssignment {
    pub bank: RegBank,
    /// Position among the bank's argument registers.
    pub index: usize,
}

/// Register argument assignment of a calling convention.
pub trait CCAssigner: Default {
    /// `None` when the argument would go on the stack.
    fn assign_arg(&mut self, ty: DataType) -> Option<ArgAssignment>;
}

/// Instruction encoder for one ISA.
pub trait Emitter: Sized {
    type Assigner: CCAssigner;

    const ISA: Isa;
    const GP_POOL: usize;
    const FP_POOL: usize;
    /// Bytes of the inverted conditional branch placed in front of the
    /// unconditional jump of a compare-and-branch.
    const COND_SKIP: u64;

    fn new(base: u64) -> CodeGenResult<Self>;

    /// Address the code is assembled for.
    fn base(&self) -> u64;

    /// Offset of the next instruction.
    fn offset(&mut self) -> CodeGenResult<usize>;

    fn new_label(&mut self) -> Label;
    fn bind(&mut self, label: Label) -> CodeGenResult<()>;
    fn label_offset(&self, label: Label) -> Option<usize>;

    fn prologue(&mut self, frame_size: u32) -> CodeGenResult<()>;
    /// Restores the caller's frame and returns.
    fn epilogue(&mut self) -> CodeGenResult<()>;

    /// Stores an incoming argument register to a frame slot.
    fn spill_arg(&mut self, arg: ArgAssignment, access: Access, offset: i32) -> CodeGenResult<()>;
    /// Loads an outgoing argument register from a frame slot.
    fn load_arg(&mut self, arg: ArgAssignment, access: Access, offset: i32) -> CodeGenResult<()>;

    fn load(&mut self, access: Access, dst: Reg, base: Base, offset: i32) -> CodeGenResult<()>;
    fn store(&mut self, access: Access, src: Reg, base: Base, offset: i32) -> CodeGenResult<()>;

    fn mov_imm(&mut self, dst: u8, value: i64, wide: bool) -> CodeGenResult<()>;
    /// Materializes raw IEEE bits into a vector-bank register.
    fn fmov_imm(&mut self, dst: u8, bits: u64, double: bool) -> CodeGenResult<()>;

    /// `dst = dst op rhs`. Shift and rotate counts are taken modulo the width.
    fn int_op(&mut self, op: IntOp, wide: bool, dst: u8, rhs: u8) -> CodeGenResult<()>;
    fn int_neg(&mut self, wide: bool, dst: u8) -> CodeGenResult<()>;
    fn float_op(&mut self, op: FloatOp, double: bool, dst: u8, rhs: u8) -> CodeGenResult<()>;
    fn float_sqrt(&mut self, double: bool, dst: u8) -> CodeGenResult<()>;
    fn vector_op(&mut self, op: VectorOp, lane: LaneType, dst: u8, rhs: u8) -> CodeGenResult<()>;

    fn compare(&mut self, wide: bool, lhs: u8, rhs: u8) -> CodeGenResult<()>;
    fn jump(&mut self, target: Label, form: BranchForm) -> CodeGenResult<()>;
    /// Signed compare-and-branch on the last `compare`.
    fn branch_if(&mut self, cond: Condition, target: Label, form: BranchForm) -> CodeGenResult<()>;
    fn call(&mut self, target: u64, form: BranchForm) -> CodeGenResult<()>;

    /// Moves a value into the return register of its bank.
    fn move_result(&mut self, src: Reg) -> CodeGenResult<()>;
    /// Moves a call's result out of the return register of its bank.
    fn take_result(&mut self, dst: Reg) -> CodeGenResult<()>;

    /// Resolves label references and returns the code.
    fn finish(self) -> CodeGenResult<Vec<u8>>;
}

/// Assigns every parameter of a signature to an argument register.
pub fn assign_args<A: CCAssigner>(types: &[DataType]) -> Option<Vec<ArgAssignment>> {
    let mut assigner = A::default();
    types.iter().map(|ty| assigner.assign_arg(*ty)).collect()
}

/// Shared fixup bookkeeping of the emitters.
#[derive(Debug, Default)]
pub(crate) struct Labels {
    offsets: Vec<Option<usize>>,
}

impl Labels {
    pub fn create(&mut self) -> Label {
        self.offsets.push(None);
        Label(self.offsets.len() - 1)
    }

    pub fn bind(&mut self, label: Label, offset: usize) -> CodeGenResult<()> {
        match self.offsets.get_mut(label.0) {
            Some(slot @ None) => {
                *slot = Some(offset);
                Ok(())
            }
            Some(Some(_)) => Err(crate::core::error::CodeGenError::Encoding(format!(
                "label {} bound twice",
                label.0
            ))),
            None => Err(crate::core::error::CodeGenError::Encoding(format!(
                "unknown label {}",
                label.0
            ))),
        }
    }

    pub fn offset(&self, label: Label) -> Option<usize> {
        self.offsets.get(label.0).copied().flatten()
    }

    pub fn resolve(&self, label: Label) -> CodeGenResult<usize> {
        self.offset(label).ok_or_else(|| {
            crate::core::error::CodeGenError::Encoding(format!("label {} never bound", label.0))
        })
    }
}

//! Typed operation trees.
//!
//! A [`Method`] is an ordered list of [`Block`]s; each block holds top-level
//! trees ("treetops") evaluated in order. Trees are owned by their parent and
//! carry a declared [`DataType`] that the builder has checked against the
//! children. Text is turned into trees by [`parse`] and printed back in the same
//! syntax by the [`Display`](fmt::Display) impl of [`Method`].

pub mod builder;
pub mod reader;

use crate::core::error::ParseResult;
use crate::cpu::{LaneType, VectorOp};
use std::fmt;

/// Size of every vector type.
pub const VECTOR_BYTES: u32 = 16;

/// Parses a textual method.
pub fn parse(text: &str) -> ParseResult<Method> {
    let arena = bumpalo::Bump::new();
    parse_in(&arena, text)
}

/// Parses a textual method using a caller-owned arena for the syntax tree.
pub fn parse_in(arena: &bumpalo::Bump, text: &str) -> ParseResult<Method> {
    let syntax = reader::read(arena, text)?;
    builder::build_method(syntax)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    NoType,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Address,
    VectorInt8,
    VectorInt16,
    VectorInt32,
    VectorInt64,
    VectorFloat,
    VectorDouble,
}

impl DataType {
    pub const ALL: [DataType; 14] = [
        DataType::NoType,
        DataType::Int8,
        DataType::Int16,
        DataType::Int32,
        DataType::Int64,
        DataType::Float,
        DataType::Double,
        DataType::Address,
        DataType::VectorInt8,
        DataType::VectorInt16,
        DataType::VectorInt32,
        DataType::VectorInt64,
        DataType::VectorFloat,
        DataType::VectorDouble,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataType::NoType => "NoType",
            DataType::Int8 => "Int8",
            DataType::Int16 => "Int16",
            DataType::Int32 => "Int32",
            DataType::Int64 => "Int64",
            DataType::Float => "Float",
            DataType::Double => "Double",
            DataType::Address => "Address",
            DataType::VectorInt8 => "VectorInt8",
            DataType::VectorInt16 => "VectorInt16",
            DataType::VectorInt32 => "VectorInt32",
            DataType::VectorInt64 => "VectorInt64",
            DataType::VectorFloat => "VectorFloat",
            DataType::VectorDouble => "VectorDouble",
        }
    }


    /// Held in a general purpose register.
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 | DataType::Address
        )
    }

    pub const fn is_floating(self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }

    pub const fn is_vector(self) -> bool {
        self.lane_type().is_some()
    }

    /// Uses 64-bit integer operations.
    pub const fn is_wide(self) -> bool {
        matches!(self, DataType::Int64 | DataType::Address)
    }

    pub const fn lane_type(self) -> Option<LaneType> {
        match self {
            DataType::VectorInt8 => Some(LaneType::I8),
            DataType::VectorInt16 => Some(LaneType::I16),
            DataType::VectorInt32 => Some(LaneType::I32),
            DataType::VectorInt64 => Some(LaneType::I64),
            DataType::VectorFloat => Some(LaneType::F32),
            DataType::VectorDouble => Some(LaneType::F64),
            _ => None,
        }
    }

    /// Scalar type of one lane of a vector type.
    pub const fn element_type(self) -> Option<DataType> {
        match self.lane_type() {
            Some(LaneType::I8) => Some(DataType::Int8),
            Some(LaneType::I16) => Some(DataType::Int16),
            Some(LaneType::I32) => Some(DataType::Int32),
            Some(LaneType::I64) => Some(DataType::Int64),
            Some(LaneType::F32) => Some(DataType::Float),
            Some(LaneType::F64) => Some(DataType::Double),
            None => None,
        }
    }

    pub const fn lanes(self) -> u32 {
        match self.lane_type() {
            Some(lane) => VECTOR_BYTES / lane.bytes(),
            None => 1,
        }
    }

    /// Opcode prefix letter.
    const fn prefix(self) -> &'static str {
        match self {
            DataType::NoType => "",
            DataType::Int8 => "b",
            DataType::Int16 => "s",
            DataType::Int32 => "i",
            DataType::Int64 => "l",
            DataType::Float => "f",
            DataType::Double => "d",
            DataType::Address => "a",
            _ => "v",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signed comparison of a compare-and-branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Condition {
    pub const ALL: [Condition; 6] = [
        Condition::Eq,
        Condition::Ne,
        Condition::Lt,
        Condition::Ge,
        Condition::Gt,
        Condition::Le,
    ];

    pub const fn suffix(self) -> &'static str {
        match self {
            Condition::Eq => "eq",
            Condition::Ne => "ne",
            Condition::Lt => "lt",
            Condition::Ge => "ge",
            Condition::Gt => "gt",
            Condition::Le => "le",
        }
    }

    pub const fn invert(self) -> Condition {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Ge => Condition::Lt,
            Condition::Gt => Condition::Le,
            Condition::Le => Condition::Gt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Parameter load.
    Load,
    Const,
    LoadIndirect,
    StoreIndirect,
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    /// Arithmetic shift right.
    Shr,
    /// Logical shift right.
    UShr,
    Rol,
    Neg,
    Sqrt,
    Return,
    Goto,
    IfCmp(Condition),
    Call,
}

impl Opcode {
    /// Ends a block.
    pub const fn is_terminator(self) -> bool {
        matches!(self, Opcode::Return | Opcode::Goto)
    }

    pub const fn vector_op(self) -> Option<VectorOp> {
        match self {
            Opcode::Add => Some(VectorOp::Add),
            Opcode::Sub => Some(VectorOp::Sub),
            Opcode::Mul => Some(VectorOp::Mul),
            Opcode::Div => Some(VectorOp::Div),
            _ => None,
        }
    }

    const fn stem(self) -> &'static str {
        match self {
            Opcode::Load => "load",
            Opcode::Const => "const",
            Opcode::LoadIndirect => "loadi",
            Opcode::StoreIndirect => "storei",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::UShr => "ushr",
            Opcode::Rol => "rol",
            Opcode::Neg => "neg",
            Opcode::Sqrt => "sqrt",
            Opcode::Return => "return",
            Opcode::Goto => "goto",
            Opcode::IfCmp(_) => "cmp",
            Opcode::Call => "call",
        }
    }
}

/// Opcode-specific operand that is not a child tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    None,
    Parm(u32),
    /// Byte offset of an indirect access.
    Offset(i32),
    Int(i64),
    Float(f64),
    /// Index of the target block.
    Target(usize),
    /// Absolute address of a call target.
    Address(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub opcode: Opcode,
    /// Result type; for stores the stored type, for compare-branches the
    /// operand type.
    pub ty: DataType,
    pub children: Vec<Node>,
    pub imm: Immediate,
}

impl Node {
    pub fn new(opcode: Opcode, ty: DataType, imm: Immediate, children: Vec<Node>) -> Self {
        Node {
            opcode,
            ty,
            children,
            imm,
        }
    }

    /// Textual opcode, e.g. `iadd` or `ificmplt`.
    pub fn mnemonic(&self) -> String {
        match self.opcode {
            Opcode::IfCmp(c) => format!("if{}cmp{}", self.ty.prefix(), c.suffix()),
            Opcode::Goto => "goto".to_string(),
            op => format!("{}{}", self.ty.prefix(), op.stem()),
        }
    }

    pub fn offset(&self) -> i32 {
        match self.imm {
            Immediate::Offset(o) => o,
            _ => 0,
        }
    }

    /// Number of nodes in this tree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(Node::size).sum::<usize>()
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, blocks: &[Block]) -> fmt::Result {
        write!(f, "({}", self.mnemonic())?;
        match (self.opcode, self.imm) {
            (_, Immediate::Parm(p)) => write!(f, " parm={p}")?,
            (Opcode::Const, Immediate::Int(v)) => write!(f, " {v}")?,
            (Opcode::Const, Immediate::Float(v)) => write!(f, " {v:?}")?,
            (_, Immediate::Target(t)) => match blocks.get(t).and_then(|b| b.name.as_deref()) {
                Some(name) => write!(f, " target=\"{name}\"")?,
                None => write!(f, " target=\"#{t}\"")?,
            },
            (_, Immediate::Address(a)) => write!(f, " address={a:#x}")?,
            _ => {}
        }
        if self.ty.is_vector() && matches!(self.opcode, Opcode::LoadIndirect | Opcode::StoreIndirect)
        {
            write!(f, " type={}", self.ty)?;
        }
        if let Immediate::Offset(o) = self.imm {
            write!(f, " offset={o}")?;
        }
        if self.opcode == Opcode::Call && !self.children.is_empty() {
            write!(f, " args=[")?;
            for (i, c) in self.children.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", c.ty)?;
            }
            write!(f, "]")?;
        }
        for child in &self.children {
            write!(f, " ")?;
            child.write(f, blocks)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: Option<String>,
    pub trees: Vec<Node>,
}

impl Block {
    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("#{index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    pub name: Option<String>,
    pub return_type: DataType,
    pub params: Vec<DataType>,
    pub blocks: Vec<Block>,
}

impl Method {
    /// Name used for symbols and diagnostics.
    pub fn symbol(&self) -> &str {
        self.name.as_deref().unwrap_or("method")
    }

    pub fn trees(&self) -> impl Iterator<Item = &Node> {
        self.blocks.iter().flat_map(|b| b.trees.iter())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(method")?;
        if let Some(name) = &self.name {
            write!(f, " name=\"{name}\"")?;
        }
        write!(f, " return={} args=[", self.return_type)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, "]")?;
        for block in &self.blocks {
            write!(f, "\n  (block")?;
            if let Some(name) = &block.name {
                write!(f, " name=\"{name}\"")?;
            }
            for tree in &block.trees {
                write!(f, "\n    ")?;
                tree.write(f, &self.blocks)?;
            }
            write!(f, ")")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_types_have_lanes() {
        assert_eq!(DataType::VectorInt8.lanes(), 16);
        assert_eq!(DataType::VectorInt16.lanes(), 8);
        assert_eq!(DataType::VectorFloat.lanes(), 4);
        assert_eq!(DataType::VectorDouble.lanes(), 2);
        assert_eq!(DataType::VectorDouble.element_type(), Some(DataType::Double));
        assert_eq!(DataType::Int32.lanes(), 1);
        assert!(!DataType::Address.is_vector());
    }

    #[test]
    fn type_names_round_trip() {
        for t in DataType::ALL {
            assert_eq!(DataType::from_name(t.name()), Some(t));
        }
        assert_eq!(DataType::from_name("Int128"), None);
    }

    #[test]
    fn mnemonics() {
        let c = Node::new(Opcode::Const, DataType::Int32, Immediate::Int(1), vec![]);
        assert_eq!(c.mnemonic(), "iconst");
        let br = Node::new(
            Opcode::IfCmp(Condition::Lt),
            DataType::Int64,
            Immediate::Target(0),
            vec![c.clone(), c.clone()],
        );
        assert_eq!(br.mnemonic(), "iflcmplt");
        let ret = Node::new(Opcode::Return, DataType::NoType, Immediate::None, vec![]);
        assert_eq!(ret.mnemonic(), "return");
        assert_eq!(br.size(), 3);
    }

    #[test]
    fn printed_method_parses_back() {
        let text = "(method return=Int32 args=[Int32] (block name=\"entry\" \
                    (ificmplt target=\"neg\" (iload parm=0) (iconst 0)) (ireturn (iload parm=0))) \
                    (block name=\"neg\" (ireturn (ineg (iload parm=0)))))";
        let method = parse(text).unwrap();
        let again = parse(&method.to_string()).unwrap();
        assert_eq!(method, again);
    }
}

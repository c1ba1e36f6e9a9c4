// This module defines the error types of every pipeline stage using the thiserror crate.
// ParseError covers textual IR that cannot be turned into a typed tree (malformed structure,
// unknown names, bad literals) and operand type mismatches. CodeGenError covers everything
// that can go wrong between a well-formed tree and loaded machine code: operations that have
// no lowering, operations the capability model says the target cannot execute, control-flow
// defects found by the verification pass, register pool exhaustion, encoder failures and
// failures of the executable memory mapping. HarnessError covers the typed execution view.
// CpuError is raised by the capability builder. The crate-level Error wraps all of them so
// that callers chaining parse, compile and run can use a single `?`.

//! Error types for parsing, code generation and execution.

use crate::tree::DataType;
use thiserror::Error;

/// Errors produced while reading textual IR.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("malformed IR at byte {position}: {message}")]
    Malformed { position: usize, message: String },

    #[error("type mismatch in {opcode}: expected {expected}, found {found}")]
    TypeMismatch {
        opcode: String,
        expected: String,
        found: String,
    },
}

impl ParseError {
    pub(crate) fn malformed(position: usize, message: impl Into<String>) -> Self {
        ParseError::Malformed {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn mismatch(opcode: &str, expected: impl ToString, found: impl ToString) -> Self {
        ParseError::TypeMismatch {
            opcode: opcode.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Errors produced while lowering, assembling or loading a method.
#[derive(Error, Debug)]
pub enum CodeGenError {
    #[error("cannot lower {opcode} of type {ty}: {reason}")]
    Unsupported {
        opcode: String,
        ty: DataType,
        reason: String,
    },

    #[error("{opcode} of type {ty} requires {capability}, which the target lacks")]
    UnsupportedCapability {
        opcode: String,
        ty: DataType,
        capability: String,
    },

    #[error("dead code after terminator in block {block} (tree {index})")]
    DeadCode { block: String, index: usize },

    #[error("block {block} is unreachable from the entry block")]
    Unreachable { block: String },

    #[error("control falls off the end of the method after block {block}")]
    FallsOffEnd { block: String },

    #[error("register pressure: expression needs depth {depth}, pool holds {available}")]
    RegisterPressure { depth: usize, available: usize },

    #[error("method needs {size} bytes of code, limit is {limit}")]
    CodeTooLarge { size: usize, limit: usize },

    #[error("{limit} bytes of code at {base:#x} do not fit the address space")]
    AddressSpace { base: u64, limit: u64 },

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("cannot load {target} code on a {host} host")]
    ForeignIsa { target: String, host: String },

    #[error("executable memory: {0}")]
    ExecutableMemory(#[from] std::io::Error),

    #[error("object emission failed: {0}")]
    Object(String),
}

impl CodeGenError {
    pub(crate) fn unsupported(opcode: impl ToString, ty: DataType, reason: impl Into<String>) -> Self {
        CodeGenError::Unsupported {
            opcode: opcode.to_string(),
            ty,
            reason: reason.into(),
        }
    }
}

impl From<iced_x86::IcedError> for CodeGenError {
    fn from(e: iced_x86::IcedError) -> Self {
        CodeGenError::Encoding(e.to_string())
    }
}

/// Errors produced by the typed execution and verification harness.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarnessError {
    #[error("signature mismatch: method is {declared}, requested {requested}")]
    SignatureMismatch { declared: String, requested: String },

    #[error("expected {expected} lanes, got {found}")]
    LaneCount { expected: usize, found: usize },

    #[error("lane {lane}: expected {expected}, observed {observed}")]
    Mismatch {
        lane: usize,
        expected: String,
        observed: String,
    },
}

/// Errors produced when building a capability descriptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CpuError {
    #[error("physical processor {physical} does not belong to the {isa} family of {logical}")]
    ProcessorMismatch {
        isa: &'static str,
        logical: &'static str,
        physical: &'static str,
    },
}

/// Any error the crate can return.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    CodeGen(#[from] CodeGenError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
    #[error(transparent)]
    Cpu(#[from] CpuError),
}

pub type ParseResult<T> = Result<T, ParseError>;
pub type CodeGenResult<T> = Result<T, CodeGenError>;
pub type HarnessResult<T> = Result<T, HarnessError>;

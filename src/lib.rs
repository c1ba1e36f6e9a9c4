//! treejit - a small tree-IR JIT with an explicit CPU capability model.
//!
//! Methods are written as operation trees in a textual S-expression IR,
//! lowered to native code for AArch64 or x86-64, loaded into executable
//! memory and invoked through typed function pointers. Every code generation
//! decision that depends on the target (rotate direction, vector support,
//! branch reach) goes through a [`cpu::Cpu`] descriptor passed in by the
//! caller.
//!
//! # Primary Usage
//!
//! ```no_run
//! use treejit::cpu::Cpu;
//! use treejit::{compile, parse};
//!
//! let method = parse(
//!     "(method return=Int32 args=[Int32] (block (ireturn (iadd (iload parm=0) (iconst 1)))))",
//! )?;
//! let cpu = Cpu::host().expect("unsupported host");
//! let compiled = compile(&method, &cpu)?;
//! let add_one = compiled.entry_point::<unsafe extern "C" fn(i32) -> i32>()?;
//! assert_eq!(unsafe { add_one(41) }, 42);
//! # Ok::<(), treejit::Error>(())
//! ```
//!
//! # Architecture
//!
//! - [`cpu`] - capability model, feature bits and branch reachability
//! - [`tree`] - IR data model and parser
//! - [`codegen`] - verification, frame layout and lowering
//! - [`x64`], [`aarch64`] - per-ISA encoders and calling conventions
//! - [`harness`] - typed invocation and lane-wise verification
//! - [`core`] - errors, executable memory, object files, sessions

pub mod aarch64;
pub mod codegen;
pub mod core;
pub mod cpu;
pub mod harness;
pub mod tree;
pub mod x64;

pub use crate::core::{CompilationSession, Error, SessionStats};
pub use codegen::{assemble, compile, compile_with, CompileOptions, CompiledMethod, MachineCode, VectorFallback};
pub use cpu::{Cpu, Isa};
pub use tree::{parse, DataType, Method};

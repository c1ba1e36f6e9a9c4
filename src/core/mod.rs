// This module collects the infrastructure shared by every stage of the pipeline: the error types
// of parsing, code generation and execution, the executable memory mapping that compiled methods
// live in, ELF object emission for assembled code, and the compilation session that ties an arena,
// a capability model and compile options together across many methods.

//! Shared infrastructure.
//!
//! ## Errors (`error`)
//! - One `thiserror` enum per stage plus the crate-level [`Error`]
//!
//! ## Executable memory (`exec_memory`)
//! - Anonymous mappings flipped from writable to executable once
//!
//! ## Object files (`object_file`)
//! - ELF relocatable objects holding one method
//!
//! ## Session management (`session`)
//! - Arena reuse across parses and per-session statistics

pub mod error;
pub mod exec_memory;
pub mod object_file;
pub mod session;

pub use error::{CodeGenError, CpuError, Error, HarnessError, ParseError};
pub use exec_memory::ExecutableMemory;
pub use object_file::write_object;
pub use session::{CompilationSession, SessionStats};

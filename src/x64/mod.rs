//! x86-64 target support.
//!
//! - Instruction encoding using iced-x86
//! - System V argument register assignment

pub mod calling_convention;
pub mod encoder;

pub use calling_convention::SysVAssigner;
pub use encoder::X64Emitter;

//! AArch64 target support.
//!
//! Code for this ISA can be assembled on any host; it is only loaded and run
//! when the host itself is AArch64.

pub mod calling_convention;
pub mod encoder;

pub use calling_convention::Aapcs64Assigner;
pub use encoder::A64Emitter;

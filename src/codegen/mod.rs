// This module is the code generation pipeline. It takes a parsed Method together with an
// explicit capability model and produces either relocated machine code bytes for any
// supported ISA (assemble) or a loaded, directly callable method for the host ISA
// (compile). Lowering is written once, generically over the Emitter trait, and instantiated
// for the x86-64 encoder (iced-x86) and the AArch64 encoder (raw instruction words). Before
// any code is emitted the control-flow verification pass rejects dead code, unreachable
// blocks and methods that fall off their end. Loading reserves an executable region first so
// that every branch is encoded against its final address; if the code does not fit, the
// region is grown and the method is lowered again.

//! Compilation of operation trees to native code.

pub mod emitter;
pub mod frame;
pub mod lower;
pub mod verify;

use crate::aarch64::A64Emitter;
use crate::core::error::{CodeGenError, CodeGenResult};
use crate::core::exec_memory::ExecutableMemory;
use crate::cpu::{Cpu, Isa};
use crate::tree::{DataType, Method};
use crate::x64::X64Emitter;
use log::{debug, info};

/// What to do with a vector operation the target cannot execute natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorFallback {
    /// Fail with [`CodeGenError::UnsupportedCapability`].
    #[default]
    Fail,
    /// Lower lane by lane with scalar instructions.
    Scalarize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub vector_fallback: VectorFallback,
    /// First executable region size tried by `compile`.
    pub initial_code_capacity: usize,
    /// Upper bound for one method's code.
    pub max_code_size: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            vector_fallback: VectorFallback::Fail,
            initial_code_capacity: 4096,
            max_code_size: 16 << 20,
        }
    }
}

impl CompileOptions {
    pub fn with_vector_fallback(mut self, fallback: VectorFallback) -> Self {
        self.vector_fallback = fallback;
        self
    }

    pub fn with_initial_code_capacity(mut self, bytes: usize) -> Self {
        self.initial_code_capacity = bytes;
        self
    }

    pub fn with_max_code_size(mut self, bytes: usize) -> Self {
        self.max_code_size = bytes;
        self
    }
}

/// Machine code assembled for a fixed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineCode {
    pub isa: Isa,
    pub base: u64,
    pub bytes: Vec<u8>,
    pub direct_branches: usize,
    pub indirect_branches: usize,
    pub scalarized_ops: usize,
}

/// Assembles `method` for the ISA of `cpu` as if loaded at `base`. Works for
/// any ISA regardless of the host.
pub fn assemble(
    method: &Method,
    cpu: &Cpu,
    base: u64,
    options: &CompileOptions,
) -> CodeGenResult<MachineCode> {
    let limit = options.max_code_size;
    let code = lower_for(method, cpu, options, base, limit as u64)?;
    if code.bytes.len() > limit {
        return Err(CodeGenError::CodeTooLarge {
            size: code.bytes.len(),
            limit,
        });
    }
    Ok(code)
}

fn lower_for(
    method: &Method,
    cpu: &Cpu,
    options: &CompileOptions,
    base: u64,
    limit: u64,
) -> CodeGenResult<MachineCode> {
    if base.checked_add(limit).is_none() {
        return Err(CodeGenError::AddressSpace { base, limit });
    }
    match cpu.isa() {
        Isa::X86_64 => lower::lower::<X64Emitter>(method, cpu, options, base, limit),
        Isa::Aarch64 => lower::lower::<A64Emitter>(method, cpu, options, base, limit),
    }
}

pub fn compile(method: &Method, cpu: &Cpu) -> CodeGenResult<CompiledMethod> {
    compile_with(method, cpu, &CompileOptions::default())
}

/// Compiles and loads `method` for the host. `cpu` must describe the host ISA.
pub fn compile_with(
    method: &Method,
    cpu: &Cpu,
    options: &CompileOptions,
) -> CodeGenResult<CompiledMethod> {
    if Isa::host() != Some(cpu.isa()) {
        return Err(CodeGenError::ForeignIsa {
            target: cpu.isa().to_string(),
            host: std::env::consts::ARCH.to_string(),
        });
    }

    let mut capacity = options.initial_code_capacity.min(options.max_code_size).max(1);
    loop {
        let mut region = ExecutableMemory::reserve(capacity)?;
        let limit = region.capacity().min(options.max_code_size);
        let code = lower_for(method, cpu, options, region.address(), limit as u64)?;
        if code.bytes.len() <= limit {
            region.write(&code.bytes)?;
            region.make_executable()?;
            info!(
                "compiled {} ({} bytes at {:#x}, {} direct / {} indirect branches)",
                method.symbol(),
                code.bytes.len(),
                code.base,
                code.direct_branches,
                code.indirect_branches
            );
            return Ok(CompiledMethod {
                name: method.symbol().to_string(),
                params: method.params.clone(),
                return_type: method.return_type,
                code,
                region,
            });
        }
        if limit >= options.max_code_size {
            return Err(CodeGenError::CodeTooLarge {
                size: code.bytes.len(),
                limit: options.max_code_size,
            });
        }
        debug!(
            "{} bytes of code do not fit in {} bytes, growing the region",
            code.bytes.len(),
            limit
        );
        capacity = (code.bytes.len() * 2).min(options.max_code_size);
    }
}

/// A loaded method. The executable mapping lives exactly as long as this value.
#[derive(Debug)]
pub struct CompiledMethod {
    name: String,
    params: Vec<DataType>,
    return_type: DataType,
    code: MachineCode,
    region: ExecutableMemory,
}

impl CompiledMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[DataType] {
        &self.params
    }

    pub fn return_type(&self) -> DataType {
        self.return_type
    }

    pub fn entry_address(&self) -> u64 {
        self.region.address()
    }

    pub fn code_size(&self) -> usize {
        self.code.bytes.len()
    }

    pub fn machine_code(&self) -> &MachineCode {
        &self.code
    }

    pub(crate) fn entry_ptr(&self) -> *const u8 {
        self.region.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::parse;

    #[test]
    fn foreign_isa_is_refused_by_compile() {
        let m = parse("(method return=NoType args=[] (block (return)))").unwrap();
        let foreign = match Isa::host() {
            Some(Isa::X86_64) => Isa::Aarch64,
            _ => Isa::X86_64,
        };
        let err = compile(&m, &Cpu::new(foreign)).unwrap_err();
        assert!(matches!(err, CodeGenError::ForeignIsa { .. }));
    }

    #[test]
    fn assemble_works_for_every_isa() {
        let m = parse("(method return=Int32 args=[Int32] (block (ireturn (iadd (iload parm=0) (iconst 1)))))").unwrap();
        for isa in [Isa::X86_64, Isa::Aarch64] {
            let code = assemble(&m, &Cpu::new(isa), 0x10000, &CompileOptions::default()).unwrap();
            assert_eq!(code.isa, isa);
            assert!(!code.bytes.is_empty());
        }
    }

    #[test]
    fn code_size_limit_is_enforced() {
        let m = parse("(method return=Int32 args=[Int32] (block (ireturn (iadd (iload parm=0) (iconst 1)))))").unwrap();
        let options = CompileOptions::default().with_max_code_size(4);
        let err = assemble(&m, &Cpu::new(Isa::Aarch64), 0, &options).unwrap_err();
        assert!(matches!(err, CodeGenError::CodeTooLarge { limit: 4, .. }));
    }
}

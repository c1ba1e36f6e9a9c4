// This module provides the compilation session: the long-lived context a driver uses to turn many
// IR texts into code against one capability model. The session owns a bumpalo arena that holds
// the S-expression syntax tree while a method is parsed; the arena is reset before each parse so
// its memory is reused across methods instead of being freed and reallocated. The session borrows
// the Cpu it compiles for, carries the CompileOptions applied to every method, and accumulates
// SessionStats across successful and failed compilations.

//! Arena-backed compilation session.

use crate::codegen::{self, CompileOptions, CompiledMethod, MachineCode};
use crate::core::error::{CodeGenResult, Error, ParseResult};
use crate::cpu::Cpu;
use crate::tree::{self, Method};
use bumpalo::Bump;
use log::debug;
use std::fmt;

/// Compilation context bound to one capability model.
pub struct CompilationSession<'cpu> {
    cpu: &'cpu Cpu,
    options: CompileOptions,
    /// Syntax trees of the method being parsed.
    arena: Bump,
    stats: SessionStats,
}

impl<'cpu> CompilationSession<'cpu> {
    pub fn new(cpu: &'cpu Cpu) -> Self {
        Self::with_options(cpu, CompileOptions::default())
    }

    pub fn with_options(cpu: &'cpu Cpu, options: CompileOptions) -> Self {
        Self {
            cpu,
            options,
            arena: Bump::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn cpu(&self) -> &'cpu Cpu {
        self.cpu
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn parse(&mut self, text: &str) -> ParseResult<Method> {
        self.arena.reset();
        let result = tree::parse_in(&self.arena, text);
        self.stats.peak_arena_bytes = self.stats.peak_arena_bytes.max(self.arena.allocated_bytes());
        match &result {
            Ok(method) => {
                self.stats.methods_parsed += 1;
                debug!("parsed {} ({} blocks)", method.symbol(), method.blocks.len());
            }
            Err(_) => self.stats.failures += 1,
        }
        result
    }

    /// Compiles and loads `method` for the host.
    pub fn compile(&mut self, method: &Method) -> CodeGenResult<CompiledMethod> {
        let result = codegen::compile_with(method, self.cpu, &self.options);
        match &result {
            Ok(compiled) => self.record(method.symbol(), compiled.machine_code()),
            Err(_) => self.stats.failures += 1,
        }
        result
    }

    /// Assembles `method` at `base` without loading it.
    pub fn assemble(&mut self, method: &Method, base: u64) -> CodeGenResult<MachineCode> {
        let result = codegen::assemble(method, self.cpu, base, &self.options);
        match &result {
            Ok(code) => self.record(method.symbol(), code),
            Err(_) => self.stats.failures += 1,
        }
        result
    }

    pub fn compile_text(&mut self, text: &str) -> Result<CompiledMethod, Error> {
        let method = self.parse(text)?;
        Ok(self.compile(&method)?)
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    fn record(&mut self, name: &str, code: &MachineCode) {
        let stats = &mut self.stats;
        stats.methods_compiled += 1;
        stats.total_code_size += code.bytes.len();
        stats.direct_branches += code.direct_branches;
        stats.indirect_branches += code.indirect_branches;
        stats.scalarized_ops += code.scalarized_ops;
        if code.bytes.len() > stats.largest_method_size {
            stats.largest_method_size = code.bytes.len();
            stats.largest_method_name = name.to_string();
        }
    }
}

/// Counters accumulated over a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub methods_parsed: usize,
    pub methods_compiled: usize,
    /// Parse or code generation errors.
    pub failures: usize,
    pub total_code_size: usize,
    pub largest_method_size: usize,
    pub largest_method_name: String,
    pub direct_branches: usize,
    pub indirect_branches: usize,
    pub scalarized_ops: usize,
    pub peak_arena_bytes: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Methods parsed: {}", self.methods_parsed)?;
        writeln!(f, "  Methods compiled: {}", self.methods_compiled)?;
        writeln!(f, "  Failures: {}", self.failures)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        if self.methods_compiled > 0 {
            writeln!(
                f,
                "  Largest method: {} ({} bytes)",
                self.largest_method_name, self.largest_method_size
            )?;
        }
        writeln!(
            f,
            "  Branches: {} direct, {} indirect",
            self.direct_branches, self.indirect_branches
        )?;
        writeln!(f, "  Scalarized vector ops: {}", self.scalarized_ops)?;
        write!(f, "  Peak arena usage: {} bytes", self.peak_arena_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Isa;

    const ADD_ONE: &str =
        "(method name=add_one return=Int32 args=[Int32] (block (ireturn (iadd (iload parm=0) (iconst 1)))))";

    #[test]
    fn session_counts_work_across_methods() {
        let cpu = Cpu::new(Isa::Aarch64);
        let mut session = CompilationSession::new(&cpu);
        let method = session.parse(ADD_ONE).unwrap();
        let code = session.assemble(&method, 0x1000).unwrap();
        assert!(session.parse("(method").is_err());
        let again = session.parse(ADD_ONE).unwrap();
        session.assemble(&again, 0x2000).unwrap();

        let stats = session.stats();
        assert_eq!(stats.methods_parsed, 2);
        assert_eq!(stats.methods_compiled, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_code_size, 2 * code.bytes.len());
        assert_eq!(stats.largest_method_name, "add_one");
        assert!(stats.peak_arena_bytes > 0);
        assert!(stats.to_string().contains("Methods compiled: 2"));
    }

    #[test]
    fn options_are_applied_to_every_method() {
        let cpu = Cpu::new(Isa::X86_64);
        let options = CompileOptions::default().with_max_code_size(1);
        let mut session = CompilationSession::with_options(&cpu, options);
        let method = session.parse(ADD_ONE).unwrap();
        assert!(session.assemble(&method, 0).is_err());
        assert_eq!(session.stats().failures, 1);
    }
}

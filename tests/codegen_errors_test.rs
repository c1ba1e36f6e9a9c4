//! Code generation failures that do not depend on the host.
//!
//! Control-flow defects, capability gaps and register exhaustion are all
//! reported before any code is loaded, so these run through `assemble` for
//! both ISAs.

use treejit::codegen::{assemble, CompileOptions, VectorFallback};
use treejit::core::CodeGenError;
use treejit::cpu::{Cpu, Isa, Processor, X86Feature};
use treejit::{parse, CompilationSession};

fn assemble_text(text: &str, cpu: &Cpu, options: &CompileOptions) -> Result<treejit::MachineCode, CodeGenError> {
    assemble(&parse(text).unwrap(), cpu, 0x10000, options)
}

fn vmul_int32() -> String {
    treejit::harness::vector_binary_ir(treejit::cpu::VectorOp::Mul, treejit::DataType::VectorInt32)
}

#[test]
fn test_dead_code_after_return() {
    let _ = env_logger::builder().is_test(true).try_init();

    let text = "(method return=Int32 args=[] (block (ireturn (iconst 1)) (ireturn (iconst 2))))";
    for isa in [Isa::X86_64, Isa::Aarch64] {
        let err = assemble_text(text, &Cpu::new(isa), &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CodeGenError::DeadCode { index: 1, .. }), "{err}");
    }
}

#[test]
fn test_unreachable_block() {
    let text = "(method return=NoType args=[] (block (return)) (block name=orphan (return)))";
    let err = assemble_text(text, &Cpu::new(Isa::Aarch64), &CompileOptions::default()).unwrap_err();
    match err {
        CodeGenError::Unreachable { block } => assert_eq!(block, "orphan"),
        other => panic!("expected Unreachable, got {other}"),
    }
}

#[test]
fn test_falling_off_the_end() {
    let text = "(method return=NoType args=[Address] (block (istorei (aload parm=0) (iconst 1))))";
    let err = assemble_text(text, &Cpu::new(Isa::X86_64), &CompileOptions::default()).unwrap_err();
    assert!(matches!(err, CodeGenError::FallsOffEnd { .. }), "{err}");
}

#[test]
fn test_int32_vector_multiply_needs_sse41() {
    let _ = env_logger::builder().is_test(true).try_init();

    let plain = Cpu::new(Isa::X86_64);
    let err = assemble_text(&vmul_int32(), &plain, &CompileOptions::default()).unwrap_err();
    match err {
        CodeGenError::UnsupportedCapability { opcode, capability, .. } => {
            assert_eq!(opcode, "vmul");
            assert_eq!(capability, "sse4.1");
        }
        other => panic!("expected UnsupportedCapability, got {other}"),
    }

    let scalarize = CompileOptions::default().with_vector_fallback(VectorFallback::Scalarize);
    let code = assemble_text(&vmul_int32(), &plain, &scalarize).unwrap();
    assert_eq!(code.scalarized_ops, 1);

    let sse41 = Cpu::builder(Processor::X86Nehalem)
        .feature(X86Feature::Sse4_1)
        .build()
        .unwrap();
    let code = assemble_text(&vmul_int32(), &sse41, &CompileOptions::default()).unwrap();
    assert_eq!(code.scalarized_ops, 0);
}

#[test]
fn test_unavailable_vector_ops_name_the_operation() {
    let text = treejit::harness::vector_binary_ir(treejit::cpu::VectorOp::Mul, treejit::DataType::VectorInt64);
    for isa in [Isa::X86_64, Isa::Aarch64] {
        let err = assemble_text(&text, &Cpu::new(isa), &CompileOptions::default()).unwrap_err();
        match err {
            CodeGenError::UnsupportedCapability { capability, ty, .. } => {
                assert_eq!(ty, treejit::DataType::VectorInt64);
                assert!(capability.contains("vmul"), "{capability}");
            }
            other => panic!("expected UnsupportedCapability on {isa}, got {other}"),
        }
    }
}

#[test]
fn test_register_pressure() {
    let _ = env_logger::builder().is_test(true).try_init();

    // every right operand is evaluated one register deeper
    let depth = 20;
    let mut expr = String::from("(iconst 1)");
    for _ in 0..depth {
        expr = format!("(iadd (iconst 1) {expr})");
    }
    let text = format!("(method return=Int32 args=[] (block (ireturn {expr})))");
    for isa in [Isa::X86_64, Isa::Aarch64] {
        let err = assemble_text(&text, &Cpu::new(isa), &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CodeGenError::RegisterPressure { .. }), "{isa}: {err}");
    }

    // a left-leaning chain of the same size needs two registers
    let mut expr = String::from("(iconst 1)");
    for _ in 0..depth {
        expr = format!("(iadd {expr} (iconst 1))");
    }
    let text = format!("(method return=Int32 args=[] (block (ireturn {expr})))");
    for isa in [Isa::X86_64, Isa::Aarch64] {
        assemble_text(&text, &Cpu::new(isa), &CompileOptions::default()).unwrap();
    }
}

#[test]
fn test_too_many_parameters() {
    let text = "(method return=Int64 args=[Int64,Int64,Int64,Int64,Int64,Int64,Int64] \
                (block (lreturn (lload parm=6))))";
    // seven integer parameters overflow the six SysV registers but fit AAPCS64
    let err = assemble_text(text, &Cpu::new(Isa::X86_64), &CompileOptions::default()).unwrap_err();
    assert!(matches!(err, CodeGenError::Unsupported { .. }), "{err}");
    assemble_text(text, &Cpu::new(Isa::Aarch64), &CompileOptions::default()).unwrap();
}

#[test]
fn test_session_counts_failures_and_scalarized_ops() {
    let cpu = Cpu::new(Isa::X86_64);
    let mut session = CompilationSession::with_options(
        &cpu,
        CompileOptions::default().with_vector_fallback(VectorFallback::Scalarize),
    );
    let method = session.parse(&vmul_int32()).unwrap();
    session.assemble(&method, 0x1000).unwrap();
    let dead = session
        .parse("(method return=NoType args=[] (block (return) (return)))")
        .unwrap();
    assert!(session.assemble(&dead, 0x1000).is_err());

    let stats = session.stats();
    assert_eq!(stats.methods_compiled, 1);
    assert_eq!(stats.scalarized_ops, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.largest_method_name, "vector_mul");
}

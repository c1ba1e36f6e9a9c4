//! Vector kernel tests on the host.
//!
//! Every kernel has the shape `out = a op b` over one 128-bit vector and is
//! checked lane by lane against reference values. Integer lanes must match
//! exactly; floating point lanes are compared within the epsilon stated by
//! each case.

#![cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]

use treejit::codegen::{compile_with, CompileOptions, VectorFallback};
use treejit::core::{CodeGenError, Error, HarnessError};
use treejit::cpu::VectorOp;
use treejit::harness::{check_vector_binary, reference, run_vector_binary, vector_binary_ir, Lane, Tolerance};
use treejit::{parse, Cpu};

fn host() -> Cpu {
    Cpu::host().expect("host capability model")
}

fn scalarize() -> CompileOptions {
    CompileOptions::default().with_vector_fallback(VectorFallback::Scalarize)
}

/// Runs a kernel natively and checks it against the Rust reference.
fn check<T: Lane>(op: VectorOp, a: &[T], b: &[T], tolerance: Tolerance) -> Vec<T> {
    let expected = reference(op, a, b);
    check_vector_binary(&host(), &CompileOptions::default(), op, a, b, &expected, tolerance).unwrap()
}

#[test]
fn test_vadd_vector_double() {
    let _ = env_logger::builder().is_test(true).try_init();

    let observed = check_vector_binary(
        &host(),
        &CompileOptions::default(),
        VectorOp::Add,
        &[1.0f64, 2.0],
        &[1.0, 2.0],
        &[2.0, 4.0],
        Tolerance::Epsilon(f64::EPSILON),
    )
    .unwrap();
    assert_eq!(observed, vec![2.0, 4.0]);
}

#[test]
fn test_vadd_vector_int8() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a: Vec<i8> = (1..=16).collect();
    let expected: Vec<i8> = (1..=16).map(|x| 2 * x).collect();
    let observed = check_vector_binary(
        &host(),
        &CompileOptions::default(),
        VectorOp::Add,
        &a,
        &a,
        &expected,
        Tolerance::Exact,
    )
    .unwrap();
    assert_eq!(observed[15], 32);
}

#[test]
fn test_vadd_vector_int16() {
    let _ = env_logger::builder().is_test(true).try_init();

    check_vector_binary(
        &host(),
        &CompileOptions::default(),
        VectorOp::Add,
        &[20i16, 15, 14, 6, 5, 4, 3, 2],
        &[35, 20, 15, 7, 7, 4, 3, 5],
        &[55, 35, 29, 13, 12, 8, 6, 7],
        Tolerance::Exact,
    )
    .unwrap();
}

#[test]
fn test_vadd_vector_float() {
    let _ = env_logger::builder().is_test(true).try_init();

    check_vector_binary(
        &host(),
        &CompileOptions::default(),
        VectorOp::Add,
        &[1.0f32, 1.5, 1.4, 0.6],
        &[4.5, 2.0, 1.5, 0.7],
        &[5.5, 3.5, 2.9, 1.3],
        Tolerance::Epsilon(f32::EPSILON as f64 * 4.0),
    )
    .unwrap();
}

#[test]
fn test_integer_lanes_wrap() {
    let observed = check(VectorOp::Add, &[i8::MAX; 16], &[1; 16], Tolerance::Exact);
    assert!(observed.iter().all(|v| *v == i8::MIN));
    check(VectorOp::Sub, &[0i32, 5, -5, i32::MIN], &[1, 10, -10, 1], Tolerance::Exact);
    check(VectorOp::Add, &[i64::MAX, -1], &[1, 1], Tolerance::Exact);
    check(VectorOp::Mul, &[300i16, -2, 7, 0, 1, 2, 3, 4], &[300, 3, -7, 9, 1, 2, 3, 4], Tolerance::Exact);
}

#[test]
fn test_float_sub_mul_div() {
    let _ = env_logger::builder().is_test(true).try_init();

    let eps = Tolerance::Epsilon(1e-12);
    check(VectorOp::Sub, &[10.0f64, -0.5], &[0.25, 0.5], eps);
    check(VectorOp::Mul, &[1.5f64, -3.0], &[2.0, 0.125], eps);
    check(VectorOp::Div, &[1.0f64, 9.0], &[4.0, -3.0], eps);

    let eps = Tolerance::Epsilon(1e-6);
    check(VectorOp::Mul, &[1.5f32, 2.0, -1.0, 0.0], &[2.0, 0.5, 8.0, 3.0], eps);
    check(VectorOp::Div, &[1.0f32, 2.0, 3.0, 4.0], &[8.0, 4.0, 2.0, 1.0], eps);
}

#[test]
fn test_mismatch_is_reported_per_lane() {
    let err = check_vector_binary(
        &host(),
        &CompileOptions::default(),
        VectorOp::Add,
        &[1i16; 8],
        &[1; 8],
        &[2, 2, 2, 3, 2, 2, 2, 2],
        Tolerance::Exact,
    )
    .unwrap_err();
    match err {
        Error::Harness(HarnessError::Mismatch { lane, expected, observed }) => {
            assert_eq!(lane, 3);
            assert_eq!(expected, "3");
            assert_eq!(observed, "2");
        }
        other => panic!("expected lane mismatch, got {other}"),
    }
}

#[test]
fn test_wrong_lane_count_is_refused() {
    let method = parse(&vector_binary_ir(VectorOp::Add, <f64 as Lane>::VECTOR)).unwrap();
    let compiled = compile_with(&method, &host(), &CompileOptions::default()).unwrap();
    let err = run_vector_binary::<f64>(&compiled, &[1.0], &[1.0, 2.0]).unwrap_err();
    assert_eq!(err, HarnessError::LaneCount { expected: 2, found: 1 });
    assert_eq!(run_vector_binary(&compiled, &[0.5f64, 1.0], &[2.0, -1.0]).unwrap(), vec![2.5, 0.0]);
}

/// An integer multiply the host model has no single instruction for.
#[cfg(target_arch = "x86_64")]
fn unsupported_multiply() -> (Cpu, Vec<i32>, Vec<i32>) {
    // baseline x86-64 without SSE4.1
    let cpu = Cpu::new(treejit::cpu::Isa::X86_64);
    (cpu, vec![3, -4, 1 << 20, 7], vec![5, 6, 1 << 12, -7])
}

#[cfg(target_arch = "aarch64")]
fn unsupported_multiply() -> (Cpu, Vec<i64>, Vec<i64>) {
    (host(), vec![3, 1 << 40], vec![-5, 1 << 30])
}

#[test]
fn test_scalarized_multiply_matches_reference() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (cpu, a, b) = unsupported_multiply();
    let expected = reference(VectorOp::Mul, &a, &b);

    let err = check_vector_binary(&cpu, &CompileOptions::default(), VectorOp::Mul, &a, &b, &expected, Tolerance::Exact)
        .unwrap_err();
    assert!(
        matches!(err, Error::CodeGen(CodeGenError::UnsupportedCapability { .. })),
        "{err}"
    );

    let observed = check_vector_binary(&cpu, &scalarize(), VectorOp::Mul, &a, &b, &expected, Tolerance::Exact).unwrap();
    assert_eq!(observed, expected);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_scalarized_int8_multiply_wraps() {
    let a: Vec<i8> = (0..16i32).map(|i| (i * 9 - 60) as i8).collect();
    let b: Vec<i8> = (0..16i32).map(|i| (17 - i * 3) as i8).collect();
    let expected = reference(VectorOp::Mul, &a, &b);
    let observed = check_vector_binary(&host(), &scalarize(), VectorOp::Mul, &a, &b, &expected, Tolerance::Exact).unwrap();
    assert_eq!(observed.len(), 16);
}

#[test]
fn test_native_kernels_are_not_scalarized() {
    let cpu = host();
    let method = parse(&vector_binary_ir(VectorOp::Add, <i16 as Lane>::VECTOR)).unwrap();
    let compiled = compile_with(&method, &cpu, &scalarize()).unwrap();
    assert_eq!(compiled.machine_code().scalarized_ops, 0);
    assert_eq!(compiled.name(), "vector_add");
}

//! Capability model and branch reachability tests.
//!
//! These exercise the descriptor queries code generation relies on: branch
//! displacement limits at their inclusive edges, rotate directions, feature
//! bits and the per-element vector support table.

use treejit::core::CpuError;
use treejit::cpu::{
    is_target_reachable, select_form, Aarch64Feature, BranchForm, Cpu, FeatureBit, FeatureSet, Isa,
    LaneType, Processor, ProbeResult, VectorOp, VectorSupport, X86Feature,
};

#[test]
fn test_forward_reachability_is_inclusive() {
    let _ = env_logger::builder().is_test(true).try_init();

    for isa in [Isa::Aarch64, Isa::X86_64] {
        let cpu = Cpu::new(isa);
        let forward = cpu.max_unconditional_branch_immediate_forward_offset();
        let source = 0x1_0000_0000u64;
        assert!(cpu.is_target_reachable(source + forward, source), "{isa} at limit");
        assert!(!cpu.is_target_reachable(source + forward + 1, source), "{isa} past limit");
    }
}

#[test]
fn test_backward_reachability_is_inclusive() {
    let _ = env_logger::builder().is_test(true).try_init();

    for isa in [Isa::Aarch64, Isa::X86_64] {
        let cpu = Cpu::new(isa);
        let backward = cpu.max_unconditional_branch_immediate_backward_offset();
        let source = 0x1_0000_0000u64;
        assert!(cpu.is_target_reachable(source - backward, source), "{isa} at limit");
        assert!(!cpu.is_target_reachable(source - backward - 1, source), "{isa} past limit");
    }
}

#[test]
fn test_reachability_near_address_space_edges() {
    let limits = Isa::Aarch64.branch_limits();
    // a branch to itself is always encodable
    assert!(is_target_reachable(limits, u64::MAX, u64::MAX));
    assert!(is_target_reachable(limits, 0, 0));
    // the difference is taken without wrapping
    assert!(!is_target_reachable(limits, u64::MAX, 0));
    assert!(!is_target_reachable(limits, 0, u64::MAX));
    assert_eq!(select_form(limits, 0x1000, 0x2000), BranchForm::Direct);
    assert_eq!(select_form(limits, 0x4000_0000_0000, 0x2000), BranchForm::Indirect);
}

#[test]
fn test_limits_differ_per_isa() {
    let arm = Cpu::new(Isa::Aarch64);
    let x86 = Cpu::new(Isa::X86_64);
    assert_eq!(arm.max_unconditional_branch_immediate_forward_offset(), 0x07ff_fffc);
    assert_eq!(arm.max_unconditional_branch_immediate_backward_offset(), 0x0800_0000);
    assert_eq!(x86.max_unconditional_branch_immediate_forward_offset(), 0x8000_0004);
    assert_eq!(x86.max_unconditional_branch_immediate_backward_offset(), 0x7fff_fffb);

    // 1 GiB forward: too far for B, fine for JMP rel32
    assert!(!arm.is_target_reachable(0x4000_0000, 0));
    assert!(x86.is_target_reachable(0x4000_0000, 0));
}

#[test]
fn test_aarch64_rotates_right_only() {
    let cpu = Cpu::new(Isa::Aarch64);
    assert!(!cpu.supports_32bit_rotate(true));
    assert!(cpu.supports_32bit_rotate(false));
    assert!(!cpu.supports_64bit_rotate(true));
    assert!(cpu.supports_64bit_rotate(false));
}

#[test]
fn test_feature_bits_from_probe() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut features = FeatureSet::empty();
    features.insert(Aarch64Feature::Asimd.bit());
    features.insert(Aarch64Feature::Sve2.bit());
    let probe = ProbeResult {
        logical: Processor::Arm64V82A,
        physical: Processor::Arm64V85A,
        features,
    };
    let cpu = Cpu::from_probe(probe).unwrap();
    assert_eq!(cpu.processor_name(), "ARMv8.2-A");
    assert_eq!(cpu.physical_processor(), Processor::Arm64V85A);
    assert!(cpu.supports_feature(Aarch64Feature::Sve2));
    assert!(cpu.supports_feature_bit(Aarch64Feature::Asimd.bit()));
    assert!(!cpu.supports_feature(Aarch64Feature::Sve));
    assert!(!cpu.supports_feature(X86Feature::Sse2));
    assert_eq!(cpu.features().len(), 2);

    // bits past the fixed width cannot be named at all
    assert!(FeatureBit::new(127).is_some());
    assert!(FeatureBit::new(128).is_none());
}

#[test]
fn test_probe_of_mixed_families_is_rejected() {
    let probe = ProbeResult {
        logical: Processor::X86Skylake,
        physical: Processor::Arm64V8A,
        features: FeatureSet::empty(),
    };
    assert!(matches!(Cpu::from_probe(probe), Err(CpuError::ProcessorMismatch { .. })));
}

#[test]
fn test_host_descriptor_matches_host_isa() {
    let _ = env_logger::builder().is_test(true).try_init();

    match (Isa::host(), Cpu::host()) {
        (Some(isa), Some(cpu)) => {
            assert_eq!(cpu.isa(), isa);
            assert!(cpu.supports_hardware_sqrt());
            log::info!("host capability model:\n{cpu}");
        }
        (None, None) => {}
        (isa, cpu) => panic!("host ISA {isa:?} but descriptor {cpu:?}"),
    }
}

#[test]
fn test_vector_support_table() {
    let x86 = Cpu::new(Isa::X86_64);
    assert_eq!(x86.vector_width_bits(), 128);
    assert_eq!(x86.vector_op_support(VectorOp::Add, LaneType::I8), VectorSupport::Native);
    assert_eq!(x86.vector_op_support(VectorOp::Mul, LaneType::F64), VectorSupport::Native);
    assert_eq!(
        x86.vector_op_support(VectorOp::Mul, LaneType::I32),
        VectorSupport::RequiresFeature(X86Feature::Sse4_1.into())
    );
    assert_eq!(x86.vector_op_support(VectorOp::Mul, LaneType::I8), VectorSupport::Unavailable);
    assert_eq!(x86.vector_op_support(VectorOp::Div, LaneType::I16), VectorSupport::Unavailable);

    let arm = Cpu::new(Isa::Aarch64);
    for lane in [LaneType::I8, LaneType::I16, LaneType::I32, LaneType::I64, LaneType::F32, LaneType::F64] {
        assert!(arm.supports_vector_op(VectorOp::Add, lane));
        assert!(arm.supports_vector_op(VectorOp::Sub, lane));
        assert!(x86.supports_vector_op(VectorOp::Add, lane));
    }
    assert!(arm.supports_vector_op(VectorOp::Div, LaneType::F32));
    assert!(!arm.supports_vector_op(VectorOp::Mul, LaneType::I64));
}

// This module is the CPU capability model. A Cpu describes one concrete variant of a target
// instruction set: the logical processor code generation should target, the physical processor
// actually present (which may differ when a newer part is run in compatibility mode), and the
// bitset of hardware features reported by a probe. Descriptors are built once through
// CpuBuilder (or defaulted) and are immutable afterwards, so they can be shared by reference
// across compilation threads. Every question instruction selection asks about the target goes
// through this interface: hardware square root, rotate directions, feature bits, vector width
// and per-element vector operation support, and the displacement limits of direct branches.

//! CPU capability model.
//!
//! # Example
//!
//! ```
//! use treejit::cpu::{Cpu, Isa, Processor};
//!
//! let cpu = Cpu::new(Isa::Aarch64);
//! assert_eq!(cpu.logical_processor(), Processor::Arm64V8A);
//! assert!(!cpu.supports_32bit_rotate(true));
//! assert!(cpu.supports_32bit_rotate(false));
//! ```

pub mod branch;
pub mod features;
pub mod probe;

pub use branch::{is_target_reachable, select_form, BranchForm, BranchLimits};
pub use features::{Aarch64Feature, Feature, FeatureBit, FeatureSet, X86Feature};
pub use probe::{probe_host, ProbeResult};

use crate::core::error::CpuError;
use std::fmt;

/// Instruction set family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    Aarch64,
    X86_64,
}

impl Isa {
    /// ISA of the running process, if it is one the model covers.
    pub const fn host() -> Option<Isa> {
        if cfg!(target_arch = "x86_64") {
            Some(Isa::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Isa::Aarch64)
        } else {
            None
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Isa::Aarch64 => "aarch64",
            Isa::X86_64 => "x86-64",
        }
    }

    pub const fn branch_limits(self) -> BranchLimits {
        match self {
            Isa::Aarch64 => branch::AARCH64_LIMITS,
            Isa::X86_64 => branch::X86_64_LIMITS,
        }
    }

    /// Conservative processor used when nothing was probed.
    pub const fn baseline_processor(self) -> Processor {
        match self {
            Isa::Aarch64 => Processor::Arm64V8A,
            Isa::X86_64 => Processor::X86Generic,
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Processor generations known to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Processor {
    Arm64V8A,
    Arm64V81A,
    Arm64V82A,
    Arm64V83A,
    Arm64V84A,
    Arm64V85A,
    X86Generic,
    X86Nehalem,
    X86SandyBridge,
    X86Haswell,
    X86Skylake,
    X86IceLake,
}

impl Processor {
    pub const fn isa(self) -> Isa {
        match self {
            Processor::Arm64V8A
            | Processor::Arm64V81A
            | Processor::Arm64V82A
            | Processor::Arm64V83A
            | Processor::Arm64V84A
            | Processor::Arm64V85A => Isa::Aarch64,
            _ => Isa::X86_64,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Processor::Arm64V8A => "ARMv8-A",
            Processor::Arm64V81A => "ARMv8.1-A",
            Processor::Arm64V82A => "ARMv8.2-A",
            Processor::Arm64V83A => "ARMv8.3-A",
            Processor::Arm64V84A => "ARMv8.4-A",
            Processor::Arm64V85A => "ARMv8.5-A",
            Processor::X86Generic => "x86-64",
            Processor::X86Nehalem => "Nehalem",
            Processor::X86SandyBridge => "Sandy Bridge",
            Processor::X86Haswell => "Haswell",
            Processor::X86Skylake => "Skylake",
            Processor::X86IceLake => "Ice Lake",
        }
    }
}

/// Element type of a 128-bit vector lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl LaneType {
    pub const fn bytes(self) -> u32 {
        match self {
            LaneType::I8 => 1,
            LaneType::I16 => 2,
            LaneType::I32 | LaneType::F32 => 4,
            LaneType::I64 | LaneType::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, LaneType::F32 | LaneType::F64)
    }
}

/// Vector arithmetic the capability table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl VectorOp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            VectorOp::Add => "vadd",
            VectorOp::Sub => "vsub",
            VectorOp::Mul => "vmul",
            VectorOp::Div => "vdiv",
        }
    }
}

/// Answer of [`Cpu::vector_op_support`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorSupport {
    /// Part of the ISA baseline.
    Native,
    /// Encodable only when the feature is present.
    RequiresFeature(Feature),
    /// No single instruction exists.
    Unavailable,
}

/// Immutable capability descriptor of one ISA variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpu {
    isa: Isa,
    logical: Processor,
    physical: Processor,
    features: FeatureSet,
}

impl Cpu {
    /// Baseline descriptor: physical equals logical, no feature bits.
    pub const fn new(isa: Isa) -> Self {
        let p = isa.baseline_processor();
        Cpu {
            isa,
            logical: p,
            physical: p,
            features: FeatureSet::empty(),
        }
    }

    pub fn builder(logical: Processor) -> CpuBuilder {
        CpuBuilder::new(logical)
    }

    pub fn from_probe(probe: ProbeResult) -> Result<Self, CpuError> {
        Cpu::builder(probe.logical)
            .physical(probe.physical)
            .feature_words(probe.features)
            .build()
    }

    /// Descriptor of the running machine, if its ISA is modeled.
    pub fn host() -> Option<Self> {
        probe_host().and_then(|p| Cpu::from_probe(p).ok())
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn logical_processor(&self) -> Processor {
        self.logical
    }

    pub fn physical_processor(&self) -> Processor {
        self.physical
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn processor_name(&self) -> &'static str {
        self.logical.name()
    }

    pub fn supports_hardware_sqrt(&self) -> bool {
        match self.isa {
            Isa::Aarch64 | Isa::X86_64 => true,
        }
    }

    /// A feature named for another ISA is never supported.
    pub fn supports_feature(&self, feature: impl Into<Feature>) -> bool {
        let feature = feature.into();
        feature.isa() == self.isa && self.features.contains(feature.bit())
    }

    pub fn supports_feature_bit(&self, bit: FeatureBit) -> bool {
        self.features.contains(bit)
    }

    pub fn supports_32bit_rotate(&self, require_left: bool) -> bool {
        self.supports_rotate(require_left)
    }

    pub fn supports_64bit_rotate(&self, require_left: bool) -> bool {
        self.supports_rotate(require_left)
    }

    fn supports_rotate(&self, require_left: bool) -> bool {
        match self.isa {
            // RORV only
            Isa::Aarch64 => !require_left,
            Isa::X86_64 => true,
        }
    }

    pub fn max_unconditional_branch_immediate_forward_offset(&self) -> u64 {
        self.isa.branch_limits().forward
    }

    pub fn max_unconditional_branch_immediate_backward_offset(&self) -> u64 {
        self.isa.branch_limits().backward
    }

    pub fn branch_limits(&self) -> BranchLimits {
        self.isa.branch_limits()
    }

    pub fn is_target_reachable(&self, target: u64, source: u64) -> bool {
        is_target_reachable(self.branch_limits(), target, source)
    }

    pub fn vector_width_bits(&self) -> u32 {
        match self.isa {
            Isa::Aarch64 | Isa::X86_64 => 128,
        }
    }

    pub fn vector_op_support(&self, op: VectorOp, lane: LaneType) -> VectorSupport {
        use LaneType::*;
        use VectorOp::*;
        match (self.isa, op, lane) {
            (_, Add | Sub, _) => VectorSupport::Native,
            (_, Div, F32 | F64) => VectorSupport::Native,
            (_, Div, _) => VectorSupport::Unavailable,
            (_, Mul, F32 | F64) => VectorSupport::Native,
            (Isa::Aarch64, Mul, I8 | I16 | I32) => VectorSupport::Native,
            (Isa::Aarch64, Mul, I64) => VectorSupport::Unavailable,
            (Isa::X86_64, Mul, I16) => VectorSupport::Native,
            (Isa::X86_64, Mul, I32) => VectorSupport::RequiresFeature(X86Feature::Sse4_1.into()),
            (Isa::X86_64, Mul, I8 | I64) => VectorSupport::Unavailable,
        }
    }

    pub fn supports_vector_op(&self, op: VectorOp, lane: LaneType) -> bool {
        match self.vector_op_support(op, lane) {
            VectorSupport::Native => true,
            VectorSupport::RequiresFeature(f) => self.supports_feature(f),
            VectorSupport::Unavailable => false,
        }
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "isa:        {}", self.isa)?;
        writeln!(f, "logical:    {}", self.logical.name())?;
        writeln!(f, "physical:   {}", self.physical.name())?;
        writeln!(f, "vector:     {} bits", self.vector_width_bits())?;
        let limits = self.branch_limits();
        writeln!(
            f,
            "branch:     +{:#x} / -{:#x}",
            limits.forward, limits.backward
        )?;
        write!(f, "features:  ")?;
        for bit in self.features.iter() {
            match feature_name(self.isa, bit) {
                Some(name) => write!(f, " {name}")?,
                None => write!(f, " bit{}", bit.index())?,
            }
        }
        Ok(())
    }
}

fn feature_name(isa: Isa, bit: FeatureBit) -> Option<&'static str> {
    match isa {
        Isa::Aarch64 => Aarch64Feature::ALL
            .iter()
            .find(|f| f.bit() == bit)
            .map(|f| f.name()),
        Isa::X86_64 => X86Feature::ALL
            .iter()
            .find(|f| f.bit() == bit)
            .map(|f| f.name()),
    }
}

/// Mutable first phase of descriptor construction.
#[derive(Debug, Clone)]
pub struct CpuBuilder {
    logical: Processor,
    physical: Option<Processor>,
    features: FeatureSet,
}

impl CpuBuilder {
    pub fn new(logical: Processor) -> Self {
        CpuBuilder {
            logical,
            physical: None,
            features: FeatureSet::empty(),
        }
    }

    pub fn physical(mut self, physical: Processor) -> Self {
        self.physical = Some(physical);
        self
    }

    pub fn feature(mut self, feature: impl Into<Feature>) -> Self {
        self.features.insert(feature.into().bit());
        self
    }

    pub fn feature_bit(mut self, bit: FeatureBit) -> Self {
        self.features.insert(bit);
        self
    }

    /// Replaces all feature bits with a probed set.
    pub fn feature_words(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn build(self) -> Result<Cpu, CpuError> {
        let isa = self.logical.isa();
        let physical = self.physical.unwrap_or(self.logical);
        if physical.isa() != isa {
            return Err(CpuError::ProcessorMismatch {
                isa: isa.name(),
                logical: self.logical.name(),
                physical: physical.name(),
            });
        }
        Ok(Cpu {
            isa,
            logical: self.logical,
            physical,
            features: self.features,
        })
    }
}

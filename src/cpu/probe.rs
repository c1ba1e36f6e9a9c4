//! Host capability probe.
//!
//! Turns the standard library's runtime feature detection into the raw
//! `(logical, physical, features)` triple the capability builder consumes.

use super::{FeatureSet, Processor};
#[allow(unused_imports)]
use super::{Aarch64Feature, X86Feature};

/// Raw result of a capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub logical: Processor,
    pub physical: Processor,
    pub features: FeatureSet,
}

/// Probes the running machine. `None` on ISAs the model does not cover.
#[cfg(target_arch = "x86_64")]
pub fn probe_host() -> Option<ProbeResult> {
    Some(probe_x86_64())
}

#[cfg(target_arch = "aarch64")]
pub fn probe_host() -> Option<ProbeResult> {
    Some(probe_aarch64())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn probe_host() -> Option<ProbeResult> {
    None
}

#[cfg(target_arch = "x86_64")]
fn probe_x86_64() -> ProbeResult {
    let mut features = FeatureSet::empty();
    macro_rules! detect {
        ($($name:tt => $feature:ident),* $(,)?) => {
            $(
                if std::arch::is_x86_feature_detected!($name) {
                    features.insert(X86Feature::$feature.bit());
                }
            )*
        };
    }
    detect! {
        "sse" => Sse,
        "sse2" => Sse2,
        "sse3" => Sse3,
        "ssse3" => Ssse3,
        "sse4.1" => Sse4_1,
        "sse4.2" => Sse4_2,
        "popcnt" => Popcnt,
        "avx" => Avx,
        "avx2" => Avx2,
        "fma" => Fma,
        "bmi1" => Bmi1,
        "bmi2" => Bmi2,
        "lzcnt" => Lzcnt,
        "aes" => Aes,
        "pclmulqdq" => Pclmulqdq,
        "avx512f" => Avx512f,
    }

    let has = |f: X86Feature| features.contains(f.bit());
    let processor = if has(X86Feature::Avx512f) {
        Processor::X86IceLake
    } else if has(X86Feature::Avx2) && has(X86Feature::Bmi2) {
        Processor::X86Haswell
    } else if has(X86Feature::Avx) {
        Processor::X86SandyBridge
    } else if has(X86Feature::Sse4_2) {
        Processor::X86Nehalem
    } else {
        Processor::X86Generic
    };
    log::debug!("probed x86-64 host: {} {:?}", processor.name(), features);

    ProbeResult {
        logical: processor,
        physical: processor,
        features,
    }
}

#[cfg(target_arch = "aarch64")]
fn probe_aarch64() -> ProbeResult {
    let mut features = FeatureSet::empty();
    macro_rules! detect {
        ($($name:tt => $($feature:ident)|+),* $(,)?) => {
            $(
                if std::arch::is_aarch64_feature_detected!($name) {
                    $(features.insert(Aarch64Feature::$feature.bit());)+
                }
            )*
        };
    }
    detect! {
        "fp" => Fp,
        "asimd" => Asimd,
        "aes" => Aes,
        "pmull" => Pmull,
        "sha2" => Sha1 | Sha256,
        "sha3" => Sha3 | Sha512,
        "crc" => Crc32,
        "lse" => Atomics,
        "fp16" => Fphp | Asimdhp,
        "rdm" => Asimdrdm,
        "jsconv" => Jscvt,
        "fcma" => Fcma,
        "rcpc" => Lrcpc,
        "dpb" => Dcpop,
        "sm4" => Sm3 | Sm4,
        "dotprod" => Asimddp,
        "sve" => Sve,
        "fhm" => Asimdfhm,
        "dit" => Dit,
        "flagm" => Flagm,
        "ssbs" => Ssbs,
        "sb" => Sb,
        "paca" => Paca,
        "pacg" => Pacg,
        "sve2" => Sve2,
        "i8mm" => I8mm,
        "bf16" => Bf16,
    }

    let has = |f: Aarch64Feature| features.contains(f.bit());
    let processor = if has(Aarch64Feature::Sb) || has(Aarch64Feature::Ssbs) {
        Processor::Arm64V85A
    } else if has(Aarch64Feature::Dit) || has(Aarch64Feature::Flagm) {
        Processor::Arm64V84A
    } else if has(Aarch64Feature::Jscvt) || has(Aarch64Feature::Paca) {
        Processor::Arm64V83A
    } else if has(Aarch64Feature::Asimddp) || has(Aarch64Feature::Dcpop) {
        Processor::Arm64V82A
    } else if has(Aarch64Feature::Atomics) {
        Processor::Arm64V81A
    } else {
        Processor::Arm64V8A
    };
    log::debug!("probed aarch64 host: {} {:?}", processor.name(), features);

    ProbeResult {
        logical: processor,
        physical: processor,
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cpu, Isa};

    #[test]
    fn host_probe_matches_host_isa() {
        match (probe_host(), Isa::host()) {
            (Some(probe), Some(isa)) => {
                assert_eq!(probe.logical.isa(), isa);
                let cpu = Cpu::from_probe(probe).unwrap();
                assert_eq!(cpu.isa(), isa);
            }
            (None, None) => {}
            other => panic!("probe and host ISA disagree: {other:?}"),
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_hosts_have_sse2() {
        let probe = probe_host().unwrap();
        assert!(probe.features.contains(X86Feature::Sse2.bit()));
    }
}

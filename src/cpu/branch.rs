//! Branch reachability.
//!
//! Decides whether a target address can be encoded in a single relative
//! unconditional branch (or call) placed at a source address. Displacements are
//! measured from the branch instruction's own address; both bounds are
//! inclusive.

/// Largest displacements, in bytes, a direct unconditional branch can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchLimits {
    pub forward: u64,
    /// Magnitude of the most negative displacement.
    pub backward: u64,
}

/// `B`/`BL`: signed imm26 scaled by 4.
pub const AARCH64_LIMITS: BranchLimits = BranchLimits {
    forward: 0x07ff_fffc,
    backward: 0x0800_0000,
};

/// `JMP rel32`/`CALL rel32`: the displacement is relative to the end of the
/// five byte instruction.
pub const X86_64_LIMITS: BranchLimits = BranchLimits {
    forward: 0x8000_0004,
    backward: 0x7fff_fffb,
};

/// How a branch or call is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchForm {
    /// Single relative instruction.
    Direct,
    /// Absolute address materialized in a scratch register.
    Indirect,
}

pub fn is_target_reachable(limits: BranchLimits, target: u64, source: u64) -> bool {
    let delta = target as i128 - source as i128;
    if delta >= 0 {
        delta <= limits.forward as i128
    } else {
        -delta <= limits.backward as i128
    }
}

pub fn select_form(limits: BranchLimits, target: u64, source: u64) -> BranchForm {
    if is_target_reachable(limits, target, source) {
        BranchForm::Direct
    } else {
        BranchForm::Indirect
    }
}

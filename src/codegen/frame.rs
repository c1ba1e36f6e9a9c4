//! Frame layout.
//!
//! All slots are addressed upward from the stack pointer after the prologue:
//!
//! ```text
//! [ params: 8 bytes each ][ spills: 16 bytes each ][ call staging ][ lane scratch ]
//! ```
//!
//! Spill slots hold temporaries that are live across a call. Staging slots hold
//! evaluated call arguments, one row per call nesting level, so an argument
//! that is itself a call does not clobber the outer call's earlier arguments.

use crate::tree::{Method, Node, Opcode, VECTOR_BYTES};

const SLOT: u32 = 8;
const SPILL_SLOT: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    spill_base: u32,
    staging_base: u32,
    staging_row: u32,
    scratch_base: u32,
    pub size: u32,
}

impl FrameLayout {
    pub fn plan(method: &Method, spill_slots: usize) -> Self {
        let (max_args, levels) = method
            .trees()
            .map(call_shape)
            .fold((0, 0), |(a, l), (a2, l2)| (a.max(a2), l.max(l2)));
        let has_vectors = method.trees().any(has_vector);

        let spill_base = align16(method.params.len() as u32 * SLOT);
        let spills = if levels > 0 { spill_slots as u32 * SPILL_SLOT } else { 0 };
        let staging_base = spill_base + spills;
        let staging_row = max_args as u32 * SLOT;
        let scratch_base = align16(staging_base + staging_row * levels as u32);
        let scratch = if has_vectors { 2 * VECTOR_BYTES } else { 0 };
        FrameLayout {
            spill_base,
            staging_base,
            staging_row,
            scratch_base,
            size: align16(scratch_base + scratch),
        }
    }

    pub fn param(&self, index: usize) -> i32 {
        (index as u32 * SLOT) as i32
    }

    pub fn spill(&self, index: usize) -> i32 {
        (self.spill_base + index as u32 * SPILL_SLOT) as i32
    }

    pub fn staging(&self, level: usize, arg: usize) -> i32 {
        (self.staging_base + level as u32 * self.staging_row + arg as u32 * SLOT) as i32
    }

    /// One of two 16-byte lane buffers.
    pub fn scratch(&self, index: usize) -> i32 {
        (self.scratch_base + index as u32 * VECTOR_BYTES) as i32
    }
}

fn align16(v: u32) -> u32 {
    (v + 15) & !15
}

/// Widest argument list and deepest call nesting in a tree.
fn call_shape(node: &Node) -> (usize, usize) {
    let (args, depth) = node
        .children
        .iter()
        .map(call_shape)
        .fold((0, 0), |(a, d), (a2, d2)| (a.max(a2), d.max(d2)));
    if node.opcode == Opcode::Call {
        (args.max(node.children.len()), depth + 1)
    } else {
        (args, depth)
    }
}

fn has_vector(node: &Node) -> bool {
    node.ty.is_vector() || node.children.iter().any(has_vector)
}

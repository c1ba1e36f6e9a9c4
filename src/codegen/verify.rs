//! Control-flow verification.
//!
//! Runs before lowering. Rejects trees placed after a block's terminator,
//! blocks that cannot be reached from the entry block, and a final block that
//! lets control run past the end of the method.

use crate::core::error::{CodeGenError, CodeGenResult};
use crate::tree::{Immediate, Method, Opcode};

pub fn verify(method: &Method) -> CodeGenResult<()> {
    let count = method.blocks.len();
    let mut successors: Vec<Vec<usize>> = Vec::with_capacity(count);

    for (index, block) in method.blocks.iter().enumerate() {
        let mut edges = Vec::new();
        let mut terminated = false;
        for (position, tree) in block.trees.iter().enumerate() {
            if terminated {
                return Err(CodeGenError::DeadCode {
                    block: block.label(index),
                    index: position,
                });
            }
            match (tree.opcode, tree.imm) {
                (Opcode::Goto, Immediate::Target(t)) => {
                    edges.push(t);
                    terminated = true;
                }
                (Opcode::IfCmp(_), Immediate::Target(t)) => edges.push(t),
                (Opcode::Return, _) => terminated = true,
                _ => {}
            }
        }
        if !terminated {
            if index + 1 == count {
                return Err(CodeGenError::FallsOffEnd {
                    block: block.label(index),
                });
            }
            edges.push(index + 1);
        }
        successors.push(edges);
    }

    let mut reached = vec![false; count];
    let mut work = vec![0usize];
    while let Some(b) = work.pop() {
        if std::mem::replace(&mut reached[b], true) {
            continue;
        }
        work.extend(successors[b].iter().copied().filter(|s| !reached[*s]));
    }
    if let Some(dead) = reached.iter().position(|r| !r) {
        return Err(CodeGenError::Unreachable {
            block: method.blocks[dead].label(dead),
        });
    }
    Ok(())
}

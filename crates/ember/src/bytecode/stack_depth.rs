//! Static operand-stack depth analysis.
//!
//! Walks every reachable path through an instruction stream, applying each opcode's stack
//! effect, and reports the deepest point reached. Paths that meet at the same instruction
//! must agree on the depth there, so a frame's arena can be sized once up front.

use super::code::{CodeError, Instruction, decode};

/// Maximum operand-stack depth of a raw bytecode stream.
pub fn max_stack_depth(bytecode: &[u8]) -> Result<u32, CodeError> {
    max_depth(&decode(bytecode)?)
}

pub(crate) fn max_depth(instructions: &[Instruction]) -> Result<u32, CodeError> {
    let Some(last) = instructions.last() else {
        return Ok(0);
    };
    let len = last.next();
    // instruction index by the offset of its first unit
    let mut index_at = vec![None; len / 2];
    for (index, ins) in instructions.iter().enumerate() {
        index_at[ins.start / 2] = Some(index);
    }
    let lookup = |from: &Instruction, target: usize| {
        index_at
            .get(target / 2)
            .copied()
            .flatten()
            .filter(|_| target % 2 == 0)
            .ok_or(CodeError::JumpOutOfRange {
                offset: from.offset,
                target,
            })
    };

    let mut depths: Vec<Option<i32>> = vec![None; instructions.len()];
    let mut worklist = vec![(0usize, 0i32)];
    let mut max = 0;
    while let Some((index, depth)) = worklist.pop() {
        let ins = &instructions[index];
        match depths[index] {
            Some(seen) if seen == depth => continue,
            Some(seen) => {
                return Err(CodeError::InconsistentStackDepth {
                    offset: ins.start,
                    expected: seen,
                    found: depth,
                });
            }
            None => depths[index] = Some(depth),
        }

        let mut follow = |target_index: usize, after: i32| {
            if after < 0 {
                return Err(CodeError::StackUnderflow { offset: ins.offset });
            }
            max = max.max(after);
            worklist.push((target_index, after));
            Ok(())
        };
        if let Some(target) = ins.jump_target() {
            follow(lookup(ins, target)?, depth + ins.opcode.stack_effect(ins.arg, true))?;
        }
        if !ins.opcode.is_terminal() {
            if index + 1 >= instructions.len() {
                return Err(CodeError::JumpOutOfRange {
                    offset: ins.offset,
                    target: len,
                });
            }
            follow(index + 1, depth + ins.opcode.stack_effect(ins.arg, false))?;
        }
    }
    Ok(u32::try_from(max).unwrap_or(u32::MAX))
}

//! Bytecode representation and the virtual machine that executes it.
//!
//! # Module Structure
//!
//! - `op` - Opcode enum definitions
//! - `code` - Code object containing bytecode and metadata
//! - `builder` - CodeBuilder for assembling code objects
//! - `stack_depth` - Static operand-stack depth analysis
//! - `vm` - Frames, the block stack and the dispatch loop

pub use builder::{CodeBuilder, DerefSlot, Label};
pub use code::{Code, CodeError, CodeFlags, CodeParts, Constant, Instruction, Location};
pub use op::{CompareOp, InvalidOpcodeError, MakeFunctionFlags, Opcode};
pub use stack_depth::max_stack_depth;
pub use vm::{Block, BlockKind, Frame, FrameExit, GenStep, Unroll, VM};

mod builder;
mod code;
mod op;
mod stack_depth;
mod vm;

#![doc = include_str!("../../../README.md")]

mod args;
mod builtins;
mod bytecode;
mod cell;
mod exception;
mod function;
mod host;
mod io;
mod namespace;
mod resource;
mod signature;
pub mod tracer;
mod types;
mod value;

pub use crate::{
    args::ArgValues,
    builtins::{Builtins, builtins_namespace},
    bytecode::{
        Block, BlockKind, Code, CodeBuilder, CodeError, CodeFlags, CodeParts, CompareOp, Constant, DerefSlot,
        Frame, FrameExit, GenStep, Instruction, InvalidOpcodeError, Label, Location, MakeFunctionFlags, Opcode,
        Unroll, VM, max_stack_depth,
    },
    cell::{CellFamily, CellRef},
    exception::{ExcType, Exception, RunResult, TracebackEntry},
    function::Function,
    host::{HostObject, host_value},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    namespace::Namespace,
    resource::{
        Allocation, DEFAULT_MAX_RECURSION_DEPTH, InterruptHandle, LimitedTracker, NoLimitTracker, ResourceError,
        ResourceLimits, ResourceTracker,
    },
    types::{GeneratorKind, GeneratorMethod, GeneratorRef, GeneratorState, Range, SeqIter},
    value::{DictMap, Value},
};

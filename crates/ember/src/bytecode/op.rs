//! Opcode definitions for the bytecode VM.
//!
//! Every instruction is a two-byte unit `[opcode, arg]`. Opcodes below
//! [`Opcode::LoadConst`] ignore their argument byte. Operands wider than a byte are built
//! from `ExtendedArg` prefixes: each prefix shifts the accumulated value left by eight
//! bits before the next unit's byte is or-ed in.
//!
//! Jump operands are absolute byte offsets into the bytecode, except `JumpForward`,
//! which is a delta from the following instruction.

use strum::{Display, FromRepr};

/// Opcode discriminant.
///
/// With `#[repr(u8)]` each opcode is exactly one byte; `strum::FromRepr` decodes it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display)]
pub enum Opcode {
    // === Stack manipulation ===
    Nop,
    /// Discard TOS.
    PopTop,
    /// `[a, b] -> [b, a]`.
    RotTwo,
    /// `[a, b, c] -> [c, a, b]`.
    RotThree,
    DupTop,
    /// `[a, b] -> [a, b, a, b]`.
    DupTopTwo,

    // === Operators ===
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryInvert,
    BinaryPower,
    BinaryMultiply,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinarySubscr,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,
    /// `TOS1[TOS] = TOS2`.
    StoreSubscr,

    // === Iteration and generators ===
    GetIter,
    /// Like `GetIter`, but passes generators through so `yield from` can delegate to them.
    GetYieldFromIter,
    /// Replaces TOS with the iterator an `await` delegates to.
    GetAwaitable,
    ReturnValue,
    /// Suspends the frame, handing TOS to whoever resumed it.
    YieldValue,
    /// Delegates to the iterator at TOS1, sending TOS into it.
    YieldFrom,

    // === Blocks ===
    PopBlock,
    /// Leaves an except handler body, restoring the previously handled exception.
    PopExcept,
    /// Pushes the "fell through normally" payload before a finally body.
    BeginFinally,
    /// Ends a finally body: resumes whatever unroll the payload on TOS describes.
    EndFinally,
    BreakLoop,
    /// Calls `__aenter__` on TOS, leaving `[exit_handle, awaitable]`.
    BeforeAsyncWith,
    /// `[payload, exit_result] -> [payload']`; a truthy result swallows an exception.
    WithCleanupFinish,

    // === Opcodes with an operand ===
    /// Push `constants[arg]`.
    LoadConst,
    LoadFast,
    StoreFast,
    DeleteFast,
    /// Push the contents of cell/free slot `arg`.
    LoadDeref,
    StoreDeref,
    DeleteDeref,
    /// Push the cell object itself, for building a closure tuple.
    LoadClosure,
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,
    LoadName,
    StoreName,
    DeleteName,
    LoadAttr,
    /// `TOS.name = TOS1`.
    StoreAttr,
    /// Operand is a [`CompareOp`] discriminant.
    CompareOp,
    BuildTuple,
    BuildList,
    /// Builds a dict from `arg` key/value pairs, keys below values.
    BuildMap,
    UnpackSequence,
    CallFunction,
    /// Like `CallFunction`, with a tuple of keyword names on top of the arguments.
    CallFunctionKw,
    /// Operand is a bitmask of [`MakeFunctionFlags`] describing what sits below the code object.
    MakeFunction,
    RaiseVarargs,
    /// Relative jump: `arg` bytes past the next instruction.
    JumpForward,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    /// Advances the iterator at TOS, jumping to `arg` and popping it once exhausted.
    ForIter,
    SetupLoop,
    ContinueLoop,
    /// Pops the exception type the handler accepts (`None` for a bare `except:`).
    SetupExcept,
    SetupFinally,
    SetupWith,
    SetupAsyncWith,
    /// `[exit_handle, payload] -> [payload, exit_result]`; `arg` is 1 for `async with`.
    WithCleanupStart,
    ExtendedArg,
}

/// Flags for [`Opcode::MakeFunction`].
pub struct MakeFunctionFlags;

impl MakeFunctionFlags {
    pub const DEFAULTS: u32 = 0x01;
    pub const KW_DEFAULTS: u32 = 0x02;
    pub const CLOSURE: u32 = 0x08;
    pub const ALL: u32 = Self::DEFAULTS | Self::KW_DEFAULTS | Self::CLOSURE;
}

/// What table, if any, an opcode's operand indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperandKind {
    None,
    Const,
    Local,
    Name,
    Deref,
    /// Absolute jump target.
    Jump,
    /// Jump target relative to the next instruction.
    RelativeJump,
    Compare,
    Count,
    Raise,
    FunctionFlags,
    AsyncFlag,
    Extended,
}

impl Opcode {
    #[must_use]
    pub fn has_arg(self) -> bool {
        self as u8 >= Self::LoadConst as u8
    }

    pub(crate) fn operand_kind(self) -> OperandKind {
        match self {
            Self::LoadConst => OperandKind::Const,
            Self::LoadFast | Self::StoreFast | Self::DeleteFast => OperandKind::Local,
            Self::LoadGlobal
            | Self::StoreGlobal
            | Self::DeleteGlobal
            | Self::LoadName
            | Self::StoreName
            | Self::DeleteName
            | Self::LoadAttr
            | Self::StoreAttr => OperandKind::Name,
            Self::LoadDeref | Self::StoreDeref | Self::DeleteDeref | Self::LoadClosure => OperandKind::Deref,
            Self::JumpAbsolute
            | Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::ForIter
            | Self::SetupLoop
            | Self::ContinueLoop
            | Self::SetupExcept
            | Self::SetupFinally
            | Self::SetupWith
            | Self::SetupAsyncWith => OperandKind::Jump,
            Self::JumpForward => OperandKind::RelativeJump,
            Self::CompareOp => OperandKind::Compare,
            Self::BuildTuple
            | Self::BuildList
            | Self::BuildMap
            | Self::UnpackSequence
            | Self::CallFunction
            | Self::CallFunctionKw => OperandKind::Count,
            Self::RaiseVarargs => OperandKind::Raise,
            Self::MakeFunction => OperandKind::FunctionFlags,
            Self::WithCleanupStart => OperandKind::AsyncFlag,
            Self::ExtendedArg => OperandKind::Extended,
            _ => OperandKind::None,
        }
    }

    /// Whether execution never continues with the following instruction.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::JumpForward
                | Self::JumpAbsolute
                | Self::ContinueLoop
                | Self::BreakLoop
                | Self::ReturnValue
                | Self::RaiseVarargs
        )
    }

    /// Net change in operand-stack depth.
    ///
    /// `jump` selects the effect along the branch to the operand's target for opcodes that
    /// have one. For block setups that branch is the handler entry, where the saved level
    /// is restored and the unroll payload (or caught exception) has been pushed.
    #[must_use]
    pub fn stack_effect(self, arg: u32, jump: bool) -> i32 {
        let n = i32::try_from(arg).unwrap_or(i32::MAX);
        match self {
            Self::Nop | Self::RotTwo | Self::RotThree | Self::ExtendedArg => 0,
            Self::PopTop => -1,
            Self::DupTop => 1,
            Self::DupTopTwo => 2,
            Self::UnaryPositive | Self::UnaryNegative | Self::UnaryNot | Self::UnaryInvert => 0,
            Self::BinaryPower
            | Self::BinaryMultiply
            | Self::BinaryTrueDivide
            | Self::BinaryFloorDivide
            | Self::BinaryModulo
            | Self::BinaryAdd
            | Self::BinarySubtract
            | Self::BinarySubscr
            | Self::BinaryLshift
            | Self::BinaryRshift
            | Self::BinaryAnd
            | Self::BinaryXor
            | Self::BinaryOr
            | Self::CompareOp => -1,
            Self::StoreSubscr => -3,
            Self::GetIter | Self::GetYieldFromIter | Self::GetAwaitable => 0,
            Self::ReturnValue => -1,
            Self::YieldValue => 0,
            Self::YieldFrom => -1,
            Self::PopBlock | Self::PopExcept => 0,
            Self::BeginFinally => 1,
            Self::EndFinally => -1,
            Self::BreakLoop => 0,
            Self::BeforeAsyncWith => 1,
            Self::WithCleanupStart => 0,
            Self::WithCleanupFinish => -1,
            Self::LoadConst
            | Self::LoadFast
            | Self::LoadDeref
            | Self::LoadClosure
            | Self::LoadGlobal
            | Self::LoadName => 1,
            Self::StoreFast | Self::StoreDeref | Self::StoreGlobal | Self::StoreName => -1,
            Self::DeleteFast | Self::DeleteDeref | Self::DeleteGlobal | Self::DeleteName => 0,
            Self::LoadAttr => 0,
            Self::StoreAttr => -2,
            Self::BuildTuple | Self::BuildList => 1 - n,
            Self::BuildMap => 1 - 2 * n,
            Self::UnpackSequence => n - 1,
            Self::CallFunction => -n,
            Self::CallFunctionKw => -n - 1,
            Self::MakeFunction => -((arg & MakeFunctionFlags::ALL).count_ones() as i32),
            Self::RaiseVarargs => -n,
            Self::JumpForward | Self::JumpAbsolute | Self::ContinueLoop | Self::SetupLoop => 0,
            Self::PopJumpIfFalse | Self::PopJumpIfTrue => -1,
            Self::JumpIfFalseOrPop | Self::JumpIfTrueOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            Self::ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            // the handled type is popped; on the handler branch the exception replaces it
            Self::SetupExcept => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            Self::SetupFinally => i32::from(jump),
            // [cm] -> [exit, enter_result]; handler sees [exit, payload]
            Self::SetupWith => 1,
            // [exit, enter_result] -> [exit, enter_result]; handler sees [exit, payload]
            Self::SetupAsyncWith => 0,
        }
    }
}

/// Error returned when a byte does not name an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcodeError(pub u8);

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcodeError(byte))
    }
}

impl std::fmt::Display for InvalidOpcodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid opcode byte: {:#04x}", self.0)
    }
}

impl std::error::Error for InvalidOpcodeError {}

/// Comparison selected by the operand of [`Opcode::CompareOp`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    /// `TOS1` matches the exception class (or tuple of classes) at TOS.
    ExcMatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for byte in 0..=u8::MAX {
            if let Ok(op) = Opcode::try_from(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::try_from(Opcode::ExtendedArg as u8 + 1), Err(InvalidOpcodeError(Opcode::ExtendedArg as u8 + 1)));
    }

    #[test]
    fn arg_boundary() {
        assert!(!Opcode::WithCleanupFinish.has_arg());
        assert!(Opcode::LoadConst.has_arg());
        assert!(Opcode::ExtendedArg.has_arg());
    }

    #[test]
    fn make_function_effect_counts_flags() {
        let flags = MakeFunctionFlags::DEFAULTS | MakeFunctionFlags::CLOSURE;
        assert_eq!(Opcode::MakeFunction.stack_effect(flags, false), -2);
    }
}

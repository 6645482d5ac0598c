use crate::{exception::Exception, value::Value};

/// What kind of region a [`Block`] protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A loop body; `break` jumps to the handler, `continue` stays inside.
    Loop,
    /// A `try` body with an `except` handler.
    Except,
    /// A `try` body with a `finally` handler.
    Finally,
    /// A `with` body; the handler runs the exit callback.
    With,
    /// An `async with` body; the handler awaits the exit callback.
    AsyncWith,
    /// An `except` handler body that is running. Popping it restores the exception that
    /// was being handled before it was entered.
    ExceptBody,
}

/// An entry of a frame's block stack.
#[derive(Debug)]
pub struct Block {
    pub(crate) kind: BlockKind,
    /// Byte offset to jump to when the block catches an unwind.
    pub(crate) handler: usize,
    /// Operand-stack depth to truncate to when unwinding through this block.
    pub(crate) level: usize,
    /// Exception class (or tuple of classes) an `Except` block accepts; `None` catches all.
    pub(crate) matcher: Option<Value>,
    /// For `ExceptBody`: the exception that was being handled before this one.
    pub(crate) saved: Option<Exception>,
    pub(crate) previous: Option<Box<Block>>,
}

impl Block {
    #[must_use]
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    #[must_use]
    pub fn handler(&self) -> usize {
        self.handler
    }

    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }
}

/// Why control is leaving a protected region.
///
/// Cleanup handlers receive it on the operand stack (as [`Value::Unroll`]) and `EndFinally`
/// resumes it, so a `finally` body runs the same way for every exit path.
#[derive(Debug, Clone)]
pub enum Unroll {
    Raise(Exception),
    Return(Value),
    Break,
    /// `continue` targeting the loop head at this offset.
    Continue(usize),
    /// The protected body completed normally.
    FallThrough,
    /// A `with` exit callback swallowed the exception; the except-body block opened when it
    /// was caught still has to be popped.
    Silenced,
}

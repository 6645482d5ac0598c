//! Block-stack unwinding and the exception protocol of the dispatch loop.

use std::rc::Rc;

use super::{BlockKind, Frame, Unroll, VM};
use crate::{
    exception::{ExcType, Exception, RunResult, TracebackEntry},
    host::HostObject,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

/// Where an unwind ended up.
pub(super) enum Unwound {
    /// A block took it; continue at this offset.
    Jump(usize),
    /// No block took it; the frame is done.
    Exit(Unroll),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Raises `exc` at the frame's current instruction.
    ///
    /// Records a traceback entry, chains the exception currently being handled as the
    /// implicit context, then unwinds.
    pub(super) fn raise_in_frame(&mut self, frame: &mut Frame, exc: Exception) -> Unwound {
        if exc.context().is_none()
            && let Some(handled) = frame.handled_exception()
        {
            exc.set_context(handled.clone());
        }
        let code = frame.code();
        exc.push_traceback(TracebackEntry {
            name: code.name().clone(),
            filename: code.filename().clone(),
            line: frame.current_line(),
        });
        self.tracer.on_exception(&exc, self.depth);
        self.unwind(frame, Unroll::Raise(exc))
    }

    /// Pops blocks until one handles `unroll`.
    pub(super) fn unwind(&mut self, frame: &mut Frame, unroll: Unroll) -> Unwound {
        loop {
            let Some(top) = frame.block_top() else {
                return Unwound::Exit(unroll);
            };
            if top.kind == BlockKind::Loop
                && let Unroll::Continue(target) = unroll
            {
                return Unwound::Jump(target);
            }

            let block = frame.pop_block();
            self.tracer.on_block_pop(block.kind, frame.block_depth());
            frame.truncate_stack(block.level);
            match block.kind {
                BlockKind::ExceptBody => {
                    frame.replace_handled(block.saved);
                }
                BlockKind::Loop => {
                    if matches!(unroll, Unroll::Break) {
                        return Unwound::Jump(block.handler);
                    }
                }
                BlockKind::Except => {
                    if let Unroll::Raise(exc) = &unroll
                        && block.matcher.as_ref().is_none_or(|matcher| exception_matches(exc, matcher))
                    {
                        let exc = exc.clone();
                        let previous = frame.replace_handled(Some(exc.clone()));
                        frame.new_except_body(block.level, previous);
                        self.tracer.on_block_push(BlockKind::ExceptBody, frame.block_depth());
                        frame.push(Value::Exception(exc));
                        return Unwound::Jump(block.handler);
                    }
                }
                BlockKind::Finally | BlockKind::With | BlockKind::AsyncWith => {
                    if let Unroll::Raise(exc) = &unroll {
                        // the exit handle sits below a `with` block's level and is consumed by
                        // the handler, so the except body starts one slot lower
                        let level = if block.kind == BlockKind::Finally {
                            block.level
                        } else {
                            block.level - 1
                        };
                        let previous = frame.replace_handled(Some(exc.clone()));
                        frame.new_except_body(level, previous);
                        self.tracer.on_block_push(BlockKind::ExceptBody, frame.block_depth());
                    }
                    frame.push(Value::Unroll(Rc::new(unroll)));
                    return Unwound::Jump(block.handler);
                }
            }
        }
    }

    /// `EndFinally` with a silenced payload: the `with` exit swallowed the exception, so
    /// the except-body opened for it is closed here.
    pub(super) fn pop_silenced_handler(&mut self, frame: &mut Frame) {
        let block = frame.pop_block();
        assert!(
            block.kind == BlockKind::ExceptBody,
            "silenced exception without an except body in {}",
            frame.code().qualname()
        );
        self.tracer.on_block_pop(block.kind, frame.block_depth());
        frame.replace_handled(block.saved);
    }
}

/// Whether `exc` is caught by `matcher`: an exception class or a tuple of them.
pub(super) fn exception_matches(exc: &Exception, matcher: &Value) -> bool {
    match matcher {
        Value::ExcClass(exc_type) => exc.matches(*exc_type),
        Value::Tuple(items) => items.iter().any(|item| exception_matches(exc, item)),
        _ => false,
    }
}

/// Validates an `except` clause target.
pub(super) fn check_matcher(matcher: &Value) -> RunResult<()> {
    let valid = match matcher {
        Value::ExcClass(_) => true,
        Value::Tuple(items) => items.iter().all(|item| check_matcher(item).is_ok()),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ExcType::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        ))
    }
}

/// The operand of `raise X`: a class is instantiated with no arguments.
pub(super) fn make_exception(value: Value) -> RunResult<Exception> {
    match value {
        Value::ExcClass(exc_type) => Ok(Exception::new_none(exc_type)),
        Value::Exception(exc) => Ok(exc),
        _ => Err(ExcType::type_error("exceptions must derive from BaseException")),
    }
}

/// The operand of `raise X from Y`; `from None` clears the cause and suppresses the context.
pub(super) fn make_cause(value: Value) -> RunResult<Option<Exception>> {
    match value {
        Value::None => Ok(None),
        Value::ExcClass(exc_type) => Ok(Some(Exception::new_none(exc_type))),
        Value::Exception(exc) => Ok(Some(exc)),
        _ => Err(ExcType::type_error("exception causes must derive from BaseException")),
    }
}

/// The exception carried by a cleanup payload, if it is leaving because of one.
pub(super) fn payload_exception(payload: &Value) -> Option<Exception> {
    match payload {
        Value::Unroll(unroll) => match &**unroll {
            Unroll::Raise(exc) => Some(exc.clone()),
            _ => None,
        },
        Value::Exception(exc) => Some(exc.clone()),
        _ => None,
    }
}

fn host_manager<'v>(manager: &'v Value, method: &str) -> RunResult<&'v dyn HostObject> {
    match manager {
        Value::Host(host) => Ok(&**host),
        other => Err(ExcType::attribute_error(other.type_name(), method)),
    }
}

pub(super) fn with_enter(manager: &Value) -> RunResult<Value> {
    host_manager(manager, "__enter__")?.enter()
}

pub(super) fn with_exit(manager: &Value, exc: Option<&Exception>) -> RunResult<Value> {
    host_manager(manager, "__exit__")?.exit(exc).map(Value::Bool)
}

pub(super) fn with_aenter(manager: &Value) -> RunResult<Value> {
    host_manager(manager, "__aenter__")?.aenter()
}

pub(super) fn with_aexit(manager: &Value, exc: Option<&Exception>) -> RunResult<Value> {
    host_manager(manager, "__aexit__")?.aexit(exc)
}

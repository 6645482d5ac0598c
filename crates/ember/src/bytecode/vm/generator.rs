//! Driving generators, coroutines and async generators.
//!
//! A generator owns its suspended [`Frame`](super::Frame); resuming checks the frame out,
//! runs it with [`VM::execute`] and puts it back if it yields again. `yield from` and
//! `await` leave the delegate on the operand stack, and `throw`/`close` forward into it
//! before touching the outer frame.

use super::{FrameExit, Resume, VM, collections::Next};
use crate::{
    args::ArgValues,
    bytecode::CodeFlags,
    exception::{ExcType, Exception, RunResult},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{GeneratorKind, GeneratorRef, GeneratorState},
    value::Value,
};

/// Outcome of advancing a generator one step.
#[derive(Debug)]
pub enum GenStep {
    /// The body produced a value with `yield`, or passed one up from the iterator it
    /// delegates to.
    Yielded(Value),
    /// An async generator passed up a value from the awaitable it is awaiting. The event
    /// loop sees these; the consumer of the async generator does not.
    Awaiting(Value),
    /// The body returned; the generator is finished.
    Returned(Value),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `generator.send(value)`; `next(generator)` is `send(None)`.
    pub(super) fn gen_send(&mut self, generator: &GeneratorRef, value: Value) -> RunResult<GenStep> {
        let resume = if generator.state() == GeneratorState::Fresh {
            if !value.is_none() {
                return Err(ExcType::type_error(format!(
                    "can't send non-None value to a just-started {}",
                    generator.kind().describe()
                )));
            }
            Resume::Start
        } else {
            Resume::Value(value)
        };
        self.resume_generator(generator, resume)
    }

    /// `generator.throw(exc)`.
    ///
    /// A generator delegating to another generator forwards the exception into it first;
    /// with `close_on_genexit`, a `GeneratorExit` closes the delegate instead.
    pub(super) fn gen_throw(
        &mut self,
        generator: &GeneratorRef,
        exc: Exception,
        close_on_genexit: bool,
    ) -> RunResult<GenStep> {
        let kind = generator.kind();
        if generator.state() == GeneratorState::Running {
            return Err(ExcType::generator_already_executing(kind.describe()));
        }
        if let Some(delegate) = generator.delegate() {
            if close_on_genexit && exc.matches(ExcType::GeneratorExit) {
                generator.set_state(GeneratorState::Running);
                let closed = self.close_delegate(&delegate);
                generator.set_state(GeneratorState::Suspended);
                let exc = closed.err().unwrap_or(exc);
                return self.resume_generator(generator, Resume::Throw(exc));
            }
            if let Value::Generator(inner) = &delegate {
                generator.set_state(GeneratorState::Running);
                let result = self.gen_throw(inner, exc, close_on_genexit);
                generator.set_state(GeneratorState::Suspended);
                return match result {
                    Ok(GenStep::Yielded(value) | GenStep::Awaiting(value)) => Ok(delegated_step(kind, value)),
                    Ok(GenStep::Returned(value)) => {
                        generator.finish_delegation();
                        self.resume_generator(generator, Resume::Value(value))
                    }
                    Err(err) => {
                        generator.finish_delegation();
                        self.resume_generator(generator, Resume::Throw(err))
                    }
                };
            }
            // plain iterators have no throw; raise at the suspension point
        }
        self.resume_generator(generator, Resume::Throw(exc))
    }

    /// `generator.close()`: raises `GeneratorExit` at the suspension point and insists the
    /// body lets it (or `StopIteration`) escape.
    pub(super) fn gen_close(&mut self, generator: &GeneratorRef) -> RunResult<()> {
        let kind = generator.kind();
        match generator.state() {
            GeneratorState::Finished => return Ok(()),
            GeneratorState::Fresh => {
                drop(generator.finish());
                return Ok(());
            }
            GeneratorState::Running => return Err(ExcType::generator_already_executing(kind.describe())),
            GeneratorState::Suspended => {}
        }

        let mut exc = Exception::new_none(ExcType::GeneratorExit);
        if let Some(delegate) = generator.delegate() {
            generator.set_state(GeneratorState::Running);
            let closed = self.close_delegate(&delegate);
            generator.set_state(GeneratorState::Suspended);
            if let Err(err) = closed {
                exc = err;
            }
        }
        match self.resume_generator(generator, Resume::Throw(exc)) {
            Ok(GenStep::Yielded(_) | GenStep::Awaiting(_)) => Err(ExcType::runtime_error(format!(
                "{} ignored GeneratorExit",
                kind.describe()
            ))),
            Ok(GenStep::Returned(_)) => Ok(()),
            Err(exc) if exc.matches(ExcType::GeneratorExit) || exc.matches(ExcType::StopIteration) => Ok(()),
            Err(exc) => Err(exc),
        }
    }

    /// Runs the generator's frame until it yields, returns or raises.
    fn resume_generator(&mut self, generator: &GeneratorRef, resume: Resume) -> RunResult<GenStep> {
        let kind = generator.kind();
        match generator.state() {
            GeneratorState::Running => return Err(ExcType::generator_already_executing(kind.describe())),
            GeneratorState::Finished => {
                return match resume {
                    Resume::Throw(exc) => Err(exc),
                    _ if kind == GeneratorKind::Coroutine => {
                        Err(ExcType::runtime_error("cannot reuse already awaited coroutine"))
                    }
                    _ => Ok(GenStep::Returned(Value::None)),
                };
            }
            GeneratorState::Fresh | GeneratorState::Suspended => {}
        }

        let mut frame = generator.take_frame();
        match self.execute(&mut frame, resume) {
            Ok(FrameExit::Yield { value, delegated }) => {
                generator.suspend(frame);
                Ok(if delegated {
                    delegated_step(kind, value)
                } else {
                    GenStep::Yielded(value)
                })
            }
            Ok(FrameExit::Return(value)) => {
                generator.finish();
                drop(frame);
                Ok(GenStep::Returned(value))
            }
            Err(exc) => {
                generator.finish();
                drop(frame);
                Err(stop_iteration_leak(kind, exc))
            }
        }
    }

    /// `YieldFrom`: passes `sent` into the delegate at TOS.
    pub(super) fn delegate_send(&mut self, receiver: &Value, sent: Value) -> RunResult<Next> {
        match receiver {
            Value::Generator(inner) => Ok(match self.gen_send(inner, sent)? {
                GenStep::Yielded(value) | GenStep::Awaiting(value) => Next::Item(value),
                GenStep::Returned(value) => Next::Done(value),
            }),
            Value::Iter(_) | Value::Host(_) => {
                if sent.is_none() {
                    self.iter_next(receiver)
                } else {
                    Err(ExcType::attribute_error(receiver.type_name(), "send"))
                }
            }
            other => Err(ExcType::not_an_iterator(other.type_name())),
        }
    }

    /// Closes the iterator a generator is delegating to, if it can be closed.
    fn close_delegate(&mut self, delegate: &Value) -> RunResult<()> {
        match delegate {
            Value::Generator(inner) => self.gen_close(inner),
            Value::Host(host) => match host.get_attr("close") {
                Ok(close) => self.call_value(&close, ArgValues::new()).map(drop),
                Err(err) if err.matches(ExcType::AttributeError) => Ok(()),
                Err(err) => Err(err),
            },
            _ => Ok(()),
        }
    }
}

/// A value yielded by a delegate, as seen by whoever resumed the outer generator.
fn delegated_step(kind: GeneratorKind, value: Value) -> GenStep {
    if kind == GeneratorKind::AsyncGenerator {
        GenStep::Awaiting(value)
    } else {
        GenStep::Yielded(value)
    }
}

/// A `StopIteration` escaping a generator body would read as a normal end of iteration to
/// the caller, so it is replaced by a `RuntimeError` chained to it.
fn stop_iteration_leak(kind: GeneratorKind, exc: Exception) -> Exception {
    let message = if exc.matches(ExcType::StopIteration) {
        format!("{} raised StopIteration", kind.describe())
    } else if kind == GeneratorKind::AsyncGenerator && exc.matches(ExcType::StopAsyncIteration) {
        "async generator raised StopAsyncIteration".to_owned()
    } else {
        return exc;
    };
    let replacement = ExcType::runtime_error(message);
    replacement.set_cause(Some(exc.clone()));
    replacement.set_context(exc);
    replacement
}

/// `GetYieldFromIter`.
pub(super) fn get_yield_from_iter(value: Value, flags: CodeFlags) -> RunResult<Value> {
    match &value {
        Value::Generator(generator) if generator.kind() == GeneratorKind::Coroutine => {
            if flags.contains(CodeFlags::COROUTINE) || flags.contains(CodeFlags::ITERABLE_COROUTINE) {
                Ok(value)
            } else {
                Err(ExcType::type_error(
                    "cannot 'yield from' a coroutine object in a non-coroutine generator",
                ))
            }
        }
        _ => super::collections::get_iter(value),
    }
}

/// `GetAwaitable`.
pub(super) fn get_awaitable(value: Value) -> RunResult<Value> {
    let awaitable = match &value {
        Value::Generator(generator) => match generator.kind() {
            GeneratorKind::Coroutine => {
                if generator.delegate().is_some() {
                    return Err(ExcType::runtime_error("coroutine is being awaited already"));
                }
                true
            }
            GeneratorKind::Generator => generator.code().flags().contains(CodeFlags::ITERABLE_COROUTINE),
            GeneratorKind::AsyncGenerator => false,
        },
        Value::Host(_) => true,
        _ => false,
    };
    if awaitable {
        Ok(value)
    } else {
        Err(ExcType::type_error(format!(
            "object {} can't be used in 'await' expression",
            value.type_name()
        )))
    }
}

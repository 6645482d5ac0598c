//! The bytecode virtual machine.
//!
//! Each call runs its [`Frame`] in a fresh invocation of the dispatch loop on the host
//! stack, so nesting is bounded by [`ResourceTracker::enter_frame`]. A frame that
//! suspends (a generator yielding) returns from the loop with its operand stack, block
//! stack and `last_instr` intact; resuming re-enters the loop at `last_instr + 2`.
//!
//! Control leaving a protected region travels as an [`Unroll`] through [`VM::unwind`],
//! which pops blocks until one takes it. Raised exceptions, `return`, `break` and
//! `continue` all share that path, so `finally` bodies run the same way for each.

mod attr;
mod binary;
mod block;
mod call;
mod collections;
mod compare;
mod exceptions;
mod frame;
mod generator;

use std::rc::Rc;

pub use block::{Block, BlockKind, Unroll};
use collections::Next;
use exceptions::Unwound;
pub use frame::Frame;
pub use generator::GenStep;

use crate::{
    args::ArgValues,
    builtins::{Builtins, builtins_namespace},
    bytecode::{Code, CompareOp, Opcode},
    cell::CellRef,
    exception::{ExcType, Exception, RunResult},
    function::Function,
    io::PrintWriter,
    namespace::Namespace,
    resource::{Allocation, InterruptHandle, ResourceTracker},
    tracer::{NoopTracer, TraceGranularity, VmTracer},
    types::{FinalizerQueue, GeneratorKind, GeneratorRef},
    value::Value,
};

/// How a frame stopped running.
#[derive(Debug)]
pub enum FrameExit {
    /// The frame finished; it must not be resumed again.
    Return(Value),
    /// The frame suspended and can be resumed.
    Yield {
        value: Value,
        /// The value came from an iterator the frame is delegating to (`yield from`/`await`)
        /// rather than from the frame's own `yield`.
        delegated: bool,
    },
}

/// What a frame is resumed with.
#[derive(Debug)]
pub(crate) enum Resume {
    /// First entry into a fresh frame.
    Start,
    /// The result of the `yield` the frame is suspended at.
    Value(Value),
    /// An exception raised at the suspension point.
    Throw(Exception),
}

/// Resolves an unwind inside the dispatch loop: jump to the handler, or leave the frame.
macro_rules! jump_or_exit {
    ($ip:ident, $code:expr, $unwound:expr) => {
        match $unwound {
            Unwound::Jump(target) => {
                $ip = target;
                continue;
            }
            Unwound::Exit(unroll) => return leave($code, unroll),
        }
    };
}

/// Unwraps an operation result, raising the error into the running frame on failure.
macro_rules! try_or_unwind {
    ($self:expr, $frame:ident, $ip:ident, $code:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(exc) => jump_or_exit!($ip, $code, $self.raise_in_frame($frame, exc)),
        }
    };
}

fn leave(code: &Code, unroll: Unroll) -> RunResult<FrameExit> {
    match unroll {
        Unroll::Return(value) => Ok(FrameExit::Return(value)),
        Unroll::Raise(exc) => Err(exc),
        other => panic!("{other:?} escaped every block of {}", code.qualname()),
    }
}

/// The bytecode virtual machine.
///
/// Generic over resource accounting, `print` output and tracing; the defaults of each
/// compile away to nothing.
pub struct VM<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer = NoopTracer> {
    tracker: T,
    print_writer: &'a mut P,
    tracer: Tr,
    builtins: Namespace,
    /// Number of frames currently executing on the host stack.
    depth: usize,
    /// Frames of generators dropped while suspended inside a block.
    finalizers: Rc<FinalizerQueue>,
    interrupt: Option<InterruptHandle>,
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'a, T, P, Tr> {
    pub fn new(tracker: T, print_writer: &'a mut P, tracer: Tr) -> Self {
        Self {
            tracker,
            print_writer,
            tracer,
            builtins: builtins_namespace(),
            depth: 0,
            finalizers: Rc::new(FinalizerQueue::default()),
            interrupt: None,
        }
    }

    /// Polls `handle` at every instruction boundary and raises `KeyboardInterrupt` when set.
    #[must_use]
    pub fn with_interrupt(mut self, handle: InterruptHandle) -> Self {
        self.interrupt = Some(handle);
        self
    }

    /// Replaces the builtins namespace frames created from now on will see.
    #[must_use]
    pub fn with_builtins(mut self, builtins: Namespace) -> Self {
        self.builtins = builtins;
        self
    }

    #[must_use]
    pub fn builtins(&self) -> &Namespace {
        &self.builtins
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut Tr {
        &mut self.tracer
    }

    #[must_use]
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Runs `code` as a function called with `args`, against `globals`.
    ///
    /// Generator-flagged code returns a fresh generator object instead of running. Code
    /// with free variables cannot be invoked directly; build a [`Function`] with a closure
    /// and use [`VM::call`].
    pub fn invoke(&mut self, code: Rc<Code>, globals: Namespace, args: ArgValues) -> RunResult<Value> {
        let function = Function::new(code, globals);
        let result = self.call_function(&function, args);
        self.run_finalizers();
        result
    }

    /// Calls any callable value.
    pub fn call(&mut self, callable: &Value, args: ArgValues) -> RunResult<Value> {
        let result = self.call_value(callable, args);
        self.run_finalizers();
        result
    }

    /// Creates a frame for `code` over already-bound local values.
    pub fn new_frame(
        &mut self,
        code: Rc<Code>,
        globals: Namespace,
        locals: Vec<Value>,
        closure: &[CellRef],
    ) -> RunResult<Frame> {
        let frame = Frame::new(code, globals, self.builtins.clone(), locals, closure)?;
        self.tracker.reserve(Allocation::Frame, || frame.arena_size())?;
        Ok(frame)
    }

    /// Runs a frame to completion, or wraps it in a generator object if its code is a
    /// generator, coroutine or async generator.
    pub fn run_frame(&mut self, mut frame: Frame) -> RunResult<Value> {
        if let Some(kind) = GeneratorKind::from_flags(frame.code().flags()) {
            frame.init_cells();
            let generator = GeneratorRef::new(frame, kind, Rc::downgrade(&self.finalizers));
            return Ok(Value::Generator(generator));
        }
        match self.execute(&mut frame, Resume::Start)? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield { .. } => panic!("{} yielded without being a generator", frame.code().qualname()),
        }
    }

    /// Resumes a generator with `value` as the result of its pending `yield`.
    pub fn send(&mut self, generator: &GeneratorRef, value: Value) -> RunResult<GenStep> {
        let result = self.gen_send(generator, value);
        self.run_finalizers();
        result
    }

    /// Raises `exc` inside a generator at its suspension point.
    pub fn throw(&mut self, generator: &GeneratorRef, exc: Exception) -> RunResult<GenStep> {
        let result = self.gen_throw(generator, exc, true);
        self.run_finalizers();
        result
    }

    /// Closes a generator, running any cleanup around its suspension point.
    pub fn close(&mut self, generator: &GeneratorRef) -> RunResult<()> {
        let result = self.gen_close(generator);
        self.run_finalizers();
        result
    }

    /// Closes every generator that was dropped while suspended inside a block.
    ///
    /// Errors they raise have no caller to go to and are reported to
    /// [`VmTracer::on_unraisable`].
    pub fn run_finalizers(&mut self) {
        while let Some(pending) = self.finalizers.pop() {
            let generator = GeneratorRef::resurrect(pending);
            if let Err(exc) = self.gen_close(&generator) {
                self.tracer.on_unraisable(&exc);
            }
        }
    }

    /// Runs (or resumes) one frame on the host stack.
    pub(crate) fn execute(&mut self, frame: &mut Frame, resume: Resume) -> RunResult<FrameExit> {
        if let Err(err) = self.tracker.enter_frame(self.depth) {
            // a plain frame that never started is dropped by the caller; a generator keeps it
            if frame.is_fresh() && GeneratorKind::from_flags(frame.code().flags()).is_none() {
                self.tracker.release(|| frame.arena_size());
            }
            return Err(err.into());
        }
        self.depth += 1;
        if frame.is_fresh() {
            self.tracer.on_call(frame.code().qualname(), self.depth);
        } else {
            self.tracer.on_resume(self.depth);
        }
        let result = self.dispatch(frame, resume);
        self.depth -= 1;
        if !matches!(result, Ok(FrameExit::Yield { .. })) {
            self.tracer.on_return(self.depth);
            self.tracker.release(|| frame.arena_size());
        }
        result
    }

    /// Checks run before every instruction: limits, interrupts and pending finalizers.
    fn check_boundary(&mut self) -> RunResult<()> {
        self.tracker.on_instruction()?;
        if self.interrupt.as_ref().is_some_and(InterruptHandle::take) {
            return Err(Exception::new_none(ExcType::KeyboardInterrupt));
        }
        if !self.finalizers.is_empty() {
            self.run_finalizers();
        }
        Ok(())
    }

    fn track_container(&mut self, len: usize) -> RunResult<()> {
        self.tracker.reserve(Allocation::Container, || len * size_of::<Value>())?;
        Ok(())
    }

    /// The dispatch loop.
    fn dispatch(&mut self, frame: &mut Frame, resume: Resume) -> RunResult<FrameExit> {
        let code = frame.code().clone();
        let bytecode = code.bytecode();
        frame.set_delegating(false);
        let mut ip = frame.resume_ip();
        match resume {
            Resume::Start => frame.init_cells(),
            Resume::Value(value) => frame.push(value),
            Resume::Throw(exc) => {
                frame.init_cells();
                match self.raise_in_frame(frame, exc) {
                    Unwound::Jump(target) => ip = target,
                    Unwound::Exit(unroll) => return leave(&code, unroll),
                }
            }
        }
        let mut prev_offset: Option<usize> = None;

        loop {
            let mut offset = ip;
            let mut arg: u32 = 0;
            let opcode = loop {
                let byte = bytecode[offset];
                let Ok(opcode) = Opcode::try_from(byte) else {
                    panic!(
                        "invalid opcode byte {byte:#04x} at offset {offset} in {}",
                        code.qualname()
                    );
                };
                if opcode.has_arg() {
                    arg = (arg << 8) | u32::from(bytecode[offset + 1]);
                }
                if opcode != Opcode::ExtendedArg {
                    break opcode;
                }
                offset += 2;
            };
            frame.last_instr = i32::try_from(offset).unwrap_or(i32::MAX);
            ip = offset + 2;
            let index = arg as usize;

            let granularity = self.tracer.granularity();
            if granularity >= TraceGranularity::Lines {
                let line = code.line_for(offset);
                if frame.last_line != Some(line) || prev_offset.is_some_and(|prev| offset < prev) {
                    frame.last_line = Some(line);
                    self.tracer.on_line(frame, line);
                }
                prev_offset = Some(offset);
            }
            if granularity == TraceGranularity::Instructions {
                self.tracer.on_instruction(offset, opcode, frame.stack_depth(), self.depth);
            }
            try_or_unwind!(self, frame, ip, &code, self.check_boundary());

            match opcode {
                Opcode::Nop | Opcode::ExtendedArg => {}
                // === Stack manipulation ===
                Opcode::PopTop => drop(frame.pop()),
                Opcode::RotTwo => {
                    let b = frame.pop();
                    let a = frame.pop();
                    frame.push(b);
                    frame.push(a);
                }
                Opcode::RotThree => {
                    let c = frame.pop();
                    let b = frame.pop();
                    let a = frame.pop();
                    frame.push(c);
                    frame.push(a);
                    frame.push(b);
                }
                Opcode::DupTop => {
                    let value = frame.peek().clone();
                    frame.push(value);
                }
                Opcode::DupTopTwo => {
                    let a = frame.peek_at(1).clone();
                    let b = frame.peek().clone();
                    frame.push(a);
                    frame.push(b);
                }

                // === Operators ===
                Opcode::UnaryNot => {
                    let value = frame.pop();
                    frame.push(Value::Bool(!value.is_truthy()));
                }
                Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryInvert => {
                    let value = frame.pop();
                    let result = try_or_unwind!(self, frame, ip, &code, binary::unary_op(opcode, &value));
                    frame.push(result);
                }
                Opcode::BinarySubscr => {
                    let index = frame.pop();
                    let container = frame.pop();
                    let result = try_or_unwind!(self, frame, ip, &code, collections::subscr(&container, &index));
                    frame.push(result);
                }
                Opcode::BinaryPower
                | Opcode::BinaryMultiply
                | Opcode::BinaryTrueDivide
                | Opcode::BinaryFloorDivide
                | Opcode::BinaryModulo
                | Opcode::BinaryAdd
                | Opcode::BinarySubtract
                | Opcode::BinaryLshift
                | Opcode::BinaryRshift
                | Opcode::BinaryAnd
                | Opcode::BinaryXor
                | Opcode::BinaryOr => {
                    let rhs = frame.pop();
                    let lhs = frame.pop();
                    let result = try_or_unwind!(self, frame, ip, &code, binary::binary_op(opcode, &lhs, &rhs));
                    frame.push(result);
                }
                Opcode::StoreSubscr => {
                    let index = frame.pop();
                    let container = frame.pop();
                    let value = frame.pop();
                    try_or_unwind!(
                        self,
                        frame,
                        ip,
                        &code,
                        collections::store_subscr(&container, index, value)
                    );
                }
                Opcode::CompareOp => {
                    let Some(op) = u8::try_from(arg).ok().and_then(CompareOp::from_repr) else {
                        panic!("invalid comparison {arg} in {}", code.qualname());
                    };
                    let rhs = frame.pop();
                    let lhs = frame.pop();
                    let result = try_or_unwind!(self, frame, ip, &code, compare::compare(op, &lhs, &rhs));
                    frame.push(result);
                }

                // === Iteration and generators ===
                Opcode::GetIter => {
                    let value = frame.pop();
                    let iterator = try_or_unwind!(self, frame, ip, &code, collections::get_iter(value));
                    frame.push(iterator);
                }
                Opcode::GetYieldFromIter => {
                    let value = frame.pop();
                    let iterator = try_or_unwind!(
                        self,
                        frame,
                        ip,
                        &code,
                        generator::get_yield_from_iter(value, code.flags())
                    );
                    frame.push(iterator);
                }
                Opcode::GetAwaitable => {
                    let value = frame.pop();
                    let awaitable = try_or_unwind!(self, frame, ip, &code, generator::get_awaitable(value));
                    frame.push(awaitable);
                }
                Opcode::ForIter => {
                    let iterator = frame.peek().clone();
                    match try_or_unwind!(self, frame, ip, &code, self.iter_next(&iterator)) {
                        Next::Item(value) => frame.push(value),
                        Next::Done(_) => {
                            drop(frame.pop());
                            ip = index;
                        }
                    }
                }
                Opcode::ReturnValue => {
                    let value = frame.pop();
                    jump_or_exit!(ip, &code, self.unwind(frame, Unroll::Return(value)));
                }
                Opcode::YieldValue => {
                    let value = frame.pop();
                    self.tracer.on_yield(self.depth);
                    return Ok(FrameExit::Yield {
                        value,
                        delegated: false,
                    });
                }
                Opcode::YieldFrom => {
                    let sent = frame.pop();
                    let receiver = frame.peek().clone();
                    match try_or_unwind!(self, frame, ip, &code, self.delegate_send(&receiver, sent)) {
                        Next::Item(value) => {
                            // resuming re-runs this instruction until the delegate is done
                            frame.last_instr -= 2;
                            frame.set_delegating(true);
                            self.tracer.on_yield(self.depth);
                            return Ok(FrameExit::Yield { value, delegated: true });
                        }
                        Next::Done(result) => {
                            drop(frame.pop());
                            frame.push(result);
                        }
                    }
                }

                // === Blocks ===
                Opcode::SetupLoop => {
                    frame.new_block(BlockKind::Loop, index, frame.stack_depth());
                    self.tracer.on_block_push(BlockKind::Loop, frame.block_depth());
                }
                Opcode::SetupExcept => {
                    let matcher = frame.pop();
                    let matcher = if matcher.is_none() {
                        None
                    } else {
                        try_or_unwind!(self, frame, ip, &code, exceptions::check_matcher(&matcher));
                        Some(matcher)
                    };
                    frame.new_except_block(index, frame.stack_depth(), matcher);
                    self.tracer.on_block_push(BlockKind::Except, frame.block_depth());
                }
                Opcode::SetupFinally => {
                    frame.new_block(BlockKind::Finally, index, frame.stack_depth());
                    self.tracer.on_block_push(BlockKind::Finally, frame.block_depth());
                }
                Opcode::SetupWith => {
                    let manager = frame.pop();
                    let entered = try_or_unwind!(self, frame, ip, &code, exceptions::with_enter(&manager));
                    frame.push(manager);
                    frame.new_block(BlockKind::With, index, frame.stack_depth());
                    self.tracer.on_block_push(BlockKind::With, frame.block_depth());
                    frame.push(entered);
                }
                Opcode::BeforeAsyncWith => {
                    let manager = frame.pop();
                    let awaitable = try_or_unwind!(self, frame, ip, &code, exceptions::with_aenter(&manager));
                    frame.push(manager);
                    frame.push(awaitable);
                }
                Opcode::SetupAsyncWith => {
                    let entered = frame.pop();
                    frame.new_block(BlockKind::AsyncWith, index, frame.stack_depth());
                    self.tracer.on_block_push(BlockKind::AsyncWith, frame.block_depth());
                    frame.push(entered);
                }
                Opcode::PopBlock => {
                    let block = frame.pop_block();
                    self.tracer.on_block_pop(block.kind, frame.block_depth());
                    frame.truncate_stack(block.level);
                    if block.kind == BlockKind::ExceptBody {
                        frame.replace_handled(block.saved);
                    }
                }
                Opcode::PopExcept => {
                    let block = frame.pop_block();
                    assert!(
                        block.kind == BlockKind::ExceptBody,
                        "PopExcept popped a {:?} block in {}",
                        block.kind,
                        code.qualname()
                    );
                    self.tracer.on_block_pop(block.kind, frame.block_depth());
                    frame.replace_handled(block.saved);
                }
                Opcode::BeginFinally => frame.push(Value::Unroll(Rc::new(Unroll::FallThrough))),
                Opcode::EndFinally => match frame.pop() {
                    Value::Unroll(unroll) => match Rc::unwrap_or_clone(unroll) {
                        Unroll::FallThrough => {}
                        Unroll::Silenced => self.pop_silenced_handler(frame),
                        other => jump_or_exit!(ip, &code, self.unwind(frame, other)),
                    },
                    Value::Exception(exc) => jump_or_exit!(ip, &code, self.unwind(frame, Unroll::Raise(exc))),
                    Value::None => {}
                    other => panic!(
                        "EndFinally found {other:?} instead of an unroll payload in {}",
                        code.qualname()
                    ),
                },
                Opcode::BreakLoop => jump_or_exit!(ip, &code, self.unwind(frame, Unroll::Break)),
                Opcode::ContinueLoop => jump_or_exit!(ip, &code, self.unwind(frame, Unroll::Continue(index))),
                Opcode::WithCleanupStart => {
                    let payload = frame.pop();
                    let manager = frame.pop();
                    let exc = exceptions::payload_exception(&payload);
                    let result = if arg == 1 {
                        exceptions::with_aexit(&manager, exc.as_ref())
                    } else {
                        exceptions::with_exit(&manager, exc.as_ref())
                    };
                    let result = try_or_unwind!(self, frame, ip, &code, result);
                    frame.push(payload);
                    frame.push(result);
                }
                Opcode::WithCleanupFinish => {
                    let result = frame.pop();
                    let payload = frame.pop();
                    if exceptions::payload_exception(&payload).is_some() && result.is_truthy() {
                        frame.push(Value::Unroll(Rc::new(Unroll::Silenced)));
                    } else {
                        frame.push(payload);
                    }
                }

                // === Variables ===
                Opcode::LoadConst => frame.push(Value::from_constant(&code.constants()[index])),
                Opcode::LoadFast => {
                    let value = frame.local(index).clone();
                    if value.is_undefined() {
                        let exc = ExcType::unbound_local(&code.varnames()[index]);
                        jump_or_exit!(ip, &code, self.raise_in_frame(frame, exc));
                    }
                    frame.push(value);
                }
                Opcode::StoreFast => {
                    let value = frame.pop();
                    frame.set_local_slot(index, value);
                }
                Opcode::DeleteFast => {
                    if frame.local(index).is_undefined() {
                        let exc = ExcType::unbound_local(&code.varnames()[index]);
                        jump_or_exit!(ip, &code, self.raise_in_frame(frame, exc));
                    }
                    frame.set_local_slot(index, Value::Undefined);
                }
                Opcode::LoadDeref => {
                    self.tracer.on_cell_load(index, frame.deref_count());
                    match frame.deref(index).get() {
                        Some(value) => frame.push(value),
                        None => {
                            let exc = unbound_deref(&code, index);
                            jump_or_exit!(ip, &code, self.raise_in_frame(frame, exc));
                        }
                    }
                }
                Opcode::StoreDeref => {
                    let value = frame.pop();
                    self.tracer.on_cell_store(index, frame.deref_count());
                    frame.deref(index).set(value);
                }
                Opcode::DeleteDeref => {
                    if !frame.deref(index).delete() {
                        let exc = unbound_deref(&code, index);
                        jump_or_exit!(ip, &code, self.raise_in_frame(frame, exc));
                    }
                }
                Opcode::LoadClosure => {
                    let cell = frame.deref(index).clone();
                    frame.push(Value::Cell(cell));
                }
                Opcode::LoadGlobal => {
                    let name = &code.names()[index];
                    let found = frame.globals().get(name).or_else(|| frame.builtins().get(name));
                    match found {
                        Some(value) => frame.push(value),
                        None => jump_or_exit!(ip, &code, self.raise_in_frame(frame, ExcType::name_error(name))),
                    }
                }
                Opcode::StoreGlobal => {
                    let value = frame.pop();
                    frame.globals().set(code.names()[index].clone(), value);
                }
                Opcode::DeleteGlobal => {
                    let name = &code.names()[index];
                    if frame.globals().remove(name).is_none() {
                        jump_or_exit!(ip, &code, self.raise_in_frame(frame, ExcType::name_error(name)));
                    }
                }
                Opcode::LoadName => {
                    let name = &code.names()[index];
                    let found = frame
                        .locals_map()
                        .and_then(|locals| locals.get(name))
                        .or_else(|| frame.globals().get(name))
                        .or_else(|| frame.builtins().get(name));
                    match found {
                        Some(value) => frame.push(value),
                        None => jump_or_exit!(ip, &code, self.raise_in_frame(frame, ExcType::name_error(name))),
                    }
                }
                Opcode::StoreName => {
                    let value = frame.pop();
                    let name = code.names()[index].clone();
                    match frame.locals_map() {
                        Some(locals) => locals.set(name, value),
                        None => frame.globals().set(name, value),
                    }
                }
                Opcode::DeleteName => {
                    let name = &code.names()[index];
                    let removed = match frame.locals_map() {
                        Some(locals) => locals.remove(name),
                        None => frame.globals().remove(name),
                    };
                    if removed.is_none() {
                        jump_or_exit!(ip, &code, self.raise_in_frame(frame, ExcType::name_error(name)));
                    }
                }
                Opcode::LoadAttr => {
                    let object = frame.pop();
                    let value = try_or_unwind!(self, frame, ip, &code, attr::get_attr(&object, &code.names()[index]));
                    frame.push(value);
                }
                Opcode::StoreAttr => {
                    let object = frame.pop();
                    let value = frame.pop();
                    try_or_unwind!(
                        self,
                        frame,
                        ip,
                        &code,
                        attr::set_attr(&object, &code.names()[index], value)
                    );
                }

                // === Builders ===
                Opcode::BuildTuple => {
                    let items = frame.pop_n(index);
                    try_or_unwind!(self, frame, ip, &code, self.track_container(index));
                    frame.push(Value::tuple(items));
                }
                Opcode::BuildList => {
                    let items = frame.pop_n(index);
                    try_or_unwind!(self, frame, ip, &code, self.track_container(index));
                    frame.push(Value::list(items));
                }
                Opcode::BuildMap => {
                    let items = frame.pop_n(index * 2);
                    try_or_unwind!(self, frame, ip, &code, self.track_container(index * 2));
                    let map = try_or_unwind!(self, frame, ip, &code, collections::build_map(items));
                    frame.push(map);
                }
                Opcode::UnpackSequence => {
                    let sequence = frame.pop();
                    let items = try_or_unwind!(self, frame, ip, &code, self.unpack(&sequence, index));
                    for item in items.into_iter().rev() {
                        frame.push(item);
                    }
                }

                // === Calls ===
                Opcode::CallFunction => {
                    let args = frame.pop_n(index);
                    let callable = frame.pop();
                    let result = if matches!(callable, Value::Builtin(Builtins::Locals)) {
                        ArgValues::positional(args)
                            .check_zero_args("locals")
                            .map(|()| Value::dict(frame.locals()))
                    } else {
                        self.call_value(&callable, ArgValues::positional(args))
                    };
                    let result = try_or_unwind!(self, frame, ip, &code, result);
                    frame.push(result);
                }
                Opcode::CallFunctionKw => {
                    let names = frame.pop();
                    let args = frame.pop_n(index);
                    let callable = frame.pop();
                    let result = try_or_unwind!(
                        self,
                        frame,
                        ip,
                        &code,
                        self.call_with_keywords(&callable, args, &names)
                    );
                    frame.push(result);
                }
                Opcode::MakeFunction => {
                    let function = self.make_function(frame, arg);
                    frame.push(function);
                }
                Opcode::RaiseVarargs => {
                    let exc = match arg {
                        0 => match frame.handled_exception().cloned() {
                            Some(exc) => jump_or_exit!(ip, &code, self.unwind(frame, Unroll::Raise(exc))),
                            None => ExcType::runtime_error("No active exception to reraise"),
                        },
                        1 => {
                            let value = frame.pop();
                            try_or_unwind!(self, frame, ip, &code, exceptions::make_exception(value))
                        }
                        2 => {
                            let cause = frame.pop();
                            let value = frame.pop();
                            let exc = try_or_unwind!(self, frame, ip, &code, exceptions::make_exception(value));
                            let cause = try_or_unwind!(self, frame, ip, &code, exceptions::make_cause(cause));
                            exc.set_cause(cause);
                            exc
                        }
                        _ => panic!("RaiseVarargs with {arg} operands in {}", code.qualname()),
                    };
                    jump_or_exit!(ip, &code, self.raise_in_frame(frame, exc));
                }

                // === Jumps ===
                Opcode::JumpForward => ip += index,
                Opcode::JumpAbsolute => ip = index,
                Opcode::PopJumpIfFalse => {
                    if !frame.pop().is_truthy() {
                        ip = index;
                    }
                }
                Opcode::PopJumpIfTrue => {
                    if frame.pop().is_truthy() {
                        ip = index;
                    }
                }
                Opcode::JumpIfFalseOrPop => {
                    if frame.peek().is_truthy() {
                        drop(frame.pop());
                    } else {
                        ip = index;
                    }
                }
                Opcode::JumpIfTrueOrPop => {
                    if frame.peek().is_truthy() {
                        ip = index;
                    } else {
                        drop(frame.pop());
                    }
                }
            }
        }
    }
}

fn unbound_deref(code: &Code, index: usize) -> Exception {
    let name = code.deref_name(index);
    if index < code.ncells() {
        ExcType::unbound_local(name)
    } else {
        ExcType::unbound_free(name)
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Drop for VM<'_, T, P, Tr> {
    fn drop(&mut self) {
        self.run_finalizers();
    }
}

//! Generator, coroutine and async generator behaviour driven through the public VM API.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use ember::{
    ArgValues, CodeBuilder, CodeFlags, CollectStringPrint, ExcType, Exception, Function, GenStep, GeneratorRef,
    GeneratorState, HostObject, Namespace, NoLimitTracker, NoPrint, Opcode, RunResult, VM, Value, host_value,
    tracer::NoopTracer,
};
use pretty_assertions::assert_eq;

/// Unwraps the generator object returned by calling generator-flagged code.
fn generator(value: Value) -> GeneratorRef {
    match value {
        Value::Generator(generator) => generator,
        other => panic!("expected a generator, got {other:?}"),
    }
}

/// Renders a step as `kind:repr` so whole sequences compare in one assertion.
fn step(result: RunResult<GenStep>) -> String {
    match result {
        Ok(GenStep::Yielded(value)) => format!("yield:{}", value.repr()),
        Ok(GenStep::Awaiting(value)) => format!("await:{}", value.repr()),
        Ok(GenStep::Returned(value)) => format!("return:{}", value.repr()),
        Err(exc) => format!("raise:{exc}"),
    }
}

/// `def count(): yield 1; yield 2; return 'done'`
fn count_code() -> Rc<ember::Code> {
    let mut b = CodeBuilder::new("count");
    b.add_flags(CodeFlags::GENERATOR);
    b.load_const(1).emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.load_const(2).emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.load_const("done").return_value();
    Rc::new(b.build().unwrap())
}

/// `def guarded(): try: yield 1 finally: print('cleanup')`
fn guarded_code() -> Rc<ember::Code> {
    let mut b = CodeBuilder::new("guarded");
    b.add_flags(CodeFlags::GENERATOR);
    let handler = b.new_label();
    b.emit_jump(Opcode::SetupFinally, handler);
    b.load_const(1).emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock).emit(Opcode::BeginFinally);
    b.bind(handler);
    b.load_global("print").load_const("cleanup").call(1).emit(Opcode::PopTop);
    b.emit(Opcode::EndFinally);
    b.load_none().return_value();
    Rc::new(b.build().unwrap())
}

#[test]
fn yields_in_order_then_returns() {
    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let generator = generator(vm.invoke(count_code(), Namespace::new(), ArgValues::new()).unwrap());
    assert_eq!(generator.state(), GeneratorState::Fresh);

    let steps: Vec<String> = (0..4).map(|_| step(vm.send(&generator, Value::None))).collect();
    assert_eq!(steps, vec!["yield:1", "yield:2", "return:'done'", "return:None"]);
    assert_eq!(generator.state(), GeneratorState::Finished);
}

#[test]
fn sent_values_become_yield_results() {
    // def echo(): x = yield 1; yield x * 10
    let mut b = CodeBuilder::new("echo");
    b.add_flags(CodeFlags::GENERATOR);
    b.load_const(1).emit(Opcode::YieldValue).store_fast("x");
    b.load_fast("x").load_const(10).emit(Opcode::BinaryMultiply);
    b.emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.load_none().return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let generator = generator(vm.invoke(code, Namespace::new(), ArgValues::new()).unwrap());

    let err = vm.send(&generator, Value::Int(3)).unwrap_err();
    assert_eq!(err.to_string(), "TypeError: can't send non-None value to a just-started generator");

    assert_eq!(step(vm.send(&generator, Value::None)), "yield:1");
    assert_eq!(step(vm.send(&generator, Value::Int(4))), "yield:40");
    assert_eq!(step(vm.send(&generator, Value::None)), "return:None");
}

#[test]
fn close_runs_cleanup_exactly_once() {
    let mut print = CollectStringPrint::new();
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let generator = generator(vm.invoke(guarded_code(), Namespace::new(), ArgValues::new()).unwrap());

    assert_eq!(step(vm.send(&generator, Value::None)), "yield:1");
    vm.close(&generator).unwrap();
    vm.close(&generator).unwrap();
    assert_eq!(generator.state(), GeneratorState::Finished);
    assert_eq!(step(vm.send(&generator, Value::None)), "return:None");
    drop(vm);
    assert_eq!(print.output(), "cleanup\n");
}

#[test]
fn closing_a_fresh_generator_skips_its_body() {
    let mut print = CollectStringPrint::new();
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let generator = generator(vm.invoke(guarded_code(), Namespace::new(), ArgValues::new()).unwrap());
    vm.close(&generator).unwrap();
    assert_eq!(generator.state(), GeneratorState::Finished);
    drop(vm);
    assert_eq!(print.output(), "");
}

#[test]
fn generator_ignoring_generator_exit_is_an_error() {
    // def stubborn():
    //     while True:
    //         try: yield 1
    //         except GeneratorExit: pass
    let mut b = CodeBuilder::new("stubborn");
    b.add_flags(CodeFlags::GENERATOR);
    let top = b.new_label();
    let handler = b.new_label();
    b.bind(top);
    b.load_global("GeneratorExit").emit_jump(Opcode::SetupExcept, handler);
    b.load_const(1).emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock).emit_jump(Opcode::JumpAbsolute, top);
    b.bind(handler);
    b.emit(Opcode::PopTop).emit(Opcode::PopExcept).emit_jump(Opcode::JumpAbsolute, top);
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let generator = generator(vm.invoke(code, Namespace::new(), ArgValues::new()).unwrap());
    assert_eq!(step(vm.send(&generator, Value::None)), "yield:1");
    let err = vm.close(&generator).unwrap_err();
    assert_eq!(err.to_string(), "RuntimeError: generator ignored GeneratorExit");
}

#[test]
fn thrown_exception_can_be_handled_by_the_body() {
    // def catcher():
    //     try: yield 1
    //     except ValueError: yield 'caught'
    //     return 'end'
    let mut b = CodeBuilder::new("catcher");
    b.add_flags(CodeFlags::GENERATOR);
    let handler = b.new_label();
    b.load_global("ValueError").emit_jump(Opcode::SetupExcept, handler);
    b.load_const(1).emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock);
    b.load_const("no error").return_value();
    b.bind(handler);
    b.emit(Opcode::PopTop);
    b.load_const("caught").emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.emit(Opcode::PopExcept);
    b.load_const("end").return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);

    let handled = generator(vm.invoke(code.clone(), Namespace::new(), ArgValues::new()).unwrap());
    assert_eq!(step(vm.send(&handled, Value::None)), "yield:1");
    let thrown = vm.throw(&handled, Exception::new(ExcType::ValueError, "boom"));
    assert_eq!(step(thrown), "yield:'caught'");
    assert_eq!(step(vm.send(&handled, Value::None)), "return:'end'");

    let unhandled = generator(vm.invoke(code, Namespace::new(), ArgValues::new()).unwrap());
    assert_eq!(step(vm.send(&unhandled, Value::None)), "yield:1");
    let thrown = vm.throw(&unhandled, Exception::new(ExcType::TypeError, "wrong"));
    assert_eq!(step(thrown), "raise:TypeError: wrong");
    assert_eq!(unhandled.state(), GeneratorState::Finished);
}

#[test]
fn yield_from_delegates_and_returns_the_inner_result() {
    let globals = Namespace::new();
    globals.set("inner", Value::Function(Rc::new(Function::new(count_code(), globals.clone()))));

    // def outer(): r = yield from inner(); yield r
    let mut b = CodeBuilder::new("outer");
    b.add_flags(CodeFlags::GENERATOR);
    b.load_global("inner").call(0).emit(Opcode::GetYieldFromIter);
    b.load_none().emit(Opcode::YieldFrom);
    b.emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.load_none().return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let outer = generator(vm.invoke(code, globals, ArgValues::new()).unwrap());

    assert_eq!(step(vm.send(&outer, Value::None)), "yield:1");
    let Some(Value::Generator(inner)) = outer.delegate() else {
        panic!("outer should be delegating to inner");
    };
    assert_eq!(inner.state(), GeneratorState::Suspended);
    assert_eq!(step(vm.send(&outer, Value::None)), "yield:2");
    assert_eq!(step(vm.send(&outer, Value::None)), "yield:'done'");
    assert_eq!(inner.state(), GeneratorState::Finished);
    assert!(outer.delegate().is_none());
    assert_eq!(step(vm.send(&outer, Value::None)), "return:None");
}

#[test]
fn throw_is_forwarded_into_the_delegate() {
    let globals = Namespace::new();
    globals.set("inner", Value::Function(Rc::new(Function::new(count_code(), globals.clone()))));

    let mut b = CodeBuilder::new("outer");
    b.add_flags(CodeFlags::GENERATOR);
    b.load_global("inner").call(0).emit(Opcode::GetYieldFromIter);
    b.load_none().emit(Opcode::YieldFrom).return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let outer = generator(vm.invoke(code, globals, ArgValues::new()).unwrap());
    assert_eq!(step(vm.send(&outer, Value::None)), "yield:1");
    let Some(Value::Generator(inner)) = outer.delegate() else {
        panic!("outer should be delegating to inner");
    };

    let thrown = vm.throw(&outer, Exception::new(ExcType::ValueError, "into inner"));
    assert_eq!(step(thrown), "raise:ValueError: into inner");
    assert_eq!(inner.state(), GeneratorState::Finished);
    assert_eq!(outer.state(), GeneratorState::Finished);
}

#[test]
fn stop_iteration_escaping_a_generator_becomes_runtime_error() {
    let mut b = CodeBuilder::new("leaky");
    b.add_flags(CodeFlags::GENERATOR);
    b.load_global("StopIteration").emit_arg(Opcode::RaiseVarargs, 1);
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let generator = generator(vm.invoke(code, Namespace::new(), ArgValues::new()).unwrap());
    let err = vm.send(&generator, Value::None).unwrap_err();
    assert_eq!(err.to_string(), "RuntimeError: generator raised StopIteration");
    let cause = err.cause().expect("StopIteration should be the cause");
    assert_eq!(cause.exc_type(), ExcType::StopIteration);
    assert_eq!(generator.state(), GeneratorState::Finished);
}

#[test]
fn awaited_coroutine_cannot_be_reused() {
    let mut b = CodeBuilder::new("job");
    b.add_flags(CodeFlags::COROUTINE);
    b.load_const(5).return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let coroutine = generator(vm.invoke(code, Namespace::new(), ArgValues::new()).unwrap());
    assert_eq!(step(vm.send(&coroutine, Value::None)), "return:5");
    assert_eq!(
        step(vm.send(&coroutine, Value::None)),
        "raise:RuntimeError: cannot reuse already awaited coroutine"
    );
}

/// An awaitable that suspends `ticks` times before completing.
#[derive(Debug)]
struct Sleep {
    ticks: Cell<u32>,
}

impl HostObject for Sleep {
    fn type_name(&self) -> &str {
        "Sleep"
    }

    fn next(&self) -> RunResult<Option<Value>> {
        let left = self.ticks.get();
        if left == 0 {
            return Ok(None);
        }
        self.ticks.set(left - 1);
        Ok(Some(Value::str("tick")))
    }
}

#[test]
fn async_generator_separates_awaits_from_yields() {
    let globals = Namespace::new();
    globals.set("sleep", host_value(Sleep { ticks: Cell::new(2) }));

    // async def ticker(): await sleep; yield 7
    let mut b = CodeBuilder::new("ticker");
    b.add_flags(CodeFlags::ASYNC_GENERATOR);
    b.load_global("sleep").emit(Opcode::GetAwaitable);
    b.load_none().emit(Opcode::YieldFrom).emit(Opcode::PopTop);
    b.load_const(7).emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.load_none().return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let agen = generator(vm.invoke(code, globals, ArgValues::new()).unwrap());

    let steps: Vec<String> = (0..4).map(|_| step(vm.send(&agen, Value::None))).collect();
    assert_eq!(
        steps,
        vec!["await:'tick'", "await:'tick'", "yield:7", "return:None"]
    );
}

#[test]
fn dropped_suspended_generator_is_finalized() {
    let mut print = CollectStringPrint::new();
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let generator = generator(vm.invoke(guarded_code(), Namespace::new(), ArgValues::new()).unwrap());
    assert_eq!(step(vm.send(&generator, Value::None)), "yield:1");

    drop(generator);
    vm.run_finalizers();
    drop(vm);
    assert_eq!(print.output(), "cleanup\n");
}

#[test]
fn dropped_generator_without_open_blocks_needs_no_finalizer() {
    let mut print = CollectStringPrint::new();
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let generator = generator(vm.invoke(count_code(), Namespace::new(), ArgValues::new()).unwrap());
    assert_eq!(step(vm.send(&generator, Value::None)), "yield:1");
    drop(generator);
    vm.run_finalizers();
    drop(vm);
    assert_eq!(print.output(), "");
}

#[test]
fn generator_methods_are_callable_from_running_code() {
    let globals = Namespace::new();
    globals.set("count", Value::Function(Rc::new(Function::new(count_code(), globals.clone()))));

    // g = count(); first = g.send(None); g.close(); return (first, g.send)
    let mut b = CodeBuilder::new("driver");
    b.load_global("count").call(0).store_fast("g");
    b.load_fast("g").load_attr("send").load_none().call(1).store_fast("first");
    b.load_fast("g").load_attr("close").call(0).emit(Opcode::PopTop);
    b.load_fast("first").load_fast("g").load_attr("gi_running");
    b.emit_arg(Opcode::BuildTuple, 2).return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let result = vm.invoke(code, globals, ArgValues::new()).unwrap();
    assert_eq!(result.repr(), "(1, False)");
}

/// A generator whose body calls `method` on itself: `def me(): yield me.<method>(...)`.
fn reentrant_step(method: &str, argc: u32, load_args: impl FnOnce(&mut CodeBuilder)) -> String {
    let globals = Namespace::new();
    let mut b = CodeBuilder::new("me");
    b.add_flags(CodeFlags::GENERATOR);
    b.load_global("me").load_attr(method);
    load_args(&mut b);
    b.call(argc);
    b.emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.load_none().return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let me = generator(vm.invoke(code, globals.clone(), ArgValues::new()).unwrap());
    globals.set("me", Value::Generator(me.clone()));
    let result = step(vm.send(&me, Value::None));
    assert_eq!(me.state(), GeneratorState::Finished);
    globals.remove("me");
    result
}

#[test]
fn running_generator_rejects_send() {
    assert_eq!(
        reentrant_step("send", 1, |b| {
            b.load_none();
        }),
        "raise:ValueError: generator already executing"
    );
}

#[test]
fn running_generator_rejects_throw() {
    assert_eq!(
        reentrant_step("throw", 1, |b| {
            b.load_global("KeyError");
        }),
        "raise:ValueError: generator already executing"
    );
}

#[test]
fn running_generator_rejects_close() {
    assert_eq!(reentrant_step("close", 0, |_| {}), "raise:ValueError: generator already executing");
}

/// Async context manager whose enter and exit each suspend once.
#[derive(Debug)]
struct AsyncManaged {
    log: Rc<RefCell<Vec<String>>>,
}

impl HostObject for AsyncManaged {
    fn type_name(&self) -> &str {
        "AsyncManaged"
    }

    fn aenter(&self) -> RunResult<Value> {
        self.log.borrow_mut().push("aenter".to_owned());
        Ok(host_value(Sleep { ticks: Cell::new(1) }))
    }

    fn aexit(&self, exc: Option<&Exception>) -> RunResult<Value> {
        let seen = exc.map_or_else(|| "None".to_owned(), |exc| exc.exc_type().name().to_owned());
        self.log.borrow_mut().push(format!("aexit:{seen}"));
        Ok(host_value(Sleep { ticks: Cell::new(1) }))
    }
}

/// `async def f(): async with mgr as x: <body>; return 'done'`, stepped to completion.
fn run_async_with(raising: bool) -> (Vec<String>, Vec<String>) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let globals = Namespace::new();
    globals.set("mgr", host_value(AsyncManaged { log: log.clone() }));

    let mut b = CodeBuilder::new("f");
    b.add_flags(CodeFlags::COROUTINE);
    let cleanup = b.new_label();
    b.load_global("mgr").emit(Opcode::BeforeAsyncWith).emit(Opcode::GetAwaitable);
    b.load_none().emit(Opcode::YieldFrom);
    b.emit_jump(Opcode::SetupAsyncWith, cleanup).store_fast("x");
    if raising {
        b.load_global("ValueError").load_const("inside").call(1).emit_arg(Opcode::RaiseVarargs, 1);
    } else {
        b.emit(Opcode::PopBlock).emit(Opcode::BeginFinally);
    }
    b.bind(cleanup);
    b.emit_arg(Opcode::WithCleanupStart, 1).emit(Opcode::GetAwaitable);
    b.load_none().emit(Opcode::YieldFrom);
    b.emit(Opcode::WithCleanupFinish).emit(Opcode::EndFinally);
    b.load_const("done").return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let coroutine = generator(vm.invoke(code, globals, ArgValues::new()).unwrap());
    let steps = (0..3).map(|_| step(vm.send(&coroutine, Value::None))).collect();
    let log = log.borrow().clone();
    (steps, log)
}

#[test]
fn async_with_awaits_enter_and_exit() {
    let (steps, log) = run_async_with(false);
    assert_eq!(steps, vec!["yield:'tick'", "yield:'tick'", "return:'done'"]);
    assert_eq!(log, vec!["aenter", "aexit:None"]);
}

#[test]
fn async_with_exit_sees_the_exception() {
    let (steps, log) = run_async_with(true);
    assert_eq!(
        steps,
        vec!["yield:'tick'", "yield:'tick'", "raise:ValueError: inside"]
    );
    assert_eq!(log, vec!["aenter", "aexit:ValueError"]);
}

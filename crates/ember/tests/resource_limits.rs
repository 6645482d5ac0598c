//! Resource limits and interrupts enforced at instruction boundaries.

use std::{rc::Rc, time::Duration};

use ember::{
    ArgValues, Code, CodeBuilder, ExcType, Function, InterruptHandle, LimitedTracker, Namespace, NoPrint, Opcode,
    ResourceLimits, VM, Value, tracer::NoopTracer,
};
use pretty_assertions::assert_eq;

/// `while True: pass`
fn spin() -> Code {
    let mut b = CodeBuilder::new("spin");
    let top = b.new_label();
    b.bind(top);
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.build().unwrap()
}

/// `def down(n): return down(n + 1)` registered as a global.
fn runaway(globals: &Namespace) -> Rc<Code> {
    let mut b = CodeBuilder::new("down");
    b.set_params(&["n"], 0, &[]);
    b.load_global("down").load_fast("n").load_const(1).emit(Opcode::BinaryAdd);
    b.call(1).return_value();
    let code = Rc::new(b.build().unwrap());
    let function = Function::new(code.clone(), globals.clone());
    globals.set("down", Value::Function(Rc::new(function)));
    code
}

#[test]
fn operation_limit_stops_an_infinite_loop() {
    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_operations(1000));
    let mut vm = VM::new(tracker, &mut print, NoopTracer);
    let err = vm
        .invoke(Rc::new(spin()), Namespace::new(), ArgValues::new())
        .unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TimeoutError);
    assert!(err.to_string().starts_with("TimeoutError: instruction limit of 1000 exceeded"), "{err}");
    assert_eq!(vm.tracker().instructions_executed(), 1001);
}

#[test]
fn duration_limit_stops_an_infinite_loop() {
    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_duration(Duration::from_millis(20)));
    let mut vm = VM::new(tracker, &mut print, NoopTracer);
    let err = vm
        .invoke(Rc::new(spin()), Namespace::new(), ArgValues::new())
        .unwrap_err();
    assert!(err.to_string().starts_with("TimeoutError: time limit of 20ms exceeded after "), "{err}");
}

#[test]
fn runaway_recursion_is_a_recursion_error() {
    let globals = Namespace::new();
    let code = runaway(&globals);

    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(20));
    let mut vm = VM::new(tracker, &mut print, NoopTracer);
    let err = vm
        .invoke(code, globals.clone(), ArgValues::positional([Value::Int(0)]))
        .unwrap_err();
    assert_eq!(err.exc_type(), ExcType::RecursionError);
    assert_eq!(err.to_string(), "RecursionError: maximum recursion depth exceeded");
    assert_eq!(err.traceback().len(), 20);

    // the VM is left at depth zero and keeps working
    let mut b = CodeBuilder::new("after");
    b.load_const(7).return_value();
    let result = vm.invoke(Rc::new(b.build().unwrap()), globals, ArgValues::new());
    assert_eq!(result.unwrap().repr(), "7");
}

#[test]
fn recursion_error_can_be_caught() {
    // try: down(0)
    // except RecursionError: return 'caught'
    let globals = Namespace::new();
    runaway(&globals);
    let mut b = CodeBuilder::new("guard");
    let handler = b.new_label();
    b.load_global("RecursionError").emit_jump(Opcode::SetupExcept, handler);
    b.load_global("down").load_const(0).call(1).return_value();
    b.bind(handler);
    b.emit(Opcode::PopTop).emit(Opcode::PopExcept);
    b.load_const("caught").return_value();

    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(10).max_memory(1 << 20));
    let mut vm = VM::new(tracker, &mut print, NoopTracer);
    let result = vm.invoke(Rc::new(b.build().unwrap()), globals, ArgValues::new());
    assert_eq!(result.unwrap().repr(), "'caught'");
    assert_eq!(vm.tracker().memory_in_use(), 0);
}

#[test]
fn allocation_limit_is_a_memory_error() {
    // return ((1,), (2,))
    let mut b = CodeBuilder::new("alloc");
    b.load_const(1).emit_arg(Opcode::BuildTuple, 1);
    b.load_const(2).emit_arg(Opcode::BuildTuple, 1);
    b.emit_arg(Opcode::BuildTuple, 2).return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_allocations(2));
    let mut vm = VM::new(tracker, &mut print, NoopTracer);
    let err = vm.invoke(code.clone(), Namespace::new(), ArgValues::new()).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::MemoryError);
    assert!(err.to_string().starts_with("MemoryError: allocation limit of 2 exceeded"), "{err}");

    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_allocations(4));
    let mut vm = VM::new(tracker, &mut print, NoopTracer);
    let result = vm.invoke(code, Namespace::new(), ArgValues::new());
    assert_eq!(result.unwrap().repr(), "((1,), (2,))");
}

#[test]
fn finished_frames_give_their_memory_back() {
    // def leaf(a, b): c = a * b; return c
    // return leaf(6, 7)
    let globals = Namespace::new();
    let mut leaf = CodeBuilder::new("leaf");
    leaf.set_params(&["a", "b"], 0, &[]);
    leaf.load_fast("a").load_fast("b").emit(Opcode::BinaryMultiply).store_fast("c");
    leaf.load_fast("c").return_value();
    let leaf = Function::new(Rc::new(leaf.build().unwrap()), globals.clone());
    globals.set("leaf", Value::Function(Rc::new(leaf)));

    let mut b = CodeBuilder::new("main");
    b.load_global("leaf").load_const(6).load_const(7).call(2).return_value();
    let code = Rc::new(b.build().unwrap());

    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_memory(1 << 16));
    let mut vm = VM::new(tracker, &mut print, NoopTracer);
    for _ in 0..3 {
        let result = vm.invoke(code.clone(), globals.clone(), ArgValues::new());
        assert_eq!(result.unwrap().repr(), "42");
        assert_eq!(vm.tracker().memory_in_use(), 0);
    }
}

#[test]
fn tiny_memory_limit_refuses_the_first_frame() {
    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_memory(1).max_operations(1000));
    let mut vm = VM::new(tracker, &mut print, NoopTracer);
    let err = vm
        .invoke(Rc::new(spin()), Namespace::new(), ArgValues::new())
        .unwrap_err();
    assert_eq!(err.exc_type(), ExcType::MemoryError);
    assert!(err.to_string().starts_with("MemoryError: memory limit of 1 bytes exceeded"), "{err}");
    assert_eq!(vm.tracker().instructions_executed(), 0);
}

#[test]
fn interrupt_raises_keyboard_interrupt_once() {
    let handle = InterruptHandle::new();
    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_operations(10_000));
    let mut vm = VM::new(tracker, &mut print, NoopTracer).with_interrupt(handle.clone());

    handle.interrupt();
    assert!(handle.is_pending());
    let err = vm
        .invoke(Rc::new(spin()), Namespace::new(), ArgValues::new())
        .unwrap_err();
    assert_eq!(err.exc_type(), ExcType::KeyboardInterrupt);
    assert!(!handle.is_pending());
    assert_eq!(vm.tracker().instructions_executed(), 1);

    // with the request consumed the loop runs until the instruction limit
    let err = vm
        .invoke(Rc::new(spin()), Namespace::new(), ArgValues::new())
        .unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TimeoutError);
}

#[test]
fn interrupt_from_another_thread() {
    let handle = InterruptHandle::new();
    let remote = handle.clone();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        remote.interrupt();
    });

    let mut print = NoPrint;
    let tracker = LimitedTracker::new(ResourceLimits::new().max_duration(Duration::from_secs(30)));
    let mut vm = VM::new(tracker, &mut print, NoopTracer).with_interrupt(handle);
    let err = vm
        .invoke(Rc::new(spin()), Namespace::new(), ArgValues::new())
        .unwrap_err();
    waker.join().unwrap();
    assert_eq!(err.exc_type(), ExcType::KeyboardInterrupt);
}

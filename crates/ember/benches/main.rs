use std::rc::Rc;

use criterion::{Bencher, Criterion, black_box, criterion_group, criterion_main};
use ember::{
    ArgValues, Code, CodeBuilder, CodeFlags, CompareOp, Function, Namespace, NoLimitTracker, NoPrint, Opcode, VM,
    Value, tracer::NoopTracer,
};

/// Runs `code` once to check its result, then measures repeated invocations.
fn run_code(bench: &mut Bencher, code: Code, globals: &Namespace, expected: i64) {
    let code = Rc::new(code);
    let mut print = NoPrint;
    let mut vm = VM::new(NoLimitTracker, &mut print, NoopTracer);
    let r = vm.invoke(code.clone(), globals.clone(), ArgValues::new()).unwrap();
    assert!(matches!(r, Value::Int(n) if n == expected), "got {}", r.repr());

    bench.iter(|| {
        let r = vm.invoke(code.clone(), globals.clone(), ArgValues::new()).unwrap();
        black_box(r);
    });
}

/// `total = 0; for i in range(1000): total = total + i; return total`
fn sum_loop() -> Code {
    let mut b = CodeBuilder::new("sum_loop");
    let after = b.new_label();
    let done = b.new_label();
    let top = b.new_label();
    b.load_const(0).store_fast("total");
    b.emit_jump(Opcode::SetupLoop, after);
    b.load_global("range").load_const(1000).call(1).emit(Opcode::GetIter);
    b.bind(top);
    b.emit_jump(Opcode::ForIter, done).store_fast("i");
    b.load_fast("total").load_fast("i").emit(Opcode::BinaryAdd).store_fast("total");
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind(done);
    b.emit(Opcode::PopBlock);
    b.bind(after);
    b.load_fast("total").return_value();
    b.build().unwrap()
}

/// Registers `def fib(n): return n if n < 2 else fib(n - 1) + fib(n - 2)` in `globals`
/// and returns code calling `fib(n)`.
fn fib(globals: &Namespace, n: i64) -> Code {
    let mut b = CodeBuilder::new("fib");
    b.set_params(&["n"], 0, &[]);
    let recurse = b.new_label();
    b.load_fast("n").load_const(2).emit_arg(Opcode::CompareOp, CompareOp::Lt as u32);
    b.emit_jump(Opcode::PopJumpIfFalse, recurse);
    b.load_fast("n").return_value();
    b.bind(recurse);
    b.load_global("fib").load_fast("n").load_const(1).emit(Opcode::BinarySubtract).call(1);
    b.load_global("fib").load_fast("n").load_const(2).emit(Opcode::BinarySubtract).call(1);
    b.emit(Opcode::BinaryAdd).return_value();
    let function = Function::new(Rc::new(b.build().unwrap()), globals.clone());
    globals.set("fib", Value::Function(Rc::new(function)));

    let mut main = CodeBuilder::new("main");
    main.load_global("fib").load_const(n).call(1).return_value();
    main.build().unwrap()
}

/// Registers `def count(n): i = 0; while i < n: yield i; i = i + 1` and returns code summing
/// `count(n)` with a `for` loop.
fn generator_sum(globals: &Namespace, n: i64) -> Code {
    let mut b = CodeBuilder::new("count");
    b.set_params(&["n"], 0, &[]);
    b.add_flags(CodeFlags::GENERATOR);
    let top = b.new_label();
    let done = b.new_label();
    b.load_const(0).store_fast("i");
    b.bind(top);
    b.load_fast("i").load_fast("n").emit_arg(Opcode::CompareOp, CompareOp::Lt as u32);
    b.emit_jump(Opcode::PopJumpIfFalse, done);
    b.load_fast("i").emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.load_fast("i").load_const(1).emit(Opcode::BinaryAdd).store_fast("i");
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind(done);
    b.load_none().return_value();
    let function = Function::new(Rc::new(b.build().unwrap()), globals.clone());
    globals.set("count", Value::Function(Rc::new(function)));

    let mut main = CodeBuilder::new("main");
    let after = main.new_label();
    let exhausted = main.new_label();
    let top = main.new_label();
    main.load_const(0).store_fast("total");
    main.emit_jump(Opcode::SetupLoop, after);
    main.load_global("count").load_const(n).call(1).emit(Opcode::GetIter);
    main.bind(top);
    main.emit_jump(Opcode::ForIter, exhausted).store_fast("v");
    main.load_fast("total").load_fast("v").emit(Opcode::BinaryAdd).store_fast("total");
    main.emit_jump(Opcode::JumpAbsolute, top);
    main.bind(exhausted);
    main.emit(Opcode::PopBlock);
    main.bind(after);
    main.load_fast("total").return_value();
    main.build().unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let globals = Namespace::new();
    c.bench_function("sum_loop_1000", |b| run_code(b, sum_loop(), &globals, 499_500));

    let globals = Namespace::new();
    let code = fib(&globals, 15);
    c.bench_function("fib_15", |b| run_code(b, code.clone(), &globals, 610));

    let globals = Namespace::new();
    let code = generator_sum(&globals, 1000);
    c.bench_function("generator_sum_1000", |b| run_code(b, code.clone(), &globals, 499_500));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

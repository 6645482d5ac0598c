//! Randomized check that the statically computed stack size bounds every execution.
//!
//! Random expression trees are compiled to bytecode, run under a profiling tracer and
//! compared against a direct evaluation of the tree.

use std::rc::Rc;

use ember::{
    ArgValues, CodeBuilder, ExcType, Label, Namespace, NoLimitTracker, NoPrint, Opcode, VM, Value, max_stack_depth,
    tracer::ProfilingTracer,
};
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Debug)]
enum Expr {
    Int(i64),
    Binary(Opcode, Box<Expr>, Box<Expr>),
    /// `then if cond else otherwise`
    IfElse(Box<Expr>, Box<Expr>, Box<Expr>),
}

const OPERATORS: [Opcode; 4] = [
    Opcode::BinaryAdd,
    Opcode::BinarySubtract,
    Opcode::BinaryMultiply,
    Opcode::BinaryFloorDivide,
];

fn random_expr(rng: &mut ChaCha8Rng, depth: u32) -> Expr {
    if depth == 0 || rng.gen_bool(0.25) {
        return Expr::Int(rng.gen_range(-9..=9));
    }
    if rng.gen_bool(0.2) {
        return Expr::IfElse(
            Box::new(random_expr(rng, depth - 1)),
            Box::new(random_expr(rng, depth - 1)),
            Box::new(random_expr(rng, depth - 1)),
        );
    }
    let op = OPERATORS[rng.gen_range(0..OPERATORS.len())];
    Expr::Binary(
        op,
        Box::new(random_expr(rng, depth - 1)),
        Box::new(random_expr(rng, depth - 1)),
    )
}

/// Reference evaluation; `Err` carries the exception type the VM should raise.
fn eval(expr: &Expr) -> Result<i64, ExcType> {
    match expr {
        Expr::Int(n) => Ok(*n),
        Expr::IfElse(cond, then, otherwise) => {
            if eval(cond)? != 0 {
                eval(then)
            } else {
                eval(otherwise)
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let (a, b) = (eval(lhs)?, eval(rhs)?);
            let result = match op {
                Opcode::BinaryAdd => a.checked_add(b),
                Opcode::BinarySubtract => a.checked_sub(b),
                Opcode::BinaryMultiply => a.checked_mul(b),
                _ => {
                    if b == 0 {
                        return Err(ExcType::ZeroDivisionError);
                    }
                    // floor division rounds towards negative infinity
                    a.checked_div(b)
                        .map(|q| if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q })
                }
            };
            result.ok_or(ExcType::OverflowError)
        }
    }
}

fn compile(expr: &Expr, b: &mut CodeBuilder) {
    match expr {
        Expr::Int(n) => {
            b.load_const(*n);
        }
        Expr::Binary(op, lhs, rhs) => {
            compile(lhs, b);
            compile(rhs, b);
            b.emit(*op);
        }
        Expr::IfElse(cond, then, otherwise) => {
            let otherwise_label: Label = b.new_label();
            let end = b.new_label();
            compile(cond, b);
            b.emit_jump(Opcode::PopJumpIfFalse, otherwise_label);
            compile(then, b);
            b.emit_jump(Opcode::JumpForward, end);
            b.bind(otherwise_label);
            compile(otherwise, b);
            b.bind(end);
        }
    }
}

#[test]
fn static_stack_size_bounds_execution() {
    for seed in 0..200 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let expr = random_expr(&mut rng, 6);

        let mut b = CodeBuilder::new("expr");
        compile(&expr, &mut b);
        b.return_value();
        let code = Rc::new(b.build().unwrap_or_else(|err| panic!("seed {seed}: {err}")));
        assert_eq!(
            max_stack_depth(code.bytecode()),
            Ok(u32::try_from(code.stacksize()).unwrap()),
            "seed {seed}"
        );

        let mut print = NoPrint;
        let mut vm = VM::new(NoLimitTracker, &mut print, ProfilingTracer::new());
        let result = vm.invoke(code.clone(), Namespace::new(), ArgValues::new());
        let report = vm.tracer().report();
        assert!(
            report.max_stack_depth <= code.stacksize(),
            "seed {seed}: observed depth {} exceeds declared {}",
            report.max_stack_depth,
            code.stacksize()
        );

        match (eval(&expr), result) {
            (Ok(expected), Ok(Value::Int(actual))) => assert_eq!(actual, expected, "seed {seed}: {expr:?}"),
            (Err(expected), Err(exc)) => assert_eq!(exc.exc_type(), expected, "seed {seed}: {expr:?}"),
            (expected, actual) => panic!("seed {seed}: expected {expected:?}, got {actual:?} for {expr:?}"),
        }
    }
}

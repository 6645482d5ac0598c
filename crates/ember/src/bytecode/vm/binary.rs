//! Unary and binary operators.
//!
//! Integers are fixed-width; any result that would leave `i64` raises `OverflowError`
//! instead of wrapping.

use std::rc::Rc;

use crate::{
    bytecode::Opcode,
    exception::{ExcType, Exception, RunResult},
    value::Value,
};

/// Numeric operand view; bools count as ints.
#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(Self::Float(*f)),
            other => other.as_int().map(Self::Int),
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

fn symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::BinaryPower => "** or pow()",
        Opcode::BinaryMultiply => "*",
        Opcode::BinaryTrueDivide => "/",
        Opcode::BinaryFloorDivide => "//",
        Opcode::BinaryModulo => "%",
        Opcode::BinaryAdd | Opcode::UnaryPositive => "+",
        Opcode::BinarySubtract | Opcode::UnaryNegative => "-",
        Opcode::BinaryLshift => "<<",
        Opcode::BinaryRshift => ">>",
        Opcode::BinaryAnd => "&",
        Opcode::BinaryXor => "^",
        Opcode::BinaryOr => "|",
        Opcode::UnaryInvert => "~",
        _ => "?",
    }
}

fn unsupported(op: Opcode, lhs: &Value, rhs: &Value) -> Exception {
    ExcType::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        symbol(op),
        lhs.type_name(),
        rhs.type_name()
    ))
}

pub(super) fn unary_op(op: Opcode, value: &Value) -> RunResult<Value> {
    let result = match (op, Num::of(value)) {
        (Opcode::UnaryPositive, Some(Num::Int(i))) => Value::Int(i),
        (Opcode::UnaryPositive, Some(Num::Float(f))) => Value::Float(f),
        (Opcode::UnaryNegative, Some(Num::Int(i))) => Value::Int(i.checked_neg().ok_or_else(ExcType::int_overflow)?),
        (Opcode::UnaryNegative, Some(Num::Float(f))) => Value::Float(-f),
        (Opcode::UnaryInvert, Some(Num::Int(i))) => Value::Int(!i),
        _ => {
            return Err(ExcType::type_error(format!(
                "bad operand type for unary {}: '{}'",
                symbol(op),
                value.type_name()
            )));
        }
    };
    Ok(result)
}

pub(super) fn binary_op(op: Opcode, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    if let (Some(a), Some(b)) = (Num::of(lhs), Num::of(rhs)) {
        if let (Value::Bool(x), Value::Bool(y)) = (lhs, rhs) {
            match op {
                Opcode::BinaryAnd => return Ok(Value::Bool(x & y)),
                Opcode::BinaryOr => return Ok(Value::Bool(x | y)),
                Opcode::BinaryXor => return Ok(Value::Bool(x ^ y)),
                _ => {}
            }
        }
        return match (a, b) {
            (Num::Int(x), Num::Int(y)) => int_op(op, x, y).unwrap_or_else(|| Err(unsupported(op, lhs, rhs))),
            _ => float_op(op, a.to_f64(), b.to_f64()).unwrap_or_else(|| Err(unsupported(op, lhs, rhs))),
        };
    }
    match op {
        Opcode::BinaryAdd => concat(lhs, rhs).ok_or_else(|| unsupported(op, lhs, rhs)),
        Opcode::BinaryMultiply => {
            let repeated = match (lhs.as_int(), rhs.as_int()) {
                (None, Some(count)) => repeat(lhs, count),
                (Some(count), None) => repeat(rhs, count),
                _ => None,
            };
            repeated.ok_or_else(|| unsupported(op, lhs, rhs))
        }
        _ => Err(unsupported(op, lhs, rhs)),
    }
}

/// Integer arithmetic; `None` when the operator does not apply to ints.
fn int_op(op: Opcode, a: i64, b: i64) -> Option<RunResult<Value>> {
    let result = match op {
        Opcode::BinaryAdd => a.checked_add(b).ok_or_else(ExcType::int_overflow).map(Value::Int),
        Opcode::BinarySubtract => a.checked_sub(b).ok_or_else(ExcType::int_overflow).map(Value::Int),
        Opcode::BinaryMultiply => a.checked_mul(b).ok_or_else(ExcType::int_overflow).map(Value::Int),
        Opcode::BinaryTrueDivide => {
            if b == 0 {
                Err(ExcType::zero_division("division by zero"))
            } else {
                Ok(Value::Float(a as f64 / b as f64))
            }
        }
        Opcode::BinaryFloorDivide => floor_div(a, b).map(Value::Int),
        Opcode::BinaryModulo => floor_mod(a, b).map(Value::Int),
        Opcode::BinaryPower => int_pow(a, b),
        Opcode::BinaryLshift => shift_left(a, b).map(Value::Int),
        Opcode::BinaryRshift => shift_right(a, b).map(Value::Int),
        Opcode::BinaryAnd => Ok(Value::Int(a & b)),
        Opcode::BinaryOr => Ok(Value::Int(a | b)),
        Opcode::BinaryXor => Ok(Value::Int(a ^ b)),
        _ => return None,
    };
    Some(result)
}

fn float_op(op: Opcode, a: f64, b: f64) -> Option<RunResult<Value>> {
    let result = match op {
        Opcode::BinaryAdd => Ok(a + b),
        Opcode::BinarySubtract => Ok(a - b),
        Opcode::BinaryMultiply => Ok(a * b),
        Opcode::BinaryTrueDivide => {
            if b == 0.0 {
                Err(ExcType::zero_division("float division by zero"))
            } else {
                Ok(a / b)
            }
        }
        Opcode::BinaryFloorDivide => {
            if b == 0.0 {
                Err(ExcType::zero_division("float divmod()"))
            } else {
                Ok((a / b).floor())
            }
        }
        Opcode::BinaryModulo => {
            if b == 0.0 {
                Err(ExcType::zero_division("float modulo"))
            } else {
                let r = a % b;
                Ok(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r })
            }
        }
        Opcode::BinaryPower => {
            if a == 0.0 && b < 0.0 {
                Err(ExcType::zero_division("0.0 cannot be raised to a negative power"))
            } else {
                Ok(a.powf(b))
            }
        }
        _ => return None,
    };
    Some(result.map(Value::Float))
}

fn floor_div(a: i64, b: i64) -> RunResult<i64> {
    if b == 0 {
        return Err(ExcType::zero_division("integer division or modulo by zero"));
    }
    let q = a.checked_div(b).ok_or_else(ExcType::int_overflow)?;
    Ok(if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q })
}

fn floor_mod(a: i64, b: i64) -> RunResult<i64> {
    if b == 0 {
        return Err(ExcType::zero_division("integer division or modulo by zero"));
    }
    let r = a.checked_rem(b).unwrap_or(0);
    Ok(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
}

fn int_pow(base: i64, exp: i64) -> RunResult<Value> {
    if exp < 0 {
        if base == 0 {
            return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
        }
        return Ok(Value::Float((base as f64).powf(exp as f64)));
    }
    u32::try_from(exp)
        .ok()
        .and_then(|exp| base.checked_pow(exp))
        .map(Value::Int)
        .ok_or_else(ExcType::int_overflow)
}

fn shift_left(a: i64, b: i64) -> RunResult<i64> {
    if b < 0 {
        return Err(ExcType::value_error("negative shift count"));
    }
    if a == 0 {
        return Ok(0);
    }
    let shifted = u32::try_from(b).ok().and_then(|bits| a.checked_shl(bits));
    match shifted {
        Some(value) if value >> b == a => Ok(value),
        _ => Err(ExcType::int_overflow()),
    }
}

fn shift_right(a: i64, b: i64) -> RunResult<i64> {
    if b < 0 {
        return Err(ExcType::value_error("negative shift count"));
    }
    Ok(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b })
}

fn concat(lhs: &Value, rhs: &Value) -> Option<Value> {
    Some(match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Value::Str(format!("{a}{b}").into()),
        (Value::Bytes(a), Value::Bytes(b)) => Value::Bytes(a.iter().chain(b.iter()).copied().collect()),
        (Value::Tuple(a), Value::Tuple(b)) => Value::Tuple(a.iter().chain(b.iter()).cloned().collect()),
        (Value::List(a), Value::List(b)) => {
            let items = a.borrow().iter().chain(b.borrow().iter()).cloned().collect();
            Value::list(items)
        }
        _ => return None,
    })
}

fn repeat(seq: &Value, count: i64) -> Option<Value> {
    let count = usize::try_from(count).unwrap_or(0);
    Some(match seq {
        Value::Str(s) => Value::Str(s.repeat(count).into()),
        Value::Bytes(b) => Value::Bytes(Rc::from(b.repeat(count))),
        Value::Tuple(items) => Value::Tuple(repeat_items(items, count).into()),
        Value::List(items) => Value::list(repeat_items(&items.borrow(), count)),
        _ => return None,
    })
}

fn repeat_items(items: &[Value], count: usize) -> Vec<Value> {
    (0..count).flat_map(|_| items.iter().cloned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(op: Opcode, a: i64, b: i64) -> RunResult<Value> {
        binary_op(op, &Value::Int(a), &Value::Int(b))
    }

    #[test]
    fn floor_division_rounds_down() {
        assert!(int(Opcode::BinaryFloorDivide, -7, 2).unwrap().py_eq(&Value::Int(-4)));
        assert!(int(Opcode::BinaryModulo, -7, 2).unwrap().py_eq(&Value::Int(1)));
        assert!(int(Opcode::BinaryModulo, 7, -2).unwrap().py_eq(&Value::Int(-1)));
        let err = int(Opcode::BinaryModulo, 1, 0).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::ZeroDivisionError);
        assert_eq!(err.message(), "integer division or modulo by zero");
    }

    #[test]
    fn overflow_raises_instead_of_wrapping() {
        let err = int(Opcode::BinaryAdd, i64::MAX, 1).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::OverflowError);
        assert!(int(Opcode::BinaryLshift, 1, 63).is_err());
        assert!(int(Opcode::BinaryLshift, 1, 62).unwrap().py_eq(&Value::Int(1 << 62)));
        let err = unary_op(Opcode::UnaryNegative, &Value::Int(i64::MIN)).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::OverflowError);
    }

    #[test]
    fn negative_shift_is_a_value_error() {
        let err = int(Opcode::BinaryRshift, 1, -1).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::ValueError);
        assert!(int(Opcode::BinaryRshift, -5, 100).unwrap().py_eq(&Value::Int(-1)));
    }

    #[test]
    fn sequences_concat_and_repeat() {
        let joined = binary_op(Opcode::BinaryAdd, &Value::str("ab"), &Value::str("cd")).unwrap();
        assert!(joined.py_eq(&Value::str("abcd")));
        let repeated = binary_op(Opcode::BinaryMultiply, &Value::Int(2), &Value::tuple(vec![Value::Int(1)])).unwrap();
        assert_eq!(repeated.repr(), "(1, 1)");
        let err = binary_op(Opcode::BinaryAdd, &Value::Int(1), &Value::str("x")).unwrap_err();
        assert_eq!(err.message(), "unsupported operand type(s) for +: 'int' and 'str'");
    }

    #[test]
    fn mixed_numbers_promote_to_float() {
        let result = binary_op(Opcode::BinaryTrueDivide, &Value::Int(1), &Value::Float(4.0)).unwrap();
        assert!(result.py_eq(&Value::Float(0.25)));
        let result = binary_op(Opcode::BinaryAnd, &Value::Bool(true), &Value::Bool(false)).unwrap();
        assert!(matches!(result, Value::Bool(false)));
        assert!(int(Opcode::BinaryPower, 2, -1).unwrap().py_eq(&Value::Float(0.5)));
    }
}

//! `CompareOp`: rich comparisons, identity, membership and exception matching.

use std::cmp::Ordering;

use super::exceptions::{check_matcher, exception_matches};
use crate::{
    bytecode::CompareOp,
    exception::{ExcType, Exception, RunResult},
    value::Value,
};

pub(super) fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    let result = match op {
        CompareOp::Eq => lhs.py_eq(rhs),
        CompareOp::Ne => !lhs.py_eq(rhs),
        CompareOp::Lt => order(op, lhs, rhs, Ordering::is_lt)?,
        CompareOp::Le => order(op, lhs, rhs, Ordering::is_le)?,
        CompareOp::Gt => order(op, lhs, rhs, Ordering::is_gt)?,
        CompareOp::Ge => order(op, lhs, rhs, Ordering::is_ge)?,
        CompareOp::Is => lhs.is(rhs),
        CompareOp::IsNot => !lhs.is(rhs),
        CompareOp::In => contains(rhs, lhs)?,
        CompareOp::NotIn => !contains(rhs, lhs)?,
        CompareOp::ExcMatch => exc_match(lhs, rhs)?,
    };
    Ok(Value::Bool(result))
}

fn order(op: CompareOp, lhs: &Value, rhs: &Value, test: fn(Ordering) -> bool) -> RunResult<bool> {
    if let Some(ordering) = lhs.py_cmp(rhs) {
        return Ok(test(ordering));
    }
    // NaN compares false every way
    if lhs.as_float().is_some() && rhs.as_float().is_some() {
        return Ok(false);
    }
    Err(ExcType::type_error(format!(
        "'{}' not supported between instances of '{}' and '{}'",
        op_symbol(op),
        lhs.type_name(),
        rhs.type_name()
    )))
}

fn op_symbol(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        _ => "?",
    }
}

/// `item in container`.
fn contains(container: &Value, item: &Value) -> RunResult<bool> {
    match container {
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.contains(&**needle)),
            other => Err(ExcType::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Bytes(bytes) => match item.as_int() {
            Some(byte) => Ok(bytes.iter().any(|b| i64::from(*b) == byte)),
            None => Err(ExcType::type_error("a bytes-like object is required")),
        },
        Value::Tuple(items) => Ok(items.iter().any(|value| value.py_eq(item))),
        Value::List(items) => Ok(items.borrow().iter().any(|value| value.py_eq(item))),
        Value::Dict(map) => Ok(match item {
            Value::Str(key) => map.borrow().contains_key(key),
            _ => false,
        }),
        Value::Range(range) => Ok(item.as_int().is_some_and(|value| range.contains(value))),
        other => Err(ExcType::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// The test an `except` clause performs against the exception being handled.
fn exc_match(exc: &Value, matcher: &Value) -> RunResult<bool> {
    check_matcher(matcher)?;
    Ok(match exc {
        Value::Exception(exc) => exception_matches(exc, matcher),
        Value::ExcClass(exc_type) => exception_matches(&Exception::new_none(*exc_type), matcher),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_errors_name_both_types() {
        let err = compare(CompareOp::Lt, &Value::Int(1), &Value::str("a")).unwrap_err();
        assert_eq!(err.message(), "'<' not supported between instances of 'int' and 'str'");
    }

    #[test]
    fn membership() {
        let list = Value::list(vec![Value::Int(1), Value::Float(2.0)]);
        assert!(matches!(compare(CompareOp::In, &Value::Int(2), &list), Ok(Value::Bool(true))));
        assert!(matches!(
            compare(CompareOp::NotIn, &Value::str("z"), &Value::str("abc")),
            Ok(Value::Bool(true))
        ));
        let err = compare(CompareOp::In, &Value::Int(1), &Value::str("abc")).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::TypeError);
        let err = compare(CompareOp::In, &Value::Int(1), &Value::Int(2)).unwrap_err();
        assert_eq!(err.message(), "argument of type 'int' is not iterable");
    }

    #[test]
    fn exception_matching_walks_the_hierarchy() {
        let exc = Value::Exception(Exception::new_none(ExcType::KeyError));
        let matcher = Value::tuple(vec![Value::ExcClass(ExcType::TypeError), Value::ExcClass(ExcType::LookupError)]);
        assert!(matches!(compare(CompareOp::ExcMatch, &exc, &matcher), Ok(Value::Bool(true))));
        assert!(compare(CompareOp::ExcMatch, &exc, &Value::Int(3)).is_err());
    }
}

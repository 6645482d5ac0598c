//! `LoadAttr`/`StoreAttr` for builtin values. Host objects answer for themselves.

use std::rc::Rc;

use crate::{
    exception::{ExcType, Exception, RunResult},
    types::{GeneratorMethod, GeneratorState},
    value::Value,
};

fn str_tuple(names: &[Rc<str>]) -> Value {
    Value::tuple(names.iter().cloned().map(Value::Str).collect())
}

fn opt_exception(exc: Option<Exception>) -> Value {
    exc.map_or(Value::None, Value::Exception)
}

pub(super) fn get_attr(object: &Value, name: &str) -> RunResult<Value> {
    let found = match (object, name) {
        (Value::Host(host), _) => return host.get_attr(name),

        (Value::Generator(generator), "send") => Some(Value::GeneratorMethod(generator.clone(), GeneratorMethod::Send)),
        (Value::Generator(generator), "throw") => {
            Some(Value::GeneratorMethod(generator.clone(), GeneratorMethod::Throw))
        }
        (Value::Generator(generator), "close") => {
            Some(Value::GeneratorMethod(generator.clone(), GeneratorMethod::Close))
        }
        (Value::Generator(generator), "__name__") => Some(Value::Str(generator.name())),
        (Value::Generator(generator), "__qualname__") => Some(Value::Str(generator.qualname())),
        (Value::Generator(generator), "gi_code" | "cr_code" | "ag_code") => Some(Value::Code(generator.code())),
        (Value::Generator(generator), "gi_running" | "cr_running" | "ag_running") => Some(Value::Bool(
            generator.state() == GeneratorState::Running,
        )),
        (Value::Generator(generator), "gi_yieldfrom" | "cr_await") => Some(generator.delegate().unwrap_or(Value::None)),

        (Value::Exception(exc), "args") => Some(Value::tuple(exc.args().to_vec())),
        (Value::Exception(exc), "value") if exc.exc_type() == ExcType::StopIteration => Some(exc.value()),
        (Value::Exception(exc), "__cause__") => Some(opt_exception(exc.cause())),
        (Value::Exception(exc), "__context__") => Some(opt_exception(exc.context())),
        (Value::Exception(exc), "__suppress_context__") => Some(Value::Bool(exc.suppress_context())),
        (Value::ExcClass(exc_type), "__name__" | "__qualname__") => Some(Value::str(exc_type.name())),

        (Value::Function(function), "__name__") => Some(Value::str(function.name())),
        (Value::Function(function), "__qualname__") => Some(Value::str(function.qualname())),
        (Value::Function(function), "__code__") => Some(Value::Code(function.code().clone())),
        (Value::Function(function), "__defaults__") => Some(if function.defaults().is_empty() {
            Value::None
        } else {
            Value::tuple(function.defaults().to_vec())
        }),
        (Value::Function(function), "__closure__") => Some(if function.closure().is_empty() {
            Value::None
        } else {
            Value::tuple(function.closure().iter().cloned().map(Value::Cell).collect())
        }),

        (Value::Code(code), "co_name") => Some(Value::Str(code.name().clone())),
        (Value::Code(code), "co_qualname") => Some(Value::Str(code.qualname().clone())),
        (Value::Code(code), "co_filename") => Some(Value::Str(code.filename().clone())),
        (Value::Code(code), "co_firstlineno") => Some(Value::Int(i64::from(code.first_line()))),
        (Value::Code(code), "co_flags") => Some(Value::Int(i64::from(code.flags().bits()))),
        (Value::Code(code), "co_argcount") => Some(count(code.argcount())),
        (Value::Code(code), "co_posonlyargcount") => Some(count(code.posonlyargcount())),
        (Value::Code(code), "co_kwonlyargcount") => Some(count(code.kwonlyargcount())),
        (Value::Code(code), "co_nlocals") => Some(count(code.nlocals())),
        (Value::Code(code), "co_stacksize") => Some(count(code.stacksize())),
        (Value::Code(code), "co_varnames") => Some(str_tuple(code.varnames())),
        (Value::Code(code), "co_names") => Some(str_tuple(code.names())),
        (Value::Code(code), "co_cellvars") => Some(str_tuple(code.cellvars())),
        (Value::Code(code), "co_freevars") => Some(str_tuple(code.freevars())),
        (Value::Code(code), "co_code") => Some(Value::Bytes(code.bytecode().into())),
        (Value::Code(code), "co_consts") => Some(Value::tuple(code.constants().iter().map(Value::from_constant).collect())),

        (Value::Cell(cell), "cell_contents") => match cell.get() {
            Some(value) => Some(value),
            None => return Err(ExcType::value_error("Cell is empty")),
        },

        (Value::Range(range), "start") => Some(Value::Int(range.start)),
        (Value::Range(range), "stop") => Some(Value::Int(range.stop)),
        (Value::Range(range), "step") => Some(Value::Int(range.step)),
        _ => None,
    };
    found.ok_or_else(|| ExcType::attribute_error(object.type_name(), name))
}

pub(super) fn set_attr(object: &Value, name: &str, value: Value) -> RunResult<()> {
    match (object, name) {
        (Value::Host(host), _) => host.set_attr(name, value),
        (Value::Cell(cell), "cell_contents") => {
            cell.set(value);
            Ok(())
        }
        (Value::Exception(exc), "__cause__") => match value {
            Value::None => {
                exc.set_cause(None);
                Ok(())
            }
            Value::Exception(cause) => {
                exc.set_cause(Some(cause));
                Ok(())
            }
            _ => Err(ExcType::type_error("exception cause must be None or derive from BaseException")),
        },
        (Value::Exception(exc), "__context__") => match value {
            Value::Exception(context) => {
                exc.set_context(context);
                Ok(())
            }
            _ => Err(ExcType::type_error("exception context must derive from BaseException")),
        },
        _ => Err(ExcType::attribute_error(object.type_name(), name)),
    }
}

fn count(n: usize) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellFamily, CellRef};

    #[test]
    fn cell_contents_round_trip() {
        let cell = Value::Cell(CellRef::new(Rc::new(CellFamily::new("x".into())), None));
        let err = get_attr(&cell, "cell_contents").unwrap_err();
        assert_eq!(err.message(), "Cell is empty");
        set_attr(&cell, "cell_contents", Value::Int(4)).unwrap();
        assert!(get_attr(&cell, "cell_contents").unwrap().py_eq(&Value::Int(4)));
    }

    #[test]
    fn missing_attribute_names_the_type() {
        let err = get_attr(&Value::Int(1), "real").unwrap_err();
        assert_eq!(err.exc_type(), ExcType::AttributeError);
        assert_eq!(err.message(), "'int' object has no attribute 'real'");
    }
}

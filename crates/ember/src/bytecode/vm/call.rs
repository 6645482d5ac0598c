//! Calling values: functions, builtins, exception classes, generator methods and host
//! objects, plus `MakeFunction`.

use std::rc::Rc;

use super::{
    Frame, GenStep, VM,
    collections::{Next, get_iter},
};
use crate::{
    args::ArgValues,
    builtins::Builtins,
    bytecode::MakeFunctionFlags,
    exception::{ExcType, Exception, RunResult},
    function::Function,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{GeneratorKind, GeneratorMethod, GeneratorRef, Range},
    value::{DictMap, Value},
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn call_value(&mut self, callable: &Value, args: ArgValues) -> RunResult<Value> {
        match callable {
            Value::Function(function) => self.call_function(function, args),
            Value::Builtin(builtin) => self.call_builtin(*builtin, args),
            Value::ExcClass(exc_type) => {
                args.reject_keywords(exc_type.name())?;
                Ok(Value::Exception(Exception::with_args(
                    *exc_type,
                    args.positional.into_vec(),
                )))
            }
            Value::GeneratorMethod(generator, method) => self.call_generator_method(generator, *method, args),
            Value::Host(host) => host.call(args),
            other => Err(ExcType::not_callable(other.type_name())),
        }
    }

    /// Binds `args`, builds the frame and runs it (or wraps it in a generator).
    pub(super) fn call_function(&mut self, function: &Function, args: ArgValues) -> RunResult<Value> {
        let locals = function.bind(args)?;
        let frame = self.new_frame(
            function.code().clone(),
            function.globals().clone(),
            locals,
            function.closure(),
        )?;
        self.run_frame(frame)
    }

    /// `CallFunctionKw`: the trailing `names.len()` values are keyword arguments.
    pub(super) fn call_with_keywords(
        &mut self,
        callable: &Value,
        mut values: Vec<Value>,
        names: &Value,
    ) -> RunResult<Value> {
        let Value::Tuple(names) = names else {
            panic!("CallFunctionKw expects a tuple of names, found {names:?}");
        };
        assert!(names.len() <= values.len(), "more keyword names than arguments");
        let keywords = values.split_off(values.len() - names.len());
        let mut args = ArgValues::positional(values);
        for (name, value) in names.iter().zip(keywords) {
            let Value::Str(name) = name else {
                panic!("keyword name {name:?} is not a string");
            };
            args.keywords.push((name.clone(), value));
        }
        self.call_value(callable, args)
    }

    fn call_builtin(&mut self, builtin: Builtins, args: ArgValues) -> RunResult<Value> {
        match builtin {
            Builtins::Print => self.builtin_print(args),
            Builtins::Len => builtin_len(&args.get_one_arg("len")?),
            Builtins::Iter => get_iter(args.get_one_arg("iter")?),
            Builtins::Next => {
                let (iterator, default) = args.get_one_two_args("next")?;
                match self.iter_next(&iterator)? {
                    Next::Item(value) => Ok(value),
                    Next::Done(value) => default.ok_or_else(|| Exception::stop_iteration(value)),
                }
            }
            Builtins::List => {
                let items = match args.get_zero_one_arg("list")? {
                    Some(iterable) => self.collect_iterable(iterable)?,
                    None => Vec::new(),
                };
                self.track_container(items.len())?;
                Ok(Value::list(items))
            }
            Builtins::Tuple => {
                let items = match args.get_zero_one_arg("tuple")? {
                    Some(iterable) => self.collect_iterable(iterable)?,
                    None => Vec::new(),
                };
                self.track_container(items.len())?;
                Ok(Value::tuple(items))
            }
            Builtins::Range => builtin_range(args),
            Builtins::Repr => Ok(Value::str(&args.get_one_arg("repr")?.repr())),
            Builtins::Str => Ok(match args.get_zero_one_arg("str")? {
                Some(value) => Value::str(&value.py_str()),
                None => Value::str(""),
            }),
            Builtins::Isinstance => {
                let (object, classinfo) = args.get_two_args("isinstance")?;
                builtin_isinstance(&object, &classinfo).map(Value::Bool)
            }
            // only reached outside a frame; the dispatch loop answers `locals()` itself
            Builtins::Locals => {
                args.check_zero_args("locals")?;
                Ok(Value::dict(DictMap::default()))
            }
        }
    }

    fn builtin_print(&mut self, mut args: ArgValues) -> RunResult<Value> {
        let mut sep = None;
        let mut end = None;
        for (name, value) in std::mem::take(&mut args.keywords) {
            let slot = match &*name {
                "sep" => &mut sep,
                "end" => &mut end,
                other => {
                    return Err(ExcType::type_error(format!(
                        "'{other}' is an invalid keyword argument for print()"
                    )));
                }
            };
            *slot = match value {
                Value::None => None,
                Value::Str(text) => Some(text),
                other => {
                    return Err(ExcType::type_error(format!(
                        "{name} must be None or a string, not {}",
                        other.type_name()
                    )));
                }
            };
        }
        for (index, value) in args.positional.iter().enumerate() {
            if index > 0 {
                self.print_writer.write(sep.as_deref().unwrap_or(" "))?;
            }
            self.print_writer.write(&value.py_str())?;
        }
        self.print_writer.write(end.as_deref().unwrap_or("\n"))?;
        self.print_writer.flush()?;
        Ok(Value::None)
    }

    fn call_generator_method(
        &mut self,
        generator: &GeneratorRef,
        method: GeneratorMethod,
        args: ArgValues,
    ) -> RunResult<Value> {
        let step = match method {
            GeneratorMethod::Send => {
                let value = args.get_one_arg("send")?;
                self.gen_send(generator, value)?
            }
            GeneratorMethod::Throw => {
                let (kind, value) = args.get_one_two_args("throw")?;
                let exc = throw_argument(kind, value)?;
                self.gen_throw(generator, exc, true)?
            }
            GeneratorMethod::Close => {
                args.check_zero_args("close")?;
                self.gen_close(generator)?;
                return Ok(Value::None);
            }
        };
        step_value(generator.kind(), step)
    }

    /// `MakeFunction`: pops the code object and the extras `flags` announces.
    ///
    /// The operands are compiler output; a malformed stack here means corrupt bytecode.
    pub(super) fn make_function(&mut self, frame: &mut Frame, flags: u32) -> Value {
        let code = match frame.pop() {
            Value::Code(code) => code,
            other => panic!("MakeFunction expects a code object, found {other:?}"),
        };
        let closure = if flags & MakeFunctionFlags::CLOSURE == 0 {
            Vec::new()
        } else {
            match frame.pop() {
                Value::Tuple(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::Cell(cell) => cell.clone(),
                        other => panic!("closure tuple holds {other:?} instead of a cell"),
                    })
                    .collect(),
                other => panic!("MakeFunction expects a closure tuple, found {other:?}"),
            }
        };
        let kwdefaults = if flags & MakeFunctionFlags::KW_DEFAULTS == 0 {
            None
        } else {
            match frame.pop() {
                Value::Dict(map) => Some(map.borrow().clone()),
                other => panic!("MakeFunction expects a keyword-defaults dict, found {other:?}"),
            }
        };
        let defaults = if flags & MakeFunctionFlags::DEFAULTS == 0 {
            Vec::new()
        } else {
            match frame.pop() {
                Value::Tuple(items) => items.to_vec(),
                other => panic!("MakeFunction expects a defaults tuple, found {other:?}"),
            }
        };
        self.tracer.on_make_function(closure.len(), defaults.len());

        let mut function = Function::new(code, frame.globals().clone())
            .with_defaults(defaults)
            .with_closure(closure);
        if let Some(kwdefaults) = kwdefaults {
            function = function.with_kwdefaults(kwdefaults);
        }
        Value::Function(Rc::new(function))
    }
}

/// What `send`/`throw` hand back to running code: the yielded value, or the matching
/// stop exception once the generator finishes.
fn step_value(kind: GeneratorKind, step: GenStep) -> RunResult<Value> {
    match step {
        GenStep::Yielded(value) | GenStep::Awaiting(value) => Ok(value),
        GenStep::Returned(_) if kind == GeneratorKind::AsyncGenerator => {
            Err(Exception::new_none(ExcType::StopAsyncIteration))
        }
        GenStep::Returned(value) => Err(Exception::stop_iteration(value)),
    }
}

/// Normalizes the arguments of `generator.throw(type[, value])`.
fn throw_argument(kind: Value, value: Option<Value>) -> RunResult<Exception> {
    let value = value.filter(|value| !value.is_none());
    match (kind, value) {
        (Value::ExcClass(exc_type), None) => Ok(Exception::new_none(exc_type)),
        (Value::ExcClass(exc_type), Some(Value::Exception(exc))) if exc.matches(exc_type) => Ok(exc),
        (Value::ExcClass(exc_type), Some(value)) => Ok(Exception::with_args(exc_type, vec![value])),
        (Value::Exception(exc), None) => Ok(exc),
        (Value::Exception(_), Some(_)) => Err(ExcType::type_error(
            "instance exception may not have a separate value",
        )),
        (other, _) => Err(ExcType::type_error(format!(
            "exceptions must be classes or instances deriving from BaseException, not {}",
            other.type_name()
        ))),
    }
}

fn builtin_len(value: &Value) -> RunResult<Value> {
    let len = match value {
        Value::Str(text) => text.chars().count(),
        Value::Bytes(bytes) => bytes.len(),
        Value::Tuple(items) => items.len(),
        Value::List(items) => items.borrow().len(),
        Value::Dict(map) => map.borrow().len(),
        Value::Range(range) => range.len(),
        other => {
            return Err(ExcType::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(i64::try_from(len).map_err(|_| ExcType::int_overflow())?))
}

fn builtin_range(args: ArgValues) -> RunResult<Value> {
    args.reject_keywords("range")?;
    let mut bounds = Vec::with_capacity(3);
    for value in &args.positional {
        match value.as_int() {
            Some(bound) => bounds.push(bound),
            None => {
                return Err(ExcType::type_error(format!(
                    "'{}' object cannot be interpreted as an integer",
                    value.type_name()
                )));
            }
        }
    }
    let range = match bounds.as_slice() {
        [stop] => Range::new(0, *stop, 1)?,
        [start, stop] => Range::new(*start, *stop, 1)?,
        [start, stop, step] => Range::new(*start, *stop, *step)?,
        [] => return Err(ExcType::type_error("range expected at least 1 argument, got 0")),
        _ => {
            return Err(ExcType::type_error(format!(
                "range expected at most 3 arguments, got {}",
                bounds.len()
            )));
        }
    };
    Ok(Value::Range(range))
}

fn builtin_isinstance(object: &Value, classinfo: &Value) -> RunResult<bool> {
    match classinfo {
        Value::ExcClass(exc_type) => Ok(matches!(object, Value::Exception(exc) if exc.matches(*exc_type))),
        Value::Tuple(items) => {
            for item in items.iter() {
                if builtin_isinstance(object, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(ExcType::type_error(
            "isinstance() arg 2 must be a type or tuple of types",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throw_arguments_normalize() {
        let exc = throw_argument(Value::ExcClass(ExcType::ValueError), Some(Value::str("bad"))).unwrap();
        assert_eq!(exc.exc_type(), ExcType::ValueError);
        assert_eq!(exc.message(), "bad");

        let instance = Exception::new_none(ExcType::KeyError);
        let err = throw_argument(Value::Exception(instance), Some(Value::Int(1))).unwrap_err();
        assert_eq!(err.message(), "instance exception may not have a separate value");

        assert!(throw_argument(Value::Int(3), None).is_err());
    }

    #[test]
    fn len_and_range() {
        assert!(builtin_len(&Value::str("héllo")).unwrap().py_eq(&Value::Int(5)));
        assert!(builtin_len(&Value::Int(1)).is_err());
        let range = builtin_range(ArgValues::positional([Value::Int(1), Value::Int(7), Value::Int(2)])).unwrap();
        assert!(builtin_len(&range).unwrap().py_eq(&Value::Int(3)));
    }

    #[test]
    fn isinstance_checks_exception_classes() {
        let exc = Value::Exception(Exception::new_none(ExcType::ZeroDivisionError));
        assert!(builtin_isinstance(&exc, &Value::ExcClass(ExcType::ArithmeticError)).unwrap());
        assert!(!builtin_isinstance(&Value::Int(1), &Value::ExcClass(ExcType::Exception)).unwrap());
        assert!(builtin_isinstance(&exc, &Value::Int(1)).is_err());
    }
}

//! Embedder-supplied objects.
//!
//! The VM only models builtin values. Anything richer (user classes,
//! resources, awaitable primitives) is provided by the embedder as a [`HostObject`], and the
//! dispatch loop reaches it through this trait for attribute access, calls, the
//! context-manager protocols and iteration.

use std::{fmt, rc::Rc};

use crate::{
    args::ArgValues,
    exception::{ExcType, Exception, RunResult},
    value::Value,
};

/// Behaviour of an embedder-supplied object.
///
/// Every protocol method defaults to the error running code would see for an object
/// that does not support it.
pub trait HostObject: fmt::Debug {
    /// Name reported by `type(obj).__name__`-style messages.
    fn type_name(&self) -> &str;

    fn repr(&self) -> String {
        format!("<{} object>", self.type_name())
    }

    fn is_truthy(&self) -> bool {
        true
    }

    fn get_attr(&self, name: &str) -> RunResult<Value> {
        Err(ExcType::attribute_error(self.type_name(), name))
    }

    fn set_attr(&self, name: &str, _value: Value) -> RunResult<()> {
        Err(ExcType::attribute_error(self.type_name(), name))
    }

    fn call(&self, _args: ArgValues) -> RunResult<Value> {
        Err(ExcType::not_callable(self.type_name()))
    }

    /// `__enter__`: the value bound by `with obj as x`.
    fn enter(&self) -> RunResult<Value> {
        Err(ExcType::attribute_error(self.type_name(), "__enter__"))
    }

    /// `__exit__`: receives the exception leaving the block, if any. Returning true
    /// suppresses it.
    fn exit(&self, _exc: Option<&Exception>) -> RunResult<bool> {
        Err(ExcType::attribute_error(self.type_name(), "__exit__"))
    }

    /// `__aenter__`: an awaitable whose result is bound by `async with obj as x`.
    fn aenter(&self) -> RunResult<Value> {
        Err(ExcType::attribute_error(self.type_name(), "__aenter__"))
    }

    /// `__aexit__`: an awaitable whose truthy result suppresses the exception.
    fn aexit(&self, _exc: Option<&Exception>) -> RunResult<Value> {
        Err(ExcType::attribute_error(self.type_name(), "__aexit__"))
    }

    /// `__next__`: `Ok(None)` when exhausted. Host objects are their own iterators.
    fn next(&self) -> RunResult<Option<Value>> {
        Err(ExcType::not_iterable(self.type_name()))
    }
}

/// Wraps a host object as a value.
pub fn host_value(object: impl HostObject + 'static) -> Value {
    Value::Host(Rc::new(object))
}

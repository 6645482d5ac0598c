//! Exception values raised and caught by running code.
//!
//! [`ExcType`] is the closed set of exception classes the VM knows about, arranged in the
//! usual single-inheritance hierarchy rooted at `BaseException`. [`Exception`] is a shared
//! handle to one raised exception instance: cloning it never copies the payload, so
//! identity is preserved when an exception is caught, stored in a variable and re-raised.

use std::{
    cell::{Cell, RefCell},
    fmt::{self, Display},
    rc::Rc,
};

use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumIter, EnumString, IntoStaticStr};

use crate::value::Value;

/// Result type used by every fallible operation that can raise into running code.
pub type RunResult<T> = Result<T, Exception>;

/// Built-in exception classes.
///
/// Variant names are the class names exactly as code sees them.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    StrumDisplay,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum ExcType {
    BaseException,
    GeneratorExit,
    KeyboardInterrupt,
    SystemExit,
    Exception,
    StopIteration,
    StopAsyncIteration,
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,
    AssertionError,
    AttributeError,
    LookupError,
    IndexError,
    KeyError,
    MemoryError,
    NameError,
    UnboundLocalError,
    RuntimeError,
    NotImplementedError,
    RecursionError,
    TimeoutError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Direct base class, `None` only for `BaseException`.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        Some(match self {
            Self::BaseException => return None,
            Self::GeneratorExit | Self::KeyboardInterrupt | Self::SystemExit | Self::Exception => {
                Self::BaseException
            }
            Self::StopIteration
            | Self::StopAsyncIteration
            | Self::ArithmeticError
            | Self::AssertionError
            | Self::AttributeError
            | Self::LookupError
            | Self::MemoryError
            | Self::NameError
            | Self::RuntimeError
            | Self::TimeoutError
            | Self::TypeError
            | Self::ValueError => Self::Exception,
            Self::OverflowError | Self::ZeroDivisionError => Self::ArithmeticError,
            Self::IndexError | Self::KeyError => Self::LookupError,
            Self::UnboundLocalError => Self::NameError,
            Self::NotImplementedError | Self::RecursionError => Self::RuntimeError,
        })
    }

    /// Whether an exception of type `self` would be caught by a handler for `handler_type`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty == handler_type {
                return true;
            }
            current = ty.parent();
        }
        false
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub(crate) fn type_error(msg: impl Display) -> Exception {
        Exception::new(Self::TypeError, msg.to_string())
    }

    pub(crate) fn value_error(msg: impl Display) -> Exception {
        Exception::new(Self::ValueError, msg.to_string())
    }

    pub(crate) fn runtime_error(msg: impl Display) -> Exception {
        Exception::new(Self::RuntimeError, msg.to_string())
    }

    pub(crate) fn name_error(name: &str) -> Exception {
        Exception::new(Self::NameError, format!("name '{name}' is not defined"))
    }

    pub(crate) fn unbound_local(name: &str) -> Exception {
        Exception::new(
            Self::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    pub(crate) fn unbound_free(name: &str) -> Exception {
        Exception::new(
            Self::NameError,
            format!("free variable '{name}' referenced before assignment in enclosing scope"),
        )
    }

    pub(crate) fn attribute_error(type_name: impl Display, attr: &str) -> Exception {
        Exception::new(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    pub(crate) fn not_callable(type_name: &str) -> Exception {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    pub(crate) fn not_iterable(type_name: &str) -> Exception {
        Self::type_error(format!("'{type_name}' object is not iterable"))
    }

    pub(crate) fn not_an_iterator(type_name: &str) -> Exception {
        Self::type_error(format!("'{type_name}' object is not an iterator"))
    }

    pub(crate) fn not_subscriptable(type_name: &str) -> Exception {
        Self::type_error(format!("'{type_name}' object is not subscriptable"))
    }

    pub(crate) fn zero_division(msg: &str) -> Exception {
        Exception::new(Self::ZeroDivisionError, msg)
    }

    pub(crate) fn int_overflow() -> Exception {
        Exception::new(Self::OverflowError, "integer overflow")
    }

    pub(crate) fn index_out_of_range(type_name: &str) -> Exception {
        Exception::new(Self::IndexError, format!("{type_name} index out of range"))
    }

    pub(crate) fn key_error(key: &Value) -> Exception {
        Exception::new(Self::KeyError, key.repr())
    }

    pub(crate) fn arg_count(name: &str, expected: usize, actual: usize) -> Exception {
        if expected == 1 {
            Self::type_error(format!("{name}() takes exactly one argument ({actual} given)"))
        } else {
            Self::type_error(format!(
                "{name}() takes exactly {expected} arguments ({actual} given)"
            ))
        }
    }

    pub(crate) fn generator_already_executing(kind_name: &str) -> Exception {
        Self::value_error(format!("{kind_name} already executing"))
    }
}

/// One frame's worth of traceback, recorded as an exception passes through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    pub name: Rc<str>,
    pub filename: Rc<str>,
    pub line: u32,
}

impl Display for TracebackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  File \"{}\", line {}, in {}", self.filename, self.line, self.name)
    }
}

#[derive(Debug)]
struct ExceptionData {
    exc_type: ExcType,
    args: Vec<Value>,
    cause: RefCell<Option<Exception>>,
    context: RefCell<Option<Exception>>,
    suppress_context: Cell<bool>,
    traceback: RefCell<Vec<TracebackEntry>>,
}

/// A raised (or raisable) exception instance.
///
/// This is a reference-counted handle; `clone` produces another reference to the same
/// instance and [`Exception::is_same`] compares identity.
#[derive(Clone)]
pub struct Exception(Rc<ExceptionData>);

impl Exception {
    /// Creates an exception carrying a single message argument.
    pub fn new(exc_type: ExcType, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::with_args(exc_type, vec![Value::Str(message.into())])
    }

    /// Creates an exception with no arguments, e.g. a bare `raise GeneratorExit`.
    #[must_use]
    pub fn new_none(exc_type: ExcType) -> Self {
        Self::with_args(exc_type, Vec::new())
    }

    /// Creates an exception from constructor arguments, as `ExcType(*args)` would.
    #[must_use]
    pub fn with_args(exc_type: ExcType, args: Vec<Value>) -> Self {
        Self(Rc::new(ExceptionData {
            exc_type,
            args,
            cause: RefCell::new(None),
            context: RefCell::new(None),
            suppress_context: Cell::new(false),
            traceback: RefCell::new(Vec::new()),
        }))
    }

    /// `StopIteration(value)`, the way a finished generator reports its return value.
    #[must_use]
    pub fn stop_iteration(value: Value) -> Self {
        if value.is_none() {
            Self::new_none(ExcType::StopIteration)
        } else {
            Self::with_args(ExcType::StopIteration, vec![value])
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.0.exc_type
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.0.args
    }

    /// The message as `str(exc)` would render it.
    #[must_use]
    pub fn message(&self) -> String {
        match self.0.args.as_slice() {
            [] => String::new(),
            [single] => single.py_str(),
            many => Value::Tuple(many.iter().cloned().collect()).repr(),
        }
    }

    /// The `value` attribute of `StopIteration`: first argument or `None`.
    #[must_use]
    pub fn value(&self) -> Value {
        self.0.args.first().cloned().unwrap_or(Value::None)
    }

    /// Whether this exception would be caught by `except handler_type`.
    #[must_use]
    pub fn matches(&self, handler_type: ExcType) -> bool {
        self.0.exc_type.is_subclass_of(handler_type)
    }

    /// Identity comparison (`a is b`).
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn cause(&self) -> Option<Self> {
        self.0.cause.borrow().clone()
    }

    /// Sets `__cause__` (from `raise ... from ...`), which also suppresses the context.
    pub fn set_cause(&self, cause: Option<Self>) {
        *self.0.cause.borrow_mut() = cause;
        self.0.suppress_context.set(true);
    }

    #[must_use]
    pub fn context(&self) -> Option<Self> {
        self.0.context.borrow().clone()
    }

    #[must_use]
    pub fn suppress_context(&self) -> bool {
        self.0.suppress_context.get()
    }

    /// Sets `__context__` to the exception that was being handled when this one was raised.
    ///
    /// A context chain that would lead back to `self` is cut where it would loop.
    pub fn set_context(&self, context: Self) {
        if context.is_same(self) {
            return;
        }
        let mut link = context.context();
        let mut previous = context.clone();
        while let Some(current) = link {
            if current.is_same(self) {
                *previous.0.context.borrow_mut() = None;
                break;
            }
            link = current.context();
            previous = current;
        }
        *self.0.context.borrow_mut() = Some(context);
    }

    /// Traceback entries, outermost frame first.
    #[must_use]
    pub fn traceback(&self) -> Vec<TracebackEntry> {
        self.0.traceback.borrow().clone()
    }

    /// Records the frame the exception is propagating through.
    pub(crate) fn push_traceback(&self, entry: TracebackEntry) {
        self.0.traceback.borrow_mut().insert(0, entry);
    }

    /// Renders the exception with its chain and traceback in the familiar layout.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        self.write_chain(&mut out, 0);
        out
    }

    fn write_chain(&self, out: &mut String, depth: usize) {
        // chains deeper than this are almost certainly cyclic through a cause link
        if depth > 64 {
            return;
        }
        if let Some(cause) = self.cause() {
            cause.write_chain(out, depth + 1);
            out.push_str("\nThe above exception was the direct cause of the following exception:\n\n");
        } else if let Some(context) = self.context()
            && !self.suppress_context()
        {
            context.write_chain(out, depth + 1);
            out.push_str("\nDuring handling of the above exception, another exception occurred:\n\n");
        }
        let traceback = self.0.traceback.borrow();
        if !traceback.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            for entry in traceback.iter() {
                out.push_str(&entry.to_string());
                out.push('\n');
            }
        }
        out.push_str(&self.to_string());
        out.push('\n');
    }
}

impl Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            write!(f, "{}", self.0.exc_type)
        } else {
            write!(f, "{}: {message}", self.0.exc_type)
        }
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.0.exc_type, self.message())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_walks_to_base() {
        assert!(ExcType::ZeroDivisionError.is_subclass_of(ExcType::ArithmeticError));
        assert!(ExcType::ZeroDivisionError.is_subclass_of(ExcType::BaseException));
        assert!(ExcType::UnboundLocalError.is_subclass_of(ExcType::NameError));
        assert!(!ExcType::GeneratorExit.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::Exception.is_subclass_of(ExcType::ValueError));
    }

    #[test]
    fn context_cycle_is_cut() {
        let a = Exception::new(ExcType::ValueError, "a");
        let b = Exception::new(ExcType::TypeError, "b");
        b.set_context(a.clone());
        a.set_context(b.clone());
        assert!(a.context().is_some_and(|c| c.is_same(&b)));
        assert!(b.context().is_none());
    }

    #[test]
    fn display_without_message() {
        assert_eq!(Exception::new_none(ExcType::GeneratorExit).to_string(), "GeneratorExit");
        assert_eq!(
            Exception::new(ExcType::KeyError, "'x'").to_string(),
            "KeyError: 'x'"
        );
    }
}

use std::{cell::RefCell, cmp::Ordering, fmt, rc::Rc};

use indexmap::IndexMap;

use crate::{
    builtins::Builtins,
    bytecode::{Code, Constant, Unroll},
    cell::CellRef,
    exception::{ExcType, Exception},
    function::Function,
    host::HostObject,
    types::{GeneratorMethod, GeneratorRef, Range, SeqIter},
};

/// Insertion-ordered string-keyed map, used for dicts and namespaces.
pub type DictMap = IndexMap<Rc<str>, Value>;

/// A runtime value.
///
/// Immutable payloads are shared behind `Rc`; mutable containers add a `RefCell`. Cloning a
/// `Value` is always cheap and never copies container contents.
#[derive(Clone)]
pub enum Value {
    /// Marks an empty local slot. Never visible to running code.
    Undefined,
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[Self]>),
    List(Rc<RefCell<Vec<Self>>>),
    Dict(Rc<RefCell<DictMap>>),
    Range(Range),
    Iter(Rc<RefCell<SeqIter>>),
    Code(Rc<Code>),
    Function(Rc<Function>),
    Builtin(Builtins),
    ExcClass(ExcType),
    Exception(Exception),
    Generator(GeneratorRef),
    /// `gen.send`, `gen.throw` or `gen.close` bound to its generator.
    GeneratorMethod(GeneratorRef, GeneratorMethod),
    Cell(CellRef),
    Host(Rc<dyn HostObject>),
    /// Pending control transfer parked on the operand stack while a cleanup handler runs.
    #[doc(hidden)]
    Unroll(Rc<Unroll>),
}

impl Value {
    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(s.into())
    }

    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(items.into())
    }

    #[must_use]
    pub fn dict(map: DictMap) -> Self {
        Self::Dict(Rc::new(RefCell::new(map)))
    }

    pub(crate) fn from_constant(constant: &Constant) -> Self {
        match constant {
            Constant::None => Self::None,
            Constant::Ellipsis => Self::Ellipsis,
            Constant::Bool(b) => Self::Bool(*b),
            Constant::Int(i) => Self::Int(*i),
            Constant::Float(f) => Self::Float(*f),
            Constant::Str(s) => Self::Str(s.clone()),
            Constant::Bytes(b) => Self::Bytes(b.clone()),
            Constant::Tuple(items) => Self::Tuple(items.iter().map(Self::from_constant).collect()),
            Constant::Code(code) => Self::Code(code.clone()),
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Undefined => "undefined",
            Self::None => "NoneType",
            Self::Ellipsis => "ellipsis",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Range(_) => "range",
            Self::Iter(it) => it.borrow().type_name(),
            Self::Code(_) => "code",
            Self::Function(_) => "function",
            Self::Builtin(_) => "builtin_function_or_method",
            Self::ExcClass(_) => "type",
            Self::Exception(exc) => exc.exc_type().name(),
            Self::Generator(generator) => generator.kind().type_name(),
            Self::GeneratorMethod(..) => "builtin_function_or_method",
            Self::Cell(_) => "cell",
            Self::Host(host) => host.type_name(),
            Self::Unroll(_) => "unroll",
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::List(items) => !items.borrow().is_empty(),
            Self::Dict(map) => !map.borrow().is_empty(),
            Self::Range(range) => range.len() > 0,
            Self::Host(host) => host.is_truthy(),
            _ => true,
        }
    }

    /// Numeric view used by arithmetic and comparisons; bools count as ints.
    pub(crate) fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub(crate) fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    /// The `is` operator.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => Rc::ptr_eq(a, b),
            (Self::Bytes(a), Self::Bytes(b)) => Rc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            (Self::Code(a), Self::Code(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::ExcClass(a), Self::ExcClass(b)) => a == b,
            (Self::Exception(a), Self::Exception(b)) => a.is_same(b),
            (Self::Generator(a), Self::Generator(b)) => a.ptr_eq(b),
            (Self::Cell(a), Self::Cell(b)) => a.ptr_eq(b),
            (Self::Host(a), Self::Host(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The `==` operator.
    #[must_use]
    pub fn py_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => seq_eq(a, b),
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow()),
            (Self::Dict(a), Self::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|other| v.py_eq(other)))
            }
            (Self::Range(a), Self::Range(b)) => a == b,
            (Self::Float(_), _) | (_, Self::Float(_)) => match (self.as_float(), other.as_float()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            _ => match (self.as_int(), other.as_int()) {
                (Some(a), Some(b)) => a == b,
                _ => self.is(other),
            },
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`; `None` when the operands are unorderable.
    pub(crate) fn py_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            (Self::Tuple(a), Self::Tuple(b)) => seq_cmp(a, b),
            (Self::List(a), Self::List(b)) => seq_cmp(&a.borrow(), &b.borrow()),
            (Self::Float(_), _) | (_, Self::Float(_)) => self.as_float()?.partial_cmp(&other.as_float()?),
            _ => Some(self.as_int()?.cmp(&other.as_int()?)),
        }
    }

    /// `repr(value)`.
    #[must_use]
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, 0);
        out
    }

    /// `str(value)`.
    #[must_use]
    pub fn py_str(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            Self::Exception(exc) => exc.message(),
            _ => self.repr(),
        }
    }

    fn write_repr(&self, out: &mut String, depth: usize) {
        use std::fmt::Write;

        if depth > 32 {
            out.push_str("...");
            return;
        }
        match self {
            Self::Undefined => out.push_str("<undefined>"),
            Self::None => out.push_str("None"),
            Self::Ellipsis => out.push_str("Ellipsis"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => out.push_str(&float_repr(*f)),
            Self::Str(s) => write_str_repr(out, s),
            Self::Bytes(bytes) => {
                out.push_str("b'");
                for &byte in bytes.iter() {
                    match byte {
                        b'\'' => out.push_str("\\'"),
                        b'\\' => out.push_str("\\\\"),
                        b'\n' => out.push_str("\\n"),
                        0x20..=0x7e => out.push(char::from(byte)),
                        _ => {
                            let _ = write!(out, "\\x{byte:02x}");
                        }
                    }
                }
                out.push('\'');
            }
            Self::Tuple(items) => {
                out.push('(');
                write_items(out, items, depth);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Self::List(items) => {
                out.push('[');
                write_items(out, &items.borrow(), depth);
                out.push(']');
            }
            Self::Dict(map) => {
                out.push('{');
                for (index, (key, value)) in map.borrow().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    write_str_repr(out, key);
                    out.push_str(": ");
                    value.write_repr(out, depth + 1);
                }
                out.push('}');
            }
            Self::Range(range) => out.push_str(&range.to_string()),
            Self::Iter(it) => {
                let _ = write!(out, "<{} object>", it.borrow().type_name());
            }
            Self::Code(code) => {
                let _ = write!(out, "<code object {}, file \"{}\">", code.name(), code.filename());
            }
            Self::Function(function) => {
                let _ = write!(out, "<function {}>", function.qualname());
            }
            Self::Builtin(builtin) => {
                let _ = write!(out, "<built-in function {builtin}>");
            }
            Self::ExcClass(exc_type) => {
                let _ = write!(out, "<class '{exc_type}'>");
            }
            Self::Exception(exc) => {
                let _ = write!(out, "{}(", exc.exc_type());
                write_items(out, exc.args(), depth);
                out.push(')');
            }
            Self::Generator(generator) => {
                let _ = write!(out, "<{} object {}>", generator.kind().type_name(), generator.qualname());
            }
            Self::GeneratorMethod(generator, method) => {
                let _ = write!(
                    out,
                    "<built-in method {method} of {} object>",
                    generator.kind().type_name()
                );
            }
            Self::Cell(cell) => match cell.get() {
                Some(value) => {
                    let _ = write!(out, "<cell: {} object>", value.type_name());
                }
                None => out.push_str("<cell: empty>"),
            },
            Self::Host(host) => out.push_str(&host.repr()),
            Self::Unroll(unroll) => {
                let _ = write!(out, "<unroll {unroll:?}>");
            }
        }
    }
}

fn write_items(out: &mut String, items: &[Value], depth: usize) {
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        item.write_repr(out, depth + 1);
    }
}

fn write_str_repr(out: &mut String, s: &str) {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

pub(crate) fn float_repr(f: f64) -> String {
    if f.is_nan() {
        "nan".to_owned()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

fn seq_cmp(a: &[Value], b: &[Value]) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if !x.py_eq(y) {
            return x.py_cmp(y);
        }
    }
    Some(a.len().cmp(&b.len()))
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<Exception> for Value {
    fn from(value: Exception) -> Self {
        Self::Exception(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reprs() {
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(Value::str("it's").repr(), "\"it's\"");
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(
            Value::list(vec![Value::None, Value::Bool(true), Value::str("a")]).repr(),
            "[None, True, 'a']"
        );
    }

    #[test]
    fn numeric_equality_crosses_kinds() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Int(1).py_eq(&Value::str("1")));
    }

    #[test]
    fn identity_of_containers() {
        let list = Value::list(vec![]);
        assert!(list.is(&list.clone()));
        assert!(!list.is(&Value::list(vec![])));
        assert!(list.py_eq(&Value::list(vec![])));
    }
}

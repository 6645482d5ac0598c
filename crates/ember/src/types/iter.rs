use std::{cell::RefCell, fmt, rc::Rc};

use crate::{
    exception::{ExcType, RunResult},
    value::Value,
};

/// An immutable arithmetic progression, as produced by `range()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn new(start: i64, stop: i64, step: i64) -> RunResult<Self> {
        if step == 0 {
            return Err(ExcType::value_error("range() arg 3 must not be zero"));
        }
        Ok(Self { start, stop, step })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let (start, stop, step) = (i128::from(self.start), i128::from(self.stop), i128::from(self.step));
        let span = if step > 0 { stop - start } else { start - stop };
        if span <= 0 {
            return 0;
        }
        let step = step.abs();
        usize::try_from((span + step - 1) / step).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index` (already normalized to be non-negative).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let offset = i64::try_from(index).ok()?.checked_mul(self.step)?;
        self.start.checked_add(offset)
    }

    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            self.start <= value && value < self.stop
        } else {
            self.stop < value && value <= self.start
        };
        in_bounds && (i128::from(value) - i128::from(self.start)) % i128::from(self.step) == 0
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.step == 1 {
            write!(f, "range({}, {})", self.start, self.stop)
        } else {
            write!(f, "range({}, {}, {})", self.start, self.stop, self.step)
        }
    }
}

/// Iterator over a builtin sequence.
///
/// List iterators index into the live list, so appends made while iterating are seen.
#[derive(Debug)]
pub enum SeqIter {
    List { items: Rc<RefCell<Vec<Value>>>, index: usize },
    Tuple { items: Rc<[Value]>, index: usize },
    Str { text: Rc<str>, pos: usize },
    Bytes { bytes: Rc<[u8]>, index: usize },
    Range { range: Range, index: usize },
    /// Iterates a snapshot of a dict's keys.
    Keys { keys: Vec<Rc<str>>, index: usize },
}

impl SeqIter {
    /// Iterator over `value`, or `None` if it is not a builtin sequence.
    pub(crate) fn over(value: &Value) -> Option<Self> {
        Some(match value {
            Value::List(items) => Self::List {
                items: items.clone(),
                index: 0,
            },
            Value::Tuple(items) => Self::Tuple {
                items: items.clone(),
                index: 0,
            },
            Value::Str(text) => Self::Str {
                text: text.clone(),
                pos: 0,
            },
            Value::Bytes(bytes) => Self::Bytes {
                bytes: bytes.clone(),
                index: 0,
            },
            Value::Range(range) => Self::Range {
                range: *range,
                index: 0,
            },
            Value::Dict(map) => Self::Keys {
                keys: map.borrow().keys().cloned().collect(),
                index: 0,
            },
            _ => return None,
        })
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::List { .. } => "list_iterator",
            Self::Tuple { .. } => "tuple_iterator",
            Self::Str { .. } => "str_iterator",
            Self::Bytes { .. } => "bytes_iterator",
            Self::Range { .. } => "range_iterator",
            Self::Keys { .. } => "dict_keyiterator",
        }
    }
}

impl Iterator for SeqIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            Self::List { items, index } => {
                let item = items.borrow().get(*index).cloned()?;
                *index += 1;
                Some(item)
            }
            Self::Tuple { items, index } => {
                let item = items.get(*index).cloned()?;
                *index += 1;
                Some(item)
            }
            Self::Str { text, pos } => {
                let c = text[*pos..].chars().next()?;
                *pos += c.len_utf8();
                let mut buf = [0; 4];
                Some(Value::str(c.encode_utf8(&mut buf)))
            }
            Self::Bytes { bytes, index } => {
                let byte = *bytes.get(*index)?;
                *index += 1;
                Some(Value::Int(i64::from(byte)))
            }
            Self::Range { range, index } => {
                let item = range.get(*index)?;
                *index += 1;
                Some(Value::Int(item))
            }
            Self::Keys { keys, index } => {
                let key = keys.get(*index).cloned()?;
                *index += 1;
                Some(Value::Str(key))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_len_and_membership() {
        let r = Range::new(0, 10, 3).unwrap();
        assert_eq!(r.len(), 4);
        assert!(r.contains(9));
        assert!(!r.contains(10));
        let down = Range::new(5, 0, -2).unwrap();
        assert_eq!(down.len(), 3);
        assert_eq!(down.get(2), Some(1));
        assert!(Range::new(0, 1, 0).is_err());
    }

    #[test]
    fn list_iterator_sees_appends() {
        let items = Rc::new(RefCell::new(vec![Value::Int(1)]));
        let mut it = SeqIter::over(&Value::List(items.clone())).unwrap();
        assert!(it.next().is_some());
        items.borrow_mut().push(Value::Int(2));
        assert!(it.next().is_some_and(|v| v.py_eq(&Value::Int(2))));
        assert!(it.next().is_none());
    }
}

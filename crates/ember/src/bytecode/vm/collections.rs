//! Iteration, subscripting and container construction.

use std::{cell::RefCell, rc::Rc};

use super::{GenStep, VM};
use crate::{
    exception::{ExcType, RunResult},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{GeneratorKind, SeqIter},
    value::{DictMap, Value},
};

/// One step of an iterator.
pub(super) enum Next {
    Item(Value),
    /// Exhausted, with the return value of a generator (`None` for anything else).
    Done(Value),
}

/// `iter(value)`.
pub(super) fn get_iter(value: Value) -> RunResult<Value> {
    let is_iterator = match &value {
        Value::Iter(_) | Value::Host(_) => true,
        Value::Generator(generator) => generator.kind() == GeneratorKind::Generator,
        _ => false,
    };
    if is_iterator {
        return Ok(value);
    }
    match SeqIter::over(&value) {
        Some(iter) => Ok(Value::Iter(Rc::new(RefCell::new(iter)))),
        None => Err(ExcType::not_iterable(value.type_name())),
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `next(iterator)`, distinguishing exhaustion from an item.
    pub(super) fn iter_next(&mut self, iterator: &Value) -> RunResult<Next> {
        match iterator {
            Value::Iter(iter) => {
                let item = iter.borrow_mut().next();
                Ok(item.map_or(Next::Done(Value::None), Next::Item))
            }
            Value::Generator(generator) if generator.kind() == GeneratorKind::Generator => {
                Ok(match self.gen_send(generator, Value::None)? {
                    GenStep::Yielded(value) | GenStep::Awaiting(value) => Next::Item(value),
                    GenStep::Returned(value) => Next::Done(value),
                })
            }
            Value::Host(host) => Ok(host.next()?.map_or(Next::Done(Value::None), Next::Item)),
            other => Err(ExcType::not_an_iterator(other.type_name())),
        }
    }

    /// Drains any iterable into a vector.
    pub(super) fn collect_iterable(&mut self, value: Value) -> RunResult<Vec<Value>> {
        match &value {
            Value::Tuple(items) => return Ok(items.to_vec()),
            Value::List(items) => return Ok(items.borrow().clone()),
            _ => {}
        }
        let iterator = get_iter(value)?;
        let mut items = Vec::new();
        while let Next::Item(item) = self.iter_next(&iterator)? {
            items.push(item);
        }
        Ok(items)
    }

    /// `UnpackSequence`: exactly `count` items.
    pub(super) fn unpack(&mut self, value: &Value, count: usize) -> RunResult<Vec<Value>> {
        let items = match value {
            Value::Tuple(items) => items.to_vec(),
            Value::List(items) => items.borrow().clone(),
            other => {
                let iterator = get_iter(other.clone())?;
                let mut items = Vec::with_capacity(count);
                // one extra pull detects a too-long iterable
                while items.len() <= count {
                    match self.iter_next(&iterator)? {
                        Next::Item(item) => items.push(item),
                        Next::Done(_) => break,
                    }
                }
                items
            }
        };
        match items.len().cmp(&count) {
            std::cmp::Ordering::Equal => Ok(items),
            std::cmp::Ordering::Less => Err(ExcType::value_error(format!(
                "not enough values to unpack (expected {count}, got {})",
                items.len()
            ))),
            std::cmp::Ordering::Greater => Err(ExcType::value_error(format!(
                "too many values to unpack (expected {count})"
            ))),
        }
    }
}

/// Resolves a possibly negative sequence index.
fn seq_index(container: &Value, index: &Value, len: usize) -> RunResult<usize> {
    let Some(raw) = index.as_int() else {
        return Err(ExcType::type_error(format!(
            "{} indices must be integers, not {}",
            container.type_name(),
            index.type_name()
        )));
    };
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if raw < 0 { raw + len } else { raw };
    if (0..len).contains(&resolved) {
        Ok(usize::try_from(resolved).unwrap_or(usize::MAX))
    } else {
        Err(ExcType::index_out_of_range(container.type_name()))
    }
}

/// `container[index]`.
pub(super) fn subscr(container: &Value, index: &Value) -> RunResult<Value> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            Ok(items[seq_index(container, index, items.len())?].clone())
        }
        Value::Tuple(items) => Ok(items[seq_index(container, index, items.len())?].clone()),
        Value::Str(text) => {
            let len = text.chars().count();
            let position = seq_index(container, index, len)?;
            let c = text.chars().nth(position).unwrap_or_default();
            let mut buf = [0; 4];
            Ok(Value::str(c.encode_utf8(&mut buf)))
        }
        Value::Bytes(bytes) => Ok(Value::Int(i64::from(bytes[seq_index(container, index, bytes.len())?]))),
        Value::Range(range) => {
            let position = seq_index(container, index, range.len())?;
            range
                .get(position)
                .map(Value::Int)
                .ok_or_else(|| ExcType::index_out_of_range("range object"))
        }
        Value::Dict(map) => {
            let found = match index {
                Value::Str(key) => map.borrow().get(key).cloned(),
                _ => None,
            };
            found.ok_or_else(|| ExcType::key_error(index))
        }
        other => Err(ExcType::not_subscriptable(other.type_name())),
    }
}

/// `container[index] = value`.
pub(super) fn store_subscr(container: &Value, index: Value, value: Value) -> RunResult<()> {
    match container {
        Value::List(items) => {
            let position = seq_index(container, &index, items.borrow().len())?;
            items.borrow_mut()[position] = value;
            Ok(())
        }
        Value::Dict(map) => match index {
            Value::Str(key) => {
                map.borrow_mut().insert(key, value);
                Ok(())
            }
            other => Err(ExcType::type_error(format!(
                "dict keys must be str, not {}",
                other.type_name()
            ))),
        },
        other => Err(ExcType::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// `BuildMap`: alternating keys and values, keys restricted to strings.
pub(super) fn build_map(items: Vec<Value>) -> RunResult<Value> {
    let mut map = DictMap::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        match key {
            Value::Str(key) => {
                map.insert(key, value);
            }
            other => {
                return Err(ExcType::type_error(format!(
                    "dict keys must be str, not {}",
                    other.type_name()
                )));
            }
        }
    }
    Ok(Value::dict(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indexes_count_from_the_end() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(subscr(&list, &Value::Int(-1)).unwrap().py_eq(&Value::Int(3)));
        let err = subscr(&list, &Value::Int(3)).unwrap_err();
        assert_eq!(err.message(), "list index out of range");
        assert!(subscr(&Value::str("héllo"), &Value::Int(1)).unwrap().py_eq(&Value::str("é")));
    }

    #[test]
    fn dict_lookup_and_assignment() {
        let dict = build_map(vec![Value::str("a"), Value::Int(1)]).unwrap();
        store_subscr(&dict, Value::str("b"), Value::Int(2)).unwrap();
        assert!(subscr(&dict, &Value::str("b")).unwrap().py_eq(&Value::Int(2)));
        let err = subscr(&dict, &Value::str("zz")).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::KeyError);
        assert!(build_map(vec![Value::Int(1), Value::None]).is_err());
    }

    #[test]
    fn get_iter_rejects_scalars() {
        let err = get_iter(Value::Int(4)).unwrap_err();
        assert_eq!(err.message(), "'int' object is not iterable");
        assert!(matches!(get_iter(Value::tuple(vec![])), Ok(Value::Iter(_))));
    }
}

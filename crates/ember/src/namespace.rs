use std::{cell::RefCell, rc::Rc};

use crate::value::{DictMap, Value};

/// A shared, name-keyed variable table: module globals, the builtins table, or the locals
/// of an unoptimized frame.
///
/// Functions created in a module keep a handle to the same table, so a global stored by one
/// frame is immediately visible to every other frame sharing the namespace.
#[derive(Debug, Clone, Default)]
pub struct Namespace(Rc<RefCell<DictMap>>);

impl Namespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<Rc<str>>, value: Value) {
        let old = self.0.borrow_mut().insert(name.into(), value);
        drop(old);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.borrow_mut().shift_remove(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.borrow().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Copy of the current bindings.
    #[must_use]
    pub fn snapshot(&self) -> DictMap {
        self.0.borrow().clone()
    }

    /// The namespace as a dict value sharing the same storage.
    #[must_use]
    pub fn as_value(&self) -> Value {
        Value::Dict(self.0.clone())
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl FromIterator<(Rc<str>, Value)> for Namespace {
    fn from_iter<I: IntoIterator<Item = (Rc<str>, Value)>>(iter: I) -> Self {
        Self(Rc::new(RefCell::new(iter.into_iter().collect())))
    }
}

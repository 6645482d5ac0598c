//! Shared variable cells for closures.
//!
//! A variable captured by an inner function lives in a [`CellRef`] rather than a plain
//! local slot, so the defining frame and every closure that captured it observe the same
//! binding. Every cell created for the same variable of the same code object belongs to
//! one [`CellFamily`], which remembers whether any of those cells was ever rebound after
//! its first binding. Analyses can use that to treat never-rebound captures as constants.

use std::{
    cell::{Cell as FlagCell, RefCell},
    fmt,
    rc::Rc,
};

use crate::value::Value;

/// Per-variable bookkeeping shared by every cell created for that variable.
pub struct CellFamily {
    name: Rc<str>,
    rebound: FlagCell<bool>,
}

impl CellFamily {
    pub(crate) fn new(name: Rc<str>) -> Self {
        Self {
            name,
            rebound: FlagCell::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether any cell of this family was stored to or deleted after being bound once.
    ///
    /// Once set this never resets.
    #[must_use]
    pub fn ever_rebound(&self) -> bool {
        self.rebound.get()
    }
}

impl fmt::Debug for CellFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellFamily")
            .field("name", &self.name)
            .field("rebound", &self.rebound.get())
            .finish()
    }
}

struct Cell {
    family: Rc<CellFamily>,
    value: RefCell<Option<Value>>,
    bound_once: FlagCell<bool>,
}

/// A shared, possibly-empty variable slot.
#[derive(Clone)]
pub struct CellRef(Rc<Cell>);

impl CellRef {
    /// Creates a cell, bound if `initial` is given.
    #[must_use]
    pub fn new(family: Rc<CellFamily>, initial: Option<Value>) -> Self {
        let bound_once = initial.is_some();
        Self(Rc::new(Cell {
            family,
            value: RefCell::new(initial),
            bound_once: FlagCell::new(bound_once),
        }))
    }

    /// Current contents, `None` if the cell is empty.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.0.value.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        if self.0.bound_once.replace(true) {
            self.0.family.rebound.set(true);
        }
        // the old value may own a generator whose drop runs arbitrary bookkeeping,
        // so release the borrow before it is dropped
        let old = self.0.value.replace(Some(value));
        drop(old);
    }

    /// Empties the cell, returning whether it held a value.
    pub fn delete(&self) -> bool {
        if self.0.bound_once.get() {
            self.0.family.rebound.set(true);
        }
        let old = self.0.value.take();
        old.is_some()
    }

    #[must_use]
    pub fn family(&self) -> &Rc<CellFamily> {
        &self.0.family
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.value.borrow() {
            Some(value) => write!(f, "<cell {}: {value:?}>", self.0.family.name),
            None => write!(f, "<cell {}: empty>", self.0.family.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family() -> Rc<CellFamily> {
        Rc::new(CellFamily::new("x".into()))
    }

    #[test]
    fn first_binding_is_not_a_rebind() {
        let family = family();
        let cell = CellRef::new(family.clone(), None);
        cell.set(Value::Int(1));
        assert!(!family.ever_rebound());
        cell.set(Value::Int(2));
        assert!(family.ever_rebound());
    }

    #[test]
    fn initial_value_counts_as_binding() {
        let family = family();
        let cell = CellRef::new(family.clone(), Some(Value::Int(1)));
        assert!(cell.delete());
        assert!(family.ever_rebound());
        assert!(!cell.delete());
        assert!(cell.get().is_none());
    }

    #[test]
    fn flag_is_shared_by_the_family() {
        let family = family();
        let a = CellRef::new(family.clone(), None);
        let b = CellRef::new(family.clone(), None);
        a.set(Value::None);
        b.set(Value::None);
        assert!(!family.ever_rebound());
        b.set(Value::None);
        assert!(family.ever_rebound());
        assert!(a.family().ever_rebound());
    }

    #[test]
    fn deleting_a_never_bound_cell_leaves_family_untouched() {
        let family = family();
        let cell = CellRef::new(family.clone(), None);
        assert!(!cell.delete());
        assert!(!family.ever_rebound());
    }
}

use std::{fmt, rc::Rc};

use crate::{
    args::ArgValues,
    bytecode::Code,
    cell::CellRef,
    exception::RunResult,
    namespace::Namespace,
    signature::bind_arguments,
    value::{DictMap, Value},
};

/// A function object: a code object plus the environment it was created in.
pub struct Function {
    code: Rc<Code>,
    globals: Namespace,
    defaults: Vec<Value>,
    kwdefaults: Option<DictMap>,
    closure: Vec<CellRef>,
}

impl Function {
    #[must_use]
    pub fn new(code: Rc<Code>, globals: Namespace) -> Self {
        Self {
            code,
            globals,
            defaults: Vec::new(),
            kwdefaults: None,
            closure: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: Vec<Value>) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn with_kwdefaults(mut self, kwdefaults: DictMap) -> Self {
        self.kwdefaults = Some(kwdefaults);
        self
    }

    #[must_use]
    pub fn with_closure(mut self, closure: Vec<CellRef>) -> Self {
        self.closure = closure;
        self
    }

    #[must_use]
    pub fn code(&self) -> &Rc<Code> {
        &self.code
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.code.name()
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        self.code.qualname()
    }

    #[must_use]
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    #[must_use]
    pub fn defaults(&self) -> &[Value] {
        &self.defaults
    }

    #[must_use]
    pub fn closure(&self) -> &[CellRef] {
        &self.closure
    }

    /// Binds call arguments to the function's local slots.
    pub(crate) fn bind(&self, args: ArgValues) -> RunResult<Vec<Value>> {
        bind_arguments(&self.code, &self.defaults, self.kwdefaults.as_ref(), args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.qualname())
    }
}

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    exception::{ExcType, RunResult},
    value::Value,
};

/// Arguments of one call: positional values plus `name=value` keywords in call order.
///
/// Most calls pass a handful of positional arguments, which stay inline.
#[derive(Debug, Default, Clone)]
pub struct ArgValues {
    pub positional: SmallVec<[Value; 4]>,
    pub keywords: Vec<(Rc<str>, Value)>,
}

impl ArgValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keywords: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_keyword(mut self, name: &str, value: Value) -> Self {
        self.keywords.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn reject_keywords(&self, name: &str) -> RunResult<()> {
        if self.keywords.is_empty() {
            Ok(())
        } else {
            Err(ExcType::type_error(format!("{name}() takes no keyword arguments")))
        }
    }

    /// Checks that zero arguments were passed.
    pub fn check_zero_args(self, name: &str) -> RunResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ExcType::type_error(format!(
                "{name}() takes no arguments ({} given)",
                self.len()
            )))
        }
    }

    /// Checks that exactly one positional argument was passed, returning it.
    pub fn get_one_arg(self, name: &str) -> RunResult<Value> {
        self.reject_keywords(name)?;
        let count = self.positional.len();
        match <[Value; 1]>::try_from(self.positional.into_vec()) {
            Ok([value]) => Ok(value),
            Err(_) => Err(ExcType::arg_count(name, 1, count)),
        }
    }

    /// Checks that exactly two positional arguments were passed.
    pub fn get_two_args(self, name: &str) -> RunResult<(Value, Value)> {
        self.reject_keywords(name)?;
        let count = self.positional.len();
        match <[Value; 2]>::try_from(self.positional.into_vec()) {
            Ok([a, b]) => Ok((a, b)),
            Err(_) => Err(ExcType::arg_count(name, 2, count)),
        }
    }

    /// Accepts one or two positional arguments.
    pub fn get_one_two_args(self, name: &str) -> RunResult<(Value, Option<Value>)> {
        self.reject_keywords(name)?;
        let count = self.positional.len();
        let mut iter = self.positional.into_iter();
        match (iter.next(), iter.next(), iter.next()) {
            (Some(a), b, None) => Ok((a, b)),
            (None, ..) => Err(ExcType::type_error(format!(
                "{name} expected at least 1 argument, got 0"
            ))),
            _ => Err(ExcType::type_error(format!(
                "{name} expected at most 2 arguments, got {count}"
            ))),
        }
    }

    /// Accepts zero or one positional argument.
    pub fn get_zero_one_arg(self, name: &str) -> RunResult<Option<Value>> {
        self.reject_keywords(name)?;
        let count = self.positional.len();
        let mut iter = self.positional.into_iter();
        match (iter.next(), iter.next()) {
            (first, None) => Ok(first),
            _ => Err(ExcType::type_error(format!(
                "{name} expected at most 1 argument, got {count}"
            ))),
        }
    }
}

//! The builtins table.

use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{exception::ExcType, namespace::Namespace, value::Value};

/// Builtin functions. Their behaviour lives with the VM, which some of them need
/// (`next` drives generators, `print` writes to the VM's output, `locals` reads the caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Builtins {
    Print,
    Len,
    Iter,
    Next,
    List,
    Tuple,
    Range,
    Repr,
    Str,
    Isinstance,
    Locals,
}

/// A fresh builtins namespace: every builtin function and exception class by name.
#[must_use]
pub fn builtins_namespace() -> Namespace {
    Builtins::iter()
        .map(|builtin| (<&str>::from(builtin).into(), Value::Builtin(builtin)))
        .chain(ExcType::iter().map(|exc_type| (exc_type.name().into(), Value::ExcClass(exc_type))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_functions_and_classes() {
        let builtins = builtins_namespace();
        assert!(matches!(builtins.get("isinstance"), Some(Value::Builtin(Builtins::Isinstance))));
        assert!(matches!(builtins.get("KeyError"), Some(Value::ExcClass(ExcType::KeyError))));
        assert!(builtins.get("eval").is_none());
    }
}

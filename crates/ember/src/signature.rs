//! Binding call arguments to parameter slots.

use std::rc::Rc;

use crate::{
    args::ArgValues,
    bytecode::Code,
    exception::{ExcType, Exception, RunResult},
    value::{DictMap, Value},
};

/// Lays out `args` in the local slot order of `code`:
/// positional parameters, keyword-only parameters, `*args`, `**kwargs`, then the remaining
/// locals (left unbound).
pub(crate) fn bind_arguments(
    code: &Code,
    defaults: &[Value],
    kwdefaults: Option<&DictMap>,
    args: ArgValues,
) -> RunResult<Vec<Value>> {
    let name = code.name();
    let argcount = code.argcount();
    let posonly = code.posonlyargcount();
    let total_args = argcount + code.kwonlyargcount();
    let varnames = code.varnames();
    let mut locals = vec![Value::Undefined; code.nlocals()];

    let ArgValues { positional, keywords } = args;
    let given = positional.len();
    let mut extra = Vec::new();
    for (index, value) in positional.into_iter().enumerate() {
        if index < argcount {
            locals[index] = value;
        } else {
            extra.push(value);
        }
    }
    if code.has_varargs() {
        locals[total_args] = Value::tuple(extra);
    } else if !extra.is_empty() {
        return Err(too_many_positional(name, argcount, defaults.len(), given));
    }

    let mut kwargs = code.has_varkeywords().then(DictMap::default);
    let mut posonly_as_keyword: Vec<Rc<str>> = Vec::new();
    for (key, value) in keywords {
        if let Some(index) = (posonly..total_args).find(|&i| varnames[i] == key) {
            if !locals[index].is_undefined() {
                return Err(ExcType::type_error(format!(
                    "{name}() got multiple values for argument '{key}'"
                )));
            }
            locals[index] = value;
        } else if let Some(kwargs) = &mut kwargs {
            if kwargs.contains_key(&key) {
                return Err(ExcType::type_error(format!(
                    "{name}() got multiple values for keyword argument '{key}'"
                )));
            }
            kwargs.insert(key, value);
        } else if varnames[..posonly].contains(&key) {
            posonly_as_keyword.push(key);
        } else {
            return Err(ExcType::type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            )));
        }
    }
    if !posonly_as_keyword.is_empty() {
        let names: Vec<String> = posonly_as_keyword.iter().map(|n| format!("'{n}'")).collect();
        return Err(ExcType::type_error(format!(
            "{name}() got some positional-only arguments passed as keyword arguments: {}",
            names.join(", ")
        )));
    }
    if let Some(kwargs) = kwargs {
        let slot = total_args + usize::from(code.has_varargs());
        locals[slot] = Value::dict(kwargs);
    }

    let first_default = argcount.saturating_sub(defaults.len());
    let mut missing = Vec::new();
    for index in given.min(argcount)..argcount {
        if locals[index].is_undefined() {
            if index >= first_default {
                locals[index] = defaults[index - first_default].clone();
            } else {
                missing.push(&*varnames[index]);
            }
        }
    }
    if !missing.is_empty() {
        return Err(missing_arguments(name, "positional", &missing));
    }

    for index in argcount..total_args {
        if locals[index].is_undefined() {
            match kwdefaults.and_then(|map| map.get(&varnames[index])) {
                Some(value) => locals[index] = value.clone(),
                None => missing.push(&*varnames[index]),
            }
        }
    }
    if !missing.is_empty() {
        return Err(missing_arguments(name, "keyword-only", &missing));
    }
    Ok(locals)
}

fn too_many_positional(name: &str, argcount: usize, ndefaults: usize, given: usize) -> Exception {
    let takes = if ndefaults > 0 && ndefaults <= argcount {
        format!("from {} to {argcount} positional arguments", argcount - ndefaults)
    } else if argcount == 1 {
        "1 positional argument".to_owned()
    } else {
        format!("{argcount} positional arguments")
    };
    let was = if given == 1 { "was" } else { "were" };
    ExcType::type_error(format!("{name}() takes {takes} but {given} {was} given"))
}

fn missing_arguments(name: &str, kind: &str, missing: &[&str]) -> Exception {
    let quoted: Vec<String> = missing.iter().map(|n| format!("'{n}'")).collect();
    let list = match quoted.as_slice() {
        [one] => one.clone(),
        [a, b] => format!("{a} and {b}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
        [] => String::new(),
    };
    let plural = if missing.len() == 1 { "" } else { "s" };
    ExcType::type_error(format!(
        "{name}() missing {} required {kind} argument{plural}: {list}",
        missing.len()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeBuilder;

    fn code(positional: &[&str], posonly: u32, kwonly: &[&str], varargs: bool, varkw: bool) -> Code {
        let mut builder = CodeBuilder::new("f");
        builder.set_params(positional, posonly, kwonly);
        if varargs {
            builder.varargs("args");
        }
        if varkw {
            builder.varkeywords("kwargs");
        }
        builder.load_none().return_value();
        builder.build().unwrap()
    }

    fn message(err: Exception) -> String {
        err.message()
    }

    #[test]
    fn defaults_fill_trailing_parameters() {
        let code = code(&["a", "b", "c"], 0, &[], false, false);
        let locals = bind_arguments(
            &code,
            &[Value::Int(2), Value::Int(3)],
            None,
            ArgValues::positional([Value::Int(1)]).with_keyword("c", Value::Int(30)),
        )
        .unwrap();
        assert!(locals[1].py_eq(&Value::Int(2)));
        assert!(locals[2].py_eq(&Value::Int(30)));
    }

    #[test]
    fn collects_varargs_and_kwargs() {
        let code = code(&["a"], 0, &[], true, true);
        let locals = bind_arguments(
            &code,
            &[],
            None,
            ArgValues::positional([Value::Int(1), Value::Int(2), Value::Int(3)]).with_keyword("z", Value::None),
        )
        .unwrap();
        assert_eq!(locals[1].repr(), "(2, 3)");
        assert_eq!(locals[2].repr(), "{'z': None}");
    }

    #[test]
    fn error_messages() {
        let two = code(&["a", "b"], 0, &[], false, false);
        assert_eq!(
            message(bind_arguments(&two, &[], None, ArgValues::new()).unwrap_err()),
            "f() missing 2 required positional arguments: 'a' and 'b'"
        );
        assert_eq!(
            message(
                bind_arguments(&two, &[], None, ArgValues::positional([Value::None, Value::None, Value::None]))
                    .unwrap_err()
            ),
            "f() takes 2 positional arguments but 3 were given"
        );
        assert_eq!(
            message(
                bind_arguments(
                    &two,
                    &[],
                    None,
                    ArgValues::positional([Value::None, Value::None]).with_keyword("a", Value::None)
                )
                .unwrap_err()
            ),
            "f() got multiple values for argument 'a'"
        );
        assert_eq!(
            message(bind_arguments(&two, &[], None, ArgValues::new().with_keyword("q", Value::None)).unwrap_err()),
            "f() got an unexpected keyword argument 'q'"
        );
    }

    #[test]
    fn positional_only_and_keyword_only() {
        let code = code(&["a"], 1, &["k"], false, false);
        let err = bind_arguments(
            &code,
            &[],
            None,
            ArgValues::new().with_keyword("a", Value::None).with_keyword("k", Value::None),
        )
        .unwrap_err();
        assert_eq!(
            message(err),
            "f() got some positional-only arguments passed as keyword arguments: 'a'"
        );
        let err = bind_arguments(&code, &[], None, ArgValues::positional([Value::None])).unwrap_err();
        assert_eq!(message(err), "f() missing 1 required keyword-only argument: 'k'");

        let mut kwdefaults = DictMap::default();
        kwdefaults.insert("k".into(), Value::Int(9));
        let locals = bind_arguments(&code, &[], Some(&kwdefaults), ArgValues::positional([Value::None])).unwrap();
        assert!(locals[1].py_eq(&Value::Int(9)));
    }
}

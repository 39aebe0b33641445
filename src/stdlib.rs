//! Builtin functions and the modules scripts can `import`.

use std::{cmp::Ordering, fs, io::Write, path::Path};

use indexmap::IndexMap;
use tracing::debug;

use crate::{
    ast::BinaryOp,
    diagnostics::{Diagnostic, DiagnosticKind, KentError, Result},
    environment::{EnvironmentRef, Mutability},
    operators,
    runtime::ExecutionContext,
    value::{Caller, HigherOrderCallback, NativeCallback, Value, ValueKind},
};

const VARIADIC: usize = usize::MAX;

/// Source of modules for `import`.
pub trait ModuleResolver {
    fn resolve(&self, name: &str) -> Option<Value>;
}

/// The modules that ship with the interpreter: `math`, `time` and `file`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdModules;

impl ModuleResolver for StdModules {
    fn resolve(&self, name: &str) -> Option<Value> {
        let exports = match name {
            "math" => math_module(),
            "time" => time_module(),
            "file" => file_module(),
            _ => return None,
        };
        debug!(module = name, exports = exports.len(), "loaded builtin module");
        Some(Value::module(name, exports))
    }
}

/// Installs every entry of `table` in `env`. Builtins are plain immutable
/// bindings, so scripts may shadow them with `let`.
pub fn register_builtins(env: &EnvironmentRef, table: IndexMap<String, Value>) {
    let mut scope = env.borrow_mut();
    for (name, value) in table {
        scope.define(name, value, Mutability::Immutable);
    }
}

pub fn builtin_table() -> IndexMap<String, Value> {
    let entries: [(&'static str, usize, NativeCallback); 25] = [
        ("print", VARIADIC, builtin_print),
        ("len", 1, builtin_len),
        ("range", VARIADIC, builtin_range),
        ("type", 1, builtin_type),
        ("str", 1, builtin_str),
        ("int", 1, builtin_int),
        ("float", 1, builtin_float),
        ("bool", 1, builtin_bool),
        ("sorted", 1, builtin_sorted),
        ("reversed", 1, builtin_reversed),
        ("sum", 1, builtin_sum),
        ("min", VARIADIC, builtin_min),
        ("max", VARIADIC, builtin_max),
        ("abs", 1, builtin_abs),
        ("round", VARIADIC, builtin_round),
        ("keys", 1, builtin_keys),
        ("values", 1, builtin_values),
        ("push", 2, builtin_push),
        ("enumerate", 1, builtin_enumerate),
        ("zip", 2, builtin_zip),
        ("isinstance", 2, builtin_isinstance),
        ("callable", 1, builtin_callable),
        ("input", VARIADIC, builtin_input),
        ("list", VARIADIC, builtin_list),
        ("dict", VARIADIC, builtin_dict),
    ];
    let higher_order: [(&'static str, usize, HigherOrderCallback); 2] =
        [("map", 2, builtin_map), ("filter", 2, builtin_filter)];
    entries
        .into_iter()
        .map(|(name, arity, callback)| (name.to_string(), Value::native(name, arity, callback)))
        .chain(higher_order.into_iter().map(|(name, arity, callback)| {
            (name.to_string(), Value::higher_order(name, arity, callback))
        }))
        .collect()
}

fn math_module() -> IndexMap<String, Value> {
    let mut math = IndexMap::new();
    math.insert("sqrt".into(), Value::native("sqrt", 1, math_sqrt));
    math.insert("floor".into(), Value::native("floor", 1, math_floor));
    math.insert("ceil".into(), Value::native("ceil", 1, math_ceil));
    math.insert("pow".into(), Value::native("pow", 2, math_pow));
    math.insert("pi".into(), Value::float(std::f64::consts::PI));
    math.insert("e".into(), Value::float(std::f64::consts::E));
    math
}

fn time_module() -> IndexMap<String, Value> {
    let mut time = IndexMap::new();
    time.insert("now".into(), Value::native("now", 0, time_now));
    time
}

fn file_module() -> IndexMap<String, Value> {
    let mut file = IndexMap::new();
    file.insert("read".into(), Value::native("read", 1, file_read));
    file.insert("write".into(), Value::native("write", 2, file_write));
    file.insert("append".into(), Value::native("append", 2, file_append));
    file.insert("exists".into(), Value::native("exists", 1, file_exists));
    file
}

fn type_error(message: String) -> KentError {
    Diagnostic::new(DiagnosticKind::Type, message).into()
}

fn value_error(message: String) -> KentError {
    Diagnostic::new(DiagnosticKind::Custom("ValueError".into()), message).into()
}

fn ensure_range(args: &[Value], min: usize, max: usize, name: &str) -> Result<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min} to {max}")
        };
        return Err(type_error(format!(
            "{name}() takes {expected} argument(s) but {} were given",
            args.len()
        )));
    }
    Ok(())
}

fn ensure_min(args: &[Value], min: usize, name: &str) -> Result<()> {
    if args.len() < min {
        return Err(type_error(format!(
            "{name}() expected at least {min} argument(s) but {} were given",
            args.len()
        )));
    }
    Ok(())
}

fn expect_string<'a>(value: &'a Value, name: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        type_error(format!(
            "{name}() expected str but found {}",
            value.describe_type()
        ))
    })
}

fn expect_int(value: &Value, name: &str) -> Result<i64> {
    value.as_int().ok_or_else(|| {
        type_error(format!(
            "{name}() expected int but found {}",
            value.describe_type()
        ))
    })
}

fn expect_number(value: &Value, name: &str) -> Result<f64> {
    value.as_number().ok_or_else(|| {
        type_error(format!(
            "{name}() expected a number but found {}",
            value.describe_type()
        ))
    })
}

fn expect_list<'a>(value: &'a Value, name: &str) -> Result<&'a [Value]> {
    match &*value.0 {
        ValueKind::List(items) => Ok(items),
        _ => Err(type_error(format!(
            "{name}() expected list but found {}",
            value.describe_type()
        ))),
    }
}

/// Items of a list, characters of a string, or keys of a dict.
fn sequence(value: &Value, name: &str) -> Result<Vec<Value>> {
    match &*value.0 {
        ValueKind::List(items) => Ok(items.clone()),
        ValueKind::String(text) => Ok(text
            .chars()
            .map(|ch| Value::string(ch.to_string()))
            .collect()),
        ValueKind::Dict(map) => Ok(map.keys().map(|key| Value::string(key.clone())).collect()),
        _ => Err(type_error(format!(
            "{name}() expected an iterable but found {}",
            value.describe_type()
        ))),
    }
}

fn builtin_print(ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let line = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    ctx.output.write_line(&line);
    Ok(Value::null())
}

fn builtin_input(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    ensure_range(args, 0, 1, "input")?;
    if let Some(prompt) = args.first() {
        let mut stdout = std::io::stdout();
        write!(stdout, "{prompt}")?;
        stdout.flush()?;
    }
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(Value::string(line.trim_end_matches(['\r', '\n'])))
}

fn builtin_len(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let len = match &*args[0].0 {
        ValueKind::String(s) => s.chars().count(),
        ValueKind::List(items) => items.len(),
        ValueKind::Dict(map) => map.len(),
        _ => {
            return Err(type_error(format!(
                "object of type {} has no len()",
                args[0].describe_type()
            )));
        }
    };
    Ok(Value::int(len as i64))
}

fn builtin_range(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let bounds = args
        .iter()
        .map(|arg| expect_int(arg, "range"))
        .collect::<Result<Vec<_>>>()?;
    let (start, end, step) = match bounds.as_slice() {
        [end] => (0, *end, 1),
        [start, end] => (*start, *end, 1),
        [start, end, step] => (*start, *end, *step),
        _ => {
            return Err(type_error(format!(
                "range() takes 1 to 3 argument(s) but {} were given",
                bounds.len()
            )));
        }
    };
    if step == 0 {
        return Err(value_error("range() step must not be zero".into()));
    }
    let mut values = Vec::new();
    let mut current = start;
    while (step > 0 && current < end) || (step < 0 && current > end) {
        values.push(Value::int(current));
        current += step;
    }
    Ok(Value::list(values))
}

fn builtin_type(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    Ok(Value::string(args[0].describe_type()))
}

fn builtin_str(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    Ok(Value::string(args[0].to_string()))
}

fn builtin_int(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    match &*args[0].0 {
        ValueKind::Int(n) => Ok(Value::int(*n)),
        ValueKind::Float(f) if f.is_finite() => Ok(Value::int(f.trunc() as i64)),
        ValueKind::Bool(b) => Ok(Value::int(i64::from(*b))),
        ValueKind::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::int)
            .map_err(|_| value_error(format!("invalid literal for int(): {s:?}"))),
        _ => Err(type_error(format!(
            "int() argument must be a number or string, not {}",
            args[0].describe_type()
        ))),
    }
}

fn builtin_float(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    match &*args[0].0 {
        ValueKind::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::float)
            .map_err(|_| value_error(format!("could not convert string to float: {s:?}"))),
        _ => Ok(Value::float(expect_number(&args[0], "float")?)),
    }
}

fn builtin_bool(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    Ok(Value::bool(args[0].is_truthy()))
}

fn sort_values(values: &mut [Value], name: &str) -> Result<()> {
    let mut incomparable = false;
    values.sort_by(|a, b| {
        operators::compare(a, b).unwrap_or_else(|| {
            incomparable = true;
            Ordering::Equal
        })
    });
    if incomparable {
        return Err(type_error(format!(
            "{name}() found values that cannot be ordered"
        )));
    }
    Ok(())
}

fn builtin_sorted(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let mut values = sequence(&args[0], "sorted")?;
    sort_values(&mut values, "sorted")?;
    Ok(Value::list(values))
}

fn builtin_reversed(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    match &*args[0].0 {
        ValueKind::String(s) => Ok(Value::string(s.chars().rev().collect::<String>())),
        _ => {
            let mut values = sequence(&args[0], "reversed")?;
            values.reverse();
            Ok(Value::list(values))
        }
    }
}

fn builtin_sum(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    expect_list(&args[0], "sum")?
        .iter()
        .try_fold(Value::int(0), |total, item| {
            operators::binary(BinaryOp::Add, &total, item)
        })
}

fn extreme(args: &[Value], name: &str, wanted: Ordering) -> Result<Value> {
    ensure_min(args, 1, name)?;
    let candidates = match args {
        [single] => sequence(single, name)?,
        _ => args.to_vec(),
    };
    let mut best: Option<Value> = None;
    for candidate in candidates {
        best = Some(match best {
            None => candidate,
            Some(current) => {
                let ordering = operators::compare(&candidate, &current).ok_or_else(|| {
                    type_error(format!("{name}() found values that cannot be ordered"))
                })?;
                if ordering == wanted {
                    candidate
                } else {
                    current
                }
            }
        });
    }
    best.ok_or_else(|| value_error(format!("{name}() arg is an empty sequence")))
}

fn builtin_min(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    extreme(args, "min", Ordering::Less)
}

fn builtin_max(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    extreme(args, "max", Ordering::Greater)
}

fn builtin_abs(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    match &*args[0].0 {
        ValueKind::Int(n) => n.checked_abs().map(Value::int).ok_or_else(|| {
            Diagnostic::new(DiagnosticKind::Runtime, "integer overflow in abs()").into()
        }),
        _ => Ok(Value::float(expect_number(&args[0], "abs")?.abs())),
    }
}

fn builtin_round(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    ensure_range(args, 1, 2, "round")?;
    let value = expect_number(&args[0], "round")?;
    match args.get(1) {
        None => Ok(Value::int(value.round() as i64)),
        Some(digits) => {
            let digits = expect_int(digits, "round")?;
            let factor = 10f64.powi(digits.clamp(-300, 300) as i32);
            Ok(Value::float((value * factor).round() / factor))
        }
    }
}

fn expect_dict<'a>(value: &'a Value, name: &str) -> Result<&'a IndexMap<String, Value>> {
    match &*value.0 {
        ValueKind::Dict(map) => Ok(map),
        _ => Err(type_error(format!(
            "{name}() expected dict but found {}",
            value.describe_type()
        ))),
    }
}

fn builtin_keys(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let map = expect_dict(&args[0], "keys")?;
    Ok(Value::list(
        map.keys().map(|key| Value::string(key.clone())).collect(),
    ))
}

fn builtin_values(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let map = expect_dict(&args[0], "values")?;
    Ok(Value::list(map.values().cloned().collect()))
}

/// Returns a new list; lists have value semantics.
fn builtin_push(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let mut items = expect_list(&args[0], "push")?.to_vec();
    items.push(args[1].clone());
    Ok(Value::list(items))
}

fn builtin_enumerate(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let pairs = sequence(&args[0], "enumerate")?
        .into_iter()
        .enumerate()
        .map(|(idx, item)| Value::list(vec![Value::int(idx as i64), item]))
        .collect();
    Ok(Value::list(pairs))
}

fn builtin_zip(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let left = sequence(&args[0], "zip")?;
    let right = sequence(&args[1], "zip")?;
    let pairs = left
        .into_iter()
        .zip(right)
        .map(|(a, b)| Value::list(vec![a, b]))
        .collect();
    Ok(Value::list(pairs))
}

/// `list()` is empty; `list(iterable)` copies a list or splits a string or
/// dict into its characters or keys.
fn builtin_list(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    ensure_range(args, 0, 1, "list")?;
    match args.first() {
        Some(iterable) => Ok(Value::list(sequence(iterable, "list")?)),
        None => Ok(Value::list(Vec::new())),
    }
}

/// `dict()` is empty; `dict(d)` copies a dict and `dict(pairs)` builds one
/// from `[key, value]` lists.
fn builtin_dict(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    ensure_range(args, 0, 1, "dict")?;
    let Some(source) = args.first() else {
        return Ok(Value::dict(IndexMap::new()));
    };
    match &*source.0 {
        ValueKind::Dict(map) => Ok(Value::dict(map.clone())),
        ValueKind::List(pairs) => {
            let mut map = IndexMap::new();
            for pair in pairs {
                let (key, value) = match &*pair.0 {
                    ValueKind::List(items) if items.len() == 2 => (&items[0], &items[1]),
                    _ => {
                        return Err(value_error(format!(
                            "dict() expected [key, value] pairs but found {pair}"
                        )));
                    }
                };
                let key = match &*key.0 {
                    ValueKind::String(s) => s.clone(),
                    ValueKind::Int(n) => n.to_string(),
                    _ => {
                        return Err(type_error(format!(
                            "dictionary keys must be str or int, found {}",
                            key.describe_type()
                        )));
                    }
                };
                map.insert(key, value.clone());
            }
            Ok(Value::dict(map))
        }
        _ => Err(type_error(format!(
            "dict() expected a dict or a list of pairs but found {}",
            source.describe_type()
        ))),
    }
}

fn builtin_map(caller: &mut dyn Caller, args: &[Value]) -> Result<Value> {
    let function = expect_callable(&args[0], "map")?;
    let mapped = sequence(&args[1], "map")?
        .into_iter()
        .map(|item| caller.call_value(function, vec![item]))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::list(mapped))
}

/// Keeps the items for which `function` returns a truthy value.
fn builtin_filter(caller: &mut dyn Caller, args: &[Value]) -> Result<Value> {
    let function = expect_callable(&args[0], "filter")?;
    let mut kept = Vec::new();
    for item in sequence(&args[1], "filter")? {
        if caller.call_value(function, vec![item.clone()])?.is_truthy() {
            kept.push(item);
        }
    }
    Ok(Value::list(kept))
}

fn expect_callable<'a>(value: &'a Value, name: &str) -> Result<&'a Value> {
    if value.is_callable() {
        Ok(value)
    } else {
        Err(type_error(format!(
            "{name}() expected a function but found {}",
            value.describe_type()
        )))
    }
}

/// `isinstance(value, Class)` follows inheritance; a string second argument
/// is compared with `type(value)`.
fn builtin_isinstance(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let result = match (&*args[0].0, &*args[1].0) {
        (ValueKind::Instance(instance), ValueKind::Class(class)) => {
            instance.borrow().class.inherits_from(class)
        }
        (_, ValueKind::Class(_)) => false,
        (_, ValueKind::String(name)) => {
            args[0].describe_type() == *name || args[0].type_name() == name.as_str()
        }
        _ => {
            return Err(type_error(format!(
                "isinstance() arg 2 must be a class or type name, not {}",
                args[1].describe_type()
            )));
        }
    };
    Ok(Value::bool(result))
}

fn builtin_callable(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    Ok(Value::bool(args[0].is_callable()))
}

fn math_sqrt(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let value = expect_number(&args[0], "sqrt")?;
    if value < 0.0 {
        return Err(value_error("math domain error".into()));
    }
    Ok(Value::float(value.sqrt()))
}

fn math_floor(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    Ok(Value::int(expect_number(&args[0], "floor")?.floor() as i64))
}

fn math_ceil(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    Ok(Value::int(expect_number(&args[0], "ceil")?.ceil() as i64))
}

fn math_pow(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let base = expect_number(&args[0], "pow")?;
    let exponent = expect_number(&args[1], "pow")?;
    Ok(Value::float(base.powf(exponent)))
}

fn time_now(_: &mut ExecutionContext, _: &[Value]) -> Result<Value> {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => Ok(Value::float(duration.as_secs_f64())),
        Err(_) => Err(Diagnostic::new(DiagnosticKind::Runtime, "system clock went backwards").into()),
    }
}

fn file_read(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let path = expect_string(&args[0], "read")?;
    fs::read_to_string(path)
        .map(Value::string)
        .map_err(|err| io_error("file.read", path, err))
}

fn file_write(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let path = expect_string(&args[0], "write")?;
    let contents = expect_string(&args[1], "write")?;
    fs::write(path, contents).map_err(|err| io_error("file.write", path, err))?;
    Ok(Value::null())
}

fn file_append(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let path = expect_string(&args[0], "append")?;
    let contents = expect_string(&args[1], "append")?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| io_error("file.append", path, err))?;
    file.write_all(contents.as_bytes())
        .map_err(|err| io_error("file.append", path, err))?;
    Ok(Value::null())
}

fn file_exists(_: &mut ExecutionContext, args: &[Value]) -> Result<Value> {
    let path = expect_string(&args[0], "exists")?;
    Ok(Value::bool(Path::new(path).exists()))
}

fn io_error(name: &str, path: &str, err: std::io::Error) -> KentError {
    let mut diagnostic = Diagnostic::new(
        DiagnosticKind::Custom("IOError".into()),
        format!("{name}() failed for `{path}`: {err}"),
    );
    if let Some(code) = err.raw_os_error() {
        diagnostic = diagnostic.with_note(format!("os error code: {code}"));
    }
    diagnostic.into()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value> {
        let table = builtin_table();
        let ValueKind::NativeFunction(native) = &*table[name].0 else {
            panic!("{name} is not a builtin");
        };
        let (mut ctx, _) = ExecutionContext::captured();
        native.call(&mut ctx, args)
    }

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().copied().map(Value::int).collect())
    }

    #[test]
    fn range_supports_one_to_three_arguments() {
        assert_eq!(call("range", &[Value::int(3)]).unwrap(), ints(&[0, 1, 2]));
        assert_eq!(
            call("range", &[Value::int(2), Value::int(5)]).unwrap(),
            ints(&[2, 3, 4])
        );
        assert_eq!(
            call("range", &[Value::int(5), Value::int(0), Value::int(-2)]).unwrap(),
            ints(&[5, 3, 1])
        );
        let err = call("range", &[Value::int(0), Value::int(1), Value::int(0)]).unwrap_err();
        assert_eq!(err.kind_name(), "ValueError");
    }

    #[test]
    fn print_writes_to_the_context_output() {
        let table = builtin_table();
        let ValueKind::NativeFunction(print) = &*table["print"].0 else {
            panic!("print is not a builtin");
        };
        let (mut ctx, buffer) = ExecutionContext::captured();
        print
            .call(&mut ctx, &[Value::string("total:"), Value::int(30)])
            .unwrap();
        assert_eq!(buffer.borrow().as_str(), "total: 30\n");
    }

    #[test]
    fn sorted_min_and_max_order_values() {
        assert_eq!(call("sorted", &[ints(&[3, 1, 2])]).unwrap(), ints(&[1, 2, 3]));
        assert_eq!(call("min", &[ints(&[4, 2, 8])]).unwrap(), Value::int(2));
        assert_eq!(
            call("max", &[Value::int(1), Value::float(2.5)]).unwrap(),
            Value::float(2.5)
        );
        let mixed = Value::list(vec![Value::int(1), Value::string("a")]);
        assert_eq!(call("sorted", &[mixed]).unwrap_err().kind_name(), "TypeError");
    }

    #[test]
    fn conversions_report_bad_input() {
        assert_eq!(call("int", &[Value::string(" 42 ")]).unwrap(), Value::int(42));
        assert_eq!(call("int", &[Value::float(3.9)]).unwrap(), Value::int(3));
        assert_eq!(
            call("int", &[Value::string("4x")]).unwrap_err().kind_name(),
            "ValueError"
        );
        assert_eq!(call("str", &[Value::float(2.0)]).unwrap(), Value::string("2.0"));
    }

    #[test]
    fn arity_is_checked_before_the_callback_runs() {
        let err = call("len", &[]).unwrap_err();
        assert_eq!(err.kind_name(), "TypeError");
        assert_eq!(
            err.to_string(),
            "TypeError: len() takes 1 argument(s) but 0 were given"
        );
    }

    #[test]
    fn std_modules_resolve_by_name() {
        let math = StdModules.resolve("math").unwrap();
        let ValueKind::Module(module) = &*math.0 else {
            panic!("expected a module");
        };
        assert!(module.exports.contains_key("sqrt"));
        assert!(StdModules.resolve("nope").is_none());
    }

    #[test]
    fn list_and_dict_convert_their_argument() {
        assert_eq!(call("list", &[]).unwrap(), ints(&[]));
        assert_eq!(
            call("list", &[Value::string("ab")]).unwrap(),
            Value::list(vec![Value::string("a"), Value::string("b")])
        );
        let pairs = Value::list(vec![
            Value::list(vec![Value::string("a"), Value::int(1)]),
            Value::list(vec![Value::int(2), Value::int(3)]),
        ]);
        let ValueKind::Dict(map) = &*call("dict", &[pairs]).unwrap().0 else {
            panic!("expected a dict");
        };
        assert_eq!(map.get("a"), Some(&Value::int(1)));
        assert_eq!(map.get("2"), Some(&Value::int(3)));
        assert_eq!(
            call("dict", &[ints(&[1, 2])]).unwrap_err().kind_name(),
            "ValueError"
        );
    }

    #[test]
    fn map_and_filter_call_back_into_builtins() {
        let abs = builtin_table()["abs"].clone();
        assert_eq!(
            call("map", &[abs.clone(), ints(&[-1, 2, -3])]).unwrap(),
            ints(&[1, 2, 3])
        );
        let bool_fn = builtin_table()["bool"].clone();
        assert_eq!(
            call("filter", &[bool_fn, ints(&[0, 4, 0, 5])]).unwrap(),
            ints(&[4, 5])
        );
        assert_eq!(
            call("map", &[Value::int(1), ints(&[1])]).unwrap_err().kind_name(),
            "TypeError"
        );
    }
}

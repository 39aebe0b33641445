use indexmap::IndexMap;
use kentscript::{
    parser,
    runtime::{ExecutionContext, Interpreter, Outcome},
    stdlib::ModuleResolver,
    Environment, KentError, Value,
};
use pretty_assertions::assert_eq;

fn interpreter() -> (Interpreter, std::rc::Rc<std::cell::RefCell<String>>) {
    let (context, buffer) = ExecutionContext::captured();
    (Interpreter::with_context(context), buffer)
}

fn eval(source: &str) -> Value {
    let (mut interpreter, _) = interpreter();
    interpreter
        .eval_source(source)
        .expect("evaluation should succeed")
}

fn output(source: &str) -> String {
    let (mut interpreter, buffer) = interpreter();
    if let Err(err) = interpreter.eval_source(source) {
        panic!("expected success, got {err}");
    }
    let text = buffer.borrow().clone();
    text
}

fn eval_error(source: &str) -> KentError {
    let (mut interpreter, _) = interpreter();
    match interpreter.eval_source(source) {
        Ok(value) => panic!("expected error, received value {value}"),
        Err(err) => err,
    }
}

fn strings(items: &[&str]) -> Value {
    Value::list(items.iter().map(|item| Value::string(*item)).collect())
}

#[test]
fn arithmetic_respects_precedence() {
    assert_eq!(eval("2 + 3 * 4"), Value::int(14));
    assert_eq!(eval("(2 + 3) * 4"), Value::int(20));
    assert_eq!(eval("2 ** 3 ** 2"), Value::int(512));
    assert_eq!(eval("-2 ** 2"), Value::int(-4));
    assert_eq!(eval("7 / 2"), Value::float(3.5));
    assert_eq!(eval("1 < 2 and 2 < 3"), Value::bool(true));
}

#[test]
fn recursive_functions() {
    let source = r#"
func fib(n) {
    if n < 2 { return n }
    return fib(n - 1) + fib(n - 2)
}
func factorial(n) {
    if n <= 1 { return 1 }
    return n * factorial(n - 1)
}
[fib(7), factorial(5)]
"#;
    assert_eq!(eval(source), Value::list(vec![Value::int(13), Value::int(120)]));
}

#[test]
fn default_parameters_fill_missing_arguments() {
    let source = r#"
func greet(name, greeting = "Hi") {
    return greeting + ", " + name
}
[greet("Bo"), greet("Al", "Yo")]
"#;
    assert_eq!(eval(source), strings(&["Hi, Bo", "Yo, Al"]));

    let err = eval_error("func f(a, b) { return a }\nf(1)");
    assert_eq!(err.kind_name(), "TypeError");
    assert!(err.to_string().contains("missing required argument `b`"));
}

#[test]
fn closures_capture_bindings_by_reference() {
    let source = r#"
let mut x = 1
let get = || x
x = 5
get()
"#;
    assert_eq!(eval(source), Value::int(5));

    let counter = r#"
func make_counter() {
    let mut count = 0
    return || {
        count += 1
        return count
    }
}
let tick = make_counter()
tick()
tick()
print(tick())
"#;
    assert_eq!(output(counter), "3\n");
}

#[test]
fn methods_dispatch_through_the_class_chain() {
    let source = r#"
class Animal {
    func __init__(self, name) {
        self.name = name
    }
    func speak() {
        return self.name + " makes a sound"
    }
    func kind() {
        return "animal"
    }
}
class Dog : Animal {
    func speak() {
        return self.name + " says woof"
    }
    func describe() {
        return super.speak() + " (" + self.kind() + ")"
    }
}
let d = new Dog("Rex")
print(d.speak())
print(d.describe())
print(isinstance(d, Animal), isinstance(new Animal("x"), Dog))
"#;
    assert_eq!(
        output(source),
        "Rex says woof\nRex makes a sound (animal)\ntrue false\n"
    );
}

#[test]
fn static_members_live_on_the_class() {
    let source = r#"
class Counter {
    static let total = 0
    static func bump() {
        Counter.total += 1
    }
}
Counter.bump()
Counter.bump()
Counter.total
"#;
    assert_eq!(eval(source), Value::int(2));
}

#[test]
fn unknown_attribute_is_reported() {
    let err = eval_error("class P {}\nlet p = new P()\np.missing");
    assert_eq!(err.kind_name(), "AttributeError");
}

#[test]
fn containers_have_value_semantics() {
    let source = r#"
let a = [1, 2]
let mut b = a
b[0] = 9;
[a, b]
"#;
    assert_eq!(
        eval(source),
        Value::list(vec![
            Value::list(vec![Value::int(1), Value::int(2)]),
            Value::list(vec![Value::int(9), Value::int(2)]),
        ])
    );

    let dict = r#"
let mut d = {"a": 1}
d["b"] = 2
d.a + d["b"]
"#;
    assert_eq!(eval(dict), Value::int(3));
    assert_eq!(eval_error("[1, 2][5]").kind_name(), "IndexError");
    assert_eq!(eval_error("let d = {\"a\": 1}\nd[\"z\"]").kind_name(), "KeyError");
}

#[test]
fn bitwise_operators_follow_their_precedence() {
    assert_eq!(eval("6 & 3 | 8"), Value::int(10));
    assert_eq!(eval("5 ^ 1"), Value::int(4));
    assert_eq!(eval("1 << 4 >> 2"), Value::int(4));
    assert_eq!(eval("1 << 2 + 1"), Value::int(8));
    assert_eq!(eval("~0"), Value::int(-1));
    assert_eq!(eval("(12 & 4) == 4"), Value::bool(true));
    assert_eq!(eval_error("1.5 & 1").kind_name(), "TypeError");
}

#[test]
fn oversized_repetition_is_a_runtime_error() {
    let err = eval_error("\"ab\" * 9223372036854775807");
    assert_eq!(err.kind_name(), "RuntimeError");
    let err = eval_error("[1, 2] * 9223372036854775807");
    assert_eq!(err.kind_name(), "RuntimeError");
}

#[test]
fn map_and_filter_call_script_functions() {
    let source = r#"
func even(n) {
    return n % 2 == 0
}
[map(|x| x * 10, [1, 2, 3]), filter(even, range(6))]
"#;
    assert_eq!(
        eval(source),
        Value::list(vec![
            Value::list(vec![Value::int(10), Value::int(20), Value::int(30)]),
            Value::list(vec![Value::int(0), Value::int(2), Value::int(4)]),
        ])
    );
    assert_eq!(eval("list(\"hi\")"), strings(&["h", "i"]));
    assert_eq!(eval("dict([[\"a\", 1]]).a"), Value::int(1));

    let err = eval_error("map(|x| x / 0, [1])");
    assert_eq!(err.kind_name(), "ZeroDivisionError");
}

#[test]
fn comprehensions_filter_and_map() {
    assert_eq!(
        eval("[x * 2 for x in [1, 2, 3] if x != 2]"),
        Value::list(vec![Value::int(2), Value::int(6)])
    );
}

#[test]
fn match_supports_alternatives_guards_and_lists() {
    let source = r#"
func classify(n) {
    match n {
        case 0 => { return "zero" }
        case 1 | 2 | 3 => { return "small" }
        case x if x < 0 => { return "negative" }
        case _ => { return "large" }
    }
}
[classify(0), classify(2), classify(-5), classify(10)]
"#;
    assert_eq!(eval(source), strings(&["zero", "small", "negative", "large"]));

    let list = r#"
match [1, 2] {
    case [a, b] => { print(a + b) }
}
"#;
    assert_eq!(output(list), "3\n");
}

#[test]
fn constants_and_dotted_names_match_by_value() {
    let source = r#"
const RED = 1
class Color {
    static let GREEN = 2
}
func name(c) {
    match c {
        case RED => { return "red" }
        case Color.GREEN => { return "green" }
        case other => { return "other " + str(other) }
    }
}
[name(1), name(2), name(3)]
"#;
    assert_eq!(eval(source), strings(&["red", "green", "other 3"]));
}

#[test]
fn finally_runs_once_when_no_handler_matches() {
    let source = r#"
try {
    try {
        print(1 / 0)
    } except KeyError {
        print("wrong handler")
    } finally {
        print("cleanup")
    }
} except ZeroDivisionError {
    print("outer caught")
}
"#;
    assert_eq!(output(source), "cleanup\nouter caught\n");
}

#[test]
fn try_runs_handler_then_finally() {
    let source = r#"
try {
    print(1 / 0)
} except ZeroDivisionError as e {
    print("caught", e.kind)
} finally {
    print("finally")
}
"#;
    assert_eq!(output(source), "caught ZeroDivisionError\nfinally\n");
}

#[test]
fn else_runs_only_after_a_clean_body() {
    let source = r#"
try {
    print("body")
} except {
    print("handler")
} else {
    print("else")
} finally {
    print("done")
}
"#;
    assert_eq!(output(source), "body\nelse\ndone\n");
}

#[test]
fn finally_runs_once_when_returning() {
    let source = r#"
func f() {
    try {
        return "body"
    } finally {
        print("cleanup")
    }
}
print(f())
"#;
    assert_eq!(output(source), "cleanup\nbody\n");
}

#[test]
fn unmatched_errors_propagate() {
    let err = eval_error("try { 1 / 0 } except KeyError { print(\"no\") }");
    assert_eq!(err.kind_name(), "ZeroDivisionError");
}

#[test]
fn raised_instances_match_their_base_classes() {
    let source = r#"
class AppError {}
class DbError : AppError {}
try {
    raise new DbError()
} except AppError {
    print("caught")
}
"#;
    assert_eq!(output(source), "caught\n");

    let err = eval_error("raise \"boom\"");
    assert_eq!(err.kind_name(), "Error");
    assert!(err.to_string().contains("boom"));
}

#[test]
fn safe_divide_returns_a_fallback() {
    let source = r#"
func safe_divide(a, b) {
    try {
        return a / b
    } except ZeroDivisionError {
        return "Error!"
    }
}
print(safe_divide(10, 2), safe_divide(1, 0))
"#;
    assert_eq!(output(source), "5 Error!\n");
}

#[test]
fn moved_bindings_cannot_be_read() {
    let err = eval_error("let a = [1]\nmove a to b\na");
    assert_eq!(err.kind_name(), "OwnershipError");
    assert!(err.to_string().contains("use of moved value `a`"));

    assert_eq!(
        eval("let a = [1]\nmove a to b\nb"),
        Value::list(vec![Value::int(1)])
    );
}

#[test]
fn borrows_block_conflicting_access() {
    let exclusive = eval_error("let mut s = 1\nlet r = borrow s\nlet w = borrow mut s");
    assert_eq!(exclusive.kind_name(), "OwnershipError");
    assert!(exclusive
        .to_string()
        .contains("cannot borrow `s` exclusively"));

    let write = eval_error("let mut s = 1\nlet r = borrow s\ns = 2");
    assert_eq!(write.kind_name(), "OwnershipError");
    assert!(write.to_string().contains("cannot assign to `s`"));
}

#[test]
fn moves_into_an_outer_binding_from_a_nested_block() {
    let source = r#"
let mut y = 0
let x = 5
if true { move x to y }
print(y)
"#;
    assert_eq!(output(source), "5\n");

    let fresh = r#"
let x = [1]
if true {
    move x to inner
    print(inner)
}
print(x)
"#;
    let err = {
        let (mut interpreter, buffer) = interpreter();
        let err = interpreter.eval_source(fresh).unwrap_err();
        assert_eq!(buffer.borrow().as_str(), "[1]\n");
        err
    };
    assert!(err.to_string().contains("use of moved value `x`"));
}

#[test]
fn rejected_moves_keep_the_source() {
    let source = r#"
const y = 1
let x = 5
try {
    move x to y
} except ImmutableError as e {
    print("rejected:", e.message)
}
print(x, y)
"#;
    assert_eq!(
        output(source),
        "rejected: cannot assign to constant `y`\n5 1\n"
    );

    let borrowed = r#"
let mut y = 0
let r = borrow y
let x = 5
try { move x to y } except OwnershipError { print("lent") }
print(x)
"#;
    assert_eq!(output(borrowed), "lent\n5\n");
}

#[test]
fn borrows_taken_in_a_block_outlive_it_until_released() {
    let source = r#"
let mut s = 1
let mut r = null
if true { r = borrow s }
try { s = 2 } except OwnershipError { print("blocked") }
release r
s = 3
print(s)
"#;
    assert_eq!(output(source), "blocked\n3\n");
}

#[test]
fn star_borrow_is_exclusive() {
    let source = r#"
let mut data = [1, 2]
let w = borrow *data;
*w = [3]
release w
print(data)
"#;
    assert_eq!(output(source), "[3]\n");

    let err = eval_error("let mut data = [1]\nlet w = borrow *data\nlet r = borrow data");
    assert_eq!(err.kind_name(), "OwnershipError");
    assert!(err.to_string().contains("cannot borrow `data`"));
}

#[test]
fn field_writes_respect_open_borrows() {
    let class = "class P {\n    func __init__(x) { self.x = x }\n}\nlet p = new P(1)\n";
    let err = eval_error(&format!("{class}let r = borrow p\np.x = 5"));
    assert_eq!(err.kind_name(), "OwnershipError");
    assert!(err.to_string().contains("`p`"));

    let through = format!("{class}let w = borrow mut p\nw.x = 5\nrelease w\np.x");
    assert_eq!(eval(&through), Value::int(5));

    let moved = eval_error(&format!("{class}move p to q\np.x = 2"));
    assert_eq!(moved.kind_name(), "OwnershipError");

    let shared = eval_error(&format!("{class}let r = borrow p\nr.x = 5"));
    assert_eq!(shared.kind_name(), "OwnershipError");
}

#[test]
fn released_borrows_restore_ownership() {
    let source = r#"
let mut s = 1
let r = borrow s
release r
s = 2
s
"#;
    assert_eq!(eval(source), Value::int(2));

    let through = r#"
let mut s = 1
let w = borrow mut s;
*w = 7
release w
s
"#;
    assert_eq!(eval(through), Value::int(7));

    let err = eval_error("let s = 1\nrelease s");
    assert_eq!(err.kind_name(), "OwnershipError");
    assert!(err.to_string().contains("has no open borrow"));
}

#[test]
fn immutable_and_constant_bindings_reject_assignment() {
    let err = eval_error("let x = 1\nx = 2");
    assert_eq!(err.kind_name(), "ImmutableError");

    let err = eval_error("const LIMIT = 3\nLIMIT = 4");
    assert_eq!(err.kind_name(), "ImmutableError");
    assert!(err.to_string().contains("cannot assign to constant `LIMIT`"));

    assert_eq!(eval_error("missing + 1").kind_name(), "NameError");
    assert_eq!(eval_error("let x = 3\nx()").kind_name(), "TypeError");
    assert_eq!(eval_error("let = 5").kind_name(), "SyntaxError");
}

#[test]
fn awaiting_a_task_yields_its_result() {
    let source = r#"
async func double(n) {
    return n * 2
}
let t = double(21)
await t
"#;
    assert_eq!(eval(source), Value::int(42));

    let failing = r#"
async func bad() {
    raise "nope"
}
try {
    await bad()
} except Error as e {
    print("caught", e.message)
}
"#;
    assert_eq!(output(failing), "caught nope\n");
}

#[test]
fn pending_tasks_run_at_yield_or_program_end() {
    let at_end = r#"
async func note(msg) {
    print(msg)
}
note("later")
print("first")
"#;
    assert_eq!(output(at_end), "first\nlater\n");

    let at_yield = r#"
async func note(msg) {
    print(msg)
}
note("a")
yield
print("b")
"#;
    assert_eq!(output(at_yield), "a\nb\n");
}

#[test]
fn a_task_awaiting_itself_is_an_error() {
    let source = r#"
let mut t = null
async func loop_back() {
    return await t
}
t = loop_back()
await t
"#;
    let err = eval_error(source);
    assert_eq!(err.kind_name(), "RuntimeError");
    assert!(err.to_string().contains("awaited while still running"));
}

#[test]
fn deep_recursion_hits_the_call_depth_limit() {
    let (mut context, _) = ExecutionContext::captured();
    context.max_call_depth = 20;
    let mut interpreter = Interpreter::with_context(context);
    let err = interpreter
        .eval_source("func down(n) { return down(n + 1) }\ndown(0)")
        .unwrap_err();
    assert_eq!(err.kind_name(), "RecursionError");
    assert!(err.to_string().contains("maximum call depth of 20 exceeded"));
}

#[test]
fn recursion_near_the_default_limit_fits_on_a_test_thread() {
    let source = r#"
func d(n) {
    if n == 0 { return 0 }
    return 1 + d(n - 1)
}
d(990)
"#;
    assert_eq!(eval(source), Value::int(990));

    let err = eval_error("func d(n) { return 1 + d(n + 1) }\nd(0)");
    assert_eq!(err.kind_name(), "RecursionError");
    assert!(err.to_string().contains("maximum call depth of 1000 exceeded"));
}

#[test]
fn deeply_nested_expressions_parse_and_evaluate() {
    let depth = 3000;
    let source = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
    assert_eq!(eval(&source), Value::int(1));
}

#[test]
fn std_modules_import_with_aliases() {
    assert_eq!(eval("import math\nmath.sqrt(9)"), Value::float(3.0));
    assert_eq!(eval("import math as m\nm.floor(3.7)"), Value::int(3));
    assert_eq!(eval_error("import nothing").kind_name(), "ImportError");
}

struct Greetings;

impl ModuleResolver for Greetings {
    fn resolve(&self, name: &str) -> Option<Value> {
        if name != "greetings" {
            return None;
        }
        let mut exports = IndexMap::new();
        exports.insert("hello".to_string(), Value::string("hi there"));
        Some(Value::module("greetings", exports))
    }
}

#[test]
fn custom_resolvers_supply_modules() {
    let (context, _) = ExecutionContext::captured();
    let mut interpreter = Interpreter::with_context(context).with_resolver(Greetings);
    assert_eq!(
        interpreter
            .eval_source("import greetings\ngreetings.hello")
            .unwrap(),
        Value::string("hi there")
    );
    assert!(interpreter.eval_source("import math").is_err());
}

#[test]
fn globals_persist_between_runs() {
    let (mut interpreter, _) = interpreter();
    interpreter.eval_source("let mut total = 1").unwrap();
    interpreter.eval_source("total += 41").unwrap();
    assert_eq!(interpreter.eval_source("total").unwrap(), Value::int(42));

    interpreter.reset();
    assert_eq!(
        interpreter.eval_source("total").unwrap_err().kind_name(),
        "NameError"
    );
}

#[test]
fn single_statements_report_their_outcome() {
    let (mut interpreter, _) = interpreter();
    let env = Environment::new();

    let program = parser::parse("return 5").unwrap();
    match interpreter.evaluate(&program.statements[0], &env) {
        Outcome::Return(value) => assert_eq!(value, Value::int(5)),
        other => panic!("expected return, got {other:?}"),
    }

    let program = parser::parse("1 / 0").unwrap();
    match interpreter.evaluate(&program.statements[0], &env) {
        Outcome::Thrown(thrown) => assert_eq!(thrown.kind_name(), "ZeroDivisionError"),
        other => panic!("expected thrown error, got {other:?}"),
    }

    let program = parser::parse("let x = 2\nx * 21").unwrap();
    match interpreter.evaluate_program(&program, &env) {
        Outcome::Value(value) => assert_eq!(value, Value::int(42)),
        other => panic!("expected value, got {other:?}"),
    }
}

use std::{cell::RefCell, fmt, rc::Rc};

use indexmap::IndexMap;

use crate::{
    ast::FunctionDef,
    diagnostics::{Diagnostic, DiagnosticKind, Result},
    environment::EnvironmentRef,
    ownership::BorrowId,
    runtime::ExecutionContext,
    task::TaskRef,
};

/// A runtime value. Cloning is cheap; containers have value semantics and
/// are rebuilt on write.
#[derive(Clone)]
pub struct Value(pub Rc<ValueKind>);

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Self(Rc::new(kind))
    }

    pub fn null() -> Self {
        Self::new(ValueKind::Null)
    }

    pub fn bool(value: bool) -> Self {
        Self::new(ValueKind::Bool(value))
    }

    pub fn int(value: i64) -> Self {
        Self::new(ValueKind::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Self::new(ValueKind::Float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(ValueKind::String(value.into()))
    }

    pub fn list(values: Vec<Value>) -> Self {
        Self::new(ValueKind::List(values))
    }

    pub fn dict(entries: IndexMap<String, Value>) -> Self {
        Self::new(ValueKind::Dict(entries))
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ValueKind::Error(ErrorValue {
            kind: kind.into(),
            message: message.into(),
        }))
    }

    pub fn module(name: impl Into<String>, exports: IndexMap<String, Value>) -> Self {
        Self::new(ValueKind::Module(ModuleValue {
            name: name.into(),
            exports,
        }))
    }

    pub fn function(def: Rc<FunctionDef>, env: EnvironmentRef) -> Self {
        Self::new(ValueKind::Function(UserFunction { def, env }))
    }

    pub fn native(name: &'static str, arity: usize, callback: NativeCallback) -> Self {
        Self::new(ValueKind::NativeFunction(NativeFunction {
            name,
            arity,
            body: NativeBody::Plain(callback),
        }))
    }

    /// A builtin that calls back into other callables, like `map`.
    pub fn higher_order(name: &'static str, arity: usize, callback: HigherOrderCallback) -> Self {
        Self::new(ValueKind::NativeFunction(NativeFunction {
            name,
            arity,
            body: NativeBody::HigherOrder(callback),
        }))
    }

    pub fn instance(class: Rc<ClassDef>) -> Self {
        Self::new(ValueKind::Instance(Rc::new(RefCell::new(Instance {
            class,
            fields: IndexMap::new(),
        }))))
    }

    pub fn is_null(&self) -> bool {
        matches!(&*self.0, ValueKind::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match &*self.0 {
            ValueKind::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match &*self.0 {
            ValueKind::Int(n) => Some(*n as f64),
            ValueKind::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &*self.0 {
            ValueKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            &*self.0,
            ValueKind::Function(_)
                | ValueKind::NativeFunction(_)
                | ValueKind::BoundMethod(_)
                | ValueKind::Class(_)
        )
    }

    pub fn is_truthy(&self) -> bool {
        match &*self.0 {
            ValueKind::Null => false,
            ValueKind::Bool(b) => *b,
            ValueKind::Int(n) => *n != 0,
            ValueKind::Float(f) => *f != 0.0,
            ValueKind::String(s) => !s.is_empty(),
            ValueKind::List(values) => !values.is_empty(),
            ValueKind::Dict(map) => !map.is_empty(),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &*self.0 {
            ValueKind::Null => "null",
            ValueKind::Bool(_) => "bool",
            ValueKind::Int(_) => "int",
            ValueKind::Float(_) => "float",
            ValueKind::String(_) => "str",
            ValueKind::List(_) => "list",
            ValueKind::Dict(_) => "dict",
            ValueKind::Function(_) | ValueKind::NativeFunction(_) => "function",
            ValueKind::BoundMethod(_) => "method",
            ValueKind::Class(_) => "class",
            ValueKind::Instance(_) => "instance",
            ValueKind::Super(_) => "super",
            ValueKind::Module(_) => "module",
            ValueKind::Error(_) => "error",
            ValueKind::Task(_) => "task",
            ValueKind::Borrow(_) => "borrow",
        }
    }

    /// Type name as scripts see it: instances report their class.
    pub fn describe_type(&self) -> String {
        match &*self.0 {
            ValueKind::Instance(instance) => instance.borrow().class.name.clone(),
            _ => self.type_name().to_string(),
        }
    }
}

#[derive(Clone)]
pub enum ValueKind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Function(UserFunction),
    NativeFunction(NativeFunction),
    BoundMethod(BoundMethod),
    Class(Rc<ClassDef>),
    Instance(InstanceRef),
    /// What `super` evaluates to inside a method.
    Super(Receiver),
    Module(ModuleValue),
    Error(ErrorValue),
    Task(TaskRef),
    Borrow(BorrowHandle),
}

#[derive(Clone)]
pub struct UserFunction {
    pub def: Rc<FunctionDef>,
    pub env: EnvironmentRef,
}

impl UserFunction {
    pub fn name(&self) -> &str {
        self.def.name.as_deref().unwrap_or("<lambda>")
    }

    pub fn is_async(&self) -> bool {
        self.def.is_async
    }
}

pub type NativeCallback = fn(&mut ExecutionContext, &[Value]) -> Result<Value>;
pub type HigherOrderCallback = fn(&mut dyn Caller, &[Value]) -> Result<Value>;

/// What a builtin needs from whoever invokes it.
pub trait Caller {
    fn context(&mut self) -> &mut ExecutionContext;

    /// Calls any callable value: a script function, a method, a class or
    /// another builtin.
    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value>;
}

/// Without an interpreter only builtins can be called back.
impl Caller for ExecutionContext {
    fn context(&mut self) -> &mut ExecutionContext {
        self
    }

    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        match &*callee.0 {
            ValueKind::NativeFunction(native) => native.call(self, &args),
            _ => Err(Diagnostic::new(
                DiagnosticKind::Type,
                format!("cannot call a {} from here", callee.describe_type()),
            )
            .into()),
        }
    }
}

#[derive(Clone, Copy)]
pub enum NativeBody {
    Plain(NativeCallback),
    HigherOrder(HigherOrderCallback),
}

/// A builtin implemented in Rust. `arity == usize::MAX` means variadic; the
/// callback checks its own bounds in that case.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    pub arity: usize,
    pub body: NativeBody,
}

impl NativeFunction {
    pub fn call(&self, caller: &mut dyn Caller, args: &[Value]) -> Result<Value> {
        if self.arity != usize::MAX && args.len() != self.arity {
            return Err(Diagnostic::new(
                DiagnosticKind::Type,
                format!(
                    "{}() takes {} argument(s) but {} were given",
                    self.name,
                    self.arity,
                    args.len()
                ),
            )
            .into());
        }
        match self.body {
            NativeBody::Plain(callback) => callback(caller.context(), args),
            NativeBody::HigherOrder(callback) => callback(caller, args),
        }
    }
}

/// The instance a method runs against, and the class that defined the method.
#[derive(Clone)]
pub struct Receiver {
    pub instance: Value,
    pub class: Rc<ClassDef>,
}

#[derive(Clone)]
pub struct BoundMethod {
    pub receiver: Receiver,
    pub function: UserFunction,
}

pub struct ClassDef {
    pub name: String,
    /// Consulted for method and static lookup only.
    pub superclass: Option<Rc<ClassDef>>,
    pub methods: IndexMap<String, UserFunction>,
    pub statics: RefCell<IndexMap<String, Value>>,
}

impl ClassDef {
    /// Finds `name` on this class or the nearest ancestor defining it,
    /// together with the class it was found on.
    pub fn find_method(self: &Rc<Self>, name: &str) -> Option<(UserFunction, Rc<ClassDef>)> {
        let mut current = Some(Rc::clone(self));
        while let Some(class) = current {
            if let Some(method) = class.methods.get(name) {
                return Some((method.clone(), Rc::clone(&class)));
            }
            current = class.superclass.clone();
        }
        None
    }

    pub fn find_static(self: &Rc<Self>, name: &str) -> Option<(Value, Rc<ClassDef>)> {
        let mut current = Some(Rc::clone(self));
        while let Some(class) = current {
            if let Some(value) = class.statics.borrow().get(name) {
                return Some((value.clone(), Rc::clone(&class)));
            }
            current = class.superclass.clone();
        }
        None
    }

    /// True when this class is `name` or inherits from a class called `name`.
    pub fn is_a(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        let mut current = self.superclass.as_ref();
        while let Some(class) = current {
            if class.name == name {
                return true;
            }
            current = class.superclass.as_ref();
        }
        false
    }

    pub fn inherits_from(&self, other: &Rc<ClassDef>) -> bool {
        if std::ptr::eq(self, Rc::as_ptr(other)) {
            return true;
        }
        let mut current = self.superclass.as_ref();
        while let Some(class) = current {
            if Rc::ptr_eq(class, other) {
                return true;
            }
            current = class.superclass.as_ref();
        }
        false
    }
}

pub type InstanceRef = Rc<RefCell<Instance>>;

pub struct Instance {
    pub class: Rc<ClassDef>,
    pub fields: IndexMap<String, Value>,
}

#[derive(Clone)]
pub struct ModuleValue {
    pub name: String,
    pub exports: IndexMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorValue {
    pub kind: String,
    pub message: String,
}

/// A live borrow of the binding `name` held in `frame`.
#[derive(Clone)]
pub struct BorrowHandle {
    pub name: String,
    pub frame: EnvironmentRef,
    pub id: BorrowId,
    pub exclusive: bool,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (&*self.0, &*other.0) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Bool(a), ValueKind::Bool(b)) => a == b,
            (ValueKind::Int(a), ValueKind::Int(b)) => a == b,
            (ValueKind::Float(a), ValueKind::Float(b)) => a == b,
            (ValueKind::Int(a), ValueKind::Float(b)) | (ValueKind::Float(b), ValueKind::Int(a)) => {
                (*a as f64) == *b
            }
            (ValueKind::String(a), ValueKind::String(b)) => a == b,
            (ValueKind::List(a), ValueKind::List(b)) => a == b,
            (ValueKind::Dict(a), ValueKind::Dict(b)) => a == b,
            (ValueKind::Error(a), ValueKind::Error(b)) => a == b,
            (ValueKind::Function(a), ValueKind::Function(b)) => {
                Rc::ptr_eq(&a.def, &b.def) && Rc::ptr_eq(&a.env, &b.env)
            }
            (ValueKind::NativeFunction(a), ValueKind::NativeFunction(b)) => a.name == b.name,
            (ValueKind::Class(a), ValueKind::Class(b)) => Rc::ptr_eq(a, b),
            (ValueKind::Instance(a), ValueKind::Instance(b)) => Rc::ptr_eq(a, b),
            (ValueKind::Task(a), ValueKind::Task(b)) => Rc::ptr_eq(a, b),
            (ValueKind::Module(a), ValueKind::Module(b)) => a.name == b.name,
            _ => false,
        }
    }
}

fn format_float(f: &mut fmt::Formatter<'_>, value: f64) -> fmt::Result {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        write!(f, "{value:.1}")
    } else {
        write!(f, "{value}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ValueKind::Null => write!(f, "null"),
            ValueKind::Bool(b) => write!(f, "{b}"),
            ValueKind::Int(n) => write!(f, "{n}"),
            ValueKind::Float(n) => format_float(f, *n),
            ValueKind::String(s) => write!(f, "{s}"),
            ValueKind::List(values) => {
                write!(f, "[")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value:?}")?;
                }
                write!(f, "]")
            }
            ValueKind::Dict(map) => {
                write!(f, "{{")?;
                for (idx, (key, value)) in map.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key:?}: {value:?}")?;
                }
                write!(f, "}}")
            }
            ValueKind::Function(fun) => write!(f, "<func {}>", fun.name()),
            ValueKind::NativeFunction(fun) => write!(f, "<builtin {}>", fun.name),
            ValueKind::BoundMethod(method) => write!(
                f,
                "<bound method {}.{}>",
                method.receiver.class.name,
                method.function.name()
            ),
            ValueKind::Class(class) => write!(f, "<class {}>", class.name),
            ValueKind::Instance(instance) => {
                write!(f, "<{} instance>", instance.borrow().class.name)
            }
            ValueKind::Super(receiver) => write!(f, "<super of {}>", receiver.class.name),
            ValueKind::Module(module) => write!(f, "<module {}>", module.name),
            ValueKind::Error(err) => write!(f, "{}: {}", err.kind, err.message),
            ValueKind::Task(task) => write!(f, "{}", task.borrow()),
            ValueKind::Borrow(handle) if handle.exclusive => {
                write!(f, "<mutable borrow of {}>", handle.name)
            }
            ValueKind::Borrow(handle) => write!(f, "<borrow of {}>", handle.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ValueKind::String(s) => write!(f, "{s:?}"),
            _ => write!(f, "{self}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::null().is_truthy());
        assert!(!Value::int(0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(!Value::list(Vec::new()).is_truthy());
        assert!(Value::string("x").is_truthy());
        assert!(Value::float(0.5).is_truthy());
    }

    #[test]
    fn numbers_compare_across_int_and_float() {
        assert_eq!(Value::int(2), Value::float(2.0));
        assert_ne!(Value::int(2), Value::string("2"));
    }

    #[test]
    fn display_quotes_strings_inside_containers() {
        let list = Value::list(vec![Value::int(1), Value::string("a"), Value::float(2.0)]);
        assert_eq!(list.to_string(), r#"[1, "a", 2.0]"#);
        let mut entries = IndexMap::new();
        entries.insert("k".to_string(), Value::bool(true));
        assert_eq!(Value::dict(entries).to_string(), r#"{"k": true}"#);
    }

    #[test]
    fn class_ancestry_is_walked_by_name() {
        let base = Rc::new(ClassDef {
            name: "Animal".into(),
            superclass: None,
            methods: IndexMap::new(),
            statics: RefCell::new(IndexMap::new()),
        });
        let derived = Rc::new(ClassDef {
            name: "Dog".into(),
            superclass: Some(Rc::clone(&base)),
            methods: IndexMap::new(),
            statics: RefCell::new(IndexMap::new()),
        });
        assert!(derived.is_a("Animal"));
        assert!(derived.inherits_from(&base));
        assert!(!base.is_a("Dog"));
    }
}

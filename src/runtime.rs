use std::{cell::RefCell, mem, rc::Rc};

use indexmap::IndexMap;
use tracing::debug;

use crate::{
    ast::{
        BinaryOp, ClassDecl, Comprehension, ComprehensionBody, ExceptClause, Expr, ExprKind,
        Literal, OwnershipOp, Pattern, Program, Stmt, StmtKind, TryStmt, UnaryOp,
    },
    diagnostics::{error_at, Diagnostic, DiagnosticKind, KentError, Result, SourceSpan, Thrown},
    environment::{Environment, EnvironmentRef, Mutability},
    operators,
    ownership::BorrowId,
    parser,
    stack::ensure_sufficient_stack,
    stdlib::{self, ModuleResolver, StdModules},
    task::{Invocation, TaskQueue, TaskRef, TaskState},
    value::{
        BorrowHandle, BoundMethod, Caller, ClassDef, Receiver, UserFunction, Value, ValueKind,
    },
};

pub const DEFAULT_MAX_CALL_DEPTH: usize = 1000;

/// Where `print` writes.
#[derive(Debug, Clone, Default)]
pub enum Output {
    #[default]
    Stdout,
    Capture(Rc<RefCell<String>>),
}

impl Output {
    pub fn write_line(&mut self, line: &str) {
        match self {
            Output::Stdout => println!("{line}"),
            Output::Capture(buffer) => {
                let mut buffer = buffer.borrow_mut();
                buffer.push_str(line);
                buffer.push('\n');
            }
        }
    }
}

pub struct ExecutionContext {
    pub module_name: Option<String>,
    pub output: Output,
    pub max_call_depth: usize,
}

impl ExecutionContext {
    /// A context whose output is collected into the returned buffer.
    pub fn captured() -> (Self, Rc<RefCell<String>>) {
        let buffer = Rc::new(RefCell::new(String::new()));
        let context = Self {
            output: Output::Capture(Rc::clone(&buffer)),
            ..Self::default()
        };
        (context, buffer)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            module_name: None,
            output: Output::Stdout,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

/// Result of evaluating a statement or program against an environment.
#[derive(Debug)]
pub enum Outcome {
    Value(Value),
    Return(Value),
    Break,
    Continue,
    Thrown(Thrown),
}

impl Outcome {
    fn from_flow(result: Result<FlowControl>) -> Self {
        match result {
            Ok(FlowControl::Next) => Outcome::Value(Value::null()),
            Ok(FlowControl::NextValue(value)) => Outcome::Value(value),
            Ok(FlowControl::Return(value)) => Outcome::Return(value),
            Ok(FlowControl::Break) => Outcome::Break,
            Ok(FlowControl::Continue) => Outcome::Continue,
            Err(err) => Outcome::Thrown(err.to_thrown()),
        }
    }
}

pub struct Interpreter {
    globals: EnvironmentRef,
    env: EnvironmentRef,
    context: ExecutionContext,
    modules: Box<dyn ModuleResolver>,
    tasks: TaskQueue,
    depth: usize,
    next_borrow: BorrowId,
    /// Position of the builtin call in progress, for callbacks it makes.
    native_call_site: SourceSpan,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_context(ExecutionContext::default())
    }

    pub fn with_context(context: ExecutionContext) -> Self {
        let globals = Environment::new();
        stdlib::register_builtins(&globals, stdlib::builtin_table());
        Self {
            env: Rc::clone(&globals),
            globals,
            context,
            modules: Box::new(StdModules),
            tasks: TaskQueue::default(),
            depth: 0,
            next_borrow: 0,
            native_call_site: SourceSpan::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: impl ModuleResolver + 'static) -> Self {
        self.modules = Box::new(resolver);
        self
    }

    pub fn globals(&self) -> EnvironmentRef {
        Rc::clone(&self.globals)
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Drops every global binding and pending task, then reinstalls the
    /// builtins.
    pub fn reset(&mut self) {
        self.globals.borrow_mut().clear();
        stdlib::register_builtins(&self.globals, stdlib::builtin_table());
        self.env = Rc::clone(&self.globals);
        self.tasks.clear();
        self.depth = 0;
    }

    pub fn eval_source(&mut self, source: &str) -> Result<Value> {
        let program = parser::parse(source).map_err(KentError::from)?;
        self.run(&program)
    }

    /// Runs `program` against the global environment, then drains any tasks
    /// that are still pending. Yields the value of the last expression
    /// statement, or of a top-level `return`.
    pub fn run(&mut self, program: &Program) -> Result<Value> {
        debug!(
            module = self.context.module_name.as_deref().unwrap_or("<main>"),
            statements = program.statements.len(),
            "running program"
        );
        let globals = Rc::clone(&self.globals);
        let flow = match self.in_scope(globals, |this| this.execute_sequence(&program.statements)) {
            Ok(flow) => flow,
            Err(err) => {
                self.tasks.clear();
                return Err(err);
            }
        };
        self.drain_tasks()?;
        match flow {
            FlowControl::Next => Ok(Value::null()),
            FlowControl::NextValue(value) | FlowControl::Return(value) => Ok(value),
            FlowControl::Break => {
                Err(Diagnostic::new(DiagnosticKind::Runtime, "`break` outside of a loop").into())
            }
            FlowControl::Continue => Err(Diagnostic::new(
                DiagnosticKind::Runtime,
                "`continue` outside of a loop",
            )
            .into()),
        }
    }

    /// Evaluates one statement in `env`. Errors are reported as
    /// [`Outcome::Thrown`] rather than returned.
    pub fn evaluate(&mut self, stmt: &Stmt, env: &EnvironmentRef) -> Outcome {
        let result = self.in_scope(Rc::clone(env), |this| this.execute_statement(stmt));
        Outcome::from_flow(result)
    }

    pub fn evaluate_program(&mut self, program: &Program, env: &EnvironmentRef) -> Outcome {
        let result = self.in_scope(Rc::clone(env), |this| {
            this.execute_sequence(&program.statements)
        });
        Outcome::from_flow(result)
    }

    /// Runs `f` with `env` as the current scope, restoring the previous scope
    /// whether or not `f` succeeds.
    fn in_scope<T>(
        &mut self,
        env: EnvironmentRef,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let previous = mem::replace(&mut self.env, env);
        let result = f(self);
        self.env = previous;
        result
    }

    fn child_scope(&self) -> EnvironmentRef {
        Environment::with_parent(Rc::clone(&self.env))
    }

    fn execute_block(&mut self, statements: &[Stmt]) -> Result<FlowControl> {
        let scope = self.child_scope();
        self.in_scope(scope, |this| this.execute_sequence(statements))
    }

    fn execute_sequence(&mut self, statements: &[Stmt]) -> Result<FlowControl> {
        let mut last_value = None;
        for stmt in statements {
            match self.execute_statement(stmt)? {
                FlowControl::Next => {}
                FlowControl::NextValue(value) => last_value = Some(value),
                other => return Ok(other),
            }
        }
        Ok(last_value.map_or(FlowControl::Next, FlowControl::NextValue))
    }

    fn execute_statement(&mut self, stmt: &Stmt) -> Result<FlowControl> {
        ensure_sufficient_stack(|| self.execute_statement_inner(stmt))
    }

    fn execute_statement_inner(&mut self, stmt: &Stmt) -> Result<FlowControl> {
        match &stmt.kind {
            StmtKind::VarDecl {
                name,
                mutable,
                value,
            } => {
                let value = match value {
                    Some(expr) => self.evaluate_expr(expr)?,
                    None => Value::null(),
                };
                let mutability = if *mutable {
                    Mutability::Mutable
                } else {
                    Mutability::Immutable
                };
                self.env
                    .borrow_mut()
                    .declare(name, value, mutability, stmt.span)?;
                Ok(FlowControl::Next)
            }
            StmtKind::ConstDecl { name, value } => {
                let value = self.evaluate_expr(value)?;
                self.env
                    .borrow_mut()
                    .declare(name, value, Mutability::Constant, stmt.span)?;
                Ok(FlowControl::Next)
            }
            StmtKind::Assign { target, op, value } => {
                self.execute_assign(target, *op, value, stmt.span)?;
                Ok(FlowControl::Next)
            }
            StmtKind::Function(def) => {
                let name = def.name.clone().unwrap_or_default();
                let function = Value::function(Rc::clone(def), Rc::clone(&self.env));
                self.env
                    .borrow_mut()
                    .declare(&name, function, Mutability::Immutable, stmt.span)?;
                Ok(FlowControl::Next)
            }
            StmtKind::Class(decl) => {
                self.declare_class(decl, stmt.span)?;
                Ok(FlowControl::Next)
            }
            StmtKind::Expr(expr) => Ok(FlowControl::NextValue(self.evaluate_expr(expr)?)),
            StmtKind::Block(statements) => self.execute_block(statements),
            StmtKind::If {
                branches,
                else_branch,
            } => {
                for (condition, body) in branches {
                    if self.evaluate_expr(condition)?.is_truthy() {
                        return self.execute_block(body);
                    }
                }
                match else_branch {
                    Some(body) => self.execute_block(body),
                    None => Ok(FlowControl::Next),
                }
            }
            StmtKind::While { condition, body } => {
                while self.evaluate_expr(condition)?.is_truthy() {
                    match self.execute_block(body)? {
                        FlowControl::Break => break,
                        FlowControl::Return(value) => return Ok(FlowControl::Return(value)),
                        _ => {}
                    }
                }
                Ok(FlowControl::Next)
            }
            StmtKind::For {
                binding,
                iterable,
                body,
            } => {
                let iterable_value = self.evaluate_expr(iterable)?;
                for item in iterate(&iterable_value, iterable.span)? {
                    let scope = self.child_scope();
                    scope
                        .borrow_mut()
                        .define(binding.clone(), item, Mutability::Mutable);
                    match self.in_scope(scope, |this| this.execute_sequence(body))? {
                        FlowControl::Break => break,
                        FlowControl::Return(value) => return Ok(FlowControl::Return(value)),
                        _ => {}
                    }
                }
                Ok(FlowControl::Next)
            }
            StmtKind::Match { subject, cases } => {
                let value = self.evaluate_expr(subject)?;
                for case in cases {
                    let scope = self.child_scope();
                    if !self.match_pattern(&scope, &case.pattern, &value)? {
                        continue;
                    }
                    if let Some(guard) = &case.guard {
                        let passed = self.in_scope(Rc::clone(&scope), |this| {
                            this.evaluate_expr(guard)
                        })?;
                        if !passed.is_truthy() {
                            continue;
                        }
                    }
                    return self.in_scope(scope, |this| this.execute_sequence(&case.body));
                }
                Ok(FlowControl::Next)
            }
            StmtKind::Try(try_stmt) => self.execute_try(try_stmt),
            StmtKind::Raise(expr) => {
                let value = self.evaluate_expr(expr)?;
                let value = match &*value.0 {
                    ValueKind::Instance(_) | ValueKind::Error(_) => value.clone(),
                    ValueKind::String(message) => Value::error("Error", message.clone()),
                    _ => Value::error("Error", value.to_string()),
                };
                Err(KentError::Thrown(Box::new(Thrown {
                    value,
                    span: Some(stmt.span),
                })))
            }
            StmtKind::Assert { condition, message } => {
                if self.evaluate_expr(condition)?.is_truthy() {
                    return Ok(FlowControl::Next);
                }
                let message = match message {
                    Some(expr) => self.evaluate_expr(expr)?.to_string(),
                    None => "assertion failed".to_string(),
                };
                Err(error_at(DiagnosticKind::Assertion, message, stmt.span))
            }
            StmtKind::Import { module, alias } => {
                let value = self.import(module, stmt.span)?;
                self.env
                    .borrow_mut()
                    .declare(alias, value, Mutability::Immutable, stmt.span)?;
                Ok(FlowControl::Next)
            }
            StmtKind::Ownership(op) => {
                self.execute_ownership(op, stmt.span)?;
                Ok(FlowControl::Next)
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.evaluate_expr(expr)?,
                    None => Value::null(),
                };
                Ok(FlowControl::Return(value))
            }
            StmtKind::Break => Ok(FlowControl::Break),
            StmtKind::Continue => Ok(FlowControl::Continue),
            StmtKind::Yield => {
                self.drain_tasks()?;
                Ok(FlowControl::Next)
            }
        }
    }

    fn declare_class(&mut self, decl: &ClassDecl, span: SourceSpan) -> Result<()> {
        let superclass = match &decl.superclass {
            Some(expr) => {
                let value = self.evaluate_expr(expr)?;
                match &*value.0 {
                    ValueKind::Class(class) => Some(Rc::clone(class)),
                    _ => {
                        return Err(error_at(
                            DiagnosticKind::Type,
                            format!(
                                "base of class `{}` must be a class, found {}",
                                decl.name,
                                value.describe_type()
                            ),
                            expr.span,
                        ));
                    }
                }
            }
            None => None,
        };
        let methods = decl
            .methods
            .iter()
            .map(|def| {
                let function = UserFunction {
                    def: Rc::clone(def),
                    env: Rc::clone(&self.env),
                };
                (def.name.clone().unwrap_or_default(), function)
            })
            .collect();
        let statics = decl
            .static_methods
            .iter()
            .map(|def| {
                let function = Value::function(Rc::clone(def), Rc::clone(&self.env));
                (def.name.clone().unwrap_or_default(), function)
            })
            .collect();
        let class = Rc::new(ClassDef {
            name: decl.name.clone(),
            superclass,
            methods,
            statics: RefCell::new(statics),
        });
        self.env.borrow_mut().declare(
            &decl.name,
            Value::new(ValueKind::Class(Rc::clone(&class))),
            Mutability::Immutable,
            span,
        )?;
        // Static initializers may refer to the class itself.
        for (name, expr) in &decl.static_fields {
            let value = self.evaluate_expr(expr)?;
            class.statics.borrow_mut().insert(name.clone(), value);
        }
        Ok(())
    }

    fn execute_try(&mut self, stmt: &TryStmt) -> Result<FlowControl> {
        let mut outcome = match self.execute_block(&stmt.body) {
            Ok(flow @ (FlowControl::Next | FlowControl::NextValue(_))) => match &stmt.else_body {
                Some(body) => self.execute_block(body),
                None => Ok(flow),
            },
            Ok(flow) => Ok(flow),
            Err(err) => self.handle_error(&stmt.handlers, err),
        };
        if let Some(finally) = &stmt.finally {
            match self.execute_block(finally) {
                Ok(FlowControl::Next | FlowControl::NextValue(_)) => {}
                overriding => outcome = overriding,
            }
        }
        outcome
    }

    fn handle_error(&mut self, handlers: &[ExceptClause], err: KentError) -> Result<FlowControl> {
        let value = err.to_value();
        let Some(handler) = handlers
            .iter()
            .find(|handler| handler_matches(handler.kind.as_deref(), &value))
        else {
            return Err(err);
        };
        debug!(kind = %err.kind_name(), "caught");
        let scope = self.child_scope();
        if let Some(name) = &handler.binding {
            scope
                .borrow_mut()
                .define(name.clone(), value, Mutability::Mutable);
        }
        self.in_scope(scope, |this| this.execute_sequence(&handler.body))
    }

    fn import(&mut self, module: &str, span: SourceSpan) -> Result<Value> {
        debug!(module, "resolving import");
        self.modules.resolve(module).ok_or_else(|| {
            error_at(
                DiagnosticKind::Import,
                format!("no module named `{module}`"),
                span,
            )
        })
    }

    /// Tests `value` against `pattern`, binding captures into `scope`. Dotted
    /// names and names bound by `const` compare by value; any other bare name
    /// captures.
    fn match_pattern(
        &mut self,
        scope: &EnvironmentRef,
        pattern: &Pattern,
        value: &Value,
    ) -> Result<bool> {
        match pattern {
            Pattern::Wildcard => Ok(true),
            Pattern::Literal(literal) => Ok(literal_value(literal) == *value),
            Pattern::Value(expr) => Ok(self.evaluate_expr(expr)? == *value),
            Pattern::Binding(name) => {
                if let Some(constant) = Environment::constant(&self.env, name) {
                    return Ok(constant == *value);
                }
                scope
                    .borrow_mut()
                    .define(name.clone(), value.clone(), Mutability::Mutable);
                Ok(true)
            }
            Pattern::List(patterns) => match &*value.0 {
                ValueKind::List(items) if items.len() == patterns.len() => {
                    for (pattern, item) in patterns.iter().zip(items) {
                        if !self.match_pattern(scope, pattern, item)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                _ => Ok(false),
            },
            Pattern::Alternatives(options) => {
                for option in options {
                    if self.match_pattern(scope, option, value)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn fresh_borrow_id(&mut self) -> BorrowId {
        self.next_borrow += 1;
        self.next_borrow
    }

    fn execute_ownership(&mut self, op: &OwnershipOp, span: SourceSpan) -> Result<()> {
        match op {
            OwnershipOp::Move { source, target } => {
                Environment::move_binding(&self.env, source, target, span)
            }
            OwnershipOp::Borrow { name, exclusive } => {
                let id = self.fresh_borrow_id();
                Environment::open_borrow(&self.env, name, id, *exclusive, span).map(|_| ())
            }
            OwnershipOp::Release(name) => match self.borrow_handle(name) {
                Some(handle) => {
                    Environment::release(&handle.frame, &handle.name, Some(handle.id), span)
                }
                None => Environment::release(&self.env, name, None, span),
            },
        }
    }

    /// The handle stored in `name`, when `name` holds a borrow.
    fn borrow_handle(&self, name: &str) -> Option<BorrowHandle> {
        let value = Environment::peek(&self.env, name)?;
        match &*value.0 {
            ValueKind::Borrow(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    fn execute_assign(
        &mut self,
        target: &Expr,
        op: Option<BinaryOp>,
        value: &Expr,
        span: SourceSpan,
    ) -> Result<()> {
        let value = match op {
            Some(op) => {
                let current = self.evaluate_expr(target)?;
                let rhs = self.evaluate_expr(value)?;
                operators::binary(op, &current, &rhs).map_err(|err| err.or_span(span))?
            }
            None => self.evaluate_expr(value)?,
        };
        self.assign_to(target, value)
    }

    /// Stores `value` into `target`. Containers are rebuilt and written back
    /// to whatever holds them.
    fn assign_to(&mut self, target: &Expr, value: Value) -> Result<()> {
        match &target.kind {
            ExprKind::Identifier(name) => match self.borrow_handle(name) {
                Some(handle) => write_through(&handle, value, target.span),
                None => Environment::assign(&self.env, name, value, target.span),
            },
            ExprKind::Member {
                target: owner,
                name,
            } => self.assign_member(owner, name, value, target.span),
            ExprKind::Index {
                target: owner,
                index,
            } => self.assign_index(owner, index, value),
            ExprKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => {
                let handle = self.evaluate_raw(expr)?;
                match &*handle.0 {
                    ValueKind::Borrow(handle) => write_through(handle, value, target.span),
                    _ => Err(error_at(
                        DiagnosticKind::Type,
                        format!(
                            "cannot assign through a value of type {}",
                            handle.describe_type()
                        ),
                        target.span,
                    )),
                }
            }
            _ => Err(error_at(
                DiagnosticKind::Runtime,
                "cannot assign to computed expression",
                target.span,
            )),
        }
    }

    fn assign_member(
        &mut self,
        owner: &Expr,
        name: &str,
        value: Value,
        span: SourceSpan,
    ) -> Result<()> {
        let owner_value = self.evaluate_expr(owner)?;
        match &*owner_value.0 {
            ValueKind::Instance(instance) => {
                if let ExprKind::Identifier(owner_name) = &owner.kind {
                    self.check_field_write(owner_name, owner.span)?;
                }
                instance.borrow_mut().fields.insert(name.to_string(), value);
                Ok(())
            }
            ValueKind::Class(class) => {
                class.statics.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            ValueKind::Dict(map) => {
                let mut map = map.clone();
                map.insert(name.to_string(), value);
                self.assign_to(owner, Value::dict(map))
            }
            _ => Err(error_at(
                DiagnosticKind::Attribute,
                format!(
                    "cannot set attribute `{name}` on {}",
                    owner_value.describe_type()
                ),
                span,
            )),
        }
    }

    /// A field write mutates the instance behind `name`, so the binding must
    /// not be lent out. Through a handle, the handle must be exclusive.
    fn check_field_write(&self, name: &str, span: SourceSpan) -> Result<()> {
        match self.borrow_handle(name) {
            Some(handle) => {
                Environment::check_write_through(&handle.frame, &handle.name, handle.id, span)
            }
            None => Environment::check_mutation(&self.env, name, span),
        }
    }

    fn assign_index(&mut self, owner: &Expr, index: &Expr, value: Value) -> Result<()> {
        let owner_value = self.evaluate_expr(owner)?;
        let index_value = self.evaluate_expr(index)?;
        let updated = match &*owner_value.0 {
            ValueKind::List(items) => {
                let position = list_position(items.len(), &index_value, index.span)?;
                let mut items = items.clone();
                items[position] = value;
                Value::list(items)
            }
            ValueKind::Dict(map) => {
                let key = dict_key(&index_value, index.span)?;
                let mut map = map.clone();
                map.insert(key, value);
                Value::dict(map)
            }
            _ => {
                return Err(error_at(
                    DiagnosticKind::Type,
                    format!(
                        "{} does not support item assignment",
                        owner_value.describe_type()
                    ),
                    owner.span,
                ));
            }
        };
        self.assign_to(owner, updated)
    }

    /// Like [`Interpreter::evaluate_expr`], but a name holding a borrow
    /// yields the handle itself instead of the borrowed value.
    fn evaluate_raw(&mut self, expr: &Expr) -> Result<Value> {
        match &expr.kind {
            ExprKind::Identifier(name) => Environment::get(&self.env, name, expr.span),
            _ => self.evaluate_expr(expr),
        }
    }

    fn evaluate_expr(&mut self, expr: &Expr) -> Result<Value> {
        ensure_sufficient_stack(|| self.evaluate_expr_inner(expr))
    }

    fn evaluate_expr_inner(&mut self, expr: &Expr) -> Result<Value> {
        match &expr.kind {
            ExprKind::Literal(literal) => Ok(literal_value(literal)),
            ExprKind::Identifier(name) => {
                let value = Environment::get(&self.env, name, expr.span)?;
                if let ValueKind::Borrow(handle) = &*value.0 {
                    return Environment::read_through(&handle.frame, &handle.name, handle.id, expr.span);
                }
                Ok(value)
            }
            ExprKind::Binary { op, left, right } => {
                let left_value = self.evaluate_expr(left)?;
                match op {
                    BinaryOp::And if !left_value.is_truthy() => Ok(left_value),
                    BinaryOp::Or if left_value.is_truthy() => Ok(left_value),
                    BinaryOp::And | BinaryOp::Or => self.evaluate_expr(right),
                    _ => {
                        let right_value = self.evaluate_expr(right)?;
                        operators::binary(*op, &left_value, &right_value)
                            .map_err(|err| err.or_span(expr.span))
                    }
                }
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                expr: operand,
            } => {
                let value = self.evaluate_raw(operand)?;
                match &*value.0 {
                    ValueKind::Borrow(handle) => Environment::read_through(
                        &handle.frame,
                        &handle.name,
                        handle.id,
                        expr.span,
                    ),
                    _ => operators::unary(UnaryOp::Deref, &value)
                        .map_err(|err| err.or_span(expr.span)),
                }
            }
            ExprKind::Unary { op, expr: operand } => {
                let value = self.evaluate_expr(operand)?;
                operators::unary(*op, &value).map_err(|err| err.or_span(expr.span))
            }
            ExprKind::Call { callee, args } => {
                let callee_value = self.evaluate_expr(callee)?;
                let args = self.evaluate_all(args)?;
                self.call(callee_value, args, expr.span)
            }
            ExprKind::New { class, args } => {
                let class_value = self.evaluate_expr(class)?;
                let args = self.evaluate_all(args)?;
                match &*class_value.0 {
                    ValueKind::Class(class) => self.instantiate(Rc::clone(class), args, expr.span),
                    _ => Err(error_at(
                        DiagnosticKind::Type,
                        format!(
                            "`new` expects a class, found {}",
                            class_value.describe_type()
                        ),
                        class.span,
                    )),
                }
            }
            ExprKind::Member { target, name } => {
                let owner = self.evaluate_expr(target)?;
                member(&owner, name, expr.span)
            }
            ExprKind::Super(name) => self.super_method(name, expr.span),
            ExprKind::Index { target, index } => {
                let owner = self.evaluate_expr(target)?;
                let index_value = self.evaluate_expr(index)?;
                subscript(&owner, &index_value, expr.span)
            }
            ExprKind::List(elements) => Ok(Value::list(self.evaluate_all(elements)?)),
            ExprKind::Dict(entries) => {
                let mut map = IndexMap::new();
                for (key_expr, value_expr) in entries {
                    let key = dict_key(&self.evaluate_expr(key_expr)?, key_expr.span)?;
                    let value = self.evaluate_expr(value_expr)?;
                    map.insert(key, value);
                }
                Ok(Value::dict(map))
            }
            ExprKind::Comprehension(comprehension) => self.comprehension(comprehension),
            ExprKind::Lambda(def) => Ok(Value::function(Rc::clone(def), Rc::clone(&self.env))),
            ExprKind::Await(operand) => {
                let value = self.evaluate_expr(operand)?;
                match &*value.0 {
                    ValueKind::Task(task) => self.resume(Rc::clone(task), expr.span),
                    _ => Ok(value),
                }
            }
            ExprKind::Borrow { name, exclusive } => {
                let id = self.fresh_borrow_id();
                let frame = Environment::open_borrow(&self.env, name, id, *exclusive, expr.span)?;
                Ok(Value::new(ValueKind::Borrow(BorrowHandle {
                    name: name.clone(),
                    frame,
                    id,
                    exclusive: *exclusive,
                })))
            }
        }
    }

    fn evaluate_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>> {
        exprs.iter().map(|expr| self.evaluate_expr(expr)).collect()
    }

    fn comprehension(&mut self, comprehension: &Comprehension) -> Result<Value> {
        let iterable = self.evaluate_expr(&comprehension.iterable)?;
        let mut list = Vec::new();
        let mut dict = IndexMap::new();
        for item in iterate(&iterable, comprehension.iterable.span)? {
            let scope = self.child_scope();
            scope
                .borrow_mut()
                .define(comprehension.binding.clone(), item, Mutability::Mutable);
            self.in_scope(scope, |this| {
                if let Some(filter) = &comprehension.filter {
                    if !this.evaluate_expr(filter)?.is_truthy() {
                        return Ok(());
                    }
                }
                match &comprehension.body {
                    ComprehensionBody::List(element) => list.push(this.evaluate_expr(element)?),
                    ComprehensionBody::Dict(key, value) => {
                        let key_value = this.evaluate_expr(key)?;
                        let key_name = dict_key(&key_value, key.span)?;
                        dict.insert(key_name, this.evaluate_expr(value)?);
                    }
                }
                Ok(())
            })?;
        }
        Ok(match comprehension.body {
            ComprehensionBody::List(_) => Value::list(list),
            ComprehensionBody::Dict(..) => Value::dict(dict),
        })
    }

    fn super_method(&self, name: &str, span: SourceSpan) -> Result<Value> {
        let value =
            Environment::peek(&self.env, "super").ok_or_else(|| super_outside_method(span))?;
        let ValueKind::Super(receiver) = &*value.0 else {
            return Err(super_outside_method(span));
        };
        let receiver = receiver.clone();
        let parent = receiver
            .class
            .superclass
            .clone()
            .ok_or_else(|| super_outside_method(span))?;
        let (function, owner) = parent.find_method(name).ok_or_else(|| {
            error_at(
                DiagnosticKind::Attribute,
                format!("`{}` has no method `{name}`", parent.name),
                span,
            )
        })?;
        Ok(Value::new(ValueKind::BoundMethod(BoundMethod {
            receiver: Receiver {
                instance: receiver.instance,
                class: owner,
            },
            function,
        })))
    }

    fn call(&mut self, callee: Value, args: Vec<Value>, span: SourceSpan) -> Result<Value> {
        match &*callee.0 {
            ValueKind::NativeFunction(native) => {
                let outer = mem::replace(&mut self.native_call_site, span);
                let result = native.call(self, &args);
                self.native_call_site = outer;
                result.map_err(|err| err.or_span(span))
            }
            ValueKind::Function(function) => self.call_function(function.clone(), None, args, span),
            ValueKind::BoundMethod(method) => self.call_function(
                method.function.clone(),
                Some(method.receiver.clone()),
                args,
                span,
            ),
            ValueKind::Class(class) => self.instantiate(Rc::clone(class), args, span),
            _ => Err(error_at(
                DiagnosticKind::Type,
                format!("{} is not callable", callee.describe_type()),
                span,
            )),
        }
    }

    /// Calls `function`, or spawns a task for it when it is `async`.
    fn call_function(
        &mut self,
        function: UserFunction,
        receiver: Option<Receiver>,
        args: Vec<Value>,
        span: SourceSpan,
    ) -> Result<Value> {
        if function.is_async() {
            let name = function.name().to_string();
            let task = self.tasks.spawn(
                name,
                Invocation {
                    function,
                    receiver,
                    args,
                    span,
                },
            );
            debug!(task = %task.borrow(), queued = self.tasks.len(), "spawned");
            return Ok(Value::new(ValueKind::Task(task)));
        }
        self.invoke(&function, receiver.as_ref(), args, span)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(function = %function.name()))]
    fn invoke(
        &mut self,
        function: &UserFunction,
        receiver: Option<&Receiver>,
        args: Vec<Value>,
        span: SourceSpan,
    ) -> Result<Value> {
        let all_params = &function.def.params;
        let params = match (receiver, all_params.first()) {
            (Some(_), Some(first)) if first.name == "self" => &all_params[1..],
            _ => &all_params[..],
        };
        if args.len() > params.len() {
            return Err(error_at(
                DiagnosticKind::Type,
                format!(
                    "{}() takes {} argument(s) but {} were given",
                    function.name(),
                    params.len(),
                    args.len()
                ),
                span,
            ));
        }
        if self.depth >= self.context.max_call_depth {
            return Err(error_at(
                DiagnosticKind::Recursion,
                format!(
                    "maximum call depth of {} exceeded",
                    self.context.max_call_depth
                ),
                span,
            ));
        }

        let scope = Environment::with_parent(Rc::clone(&function.env));
        if let Some(receiver) = receiver {
            let mut frame = scope.borrow_mut();
            frame.define("self", receiver.instance.clone(), Mutability::Immutable);
            if receiver.class.superclass.is_some() {
                frame.define(
                    "super",
                    Value::new(ValueKind::Super(receiver.clone())),
                    Mutability::Immutable,
                );
            }
        }

        self.depth += 1;
        let result = self.in_scope(scope, |this| {
            let mut args = args.into_iter();
            for param in params {
                let value = match (args.next(), &param.default) {
                    (Some(value), _) => value,
                    (None, Some(default)) => this.evaluate_expr(default)?,
                    (None, None) => {
                        return Err(error_at(
                            DiagnosticKind::Type,
                            format!(
                                "{}() missing required argument `{}`",
                                function.name(),
                                param.name
                            ),
                            span,
                        ));
                    }
                };
                this.env
                    .borrow_mut()
                    .define(param.name.clone(), value, Mutability::Mutable);
            }
            this.execute_sequence(&function.def.body)
        });
        self.depth -= 1;

        match result? {
            FlowControl::Return(value) => Ok(value),
            FlowControl::Break | FlowControl::Continue => Err(error_at(
                DiagnosticKind::Runtime,
                "`break` or `continue` outside of a loop",
                function.def.span,
            )),
            FlowControl::Next | FlowControl::NextValue(_) => Ok(Value::null()),
        }
    }

    fn instantiate(&mut self, class: Rc<ClassDef>, args: Vec<Value>, span: SourceSpan) -> Result<Value> {
        let instance = Value::instance(Rc::clone(&class));
        match class.find_method("__init__") {
            Some((init, owner)) => {
                let receiver = Receiver {
                    instance: instance.clone(),
                    class: owner,
                };
                self.invoke(&init, Some(&receiver), args, span)?;
            }
            None if !args.is_empty() => {
                return Err(error_at(
                    DiagnosticKind::Type,
                    format!("{}() takes no arguments", class.name),
                    span,
                ));
            }
            None => {}
        }
        Ok(instance)
    }

    /// Runs a task to completion, or reports the result it already has.
    ///
    /// Only one task runs at a time: an `await` on a pending task runs it here,
    /// on the awaiting caller's stack, until it returns. Tasks never suspend
    /// part way through.
    #[tracing::instrument(level = "debug", skip_all, fields(task = task.borrow().id))]
    fn resume(&mut self, task: TaskRef, span: SourceSpan) -> Result<Value> {
        let invocation = {
            let mut state = task.borrow_mut();
            match state.start() {
                Some(invocation) => invocation,
                None => {
                    return match &state.state {
                        TaskState::Completed(value) => Ok(value.clone()),
                        TaskState::Failed(thrown) => {
                            Err(KentError::Thrown(Box::new(thrown.clone())))
                        }
                        _ => Err(error_at(
                            DiagnosticKind::Runtime,
                            format!("task `{}` awaited while still running", state.name),
                            span,
                        )),
                    };
                }
            }
        };
        let Invocation {
            function,
            receiver,
            args,
            span: call_span,
        } = invocation;
        let result = self.invoke(&function, receiver.as_ref(), args, call_span);
        let mut state = task.borrow_mut();
        match result {
            Ok(value) => {
                state.state = TaskState::Completed(value.clone());
                debug!(task = %state, "completed");
                Ok(value)
            }
            Err(err) => {
                state.state = TaskState::Failed(err.to_thrown());
                debug!(task = %state, error = %err, "failed");
                Err(err)
            }
        }
    }

    /// Runs every task that has not started yet, in spawn order.
    fn drain_tasks(&mut self) -> Result<()> {
        while let Some(task) = self.tasks.next_pending() {
            self.resume(task, SourceSpan::default())?;
        }
        Ok(())
    }
}

impl Caller for Interpreter {
    fn context(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        let span = self.native_call_site;
        self.call(callee.clone(), args, span)
    }
}

#[derive(Debug)]
enum FlowControl {
    Next,
    NextValue(Value),
    Return(Value),
    Break,
    Continue,
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Int(n) => Value::int(*n),
        Literal::Float(n) => Value::float(*n),
        Literal::Bool(b) => Value::bool(*b),
        Literal::String(s) => Value::string(s.clone()),
        Literal::Null => Value::null(),
    }
}

fn write_through(handle: &BorrowHandle, value: Value, span: SourceSpan) -> Result<()> {
    Environment::write_through(&handle.frame, &handle.name, handle.id, value, span)
}

fn super_outside_method(span: SourceSpan) -> KentError {
    error_at(
        DiagnosticKind::Name,
        "`super` is only available in methods of a derived class",
        span,
    )
}

/// Whether an `except` clause naming `kind` catches `value`.
fn handler_matches(kind: Option<&str>, value: &Value) -> bool {
    match kind {
        None | Some("Exception" | "Error") => true,
        Some(name) => match &*value.0 {
            ValueKind::Error(err) => err.kind == name,
            ValueKind::Instance(instance) => instance.borrow().class.is_a(name),
            _ => false,
        },
    }
}

fn iterate(value: &Value, span: SourceSpan) -> Result<Vec<Value>> {
    match &*value.0 {
        ValueKind::List(items) => Ok(items.clone()),
        ValueKind::String(text) => Ok(text
            .chars()
            .map(|ch| Value::string(ch.to_string()))
            .collect()),
        ValueKind::Dict(map) => Ok(map.keys().map(|key| Value::string(key.clone())).collect()),
        _ => Err(error_at(
            DiagnosticKind::Type,
            format!("{} is not iterable", value.describe_type()),
            span,
        )),
    }
}

fn dict_key(key: &Value, span: SourceSpan) -> Result<String> {
    match &*key.0 {
        ValueKind::String(s) => Ok(s.clone()),
        ValueKind::Int(n) => Ok(n.to_string()),
        _ => Err(error_at(
            DiagnosticKind::Type,
            format!(
                "dictionary keys must be str or int, found {}",
                key.describe_type()
            ),
            span,
        )),
    }
}

/// Resolves a possibly negative index against a sequence of `len` items.
fn list_position(len: usize, index: &Value, span: SourceSpan) -> Result<usize> {
    let Some(raw) = index.as_int() else {
        return Err(error_at(
            DiagnosticKind::Type,
            format!("indices must be int, found {}", index.describe_type()),
            span,
        ));
    };
    let resolved = if raw < 0 { raw + len as i64 } else { raw };
    if resolved < 0 || resolved as usize >= len {
        return Err(error_at(
            DiagnosticKind::Index,
            format!("index {raw} out of range for length {len}"),
            span,
        ));
    }
    Ok(resolved as usize)
}

fn subscript(owner: &Value, index: &Value, span: SourceSpan) -> Result<Value> {
    match &*owner.0 {
        ValueKind::List(items) => {
            let position = list_position(items.len(), index, span)?;
            Ok(items[position].clone())
        }
        ValueKind::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            let position = list_position(chars.len(), index, span)?;
            Ok(Value::string(chars[position].to_string()))
        }
        ValueKind::Dict(map) => {
            let key = dict_key(index, span)?;
            map.get(&key).cloned().ok_or_else(|| {
                error_at(DiagnosticKind::Key, format!("key {key:?} not found"), span)
            })
        }
        _ => Err(error_at(
            DiagnosticKind::Type,
            format!("{} is not subscriptable", owner.describe_type()),
            span,
        )),
    }
}

fn member(owner: &Value, name: &str, span: SourceSpan) -> Result<Value> {
    let missing = |what: String| {
        error_at(
            DiagnosticKind::Attribute,
            format!("{what} has no attribute `{name}`"),
            span,
        )
    };
    match &*owner.0 {
        ValueKind::Instance(instance) => {
            let class = {
                let instance = instance.borrow();
                if let Some(value) = instance.fields.get(name) {
                    return Ok(value.clone());
                }
                Rc::clone(&instance.class)
            };
            if let Some((function, defined_on)) = class.find_method(name) {
                return Ok(Value::new(ValueKind::BoundMethod(BoundMethod {
                    receiver: Receiver {
                        instance: owner.clone(),
                        class: defined_on,
                    },
                    function,
                })));
            }
            if let Some((value, _)) = class.find_static(name) {
                return Ok(value);
            }
            Err(missing(format!("`{}` object", class.name)))
        }
        ValueKind::Class(class) => {
            if let Some((value, _)) = class.find_static(name) {
                return Ok(value);
            }
            if let Some((function, _)) = class.find_method(name) {
                return Ok(Value::new(ValueKind::Function(function)));
            }
            Err(missing(format!("class `{}`", class.name)))
        }
        ValueKind::Module(module) => module
            .exports
            .get(name)
            .cloned()
            .ok_or_else(|| missing(format!("module `{}`", module.name))),
        ValueKind::Dict(map) => map.get(name).cloned().ok_or_else(|| {
            error_at(DiagnosticKind::Key, format!("key {name:?} not found"), span)
        }),
        ValueKind::Error(err) => match name {
            "kind" => Ok(Value::string(err.kind.clone())),
            "message" => Ok(Value::string(err.message.clone())),
            _ => Err(missing(err.kind.clone())),
        },
        _ => Err(missing(owner.describe_type())),
    }
}

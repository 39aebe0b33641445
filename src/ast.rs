use std::rc::Rc;

use crate::diagnostics::SourceSpan;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::ShiftLeft => "<<",
            BinaryOp::ShiftRight => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    /// `~n`
    BitNot,
    /// `*handle`: read through a borrow handle.
    Deref,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    pub span: SourceSpan,
}

/// Shared by named functions, methods, lambdas and anonymous `func` literals.
#[derive(Debug)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub is_async: bool,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Identifier(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    New {
        class: Box<Expr>,
        args: Vec<Expr>,
    },
    Member {
        target: Box<Expr>,
        name: String,
    },
    /// `super.name`, resolved against the superclass of the defining class.
    Super(String),
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Comprehension(Box<Comprehension>),
    Lambda(Rc<FunctionDef>),
    /// `await task`. Tasks run to completion rather than interleaving: awaiting
    /// a pending task runs all of it before the awaiting code continues.
    Await(Box<Expr>),
    Borrow {
        name: String,
        exclusive: bool,
    },
}

#[derive(Debug, Clone)]
pub enum ComprehensionBody {
    List(Expr),
    Dict(Expr, Expr),
}

#[derive(Debug, Clone)]
pub struct Comprehension {
    pub body: ComprehensionBody,
    pub binding: String,
    pub iterable: Expr,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Wildcard,
    Literal(Literal),
    Binding(String),
    /// A dotted name such as `Color.RED`, compared by value.
    Value(Expr),
    List(Vec<Pattern>),
    Alternatives(Vec<Pattern>),
}

#[derive(Debug, Clone)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct ExceptClause {
    /// Error kind or class name to catch; `None` catches everything.
    pub kind: Option<String>,
    pub binding: Option<String>,
    pub body: Vec<Stmt>,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct TryStmt {
    pub body: Vec<Stmt>,
    pub handlers: Vec<ExceptClause>,
    pub else_body: Option<Vec<Stmt>>,
    pub finally: Option<Vec<Stmt>>,
}

#[derive(Debug)]
pub struct ClassDecl {
    pub name: String,
    pub superclass: Option<Expr>,
    pub methods: Vec<Rc<FunctionDef>>,
    pub static_methods: Vec<Rc<FunctionDef>>,
    pub static_fields: Vec<(String, Expr)>,
}

#[derive(Debug, Clone)]
pub enum OwnershipOp {
    Move { source: String, target: String },
    Borrow { name: String, exclusive: bool },
    Release(String),
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    VarDecl {
        name: String,
        mutable: bool,
        value: Option<Expr>,
    },
    ConstDecl {
        name: String,
        value: Expr,
    },
    Assign {
        target: Expr,
        op: Option<BinaryOp>,
        value: Expr,
    },
    Function(Rc<FunctionDef>),
    Class(Rc<ClassDecl>),
    Expr(Expr),
    Block(Vec<Stmt>),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    For {
        binding: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Match {
        subject: Expr,
        cases: Vec<MatchCase>,
    },
    Try(Box<TryStmt>),
    Raise(Expr),
    Assert {
        condition: Expr,
        message: Option<Expr>,
    },
    Import {
        module: String,
        alias: String,
    },
    Ownership(OwnershipOp),
    Return(Option<Expr>),
    Break,
    Continue,
    Yield,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: SourceSpan,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

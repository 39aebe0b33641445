use std::rc::Rc;

use crate::{
    ast::{
        BinaryOp, ClassDecl, Comprehension, ComprehensionBody, ExceptClause, Expr, ExprKind,
        FunctionDef, Literal, MatchCase, OwnershipOp, Param, Pattern, Program, Stmt, StmtKind,
        TryStmt, UnaryOp,
    },
    diagnostics::{Diagnostic, DiagnosticKind, SourceSpan},
    lexer::{Keyword, Lexer, Token, TokenKind},
    stack::ensure_sufficient_stack,
};

/// Lex and parse a complete source text.
pub fn parse(source: &str) -> Result<Program, Diagnostic> {
    let tokens = Lexer::new(source).tokenize()?;
    parse_tokens(tokens)
}

pub fn parse_tokens(tokens: Vec<Token>) -> Result<Program, Diagnostic> {
    Parser::new(tokens).parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    fn parse_program(&mut self) -> Result<Program, Diagnostic> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            if self.matches(TokenKind::Semicolon) {
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(Program { statements })
    }

    fn parse_block_items(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        let mut items = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.is_at_end() {
            if self.matches(TokenKind::Semicolon) {
                continue;
            }
            items.push(self.parse_statement()?);
        }
        self.consume(TokenKind::RBrace, "expected `}` to close block")?;
        Ok(items)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        self.consume(TokenKind::LBrace, "expected `{` to start block")?;
        self.parse_block_items()
    }

    fn parse_statement(&mut self) -> Result<Stmt, Diagnostic> {
        ensure_sufficient_stack(|| self.parse_statement_inner())
    }

    fn parse_statement_inner(&mut self) -> Result<Stmt, Diagnostic> {
        match self.peek_kind() {
            TokenKind::Keyword(Keyword::Let) => self.parse_let(),
            TokenKind::Keyword(Keyword::Const) => self.parse_const(),
            TokenKind::Keyword(Keyword::Func)
                if self.peek_nth_kind(1) == TokenKind::Identifier =>
            {
                let start = self.advance().span;
                let def = self.parse_function_def(start, false, true)?;
                Ok(self.statement(start, StmtKind::Function(def)))
            }
            TokenKind::Keyword(Keyword::Async) => {
                let start = self.advance().span;
                self.consume_keyword(Keyword::Func, "expected `func` after `async`")?;
                let def = self.parse_function_def(start, true, true)?;
                Ok(self.statement(start, StmtKind::Function(def)))
            }
            TokenKind::Keyword(Keyword::Class) => self.parse_class(),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::Match) => self.parse_match(),
            TokenKind::Keyword(Keyword::Try) => self.parse_try(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::Break) => self.parse_bare(StmtKind::Break),
            TokenKind::Keyword(Keyword::Continue) => self.parse_bare(StmtKind::Continue),
            TokenKind::Keyword(Keyword::Yield) => self.parse_bare(StmtKind::Yield),
            TokenKind::Keyword(Keyword::Import) => self.parse_import(),
            TokenKind::Keyword(Keyword::Move) => self.parse_move(),
            TokenKind::Keyword(Keyword::Borrow) => {
                let start = self.advance().span;
                let (name, exclusive) = self.parse_borrow_target()?;
                self.consume_optional_semicolon();
                Ok(self.statement(
                    start,
                    StmtKind::Ownership(OwnershipOp::Borrow { name, exclusive }),
                ))
            }
            TokenKind::Keyword(Keyword::Release) => {
                let start = self.advance().span;
                let name = self.consume_identifier("expected binding name after `release`")?;
                self.consume_optional_semicolon();
                Ok(self.statement(
                    start,
                    StmtKind::Ownership(OwnershipOp::Release(name.lexeme)),
                ))
            }
            TokenKind::Keyword(Keyword::Raise | Keyword::Throw) => {
                let start = self.advance().span;
                let value = self.parse_expression()?;
                self.consume_optional_semicolon();
                Ok(self.statement(start, StmtKind::Raise(value)))
            }
            TokenKind::Keyword(Keyword::Assert) => {
                let start = self.advance().span;
                let condition = self.parse_expression()?;
                let message = if self.matches(TokenKind::Comma) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                self.consume_optional_semicolon();
                Ok(self.statement(start, StmtKind::Assert { condition, message }))
            }
            TokenKind::LBrace => {
                let start = self.current_span();
                let items = self.parse_block()?;
                Ok(self.statement(start, StmtKind::Block(items)))
            }
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_let(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let mutable = self.matches_keyword(Keyword::Mut);
        let name = self.consume_identifier("expected variable name after `let`")?;
        let value = if self.matches(TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.consume_optional_semicolon();
        Ok(self.statement(
            start,
            StmtKind::VarDecl {
                name: name.lexeme,
                mutable,
                value,
            },
        ))
    }

    fn parse_const(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let name = self.consume_identifier("expected constant name after `const`")?;
        self.consume(TokenKind::Assign, "expected `=` in constant declaration")?;
        let value = self.parse_expression()?;
        self.consume_optional_semicolon();
        Ok(self.statement(
            start,
            StmtKind::ConstDecl {
                name: name.lexeme,
                value,
            },
        ))
    }

    /// Parses everything after the `func` keyword.
    fn parse_function_def(
        &mut self,
        start: SourceSpan,
        is_async: bool,
        named: bool,
    ) -> Result<Rc<FunctionDef>, Diagnostic> {
        let name = if named {
            Some(self.consume_identifier("expected function name")?.lexeme)
        } else {
            None
        };
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(Rc::new(FunctionDef {
            name,
            params,
            body,
            is_async,
            span: start.to(self.previous().span),
        }))
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, Diagnostic> {
        self.consume(TokenKind::LParen, "expected `(` before parameters")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.check(TokenKind::RParen) {
            let name = if self.check(TokenKind::Keyword(Keyword::SelfValue)) {
                self.advance()
            } else {
                self.consume_identifier("expected parameter name")?
            };
            if params.iter().any(|param| param.name == name.lexeme) {
                return Err(Diagnostic::new(
                    DiagnosticKind::Syntax,
                    format!("duplicate parameter `{}`", name.lexeme),
                )
                .with_span(name.span));
            }
            let default = if self.matches(TokenKind::Assign) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            params.push(Param {
                name: name.lexeme,
                default,
                span: name.span,
            });
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RParen, "expected `)` after parameters")?;
        Ok(params)
    }

    fn parse_class(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let name = self.consume_identifier("expected class name")?;
        let superclass = if self.matches(TokenKind::Colon) {
            Some(self.parse_qualified_name()?)
        } else if self.matches(TokenKind::LParen) {
            let base = self.parse_qualified_name()?;
            self.consume(TokenKind::RParen, "expected `)` after base class")?;
            Some(base)
        } else {
            None
        };
        self.consume(TokenKind::LBrace, "expected `{` to start class body")?;

        let mut methods = Vec::new();
        let mut static_methods = Vec::new();
        let mut static_fields = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.is_at_end() {
            if self.matches(TokenKind::Semicolon) {
                continue;
            }
            let member_start = self.current_span();
            let is_static = self.matches_keyword(Keyword::Static);
            let is_async = self.matches_keyword(Keyword::Async);
            if self.matches_keyword(Keyword::Func) {
                let def = self.parse_function_def(member_start, is_async, true)?;
                if is_static {
                    static_methods.push(def);
                } else {
                    methods.push(def);
                }
            } else if is_static && !is_async {
                let _ = self.matches_keyword(Keyword::Let);
                let field = self.consume_identifier("expected static field name")?;
                self.consume(TokenKind::Assign, "expected `=` after static field name")?;
                let value = self.parse_expression()?;
                self.consume_optional_semicolon();
                static_fields.push((field.lexeme, value));
            } else {
                return Err(self.error_here("expected `func` or `static` member in class body"));
            }
        }
        self.consume(TokenKind::RBrace, "expected `}` to close class body")?;

        let decl = ClassDecl {
            name: name.lexeme,
            superclass,
            methods,
            static_methods,
            static_fields,
        };
        Ok(self.statement(start, StmtKind::Class(Rc::new(decl))))
    }

    fn parse_if(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let mut branches = vec![(self.parse_expression()?, self.parse_block()?)];
        let mut else_branch = None;
        loop {
            if self.matches_keyword(Keyword::Elif) {
                branches.push((self.parse_expression()?, self.parse_block()?));
            } else if self.matches_keyword(Keyword::Else) {
                if self.matches_keyword(Keyword::If) {
                    branches.push((self.parse_expression()?, self.parse_block()?));
                } else {
                    else_branch = Some(self.parse_block()?);
                    break;
                }
            } else {
                break;
            }
        }
        Ok(self.statement(
            start,
            StmtKind::If {
                branches,
                else_branch,
            },
        ))
    }

    fn parse_while(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let condition = self.parse_expression()?;
        let body = self.parse_block()?;
        Ok(self.statement(start, StmtKind::While { condition, body }))
    }

    fn parse_for(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let binding = self.consume_identifier("expected loop binding after `for`")?;
        self.consume_keyword(Keyword::In, "expected `in` after loop binding")?;
        let iterable = self.parse_expression()?;
        let body = self.parse_block()?;
        Ok(self.statement(
            start,
            StmtKind::For {
                binding: binding.lexeme,
                iterable,
                body,
            },
        ))
    }

    fn parse_match(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let subject = self.parse_expression()?;
        self.consume(TokenKind::LBrace, "expected `{` after match subject")?;
        let mut cases = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.is_at_end() {
            let case_start = self.current_span();
            self.consume_keyword(Keyword::Case, "expected `case` in match body")?;
            let pattern = self.parse_pattern_alternatives()?;
            let guard = if self.matches_keyword(Keyword::If) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            let _ = self.matches(TokenKind::FatArrow) || self.matches(TokenKind::Colon);
            let body = self.parse_block()?;
            cases.push(MatchCase {
                pattern,
                guard,
                body,
                span: case_start.to(self.previous().span),
            });
        }
        self.consume(TokenKind::RBrace, "expected `}` after match cases")?;
        Ok(self.statement(start, StmtKind::Match { subject, cases }))
    }

    fn parse_pattern_alternatives(&mut self) -> Result<Pattern, Diagnostic> {
        let first = self.parse_pattern()?;
        if !self.check(TokenKind::Pipe) {
            return Ok(first);
        }
        let mut alternatives = vec![first];
        while self.matches(TokenKind::Pipe) {
            alternatives.push(self.parse_pattern()?);
        }
        Ok(Pattern::Alternatives(alternatives))
    }

    fn parse_pattern(&mut self) -> Result<Pattern, Diagnostic> {
        match self.peek_kind() {
            TokenKind::Identifier if self.peek_nth_kind(1) == TokenKind::Dot => {
                Ok(Pattern::Value(self.parse_qualified_name()?))
            }
            TokenKind::Identifier => {
                let ident = self.advance();
                if ident.lexeme == "_" {
                    Ok(Pattern::Wildcard)
                } else {
                    Ok(Pattern::Binding(ident.lexeme))
                }
            }
            TokenKind::Minus => {
                self.advance();
                match self.literal_token()? {
                    Literal::Int(value) => Ok(Pattern::Literal(Literal::Int(-value))),
                    Literal::Float(value) => Ok(Pattern::Literal(Literal::Float(-value))),
                    _ => Err(self.error(self.previous(), "expected number after `-` in pattern")),
                }
            }
            TokenKind::Int
            | TokenKind::Float
            | TokenKind::String
            | TokenKind::Keyword(Keyword::True | Keyword::False | Keyword::Null) => {
                Ok(Pattern::Literal(self.literal_token()?))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check(TokenKind::RBracket) {
                    elements.push(self.parse_pattern_alternatives()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                self.consume(TokenKind::RBracket, "expected `]` to close list pattern")?;
                Ok(Pattern::List(elements))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_pattern_alternatives()?;
                self.consume(TokenKind::RParen, "expected `)` after pattern")?;
                Ok(inner)
            }
            _ => Err(self.error_here("expected pattern")),
        }
    }

    fn parse_try(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.check(TokenKind::Keyword(Keyword::Except)) {
            let clause_start = self.advance().span;
            let kind = if self.check(TokenKind::Identifier) {
                Some(self.advance().lexeme)
            } else {
                None
            };
            let binding = if self.matches_keyword(Keyword::As) {
                Some(self.consume_identifier("expected name after `as`")?.lexeme)
            } else {
                None
            };
            let body = self.parse_block()?;
            handlers.push(ExceptClause {
                kind,
                binding,
                body,
                span: clause_start.to(self.previous().span),
            });
        }
        let else_body = if !handlers.is_empty() && self.matches_keyword(Keyword::Else) {
            Some(self.parse_block()?)
        } else {
            None
        };
        let finally = if self.matches_keyword(Keyword::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };
        if handlers.is_empty() && finally.is_none() {
            return Err(self.error_here("expected `except` or `finally` after `try` block"));
        }
        Ok(self.statement(
            start,
            StmtKind::Try(Box::new(TryStmt {
                body,
                handlers,
                else_body,
                finally,
            })),
        ))
    }

    fn parse_return(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let value = if matches!(
            self.peek_kind(),
            TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        ) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume_optional_semicolon();
        Ok(self.statement(start, StmtKind::Return(value)))
    }

    fn parse_bare(&mut self, kind: StmtKind) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        self.consume_optional_semicolon();
        Ok(self.statement(start, kind))
    }

    fn parse_import(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let module = if self.check(TokenKind::String) {
            match self.literal_token()? {
                Literal::String(name) => name,
                _ => return Err(self.error(self.previous(), "expected module name")),
            }
        } else {
            let mut segments =
                vec![self.consume_identifier("expected module name after `import`")?.lexeme];
            while self.matches(TokenKind::Dot) {
                segments.push(self.consume_identifier("expected module segment after `.`")?.lexeme);
            }
            segments.join(".")
        };
        let alias = if self.matches_keyword(Keyword::As) {
            self.consume_identifier("expected alias after `as`")?.lexeme
        } else {
            module.rsplit('.').next().unwrap_or(&module).to_string()
        };
        self.consume_optional_semicolon();
        Ok(self.statement(start, StmtKind::Import { module, alias }))
    }

    fn parse_move(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.advance().span;
        let source = self.consume_identifier("expected binding name after `move`")?;
        if !self.matches_keyword(Keyword::To) && !self.matches(TokenKind::Arrow) {
            return Err(self.error_here("expected `to` after move source"));
        }
        let target = self.consume_identifier("expected destination name after `to`")?;
        self.consume_optional_semicolon();
        Ok(self.statement(
            start,
            StmtKind::Ownership(OwnershipOp::Move {
                source: source.lexeme,
                target: target.lexeme,
            }),
        ))
    }

    fn parse_borrow_target(&mut self) -> Result<(String, bool), Diagnostic> {
        let exclusive = self.matches(TokenKind::Star) || self.matches_keyword(Keyword::Mut);
        let name = self.consume_identifier("expected binding name after `borrow`")?;
        Ok((name.lexeme, exclusive))
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.current_span();
        let expr = self.parse_expression()?;
        let kind = if let Some(op) = self.assignment_operator() {
            let is_target = matches!(
                expr.kind,
                ExprKind::Identifier(_)
                    | ExprKind::Member { .. }
                    | ExprKind::Index { .. }
                    | ExprKind::Unary {
                        op: UnaryOp::Deref,
                        ..
                    }
            );
            if !is_target {
                return Err(Diagnostic::new(DiagnosticKind::Syntax, "invalid assignment target")
                    .with_span(expr.span));
            }
            let value = self.parse_expression()?;
            StmtKind::Assign {
                target: expr,
                op,
                value,
            }
        } else {
            StmtKind::Expr(expr)
        };
        self.consume_optional_semicolon();
        Ok(self.statement(start, kind))
    }

    /// Consumes an assignment operator, yielding the compound operator if any.
    fn assignment_operator(&mut self) -> Option<Option<BinaryOp>> {
        let op = match self.peek_kind() {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinaryOp::Add),
            TokenKind::MinusAssign => Some(BinaryOp::Sub),
            TokenKind::StarAssign => Some(BinaryOp::Mul),
            TokenKind::SlashAssign => Some(BinaryOp::Div),
            TokenKind::PercentAssign => Some(BinaryOp::Mod),
            TokenKind::StarStarAssign => Some(BinaryOp::Pow),
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_expression(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_binary(1)
    }

    fn binary_operator(&self) -> Option<(BinaryOp, u8)> {
        let entry = match self.peek_kind() {
            TokenKind::Keyword(Keyword::Or) | TokenKind::DoublePipe => (BinaryOp::Or, 1),
            TokenKind::Keyword(Keyword::And) | TokenKind::DoubleAmpersand => (BinaryOp::And, 2),
            TokenKind::EqualEqual => (BinaryOp::Equal, 3),
            TokenKind::BangEqual => (BinaryOp::NotEqual, 3),
            TokenKind::Less => (BinaryOp::Less, 4),
            TokenKind::LessEqual => (BinaryOp::LessEqual, 4),
            TokenKind::Greater => (BinaryOp::Greater, 4),
            TokenKind::GreaterEqual => (BinaryOp::GreaterEqual, 4),
            TokenKind::Pipe => (BinaryOp::BitOr, 5),
            TokenKind::Caret => (BinaryOp::BitXor, 6),
            TokenKind::Ampersand => (BinaryOp::BitAnd, 7),
            TokenKind::ShiftLeft => (BinaryOp::ShiftLeft, 8),
            TokenKind::ShiftRight => (BinaryOp::ShiftRight, 8),
            TokenKind::Plus => (BinaryOp::Add, 9),
            TokenKind::Minus => (BinaryOp::Sub, 9),
            TokenKind::Star => (BinaryOp::Mul, 10),
            TokenKind::Slash => (BinaryOp::Div, 10),
            TokenKind::Percent => (BinaryOp::Mod, 10),
            _ => return None,
        };
        Some(entry)
    }

    /// Precedence climbing over the left-associative binary levels.
    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_unary()?;
        while let Some((op, precedence)) = self.binary_operator() {
            if precedence < min_precedence {
                break;
            }
            self.advance();
            let right = self.parse_binary(precedence + 1)?;
            left = Expr {
                span: left.span.to(right.span),
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, Diagnostic> {
        ensure_sufficient_stack(|| self.parse_unary_inner())
    }

    fn parse_unary_inner(&mut self) -> Result<Expr, Diagnostic> {
        let start = self.current_span();
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Bang | TokenKind::Keyword(Keyword::Not) => Some(UnaryOp::Not),
            TokenKind::Star => Some(UnaryOp::Deref),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr {
                span: start.to(expr.span),
                kind: ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                },
            });
        }
        if self.matches_keyword(Keyword::Await) {
            let expr = self.parse_unary()?;
            return Ok(Expr {
                span: start.to(expr.span),
                kind: ExprKind::Await(Box::new(expr)),
            });
        }
        if self.matches_keyword(Keyword::Borrow) {
            let (name, exclusive) = self.parse_borrow_target()?;
            return Ok(Expr {
                span: start.to(self.previous().span),
                kind: ExprKind::Borrow { name, exclusive },
            });
        }
        self.parse_power()
    }

    /// `**` binds tighter than unary minus on its left and is right-associative.
    fn parse_power(&mut self) -> Result<Expr, Diagnostic> {
        let base = self.parse_postfix()?;
        if !self.matches(TokenKind::StarStar) {
            return Ok(base);
        }
        let exponent = self.parse_unary()?;
        Ok(Expr {
            span: base.span.to(exponent.span),
            kind: ExprKind::Binary {
                op: BinaryOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            },
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, Diagnostic> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.matches(TokenKind::LParen) {
                let args = self.parse_arguments()?;
                expr = Expr {
                    span: expr.span.to(self.previous().span),
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                };
            } else if self.matches(TokenKind::LBracket) {
                let index = self.parse_expression()?;
                let bracket = self.consume(TokenKind::RBracket, "expected `]` after index")?;
                expr = Expr {
                    span: expr.span.to(bracket.span),
                    kind: ExprKind::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    },
                };
            } else if self.matches(TokenKind::Dot) {
                let ident = self.consume_identifier("expected member name after `.`")?;
                expr = Expr {
                    span: expr.span.to(ident.span),
                    kind: ExprKind::Member {
                        target: Box::new(expr),
                        name: ident.lexeme,
                    },
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Parses arguments after an already consumed `(`, through the closing `)`.
    fn parse_arguments(&mut self) -> Result<Vec<Expr>, Diagnostic> {
        let mut args = Vec::new();
        while !self.check(TokenKind::RParen) {
            args.push(self.parse_expression()?);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RParen, "expected `)` after arguments")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, Diagnostic> {
        let start = self.current_span();
        match self.peek_kind() {
            TokenKind::Int
            | TokenKind::Float
            | TokenKind::String
            | TokenKind::Keyword(Keyword::True | Keyword::False | Keyword::Null) => {
                let literal = self.literal_token()?;
                Ok(Expr {
                    span: start,
                    kind: ExprKind::Literal(literal),
                })
            }
            TokenKind::Identifier => {
                let tok = self.advance();
                Ok(Expr {
                    span: tok.span,
                    kind: ExprKind::Identifier(tok.lexeme),
                })
            }
            TokenKind::Keyword(Keyword::SelfValue) => {
                let tok = self.advance();
                Ok(Expr {
                    span: tok.span,
                    kind: ExprKind::Identifier("self".into()),
                })
            }
            TokenKind::Keyword(Keyword::Super) => {
                self.advance();
                self.consume(TokenKind::Dot, "expected `.` after `super`")?;
                let name = self.consume_identifier("expected method name after `super.`")?;
                Ok(Expr {
                    span: start.to(name.span),
                    kind: ExprKind::Super(name.lexeme),
                })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                let rparen = self.consume(TokenKind::RParen, "expected `)` after expression")?;
                Ok(Expr {
                    span: start.to(rparen.span),
                    kind: inner.kind,
                })
            }
            TokenKind::LBracket => self.parse_list(),
            TokenKind::LBrace => self.parse_dict(),
            TokenKind::Keyword(Keyword::New) => {
                self.advance();
                let class = self.parse_qualified_name()?;
                let args = if self.matches(TokenKind::LParen) {
                    self.parse_arguments()?
                } else {
                    Vec::new()
                };
                Ok(Expr {
                    span: start.to(self.previous().span),
                    kind: ExprKind::New {
                        class: Box::new(class),
                        args,
                    },
                })
            }
            TokenKind::Pipe | TokenKind::DoublePipe => self.parse_lambda(),
            TokenKind::Keyword(Keyword::Func) => {
                self.advance();
                let def = self.parse_function_def(start, false, false)?;
                Ok(Expr {
                    span: def.span,
                    kind: ExprKind::Lambda(def),
                })
            }
            _ => Err(self.error_here("expected expression")),
        }
    }

    fn parse_list(&mut self) -> Result<Expr, Diagnostic> {
        let start = self.advance().span;
        if self.matches(TokenKind::RBracket) {
            return Ok(Expr {
                span: start.to(self.previous().span),
                kind: ExprKind::List(Vec::new()),
            });
        }
        let first = self.parse_expression()?;
        if self.check(TokenKind::Keyword(Keyword::For)) {
            let comprehension = self.parse_comprehension_tail(ComprehensionBody::List(first))?;
            self.consume(TokenKind::RBracket, "expected `]` after list comprehension")?;
            return Ok(Expr {
                span: start.to(self.previous().span),
                kind: ExprKind::Comprehension(Box::new(comprehension)),
            });
        }
        let mut elements = vec![first];
        while self.matches(TokenKind::Comma) {
            if self.check(TokenKind::RBracket) {
                break;
            }
            elements.push(self.parse_expression()?);
        }
        self.consume(TokenKind::RBracket, "expected `]` after list elements")?;
        Ok(Expr {
            span: start.to(self.previous().span),
            kind: ExprKind::List(elements),
        })
    }

    fn parse_dict(&mut self) -> Result<Expr, Diagnostic> {
        let start = self.advance().span;
        if self.matches(TokenKind::RBrace) {
            return Ok(Expr {
                span: start.to(self.previous().span),
                kind: ExprKind::Dict(Vec::new()),
            });
        }
        let key = self.parse_expression()?;
        self.consume(TokenKind::Colon, "expected `:` after dictionary key")?;
        let value = self.parse_expression()?;
        if self.check(TokenKind::Keyword(Keyword::For)) {
            let comprehension =
                self.parse_comprehension_tail(ComprehensionBody::Dict(key, value))?;
            self.consume(TokenKind::RBrace, "expected `}` after dictionary comprehension")?;
            return Ok(Expr {
                span: start.to(self.previous().span),
                kind: ExprKind::Comprehension(Box::new(comprehension)),
            });
        }
        let mut entries = vec![(key, value)];
        while self.matches(TokenKind::Comma) {
            if self.check(TokenKind::RBrace) {
                break;
            }
            let key = self.parse_expression()?;
            self.consume(TokenKind::Colon, "expected `:` after dictionary key")?;
            entries.push((key, self.parse_expression()?));
        }
        self.consume(TokenKind::RBrace, "expected `}` after dictionary entries")?;
        Ok(Expr {
            span: start.to(self.previous().span),
            kind: ExprKind::Dict(entries),
        })
    }

    fn parse_comprehension_tail(
        &mut self,
        body: ComprehensionBody,
    ) -> Result<Comprehension, Diagnostic> {
        self.consume_keyword(Keyword::For, "expected `for` in comprehension")?;
        let binding = self.consume_identifier("expected comprehension binding")?;
        self.consume_keyword(Keyword::In, "expected `in` in comprehension")?;
        let iterable = self.parse_expression()?;
        let filter = if self.matches_keyword(Keyword::If) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Comprehension {
            body,
            binding: binding.lexeme,
            iterable,
            filter,
        })
    }

    fn parse_lambda(&mut self) -> Result<Expr, Diagnostic> {
        let start = self.current_span();
        let mut params = Vec::new();
        if !self.matches(TokenKind::DoublePipe) {
            self.consume(TokenKind::Pipe, "expected `|` to start lambda")?;
            while !self.check(TokenKind::Pipe) {
                let param = self.consume_identifier("expected parameter in lambda")?;
                params.push(Param {
                    name: param.lexeme,
                    default: None,
                    span: param.span,
                });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::Pipe, "expected closing `|` in lambda")?;
        }
        let body = if self.check(TokenKind::LBrace) {
            self.parse_block()?
        } else {
            let value = self.parse_expression()?;
            vec![Stmt {
                span: value.span,
                kind: StmtKind::Return(Some(value)),
            }]
        };
        let span = start.to(self.previous().span);
        Ok(Expr {
            span,
            kind: ExprKind::Lambda(Rc::new(FunctionDef {
                name: None,
                params,
                body,
                is_async: false,
                span,
            })),
        })
    }

    /// `Name` or `module.Name`, used by `new`, base-class clauses and value
    /// patterns.
    fn parse_qualified_name(&mut self) -> Result<Expr, Diagnostic> {
        let first = self.consume_identifier("expected name")?;
        let mut expr = Expr {
            span: first.span,
            kind: ExprKind::Identifier(first.lexeme),
        };
        while self.matches(TokenKind::Dot) {
            let ident = self.consume_identifier("expected name after `.`")?;
            expr = Expr {
                span: expr.span.to(ident.span),
                kind: ExprKind::Member {
                    target: Box::new(expr),
                    name: ident.lexeme,
                },
            };
        }
        Ok(expr)
    }

    fn literal_token(&mut self) -> Result<Literal, Diagnostic> {
        match self.peek().and_then(|token| token.literal.clone()) {
            Some(literal) => {
                self.advance();
                Ok(literal)
            }
            None => Err(self.error_here("expected literal")),
        }
    }

    fn statement(&self, start: SourceSpan, kind: StmtKind) -> Stmt {
        Stmt {
            span: start.to(self.previous().span),
            kind,
        }
    }

    fn consume_optional_semicolon(&mut self) {
        let _ = self.matches(TokenKind::Semicolon);
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn matches_keyword(&mut self, keyword: Keyword) -> bool {
        self.matches(TokenKind::Keyword(keyword))
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token, Diagnostic> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(message))
        }
    }

    fn consume_keyword(&mut self, keyword: Keyword, message: &str) -> Result<Token, Diagnostic> {
        self.consume(TokenKind::Keyword(keyword), message)
    }

    fn consume_identifier(&mut self, message: &str) -> Result<Token, Diagnostic> {
        self.consume(TokenKind::Identifier, message)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous().clone()
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1).min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.current)
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek_nth_kind(0)
    }

    fn peek_nth_kind(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.current + offset)
            .map(|token| token.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn current_span(&self) -> SourceSpan {
        self.peek()
            .or_else(|| self.tokens.last())
            .map(|token| token.span)
            .unwrap_or_default()
    }

    fn is_at_end(&self) -> bool {
        self.peek_kind() == TokenKind::Eof
    }

    fn error(&self, token: &Token, message: &str) -> Diagnostic {
        let found = match token.kind {
            TokenKind::Eof => "end of input".to_string(),
            _ => format!("`{}`", token.lexeme),
        };
        Diagnostic::new(DiagnosticKind::Syntax, format!("{message}, found {found}"))
            .with_span(token.span)
    }

    fn error_here(&self, message: &str) -> Diagnostic {
        match self.peek() {
            Some(token) => self.error(token, message),
            None => self.error_eof(message),
        }
    }

    fn error_eof(&self, message: &str) -> Diagnostic {
        Diagnostic::new(
            DiagnosticKind::Syntax,
            format!("{message}, found end of input"),
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn expression(source: &str) -> Expr {
        let program = parse(source).expect("source should parse");
        match program.statements.into_iter().next().map(|stmt| stmt.kind) {
            Some(StmtKind::Expr(expr)) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    /// Renders an expression tree with explicit grouping.
    fn shape(expr: &Expr) -> String {
        match &expr.kind {
            ExprKind::Literal(Literal::Int(value)) => value.to_string(),
            ExprKind::Identifier(name) => name.clone(),
            ExprKind::Binary { op, left, right } => {
                format!("({} {} {})", shape(left), op.symbol(), shape(right))
            }
            ExprKind::Unary { op, expr } => format!("({op:?} {})", shape(expr)),
            ExprKind::Call { callee, args } => format!(
                "{}({})",
                shape(callee),
                args.iter().map(shape).collect::<Vec<_>>().join(", ")
            ),
            ExprKind::Member { target, name } => format!("{}.{name}", shape(target)),
            other => format!("{other:?}"),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        assert_eq!(shape(&expression("2 + 3 * 4")), "(2 + (3 * 4))");
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(shape(&expression("2 ** 3 ** 2")), "(2 ** (3 ** 2))");
    }

    #[test]
    fn unary_minus_applies_after_power() {
        assert_eq!(shape(&expression("-2 ** 2")), "(Negate (2 ** 2))");
        assert_eq!(shape(&expression("2 ** -1")), "(2 ** (Negate 1))");
    }

    #[test]
    fn logical_operators_have_lowest_precedence() {
        assert_eq!(
            shape(&expression("a or b and c == d")),
            "(a or (b and (c == d)))"
        );
        assert_eq!(shape(&expression("a || b && c")), "(a or (b and c))");
    }

    #[test]
    fn subtraction_is_left_associative() {
        assert_eq!(shape(&expression("10 - 4 - 3")), "((10 - 4) - 3)");
    }

    #[test]
    fn postfix_chains_parse_left_to_right() {
        assert_eq!(shape(&expression("a.b(1).c")), "a.b(1).c");
    }

    #[test]
    fn parses_compound_assignment() {
        let program = parse("count += 1").unwrap();
        match &program.statements[0].kind {
            StmtKind::Assign {
                op: Some(BinaryOp::Add),
                target,
                ..
            } => assert!(matches!(target.kind, ExprKind::Identifier(ref n) if n == "count")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_assignment_target() {
        let err = parse("1 + 2 = 3").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Syntax);
        assert!(err.message.contains("invalid assignment target"));
    }

    #[test]
    fn parses_class_with_both_base_syntaxes() {
        for source in ["class Dog : Animal {}", "class Dog(Animal) {}"] {
            let program = parse(source).unwrap();
            match &program.statements[0].kind {
                StmtKind::Class(decl) => {
                    assert_eq!(decl.name, "Dog");
                    assert!(decl.superclass.is_some());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn parses_class_members() {
        let source = r#"
            class Counter {
                static let created = 0
                static func make() { return new Counter() }
                func __init__(self) { self.n = 0 }
                async func tick(self) { self.n += 1 }
            }
        "#;
        let program = parse(source).unwrap();
        let StmtKind::Class(decl) = &program.statements[0].kind else {
            panic!("expected class");
        };
        assert_eq!(decl.static_fields.len(), 1);
        assert_eq!(decl.static_methods.len(), 1);
        assert_eq!(decl.methods.len(), 2);
        assert!(decl.methods[1].is_async);
    }

    #[test]
    fn parses_elif_chain() {
        let program = parse("if a { 1 } elif b { 2 } else if c { 3 } else { 4 }").unwrap();
        match &program.statements[0].kind {
            StmtKind::If {
                branches,
                else_branch,
            } => {
                assert_eq!(branches.len(), 3);
                assert!(else_branch.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_match_with_alternatives_and_guard() {
        let source = "match x { case 1 | 2 { a } case [h, _] if h > 0 { b } case _ { c } }";
        let program = parse(source).unwrap();
        let StmtKind::Match { cases, .. } = &program.statements[0].kind else {
            panic!("expected match");
        };
        assert_eq!(cases.len(), 3);
        assert!(matches!(&cases[0].pattern, Pattern::Alternatives(alts) if alts.len() == 2));
        assert!(cases[1].guard.is_some());
        assert!(matches!(cases[2].pattern, Pattern::Wildcard));
    }

    #[test]
    fn dotted_case_names_are_value_patterns() {
        let source = "match c { case Color.RED | other { a } }";
        let program = parse(source).unwrap();
        let StmtKind::Match { cases, .. } = &program.statements[0].kind else {
            panic!("expected match");
        };
        let Pattern::Alternatives(alts) = &cases[0].pattern else {
            panic!("expected alternatives");
        };
        assert!(matches!(&alts[0], Pattern::Value(expr) if shape(expr) == "Color.RED"));
        assert!(matches!(&alts[1], Pattern::Binding(name) if name == "other"));
    }

    #[test]
    fn bitwise_levels_sit_between_comparison_and_arithmetic() {
        assert_eq!(
            shape(&expression("a | b ^ c & d << 1 + 2")),
            "(a | (b ^ (c & (d << (1 + 2)))))"
        );
        assert_eq!(shape(&expression("x & 1 == 0")), "((x & 1) == 0)");
        assert_eq!(shape(&expression("~a >> 2")), "((BitNot a) >> 2)");
    }

    #[test]
    fn parses_try_with_all_clauses() {
        let source = "try { a } except ZeroDivisionError as e { b } except { c } else { d } finally { e }";
        let program = parse(source).unwrap();
        let StmtKind::Try(stmt) = &program.statements[0].kind else {
            panic!("expected try");
        };
        assert_eq!(stmt.handlers.len(), 2);
        assert_eq!(stmt.handlers[0].kind.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(stmt.handlers[0].binding.as_deref(), Some("e"));
        assert!(stmt.else_body.is_some());
        assert!(stmt.finally.is_some());
    }

    #[test]
    fn try_requires_a_handler() {
        let err = parse("try { a }").unwrap_err();
        assert!(err.message.contains("expected `except` or `finally`"));
    }

    #[test]
    fn parses_ownership_statements() {
        let program = parse("move a to b\nborrow *b\nrelease b\nlet r = borrow mut b").unwrap();
        let kinds: Vec<_> = program.statements.iter().map(|s| &s.kind).collect();
        assert!(matches!(kinds[0], StmtKind::Ownership(OwnershipOp::Move { source, target }) if source == "a" && target == "b"));
        assert!(matches!(
            kinds[1],
            StmtKind::Ownership(OwnershipOp::Borrow { exclusive: true, .. })
        ));
        assert!(matches!(kinds[2], StmtKind::Ownership(OwnershipOp::Release(name)) if name == "b"));
        assert!(matches!(
            kinds[3],
            StmtKind::VarDecl {
                value: Some(Expr {
                    kind: ExprKind::Borrow { exclusive: true, .. },
                    ..
                }),
                ..
            }
        ));
    }

    #[test]
    fn parses_comprehensions() {
        let list = expression("[x * 2 for x in items if x > 1]");
        assert!(matches!(
            &list.kind,
            ExprKind::Comprehension(c) if matches!(c.body, ComprehensionBody::List(_)) && c.filter.is_some()
        ));
        let dict = expression("{k: v for k in keys}");
        assert!(matches!(
            &dict.kind,
            ExprKind::Comprehension(c) if matches!(c.body, ComprehensionBody::Dict(..))
        ));
    }

    #[test]
    fn parses_import_alias() {
        let program = parse("import math as m\nimport \"time\"").unwrap();
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Import { module, alias } if module == "math" && alias == "m"
        ));
        assert!(matches!(
            &program.statements[1].kind,
            StmtKind::Import { module, alias } if module == "time" && alias == "time"
        ));
    }

    #[test]
    fn lambda_body_returns_its_expression() {
        let lambda = expression("|a, b| a + b");
        let ExprKind::Lambda(def) = &lambda.kind else {
            panic!("expected lambda");
        };
        assert_eq!(def.params.len(), 2);
        assert!(matches!(def.body[0].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn reports_position_of_unexpected_token() {
        let err = parse("let x = (1 + 2").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::Syntax);
        assert!(err.message.contains("expected `)`"));
        assert!(err.message.contains("end of input"));
    }
}

use crate::ast::Literal;
use crate::diagnostics::{Diagnostic, DiagnosticKind, SourceSpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Let,
    Mut,
    Const,
    Func,
    Async,
    Await,
    Yield,
    Class,
    Static,
    New,
    SelfValue,
    Super,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Return,
    Match,
    Case,
    Try,
    Except,
    Finally,
    Raise,
    Throw,
    Assert,
    Import,
    As,
    Move,
    To,
    Borrow,
    Release,
    And,
    Or,
    Not,
    True,
    False,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier,
    Int,
    Float,
    String,
    Keyword(Keyword),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,
    Arrow,
    FatArrow,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    StarStarAssign,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Ampersand,
    Pipe,
    DoubleAmpersand,
    DoublePipe,
    Caret,
    Tilde,
    ShiftLeft,
    ShiftRight,
    Bang,
    BangEqual,
    EqualEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub literal: Option<Literal>,
    pub span: SourceSpan,
}

#[derive(Clone, Copy)]
struct Mark {
    start: usize,
    line: usize,
    column: usize,
}

/// Streaming tokenizer. Yields tokens until (and including) a single `Eof`
/// token, or stops after the first error.
pub struct Lexer<'a> {
    source: &'a str,
    chars: std::str::CharIndices<'a>,
    current: usize,
    peeked: Option<(usize, char)>,
    line: usize,
    column: usize,
    finished: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices(),
            current: 0,
            peeked: None,
            line: 1,
            column: 1,
            finished: false,
        }
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        let next = match self.peeked.take() {
            Some(pair) => Some(pair),
            None => self.chars.next(),
        };
        let (idx, ch) = next?;
        self.current = idx + ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some((idx, ch))
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        if self.peeked.is_none() {
            self.peeked = self.chars.next();
        }
        self.peeked
    }

    fn peek_second(&mut self) -> Option<char> {
        self.peek();
        self.chars.clone().next().map(|(_, ch)| ch)
    }

    fn match_next(&mut self, expected: char) -> bool {
        match self.peek() {
            Some((_, ch)) if ch == expected => {
                self.bump();
                true
            }
            _ => false,
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            start: self.current,
            line: self.line,
            column: self.column,
        }
    }

    fn span_from(&self, mark: Mark) -> SourceSpan {
        SourceSpan::new(mark.start, self.current, mark.line, mark.column)
    }

    fn skip_line(&mut self) {
        while let Some((_, ch)) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), Diagnostic> {
        loop {
            let Some((_, ch)) = self.peek() else {
                return Ok(());
            };
            match (ch, self.peek_second()) {
                (ch, _) if ch.is_whitespace() => {
                    self.bump();
                }
                ('#', _) | ('/', Some('/')) | (':', Some(':')) => self.skip_line(),
                ('/', Some('*')) => {
                    let mark = self.mark();
                    self.bump();
                    self.bump();
                    let mut depth = 1;
                    while depth > 0 {
                        match self.bump() {
                            Some((_, '/')) if self.match_next('*') => depth += 1,
                            Some((_, '*')) if self.match_next('/') => depth -= 1,
                            Some(_) => {}
                            None => {
                                return Err(Diagnostic::new(
                                    DiagnosticKind::Syntax,
                                    "unterminated block comment",
                                )
                                .with_span(self.span_from(mark)))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn identifier_or_keyword(&mut self, mark: Mark) -> Token {
        while let Some((_, ch)) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let source = self.source;
        let lexeme = &source[mark.start..self.current];
        match keyword_for(lexeme) {
            Some(keyword) => {
                let literal = match keyword {
                    Keyword::True => Some(Literal::Bool(true)),
                    Keyword::False => Some(Literal::Bool(false)),
                    Keyword::Null => Some(Literal::Null),
                    _ => None,
                };
                Token {
                    kind: TokenKind::Keyword(keyword),
                    lexeme: lexeme.to_string(),
                    literal,
                    span: self.span_from(mark),
                }
            }
            None => self.simple_token(mark, TokenKind::Identifier),
        }
    }

    fn number_literal(&mut self, mark: Mark) -> Result<Token, Diagnostic> {
        let mut is_float = false;
        while let Some((_, ch)) = self.peek() {
            match ch {
                '0'..='9' | '_' => {
                    self.bump();
                }
                '.' if !is_float && matches!(self.peek_second(), Some('0'..='9')) => {
                    is_float = true;
                    self.bump();
                }
                'e' | 'E' => {
                    let next = self.peek_second();
                    let signed = matches!(next, Some('+' | '-'));
                    if !signed && !matches!(next, Some('0'..='9')) {
                        break;
                    }
                    is_float = true;
                    self.bump();
                    if signed {
                        self.bump();
                    }
                }
                _ => break,
            }
        }
        let span = self.span_from(mark);
        let source = self.source;
        let lexeme = &source[mark.start..self.current];
        let digits: String = lexeme.chars().filter(|ch| *ch != '_').collect();
        let invalid = || {
            Diagnostic::new(
                DiagnosticKind::Syntax,
                format!("invalid numeric literal `{lexeme}`"),
            )
            .with_span(span)
        };
        let (kind, literal) = if is_float {
            let value = digits.parse::<f64>().map_err(|_| invalid())?;
            (TokenKind::Float, Literal::Float(value))
        } else {
            let value = digits.parse::<i64>().map_err(|_| invalid())?;
            (TokenKind::Int, Literal::Int(value))
        };
        Ok(Token {
            kind,
            lexeme: lexeme.to_string(),
            literal: Some(literal),
            span,
        })
    }

    fn string_literal(&mut self, mark: Mark, quote: char) -> Result<Token, Diagnostic> {
        let mut value = String::new();
        while let Some((_, ch)) = self.bump() {
            match ch {
                c if c == quote => {
                    return Ok(Token {
                        kind: TokenKind::String,
                        lexeme: self.source[mark.start..self.current].to_string(),
                        literal: Some(Literal::String(value)),
                        span: self.span_from(mark),
                    });
                }
                '\\' => match self.bump() {
                    Some((_, esc)) => match esc {
                        'n' => value.push('\n'),
                        'r' => value.push('\r'),
                        't' => value.push('\t'),
                        '0' => value.push('\0'),
                        other => value.push(other),
                    },
                    None => break,
                },
                _ => value.push(ch),
            }
        }
        Err(
            Diagnostic::new(DiagnosticKind::Syntax, "unterminated string literal")
                .with_span(self.span_from(mark)),
        )
    }

    fn simple_token(&mut self, mark: Mark, kind: TokenKind) -> Token {
        Token {
            kind,
            lexeme: self.source[mark.start..self.current].to_string(),
            literal: None,
            span: self.span_from(mark),
        }
    }

    /// Picks `double` when the next character is `follow`, otherwise `single`.
    fn either(&mut self, mark: Mark, follow: char, double: TokenKind, single: TokenKind) -> Token {
        let kind = if self.match_next(follow) {
            double
        } else {
            single
        };
        self.simple_token(mark, kind)
    }

    fn next_token(&mut self) -> Result<Token, Diagnostic> {
        self.skip_whitespace_and_comments()?;
        let mark = self.mark();
        let Some((_, ch)) = self.bump() else {
            self.finished = true;
            return Ok(self.simple_token(mark, TokenKind::Eof));
        };

        let token = match ch {
            c if c.is_alphabetic() || c == '_' => self.identifier_or_keyword(mark),
            '0'..='9' => self.number_literal(mark)?,
            '"' | '\'' => self.string_literal(mark, ch)?,
            '(' => self.simple_token(mark, TokenKind::LParen),
            ')' => self.simple_token(mark, TokenKind::RParen),
            '{' => self.simple_token(mark, TokenKind::LBrace),
            '}' => self.simple_token(mark, TokenKind::RBrace),
            '[' => self.simple_token(mark, TokenKind::LBracket),
            ']' => self.simple_token(mark, TokenKind::RBracket),
            ',' => self.simple_token(mark, TokenKind::Comma),
            '.' => self.simple_token(mark, TokenKind::Dot),
            ';' => self.simple_token(mark, TokenKind::Semicolon),
            ':' => self.simple_token(mark, TokenKind::Colon),
            '+' => self.either(mark, '=', TokenKind::PlusAssign, TokenKind::Plus),
            '-' => {
                if self.match_next('>') {
                    self.simple_token(mark, TokenKind::Arrow)
                } else {
                    self.either(mark, '=', TokenKind::MinusAssign, TokenKind::Minus)
                }
            }
            '*' => {
                if self.match_next('*') {
                    self.either(mark, '=', TokenKind::StarStarAssign, TokenKind::StarStar)
                } else {
                    self.either(mark, '=', TokenKind::StarAssign, TokenKind::Star)
                }
            }
            '/' => self.either(mark, '=', TokenKind::SlashAssign, TokenKind::Slash),
            '%' => self.either(mark, '=', TokenKind::PercentAssign, TokenKind::Percent),
            '=' => {
                if self.match_next('>') {
                    self.simple_token(mark, TokenKind::FatArrow)
                } else {
                    self.either(mark, '=', TokenKind::EqualEqual, TokenKind::Assign)
                }
            }
            '!' => self.either(mark, '=', TokenKind::BangEqual, TokenKind::Bang),
            '&' => self.either(mark, '&', TokenKind::DoubleAmpersand, TokenKind::Ampersand),
            '|' => self.either(mark, '|', TokenKind::DoublePipe, TokenKind::Pipe),
            '^' => self.simple_token(mark, TokenKind::Caret),
            '~' => self.simple_token(mark, TokenKind::Tilde),
            '<' => {
                if self.match_next('<') {
                    self.simple_token(mark, TokenKind::ShiftLeft)
                } else {
                    self.either(mark, '=', TokenKind::LessEqual, TokenKind::Less)
                }
            }
            '>' => {
                if self.match_next('>') {
                    self.simple_token(mark, TokenKind::ShiftRight)
                } else {
                    self.either(mark, '=', TokenKind::GreaterEqual, TokenKind::Greater)
                }
            }
            other => {
                return Err(Diagnostic::new(
                    DiagnosticKind::Syntax,
                    format!("unexpected character `{other}`"),
                )
                .with_span(self.span_from(mark)))
            }
        };
        Ok(token)
    }

    pub fn tokenize(self) -> Result<Vec<Token>, Diagnostic> {
        self.collect()
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, Diagnostic>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let result = self.next_token();
        if result.is_err() {
            self.finished = true;
        }
        Some(result)
    }
}

fn keyword_for(ident: &str) -> Option<Keyword> {
    use self::Keyword as Kw;
    let keyword = match ident {
        "let" => Kw::Let,
        "mut" => Kw::Mut,
        "const" => Kw::Const,
        "func" => Kw::Func,
        "async" => Kw::Async,
        "await" => Kw::Await,
        "yield" => Kw::Yield,
        "class" => Kw::Class,
        "static" => Kw::Static,
        "new" => Kw::New,
        "self" => Kw::SelfValue,
        "super" => Kw::Super,
        "if" => Kw::If,
        "elif" => Kw::Elif,
        "else" => Kw::Else,
        "while" => Kw::While,
        "for" => Kw::For,
        "in" => Kw::In,
        "break" => Kw::Break,
        "continue" => Kw::Continue,
        "return" => Kw::Return,
        "match" => Kw::Match,
        "case" => Kw::Case,
        "try" => Kw::Try,
        "except" => Kw::Except,
        "finally" => Kw::Finally,
        "raise" => Kw::Raise,
        "throw" => Kw::Throw,
        "assert" => Kw::Assert,
        "import" => Kw::Import,
        "as" => Kw::As,
        "move" => Kw::Move,
        "to" => Kw::To,
        "borrow" => Kw::Borrow,
        "release" => Kw::Release,
        "and" => Kw::And,
        "or" => Kw::Or,
        "not" => Kw::Not,
        "true" | "True" => Kw::True,
        "false" | "False" => Kw::False,
        "null" | "None" => Kw::Null,
        _ => return None,
    };
    Some(keyword)
}

use std::fmt;

use thiserror::Error;

use crate::value::{Value, ValueKind};

/// Byte range of a construct in the source, plus the 1-based line and column
/// of its first character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl SourceSpan {
    pub const fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    /// Span covering `self` through the end of `other`.
    pub fn to(self, other: SourceSpan) -> SourceSpan {
        SourceSpan {
            end: other.end.max(self.end),
            ..self
        }
    }
}

/// Classification of a diagnostic event. Each kind maps to the error name a
/// script sees in `except` clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    Syntax,
    Name,
    Type,
    Attribute,
    ZeroDivision,
    Index,
    Key,
    Immutable,
    Ownership,
    Import,
    Assertion,
    Recursion,
    Runtime,
    Custom(String),
}

impl DiagnosticKind {
    pub fn name(&self) -> &str {
        match self {
            DiagnosticKind::Syntax => "SyntaxError",
            DiagnosticKind::Name => "NameError",
            DiagnosticKind::Type => "TypeError",
            DiagnosticKind::Attribute => "AttributeError",
            DiagnosticKind::ZeroDivision => "ZeroDivisionError",
            DiagnosticKind::Index => "IndexError",
            DiagnosticKind::Key => "KeyError",
            DiagnosticKind::Immutable => "ImmutableError",
            DiagnosticKind::Ownership => "OwnershipError",
            DiagnosticKind::Import => "ImportError",
            DiagnosticKind::Assertion => "AssertionError",
            DiagnosticKind::Recursion => "RecursionError",
            DiagnosticKind::Runtime => "RuntimeError",
            DiagnosticKind::Custom(name) => name,
        }
    }
}

/// Rich diagnostic information surfaced to end users.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Option<SourceSpan>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
            notes: Vec::new(),
        }
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)?;
        if let Some(span) = self.span {
            write!(f, " (line {}, column {})", span.line, span.column)?;
        }
        for note in &self.notes {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// A script-level value in flight after `raise`/`throw`, or a runtime error
/// that has been caught and re-raised.
#[derive(Debug, Clone)]
pub struct Thrown {
    pub value: Value,
    pub span: Option<SourceSpan>,
}

impl Thrown {
    pub fn kind_name(&self) -> String {
        match &*self.value.0 {
            ValueKind::Error(err) => err.kind.clone(),
            ValueKind::Instance(instance) => instance.borrow().class.name.clone(),
            _ => "Error".into(),
        }
    }

    pub fn message(&self) -> String {
        match &*self.value.0 {
            ValueKind::Error(err) => err.message.clone(),
            ValueKind::Instance(instance) => instance
                .borrow()
                .fields
                .get("message")
                .map(|message| message.to_string())
                .unwrap_or_default(),
            _ => self.value.to_string(),
        }
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind_name(), self.message())?;
        if let Some(span) = self.span {
            write!(f, " (line {}, column {})", span.line, span.column)?;
        }
        Ok(())
    }
}

/// Unified error type for the KentScript toolchain.
#[derive(Debug, Error)]
pub enum KentError {
    #[error("{0}")]
    Diagnostic(#[from] Diagnostic),
    #[error("{0}")]
    Thrown(Box<Thrown>),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KentError {
    pub fn kind_name(&self) -> String {
        match self {
            KentError::Diagnostic(diag) => diag.kind.name().to_string(),
            KentError::Thrown(thrown) => thrown.kind_name(),
            KentError::Io(_) => "IOError".into(),
        }
    }

    pub fn span(&self) -> Option<SourceSpan> {
        match self {
            KentError::Diagnostic(diag) => diag.span,
            KentError::Thrown(thrown) => thrown.span,
            KentError::Io(_) => None,
        }
    }

    /// The value an `except` clause binds for this error.
    pub fn to_value(&self) -> Value {
        match self {
            KentError::Diagnostic(diag) => Value::error(diag.kind.name(), diag.message.clone()),
            KentError::Thrown(thrown) => thrown.value.clone(),
            KentError::Io(err) => Value::error("IOError", err.to_string()),
        }
    }

    pub fn to_thrown(&self) -> Thrown {
        Thrown {
            value: self.to_value(),
            span: self.span(),
        }
    }

    /// Attach `span` unless the error already points somewhere more precise.
    pub fn or_span(self, span: SourceSpan) -> Self {
        match self {
            KentError::Diagnostic(diag) if diag.span.is_none() => {
                KentError::Diagnostic(diag.with_span(span))
            }
            KentError::Thrown(mut thrown) if thrown.span.is_none() => {
                thrown.span = Some(span);
                KentError::Thrown(thrown)
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, KentError>;

/// Shorthand for a spanned runtime error of the given kind.
pub fn error_at(kind: DiagnosticKind, message: impl Into<String>, span: SourceSpan) -> KentError {
    KentError::from(Diagnostic::new(kind, message).with_span(span))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn diagnostic_display_includes_position() {
        let diag = Diagnostic::new(DiagnosticKind::ZeroDivision, "division by zero")
            .with_span(SourceSpan::new(4, 9, 2, 3));
        assert_eq!(
            diag.to_string(),
            "ZeroDivisionError: division by zero (line 2, column 3)"
        );
    }

    #[test]
    fn or_span_keeps_existing_position() {
        let inner = SourceSpan::new(0, 1, 1, 1);
        let outer = SourceSpan::new(10, 20, 3, 5);
        let err = error_at(DiagnosticKind::Type, "bad", inner).or_span(outer);
        assert_eq!(err.span(), Some(inner));

        let bare = KentError::from(Diagnostic::new(DiagnosticKind::Type, "bad")).or_span(outer);
        assert_eq!(bare.span(), Some(outer));
    }
}

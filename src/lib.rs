//! KentScript: a small dynamically typed scripting language with a runtime
//! ownership and borrow ledger. The crate covers lexing, parsing, a
//! tree-walking evaluator, builtins and an interactive shell.

pub mod ast;
pub mod diagnostics;
pub mod environment;
pub mod lexer;
pub mod operators;
pub mod ownership;
pub mod parser;
pub mod repl;
pub mod runtime;
pub mod stack;
pub mod stdlib;
pub mod task;
pub mod value;

use std::sync::Once;

pub use diagnostics::{Diagnostic, DiagnosticKind, KentError, SourceSpan, Thrown};
pub use environment::{Environment, EnvironmentRef};
pub use repl::Repl;
pub use runtime::{ExecutionContext, Interpreter, Outcome, Output};
pub use stdlib::{ModuleResolver, StdModules};
pub use value::Value;

static TRACING_INIT: Once = Once::new();

/// Installs a stderr `tracing` subscriber filtered by `RUST_LOG`, e.g.
/// `RUST_LOG=kentscript=debug`. Does nothing when `RUST_LOG` is unset; safe to
/// call more than once.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_level(true),
                )
                .with(EnvFilter::from_default_env())
                .init();
        }
    });
}

use rustyline::{error::ReadlineError, DefaultEditor};

use crate::{
    diagnostics::{KentError, Result},
    runtime::{ExecutionContext, Interpreter},
    value::{Value, ValueKind},
};

const HELP: &str = "\
Commands:
  :help      show this message
  :vars      list global variables
  :funcs     list global functions
  :classes   list global classes
  :reset     clear all global state
  :quit      leave the shell (also :exit)
Blocks may span several lines; input runs once every bracket is closed.";

/// What the shell should do after a `:` command.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Print(String),
    Quit,
}

/// Interactive shell evaluating each entry against one persistent global
/// environment.
pub struct Repl {
    interpreter: Interpreter,
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}

impl Repl {
    pub fn new() -> Self {
        Self::with_context(ExecutionContext::default())
    }

    pub fn with_context(context: ExecutionContext) -> Self {
        Self {
            interpreter: Interpreter::with_context(context),
        }
    }

    pub fn interpreter(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }

    pub fn run(&mut self) -> Result<()> {
        let mut editor = DefaultEditor::new().map_err(readline_error)?;
        println!("KentScript {} (type :help for commands)", env!("CARGO_PKG_VERSION"));
        let mut pending = String::new();
        loop {
            let prompt = if pending.is_empty() { ">>> " } else { "... " };
            let line = match editor.readline(prompt) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => {
                    pending.clear();
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(readline_error(err)),
            };
            let trimmed = line.trim();
            if pending.is_empty() {
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.starts_with(':') {
                    editor.add_history_entry(trimmed).ok();
                    match self.command(trimmed) {
                        Command::Print(text) => println!("{text}"),
                        Command::Quit => break,
                    }
                    continue;
                }
            }
            pending.push_str(&line);
            pending.push('\n');
            if !is_complete(&pending) {
                continue;
            }
            let source = std::mem::take(&mut pending);
            editor.add_history_entry(source.trim_end()).ok();
            match self.interpreter.eval_source(&source) {
                Ok(value) if !value.is_null() => println!("{value:?}"),
                Ok(_) => {}
                Err(err) => eprintln!("{err}"),
            }
        }
        Ok(())
    }

    /// Runs a `:` command.
    pub fn command(&mut self, input: &str) -> Command {
        match input.trim() {
            ":quit" | ":exit" | ":q" => Command::Quit,
            ":help" | ":h" => Command::Print(HELP.to_string()),
            ":vars" => Command::Print(self.listing(|value| !is_definition(value))),
            ":funcs" => Command::Print(self.listing(|value| {
                matches!(&*value.0, ValueKind::Function(_))
            })),
            ":classes" => Command::Print(self.listing(|value| {
                matches!(&*value.0, ValueKind::Class(_))
            })),
            ":reset" => {
                self.interpreter.reset();
                Command::Print("environment reset".to_string())
            }
            other => Command::Print(format!("unknown command `{other}`; try :help")),
        }
    }

    fn listing(&self, include: impl Fn(&Value) -> bool) -> String {
        let globals = self.interpreter.globals();
        let globals = globals.borrow();
        let lines: Vec<String> = globals
            .bindings()
            .filter(|(_, binding)| include(&binding.value))
            .map(|(name, binding)| match &*binding.value.0 {
                ValueKind::Function(_) | ValueKind::Class(_) => format!("{name}: {}", binding.value),
                _ => format!(
                    "{name} = {:?} ({}, {})",
                    binding.value,
                    binding.value.describe_type(),
                    binding.ledger.state()
                ),
            })
            .collect();
        if lines.is_empty() {
            "(none)".to_string()
        } else {
            lines.join("\n")
        }
    }
}

fn is_definition(value: &Value) -> bool {
    matches!(
        &*value.0,
        ValueKind::Function(_) | ValueKind::NativeFunction(_) | ValueKind::Class(_)
    )
}

/// True once every bracket opened in `source` has been closed. Brackets
/// inside string literals and comments are ignored.
fn is_complete(source: &str) -> bool {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            match ch {
                '\\' => {
                    chars.next();
                }
                c if c == open => quote = None,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '#' => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
            }
            '{' | '(' | '[' => depth += 1,
            '}' | ')' | ']' => depth -= 1,
            _ => {}
        }
    }
    depth <= 0 && quote.is_none()
}

fn readline_error(err: ReadlineError) -> KentError {
    KentError::from(std::io::Error::new(std::io::ErrorKind::Other, err))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn waits_for_closing_brackets() {
        assert!(!is_complete("func f() {\n"));
        assert!(!is_complete("let xs = [1,\n"));
        assert!(is_complete("func f() {\n  return 1\n}\n"));
        assert!(is_complete("print(\"{\")\n"));
        assert!(is_complete("let x = 1 # {\n"));
    }

    #[test]
    fn listings_separate_variables_functions_and_classes() {
        let (context, _) = ExecutionContext::captured();
        let mut repl = Repl::with_context(context);
        repl.interpreter()
            .eval_source("let mut total = 3\nfunc add(a, b) { return a + b }\nclass Point {}")
            .unwrap();

        assert_eq!(
            repl.command(":vars"),
            Command::Print("total = 3 (int, owned)".into())
        );
        assert_eq!(
            repl.command(":funcs"),
            Command::Print("add: <func add>".into())
        );
        assert_eq!(
            repl.command(":classes"),
            Command::Print("Point: <class Point>".into())
        );
    }

    #[test]
    fn reset_clears_user_bindings() {
        let (context, _) = ExecutionContext::captured();
        let mut repl = Repl::with_context(context);
        repl.interpreter().eval_source("let x = 1").unwrap();
        repl.command(":reset");
        assert_eq!(repl.command(":vars"), Command::Print("(none)".into()));
        assert!(repl.interpreter().eval_source("len([1, 2])").is_ok());
        assert_eq!(repl.command(":exit"), Command::Quit);
    }
}

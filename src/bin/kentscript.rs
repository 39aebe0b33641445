use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};

use kentscript::{
    parser, runtime::DEFAULT_MAX_CALL_DEPTH, ExecutionContext, Interpreter, KentError, Repl,
};

#[derive(Parser)]
#[command(author, version, about = "KentScript language interpreter")]
struct Args {
    /// Maximum depth of nested function calls before a RecursionError
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_CALL_DEPTH)]
    max_depth: usize,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a KentScript file
    Run { script: PathBuf },
    /// Evaluate a snippet and print its value
    Eval { source: String },
    /// Parse a file and report syntax errors without running it
    Check { script: PathBuf },
    /// Start an interactive session
    Repl,
}

fn main() -> ExitCode {
    kentscript::init_tracing();
    let args = Args::parse();
    let context = ExecutionContext {
        max_call_depth: args.max_depth,
        ..ExecutionContext::default()
    };
    let result = match args.command.unwrap_or(Command::Repl) {
        Command::Run { script } => run_script(script, context),
        Command::Eval { source } => eval_snippet(&source, context),
        Command::Check { script } => check_script(&script),
        Command::Repl => Repl::with_context(context).run(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run_script(path: PathBuf, mut context: ExecutionContext) -> Result<(), KentError> {
    let source = fs::read_to_string(&path)?;
    context.module_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned());
    let mut interpreter = Interpreter::with_context(context);
    interpreter.eval_source(&source)?;
    Ok(())
}

fn eval_snippet(source: &str, context: ExecutionContext) -> Result<(), KentError> {
    let mut interpreter = Interpreter::with_context(context);
    let value = interpreter.eval_source(source)?;
    if !value.is_null() {
        println!("{value}");
    }
    Ok(())
}

fn check_script(path: &Path) -> Result<(), KentError> {
    let source = fs::read_to_string(path)?;
    let program = parser::parse(&source)?;
    println!(
        "{}: ok ({} statements)",
        path.display(),
        program.statements.len()
    );
    Ok(())
}

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn kentscript() -> Command {
    Command::cargo_bin("kentscript").expect("binary exists")
}

#[test]
fn run_quickstart_demo() {
    kentscript()
        .arg("run")
        .arg("demos/quickstart.ks")
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello from KentScript!"))
        .stdout(predicate::str::contains("fib(7) = 13"))
        .stdout(predicate::str::contains("sum 1..5 = 15"))
        .stdout(predicate::str::contains("even squares: [0, 4, 16]"))
        .stdout(predicate::str::contains("counter: 2"))
        .stdout(predicate::str::ends_with("B\n"));
}

#[test]
fn run_classes_demo() {
    kentscript()
        .args(["run", "demos/classes.ks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rex says woof"))
        .stdout(predicate::str::contains("Rex makes a sound, then barks"))
        .stdout(predicate::str::contains("Hello, I'm Alice"))
        .stdout(predicate::str::contains("animals created: 1"))
        .stdout(predicate::str::contains("species: human"))
        .stdout(predicate::str::contains("rex is an Animal: true"));
}

#[test]
fn run_ownership_demo() {
    kentscript()
        .args(["run", "demos/ownership.ks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("owned: [1, 2, 3]"))
        .stdout(predicate::str::contains("caught: use of moved value `data`"))
        .stdout(predicate::str::contains("two readers: 10 10"))
        .stdout(predicate::str::contains("cannot borrow `score` exclusively"))
        .stdout(predicate::str::contains("score: 15"))
        .stdout(predicate::str::contains("has no open borrow to release"));
}

#[test]
fn run_errors_demo() {
    kentscript()
        .args(["run", "demos/errors.ks"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("5\nError!\n"))
        .stdout(predicate::str::contains("invalid: age must be positive"))
        .stdout(predicate::str::contains("validation finished"))
        .stdout(predicate::str::contains("record 7"))
        .stdout(predicate::str::contains("sqrt(16) = 4.0"));
}

#[test]
fn eval_prints_the_final_value() {
    kentscript()
        .args(["eval", "1 + 2 + 3"])
        .assert()
        .success()
        .stdout("6\n");
}

#[test]
fn runtime_errors_exit_with_failure() {
    let dir = tempdir().expect("create temp dir");
    let script = dir.path().join("broken.ks");
    fs::write(&script, "print(\"before\")\nlet x = 1 / 0\nprint(\"after\")\n")
        .expect("write script");

    kentscript()
        .arg("run")
        .arg(&script)
        .assert()
        .failure()
        .stdout("before\n")
        .stderr(predicate::str::contains("ZeroDivisionError: division by zero"))
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn check_reports_statement_count_or_syntax_errors() {
    let dir = tempdir().expect("create temp dir");
    let good = dir.path().join("good.ks");
    fs::write(&good, "let x = 1\nprint(x)\n").expect("write script");
    kentscript()
        .arg("check")
        .arg(&good)
        .assert()
        .success()
        .stdout(predicate::str::contains("ok (2 statements)"));

    let bad = dir.path().join("bad.ks");
    fs::write(&bad, "func (\n").expect("write script");
    kentscript()
        .arg("check")
        .arg(&bad)
        .assert()
        .failure()
        .stderr(predicate::str::contains("SyntaxError"));
}

#[test]
fn max_depth_limits_recursion() {
    let dir = tempdir().expect("create temp dir");
    let script = dir.path().join("deep.ks");
    fs::write(
        &script,
        "func depth(n) {\n    if n == 0 { return 0 }\n    return 1 + depth(n - 1)\n}\nprint(depth(50))\n",
    )
    .expect("write script");

    kentscript()
        .arg("run")
        .arg(&script)
        .assert()
        .success()
        .stdout("50\n");

    kentscript()
        .args(["--max-depth", "10", "run"])
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("maximum call depth of 10 exceeded"));
}

#[test]
fn missing_script_is_an_io_error() {
    kentscript()
        .args(["run", "demos/does-not-exist.ks"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("I/O error"));
}

// Command-line end-to-end tests driving the quill binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn quill() -> Command {
    Command::cargo_bin("quill").expect("binary builds")
}

#[test]
fn derby_runs_while_loop() {
    quill()
        .arg("derby")
        .write_stdin("x = 1; while (x < 5) { x = x + 1; } print(x);")
        .assert()
        .success()
        .stdout("5\n");
}

#[test]
fn derby_runs_recursive_fibonacci() {
    quill()
        .arg("derby")
        .write_stdin("f = fun(n) { if (n < 2) { return n; } return f(n-1) + f(n-2); }; print(f(10));")
        .assert()
        .success()
        .stdout("55\n");
}

#[test]
fn derby_optimizes_inlinable_callee_correctly() {
    quill()
        .arg("derby")
        .write_stdin("inc = fun(x) { return x + 1; }; print(inc(41));")
        .assert()
        .success()
        .stdout("42\n");
}

#[test]
fn interpret_matches_derby() {
    let src = "x = 1; while (x < 5) { x = x + 1; } print(x);";
    quill()
        .arg("interpret")
        .write_stdin(src)
        .assert()
        .success()
        .stdout("5\n");

    quill()
        .arg("interpret")
        .write_stdin("f = fun(n) { if (n < 2) { return n; } return f(n-1) + f(n-2); }; print(f(10));")
        .assert()
        .success()
        .stdout("55\n");
}

#[test]
fn scan_lists_tokens() {
    quill()
        .arg("scan")
        .write_stdin("x = 41;\nprint(\"done\");")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 IDENTIFIER x"))
        .stdout(predicate::str::contains("1 INTLITERAL 41"))
        .stdout(predicate::str::contains("2 STRINGLITERAL done"))
        .stdout(predicate::str::contains("EOF"));
}

#[test]
fn parse_reports_success_and_failure() {
    quill()
        .arg("parse")
        .write_stdin("x = 1;")
        .assert()
        .success()
        .stdout("Parse successful\n");

    quill()
        .arg("parse")
        .write_stdin("x = ;")
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected expression"));
}

#[test]
fn compile_then_vm_round_trip() {
    let src = "x = 1; while (x < 5) { x = x + 1; } print(x);";
    let dir = tempfile::tempdir().expect("tempdir");
    let bytecode_path = dir.path().join("loop.qbc");

    quill()
        .args(["compile", "-", "-o"])
        .arg(&bytecode_path)
        .write_stdin(src)
        .assert()
        .success();

    let bytecode = std::fs::read_to_string(&bytecode_path).expect("bytecode written");
    assert!(bytecode.contains("instructions = ["));

    quill()
        .arg("vm")
        .arg(&bytecode_path)
        .assert()
        .success()
        .stdout("5\n");
}

#[test]
fn compile_with_optimizations_still_runs() {
    let src = "a = 2 + 3 * 4; print(a * 1 + 0);";
    let dir = tempfile::tempdir().expect("tempdir");
    let bytecode_path = dir.path().join("folded.qbc");

    quill()
        .args(["compile", "-", "-O", "all", "-o"])
        .arg(&bytecode_path)
        .write_stdin(src)
        .assert()
        .success();

    quill()
        .arg("vm")
        .arg(&bytecode_path)
        .assert()
        .success()
        .stdout("14\n");
}

#[test]
fn vm_accepts_handwritten_bytecode() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(
        file,
        "function {{
  functions = [],
  constants = [10, 3],
  parameter_count = 0,
  local_vars = [],
  local_ref_vars = [],
  free_vars = [],
  names = [],
  instructions = [
    load_const 0
    load_const 1
    div
    return
  ]
}}"
    )
    .expect("writes");

    quill().arg("vm").arg(file.path()).assert().success();
}

#[test]
fn division_by_zero_is_fatal() {
    quill()
        .arg("derby")
        .write_stdin("x = 10; y = 0; print(x / y);")
        .assert()
        .failure()
        .stderr(predicate::str::contains("IllegalArithmeticException"));
}

#[test]
fn uninitialized_global_is_fatal() {
    quill()
        .arg("derby")
        .write_stdin("print(missing);")
        .assert()
        .failure()
        .stderr(predicate::str::contains("UninitializedVariableException"));
}

#[test]
fn out_of_memory_is_a_runtime_error_not_an_abort() {
    quill()
        .args(["derby", "-m", "4"])
        .write_stdin("x = {}; while (true) { x = {n: x;}; }")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("RuntimeException"))
        .stderr(predicate::str::contains("out of memory"));
}

#[test]
fn input_builtin_reads_a_line() {
    // the program has to come from a file so stdin stays free for input()
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(file, "name = input(); print(\"hi \" + name);").expect("writes");
    quill()
        .arg("derby")
        .arg(file.path())
        .write_stdin("world\n")
        .assert()
        .success()
        .stdout("hi world\n");
}

#[test]
fn intcast_builtin_parses_prefixes() {
    quill()
        .arg("derby")
        .write_stdin("print(intcast(\"123abc\") + intcast(\"nope\"));")
        .assert()
        .success()
        .stdout("123\n");
}

#[test]
fn closure_counter_via_cli() {
    quill()
        .arg("derby")
        .write_stdin(
            "mk = fun() { x = 0; return fun() { x = x + 1; return x; }; };
             c = mk(); print(c()); print(c()); print(c());",
        )
        .assert()
        .success()
        .stdout("1\n2\n3\n");
}

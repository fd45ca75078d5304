// End-to-end VM tests: compile source text, execute, inspect globals
// and error kinds.

use quill::backend::vm::error::VmError;
use quill::backend::vm::value::Value;
use quill::backend::vm::VirtualMachine;
use quill::bytecode::{compile, Constant, Function, Instruction, Op};
use quill::frontend::lexer::Lexer;
use quill::frontend::parser::Parser;

fn compile_src(src: &str) -> Function {
    let tokens = Lexer::new(src).lex().expect("lexes");
    let program = Parser::new(tokens).parse().expect("parses");
    let func = compile::compile_program(&program);
    func.validate().expect("validates");
    func
}

fn global_str(vm: &VirtualMachine, name: &str) -> String {
    vm.globals
        .get(name)
        .copied()
        .unwrap_or_else(|| panic!("global '{}' not set", name))
        .stringify()
        .expect("stringifies")
}

fn eval_globals(src: &str, names: &[&str]) -> Vec<String> {
    let func = compile_src(src);
    let mut vm = VirtualMachine::new(16);
    vm.run(&func).expect("runs");
    names.iter().map(|n| global_str(&vm, n)).collect()
}

fn eval_error(src: &str) -> VmError {
    let func = compile_src(src);
    let mut vm = VirtualMachine::new(16);
    vm.run(&func).expect_err("should fail")
}

#[test]
fn while_loop_counts_to_five() {
    assert_eq!(eval_globals("x = 1; while (x < 5) { x = x + 1; }", &["x"]), ["5"]);
}

#[test]
fn recursive_fibonacci_through_globals() {
    let src = "f = fun(n) { if (n < 2) { return n; } return f(n-1) + f(n-2); }; r = f(10);";
    assert_eq!(eval_globals(src, &["r"]), ["55"]);
}

#[test]
fn counter_factory_has_independent_state() {
    let src = "
        mk = fun() {
            x = 0;
            inc = fun() { x = x + 1; return x; };
            return inc;
        };
        c1 = mk();
        c2 = mk();
        r1 = c1();
        r2 = c1();
        r3 = c1();
        s1 = c2();
    ";
    assert_eq!(
        eval_globals(src, &["r1", "r2", "r3", "s1"]),
        ["1", "2", "3", "1"]
    );
}

#[test]
fn captured_variable_is_shared_between_closures() {
    let src = "
        mk = fun() {
            x = 10;
            get = fun() { return x; };
            set = fun(v) { x = v; return None; };
            return {get: get; set: set;};
        };
        p = mk();
        a = p.get();
        q = p.set(99);
        b = p.get();
    ";
    assert_eq!(eval_globals(src, &["a", "b"]), ["10", "99"]);
}

#[test]
fn string_concatenation_and_coercion() {
    let src = "s = \"a\" + \"b\"; t = \"x=\" + 2; u = 1 + \"!\";";
    assert_eq!(eval_globals(src, &["s", "t", "u"]), ["ab", "x=2", "1!"]);
}

#[test]
fn record_stringifies_keys_in_order() {
    let src = "r = {b: 2; a: 1;}; r.c = r.a + r.b; s = \"\" + r;";
    assert_eq!(eval_globals(src, &["s"]), ["{a:1 b:2 c:3 }"]);
}

#[test]
fn record_index_and_field_share_keys() {
    let src = "r = {}; r[1] = \"one\"; v = r[1]; w = r[\"1\"]; r.two = 2; y = r[\"two\"];";
    assert_eq!(eval_globals(src, &["v", "w", "y"]), ["one", "one", "2"]);
}

#[test]
fn boolean_operators_yield_canonical_booleans() {
    let src = "a = !false; b = true & (1 < 2); c = false | false; d = None == None;";
    assert_eq!(
        eval_globals(src, &["a", "b", "c", "d"]),
        ["true", "true", "false", "true"]
    );
}

#[test]
fn equality_is_identity_for_records() {
    let src = "
        a = {x: 1;};
        b = {x: 1;};
        same = a == a;
        diff = a == b;
        cross = a == 1;
    ";
    assert_eq!(
        eval_globals(src, &["same", "diff", "cross"]),
        ["true", "false", "false"]
    );
}

#[test]
fn division_results_and_errors() {
    let func = Function {
        constants: vec![Constant::Int(10), Constant::Int(3)],
        instructions: vec![
            Instruction::new(Op::LoadConst, Some(0)),
            Instruction::new(Op::LoadConst, Some(1)),
            Instruction::new(Op::Div, None),
            Instruction::new(Op::Return, None),
        ],
        ..Function::default()
    };
    let mut vm = VirtualMachine::new(4);
    let result = vm.run(&func).expect("divides");
    assert!(matches!(result, Value::Int(3)));

    let by_zero = Function {
        constants: vec![Constant::Int(10), Constant::Int(0)],
        instructions: vec![
            Instruction::new(Op::LoadConst, Some(0)),
            Instruction::new(Op::LoadConst, Some(1)),
            Instruction::new(Op::Div, None),
            Instruction::new(Op::Return, None),
        ],
        ..Function::default()
    };
    let mut vm = VirtualMachine::new(4);
    let err = vm.run(&by_zero).expect_err("division by zero");
    assert!(matches!(err, VmError::IllegalArithmetic(_)));
}

#[test]
fn loading_the_none_constant_is_canonical() {
    let func = Function {
        constants: vec![Constant::None],
        instructions: vec![
            Instruction::new(Op::LoadConst, Some(0)),
            Instruction::new(Op::LoadConst, Some(0)),
            Instruction::new(Op::Eq, None),
            Instruction::new(Op::Return, None),
        ],
        ..Function::default()
    };
    let mut vm = VirtualMachine::new(4);
    let result = vm.run(&func).expect("runs");
    assert!(matches!(result, Value::Bool(true)));
}

#[test]
fn uninitialized_global_read_fails() {
    assert!(matches!(
        eval_error("x = y;"),
        VmError::UninitializedVariable(_)
    ));
}

#[test]
fn argument_count_mismatch_fails() {
    assert!(matches!(
        eval_error("f = fun(x) { return x; }; r = f();"),
        VmError::Runtime(_)
    ));
}

#[test]
fn missing_return_fails() {
    let err = eval_error("f = fun(x) { x = x + 1; }; r = f(1);");
    let VmError::Runtime(message) = err else {
        panic!("expected runtime error");
    };
    assert!(message.contains("return"));
}

#[test]
fn add_on_mismatched_types_fails() {
    assert!(matches!(eval_error("r = 1 + true;"), VmError::IllegalCast(_)));
}

#[test]
fn branch_on_non_boolean_fails() {
    assert!(matches!(
        eval_error("if (1) { x = 1; }"),
        VmError::IllegalCast(_)
    ));
}

#[test]
fn calling_a_non_callable_fails() {
    assert!(matches!(eval_error("x = 3; r = x();"), VmError::IllegalCast(_)));
}

#[test]
fn stack_and_register_forms_agree() {
    let programs = [
        "x = 1; while (x < 5) { x = x + 1; }",
        "f = fun(n) { if (n < 2) { return n; } return f(n-1) + f(n-2); }; r = f(12);",
        "r = {}; i = 0; while (i < 10) { r[i] = i * i; i = i + 1; }; s = \"\" + r;",
        "mk = fun() { x = 0; return fun() { x = x + 1; return x; }; };
         c = mk(); a = c(); b = c();",
    ];
    for src in programs {
        let func_reg = compile_src(src);
        let mut vm_reg = VirtualMachine::new(16);
        let reg_result = vm_reg.run(&func_reg).expect("register form runs");

        let func_stack = compile_src(src);
        let mut vm_stack = VirtualMachine::new(16);
        vm_stack.stack_mode = true;
        let stack_result = vm_stack.run(&func_stack).expect("stack form runs");

        assert!(reg_result.equals(reg_result));
        assert_eq!(
            reg_result.stringify().unwrap(),
            stack_result.stringify().unwrap()
        );
        let mut names: Vec<&String> = vm_reg.globals.keys().collect();
        names.sort();
        for name in names {
            let a = vm_reg.globals[name].stringify().unwrap();
            let b = vm_stack.globals[name].stringify().unwrap();
            assert_eq!(a, b, "global '{}' diverged on {}", name, src);
        }
    }
}

#[test]
fn allocation_loop_without_retention_completes_under_small_heap() {
    // total allocation far exceeds the 1 MiB ceiling; only collection
    // lets this finish
    let src = "i = 0; while (i < 20000) { y = {n: i;}; i = i + 1; }";
    let func = compile_src(src);
    let mut vm = VirtualMachine::new(1);
    vm.run(&func).expect("completes under collection pressure");
    assert_eq!(global_str(&vm, "i"), "20000");
    assert!(vm.gc_count > 0, "expected at least one collection");
}

#[test]
fn unbounded_retention_reports_out_of_memory() {
    let src = "x = {}; while (true) { x = {n: x;}; }";
    let func = compile_src(src);
    let mut vm = VirtualMachine::new(1);
    let err = vm.run(&func).expect_err("must exhaust the heap");
    let VmError::Runtime(message) = err else {
        panic!("expected a runtime error, not {:?}", err);
    };
    assert!(message.contains("out of memory"));
}

#[test]
fn gc_runs_during_execution_and_preserves_live_data() {
    // lots of garbage under a 1 MiB ceiling, while a bounded chain of
    // live records must survive every collection intact
    let src = "
        keep = {v: 1;};
        head = keep;
        i = 0;
        while (i < 20000) {
            junk = {a: i; b: \"junk\" + i;};
            if (i < 50) { head = {next: head; n: i;}; }
            i = i + 1;
        }
        ok = keep.v;
        ok2 = head.next == None;
        tailv = head.next.n;
    ";
    let func = compile_src(src);
    let mut vm = VirtualMachine::new(1);
    vm.run(&func).expect("runs with collections");
    assert!(vm.gc_count > 0, "expected at least one collection");
    assert_eq!(global_str(&vm, "ok"), "1");
    assert_eq!(global_str(&vm, "i"), "20000");
    assert_eq!(global_str(&vm, "ok2"), "false");
    assert_eq!(global_str(&vm, "tailv"), "48");
}

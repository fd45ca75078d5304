// Optimizer soundness: every program in the corpus must behave
// identically before and after optimization (same globals, same
// output, same error kind), plus targeted checks for the individual
// passes.

use quill::backend::vm::error::VmError;
use quill::backend::vm::VirtualMachine;
use quill::bytecode::opt::{inline, optimize, OptOptions};
use quill::bytecode::{compile, Constant, Function, Instruction, Op};
use quill::frontend::lexer::Lexer;
use quill::frontend::parser::Parser;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn compile_src(src: &str) -> Function {
    let tokens = Lexer::new(src).lex().expect("lexes");
    let program = Parser::new(tokens).parse().expect("parses");
    compile::compile_program(&program)
}

/// Observable outcome: printed bytes, sorted globals, error kind.
fn observe(func: &Function) -> (String, Vec<(String, String)>, Option<&'static str>) {
    let buf = SharedBuf::default();
    let mut vm = VirtualMachine::with_output(16, Box::new(buf.clone()));
    let result = vm.run(func);
    let error = match result {
        Ok(_) => None,
        Err(VmError::UninitializedVariable(_)) => Some("uninitialized"),
        Err(VmError::IllegalCast(_)) => Some("cast"),
        Err(VmError::IllegalArithmetic(_)) => Some("arithmetic"),
        Err(VmError::InsufficientStack(_)) => Some("stack"),
        Err(VmError::Runtime(_)) => Some("runtime"),
    };
    let mut globals: Vec<(String, String)> = vm
        .globals
        .iter()
        .filter_map(|(k, v)| v.stringify().ok().map(|s| (k.clone(), s)))
        .collect();
    globals.sort();
    let output = String::from_utf8(buf.0.borrow().clone()).expect("utf8 output");
    (output, globals, error)
}

fn assert_optimization_sound(src: &str) {
    let plain = compile_src(src);
    let mut optimized = compile_src(src);
    optimize(&mut optimized, &OptOptions::all()).expect("optimizes");

    let before = observe(&plain);
    let after = observe(&optimized);
    assert_eq!(before.0, after.0, "output diverged on: {}", src);
    assert_eq!(before.1, after.1, "globals diverged on: {}", src);
    assert_eq!(before.2, after.2, "error kind diverged on: {}", src);
}

#[test]
fn optimizer_preserves_program_behavior() {
    let corpus = [
        "x = 1; while (x < 5) { x = x + 1; } print(x);",
        "f = fun(n) { if (n < 2) { return n; } return f(n-1) + f(n-2); }; print(f(10));",
        "inc = fun(x) { return x + 1; }; print(inc(41));",
        "a = 2 + 3 * 4; b = a * 2; c = 0 + b; d = c * 1; print(d);",
        "x = 5; y = x * 0; z = y / 1; print(z);",
        "s = \"x=\" + 2; print(s + \"!\");",
        "r = {}; i = 0; while (i < 8) { r[i] = i * 2; i = i + 1; } print(r);",
        "mk = fun() { x = 0; return fun() { x = x + 1; return x; }; };
         c = mk(); print(c()); print(c()); print(c());",
        "g = fun(a, b) { t = a; u = b; v = 99; return t + u; }; print(g(4, 5));",
        "q = 10; w = 0; if (q > 5) { w = 1; } else { w = 2; } print(w);",
        "i = 0; s = 0; while (i < 100) { s = s + i; i = i + 1; } print(s);",
        "n = 0 - 5; print(-n);",
        "b = !(1 < 2) | (3 >= 3); print(b);",
        // failing programs keep their error kind
        "x = 10; y = x / 0; print(y);",
        "print(missing);",
        "z = 1 + {};",
    ];
    for src in corpus {
        assert_optimization_sound(src);
    }
}

#[test]
fn algebraic_rewrites_preserve_error_kinds() {
    // the zero-multiply rewrites must still evaluate the operand: an
    // undefined global on either side keeps its error
    assert_optimization_sound("y = 0 * missing;");
    assert_optimization_sound("y = missing * 0;");
    // boolean operands keep their type check
    assert_optimization_sound("b = true & 1;");
    assert_optimization_sound("b = 1 | false;");
    assert_optimization_sound("b = false & 1;");
    // and the well-typed forms still collapse to the right values
    assert_optimization_sound("x = 7; y = 0 * x; z = x * 0; print(y + z);");
    assert_optimization_sound("p = true; q = p & true; r = false | p; print(q & r);");
}

#[test]
fn folding_collapses_constant_expressions() {
    let mut func = compile_src("a = 2 + 3 * 4;");
    optimize(&mut func, &OptOptions::from_names(&["optimize"])).expect("optimizes");
    assert!(
        func.constants.contains(&Constant::Int(14)),
        "folded constant missing: {:?}",
        func.constants
    );
    // no arithmetic left on the folded path
    assert!(
        !func
            .instructions
            .iter()
            .any(|inst| matches!(inst.op, Op::Mul)),
        "multiply survived folding: {:?}",
        func.instructions
    );
}

#[test]
fn constant_branches_become_unconditional() {
    let mut func = compile_src("x = 0; if (true) { x = 1; } else { x = 2; }");
    optimize(&mut func, &OptOptions::from_names(&["optimize"])).expect("optimizes");
    assert!(
        !func.instructions.iter().any(|inst| inst.op == Op::If),
        "constant branch survived: {:?}",
        func.instructions
    );
    let (_, globals, _) = run_for_globals(&func);
    assert!(globals.contains(&("x".to_string(), "1".to_string())));
}

fn run_for_globals(func: &Function) -> (String, Vec<(String, String)>, Option<&'static str>) {
    observe(func)
}

#[test]
fn dead_stores_are_eliminated() {
    let src = "f = fun(x) { unused = x * 100; return x; }; r = f(7);";
    let mut func = compile_src(src);
    let unused_slot = func.functions[3]
        .local_vars
        .iter()
        .position(|n| n == "unused")
        .expect("'unused' is a local of f") as i32;
    optimize(&mut func, &OptOptions::from_names(&["dce"])).expect("optimizes");
    assert!(
        !func.functions[3]
            .instructions
            .iter()
            .any(|inst| inst.op == Op::StoreLocal && inst.operand == Some(unused_slot)),
        "dead store survived: {:?}",
        func.functions[3].instructions
    );

    let (_, globals, error) = observe(&func);
    assert_eq!(error, None);
    assert!(globals.contains(&("r".to_string(), "7".to_string())));
}

#[test]
fn dead_store_pass_leaves_reference_functions_alone() {
    let src = "mk = fun() { x = 1; return fun() { return x; }; }; c = mk(); r = c();";
    let mut func = compile_src(src);
    optimize(&mut func, &OptOptions::from_names(&["dce"])).expect("optimizes");
    let (_, globals, error) = observe(&func);
    assert_eq!(error, None);
    assert!(globals.contains(&("r".to_string(), "1".to_string())));
}

#[test]
fn inliner_splices_direct_calls() {
    // caller: load_func 0; load_const 41; call 1; store; done
    let callee = Function {
        parameter_count: 1,
        local_vars: vec!["x".to_string()],
        constants: vec![Constant::Int(1)],
        instructions: vec![
            Instruction::new(Op::LoadLocal, Some(0)),
            Instruction::new(Op::LoadConst, Some(0)),
            Instruction::new(Op::Add, None),
            Instruction::new(Op::Return, None),
        ],
        ..Function::default()
    };
    let mut caller = Function {
        functions: vec![callee],
        constants: vec![Constant::Int(41)],
        instructions: vec![
            Instruction::new(Op::LoadFunc, Some(0)),
            Instruction::new(Op::LoadConst, Some(0)),
            Instruction::new(Op::Call, Some(1)),
            Instruction::new(Op::Return, None),
        ],
        ..Function::default()
    };

    let mut vm = VirtualMachine::new(4);
    let before = vm.run(&caller).expect("runs before inlining");
    assert_eq!(before.stringify().unwrap(), "42");

    inline::inline_functions(&mut caller);
    assert!(
        !caller.instructions.iter().any(|inst| inst.op == Op::Call),
        "call survived inlining: {:?}",
        caller.instructions
    );

    let mut vm = VirtualMachine::new(4);
    let after = vm.run(&caller).expect("runs after inlining");
    assert_eq!(after.stringify().unwrap(), "42");
}

#[test]
fn inliner_skips_functions_with_captures() {
    let src = "mk = fun() { x = 0; return fun() { x = x + 1; return x; }; };
               c = mk(); a = c(); b = c();";
    let mut func = compile_src(src);
    optimize(&mut func, &OptOptions::all()).expect("optimizes");
    let (_, globals, error) = observe(&func);
    assert_eq!(error, None);
    assert!(globals.contains(&("a".to_string(), "1".to_string())));
    assert!(globals.contains(&("b".to_string(), "2".to_string())));
}

#[test]
fn licm_keeps_loops_correct() {
    let src = "
        a = 6; b = 7; i = 0; s = 0;
        while (i < 50) { s = s + a * b; i = i + 1; }
        print(s);
    ";
    assert_optimization_sound(src);

    let mut func = compile_src(src);
    optimize(&mut func, &OptOptions::from_names(&["licm"])).expect("optimizes");
    // licm installs the register form ahead of execution
    assert!(func.reg_code.get().is_some());
    let (output, _, error) = observe(&func);
    assert_eq!(error, None);
    assert_eq!(output, "2100\n");
}

#[test]
fn licm_hoists_invariant_arithmetic_out_of_loops() {
    let src = "
        f = fun(a, b) {
            i = 0; s = 0;
            while (i < 10) { s = s + (a * b); i = i + 1; }
            return s;
        };
        r = f(6, 7);
    ";
    let mut func = compile_src(src);
    optimize(&mut func, &OptOptions::from_names(&["licm"])).expect("optimizes");
    let inner = &func.functions[3];
    let code = inner.reg_code.get().expect("licm lowers the function");
    // lowering itself never emits a register move; a dst==src self-move
    // is the residue of a hoisted instruction
    assert!(
        code.code
            .iter()
            .any(|inst| inst.op == Op::LoadLocal && inst.dst == inst.src1),
        "nothing was hoisted: {:?}",
        code.code
    );
    let (_, globals, error) = observe(&func);
    assert_eq!(error, None);
    assert!(globals.contains(&("r".to_string(), "420".to_string())));
}

#[test]
fn jump_threading_preserves_loop_exits() {
    let src = "
        i = 0; hits = 0;
        while (i < 10) {
            if (i > 4) { hits = hits + 1; } else { hits = hits; }
            i = i + 1;
        }
        print(hits);
    ";
    assert_optimization_sound(src);
    let mut func = compile_src(src);
    optimize(&mut func, &OptOptions::all()).expect("optimizes");
    let (output, _, error) = observe(&func);
    assert_eq!(error, None);
    assert_eq!(output, "5\n");
}

#[test]
fn pool_compaction_drops_unused_constants() {
    let mut func = compile_src("x = 1; x = 2 * 3; y = \"unused-no-more\";");
    // after folding, the 2 and 3 are dead pool entries
    optimize(&mut func, &OptOptions::from_names(&["optimize", "dce"])).expect("optimizes");
    assert!(
        !func.constants.contains(&Constant::Int(3)),
        "unused constant kept: {:?}",
        func.constants
    );
    let (_, globals, error) = observe(&func);
    assert_eq!(error, None);
    assert!(globals.contains(&("x".to_string(), "6".to_string())));
}

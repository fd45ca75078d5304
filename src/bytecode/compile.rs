// Quill AST -> bytecode compiler
// Created by: Haoran Wei
// Changelog:
// 2026-06-23: Two-phase compilation. Phase one walks every function
//            literal collecting locals (params plus assigned names not
//            bound by an enclosing function), global declarations, free
//            variables and which locals end up captured; phase two
//            repeats the walk emitting stack-form code against the
//            finalized scope tables.
// 2026-06-29: Builtin sentinels: the top level carries print/input/
//            intcast as its first three children and binds their names
//            as globals in the prologue.

use crate::backend::vm::native::{NATIVE_NAMES, NATIVE_PARAMS};
use crate::bytecode::{Constant, Function, Instruction, Op};
use crate::frontend::parser::ast::{
    assigned_vars, declared_globals, BinOp, Expr, Program, Stmt, UnOp,
};
use std::collections::HashSet;

/// Finalized scope information for one function literal. Children are
/// in source-encounter order, which phase two retraces.
#[derive(Debug, Default)]
struct ScopeInfo {
    params: Vec<String>,
    locals: Vec<String>,
    globals: HashSet<String>,
    /// Locals captured by some nested function, in local order.
    ref_locals: Vec<String>,
    /// Names captured from enclosing functions, sorted.
    free: Vec<String>,
    children: Vec<ScopeInfo>,
}

/// Working state for phase one; `captured` fills in as descendants
/// resolve names against this level.
struct LevelState {
    locals: Vec<String>,
    globals: HashSet<String>,
    captured: HashSet<String>,
    free: Vec<String>,
    free_set: HashSet<String>,
}

fn analyze_function(params: &[String], body: &[Stmt], levels: &mut Vec<LevelState>) -> ScopeInfo {
    let globals = declared_globals(body);
    let assigned = assigned_vars(body);
    let mut locals: Vec<String> = params.to_vec();
    for name in assigned {
        if globals.contains(&name) || locals.contains(&name) {
            continue;
        }
        // a name bound by an enclosing function is captured, not shadowed
        let bound_outside = levels.iter().any(|level| {
            level.locals.contains(&name) && !level.globals.contains(&name)
        });
        if !bound_outside {
            locals.push(name);
        }
    }

    levels.push(LevelState {
        locals,
        globals,
        captured: HashSet::new(),
        free: Vec::new(),
        free_set: HashSet::new(),
    });
    let mut children = Vec::new();
    analyze_block(body, levels, &mut children);
    let level = levels.pop().expect("level just pushed");

    let ref_locals: Vec<String> = level
        .locals
        .iter()
        .filter(|name| level.captured.contains(*name))
        .cloned()
        .collect();
    let mut free = level.free;
    free.sort();
    ScopeInfo {
        params: params.to_vec(),
        locals: level.locals,
        globals: level.globals,
        ref_locals,
        free,
        children,
    }
}

/// Resolve a variable use inside the innermost level; marks captures up
/// the chain. Call with `levels` non-empty; top-level code resolves
/// everything to globals before getting here.
fn note_use(name: &str, levels: &mut Vec<LevelState>) {
    let last = levels.len() - 1;
    {
        let level = &levels[last];
        if level.globals.contains(name) || level.locals.iter().any(|l| l == name) {
            return;
        }
    }
    // find the binding ancestor
    let mut binder = None;
    for j in (0..last).rev() {
        let level = &levels[j];
        if level.locals.iter().any(|l| l == name) && !level.globals.contains(name) {
            binder = Some(j);
            break;
        }
    }
    let Some(j) = binder else {
        return; // global
    };
    levels[j].captured.insert(name.to_string());
    for level in levels[j + 1..].iter_mut() {
        if level.free_set.insert(name.to_string()) {
            level.free.push(name.to_string());
        }
    }
}

fn analyze_block(body: &[Stmt], levels: &mut Vec<LevelState>, children: &mut Vec<ScopeInfo>) {
    for stmt in body {
        match stmt {
            Stmt::Assign { target, value } => {
                if let Expr::Var(name) = target {
                    if !levels.is_empty() {
                        note_use(name, levels);
                    }
                } else {
                    analyze_expr(target, levels, children);
                }
                analyze_expr(value, levels, children);
            }
            Stmt::Global { .. } => {}
            Stmt::If {
                condition,
                then_block,
                else_block,
            } => {
                analyze_expr(condition, levels, children);
                analyze_block(then_block, levels, children);
                if let Some(else_block) = else_block {
                    analyze_block(else_block, levels, children);
                }
            }
            Stmt::While { condition, body } => {
                analyze_expr(condition, levels, children);
                analyze_block(body, levels, children);
            }
            Stmt::Return { value } => analyze_expr(value, levels, children),
            Stmt::CallStmt { call } => analyze_expr(call, levels, children),
            Stmt::Block(stmts) => analyze_block(stmts, levels, children),
        }
    }
}

fn analyze_expr(expr: &Expr, levels: &mut Vec<LevelState>, children: &mut Vec<ScopeInfo>) {
    match expr {
        Expr::Var(name) => {
            if !levels.is_empty() {
                note_use(name, levels);
            }
        }
        Expr::Binary { left, right, .. } => {
            analyze_expr(left, levels, children);
            analyze_expr(right, levels, children);
        }
        Expr::Unary { operand, .. } => analyze_expr(operand, levels, children),
        Expr::Call { callee, args } => {
            analyze_expr(callee, levels, children);
            for arg in args {
                analyze_expr(arg, levels, children);
            }
        }
        Expr::Field { object, .. } => analyze_expr(object, levels, children),
        Expr::Index { object, index } => {
            analyze_expr(object, levels, children);
            analyze_expr(index, levels, children);
        }
        Expr::Record { fields } => {
            for (_, value) in fields {
                analyze_expr(value, levels, children);
            }
        }
        Expr::Function { params, body } => {
            children.push(analyze_function(params, body, levels));
        }
        Expr::None | Expr::Bool(_) | Expr::Int(_) | Expr::Str(_) => {}
    }
}

enum Binding {
    Global,
    Local(usize),
    /// push_reference index (own cell or closure environment)
    Reference(usize),
}

/// Phase-two code generator for one function.
struct CodeGen<'i> {
    func: Function,
    info: &'i ScopeInfo,
    /// Next child function index to hand out; the top level starts past
    /// the builtin sentinels.
    next_child: usize,
    is_top: bool,
}

impl<'i> CodeGen<'i> {
    fn emit(&mut self, op: Op, operand: Option<i32>) -> usize {
        self.func.instructions.push(Instruction::new(op, operand));
        self.func.instructions.len() - 1
    }

    fn here(&self) -> usize {
        self.func.instructions.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        self.func.instructions[at].operand = Some(target as i32 - at as i32);
    }

    fn name_index(&mut self, name: &str) -> i32 {
        if let Some(idx) = self.func.names.iter().position(|n| n == name) {
            return idx as i32;
        }
        self.func.names.push(name.to_string());
        (self.func.names.len() - 1) as i32
    }

    fn resolve(&self, name: &str) -> Binding {
        if self.is_top || self.info.globals.contains(name) {
            return Binding::Global;
        }
        if let Some(idx) = self.info.locals.iter().position(|l| l == name) {
            if let Some(r) = self.info.ref_locals.iter().position(|l| l == name) {
                return Binding::Reference(r);
            }
            return Binding::Local(idx);
        }
        if let Some(f) = self.info.free.iter().position(|l| l == name) {
            return Binding::Reference(self.info.ref_locals.len() + f);
        }
        Binding::Global
    }

    fn gen_block(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.gen_stmt(stmt);
        }
    }

    fn gen_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { target, value } => match target {
                Expr::Var(name) => match self.resolve(name) {
                    Binding::Global => {
                        self.gen_expr(value);
                        let idx = self.name_index(name);
                        self.emit(Op::StoreGlobal, Some(idx));
                    }
                    Binding::Local(idx) => {
                        self.gen_expr(value);
                        self.emit(Op::StoreLocal, Some(idx as i32));
                    }
                    Binding::Reference(r) => {
                        self.emit(Op::PushReference, Some(r as i32));
                        self.gen_expr(value);
                        self.emit(Op::StoreReference, None);
                    }
                },
                Expr::Field { object, name } => {
                    self.gen_expr(object);
                    self.gen_expr(value);
                    let idx = self.name_index(name);
                    self.emit(Op::FieldStore, Some(idx));
                }
                Expr::Index { object, index } => {
                    self.gen_expr(object);
                    self.gen_expr(index);
                    self.gen_expr(value);
                    self.emit(Op::IndexStore, None);
                }
                _ => {}
            },
            Stmt::Global { .. } => {}
            Stmt::If {
                condition,
                then_block,
                else_block,
            } => {
                self.gen_expr(condition);
                self.emit(Op::Not, None);
                let skip_then = self.emit(Op::If, None);
                self.gen_block(then_block);
                match else_block {
                    Some(else_block) => {
                        let skip_else = self.emit(Op::Goto, None);
                        let else_start = self.here();
                        self.patch(skip_then, else_start);
                        self.gen_block(else_block);
                        let end = self.here();
                        self.patch(skip_else, end);
                    }
                    None => {
                        let end = self.here();
                        self.patch(skip_then, end);
                    }
                }
            }
            Stmt::While { condition, body } => {
                let start = self.here();
                self.gen_expr(condition);
                self.emit(Op::Not, None);
                let exit = self.emit(Op::If, None);
                self.gen_block(body);
                let back = self.emit(Op::Goto, None);
                self.patch(back, start);
                let end = self.here();
                self.patch(exit, end);
            }
            Stmt::Return { value } => {
                self.gen_expr(value);
                self.emit(Op::Return, None);
            }
            Stmt::CallStmt { call } => {
                self.gen_expr(call);
                self.emit(Op::Pop, None);
            }
            Stmt::Block(stmts) => self.gen_block(stmts),
        }
    }

    fn gen_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::None => {
                let idx = self.func.add_constant(Constant::None);
                self.emit(Op::LoadConst, Some(idx));
            }
            Expr::Bool(b) => {
                let idx = self.func.add_constant(Constant::Bool(*b));
                self.emit(Op::LoadConst, Some(idx));
            }
            Expr::Int(i) => {
                let idx = self.func.add_constant(Constant::Int(*i));
                self.emit(Op::LoadConst, Some(idx));
            }
            Expr::Str(s) => {
                let idx = self.func.add_constant(Constant::Str(s.clone()));
                self.emit(Op::LoadConst, Some(idx));
            }
            Expr::Var(name) => match self.resolve(name) {
                Binding::Global => {
                    let idx = self.name_index(name);
                    self.emit(Op::LoadGlobal, Some(idx));
                }
                Binding::Local(idx) => {
                    self.emit(Op::LoadLocal, Some(idx as i32));
                }
                Binding::Reference(r) => {
                    self.emit(Op::PushReference, Some(r as i32));
                    self.emit(Op::LoadReference, None);
                }
            },
            Expr::Binary { op, left, right } => {
                self.gen_expr(left);
                self.gen_expr(right);
                match op {
                    BinOp::Add => {
                        self.emit(Op::Add, None);
                    }
                    BinOp::Sub => {
                        self.emit(Op::Sub, None);
                    }
                    BinOp::Mul => {
                        self.emit(Op::Mul, None);
                    }
                    BinOp::Div => {
                        self.emit(Op::Div, None);
                    }
                    BinOp::Gt => {
                        self.emit(Op::Gt, None);
                    }
                    BinOp::Geq => {
                        self.emit(Op::Geq, None);
                    }
                    BinOp::Eq => {
                        self.emit(Op::Eq, None);
                    }
                    BinOp::And => {
                        self.emit(Op::And, None);
                    }
                    BinOp::Or => {
                        self.emit(Op::Or, None);
                    }
                    // a < b is b > a with the operands re-ordered on the
                    // stack, preserving left-to-right evaluation
                    BinOp::Lt => {
                        self.emit(Op::Swap, None);
                        self.emit(Op::Gt, None);
                    }
                    BinOp::Leq => {
                        self.emit(Op::Swap, None);
                        self.emit(Op::Geq, None);
                    }
                }
            }
            Expr::Unary { op, operand } => {
                self.gen_expr(operand);
                match op {
                    UnOp::Neg => self.emit(Op::Neg, None),
                    UnOp::Not => self.emit(Op::Not, None),
                };
            }
            Expr::Call { callee, args } => {
                self.gen_expr(callee);
                for arg in args {
                    self.gen_expr(arg);
                }
                self.emit(Op::Call, Some(args.len() as i32));
            }
            Expr::Field { object, name } => {
                self.gen_expr(object);
                let idx = self.name_index(name);
                self.emit(Op::FieldLoad, Some(idx));
            }
            Expr::Index { object, index } => {
                self.gen_expr(object);
                self.gen_expr(index);
                self.emit(Op::IndexLoad, None);
            }
            Expr::Record { fields } => {
                self.emit(Op::AllocRecord, None);
                for (name, value) in fields {
                    self.emit(Op::Dup, None);
                    self.gen_expr(value);
                    let idx = self.name_index(name);
                    self.emit(Op::FieldStore, Some(idx));
                }
            }
            Expr::Function { params, body } => {
                let info = self.info;
                let child_pos = if self.is_top {
                    self.next_child - 3
                } else {
                    self.next_child
                };
                let child_info = &info.children[child_pos];
                let child_idx = self.next_child;
                self.next_child += 1;
                let child = generate(child_info, params, body, false);
                self.func.functions.push(child);
                self.emit(Op::LoadFunc, Some(child_idx as i32));
                for fv in &child_info.free {
                    match self.resolve(fv) {
                        Binding::Reference(r) => {
                            self.emit(Op::PushReference, Some(r as i32));
                        }
                        _ => unreachable!("free variable '{}' must resolve to a cell", fv),
                    }
                }
                self.emit(Op::AllocClosure, Some(child_info.free.len() as i32));
            }
        }
    }
}

fn generate(info: &ScopeInfo, params: &[String], body: &[Stmt], is_top: bool) -> Function {
    let mut cg = CodeGen {
        func: Function {
            parameter_count: params.len(),
            local_vars: info.locals.clone(),
            local_ref_vars: info.ref_locals.clone(),
            free_vars: info.free.clone(),
            ..Function::default()
        },
        info,
        next_child: if is_top { 3 } else { 0 },
        is_top,
    };
    if is_top {
        for (i, name) in NATIVE_NAMES.iter().enumerate() {
            let sentinel = Function {
                parameter_count: NATIVE_PARAMS[i],
                local_vars: (0..NATIVE_PARAMS[i]).map(|p| format!("arg{}", p)).collect(),
                ..Function::default()
            };
            cg.func.functions.push(sentinel);
            let name_idx = cg.name_index(name);
            cg.emit(Op::LoadFunc, Some(i as i32));
            cg.emit(Op::StoreGlobal, Some(name_idx));
        }
    }
    cg.gen_block(body);
    if is_top {
        let none = cg.func.add_constant(Constant::None);
        cg.emit(Op::LoadConst, Some(none));
        cg.emit(Op::Return, None);
    }
    cg.func
}

/// Compile a program to its top-level bytecode function.
pub fn compile_program(program: &Program) -> Function {
    let mut levels: Vec<LevelState> = Vec::new();
    let mut children = Vec::new();
    analyze_block(&program.body, &mut levels, &mut children);
    let top_info = ScopeInfo {
        children,
        ..ScopeInfo::default()
    };
    generate(&top_info, &[], &program.body, true)
}

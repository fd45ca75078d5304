// Quill AST definitions
// Created by: Anqi Shen
// Changelog:
//      26-06-15: Initial version
//      26-06-18: Shared assigned-variable / global-declaration scans for
//                the compiler and the tree-walking evaluator

use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        target: Expr,
        value: Expr,
    },
    Global {
        name: String,
    },
    If {
        condition: Expr,
        then_block: Vec<Stmt>,
        else_block: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    Return {
        value: Expr,
    },
    CallStmt {
        call: Expr,
    },
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i32),
    Str(String),
    Var(String),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Field {
        object: Box<Expr>,
        name: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Record {
        fields: Vec<(String, Expr)>,
    },
    Function {
        params: Vec<String>,
        body: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Leq,
    Gt,
    Geq,
    Eq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// Names assigned through plain-variable targets anywhere in `body`,
/// in first-assignment order, not descending into nested function
/// literals. These become the locals of the enclosing function.
pub fn assigned_vars(body: &[Stmt]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    collect_assigned(body, &mut seen, &mut out);
    out
}

fn collect_assigned(body: &[Stmt], seen: &mut HashSet<String>, out: &mut Vec<String>) {
    for stmt in body {
        match stmt {
            Stmt::Assign { target, .. } => {
                if let Expr::Var(name) = target {
                    if seen.insert(name.clone()) {
                        out.push(name.clone());
                    }
                }
            }
            Stmt::If {
                then_block,
                else_block,
                ..
            } => {
                collect_assigned(then_block, seen, out);
                if let Some(else_block) = else_block {
                    collect_assigned(else_block, seen, out);
                }
            }
            Stmt::While { body, .. } => collect_assigned(body, seen, out),
            Stmt::Block(stmts) => collect_assigned(stmts, seen, out),
            Stmt::Global { .. } | Stmt::Return { .. } | Stmt::CallStmt { .. } => {}
        }
    }
}

/// Names declared `global` anywhere in `body`, again without entering
/// nested function literals.
pub fn declared_globals(body: &[Stmt]) -> HashSet<String> {
    let mut out = HashSet::new();
    collect_globals(body, &mut out);
    out
}

fn collect_globals(body: &[Stmt], out: &mut HashSet<String>) {
    for stmt in body {
        match stmt {
            Stmt::Global { name } => {
                out.insert(name.clone());
            }
            Stmt::If {
                then_block,
                else_block,
                ..
            } => {
                collect_globals(then_block, out);
                if let Some(else_block) = else_block {
                    collect_globals(else_block, out);
                }
            }
            Stmt::While { body, .. } => collect_globals(body, out),
            Stmt::Block(stmts) => collect_globals(stmts, out),
            _ => {}
        }
    }
}

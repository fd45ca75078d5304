// Quill tree-walking evaluator
// Created by: Anqi Shen
// Changelog:
//      26-06-24: Direct AST evaluation for the `interpret` subcommand.
//                Shares the variable-scoping rules with the compiler:
//                assigned names are function locals unless bound by an
//                enclosing function, `global` pins writes to the top
//                scope, closures capture their defining environment.

use crate::backend::vm::error::VmError;
use crate::backend::vm::native::parse_int_prefix;
use crate::frontend::parser::ast::{
    assigned_vars, declared_globals, BinOp, Expr, Program, Stmt, UnOp,
};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::HashSet;
use std::io::Write;
use std::rc::Rc;

const MAX_CALL_DEPTH: usize = 1000;

#[derive(Clone)]
pub enum IValue {
    None,
    Bool(bool),
    Int(i32),
    Str(Rc<String>),
    Record(Rc<RefCell<FxHashMap<String, IValue>>>),
    Function(Rc<IFunction>),
    Native(usize),
}

pub struct IFunction {
    params: Vec<String>,
    body: Vec<Stmt>,
    env: Env,
}

struct Scope {
    vars: FxHashMap<String, IValue>,
    globals: HashSet<String>,
    parent: Option<Env>,
}

type Env = Rc<RefCell<Scope>>;

enum Flow {
    Normal,
    Return(IValue),
}

pub struct Interpreter {
    global_env: Env,
    depth: usize,
    pub output: Box<dyn Write>,
}

impl IValue {
    fn equals(&self, other: &IValue) -> bool {
        match (self, other) {
            (IValue::None, IValue::None) => true,
            (IValue::Bool(a), IValue::Bool(b)) => a == b,
            (IValue::Int(a), IValue::Int(b)) => a == b,
            (IValue::Str(a), IValue::Str(b)) => a == b,
            (IValue::Record(a), IValue::Record(b)) => Rc::ptr_eq(a, b),
            (IValue::Function(a), IValue::Function(b)) => Rc::ptr_eq(a, b),
            (IValue::Native(a), IValue::Native(b)) => a == b,
            _ => false,
        }
    }

    fn stringify(&self) -> String {
        match self {
            IValue::None => "None".to_string(),
            IValue::Bool(b) => b.to_string(),
            IValue::Int(i) => i.to_string(),
            IValue::Str(s) => s.as_ref().clone(),
            IValue::Function(_) | IValue::Native(_) => "FUNCTION".to_string(),
            IValue::Record(fields) => {
                let fields = fields.borrow();
                let mut entries: Vec<(&String, &IValue)> = fields.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = String::from("{");
                for (key, val) in entries {
                    out.push_str(key);
                    out.push(':');
                    out.push_str(&val.stringify());
                    out.push(' ');
                }
                out.push('}');
                out
            }
        }
    }

    fn as_int(&self) -> Result<i32, VmError> {
        match self {
            IValue::Int(i) => Ok(*i),
            _ => Err(VmError::IllegalCast("Expected integer".to_string())),
        }
    }

    fn as_bool(&self) -> Result<bool, VmError> {
        match self {
            IValue::Bool(b) => Ok(*b),
            _ => Err(VmError::IllegalCast("Expected boolean".to_string())),
        }
    }
}

fn new_scope(parent: Option<Env>) -> Env {
    Rc::new(RefCell::new(Scope {
        vars: FxHashMap::default(),
        globals: HashSet::new(),
        parent,
    }))
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter {
            global_env: new_scope(None),
            depth: 0,
            output: Box::new(std::io::stdout()),
        }
    }

    pub fn run(&mut self, program: &Program) -> Result<(), VmError> {
        for stmt in &program.body {
            if let Flow::Return(_) = self.exec_stmt(stmt, &self.global_env.clone())? {
                break;
            }
        }
        Ok(())
    }

    fn lookup(&self, env: &Env, name: &str) -> Result<IValue, VmError> {
        let mut current = Some(env.clone());
        while let Some(scope) = current {
            let scope = scope.borrow();
            if let Some(v) = scope.vars.get(name) {
                return Ok(v.clone());
            }
            current = scope.parent.clone();
        }
        Err(VmError::UninitializedVariable(format!(
            "Undefined global: {}",
            name
        )))
    }

    /// Write through to the binding scope: the current scope if the
    /// name is local (or declared global there), otherwise the nearest
    /// enclosing function scope that binds it, otherwise the globals.
    fn assign(&self, env: &Env, name: &str, value: IValue) {
        {
            let scope = env.borrow();
            if scope.globals.contains(name) {
                drop(scope);
                self.global_env
                    .borrow_mut()
                    .vars
                    .insert(name.to_string(), value);
                return;
            }
        }
        if env.borrow().vars.contains_key(name) {
            env.borrow_mut().vars.insert(name.to_string(), value);
            return;
        }
        let mut current = env.borrow().parent.clone();
        while let Some(scope) = current {
            if !Rc::ptr_eq(&scope, &self.global_env) && scope.borrow().vars.contains_key(name) {
                scope.borrow_mut().vars.insert(name.to_string(), value);
                return;
            }
            current = scope.borrow().parent.clone();
        }
        env.borrow_mut().vars.insert(name.to_string(), value);
    }

    fn exec_block(&mut self, body: &[Stmt], env: &Env) -> Result<Flow, VmError> {
        for stmt in body {
            if let Flow::Return(v) = self.exec_stmt(stmt, env)? {
                return Ok(Flow::Return(v));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &Env) -> Result<Flow, VmError> {
        match stmt {
            Stmt::Assign { target, value } => {
                match target {
                    Expr::Var(name) => {
                        let v = self.eval(value, env)?;
                        self.assign(env, name, v);
                    }
                    Expr::Field { object, name } => {
                        let obj = self.eval(object, env)?;
                        let v = self.eval(value, env)?;
                        let IValue::Record(fields) = obj else {
                            return Err(VmError::IllegalCast("Expected record".to_string()));
                        };
                        fields.borrow_mut().insert(name.clone(), v);
                    }
                    Expr::Index { object, index } => {
                        let obj = self.eval(object, env)?;
                        let idx = self.eval(index, env)?;
                        let v = self.eval(value, env)?;
                        let IValue::Record(fields) = obj else {
                            return Err(VmError::IllegalCast("Expected record".to_string()));
                        };
                        let key = index_key(&idx)?;
                        fields.borrow_mut().insert(key, v);
                    }
                    _ => {
                        return Err(VmError::Runtime("invalid assignment target".to_string()))
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Global { name } => {
                env.borrow_mut().globals.insert(name.clone());
                Ok(Flow::Normal)
            }
            Stmt::If {
                condition,
                then_block,
                else_block,
            } => {
                let cond = self.eval(condition, env)?.as_bool()?;
                if cond {
                    self.exec_block(then_block, env)
                } else if let Some(else_block) = else_block {
                    self.exec_block(else_block, env)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { condition, body } => {
                while self.eval(condition, env)?.as_bool()? {
                    if let Flow::Return(v) = self.exec_block(body, env)? {
                        return Ok(Flow::Return(v));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return { value } => {
                let v = self.eval(value, env)?;
                Ok(Flow::Return(v))
            }
            Stmt::CallStmt { call } => {
                self.eval(call, env)?;
                Ok(Flow::Normal)
            }
            Stmt::Block(stmts) => self.exec_block(stmts, env),
        }
    }

    fn eval(&mut self, expr: &Expr, env: &Env) -> Result<IValue, VmError> {
        match expr {
            Expr::None => Ok(IValue::None),
            Expr::Bool(b) => Ok(IValue::Bool(*b)),
            Expr::Int(i) => Ok(IValue::Int(*i)),
            Expr::Str(s) => Ok(IValue::Str(Rc::new(s.clone()))),
            Expr::Var(name) => {
                if let Some(id) = builtin_id(name) {
                    if self.lookup(env, name).is_err() {
                        return Ok(IValue::Native(id));
                    }
                }
                self.lookup(env, name)
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left, env)?;
                let r = self.eval(right, env)?;
                self.binary(*op, l, r)
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(operand, env)?;
                match op {
                    UnOp::Neg => Ok(IValue::Int(v.as_int()?.wrapping_neg())),
                    UnOp::Not => Ok(IValue::Bool(!v.as_bool()?)),
                }
            }
            Expr::Call { callee, args } => {
                let callee_v = self.eval(callee, env)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg, env)?);
                }
                self.call(callee_v, arg_values)
            }
            Expr::Field { object, name } => {
                let obj = self.eval(object, env)?;
                let IValue::Record(fields) = obj else {
                    return Err(VmError::IllegalCast("Expected record".to_string()));
                };
                Ok(fields.borrow().get(name).cloned().unwrap_or(IValue::None))
            }
            Expr::Index { object, index } => {
                let obj = self.eval(object, env)?;
                let idx = self.eval(index, env)?;
                let IValue::Record(fields) = obj else {
                    return Err(VmError::IllegalCast("Expected record".to_string()));
                };
                let key = index_key(&idx)?;
                Ok(fields.borrow().get(&key).cloned().unwrap_or(IValue::None))
            }
            Expr::Record { fields } => {
                let record: FxHashMap<String, IValue> = FxHashMap::default();
                let record = Rc::new(RefCell::new(record));
                for (name, value) in fields {
                    let v = self.eval(value, env)?;
                    record.borrow_mut().insert(name.clone(), v);
                }
                Ok(IValue::Record(record))
            }
            Expr::Function { params, body } => Ok(IValue::Function(Rc::new(IFunction {
                params: params.clone(),
                body: body.clone(),
                env: env.clone(),
            }))),
        }
    }

    fn call(&mut self, callee: IValue, args: Vec<IValue>) -> Result<IValue, VmError> {
        match callee {
            IValue::Native(id) => self.call_native(id, args),
            IValue::Function(func) => {
                if args.len() != func.params.len() {
                    return Err(VmError::Runtime(format!(
                        "Argument count mismatch: expected {}, got {}",
                        func.params.len(),
                        args.len()
                    )));
                }
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(VmError::Runtime(
                        "call stack depth limit exceeded".to_string(),
                    ));
                }
                let scope = new_scope(Some(func.env.clone()));
                {
                    let mut s = scope.borrow_mut();
                    for (param, arg) in func.params.iter().zip(args) {
                        s.vars.insert(param.clone(), arg);
                    }
                    // locals exist from entry unless an enclosing
                    // function already binds the name
                    let globals = declared_globals(&func.body);
                    s.globals = globals.clone();
                    for name in assigned_vars(&func.body) {
                        if globals.contains(&name) || s.vars.contains_key(&name) {
                            continue;
                        }
                        if !self.bound_in_chain(&func.env, &name) {
                            s.vars.insert(name, IValue::None);
                        }
                    }
                }
                self.depth += 1;
                let result = self.exec_block(&func.body, &scope);
                self.depth -= 1;
                match result? {
                    Flow::Return(v) => Ok(v),
                    Flow::Normal => Err(VmError::Runtime(
                        "Function must end with a return statement".to_string(),
                    )),
                }
            }
            _ => Err(VmError::IllegalCast(
                "Expected closure or function".to_string(),
            )),
        }
    }

    /// Is `name` bound by an enclosing function scope (not the global
    /// scope)?
    fn bound_in_chain(&self, env: &Env, name: &str) -> bool {
        let mut current = Some(env.clone());
        while let Some(scope) = current {
            if Rc::ptr_eq(&scope, &self.global_env) {
                return false;
            }
            if scope.borrow().vars.contains_key(name) {
                return true;
            }
            let parent = scope.borrow().parent.clone();
            current = parent;
        }
        false
    }

    fn binary(&mut self, op: BinOp, l: IValue, r: IValue) -> Result<IValue, VmError> {
        Ok(match op {
            BinOp::Add => match (&l, &r) {
                (IValue::Int(a), IValue::Int(b)) => IValue::Int(a.wrapping_add(*b)),
                _ if matches!(l, IValue::Str(_)) || matches!(r, IValue::Str(_)) => {
                    IValue::Str(Rc::new(format!("{}{}", l.stringify(), r.stringify())))
                }
                _ => {
                    return Err(VmError::IllegalCast(
                        "Invalid operand types for add".to_string(),
                    ))
                }
            },
            BinOp::Sub => IValue::Int(l.as_int()?.wrapping_sub(r.as_int()?)),
            BinOp::Mul => IValue::Int(l.as_int()?.wrapping_mul(r.as_int()?)),
            BinOp::Div => {
                let divisor = r.as_int()?;
                if divisor == 0 {
                    return Err(VmError::IllegalArithmetic("Division by zero".to_string()));
                }
                IValue::Int(l.as_int()?.wrapping_div(divisor))
            }
            BinOp::Lt => IValue::Bool(l.as_int()? < r.as_int()?),
            BinOp::Leq => IValue::Bool(l.as_int()? <= r.as_int()?),
            BinOp::Gt => IValue::Bool(l.as_int()? > r.as_int()?),
            BinOp::Geq => IValue::Bool(l.as_int()? >= r.as_int()?),
            BinOp::Eq => IValue::Bool(l.equals(&r)),
            BinOp::And => IValue::Bool(l.as_bool()? && r.as_bool()?),
            BinOp::Or => IValue::Bool(l.as_bool()? || r.as_bool()?),
        })
    }

    fn call_native(&mut self, id: usize, args: Vec<IValue>) -> Result<IValue, VmError> {
        match id {
            0 => {
                if args.len() != 1 {
                    return Err(VmError::Runtime("print expects 1 argument".to_string()));
                }
                writeln!(self.output, "{}", args[0].stringify())
                    .map_err(|e| VmError::Runtime(format!("print failed: {}", e)))?;
                Ok(IValue::None)
            }
            1 => {
                let mut line = String::new();
                std::io::stdin()
                    .read_line(&mut line)
                    .map_err(|e| VmError::Runtime(format!("input failed: {}", e)))?;
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(IValue::Str(Rc::new(line)))
            }
            2 => {
                if args.len() != 1 {
                    return Err(VmError::Runtime("intcast expects 1 argument".to_string()));
                }
                match &args[0] {
                    IValue::Str(s) => Ok(IValue::Int(parse_int_prefix(s))),
                    _ => Err(VmError::IllegalCast("Cannot cast to int".to_string())),
                }
            }
            _ => Err(VmError::Runtime(format!("unknown native function {}", id))),
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new()
    }
}

fn builtin_id(name: &str) -> Option<usize> {
    match name {
        "print" => Some(0),
        "input" => Some(1),
        "intcast" => Some(2),
        _ => None,
    }
}

fn index_key(idx: &IValue) -> Result<String, VmError> {
    match idx {
        IValue::Int(i) => Ok(i.to_string()),
        IValue::Str(s) => Ok(s.as_ref().clone()),
        _ => Err(VmError::IllegalCast("Invalid index type".to_string())),
    }
}

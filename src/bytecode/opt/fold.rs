// Constant folding and local constant propagation.
// Created by: Haoran Wei

use crate::bytecode::opt::{is_nop, jump_targets, nop};
use crate::bytecode::{Constant, Function, Instruction, Op};

/// Abstract lattice value tracked per operand-stack slot and per local.
/// `Top` is "any runtime value"; constants fold; everything unknown
/// across a branch target collapses to `Top`.
#[derive(Debug, Clone, PartialEq)]
enum Abstract {
    Top,
    Const(Constant),
}

/// Evaluate a pure binary operator over two constants. `None` means the
/// fold is not possible (type error or division by zero stay runtime
/// behavior).
fn eval_binary(op: Op, left: &Constant, right: &Constant) -> Option<Constant> {
    use Constant::*;
    Some(match (op, left, right) {
        (Op::Add, Int(a), Int(b)) => Int(a.wrapping_add(*b)),
        (Op::Add, l, r) if matches!(l, Str(_)) || matches!(r, Str(_)) => {
            Str(format!("{}{}", const_text(l)?, const_text(r)?))
        }
        (Op::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(*b)),
        (Op::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(*b)),
        (Op::Div, Int(_), Int(0)) => return Option::None,
        (Op::Div, Int(a), Int(b)) => Int(a.wrapping_div(*b)),
        (Op::Gt, Int(a), Int(b)) => Bool(a > b),
        (Op::Geq, Int(a), Int(b)) => Bool(a >= b),
        (Op::Eq, a, b) => Bool(a == b),
        (Op::And, Bool(a), Bool(b)) => Bool(*a && *b),
        (Op::Or, Bool(a), Bool(b)) => Bool(*a || *b),
        _ => return Option::None,
    })
}

fn eval_unary(op: Op, operand: &Constant) -> Option<Constant> {
    Some(match (op, operand) {
        (Op::Neg, Constant::Int(i)) => Constant::Int(i.wrapping_neg()),
        (Op::Not, Constant::Bool(b)) => Constant::Bool(!b),
        _ => return None,
    })
}

fn const_text(c: &Constant) -> Option<String> {
    Some(match c {
        Constant::None => "None".to_string(),
        Constant::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Constant::Int(i) => i.to_string(),
        Constant::Str(s) => s.clone(),
    })
}

fn const_at(func: &Function, inst: &Instruction) -> Option<Constant> {
    if inst.op != Op::LoadConst {
        return None;
    }
    let idx = usize::try_from(inst.operand?).ok()?;
    func.constants.get(idx).cloned()
}

/// Fold `load_const X; load_const Y; binop` and `load_const X; unop`
/// into a single constant load, and resolve `load_const bool; if`.
/// Patterns never straddle a jump target, so the replacement preserves
/// stack balance on every path.
pub fn fold_constants(func: &mut Function) -> bool {
    let targets = jump_targets(&func.instructions);
    let mut changed = false;
    let mut i = 0;
    while i < func.instructions.len() {
        let code_len = func.instructions.len();
        // binary: three contiguous instructions, no interior target
        if i + 2 < code_len
            && !targets.contains(&(i + 1))
            && !targets.contains(&(i + 2))
        {
            let (a, b, op_inst) = (
                func.instructions[i],
                func.instructions[i + 1],
                func.instructions[i + 2],
            );
            if let (Some(left), Some(right)) = (const_at(func, &a), const_at(func, &b)) {
                if let Some(folded) = eval_binary(op_inst.op, &left, &right) {
                    let idx = func.add_constant(folded);
                    func.instructions[i] = nop();
                    func.instructions[i + 1] = nop();
                    func.instructions[i + 2] = Instruction::new(Op::LoadConst, Some(idx));
                    changed = true;
                    i += 3;
                    continue;
                }
            }
        }
        // unary
        if i + 1 < code_len && !targets.contains(&(i + 1)) {
            let (a, op_inst) = (func.instructions[i], func.instructions[i + 1]);
            if let Some(operand) = const_at(func, &a) {
                if let Some(folded) = eval_unary(op_inst.op, &operand) {
                    let idx = func.add_constant(folded);
                    func.instructions[i] = nop();
                    func.instructions[i + 1] = Instruction::new(Op::LoadConst, Some(idx));
                    changed = true;
                    i += 2;
                    continue;
                }
                // constant branch condition
                if op_inst.op == Op::If {
                    if let Constant::Bool(cond) = operand {
                        func.instructions[i] = nop();
                        func.instructions[i + 1] = if cond {
                            Instruction::new(Op::Goto, op_inst.operand)
                        } else {
                            nop()
                        };
                        changed = true;
                        i += 2;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }
    changed
}

/// Linear constant propagation through local slots: a `load_local` of a
/// slot whose last store in the current straight-line region was a
/// known constant becomes a `load_const`. State collapses to Top at
/// every branch target. Disabled when the function uses any reference
/// operation, since ref operands index a different table than locals.
pub fn propagate_locals(func: &mut Function) -> bool {
    let uses_references = func.instructions.iter().any(|inst| {
        matches!(
            inst.op,
            Op::PushReference | Op::LoadReference | Op::StoreReference
        )
    });
    if uses_references {
        return false;
    }

    let targets = jump_targets(&func.instructions);
    let local_count = func.local_vars.len();
    // parameters are unknown, other locals start as None
    let mut locals: Vec<Abstract> = (0..local_count)
        .map(|i| {
            if i < func.parameter_count {
                Abstract::Top
            } else {
                Abstract::Const(Constant::None)
            }
        })
        .collect();
    let mut stack: Vec<Abstract> = Vec::new();
    let mut changed = false;
    let mut rewrites: Vec<(usize, Constant)> = Vec::new();

    for i in 0..func.instructions.len() {
        if targets.contains(&i) {
            // join point: forget everything
            for slot in locals.iter_mut() {
                *slot = Abstract::Top;
            }
            stack.clear();
        }
        let inst = func.instructions[i];
        match inst.op {
            Op::LoadConst => {
                let c = const_at(func, &inst);
                stack.push(match c {
                    Some(c) => Abstract::Const(c),
                    _ => Abstract::Top,
                });
            }
            Op::LoadLocal => {
                let idx = inst.operand.unwrap_or(-1);
                let val = usize::try_from(idx)
                    .ok()
                    .and_then(|idx| locals.get(idx).cloned())
                    .unwrap_or(Abstract::Top);
                if let Abstract::Const(ref c) = val {
                    rewrites.push((i, c.clone()));
                }
                stack.push(val);
            }
            Op::StoreLocal => {
                let val = stack.pop().unwrap_or(Abstract::Top);
                if let Some(idx) = inst.operand.and_then(|v| usize::try_from(v).ok()) {
                    if idx < locals.len() {
                        locals[idx] = val;
                    }
                }
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Gt | Op::Geq | Op::Eq | Op::And
            | Op::Or => {
                let right = stack.pop().unwrap_or(Abstract::Top);
                let left = stack.pop().unwrap_or(Abstract::Top);
                let folded = match (&left, &right) {
                    (Abstract::Const(l), Abstract::Const(r)) => eval_binary(inst.op, l, r),
                    _ => None,
                };
                stack.push(match folded {
                    Some(c) => Abstract::Const(c),
                    _ => Abstract::Top,
                });
            }
            Op::Neg | Op::Not => {
                let operand = stack.pop().unwrap_or(Abstract::Top);
                let folded = match &operand {
                    Abstract::Const(c) => eval_unary(inst.op, c),
                    _ => None,
                };
                stack.push(match folded {
                    Some(c) => Abstract::Const(c),
                    _ => Abstract::Top,
                });
            }
            Op::If => {
                stack.pop();
            }
            Op::Pop => {
                stack.pop();
            }
            Op::Dup => {
                let top = stack.last().cloned().unwrap_or(Abstract::Top);
                stack.push(top);
            }
            Op::Swap => {
                let n = stack.len();
                if n >= 2 {
                    stack.swap(n - 1, n - 2);
                }
            }
            Op::Goto | Op::Return => {
                stack.clear();
            }
            Op::Call => {
                let count = inst.operand.unwrap_or(0).max(0) as usize;
                for _ in 0..count + 1 {
                    stack.pop();
                }
                stack.push(Abstract::Top);
            }
            Op::AllocClosure => {
                let count = inst.operand.unwrap_or(0).max(0) as usize;
                for _ in 0..count + 1 {
                    stack.pop();
                }
                stack.push(Abstract::Top);
            }
            Op::LoadGlobal | Op::LoadFunc | Op::AllocRecord | Op::PushReference => {
                stack.push(Abstract::Top);
            }
            Op::FieldLoad | Op::LoadReference => {
                stack.pop();
                stack.push(Abstract::Top);
            }
            Op::IndexLoad => {
                stack.pop();
                stack.pop();
                stack.push(Abstract::Top);
            }
            Op::StoreGlobal => {
                stack.pop();
            }
            Op::FieldStore | Op::StoreReference => {
                stack.pop();
                stack.pop();
            }
            Op::IndexStore => {
                stack.pop();
                stack.pop();
                stack.pop();
            }
        }
    }

    for (i, c) in rewrites {
        if is_nop(&func.instructions[i]) {
            continue;
        }
        let idx = func.add_constant(c);
        func.instructions[i] = Instruction::new(Op::LoadConst, Some(idx));
        changed = true;
    }
    changed
}

// Peephole, algebraic and strength-reduction rewrites.
// Created by: Haoran Wei
//
// All rewrites are strictly local and never straddle a jump target;
// removed instructions become `goto 1` no-ops so indices stay stable
// until the shared cleanup pass runs.

use crate::bytecode::opt::{jump_targets, nop};
use crate::bytecode::{Constant, Function, Instruction, Op};
use std::collections::HashSet;

fn int_const(func: &Function, inst: &Instruction) -> Option<i32> {
    if inst.op != Op::LoadConst {
        return None;
    }
    match func.constants.get(usize::try_from(inst.operand?).ok()?) {
        Some(Constant::Int(i)) => Some(*i),
        _ => None,
    }
}

/// Loads that push exactly one value and cannot branch or fault the
/// stack; safe to commute around in three-instruction patterns.
fn is_simple_load(op: Op) -> bool {
    matches!(op, Op::LoadLocal | Op::LoadGlobal | Op::LoadConst)
}

fn clear(func: &mut Function, i: usize) {
    func.instructions[i] = nop();
}

/// Algebraic identities: x+0, 0+x, x-0, x*1, 1*x, x/1 collapse to x;
/// x*0 and 0*x become the constant 0 with the operand still evaluated
/// and popped, so stack balance and its side effects are preserved.
pub fn algebraic_simplify(func: &mut Function) -> bool {
    let targets = jump_targets(&func.instructions);
    let mut changed = false;

    // right-hand constant: [.. x][load_const c][binop]
    let mut i = 0;
    while i + 1 < func.instructions.len() {
        if targets.contains(&(i + 1)) {
            i += 1;
            continue;
        }
        let next_op = func.instructions[i + 1].op;
        if let Some(value) = int_const(func, &func.instructions[i]) {
            match (value, next_op) {
                (0, Op::Add) | (0, Op::Sub) | (1, Op::Mul) | (1, Op::Div) => {
                    clear(func, i);
                    clear(func, i + 1);
                    changed = true;
                    i += 2;
                    continue;
                }
                (0, Op::Mul) => {
                    // x * 0 = 0: pop x, keep the 0
                    let zero = func.add_constant(Constant::Int(0));
                    func.instructions[i] = Instruction::new(Op::Pop, None);
                    func.instructions[i + 1] = Instruction::new(Op::LoadConst, Some(zero));
                    changed = true;
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        // boolean identities (x & true, x | false, ...) are left alone:
        // dropping the operator would also drop its type check
        i += 1;
    }

    // left-hand constant: [load_const c][simple load][binop]
    let mut i = 0;
    while i + 2 < func.instructions.len() {
        if targets.contains(&(i + 1)) || targets.contains(&(i + 2)) {
            i += 1;
            continue;
        }
        let mid = func.instructions[i + 1];
        let last = func.instructions[i + 2].op;
        if !is_simple_load(mid.op) {
            i += 1;
            continue;
        }
        if let Some(value) = int_const(func, &func.instructions[i]) {
            match (value, last) {
                (0, Op::Add) | (1, Op::Mul) => {
                    clear(func, i);
                    clear(func, i + 2);
                    changed = true;
                    i += 3;
                    continue;
                }
                (0, Op::Mul) => {
                    // 0 * x = 0: still evaluate x (it may fault), then
                    // pop it and load the 0
                    let zero = func.add_constant(Constant::Int(0));
                    func.instructions[i] = mid;
                    func.instructions[i + 1] = Instruction::new(Op::Pop, None);
                    func.instructions[i + 2] = Instruction::new(Op::LoadConst, Some(zero));
                    changed = true;
                    i += 3;
                    continue;
                }
                _ => {}
            }
        }
        i += 1;
    }

    changed
}

/// Strength reduction: `x * 2` becomes `dup; add`.
pub fn strength_reduce(func: &mut Function) -> bool {
    let targets = jump_targets(&func.instructions);
    let mut changed = false;

    let mut i = 0;
    while i + 1 < func.instructions.len() {
        if !targets.contains(&(i + 1))
            && int_const(func, &func.instructions[i]) == Some(2)
            && func.instructions[i + 1].op == Op::Mul
        {
            func.instructions[i] = Instruction::new(Op::Dup, None);
            func.instructions[i + 1] = Instruction::new(Op::Add, None);
            changed = true;
            i += 2;
            continue;
        }
        i += 1;
    }

    // commuted form: [load_const 2][simple load][mul] -> [load][dup][add]
    let mut i = 0;
    while i + 2 < func.instructions.len() {
        if !targets.contains(&(i + 1))
            && !targets.contains(&(i + 2))
            && int_const(func, &func.instructions[i]) == Some(2)
            && is_simple_load(func.instructions[i + 1].op)
            && func.instructions[i + 2].op == Op::Mul
        {
            func.instructions[i] = func.instructions[i + 1];
            func.instructions[i + 1] = Instruction::new(Op::Dup, None);
            func.instructions[i + 2] = Instruction::new(Op::Add, None);
            changed = true;
            i += 3;
            continue;
        }
        i += 1;
    }

    changed
}

fn pair_rewrites(
    func: &mut Function,
    targets: &HashSet<usize>,
) -> bool {
    // a store_local on a ref-local also writes the cell; those pairs
    // are not redundant and stay untouched
    let ref_slots: HashSet<i32> = func
        .local_ref_vars
        .iter()
        .filter_map(|name| func.local_vars.iter().position(|v| v == name))
        .map(|idx| idx as i32)
        .collect();
    let mut changed = false;
    let mut i = 0;
    while i + 1 < func.instructions.len() {
        if targets.contains(&(i + 1)) {
            i += 1;
            continue;
        }
        let (a, b) = (func.instructions[i], func.instructions[i + 1]);
        let both_cleared = match (a.op, b.op) {
            (Op::Dup, Op::Pop) => true,
            (Op::Swap, Op::Swap) => true,
            (Op::Not, Op::Not) => true,
            (Op::Neg, Op::Neg) => true,
            (Op::LoadConst, Op::Pop) => true,
            (Op::LoadLocal, Op::StoreLocal)
                if a.operand == b.operand
                    && !a.operand.map(|x| ref_slots.contains(&x)).unwrap_or(true) =>
            {
                true
            }
            _ => false,
        };
        if both_cleared {
            clear(func, i);
            clear(func, i + 1);
            changed = true;
            i += 2;
            continue;
        }
        // load_local X; load_local X -> load_local X; dup
        if a.op == Op::LoadLocal && b.op == Op::LoadLocal && a.operand == b.operand {
            func.instructions[i + 1] = Instruction::new(Op::Dup, None);
            changed = true;
            i += 2;
            continue;
        }
        // store_local i; load_local i -> dup; store_local i
        if a.op == Op::StoreLocal && b.op == Op::LoadLocal && a.operand == b.operand {
            func.instructions[i] = Instruction::new(Op::Dup, None);
            func.instructions[i + 1] = Instruction::new(Op::StoreLocal, a.operand);
            changed = true;
            i += 2;
            continue;
        }
        i += 1;
    }
    changed
}

/// Local pattern cleanup over adjacent instruction pairs.
pub fn peephole(func: &mut Function) -> bool {
    let targets = jump_targets(&func.instructions);
    pair_rewrites(func, &targets)
}

// Function inlining.
// Created by: Haoran Wei
//
// Only the direct pattern `load_func k; <simple arg loads>; call n` is
// rewritten: the callee body is spliced in after staging the arguments
// into fresh caller locals. Eligibility is deliberately narrow: no
// free variables, no nested children, no ref-locals, a single trailing
// return, and a small body. Inlined constants and names are re-interned
// into the caller's pools; caller branch offsets are recomputed against
// an index map, the body's internal branches stay self-relative.

use crate::bytecode::opt::jump_targets;
use crate::bytecode::{Function, Instruction, Op};
use std::collections::HashSet;

const MAX_INLINE_PASSES: usize = 3;
const MAX_CALLEE_SIZE: usize = 100;
const MAX_CODE_SIZE: usize = 10_000;

fn is_inlinable(callee: &Function) -> bool {
    if !callee.free_vars.is_empty()
        || !callee.functions.is_empty()
        || !callee.local_ref_vars.is_empty()
    {
        return false;
    }
    if callee.instructions.is_empty() || callee.instructions.len() > MAX_CALLEE_SIZE {
        return false;
    }
    // exactly one return, at the end: an early return would terminate
    // the caller instead of the spliced body
    let returns = callee
        .instructions
        .iter()
        .filter(|inst| inst.op == Op::Return)
        .count();
    returns == 1 && callee.instructions.last().map(|i| i.op) == Some(Op::Return)
}

fn is_simple_load(op: Op) -> bool {
    matches!(op, Op::LoadConst | Op::LoadLocal | Op::LoadGlobal)
}

struct Site {
    load_func_pos: usize,
    argc: usize,
    callee_idx: usize,
}

fn find_site(
    func: &Function,
    code: &[Instruction],
    targets: &HashSet<usize>,
    call_idx: usize,
) -> Option<Site> {
    let argc = usize::try_from(code[call_idx].operand?).ok()?;
    if call_idx < argc + 1 {
        return None;
    }
    let load_func_pos = call_idx - argc - 1;
    if code[load_func_pos].op != Op::LoadFunc {
        return None;
    }
    // the sequence must be entered from the top only
    if (load_func_pos + 1..=call_idx).any(|j| targets.contains(&j)) {
        return None;
    }
    if (load_func_pos + 1..call_idx).any(|j| !is_simple_load(code[j].op)) {
        return None;
    }
    let callee_idx = usize::try_from(code[load_func_pos].operand?).ok()?;
    let callee = func.functions.get(callee_idx)?;
    if !is_inlinable(callee) || callee.parameter_count != argc {
        return None;
    }
    Some(Site {
        load_func_pos,
        argc,
        callee_idx,
    })
}

fn add_name(func: &mut Function, name: &str) -> i32 {
    if let Some(idx) = func.names.iter().position(|n| n == name) {
        return idx as i32;
    }
    func.names.push(name.to_string());
    (func.names.len() - 1) as i32
}

/// Clone the callee body (without its trailing return), remapping local
/// slots by `local_offset` and re-interning pool references into the
/// caller.
fn remap_body(caller: &mut Function, callee_idx: usize, local_offset: usize) -> Vec<Instruction> {
    let callee = &caller.functions[callee_idx];
    let body: Vec<Instruction> =
        callee.instructions[..callee.instructions.len() - 1].to_vec();
    let consts = callee.constants.clone();
    let names = callee.names.clone();
    let mut out = Vec::with_capacity(body.len());
    for mut inst in body {
        match inst.op {
            Op::LoadLocal | Op::StoreLocal => {
                inst.operand = Some(inst.operand.unwrap_or(0) + local_offset as i32);
            }
            Op::LoadConst => {
                if let Some(c) = inst
                    .operand
                    .and_then(|v| usize::try_from(v).ok())
                    .and_then(|idx| consts.get(idx).cloned())
                {
                    inst.operand = Some(caller.add_constant(c));
                }
            }
            Op::LoadGlobal | Op::StoreGlobal | Op::FieldLoad | Op::FieldStore => {
                if let Some(name) = inst
                    .operand
                    .and_then(|v| usize::try_from(v).ok())
                    .and_then(|idx| names.get(idx).cloned())
                {
                    inst.operand = Some(add_name(caller, &name));
                }
            }
            _ => {}
        }
        out.push(inst);
    }
    out
}

fn inline_one(func: &mut Function) -> bool {
    let code = func.instructions.clone();
    let n = code.len();
    let targets = jump_targets(&code);
    let mut new_code: Vec<Instruction> = Vec::with_capacity(n);
    // old index of each caller-originated instruction; None for spliced code
    let mut origin: Vec<Option<usize>> = Vec::with_capacity(n);
    let mut map: Vec<Option<usize>> = vec![None; n + 1];
    let mut changed = false;

    for (i, inst) in code.iter().enumerate() {
        if inst.op == Op::Call {
            if let Some(site) = find_site(func, &code, &targets, i) {
                // drop the load_func already emitted into new_code
                let lf_new_idx = new_code.len() - site.argc - 1;
                new_code.remove(lf_new_idx);
                origin.remove(lf_new_idx);
                map[site.load_func_pos] = None;
                for j in site.load_func_pos + 1..i {
                    map[j] = map[j].map(|v| v - 1);
                }

                let splice_start = new_code.len();
                // extend caller locals with the callee's, renamed
                let local_offset = func.local_vars.len();
                let callee_locals = func.functions[site.callee_idx].local_vars.clone();
                for name in &callee_locals {
                    func.local_vars.push(format!("{}_inl{}", name, local_offset));
                }
                // stage arguments: top of stack is the last argument
                for j in (0..site.argc).rev() {
                    new_code.push(Instruction::new(
                        Op::StoreLocal,
                        Some((local_offset + j) as i32),
                    ));
                    origin.push(None);
                }
                for inst in remap_body(func, site.callee_idx, local_offset) {
                    new_code.push(inst);
                    origin.push(None);
                }
                map[i] = Some(splice_start);
                changed = true;
                continue;
            }
        }
        map[i] = Some(new_code.len());
        new_code.push(*inst);
        origin.push(Some(i));
    }
    map[n] = Some(new_code.len());

    if !changed {
        return false;
    }

    // forward-fill removed slots
    let mut next = new_code.len();
    for i in (0..=n).rev() {
        match map[i] {
            Some(v) => next = v,
            None => map[i] = Some(next),
        }
    }

    // recompute caller branch offsets; spliced code keeps its own
    let new_code_len = new_code.len();
    for (new_i, inst) in new_code.iter_mut().enumerate() {
        if !matches!(inst.op, Op::Goto | Op::If) {
            continue;
        }
        let Some(old_i) = origin[new_i] else { continue };
        let off = inst.operand.unwrap_or(1) as i64;
        let target = (old_i as i64 + off).clamp(0, n as i64) as usize;
        let new_target = map[target].unwrap_or(new_code_len);
        inst.operand = Some(new_target as i32 - new_i as i32);
    }

    func.instructions = new_code;
    true
}

/// Inline eligible direct calls, children first, for a bounded number
/// of passes; bails out when the function stops changing or grows past
/// the size cap.
pub fn inline_functions(func: &mut Function) {
    for child in &mut func.functions {
        inline_functions(child);
    }
    for _ in 0..MAX_INLINE_PASSES {
        let before = func.instructions.len();
        if !inline_one(func) {
            break;
        }
        if func.instructions.len() == before || func.instructions.len() > MAX_CODE_SIZE {
            break;
        }
    }
}

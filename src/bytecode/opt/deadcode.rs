// Unreachable-code and dead-store elimination, pool compaction.
// Created by: Haoran Wei
//
// Reachability is a forward walk from instruction 0: goto and return do
// not fall through, `if` forks both ways. Dead stores come out of a
// block-level liveness analysis; the pass is disabled outright when the
// function touches references, because reference operands index
// local_ref_vars/free_vars rather than local_vars.

use crate::bytecode::opt::rebuild_filtered;
use crate::bytecode::{Function, Instruction, Op};
use std::collections::{HashMap, HashSet};

fn branch_target(code: &[Instruction], i: usize) -> Option<usize> {
    let inst = &code[i];
    if !matches!(inst.op, Op::Goto | Op::If) {
        return None;
    }
    let target = i as i64 + inst.operand? as i64;
    if target >= 0 && target < code.len() as i64 {
        Some(target as usize)
    } else {
        None
    }
}

fn reachable_set(code: &[Instruction]) -> HashSet<usize> {
    let mut reachable = HashSet::new();
    let mut worklist = vec![0usize];
    while let Some(pc) = worklist.pop() {
        if pc >= code.len() || !reachable.insert(pc) {
            continue;
        }
        match code[pc].op {
            Op::Return => {}
            Op::Goto => {
                if let Some(t) = branch_target(code, pc) {
                    worklist.push(t);
                }
            }
            Op::If => {
                if let Some(t) = branch_target(code, pc) {
                    worklist.push(t);
                }
                worklist.push(pc + 1);
            }
            _ => {
                worklist.push(pc + 1);
            }
        }
    }
    reachable
}

pub fn eliminate_unreachable(func: &mut Function) -> bool {
    if func.instructions.is_empty() {
        return false;
    }
    let reachable = reachable_set(&func.instructions);
    if reachable.len() == func.instructions.len() {
        return false;
    }
    rebuild_filtered(func, |i, _| reachable.contains(&i))
}

struct BasicBlock {
    start: usize,
    end: usize, // exclusive
    successors: Vec<usize>,
}

/// Leaders: instruction 0, every branch target, every instruction after
/// a branch or return.
fn build_blocks(code: &[Instruction]) -> Vec<BasicBlock> {
    if code.is_empty() {
        return Vec::new();
    }
    let mut leaders = HashSet::new();
    leaders.insert(0usize);
    for i in 0..code.len() {
        match code[i].op {
            Op::Goto | Op::If => {
                if let Some(t) = branch_target(code, i) {
                    leaders.insert(t);
                }
                if i + 1 < code.len() {
                    leaders.insert(i + 1);
                }
            }
            Op::Return => {
                if i + 1 < code.len() {
                    leaders.insert(i + 1);
                }
            }
            _ => {}
        }
    }
    let mut starts: Vec<usize> = leaders.into_iter().collect();
    starts.sort_unstable();
    let mut leader_block: HashMap<usize, usize> = HashMap::new();
    for (bi, &start) in starts.iter().enumerate() {
        leader_block.insert(start, bi);
    }
    let mut blocks: Vec<BasicBlock> = starts
        .iter()
        .enumerate()
        .map(|(bi, &start)| BasicBlock {
            start,
            end: if bi + 1 < starts.len() {
                starts[bi + 1]
            } else {
                code.len()
            },
            successors: Vec::new(),
        })
        .collect();
    for bi in 0..blocks.len() {
        let last = blocks[bi].end - 1;
        match code[last].op {
            Op::Goto => {
                if let Some(t) = branch_target(code, last) {
                    let succ = leader_block[&t];
                    blocks[bi].successors.push(succ);
                }
            }
            Op::If => {
                if blocks[bi].end < code.len() {
                    let succ = leader_block[&blocks[bi].end];
                    blocks[bi].successors.push(succ);
                }
                if let Some(t) = branch_target(code, last) {
                    let succ = leader_block[&t];
                    blocks[bi].successors.push(succ);
                }
            }
            Op::Return => {}
            _ => {
                if bi + 1 < blocks.len() {
                    blocks[bi].successors.push(bi + 1);
                }
            }
        }
    }
    blocks
}

/// For each instruction, the set of locals live immediately after it.
fn liveness(code: &[Instruction], blocks: &[BasicBlock], num_locals: usize) -> Vec<HashSet<i32>> {
    let nb = blocks.len();
    // upward-exposed uses and definitions per block
    let mut uses: Vec<HashSet<i32>> = vec![HashSet::new(); nb];
    let mut defs: Vec<HashSet<i32>> = vec![HashSet::new(); nb];
    for (bi, block) in blocks.iter().enumerate() {
        for i in (block.start..block.end).rev() {
            match code[i].op {
                Op::StoreLocal => {
                    if let Some(local) = code[i].operand {
                        if local >= 0 && (local as usize) < num_locals {
                            uses[bi].remove(&local);
                            defs[bi].insert(local);
                        }
                    }
                }
                Op::LoadLocal => {
                    if let Some(local) = code[i].operand {
                        if local >= 0 && (local as usize) < num_locals {
                            uses[bi].insert(local);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let mut live_in: Vec<HashSet<i32>> = vec![HashSet::new(); nb];
    let mut live_out: Vec<HashSet<i32>> = vec![HashSet::new(); nb];
    let mut changed = true;
    while changed {
        changed = false;
        for bi in (0..nb).rev() {
            let mut new_out = HashSet::new();
            for &succ in &blocks[bi].successors {
                new_out.extend(live_in[succ].iter().copied());
            }
            let mut new_in = uses[bi].clone();
            for &v in &new_out {
                if !defs[bi].contains(&v) {
                    new_in.insert(v);
                }
            }
            if new_in != live_in[bi] || new_out != live_out[bi] {
                changed = true;
                live_in[bi] = new_in;
                live_out[bi] = new_out;
            }
        }
    }

    let mut inst_live_out: Vec<HashSet<i32>> = vec![HashSet::new(); code.len()];
    for (bi, block) in blocks.iter().enumerate() {
        let mut live = live_out[bi].clone();
        for i in (block.start..block.end).rev() {
            inst_live_out[i] = live.clone();
            match code[i].op {
                Op::StoreLocal => {
                    if let Some(local) = code[i].operand {
                        live.remove(&local);
                    }
                }
                Op::LoadLocal => {
                    if let Some(local) = code[i].operand {
                        live.insert(local);
                    }
                }
                _ => {}
            }
        }
    }
    inst_live_out
}

/// Replace `store_local i` by `pop` when local i is dead after the
/// store. Parameters and ref-locals are never touched.
pub fn eliminate_dead_stores(func: &mut Function) -> bool {
    if func.instructions.is_empty() {
        return false;
    }
    let uses_references = func.instructions.iter().any(|inst| {
        matches!(
            inst.op,
            Op::PushReference | Op::LoadReference | Op::StoreReference
        )
    });
    if uses_references {
        return false;
    }

    let ref_slots: HashSet<i32> = func
        .local_ref_vars
        .iter()
        .filter_map(|name| func.local_vars.iter().position(|v| v == name))
        .map(|idx| idx as i32)
        .collect();
    let blocks = build_blocks(&func.instructions);
    let live_out = liveness(&func.instructions, &blocks, func.local_vars.len());

    let mut changed = false;
    for i in 0..func.instructions.len() {
        let inst = func.instructions[i];
        if inst.op != Op::StoreLocal {
            continue;
        }
        let Some(local) = inst.operand else { continue };
        let is_param = local >= 0 && (local as usize) < func.parameter_count;
        if is_param || ref_slots.contains(&local) {
            continue;
        }
        if !live_out[i].contains(&local) {
            func.instructions[i] = Instruction::new(Op::Pop, None);
            changed = true;
        }
    }
    changed
}

/// Drop unreferenced constants and nested functions, re-indexing every
/// load. The first three children of the top-level function are the
/// builtin sentinels and are always kept.
pub fn compact_pools(func: &mut Function) {
    compact_pools_inner(func, true);
}

fn compact_pools_inner(func: &mut Function, is_top: bool) {
    for child in &mut func.functions {
        compact_pools_inner(child, false);
    }

    let mut used_consts: HashSet<usize> = HashSet::new();
    let mut used_funcs: HashSet<usize> = HashSet::new();
    for inst in &func.instructions {
        match inst.op {
            Op::LoadConst => {
                if let Some(idx) = inst.operand.and_then(|v| usize::try_from(v).ok()) {
                    used_consts.insert(idx);
                }
            }
            Op::LoadFunc => {
                if let Some(idx) = inst.operand.and_then(|v| usize::try_from(v).ok()) {
                    used_funcs.insert(idx);
                }
            }
            _ => {}
        }
    }
    if is_top {
        // builtin sentinels live at fixed indices
        used_funcs.extend([0usize, 1, 2]);
    }

    if used_consts.len() < func.constants.len() {
        let mut const_map: HashMap<usize, i32> = HashMap::new();
        let mut new_constants = Vec::with_capacity(used_consts.len());
        for (old, c) in func.constants.drain(..).enumerate() {
            if used_consts.contains(&old) {
                const_map.insert(old, new_constants.len() as i32);
                new_constants.push(c);
            }
        }
        func.constants = new_constants;
        for inst in &mut func.instructions {
            if inst.op == Op::LoadConst {
                if let Some(old) = inst.operand.and_then(|v| usize::try_from(v).ok()) {
                    if let Some(&new) = const_map.get(&old) {
                        inst.operand = Some(new);
                    }
                }
            }
        }
    }

    if used_funcs.len() < func.functions.len() {
        let mut func_map: HashMap<usize, i32> = HashMap::new();
        let mut new_functions = Vec::with_capacity(used_funcs.len());
        for (old, f) in func.functions.drain(..).enumerate() {
            if used_funcs.contains(&old) {
                func_map.insert(old, new_functions.len() as i32);
                new_functions.push(f);
            }
        }
        func.functions = new_functions;
        for inst in &mut func.instructions {
            if inst.op == Op::LoadFunc {
                if let Some(old) = inst.operand.and_then(|v| usize::try_from(v).ok()) {
                    if let Some(&new) = func_map.get(&old) {
                        inst.operand = Some(new);
                    }
                }
            }
        }
    }
}

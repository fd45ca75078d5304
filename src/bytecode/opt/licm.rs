// Loop-invariant code motion over the lowered register form.
// Created by: Haoran Wei
//
// Runs after stack->register translation (translating on demand and
// installing the result). Natural loops are the spans of back-edge
// branches. A pure instruction whose source registers are not written
// inside the loop is cloned into a preheader in front of the header and
// replaced at its original site by a self-move, so later uses observe
// the same destination register. Back edges re-enter at the header
// proper; only loop entry runs the preheader.

use crate::backend::vm::error::VmError;
use crate::bytecode::{lower, Function, Op, RegCode, RegInstruction};
use std::collections::{HashMap, HashSet};

fn is_branch(op: Op) -> bool {
    matches!(op, Op::Goto | Op::If)
}

fn is_pure(op: Op) -> bool {
    matches!(
        op,
        Op::LoadConst
            | Op::LoadFunc
            | Op::LoadLocal
            | Op::LoadGlobal
            | Op::FieldLoad
            | Op::IndexLoad
            | Op::Dup
            | Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Gt
            | Op::Geq
            | Op::Eq
            | Op::And
            | Op::Or
            | Op::Neg
            | Op::Not
    )
}

/// Source registers an instruction actually reads.
fn sources(inst: &RegInstruction) -> (Option<u16>, Option<u16>) {
    match inst.op {
        Op::LoadConst | Op::LoadFunc | Op::LoadGlobal | Op::AllocRecord | Op::PushReference => {
            (None, None)
        }
        Op::LoadLocal | Op::Dup | Op::Neg | Op::Not | Op::LoadReference | Op::FieldLoad => {
            (Some(inst.src1), None)
        }
        Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::Gt
        | Op::Geq
        | Op::Eq
        | Op::And
        | Op::Or
        | Op::IndexLoad
        | Op::StoreReference => (Some(inst.src1), Some(inst.src2)),
        Op::StoreLocal | Op::StoreGlobal | Op::Return | Op::If => (Some(inst.src1), None),
        Op::FieldStore => (Some(inst.src1), Some(inst.src2)),
        Op::IndexStore => (Some(inst.src1), Some(inst.src2)),
        Op::Call | Op::AllocClosure => (Some(inst.src1), Some(inst.src2)),
        Op::Goto | Op::Swap | Op::Pop => (None, None),
    }
}

/// The register an instruction writes, if any. Branches, returns and
/// memory stores carry operands in `dst` without writing it.
fn written(inst: &RegInstruction) -> Option<u16> {
    match inst.op {
        Op::Goto
        | Op::If
        | Op::Return
        | Op::StoreGlobal
        | Op::StoreReference
        | Op::FieldStore
        | Op::IndexStore => None,
        _ => Some(inst.dst),
    }
}

struct Loop {
    header: usize,
    tail: usize,
}

fn find_loops(code: &[RegInstruction]) -> Vec<Loop> {
    let mut loops = Vec::new();
    for (idx, inst) in code.iter().enumerate() {
        if !is_branch(inst.op) {
            continue;
        }
        let target = idx as i64 + inst.imm as i64;
        if target < 0 || target >= code.len() as i64 {
            continue;
        }
        let target = target as usize;
        if target <= idx {
            loops.push(Loop {
                header: target,
                tail: idx,
            });
        }
    }
    loops
}

pub fn run(func: &mut Function) -> Result<(), VmError> {
    for child in &mut func.functions {
        run(child)?;
    }
    run_on(func)
}

pub fn run_on(func: &mut Function) -> Result<(), VmError> {
    if func.reg_code.get().is_some() {
        // already lowered (and possibly executing); leave it alone
        return Ok(());
    }
    let mut code = lower::translate(func)?;
    transform(&mut code);
    let _ = func.reg_code.set(code);
    Ok(())
}

fn transform(code: &mut RegCode) {
    let insts = &mut code.code;
    if insts.is_empty() {
        return;
    }
    let original_imms: Vec<i32> = insts.iter().map(|inst| inst.imm).collect();
    let loops = find_loops(insts);
    if loops.is_empty() {
        return;
    }

    let mut preheader_inserts: HashMap<usize, Vec<RegInstruction>> = HashMap::new();
    let mut max_reg = 0u16;

    for lp in &loops {
        if lp.tail >= insts.len() {
            continue;
        }
        // every register written somewhere in the body
        let mut modified: HashSet<u16> = HashSet::new();
        let mut clobbers_memory = false;
        for inst in &insts[lp.header..=lp.tail] {
            max_reg = max_reg.max(inst.dst).max(inst.src1).max(inst.src2);
            if let Some(reg) = written(inst) {
                modified.insert(reg);
            }
            if inst.op == Op::Swap {
                // swap writes both of its registers
                modified.insert(inst.src1);
            }
            if matches!(
                inst.op,
                Op::Call
                    | Op::FieldStore
                    | Op::IndexStore
                    | Op::StoreGlobal
                    | Op::StoreReference
            ) {
                clobbers_memory = true;
            }
        }

        for i in lp.header..=lp.tail {
            let inst = insts[i];
            if !is_pure(inst.op) {
                continue;
            }
            // memory reads are only invariant if nothing in the loop
            // can write memory
            if clobbers_memory
                && matches!(inst.op, Op::LoadGlobal | Op::FieldLoad | Op::IndexLoad)
            {
                continue;
            }
            let (s1, s2) = sources(&inst);
            if s1.map(|r| modified.contains(&r)).unwrap_or(false)
                || s2.map(|r| modified.contains(&r)).unwrap_or(false)
            {
                continue;
            }
            // clone into the preheader, leave a self-move behind so the
            // destination register still carries the value
            preheader_inserts.entry(lp.header).or_default().push(inst);
            insts[i] = RegInstruction {
                op: Op::LoadLocal,
                dst: inst.dst,
                src1: inst.dst,
                src2: 0,
                imm: 0,
            };
        }
    }
    code.register_count = code.register_count.max(max_reg as usize + 1);

    if preheader_inserts.is_empty() {
        return;
    }

    // rebuild with the preheaders spliced in front of their headers
    let old_len = code.code.len();
    let mut entry_pos = vec![0usize; old_len + 1]; // includes the preheader
    let mut instr_pos = vec![0usize; old_len + 1]; // the instruction itself
    let mut new_code: Vec<RegInstruction> = Vec::with_capacity(old_len);
    let mut origin: Vec<Option<usize>> = Vec::new();
    for i in 0..old_len {
        entry_pos[i] = new_code.len();
        if let Some(inserts) = preheader_inserts.get(&i) {
            for &ins in inserts {
                new_code.push(ins);
                origin.push(None);
            }
        }
        instr_pos[i] = new_code.len();
        new_code.push(code.code[i]);
        origin.push(Some(i));
    }
    entry_pos[old_len] = new_code.len();
    instr_pos[old_len] = new_code.len();

    for idx in 0..new_code.len() {
        let Some(orig) = origin[idx] else { continue };
        if !is_branch(new_code[idx].op) {
            continue;
        }
        let target_old = orig as i64 + original_imms[orig] as i64;
        if target_old < 0 || target_old > old_len as i64 {
            continue;
        }
        let target_old = target_old as usize;
        // a branch from inside a loop back to that loop's header must
        // not re-run the preheader
        let from_inside = loops
            .iter()
            .any(|lp| lp.header == target_old && orig >= lp.header && orig <= lp.tail);
        let target_new = if from_inside {
            instr_pos[target_old]
        } else {
            entry_pos[target_old]
        };
        new_code[idx].imm = target_new as i32 - idx as i32;
    }

    code.code = new_code;
}

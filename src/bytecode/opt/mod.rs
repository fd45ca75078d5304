// Quill bytecode optimizer
// Created by: Haoran Wei
// Changelog:
// 2026-06-27: Pass pipeline: unreachable-code elimination, algebraic
//            simplification, strength reduction, constant folding,
//            peephole, jump threading; iterated per function (children
//            first) until a fixed point or the pass cap.
// 2026-07-03: Liveness-based dead-store elimination and pool compaction.
// 2026-07-09: Function inlining and loop-invariant code motion over the
//            lowered register form.
//
// Rewrites never splice the instruction vector directly: a pass either
// overwrites instructions in place (keeping indices stable) or marks
// them as `goto 1` no-ops, and `remove_nops` rebuilds the stream with
// every branch offset recomputed against the surviving targets.

pub mod deadcode;
pub mod fold;
pub mod inline;
pub mod licm;
pub mod peephole;

use crate::backend::vm::error::VmError;
use crate::bytecode::{Function, Instruction, Op};
use std::collections::HashSet;

const MAX_PIPELINE_PASSES: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct OptOptions {
    /// Base pipeline: unreachable code, folding, peephole, jump
    /// threading, pool compaction.
    pub base: bool,
    pub dce: bool,
    pub constprop: bool,
    pub inline: bool,
    pub licm: bool,
    pub debug: bool,
}

impl OptOptions {
    pub fn all() -> Self {
        OptOptions {
            base: true,
            dce: true,
            constprop: true,
            inline: true,
            licm: true,
            debug: false,
        }
    }

    /// Map `-O` names to toggles. Recognized: optimize, dce, constprop,
    /// inline, licm, all. Unknown names are ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut opts = OptOptions::default();
        for name in names {
            match name.as_ref() {
                "optimize" => opts.base = true,
                "dce" => {
                    opts.base = true;
                    opts.dce = true;
                }
                "constprop" => {
                    opts.base = true;
                    opts.constprop = true;
                }
                "inline" => opts.inline = true,
                "licm" => opts.licm = true,
                "all" => {
                    let debug = opts.debug;
                    opts = OptOptions::all();
                    opts.debug = debug;
                }
                _ => {}
            }
        }
        opts
    }

    pub fn enabled(&self) -> bool {
        self.base || self.dce || self.constprop || self.inline || self.licm
    }
}

/// Optimize a function tree. The rewriting pipeline runs per function,
/// children before parents; inlining and LICM run as tree passes after
/// the streams have settled.
pub fn optimize(func: &mut Function, opts: &OptOptions) -> Result<(), VmError> {
    if opts.base || opts.dce || opts.constprop {
        simplify_tree(func, opts);
        deadcode::compact_pools(func);
    }
    if opts.inline {
        inline::inline_functions(func);
    }
    if opts.licm {
        licm::run(func)?;
    }
    Ok(())
}

fn simplify_tree(func: &mut Function, opts: &OptOptions) {
    for child in &mut func.functions {
        simplify_tree(child, opts);
    }
    let before = func.instructions.len();
    for _ in 0..MAX_PIPELINE_PASSES {
        let mut changed = false;
        if opts.base {
            changed |= deadcode::eliminate_unreachable(func);
            changed |= fold::fold_constants(func);
            changed |= peephole::algebraic_simplify(func);
            changed |= peephole::strength_reduce(func);
            changed |= peephole::peephole(func);
            changed |= thread_jumps(func);
        }
        if opts.constprop {
            changed |= fold::propagate_locals(func);
        }
        if opts.dce {
            changed |= deadcode::eliminate_dead_stores(func);
        }
        remove_nops(func);
        if !changed {
            break;
        }
    }
    if opts.debug && func.instructions.len() != before {
        eprintln!(
            "[DEBUG] optimizer: {} -> {} instructions",
            before,
            func.instructions.len()
        );
    }
}

/// A `goto 1` only skips to the next instruction; passes use it as the
/// in-place no-op.
pub(crate) fn nop() -> Instruction {
    Instruction::new(Op::Goto, Some(1))
}

pub(crate) fn is_nop(inst: &Instruction) -> bool {
    inst.op == Op::Goto && inst.operand == Some(1)
}

/// Branch-target set, for passes that must not rewrite across a target.
/// No-op gotos are skipped: their "target" is plain fall-through.
pub(crate) fn jump_targets(code: &[Instruction]) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for (i, inst) in code.iter().enumerate() {
        if matches!(inst.op, Op::Goto | Op::If) && !is_nop(inst) {
            if let Some(off) = inst.operand {
                let target = i as i64 + off as i64;
                if target >= 0 && target <= code.len() as i64 {
                    targets.insert(target as usize);
                }
            }
        }
    }
    targets
}

/// Rebuild the instruction stream keeping only instructions accepted by
/// `keep`, recomputing every branch offset so target identity is
/// preserved. Branches to a removed instruction land on the next
/// surviving one.
pub(crate) fn rebuild_filtered<F>(func: &mut Function, keep: F) -> bool
where
    F: Fn(usize, &Instruction) -> bool,
{
    let n = func.instructions.len();
    let mut index_map = vec![usize::MAX; n + 1];
    let mut new_code: Vec<Instruction> = Vec::with_capacity(n);
    let mut kept_orig: Vec<usize> = Vec::with_capacity(n);
    for (i, inst) in func.instructions.iter().enumerate() {
        if keep(i, inst) {
            index_map[i] = new_code.len();
            new_code.push(*inst);
            kept_orig.push(i);
        }
    }
    index_map[n] = new_code.len();
    let mut next = new_code.len();
    for i in (0..n).rev() {
        if index_map[i] == usize::MAX {
            index_map[i] = next;
        } else {
            next = index_map[i];
        }
    }
    for (new_i, inst) in new_code.iter_mut().enumerate() {
        if matches!(inst.op, Op::Goto | Op::If) {
            let orig = kept_orig[new_i];
            let off = inst.operand.unwrap_or(1) as i64;
            let target = (orig as i64 + off).clamp(0, n as i64) as usize;
            inst.operand = Some(index_map[target] as i32 - new_i as i32);
        }
    }
    let changed = new_code.len() != n;
    func.instructions = new_code;
    changed
}

pub(crate) fn remove_nops(func: &mut Function) -> bool {
    if !func.instructions.iter().any(is_nop) {
        return false;
    }
    rebuild_filtered(func, |_, inst| !is_nop(inst))
}

/// Jump threading: a branch whose target is an unconditional goto is
/// retargeted to the end of the chain (bounded, in case of cycles).
pub(crate) fn thread_jumps(func: &mut Function) -> bool {
    let code = &mut func.instructions;
    if code.is_empty() {
        return false;
    }
    let snapshot = code.clone();
    let mut changed = false;
    for i in 0..code.len() {
        let inst = code[i];
        if !matches!(inst.op, Op::Goto | Op::If) || is_nop(&inst) {
            continue;
        }
        let Some(off) = inst.operand else { continue };
        let mut target = i as i64 + off as i64;
        let mut depth = 0;
        while depth < 10 {
            if target < 0 || target >= snapshot.len() as i64 {
                break;
            }
            let t = &snapshot[target as usize];
            if t.op == Op::Goto && !is_nop(t) {
                target += t.operand.unwrap_or(0) as i64;
                depth += 1;
            } else {
                break;
            }
        }
        let new_off = (target - i as i64) as i32;
        if depth > 0 && new_off != off && target >= 0 && target <= snapshot.len() as i64 {
            code[i].operand = Some(new_off);
            changed = true;
        }
    }
    changed
}

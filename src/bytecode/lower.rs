// Quill stack->register lowering
// Created by: Haoran Wei
// Changelog:
// 2026-06-26: Symbolic-stack translation to three-address form. Locals
//            own the first N registers; load_local/dup/swap/pop are pure
//            bookkeeping and emit nothing; branches are patched through
//            a pc mapping table after the linear walk.

use crate::backend::vm::error::VmError;
use crate::bytecode::{Function, Op, RegCode, RegInstruction};

struct RegAlloc {
    next: u16,
    max_used: u16,
}

impl RegAlloc {
    fn fresh(&mut self) -> u16 {
        let r = self.next;
        self.next += 1;
        if r > self.max_used {
            self.max_used = r;
        }
        r
    }

    fn ensure(&mut self, idx: u16) {
        if idx > self.max_used {
            self.max_used = idx;
        }
    }
}

fn emit(out: &mut Vec<RegInstruction>, op: Op, dst: u16, src1: u16, src2: u16, imm: i32) {
    out.push(RegInstruction {
        op,
        dst,
        src1,
        src2,
        imm,
    });
}

/// Translate the stack form of `func` into register form. The
/// translation preserves instruction-level semantics: side effects and
/// branch targets map one-to-one onto the emitted stream.
pub fn translate(func: &Function) -> Result<RegCode, VmError> {
    let local_count = func.local_vars.len() as u16;
    let mut alloc = RegAlloc {
        next: local_count,
        max_used: local_count.saturating_sub(1),
    };
    let mut vstack: Vec<u16> = Vec::new();
    let mut pc_to_out = vec![0usize; func.instructions.len() + 1];
    // (emitted index, stack-form target pc)
    let mut fixups: Vec<(usize, usize)> = Vec::new();
    let mut out: Vec<RegInstruction> = Vec::new();

    fn pop(vstack: &mut Vec<u16>) -> Result<u16, VmError> {
        vstack
            .pop()
            .ok_or_else(|| VmError::InsufficientStack("operand stack underflow in lowering".into()))
    }

    for (pc, inst) in func.instructions.iter().enumerate() {
        pc_to_out[pc] = out.len();
        let arg = || -> Result<i32, VmError> {
            inst.operand.ok_or_else(|| {
                VmError::Runtime(format!("{}: missing operand at pc {}", inst.op.mnemonic(), pc))
            })
        };
        match inst.op {
            Op::LoadConst | Op::LoadFunc | Op::LoadGlobal | Op::PushReference => {
                let dst = alloc.fresh();
                emit(&mut out, inst.op, dst, 0, 0, arg()?);
                vstack.push(dst);
            }
            Op::LoadLocal => {
                let reg = arg()? as u16;
                alloc.ensure(reg);
                vstack.push(reg);
            }
            Op::StoreLocal => {
                let val = pop(&mut vstack)?;
                let dst = arg()? as u16;
                alloc.ensure(dst);
                emit(&mut out, Op::StoreLocal, dst, val, 0, 0);
            }
            Op::StoreGlobal => {
                let val = pop(&mut vstack)?;
                emit(&mut out, Op::StoreGlobal, 0, val, 0, arg()?);
            }
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Gt
            | Op::Geq
            | Op::Eq
            | Op::And
            | Op::Or => {
                let right = pop(&mut vstack)?;
                let left = pop(&mut vstack)?;
                let dst = alloc.fresh();
                emit(&mut out, inst.op, dst, left, right, 0);
                vstack.push(dst);
            }
            Op::Neg | Op::Not => {
                let val = pop(&mut vstack)?;
                let dst = alloc.fresh();
                emit(&mut out, inst.op, dst, val, 0, 0);
                vstack.push(dst);
            }
            Op::Goto => {
                let target = pc as i64 + arg()? as i64;
                if target < 0 || target > func.instructions.len() as i64 {
                    return Err(VmError::Runtime(
                        "translate: branch target out of range".into(),
                    ));
                }
                fixups.push((out.len(), target as usize));
                emit(&mut out, Op::Goto, 0, 0, 0, 0);
            }
            Op::If => {
                let cond = pop(&mut vstack)?;
                let target = pc as i64 + arg()? as i64;
                if target < 0 || target > func.instructions.len() as i64 {
                    return Err(VmError::Runtime(
                        "translate: branch target out of range".into(),
                    ));
                }
                fixups.push((out.len(), target as usize));
                emit(&mut out, Op::If, 0, cond, 0, 0);
            }
            Op::Dup => {
                let top = *vstack.last().ok_or_else(|| {
                    VmError::InsufficientStack("operand stack underflow in lowering".into())
                })?;
                vstack.push(top);
            }
            Op::Swap => {
                let a = pop(&mut vstack)?;
                let b = pop(&mut vstack)?;
                vstack.push(a);
                vstack.push(b);
            }
            Op::Pop => {
                pop(&mut vstack)?;
            }
            Op::Call => {
                let count = arg()?.max(0) as usize;
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(pop(&mut vstack)?);
                }
                args.reverse();
                let callee = pop(&mut vstack)?;
                let arg_start = alloc.fresh();
                if count > 0 {
                    alloc.ensure(arg_start + count as u16 - 1);
                    for (i, &src) in args.iter().enumerate() {
                        emit(&mut out, Op::StoreLocal, arg_start + i as u16, src, 0, 0);
                    }
                }
                let dst = alloc.fresh();
                emit(&mut out, Op::Call, dst, callee, arg_start, count as i32);
                vstack.push(dst);
            }
            Op::AllocClosure => {
                let count = arg()?.max(0) as usize;
                let mut refs = Vec::with_capacity(count);
                for _ in 0..count {
                    refs.push(pop(&mut vstack)?);
                }
                refs.reverse();
                let func_reg = pop(&mut vstack)?;
                let base = alloc.fresh();
                if count > 0 {
                    alloc.ensure(base + count as u16 - 1);
                    for (i, &src) in refs.iter().enumerate() {
                        emit(&mut out, Op::StoreLocal, base + i as u16, src, 0, 0);
                    }
                }
                let dst = alloc.fresh();
                emit(&mut out, Op::AllocClosure, dst, base, func_reg, count as i32);
                vstack.push(dst);
            }
            Op::Return => {
                let ret = pop(&mut vstack)?;
                emit(&mut out, Op::Return, 0, ret, 0, 0);
            }
            Op::AllocRecord => {
                let dst = alloc.fresh();
                emit(&mut out, Op::AllocRecord, dst, 0, 0, 0);
                vstack.push(dst);
            }
            Op::FieldLoad => {
                let rec = pop(&mut vstack)?;
                let dst = alloc.fresh();
                emit(&mut out, Op::FieldLoad, dst, rec, 0, arg()?);
                vstack.push(dst);
            }
            Op::FieldStore => {
                let val = pop(&mut vstack)?;
                let rec = pop(&mut vstack)?;
                emit(&mut out, Op::FieldStore, 0, val, rec, arg()?);
            }
            Op::IndexLoad => {
                let idx = pop(&mut vstack)?;
                let rec = pop(&mut vstack)?;
                let dst = alloc.fresh();
                emit(&mut out, Op::IndexLoad, dst, rec, idx, 0);
                vstack.push(dst);
            }
            Op::IndexStore => {
                let val = pop(&mut vstack)?;
                let idx = pop(&mut vstack)?;
                let rec = pop(&mut vstack)?;
                emit(&mut out, Op::IndexStore, rec, val, idx, 0);
            }
            Op::LoadReference => {
                let r = pop(&mut vstack)?;
                let dst = alloc.fresh();
                emit(&mut out, Op::LoadReference, dst, r, 0, 0);
                vstack.push(dst);
            }
            Op::StoreReference => {
                let val = pop(&mut vstack)?;
                let r = pop(&mut vstack)?;
                emit(&mut out, Op::StoreReference, 0, val, r, 0);
            }
        }
    }
    pc_to_out[func.instructions.len()] = out.len();

    for (out_idx, target_pc) in fixups {
        let rel = pc_to_out[target_pc] as i64 - out_idx as i64;
        out[out_idx].imm = rel as i32;
    }

    Ok(RegCode {
        register_count: alloc.max_used as usize + 1,
        code: out,
    })
}

#[cfg(test)]
mod tests {
    use super::translate;
    use crate::bytecode::{Constant, Function, Instruction, Op};

    fn func(instrs: Vec<(Op, Option<i32>)>, constants: Vec<Constant>, locals: usize) -> Function {
        Function {
            constants,
            local_vars: (0..locals).map(|i| format!("l{}", i)).collect(),
            instructions: instrs
                .into_iter()
                .map(|(op, operand)| Instruction::new(op, operand))
                .collect(),
            ..Function::default()
        }
    }

    #[test]
    fn locals_keep_their_registers() {
        let f = func(
            vec![
                (Op::LoadLocal, Some(0)),
                (Op::LoadConst, Some(0)),
                (Op::Add, None),
                (Op::StoreLocal, Some(0)),
                (Op::LoadLocal, Some(0)),
                (Op::Return, None),
            ],
            vec![Constant::Int(1)],
            1,
        );
        let code = translate(&f).unwrap();
        // load_local and the final return emit no move of their own
        assert_eq!(code.code.len(), 4);
        assert_eq!(code.code[2].op, Op::StoreLocal);
        assert_eq!(code.code[2].dst, 0);
        assert_eq!(code.code[3].op, Op::Return);
        assert_eq!(code.code[3].src1, 0);
    }

    #[test]
    fn branch_offsets_are_remapped() {
        // while-style loop: 0: load_local 0 / 1: not-a-real-cond if +2
        // fall through to goto back
        let f = func(
            vec![
                (Op::LoadLocal, Some(0)),
                (Op::If, Some(3)),
                (Op::Goto, Some(-2)),
                (Op::LoadConst, Some(0)),
                (Op::Return, None),
            ],
            vec![Constant::Int(0)],
            1,
        );
        let code = translate(&f).unwrap();
        // emitted: if, goto, load_const, return
        assert_eq!(code.code.len(), 4);
        let if_inst = code.code[0];
        assert_eq!(if_inst.op, Op::If);
        assert_eq!(if_inst.imm, 3); // to the return
        let goto_inst = code.code[1];
        assert_eq!(goto_inst.op, Op::Goto);
        assert_eq!(goto_inst.imm, -1); // back to the if
    }
}

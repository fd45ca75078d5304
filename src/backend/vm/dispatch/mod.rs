// Quill instruction dispatch
// Created by: Anqi Shen
// Changelog:
// 2026-06-25: Register-form decode loop: one match over the opcode enum
//            per instruction so the compiler emits a jump table; the pc
//            lives in the frame and every arm advances it itself.
// 2026-07-01: Kept the operand-stack interpreter next to the register
//            one; both share the arithmetic/access/call helpers so the
//            two forms cannot drift apart semantically.

mod access;
mod arith;
mod funcs;

use crate::backend::vm::error::VmError;
use crate::backend::vm::value::{HeaderPtr, Value};
use crate::backend::vm::{LogLevel, VirtualMachine};
use crate::bytecode::{Function, Op, RegCode};

impl VirtualMachine {
    #[inline]
    pub(crate) fn reg(&self, idx: u16) -> Value {
        self.frames.last().expect("active frame").regs[idx as usize]
    }

    #[inline]
    pub(crate) fn set_reg(&mut self, idx: u16, v: Value) {
        self.frames.last_mut().expect("active frame").regs[idx as usize] = v;
    }

    #[inline]
    fn advance(&mut self) {
        self.frames.last_mut().expect("active frame").pc += 1;
    }

    fn jump_rel(&mut self, offset: i32, limit: usize) -> Result<(), VmError> {
        let frame = self.frames.last_mut().expect("active frame");
        let target = frame.pc as i64 + offset as i64;
        if target < 0 || target > limit as i64 {
            return Err(VmError::Runtime(format!(
                "branch target {} out of range",
                target
            )));
        }
        frame.pc = target as usize;
        Ok(())
    }

    fn spop(&mut self) -> Result<Value, VmError> {
        self.frames
            .last_mut()
            .expect("active frame")
            .stack
            .pop()
            .ok_or_else(|| VmError::InsufficientStack("Cannot pop from empty stack".to_string()))
    }

    fn spush(&mut self, v: Value) {
        self.frames.last_mut().expect("active frame").stack.push(v);
    }

    /// Store into a local/register slot; ref-local slots also write the
    /// registered Reference cell through the write barrier.
    pub(crate) fn store_local_slot(&mut self, idx: usize, v: Value) -> Result<(), VmError> {
        let frame = self.frames.last().expect("active frame");
        if idx >= frame.regs.len() {
            return Err(VmError::Runtime(format!(
                "local slot {} out of range",
                idx
            )));
        }
        let cell = frame.ref_slots.get(&idx).copied();
        if let Some(cell) = cell {
            unsafe {
                (*cell).data.cell = v;
            }
            self.heap.write_barrier(cell as HeaderPtr, v);
        }
        self.frames.last_mut().expect("active frame").regs[idx as usize] = v;
        Ok(())
    }

    /// Execute the lowered register form of `func` in the current frame.
    pub(crate) fn exec_reg(&mut self, func: &Function, code: &RegCode) -> Result<Value, VmError> {
        let insts = &code.code;
        loop {
            let pc = self.frames.last().expect("active frame").pc;
            if pc >= insts.len() {
                return Err(VmError::Runtime(
                    "Function must end with a return statement".to_string(),
                ));
            }
            let inst = insts[pc];
            if self.log_level == LogLevel::Trace {
                eprintln!(
                    "[TRACE] pc {:04} | {:<16} dst={} src1={} src2={} imm={}",
                    pc,
                    inst.op.mnemonic(),
                    inst.dst,
                    inst.src1,
                    inst.src2,
                    inst.imm
                );
            }
            match inst.op {
                Op::LoadConst => {
                    let v = self.constant_value(func, inst.imm)?;
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
                Op::LoadFunc => {
                    let child = func
                        .functions
                        .get(usize::try_from(inst.imm).unwrap_or(usize::MAX))
                        .ok_or_else(|| {
                            VmError::Runtime(format!("function index {} out of range", inst.imm))
                        })?;
                    self.set_reg(inst.dst, Value::Function(child as *const Function));
                    self.advance();
                }
                // register move; also the self-move LICM leaves behind
                Op::LoadLocal | Op::Dup => {
                    let v = self.reg(inst.src1);
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
                Op::StoreLocal => {
                    let v = self.reg(inst.src1);
                    self.store_local_slot(inst.dst as usize, v)?;
                    self.advance();
                }
                Op::LoadGlobal => {
                    let v = self.load_global(func, inst.imm)?;
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
                Op::StoreGlobal => {
                    let v = self.reg(inst.src1);
                    self.store_global(func, inst.imm, v)?;
                    self.advance();
                }
                Op::PushReference => {
                    let cell = self.resolve_reference(func, inst.imm)?;
                    self.set_reg(inst.dst, Value::Reference(cell));
                    self.advance();
                }
                Op::LoadReference => {
                    let cell = self.reg(inst.src1).as_reference()?;
                    let v = unsafe { (*cell).data.cell };
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
                Op::StoreReference => {
                    let v = self.reg(inst.src1);
                    let cell = self.reg(inst.src2).as_reference()?;
                    unsafe {
                        (*cell).data.cell = v;
                    }
                    self.heap.write_barrier(cell as HeaderPtr, v);
                    self.advance();
                }
                Op::AllocRecord => {
                    let v = self.alloc_record_value()?;
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
                Op::FieldLoad => {
                    let rec = self.reg(inst.src1);
                    let v = self.field_load(func, rec, inst.imm)?;
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
                Op::FieldStore => {
                    let v = self.reg(inst.src1);
                    let rec = self.reg(inst.src2);
                    self.field_store(func, rec, inst.imm, v)?;
                    self.advance();
                }
                Op::IndexLoad => {
                    let rec = self.reg(inst.src1);
                    let idx = self.reg(inst.src2);
                    let v = self.index_load(rec, idx)?;
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
                Op::IndexStore => {
                    let rec = self.reg(inst.dst);
                    let v = self.reg(inst.src1);
                    let idx = self.reg(inst.src2);
                    self.index_store(rec, idx, v)?;
                    self.advance();
                }
                Op::AllocClosure => {
                    let count = inst.imm.max(0) as usize;
                    let mut refs = Vec::with_capacity(count);
                    for i in 0..count {
                        refs.push(self.reg(inst.src1 + i as u16).as_reference()?);
                    }
                    let target = match self.reg(inst.src2) {
                        Value::Function(p) => p,
                        _ => return Err(VmError::IllegalCast("Expected function".to_string())),
                    };
                    let closure = self.alloc_closure_value(target, refs)?;
                    self.set_reg(inst.dst, closure);
                    self.advance();
                }
                Op::Call => {
                    let count = inst.imm.max(0) as usize;
                    let callee = self.reg(inst.src1);
                    let mut args = Vec::with_capacity(count);
                    for i in 0..count {
                        args.push(self.reg(inst.src2 + i as u16));
                    }
                    self.advance();
                    let result = self.call_value(callee, args)?;
                    self.set_reg(inst.dst, result);
                }
                Op::Return => {
                    return Ok(self.reg(inst.src1));
                }
                Op::Goto => {
                    self.jump_rel(inst.imm, insts.len())?;
                }
                Op::If => {
                    let cond = self.reg(inst.src1).as_bool()?;
                    if cond {
                        self.jump_rel(inst.imm, insts.len())?;
                    } else {
                        self.advance();
                    }
                }
                Op::Swap => {
                    let frame = self.frames.last_mut().expect("active frame");
                    frame.regs.swap(inst.dst as usize, inst.src1 as usize);
                    self.advance();
                }
                Op::Pop => {
                    self.set_reg(inst.dst, Value::None);
                    self.advance();
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Gt | Op::Geq | Op::Eq | Op::And
                | Op::Or => {
                    let left = self.reg(inst.src1);
                    let right = self.reg(inst.src2);
                    let v = self.binary_op(inst.op, left, right)?;
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
                Op::Neg | Op::Not => {
                    let operand = self.reg(inst.src1);
                    let v = self.unary_op(inst.op, operand)?;
                    self.set_reg(inst.dst, v);
                    self.advance();
                }
            }
        }
    }

    /// Execute the stack form of `func` in the current frame. Used for
    /// differential testing against the register form.
    pub(crate) fn exec_stack(&mut self, func: &Function) -> Result<Value, VmError> {
        let insts = &func.instructions;
        loop {
            let pc = self.frames.last().expect("active frame").pc;
            if pc >= insts.len() {
                return Err(VmError::Runtime(
                    "Function must end with a return statement".to_string(),
                ));
            }
            let inst = insts[pc];
            let operand = |what: &str| -> Result<i32, VmError> {
                inst.operand
                    .ok_or_else(|| VmError::Runtime(format!("{}: missing operand", what)))
            };
            match inst.op {
                Op::LoadConst => {
                    let v = self.constant_value(func, operand("load_const")?)?;
                    self.spush(v);
                    self.advance();
                }
                Op::LoadFunc => {
                    let idx = operand("load_func")?;
                    let child = func
                        .functions
                        .get(usize::try_from(idx).unwrap_or(usize::MAX))
                        .ok_or_else(|| {
                            VmError::Runtime(format!("function index {} out of range", idx))
                        })?;
                    self.spush(Value::Function(child as *const Function));
                    self.advance();
                }
                Op::LoadLocal => {
                    let idx = operand("load_local")? as usize;
                    let frame = self.frames.last().expect("active frame");
                    let v = *frame.regs.get(idx).ok_or_else(|| {
                        VmError::Runtime(format!("local index {} out of range", idx))
                    })?;
                    self.spush(v);
                    self.advance();
                }
                Op::StoreLocal => {
                    let idx = operand("store_local")? as usize;
                    let v = self.spop()?;
                    self.store_local_slot(idx, v)?;
                    self.advance();
                }
                Op::LoadGlobal => {
                    let v = self.load_global(func, operand("load_global")?)?;
                    self.spush(v);
                    self.advance();
                }
                Op::StoreGlobal => {
                    let idx = operand("store_global")?;
                    let v = self.spop()?;
                    self.store_global(func, idx, v)?;
                    self.advance();
                }
                Op::PushReference => {
                    let cell = self.resolve_reference(func, operand("push_reference")?)?;
                    self.spush(Value::Reference(cell));
                    self.advance();
                }
                Op::LoadReference => {
                    let cell = self.spop()?.as_reference()?;
                    let v = unsafe { (*cell).data.cell };
                    self.spush(v);
                    self.advance();
                }
                Op::StoreReference => {
                    let v = self.spop()?;
                    let cell = self.spop()?.as_reference()?;
                    unsafe {
                        (*cell).data.cell = v;
                    }
                    self.heap.write_barrier(cell as HeaderPtr, v);
                    self.advance();
                }
                Op::AllocRecord => {
                    let v = self.alloc_record_value()?;
                    self.spush(v);
                    self.advance();
                }
                Op::FieldLoad => {
                    let rec = self.spop()?;
                    let v = self.field_load(func, rec, operand("field_load")?)?;
                    self.spush(v);
                    self.advance();
                }
                Op::FieldStore => {
                    let v = self.spop()?;
                    let rec = self.spop()?;
                    self.field_store(func, rec, operand("field_store")?, v)?;
                    self.advance();
                }
                Op::IndexLoad => {
                    let idx = self.spop()?;
                    let rec = self.spop()?;
                    let v = self.index_load(rec, idx)?;
                    self.spush(v);
                    self.advance();
                }
                Op::IndexStore => {
                    let v = self.spop()?;
                    let idx = self.spop()?;
                    let rec = self.spop()?;
                    self.index_store(rec, idx, v)?;
                    self.advance();
                }
                Op::AllocClosure => {
                    // Peek instead of pop so the cells stay rooted on the
                    // operand stack while the closure allocation may GC.
                    let count = operand("alloc_closure")?.max(0) as usize;
                    let frame = self.frames.last().expect("active frame");
                    let depth = frame.stack.len();
                    if depth < count + 1 {
                        return Err(VmError::InsufficientStack(
                            "Cannot pop from empty stack".to_string(),
                        ));
                    }
                    let mut refs = Vec::with_capacity(count);
                    for i in 0..count {
                        refs.push(frame.stack[depth - count + i].as_reference()?);
                    }
                    let target = match frame.stack[depth - count - 1] {
                        Value::Function(p) => p,
                        _ => return Err(VmError::IllegalCast("Expected function".to_string())),
                    };
                    let closure = self.alloc_closure_value(target, refs)?;
                    let frame = self.frames.last_mut().expect("active frame");
                    frame.stack.truncate(depth - count - 1);
                    frame.stack.push(closure);
                    self.advance();
                }
                Op::Call => {
                    let count = operand("call")?.max(0) as usize;
                    let frame = self.frames.last().expect("active frame");
                    let depth = frame.stack.len();
                    if depth < count + 1 {
                        return Err(VmError::InsufficientStack(
                            "Cannot pop from empty stack".to_string(),
                        ));
                    }
                    let callee = frame.stack[depth - count - 1];
                    let args: Vec<Value> = frame.stack[depth - count..].to_vec();
                    self.frames
                        .last_mut()
                        .expect("active frame")
                        .stack
                        .truncate(depth - count - 1);
                    self.advance();
                    let result = self.call_value(callee, args)?;
                    self.spush(result);
                }
                Op::Return => {
                    return self.spop();
                }
                Op::Goto => {
                    self.jump_rel(operand("goto")?, insts.len())?;
                }
                Op::If => {
                    let cond = self.spop()?.as_bool()?;
                    if cond {
                        self.jump_rel(operand("if")?, insts.len())?;
                    } else {
                        self.advance();
                    }
                }
                Op::Dup => {
                    let v = self.spop()?;
                    self.spush(v);
                    self.spush(v);
                    self.advance();
                }
                Op::Swap => {
                    let a = self.spop()?;
                    let b = self.spop()?;
                    self.spush(a);
                    self.spush(b);
                    self.advance();
                }
                Op::Pop => {
                    self.spop()?;
                    self.advance();
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Gt | Op::Geq | Op::Eq | Op::And
                | Op::Or => {
                    let right = self.spop()?;
                    let left = self.spop()?;
                    let v = self.binary_op(inst.op, left, right)?;
                    self.spush(v);
                    self.advance();
                }
                Op::Neg | Op::Not => {
                    let v = self.spop()?;
                    let r = self.unary_op(inst.op, v)?;
                    self.spush(r);
                    self.advance();
                }
            }
        }
    }
}

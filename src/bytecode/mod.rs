// Quill bytecode IR
// Created by: Anqi Shen
// Changelog:
// 2026-06-18: Defined the Function object (constant pool, name pool, locals,
//            ref-locals, free vars, nested children, stack-form instruction
//            stream) together with the stack opcode set and its immediates.
// 2026-06-24: Added the three-address register form produced lazily by the
//            lowering pass, plus pool-index validation at the host boundary.

pub mod compile;
pub mod lower;
pub mod opt;
pub mod text;

use crate::backend::vm::error::VmError;
use std::cell::OnceCell;

/// 常量池条目 (constant pool entry)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i32),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    LoadConst,
    LoadFunc,
    LoadLocal,
    StoreLocal,
    LoadGlobal,
    StoreGlobal,
    PushReference,
    LoadReference,
    StoreReference,
    AllocRecord,
    FieldLoad,
    FieldStore,
    IndexLoad,
    IndexStore,
    AllocClosure,
    Call,
    Return,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Gt,
    Geq,
    Eq,
    And,
    Or,
    Not,
    Goto,
    If,
    Dup,
    Swap,
    Pop,
}

impl Op {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::LoadConst => "load_const",
            Op::LoadFunc => "load_func",
            Op::LoadLocal => "load_local",
            Op::StoreLocal => "store_local",
            Op::LoadGlobal => "load_global",
            Op::StoreGlobal => "store_global",
            Op::PushReference => "push_reference",
            Op::LoadReference => "load_reference",
            Op::StoreReference => "store_reference",
            Op::AllocRecord => "alloc_record",
            Op::FieldLoad => "field_load",
            Op::FieldStore => "field_store",
            Op::IndexLoad => "index_load",
            Op::IndexStore => "index_store",
            Op::AllocClosure => "alloc_closure",
            Op::Call => "call",
            Op::Return => "return",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Neg => "neg",
            Op::Gt => "gt",
            Op::Geq => "geq",
            Op::Eq => "eq",
            Op::And => "and",
            Op::Or => "or",
            Op::Not => "not",
            Op::Goto => "goto",
            Op::If => "if",
            Op::Dup => "dup",
            Op::Swap => "swap",
            Op::Pop => "pop",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Op> {
        Some(match name {
            "load_const" => Op::LoadConst,
            "load_func" => Op::LoadFunc,
            "load_local" => Op::LoadLocal,
            "store_local" => Op::StoreLocal,
            "load_global" => Op::LoadGlobal,
            "store_global" => Op::StoreGlobal,
            "push_reference" => Op::PushReference,
            "load_reference" => Op::LoadReference,
            "store_reference" => Op::StoreReference,
            "alloc_record" => Op::AllocRecord,
            "field_load" => Op::FieldLoad,
            "field_store" => Op::FieldStore,
            "index_load" => Op::IndexLoad,
            "index_store" => Op::IndexStore,
            "alloc_closure" => Op::AllocClosure,
            "call" => Op::Call,
            "return" => Op::Return,
            "add" => Op::Add,
            "sub" => Op::Sub,
            "mul" => Op::Mul,
            "div" => Op::Div,
            "neg" => Op::Neg,
            "gt" => Op::Gt,
            "geq" => Op::Geq,
            "eq" => Op::Eq,
            "and" => Op::And,
            "or" => Op::Or,
            "not" => Op::Not,
            "goto" => Op::Goto,
            "if" => Op::If,
            "dup" => Op::Dup,
            "swap" => Op::Swap,
            "pop" => Op::Pop,
            _ => return None,
        })
    }

    /// Whether the operation carries an integer immediate in the stack form.
    pub fn has_operand(self) -> bool {
        matches!(
            self,
            Op::LoadConst
                | Op::LoadFunc
                | Op::LoadLocal
                | Op::StoreLocal
                | Op::LoadGlobal
                | Op::StoreGlobal
                | Op::PushReference
                | Op::FieldLoad
                | Op::FieldStore
                | Op::AllocClosure
                | Op::Call
                | Op::Goto
                | Op::If
        )
    }
}

/// Stack-form instruction: operation plus optional integer immediate.
/// Branch immediates are relative to the instruction itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub operand: Option<i32>,
}

impl Instruction {
    pub fn new(op: Op, operand: Option<i32>) -> Self {
        Instruction { op, operand }
    }
}

/// Register-form (three-address) instruction.
/// `dst`/`src1`/`src2` index into the frame's register slots; `imm`
/// carries pool indices, argument counts and relative branch offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegInstruction {
    pub op: Op,
    pub dst: u16,
    pub src1: u16,
    pub src2: u16,
    pub imm: i32,
}

/// Lowered body of a function, produced on first execution (or by LICM).
#[derive(Debug, Clone)]
pub struct RegCode {
    pub code: Vec<RegInstruction>,
    pub register_count: usize,
}

/// Bytecode function object. The tree (a function plus its nested
/// children) is owned by the host that constructed it; the VM only
/// borrows it for the duration of a run.
#[derive(Debug, Default)]
pub struct Function {
    pub functions: Vec<Function>,
    pub constants: Vec<Constant>,
    pub parameter_count: usize,
    pub local_vars: Vec<String>,
    pub local_ref_vars: Vec<String>,
    pub free_vars: Vec<String>,
    pub names: Vec<String>,
    pub instructions: Vec<Instruction>,
    /// Lazily produced register form; set at most once.
    pub reg_code: OnceCell<RegCode>,
}

impl Function {
    /// Validate every pool and slot index in the instruction stream, then
    /// recurse into nested functions. Run at the host boundary before the
    /// tree is handed to the engine.
    pub fn validate(&self) -> Result<(), VmError> {
        for (pc, inst) in self.instructions.iter().enumerate() {
            let arg = inst.operand;
            let check = |limit: usize, what: &str| -> Result<(), VmError> {
                let idx = arg.ok_or_else(|| {
                    VmError::Runtime(format!("{}: missing operand at pc {}", what, pc))
                })?;
                if idx < 0 || idx as usize >= limit {
                    return Err(VmError::Runtime(format!(
                        "{}: index {} out of range at pc {}",
                        what, idx, pc
                    )));
                }
                Ok(())
            };
            match inst.op {
                Op::LoadConst => check(self.constants.len(), "load_const")?,
                Op::LoadFunc => check(self.functions.len(), "load_func")?,
                Op::LoadLocal => check(self.local_vars.len(), "load_local")?,
                Op::StoreLocal => check(self.local_vars.len(), "store_local")?,
                Op::LoadGlobal => check(self.names.len(), "load_global")?,
                Op::StoreGlobal => check(self.names.len(), "store_global")?,
                Op::FieldLoad => check(self.names.len(), "field_load")?,
                Op::FieldStore => check(self.names.len(), "field_store")?,
                Op::PushReference => check(
                    self.local_ref_vars.len() + self.free_vars.len(),
                    "push_reference",
                )?,
                Op::Goto | Op::If => {
                    let off = arg.ok_or_else(|| {
                        VmError::Runtime(format!("branch without target at pc {}", pc))
                    })?;
                    let target = pc as i64 + off as i64;
                    if target < 0 || target > self.instructions.len() as i64 {
                        return Err(VmError::Runtime(format!(
                            "branch target {} out of range at pc {}",
                            target, pc
                        )));
                    }
                }
                Op::AllocClosure | Op::Call => {
                    let n = arg.ok_or_else(|| {
                        VmError::Runtime(format!("{}: missing count at pc {}", inst.op.mnemonic(), pc))
                    })?;
                    if n < 0 {
                        return Err(VmError::Runtime(format!(
                            "{}: negative count at pc {}",
                            inst.op.mnemonic(),
                            pc
                        )));
                    }
                }
                _ => {}
            }
        }
        if self.parameter_count > self.local_vars.len() {
            return Err(VmError::Runtime(
                "parameter count exceeds local variable count".into(),
            ));
        }
        for child in &self.functions {
            child.validate()?;
        }
        Ok(())
    }

    /// Intern a constant, reusing an existing pool slot if present.
    pub fn add_constant(&mut self, c: Constant) -> i32 {
        if let Some(idx) = self.constants.iter().position(|e| *e == c) {
            return idx as i32;
        }
        self.constants.push(c);
        (self.constants.len() - 1) as i32
    }
}

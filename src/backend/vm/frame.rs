use crate::backend::vm::value::{GcObject, Reference, Value};
use crate::bytecode::Function;
use rustc_hash::FxHashMap;

/// Per-call activation record. `regs` holds the register slots (or the
/// locals, when the stack form is executing); `stack` is the operand
/// stack and stays empty under the register form. Frames contribute
/// their slots, operand stack and reference cells to the GC root set
/// while live.
pub struct Frame {
    pub func: *const Function,
    /// Closure environment; empty for bare functions.
    pub free_refs: Vec<*mut GcObject<Reference>>,
    pub regs: Vec<Value>,
    pub stack: Vec<Value>,
    pub pc: usize,
    /// Reference cells of this frame, in `local_ref_vars` order.
    pub ref_cells: Vec<*mut GcObject<Reference>>,
    /// local slot index -> cell, for write-through on stores.
    pub ref_slots: FxHashMap<usize, *mut GcObject<Reference>>,
}

impl Frame {
    pub fn new(
        func: *const Function,
        slot_count: usize,
        free_refs: Vec<*mut GcObject<Reference>>,
    ) -> Self {
        Frame {
            func,
            free_refs,
            regs: vec![Value::None; slot_count],
            stack: Vec::new(),
            pc: 0,
            ref_cells: Vec::new(),
            ref_slots: FxHashMap::default(),
        }
    }
}

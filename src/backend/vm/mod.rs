// Quill virtual machine
// Created by: Anqi Shen
// Changelog:
// 2026-06-22: VirtualMachine with owned frame stack, globals table and
//            GC heap; frames are rooted through the VM so a collection
//            can run at any allocation site.
// 2026-06-30: Lazy stack->register lowering on first execution of each
//            function; the stack interpreter stays available behind
//            stack_mode for differential testing.
// 2026-07-08: Adaptive GC trigger: threshold starts at max(1MiB, max/4),
//            minor collection first, full collection when the minor pass
//            does not get back under the threshold, then regrow to
//            2x live bounded by the configured maximum.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod heap;
pub mod native;
pub mod value;

use crate::backend::vm::error::VmError;
use crate::backend::vm::frame::Frame;
use crate::backend::vm::heap::Heap;
use crate::backend::vm::value::{GcObject, Reference, Value};
use crate::bytecode::{lower, Constant, Function, RegCode};
use clap::ValueEnum;
use rustc_hash::FxHashMap;
use std::io::Write;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Release, // 仅输出程序结果
    Debug,   // GC 与优化器的摘要信息
    Trace,   // 指令级追踪
}

const MAX_CALL_STACK: usize = 1000;
const MIN_GC_THRESHOLD: usize = 1024 * 1024; // 1 MiB

pub struct VirtualMachine {
    pub heap: Heap,
    pub globals: FxHashMap<String, Value>,
    pub frames: Vec<Frame>,
    /// Interned heap strings for string constants; part of the root set
    /// so constant loads keep their canonical object alive.
    const_strings: FxHashMap<String, Value>,
    /// Sentinel children of the top-level function that execute host
    /// code instead of bytecode.
    native_ids: FxHashMap<*const Function, usize>,
    max_heap_bytes: usize,
    gc_threshold: usize,
    pub gc_count: usize,
    /// Run the stack form instead of the lowered register form.
    pub stack_mode: bool,
    pub log_level: LogLevel,
    pub output: Box<dyn Write>,
}

impl VirtualMachine {
    pub fn new(max_mem_mb: usize) -> Self {
        let max_heap_bytes = max_mem_mb * 1024 * 1024;
        VirtualMachine {
            heap: Heap::new(),
            globals: FxHashMap::default(),
            frames: Vec::new(),
            const_strings: FxHashMap::default(),
            native_ids: FxHashMap::default(),
            max_heap_bytes,
            gc_threshold: std::cmp::max(MIN_GC_THRESHOLD, max_heap_bytes / 4),
            gc_count: 0,
            stack_mode: false,
            log_level: LogLevel::Release,
            output: Box::new(std::io::stdout()),
        }
    }

    pub fn with_output(max_mem_mb: usize, output: Box<dyn Write>) -> Self {
        let mut vm = VirtualMachine::new(max_mem_mb);
        vm.output = output;
        vm
    }

    /// Run a program. The first three children of the top-level function
    /// are the builtin sentinels (print, input, intcast); their names are
    /// bound as globals by the compiled prologue.
    pub fn run(&mut self, main_func: &Function) -> Result<Value, VmError> {
        if main_func.functions.len() >= 3 {
            for (id, child) in main_func.functions.iter().take(3).enumerate() {
                self.native_ids.insert(child as *const Function, id);
            }
        }
        self.execute_function(main_func, Vec::new(), Vec::new())
    }

    pub fn execute_function(
        &mut self,
        func: &Function,
        args: Vec<Value>,
        free_refs: Vec<*mut GcObject<Reference>>,
    ) -> Result<Value, VmError> {
        if let Some(&id) = self.native_ids.get(&(func as *const Function)) {
            return self.call_native(id, &args);
        }
        if args.len() != func.parameter_count {
            return Err(VmError::Runtime(format!(
                "Argument count mismatch: expected {}, got {}",
                func.parameter_count,
                args.len()
            )));
        }
        if self.frames.len() >= MAX_CALL_STACK {
            return Err(VmError::Runtime(
                "call stack depth limit exceeded".to_string(),
            ));
        }

        if func.instructions.is_empty() {
            if self.frames.is_empty() {
                return Ok(Value::None);
            }
            return Err(VmError::Runtime(
                "Function must end with a return statement".to_string(),
            ));
        }

        if self.stack_mode {
            let slot_count = func.local_vars.len();
            let mut frame = Frame::new(func, slot_count, free_refs);
            for (i, arg) in args.into_iter().enumerate() {
                frame.regs[i] = arg;
            }
            self.frames.push(frame);
            let result = self
                .init_ref_cells(func)
                .and_then(|_| self.exec_stack(func));
            self.frames.pop();
            return result;
        }

        let code = self.lowered(func)?;
        let mut frame = Frame::new(func, code.register_count, free_refs);
        for (i, arg) in args.into_iter().enumerate() {
            frame.regs[i] = arg;
        }
        self.frames.push(frame);
        let result = self
            .init_ref_cells(func)
            .and_then(|_| self.exec_reg(func, code));
        self.frames.pop();
        result
    }

    /// Register form of a function, translating on first execution.
    fn lowered<'f>(&mut self, func: &'f Function) -> Result<&'f RegCode, VmError> {
        if func.reg_code.get().is_none() {
            let code = lower::translate(func)?;
            if self.log_level == LogLevel::Trace {
                eprintln!(
                    "[DEBUG] lowered function: {} stack instructions -> {} register instructions ({} registers)",
                    func.instructions.len(),
                    code.code.len(),
                    code.register_count
                );
            }
            let _ = func.reg_code.set(code);
        }
        Ok(func.reg_code.get().expect("register code just installed"))
    }

    /// Allocate one Reference cell per ref-local, seeded from the
    /// current slot value, and register it in the frame.
    fn init_ref_cells(&mut self, func: &Function) -> Result<(), VmError> {
        for name in &func.local_ref_vars {
            let idx = func
                .local_vars
                .iter()
                .position(|v| v == name)
                .ok_or_else(|| {
                    VmError::Runtime(format!("ref-local '{}' is not a local variable", name))
                })?;
            let init = self.frames.last().expect("frame just pushed").regs[idx];
            let cell = self.alloc_reference(init)?;
            let frame = self.frames.last_mut().expect("frame just pushed");
            frame.ref_cells.push(cell);
            frame.ref_slots.insert(idx, cell);
        }
        Ok(())
    }

    pub(crate) fn constant_value(&mut self, func: &Function, idx: i32) -> Result<Value, VmError> {
        let c = func
            .constants
            .get(usize::try_from(idx).unwrap_or(usize::MAX))
            .ok_or_else(|| VmError::Runtime(format!("constant index {} out of range", idx)))?;
        Ok(match c {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Str(s) => {
                if let Some(&v) = self.const_strings.get(s) {
                    v
                } else {
                    let v = self.alloc_string_value(s.clone())?;
                    self.const_strings.insert(s.clone(), v);
                    v
                }
            }
        })
    }

    // ---- allocation wrappers: GC may run at any of these sites ----

    pub fn alloc_string_value(&mut self, s: String) -> Result<Value, VmError> {
        let hint = std::mem::size_of::<GcObject<String>>() + s.capacity();
        self.maybe_gc(hint)?;
        Ok(Value::Str(self.heap.alloc_string(s)))
    }

    pub fn alloc_record_value(&mut self) -> Result<Value, VmError> {
        self.maybe_gc(std::mem::size_of::<GcObject<value::Record>>())?;
        Ok(Value::Record(self.heap.alloc_record()))
    }

    pub fn alloc_reference(&mut self, init: Value) -> Result<*mut GcObject<Reference>, VmError> {
        self.maybe_gc(std::mem::size_of::<GcObject<Reference>>())?;
        Ok(self.heap.alloc_reference(init))
    }

    pub fn alloc_closure_value(
        &mut self,
        function: *const Function,
        free_refs: Vec<*mut GcObject<Reference>>,
    ) -> Result<Value, VmError> {
        self.maybe_gc(std::mem::size_of::<GcObject<value::Closure>>())?;
        let closure = self.heap.alloc_closure(function, free_refs);
        // barrier on each captured cell now owned by the closure
        let refs = unsafe { (*closure).data.free_refs.clone() };
        for r in refs {
            self.heap
                .write_barrier(closure as value::HeaderPtr, Value::Reference(r));
        }
        Ok(Value::Closure(closure))
    }

    /// Collection trigger. When the projected size crosses the current
    /// threshold, run a minor GC; escalate to a full GC if that was not
    /// enough; regrow the threshold to twice the live estimate bounded
    /// by the configured maximum. Failing to get back under the maximum
    /// is an out-of-memory error.
    fn maybe_gc(&mut self, incoming: usize) -> Result<(), VmError> {
        let projected = self.heap.allocated_bytes + incoming;
        let over_threshold = projected >= self.gc_threshold && self.gc_threshold <= self.max_heap_bytes;
        let over_limit = projected > self.max_heap_bytes;
        if over_threshold || over_limit {
            let roots = self.collect_roots();
            let minor = self.heap.minor_gc(&roots);
            self.gc_count += 1;
            let mut full = None;
            if self.heap.allocated_bytes + incoming >= self.gc_threshold {
                full = Some(self.heap.full_gc(&roots));
                self.gc_count += 1;
            }
            self.gc_threshold = (self.heap.allocated_bytes.saturating_mul(2))
                .clamp(MIN_GC_THRESHOLD, self.max_heap_bytes.max(MIN_GC_THRESHOLD));
            if matches!(self.log_level, LogLevel::Debug | LogLevel::Trace) {
                eprintln!(
                    "[DEBUG] gc #{}: minor freed {} objects / {} bytes{}; live {} bytes, {} objects, next threshold {}",
                    self.gc_count,
                    minor.freed_objects,
                    minor.freed_bytes,
                    match full {
                        Some(f) => format!(
                            ", full freed {} objects / {} bytes",
                            f.freed_objects, f.freed_bytes
                        ),
                        None => String::new(),
                    },
                    self.heap.allocated_bytes,
                    self.heap.alive_objects,
                    self.gc_threshold
                );
            }
        }
        if self.heap.allocated_bytes + incoming > self.max_heap_bytes {
            return Err(VmError::Runtime(
                "out of memory: live heap exceeds configured maximum".to_string(),
            ));
        }
        Ok(())
    }

    /// Root set: globals, interned constant strings, and for every live
    /// frame each register slot, operand-stack slot, reference cell and
    /// the active closure environment.
    fn collect_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = Vec::new();
        roots.extend(self.globals.values().copied());
        roots.extend(self.const_strings.values().copied());
        for frame in &self.frames {
            roots.extend(frame.regs.iter().copied());
            roots.extend(frame.stack.iter().copied());
            roots.extend(frame.ref_cells.iter().map(|&c| Value::Reference(c)));
            roots.extend(frame.free_refs.iter().map(|&c| Value::Reference(c)));
        }
        roots
    }
}

use crate::backend::vm::error::VmError;
use crate::backend::vm::value::{GcObject, Reference, Value};
use crate::backend::vm::VirtualMachine;
use crate::bytecode::Function;

impl VirtualMachine {
    /// Resolve a `push_reference` index: the first `local_ref_vars.len()`
    /// indices address this frame's own cells, the rest index into the
    /// closure environment.
    pub(crate) fn resolve_reference(
        &self,
        func: &Function,
        idx: i32,
    ) -> Result<*mut GcObject<Reference>, VmError> {
        let frame = self.frames.last().expect("active frame");
        let idx = usize::try_from(idx)
            .map_err(|_| VmError::Runtime(format!("reference index {} out of range", idx)))?;
        let local_count = func.local_ref_vars.len();
        if idx < local_count {
            frame.ref_cells.get(idx).copied().ok_or_else(|| {
                VmError::Runtime(format!("reference cell {} not initialized", idx))
            })
        } else {
            frame.free_refs.get(idx - local_count).copied().ok_or_else(|| {
                VmError::Runtime(format!("free variable index {} out of range", idx))
            })
        }
    }

    /// Call a callable value. A Closure runs its function with the
    /// captured cells as environment; a bare Function runs with an empty
    /// environment; builtin sentinels divert to host code inside
    /// `execute_function`.
    pub(crate) fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, VmError> {
        match callee {
            Value::Closure(p) => {
                let (function, free_refs) =
                    unsafe { ((*p).data.function, (*p).data.free_refs.clone()) };
                let func = unsafe { &*function };
                self.execute_function(func, args, free_refs)
            }
            Value::Function(p) => {
                let func = unsafe { &*p };
                self.execute_function(func, args, Vec::new())
            }
            _ => Err(VmError::IllegalCast(
                "Expected closure or function".to_string(),
            )),
        }
    }
}

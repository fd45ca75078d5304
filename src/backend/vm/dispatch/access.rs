use crate::backend::vm::error::VmError;
use crate::backend::vm::value::{HeaderPtr, Value};
use crate::backend::vm::VirtualMachine;
use crate::bytecode::Function;

impl VirtualMachine {
    fn name<'f>(&self, func: &'f Function, idx: i32) -> Result<&'f str, VmError> {
        func.names
            .get(usize::try_from(idx).unwrap_or(usize::MAX))
            .map(String::as_str)
            .ok_or_else(|| VmError::Runtime(format!("name index {} out of range", idx)))
    }

    pub(crate) fn load_global(&mut self, func: &Function, name_idx: i32) -> Result<Value, VmError> {
        let name = self.name(func, name_idx)?;
        self.globals.get(name).copied().ok_or_else(|| {
            VmError::UninitializedVariable(format!("Undefined global: {}", name))
        })
    }

    // no barrier on global stores: the globals table is itself a root
    pub(crate) fn store_global(
        &mut self,
        func: &Function,
        name_idx: i32,
        v: Value,
    ) -> Result<(), VmError> {
        let name = self.name(func, name_idx)?.to_string();
        self.globals.insert(name, v);
        Ok(())
    }

    pub(crate) fn field_load(
        &mut self,
        func: &Function,
        rec: Value,
        name_idx: i32,
    ) -> Result<Value, VmError> {
        let record = rec.as_record()?;
        let name = self.name(func, name_idx)?;
        let fields = unsafe { &(*record).data.fields };
        Ok(fields.get(name).copied().unwrap_or(Value::None))
    }

    pub(crate) fn field_store(
        &mut self,
        func: &Function,
        rec: Value,
        name_idx: i32,
        v: Value,
    ) -> Result<(), VmError> {
        let record = rec.as_record()?;
        let name = self.name(func, name_idx)?.to_string();
        unsafe {
            (*record).data.fields.insert(name, v);
        }
        self.heap.write_barrier(record as HeaderPtr, v);
        Ok(())
    }

    pub(crate) fn index_load(&mut self, rec: Value, idx: Value) -> Result<Value, VmError> {
        let record = rec.as_record()?;
        let key = index_key(idx)?;
        let fields = unsafe { &(*record).data.fields };
        Ok(fields.get(&key).copied().unwrap_or(Value::None))
    }

    pub(crate) fn index_store(&mut self, rec: Value, idx: Value, v: Value) -> Result<(), VmError> {
        let record = rec.as_record()?;
        let key = index_key(idx)?;
        unsafe {
            (*record).data.fields.insert(key, v);
        }
        self.heap.write_barrier(record as HeaderPtr, v);
        Ok(())
    }
}

/// Record keys are strings; integer indices are stringified so `r[1]`
/// and `r["1"]` address the same field.
fn index_key(idx: Value) -> Result<String, VmError> {
    match idx {
        Value::Int(i) => Ok(i.to_string()),
        Value::Str(p) => Ok(unsafe { (*p).data.clone() }),
        _ => Err(VmError::IllegalCast("Invalid index type".to_string())),
    }
}

// Quill runtime value model
// Created by: Anqi Shen
// Changelog:
// 2026-06-20: Tagged Value representation: integers and booleans live
//            directly in register/stack slots, only strings, records,
//            closures and reference cells are heap objects. Replaced the
//            old boxed-everything design after GC pressure showed up in
//            the loop benchmarks.
// 2026-07-02: Moved equality and stringification here so both the stack
//            and register interpreters share one definition.

use crate::backend::vm::error::VmError;
use crate::bytecode::Function;
use rustc_hash::FxHashMap;

/// Discriminates heap objects for the sweep phase, which must rebuild the
/// original `Box` type to free an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Str,
    Record,
    Closure,
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Young,
    Old,
}

/// Header-only view of a heap object; every `*mut GcObject<T>` can be
/// cast to `*mut GcObject<HeaderOnly>` because the header fields are a
/// `repr(C)` prefix independent of `T`.
pub struct HeaderOnly;

/// Intrusive GC header threaded through every heap allocation. `prev`
/// and `next` link all live objects of the heap; allocation inserts at
/// the head of the list and tags the object young.
#[repr(C)]
pub struct GcObject<T> {
    pub mark: bool,
    pub generation: Generation,
    pub in_remembered: bool,
    pub kind: ObjectKind,
    pub size: usize,
    pub prev: *mut GcObject<HeaderOnly>,
    pub next: *mut GcObject<HeaderOnly>,
    pub data: T,
}

pub type HeaderPtr = *mut GcObject<HeaderOnly>;

/// String-keyed mutable map. Lookup is hash-based; keys are only sorted
/// for stringification.
pub struct Record {
    pub fields: FxHashMap<String, Value>,
}

/// A single mutable cell shared between the declaring frame and every
/// closure that captures the corresponding name.
pub struct Reference {
    pub cell: Value,
}

/// A function bundled with the cells for its free variables, in the
/// declaration order of `free_vars`.
pub struct Closure {
    pub function: *const Function,
    pub free_refs: Vec<*mut GcObject<Reference>>,
}

/// Runtime value. None, booleans and integers never touch the heap;
/// `Function` points into the host-owned bytecode tree.
#[derive(Clone, Copy)]
pub enum Value {
    None,
    Bool(bool),
    Int(i32),
    Str(*mut GcObject<String>),
    Record(*mut GcObject<Record>),
    Function(*const Function),
    Closure(*mut GcObject<Closure>),
    Reference(*mut GcObject<Reference>),
}

impl Value {
    /// The GC header of the value, if it owns a heap object.
    pub fn heap_ptr(self) -> Option<HeaderPtr> {
        match self {
            Value::Str(p) => Some(p as HeaderPtr),
            Value::Record(p) => Some(p as HeaderPtr),
            Value::Closure(p) => Some(p as HeaderPtr),
            Value::Reference(p) => Some(p as HeaderPtr),
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Function(_) => None,
        }
    }

    pub fn as_int(self) -> Result<i32, VmError> {
        match self {
            Value::Int(i) => Ok(i),
            _ => Err(VmError::IllegalCast("Expected integer".into())),
        }
    }

    pub fn as_bool(self) -> Result<bool, VmError> {
        match self {
            Value::Bool(b) => Ok(b),
            _ => Err(VmError::IllegalCast("Expected boolean".into())),
        }
    }

    pub fn as_record(self) -> Result<*mut GcObject<Record>, VmError> {
        match self {
            Value::Record(p) => Ok(p),
            _ => Err(VmError::IllegalCast("Expected record".into())),
        }
    }

    pub fn as_reference(self) -> Result<*mut GcObject<Reference>, VmError> {
        match self {
            Value::Reference(p) => Ok(p),
            _ => Err(VmError::IllegalCast("Expected reference".into())),
        }
    }

    pub fn is_string(self) -> bool {
        matches!(self, Value::Str(_))
    }

    /// Language-level equality: structural for None/Bool/Int/String,
    /// identity for records, functions, closures and references.
    /// Cross-kind comparison is false except None == None.
    pub fn equals(self, other: Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => unsafe { (*a).data == (*b).data },
            (Value::Record(a), Value::Record(b)) => std::ptr::eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => std::ptr::eq(a, b),
            (Value::Reference(a), Value::Reference(b)) => std::ptr::eq(a, b),
            (Value::Function(a), Value::Function(b)) => std::ptr::eq(a, b),
            _ => false,
        }
    }

    /// Stringification used by `print` and by string coercion in `+`.
    /// Record keys are listed in lexicographic order.
    pub fn stringify(self) -> Result<String, VmError> {
        match self {
            Value::None => Ok("None".to_string()),
            Value::Bool(b) => Ok(if b { "true" } else { "false" }.to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Str(p) => Ok(unsafe { (*p).data.clone() }),
            Value::Function(_) | Value::Closure(_) => Ok("FUNCTION".to_string()),
            Value::Record(p) => {
                let fields = unsafe { &(*p).data.fields };
                let mut entries: Vec<(&String, &Value)> = fields.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = String::from("{");
                for (key, val) in entries {
                    out.push_str(key);
                    out.push(':');
                    out.push_str(&val.stringify()?);
                    out.push(' ');
                }
                out.push('}');
                Ok(out)
            }
            Value::Reference(_) => Err(VmError::Runtime("Cannot stringify a reference".into())),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(p) => write!(f, "{:?}", unsafe { &(**p).data }),
            Value::Record(p) => write!(f, "record@{:p}", p),
            Value::Function(p) => write!(f, "function@{:p}", p),
            Value::Closure(p) => write!(f, "closure@{:p}", p),
            Value::Reference(p) => write!(f, "reference@{:p}", p),
        }
    }
}

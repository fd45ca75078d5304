use crate::backend::vm::error::VmError;
use crate::backend::vm::value::Value;
use crate::backend::vm::VirtualMachine;
use crate::bytecode::Op;

impl VirtualMachine {
    /// Binary operators. Integer/boolean operands are handled without
    /// touching the heap; `+` falls back to string concatenation when
    /// either side is a string. Integer arithmetic wraps (two's
    /// complement, 32-bit); division by zero is fatal.
    pub(crate) fn binary_op(&mut self, op: Op, left: Value, right: Value) -> Result<Value, VmError> {
        match op {
            Op::Add => match (left, right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
                _ if left.is_string() || right.is_string() => {
                    let mut s = left.stringify()?;
                    s.push_str(&right.stringify()?);
                    self.alloc_string_value(s)
                }
                _ => Err(VmError::IllegalCast(
                    "Invalid operand types for add".to_string(),
                )),
            },
            Op::Sub => match (left, right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(b))),
                _ => Err(VmError::IllegalCast(
                    "Invalid operand types for subtract".to_string(),
                )),
            },
            Op::Mul => match (left, right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(b))),
                _ => Err(VmError::IllegalCast(
                    "Invalid operand types for multiply".to_string(),
                )),
            },
            Op::Div => match (left, right) {
                (Value::Int(_), Value::Int(0)) => Err(VmError::IllegalArithmetic(
                    "Division by zero".to_string(),
                )),
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_div(b))),
                _ => Err(VmError::IllegalCast(
                    "Invalid operand types for divide".to_string(),
                )),
            },
            Op::Gt => match (left, right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a > b)),
                _ => Err(VmError::IllegalCast(
                    "Invalid operand types for greater than".to_string(),
                )),
            },
            Op::Geq => match (left, right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a >= b)),
                _ => Err(VmError::IllegalCast(
                    "Invalid operand types for greater or equal".to_string(),
                )),
            },
            Op::Eq => Ok(Value::Bool(left.equals(right))),
            Op::And => Ok(Value::Bool(left.as_bool()? && right.as_bool()?)),
            Op::Or => Ok(Value::Bool(left.as_bool()? || right.as_bool()?)),
            _ => Err(VmError::Runtime(format!(
                "{} is not a binary operator",
                op.mnemonic()
            ))),
        }
    }

    pub(crate) fn unary_op(&mut self, op: Op, operand: Value) -> Result<Value, VmError> {
        match op {
            Op::Neg => match operand {
                Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
                _ => Err(VmError::IllegalCast(
                    "Invalid operand types for negate".to_string(),
                )),
            },
            Op::Not => Ok(Value::Bool(!operand.as_bool()?)),
            _ => Err(VmError::Runtime(format!(
                "{} is not a unary operator",
                op.mnemonic()
            ))),
        }
    }
}

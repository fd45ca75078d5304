use crate::backend::vm::error::VmError;
use crate::backend::vm::value::Value;
use crate::backend::vm::VirtualMachine;
use std::io::Write;

pub const NATIVE_PRINT: usize = 0;
pub const NATIVE_INPUT: usize = 1;
pub const NATIVE_INTCAST: usize = 2;

/// Names of the builtin sentinels, in the fixed child-index order the
/// top-level function carries them.
pub const NATIVE_NAMES: [&str; 3] = ["print", "input", "intcast"];

/// Parameter counts of the sentinels, same order.
pub const NATIVE_PARAMS: [usize; 3] = [1, 0, 1];

impl VirtualMachine {
    /// Execute a builtin in host code instead of bytecode.
    pub(crate) fn call_native(&mut self, id: usize, args: &[Value]) -> Result<Value, VmError> {
        match id {
            NATIVE_PRINT => {
                if args.len() != 1 {
                    return Err(VmError::Runtime("print expects 1 argument".to_string()));
                }
                let text = args[0].stringify()?;
                writeln!(self.output, "{}", text)
                    .map_err(|e| VmError::Runtime(format!("print failed: {}", e)))?;
                Ok(Value::None)
            }
            NATIVE_INPUT => {
                let mut line = String::new();
                std::io::stdin()
                    .read_line(&mut line)
                    .map_err(|e| VmError::Runtime(format!("input failed: {}", e)))?;
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                self.alloc_string_value(line)
            }
            NATIVE_INTCAST => {
                if args.len() != 1 {
                    return Err(VmError::Runtime("intcast expects 1 argument".to_string()));
                }
                match args[0] {
                    Value::Str(p) => {
                        let s = unsafe { (*p).data.clone() };
                        Ok(Value::Int(parse_int_prefix(&s)))
                    }
                    _ => Err(VmError::IllegalCast("Cannot cast to int".to_string())),
                }
            }
            _ => Err(VmError::Runtime(format!("unknown native function {}", id))),
        }
    }
}

/// Base-10 prefix parse with optional sign; non-numeric input yields 0.
/// Arithmetic wraps, matching the 32-bit two's-complement value model.
pub(crate) fn parse_int_prefix(s: &str) -> i32 {
    let t = s.trim_start();
    let mut chars = t.chars().peekable();
    let mut negative = false;
    if let Some(&c) = chars.peek() {
        if c == '+' || c == '-' {
            negative = c == '-';
            chars.next();
        }
    }
    let mut value: i32 = 0;
    let mut saw_digit = false;
    for c in chars {
        let Some(d) = c.to_digit(10) else { break };
        saw_digit = true;
        value = value.wrapping_mul(10).wrapping_add(d as i32);
    }
    if !saw_digit {
        return 0;
    }
    if negative {
        value.wrapping_neg()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::parse_int_prefix;

    #[test]
    fn parses_decimal_prefixes() {
        assert_eq!(parse_int_prefix("42"), 42);
        assert_eq!(parse_int_prefix("  -17abc"), -17);
        assert_eq!(parse_int_prefix("12 34"), 12);
    }

    #[test]
    fn non_numeric_is_zero() {
        assert_eq!(parse_int_prefix(""), 0);
        assert_eq!(parse_int_prefix("abc"), 0);
        assert_eq!(parse_int_prefix("-"), 0);
    }
}

use thiserror::Error;

/// Fatal runtime error kinds. Every error unwinds the whole call stack;
/// there is no in-language catch. The display form is what the host
/// prints to stderr before exiting with code 1.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmError {
    // 读取从未写入过的全局变量
    #[error("UninitializedVariableException: {0}")]
    UninitializedVariable(String),

    // 操作数类型不符 (add on a record, if on a non-bool, ...)
    #[error("IllegalCastException: {0}")]
    IllegalCast(String),

    // 整数除零
    #[error("IllegalArithmeticException: {0}")]
    IllegalArithmetic(String),

    // 操作数栈下溢 (stack form only)
    #[error("InsufficientStackException: {0}")]
    InsufficientStack(String),

    // 结构性错误: 参数个数、池下标越界、缺少 return、OOM
    #[error("RuntimeException: {0}")]
    Runtime(String),
}

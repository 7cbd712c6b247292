// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Runtime errors for the VM.

use crate::compiler::CompileError;
use crate::heap::CoroutineStatus;

/// Runtime error during VM execution. All runtime errors are fatal to
/// the current `run`/`call` invocation and unwind to the embedding call
/// site; there is no in-script catch mechanism.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// Value stack overflow.
    StackOverflow,
    /// Value stack underflow.
    StackUnderflow,
    /// Frame stack overflow (too much call depth).
    FrameStackOverflow,
    /// Type error.
    TypeError { expected: String, got: String },
    /// Division by zero.
    DivisionByZero,
    /// Calling a value that is not callable.
    NotCallable(String),
    /// Wrong number of arguments.
    ArityError { expected: usize, got: usize },
    /// `yield` with no coroutine to suspend (or across a native call
    /// boundary).
    YieldOutsideCoroutine,
    /// Resuming a coroutine that is not suspended.
    NotResumable(CoroutineStatus),
    /// Internal invariant breach.
    Internal(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::StackOverflow => write!(f, "Stack overflow"),
            RuntimeError::StackUnderflow => write!(f, "Stack underflow"),
            RuntimeError::FrameStackOverflow => write!(f, "Frame stack overflow"),
            RuntimeError::TypeError { expected, got } => {
                write!(f, "Type error: expected {}, got {}", expected, got)
            }
            RuntimeError::DivisionByZero => write!(f, "Division by zero"),
            RuntimeError::NotCallable(kind) => write!(f, "Cannot call a {}", kind),
            RuntimeError::ArityError { expected, got } => {
                write!(
                    f,
                    "Wrong number of arguments: expected {}, got {}",
                    expected, got
                )
            }
            RuntimeError::YieldOutsideCoroutine => {
                write!(f, "'yield' outside of a coroutine")
            }
            RuntimeError::NotResumable(status) => {
                write!(f, "Cannot resume a {} coroutine", status)
            }
            RuntimeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for VM operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Either of the two error channels, for `eval` and other
/// compile-and-run conveniences.
#[derive(Debug, Clone)]
pub enum Error {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Compile(err) => err.fmt(f),
            Error::Runtime(err) => err.fmt(f),
        }
    }
}

impl From<CompileError> for Error {
    fn from(err: CompileError) -> Self {
        Error::Compile(err)
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        Error::Runtime(err)
    }
}

impl std::error::Error for Error {}

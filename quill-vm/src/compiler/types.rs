// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Shared types for the bytecode compiler.

use quill_parser::ParseError;

/// Error during compilation: a single message with its source position.
/// The first error aborts compilation; there is no recovery.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Compile error at {}:{}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for CompileError {}

impl From<ParseError> for CompileError {
    fn from(err: ParseError) -> Self {
        CompileError {
            message: err.message,
            line: err.line,
            column: err.column,
        }
    }
}

/// Result type for compilation.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Local variable during compilation.
#[derive(Debug, Clone)]
pub(crate) struct Local {
    pub name: String,
    pub depth: usize,
    pub is_captured: bool,
}

/// Loop bookkeeping for compiling break/continue.
#[derive(Debug)]
pub(crate) struct LoopContext {
    /// Backward jump target for the loop's start.
    pub start_offset: usize,
    /// Scope depth outside the loop body; break/continue pop locals
    /// deeper than this.
    pub scope_depth: usize,
    /// Forward break jumps, patched at loop end.
    pub break_jumps: Vec<usize>,
    /// Forward continue jumps (for-loops jump to the increment).
    pub continue_jumps: Vec<usize>,
    /// While-loops continue straight back to the condition.
    pub continue_to_start: bool,
}

// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! AST to bytecode compilation.

pub mod codegen;
pub mod types;

pub use codegen::compile_program;
pub use types::{CompileError, Result};

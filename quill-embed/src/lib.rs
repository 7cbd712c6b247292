// quill-embed - Embedding API for Quill
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! # quill-embed
//!
//! A high-level embedding API for the Quill scripting language.
//!
//! This crate wraps the `quill-vm` virtual machine in an ergonomic
//! interface for host applications: evaluation, typed value conversion
//! and native-function registration.
//!
//! ## Quick Start
//!
//! ```rust
//! use quill_embed::Engine;
//!
//! let mut engine = Engine::new();
//! let result: f64 = engine.eval_as("1 + 2 * 3").unwrap();
//! assert_eq!(result, 7.0);
//! ```
//!
//! ## Registering Native Functions
//!
//! ```rust
//! use quill_embed::{Engine, Value};
//!
//! fn double(_vm: &mut quill_vm::Vm, args: &[Value]) -> quill_vm::Result<Value> {
//!     match args.first() {
//!         Some(Value::Number(n)) => Ok(Value::Number(n * 2.0)),
//!         other => Err(quill_vm::RuntimeError::TypeError {
//!             expected: "number".into(),
//!             got: other.map(|v| v.type_name()).unwrap_or("nothing").into(),
//!         }),
//!     }
//! }
//!
//! let mut engine = Engine::new();
//! engine.register_native("double", double);
//! let result: f64 = engine.eval_as("double(21)").unwrap();
//! assert_eq!(result, 42.0);
//! ```

mod convert;
mod engine;

pub use convert::{FromQuillVal, IntoQuillVal};
pub use engine::Engine;

// Re-export core types for convenience.
pub use quill_vm::{
    CompileError, CoroutineStatus, Error, Function, GcStats, NativeFn, Result, RuntimeError,
    Value, Vm, VmConfig,
};

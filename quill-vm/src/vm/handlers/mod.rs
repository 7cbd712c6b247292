// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Opcode handlers, grouped by concern.

pub mod arithmetic;
pub mod control;
pub mod coroutine;
pub mod tables;
pub mod variables;

// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Variable opcode handlers: locals, globals, upvalues.
//!
//! Stores peek rather than pop: assignment is an expression and leaves
//! its value on the stack. Missing globals read as nil.

use crate::heap::UpvalueState;
use crate::opcode::OpCode;
use crate::value::Value;
use crate::vm::{Result, RuntimeError, Vm};

impl Vm {
    pub(crate) fn execute_variables(&mut self, op: OpCode) -> Result<()> {
        match op {
            OpCode::GetLocal(slot) => {
                let base = self.frame().base;
                let value = self.state.stack.get(base + slot as usize)?;
                self.state.stack.push(value)
            }
            OpCode::SetLocal(slot) => {
                let base = self.frame().base;
                let value = self.state.stack.peek(0)?;
                self.state.stack.set(base + slot as usize, value)
            }
            OpCode::GetGlobal(idx) => {
                let name = self.constant_str(idx)?;
                let value = self
                    .heap
                    .get_table(self.globals_handle())
                    .and_then(|t| t.get(&name).cloned())
                    .unwrap_or(Value::Nil);
                self.state.stack.push(value)
            }
            OpCode::SetGlobal(idx) => {
                let name = self.constant_str(idx)?;
                let value = self.state.stack.peek(0)?;
                let globals = self.globals_handle();
                self.heap
                    .get_table_mut(globals)
                    .ok_or_else(|| RuntimeError::Internal("globals table missing".into()))?
                    .insert(name, value);
                Ok(())
            }
            OpCode::DefineGlobal(idx) => {
                let name = self.constant_str(idx)?;
                let value = self.state.stack.pop()?;
                let globals = self.globals_handle();
                self.heap
                    .get_table_mut(globals)
                    .ok_or_else(|| RuntimeError::Internal("globals table missing".into()))?
                    .insert(name, value);
                Ok(())
            }
            OpCode::GetUpvalue(idx) => {
                let handle = self.upvalue_handle(idx)?;
                let value = match &self
                    .heap
                    .get_upvalue(handle)
                    .ok_or_else(|| RuntimeError::Internal("stale upvalue handle".into()))?
                    .state
                {
                    UpvalueState::Open(slot) => self.state.stack.get(*slot)?,
                    UpvalueState::Closed(value) => value.clone(),
                };
                self.state.stack.push(value)
            }
            OpCode::SetUpvalue(idx) => {
                let handle = self.upvalue_handle(idx)?;
                let value = self.state.stack.peek(0)?;
                let upvalue = self
                    .heap
                    .get_upvalue_mut(handle)
                    .ok_or_else(|| RuntimeError::Internal("stale upvalue handle".into()))?;
                match &mut upvalue.state {
                    UpvalueState::Open(slot) => {
                        let slot = *slot;
                        self.state.stack.set(slot, value)?;
                    }
                    UpvalueState::Closed(stored) => *stored = value,
                }
                Ok(())
            }
            _ => Err(RuntimeError::Internal(format!(
                "execute_variables: unexpected opcode {:?}",
                op
            ))),
        }
    }

    /// The upvalue handle at index `idx` of the current closure.
    fn upvalue_handle(&self, idx: u16) -> Result<crate::heap::Handle> {
        let closure = self.frame().closure;
        let func = self
            .heap
            .get_function(closure)
            .ok_or_else(|| RuntimeError::Internal("stale closure handle".into()))?;
        func.upvalues
            .get(idx as usize)
            .copied()
            .ok_or_else(|| RuntimeError::Internal("upvalue index out of bounds".into()))
    }
}

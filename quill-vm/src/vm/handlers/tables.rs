// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Table opcode handlers: construction, field reads and field stores.
//!
//! Table keys are strings; indexing any other value type, or keying with
//! a non-string, is a type error. Reading an absent key yields nil.

use crate::opcode::OpCode;
use crate::table::Table;
use crate::value::Value;
use crate::vm::{Result, RuntimeError, Vm};

impl Vm {
    pub(crate) fn execute_tables(&mut self, op: OpCode) -> Result<()> {
        match op {
            OpCode::NewTable(capacity) => {
                let handle = self.heap.alloc_table(Table::with_capacity(capacity as usize));
                self.state.stack.push(Value::Table(handle))
            }
            OpCode::GetField => {
                let key = self.state.stack.pop()?;
                let object = self.state.stack.pop()?;
                let value = self.field_get(&object, &key)?;
                self.state.stack.push(value)
            }
            OpCode::SetField => {
                let value = self.state.stack.pop()?;
                let key = self.state.stack.pop()?;
                let object = self.state.stack.pop()?;
                self.field_set(&object, &key, value.clone())?;
                // The stored value is the assignment's result.
                self.state.stack.push(value)
            }
            _ => Err(RuntimeError::Internal(format!(
                "execute_tables: unexpected opcode {:?}",
                op
            ))),
        }
    }

    pub(crate) fn field_get(&self, object: &Value, key: &Value) -> Result<Value> {
        let (table, key) = self.check_field_access(object, key)?;
        Ok(self
            .heap
            .get_table(table)
            .and_then(|t| t.get(key).cloned())
            .unwrap_or(Value::Nil))
    }

    pub(crate) fn field_set(&mut self, object: &Value, key: &Value, value: Value) -> Result<()> {
        let (table, key) = self.check_field_access(object, key)?;
        let key = key.clone();
        self.heap
            .get_table_mut(table)
            .ok_or_else(|| RuntimeError::Internal("stale table handle".into()))?
            .insert(key, value);
        Ok(())
    }

    fn check_field_access<'v>(
        &self,
        object: &Value,
        key: &'v Value,
    ) -> Result<(crate::heap::Handle, &'v crate::string::Str)> {
        let table = match object {
            Value::Table(handle) => *handle,
            other => {
                return Err(RuntimeError::TypeError {
                    expected: "table".into(),
                    got: other.type_name().into(),
                });
            }
        };
        let key = match key {
            Value::Str(s) => s,
            other => {
                return Err(RuntimeError::TypeError {
                    expected: "string key".into(),
                    got: other.type_name().into(),
                });
            }
        };
        Ok((table, key))
    }
}

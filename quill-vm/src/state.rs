// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! VM state persistence for host module reloads.
//!
//! Serialises the serialisable subset of the globals table — nil,
//! booleans, numbers, strings and acyclic tables — and restores it into
//! a (possibly different) VM instance. Functions, natives, coroutines
//! and userdata are skipped: they cannot survive a module reload anyway.
//! The contract is narrow on purpose: a save/load pair round-trips
//! global table contents and has no other side effects.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::heap::Handle;
use crate::value::Value;
use crate::vm::{Result, RuntimeError, Vm};

/// The serialised form of a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SavedValue {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
    Table(Vec<(String, SavedValue)>),
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    globals: Vec<(String, SavedValue)>,
}

impl Vm {
    /// Serialise the globals table.
    pub fn save_state(&self) -> Result<String> {
        let globals = self
            .heap
            .get_table(self.globals_handle())
            .ok_or_else(|| RuntimeError::Internal("globals table missing".into()))?;

        let mut saved = Vec::new();
        let mut visiting = HashSet::new();
        for (name, value) in globals.iter() {
            if let Some(sv) = self.save_value(value, &mut visiting)? {
                saved.push((name.as_str().to_string(), sv));
            }
        }
        // Stable output order, so saves diff cleanly.
        saved.sort_by(|a, b| a.0.cmp(&b.0));

        serde_yaml::to_string(&SavedState { globals: saved })
            .map_err(|e| RuntimeError::Internal(format!("state serialisation failed: {}", e)))
    }

    /// Restore globals from a prior [`Vm::save_state`]. Existing globals
    /// with the same names are overwritten; others are left alone.
    pub fn load_state(&mut self, data: &str) -> Result<()> {
        let state: SavedState = serde_yaml::from_str(data)
            .map_err(|e| RuntimeError::Internal(format!("state deserialisation failed: {}", e)))?;
        for (name, saved) in state.globals {
            let value = self.restore_value(&saved)?;
            self.set_global(&name, value);
        }
        Ok(())
    }

    /// `Ok(None)` for values that are deliberately not persisted.
    fn save_value(
        &self,
        value: &Value,
        visiting: &mut HashSet<Handle>,
    ) -> Result<Option<SavedValue>> {
        Ok(match value {
            Value::Nil => Some(SavedValue::Nil),
            Value::Bool(b) => Some(SavedValue::Bool(*b)),
            Value::Number(n) => Some(SavedValue::Number(*n)),
            Value::Str(s) => Some(SavedValue::Str(s.as_str().to_string())),
            Value::Table(handle) => {
                if !visiting.insert(*handle) {
                    return Err(RuntimeError::Internal(
                        "cannot save a cyclic table graph".into(),
                    ));
                }
                let table = self
                    .heap
                    .get_table(*handle)
                    .ok_or_else(|| RuntimeError::Internal("stale table handle".into()))?;
                let mut entries = Vec::with_capacity(table.len());
                for (key, entry) in table.iter() {
                    if let Some(sv) = self.save_value(entry, visiting)? {
                        entries.push((key.as_str().to_string(), sv));
                    }
                }
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                visiting.remove(handle);
                Some(SavedValue::Table(entries))
            }
            // Not representable across a reload.
            Value::Function(_)
            | Value::Native(_)
            | Value::Coroutine(_)
            | Value::Userdata(_) => None,
        })
    }

    fn restore_value(&mut self, saved: &SavedValue) -> Result<Value> {
        Ok(match saved {
            SavedValue::Nil => Value::Nil,
            SavedValue::Bool(b) => Value::Bool(*b),
            SavedValue::Number(n) => Value::Number(*n),
            SavedValue::Str(s) => self.new_string(s),
            SavedValue::Table(entries) => {
                let table = self.new_table();
                for (key, sv) in entries {
                    let value = self.restore_value(sv)?;
                    self.table_set(&table, key, value)?;
                }
                table
            }
        })
    }
}

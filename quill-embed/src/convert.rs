// quill-embed - Value conversion traits
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Conversions between Rust values and Quill values.
//!
//! Conversions need the VM: strings intern into its table and
//! collections allocate on its heap, which is why both traits take a
//! `&mut Vm`.

use quill_vm::{RuntimeError, Value, Vm};

/// Convert a Rust value into a Quill value.
pub trait IntoQuillVal {
    fn into_quill(self, vm: &mut Vm) -> Value;
}

/// Convert a Quill value into a Rust value.
pub trait FromQuillVal: Sized {
    fn from_quill(value: &Value, vm: &Vm) -> Result<Self, RuntimeError>;
}

fn type_error(expected: &str, got: &Value) -> RuntimeError {
    RuntimeError::TypeError {
        expected: expected.into(),
        got: got.type_name().into(),
    }
}

// ============================================================================
// IntoQuillVal
// ============================================================================

impl IntoQuillVal for Value {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        self
    }
}

impl IntoQuillVal for () {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        Value::Nil
    }
}

impl IntoQuillVal for bool {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        Value::Bool(self)
    }
}

impl IntoQuillVal for f64 {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        Value::Number(self)
    }
}

impl IntoQuillVal for f32 {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        Value::Number(self as f64)
    }
}

impl IntoQuillVal for i32 {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        Value::Number(self as f64)
    }
}

impl IntoQuillVal for u32 {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        Value::Number(self as f64)
    }
}

impl IntoQuillVal for i64 {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        Value::Number(self as f64)
    }
}

impl IntoQuillVal for usize {
    fn into_quill(self, _vm: &mut Vm) -> Value {
        Value::Number(self as f64)
    }
}

impl IntoQuillVal for &str {
    fn into_quill(self, vm: &mut Vm) -> Value {
        vm.new_string(self)
    }
}

impl IntoQuillVal for String {
    fn into_quill(self, vm: &mut Vm) -> Value {
        vm.new_string(&self)
    }
}

impl<T: IntoQuillVal> IntoQuillVal for Option<T> {
    fn into_quill(self, vm: &mut Vm) -> Value {
        match self {
            Some(inner) => inner.into_quill(vm),
            None => Value::Nil,
        }
    }
}

// ============================================================================
// FromQuillVal
// ============================================================================

impl FromQuillVal for Value {
    fn from_quill(value: &Value, _vm: &Vm) -> Result<Self, RuntimeError> {
        Ok(value.clone())
    }
}

impl FromQuillVal for () {
    fn from_quill(value: &Value, _vm: &Vm) -> Result<Self, RuntimeError> {
        match value {
            Value::Nil => Ok(()),
            other => Err(type_error("nil", other)),
        }
    }
}

impl FromQuillVal for bool {
    fn from_quill(value: &Value, _vm: &Vm) -> Result<Self, RuntimeError> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(type_error("boolean", other)),
        }
    }
}

impl FromQuillVal for f64 {
    fn from_quill(value: &Value, _vm: &Vm) -> Result<Self, RuntimeError> {
        match value {
            Value::Number(n) => Ok(*n),
            other => Err(type_error("number", other)),
        }
    }
}

impl FromQuillVal for f32 {
    fn from_quill(value: &Value, vm: &Vm) -> Result<Self, RuntimeError> {
        f64::from_quill(value, vm).map(|n| n as f32)
    }
}

impl FromQuillVal for i64 {
    fn from_quill(value: &Value, vm: &Vm) -> Result<Self, RuntimeError> {
        f64::from_quill(value, vm).map(|n| n as i64)
    }
}

impl FromQuillVal for i32 {
    fn from_quill(value: &Value, vm: &Vm) -> Result<Self, RuntimeError> {
        f64::from_quill(value, vm).map(|n| n as i32)
    }
}

impl FromQuillVal for String {
    fn from_quill(value: &Value, _vm: &Vm) -> Result<Self, RuntimeError> {
        match value {
            Value::Str(s) => Ok(s.as_str().to_string()),
            other => Err(type_error("string", other)),
        }
    }
}

impl<T: FromQuillVal> FromQuillVal for Option<T> {
    fn from_quill(value: &Value, vm: &Vm) -> Result<Self, RuntimeError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_quill(other, vm).map(Some),
        }
    }
}

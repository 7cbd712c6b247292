// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Runtime values.
//!
//! A [`Value`] is a tagged union over the fixed value kinds. It is 16
//! bytes and cheap to clone: reference-type payloads are either an `Rc`
//! (strings) or a plain heap handle.
//!
//! The enum uses a primitive representation so the tag byte sits at a
//! defined offset; the JIT reads and writes values through this layout.

use std::rc::Rc;

use crate::heap::{Handle, Heap};
use crate::string::Str;
use crate::vm::{RuntimeError, Vm};

/// Native function signature. The argument slice is a copy of the call
/// window on the VM stack and must not be retained past the call.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

/// A Quill runtime value.
///
/// Copied by value everywhere; `Str` payloads share their contents via
/// `Rc`, the remaining reference kinds are handles into the VM heap.
#[derive(Debug, Clone)]
#[repr(u8)]
pub enum Value {
    Nil = 0,
    Bool(bool) = 1,
    Number(f64) = 2,
    Str(Str) = 3,
    Function(Handle) = 4,
    Native(NativeFn) = 5,
    Table(Handle) = 6,
    Coroutine(Handle) = 7,
    Userdata(Handle) = 8,
}

// Tag values and payload offsets, fixed by the primitive representation
// above. The JIT bakes these into generated code; `layout_tests` below
// pins them.
pub(crate) const TAG_NIL: u8 = 0;
pub(crate) const TAG_BOOL: u8 = 1;
pub(crate) const TAG_NUMBER: u8 = 2;
pub(crate) const BOOL_PAYLOAD_OFFSET: usize = 1;
pub(crate) const NUMBER_PAYLOAD_OFFSET: usize = 8;
pub(crate) const VALUE_SIZE: usize = 16;

impl Value {
    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Native(_) => "native function",
            Value::Table(_) => "table",
            Value::Coroutine(_) => "coroutine",
            Value::Userdata(_) => "userdata",
        }
    }

    /// `nil` and `false` are falsy, everything else is truthy.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Heap handle carried by this value, if any. Used by the GC.
    pub(crate) fn handle(&self) -> Option<Handle> {
        match self {
            Value::Function(h)
            | Value::Table(h)
            | Value::Coroutine(h)
            | Value::Userdata(h) => Some(*h),
            _ => None,
        }
    }

    /// Render the value for display. Needs the heap to name functions.
    pub fn display(&self, heap: &Heap) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Str(s) => s.as_str().to_string(),
            Value::Function(h) => match heap.get_function(*h) {
                Some(f) => match &f.proto.name {
                    Some(name) => format!("<fn {}>", name.as_str()),
                    None => "<fn>".to_string(),
                },
                None => "<fn (collected)>".to_string(),
            },
            Value::Native(_) => "<native fn>".to_string(),
            Value::Table(h) => format!("<table {}>", h.index()),
            Value::Coroutine(h) => format!("<coroutine {}>", h.index()),
            Value::Userdata(h) => format!("<userdata {}>", h.index()),
        }
    }
}

impl PartialEq for Value {
    /// Equality compares type first; different types are never equal.
    /// Nil, booleans and numbers compare by value. Strings compare by
    /// identity, which interning makes equivalent to content equality.
    /// Tables, functions and coroutines compare by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Coroutine(a), Value::Coroutine(b)) => a == b,
            (Value::Userdata(a), Value::Userdata(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => std::ptr::eq(*a as *const (), *b as *const ()),
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Str> for Value {
    fn from(s: Str) -> Self {
        Value::Str(s)
    }
}

// Make sure an Rc payload still fits the expected layout.
const _: () = assert!(std::mem::size_of::<Rc<str>>() <= 16);

#[cfg(test)]
mod layout_tests {
    use super::*;

    fn tag_of(v: &Value) -> u8 {
        // The primitive representation puts the discriminant in the
        // first byte.
        unsafe { *(v as *const Value as *const u8) }
    }

    #[test]
    fn value_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<Value>(), VALUE_SIZE);
    }

    #[test]
    fn tags_match_discriminants() {
        assert_eq!(tag_of(&Value::Nil), TAG_NIL);
        assert_eq!(tag_of(&Value::Bool(true)), TAG_BOOL);
        assert_eq!(tag_of(&Value::Number(1.0)), TAG_NUMBER);
    }

    #[test]
    fn number_payload_offset() {
        let v = Value::Number(f64::from_bits(0x0123_4567_89ab_cdef));
        let bytes = unsafe {
            std::slice::from_raw_parts(&v as *const Value as *const u8, VALUE_SIZE)
        };
        let payload =
            u64::from_le_bytes(bytes[NUMBER_PAYLOAD_OFFSET..].try_into().unwrap());
        assert_eq!(payload, 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn bool_payload_offset() {
        let v = Value::Bool(true);
        let bytes = unsafe {
            std::slice::from_raw_parts(&v as *const Value as *const u8, VALUE_SIZE)
        };
        assert_eq!(bytes[BOOL_PAYLOAD_OFFSET], 1);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
    }
}

// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Arithmetic and ordering opcode handlers.
//!
//! Arithmetic requires numbers, except `+` which also concatenates two
//! strings (the result is interned). Division by zero is a runtime
//! error, not NaN/Inf propagation.

use crate::opcode::OpCode;
use crate::value::Value;
use crate::vm::{Result, RuntimeError, Vm};

impl Vm {
    pub(crate) fn execute_arithmetic(&mut self, op: OpCode) -> Result<()> {
        match op {
            OpCode::Add => self.execute_add(),
            OpCode::Sub => self.binary_num_op(|a, b| a - b, "-"),
            OpCode::Mul => self.binary_num_op(|a, b| a * b, "*"),
            OpCode::Div => self.execute_div(),
            OpCode::Mod => self.binary_num_op(|a, b| a % b, "%"),
            OpCode::Pow => self.binary_num_op(|a, b| a.powf(b), "^"),
            OpCode::Negate => self.execute_negate(),
            OpCode::Lt => self.comparison_op(|a, b| a < b, "<"),
            OpCode::Le => self.comparison_op(|a, b| a <= b, "<="),
            OpCode::Gt => self.comparison_op(|a, b| a > b, ">"),
            OpCode::Ge => self.comparison_op(|a, b| a >= b, ">="),
            _ => Err(RuntimeError::Internal(format!(
                "execute_arithmetic: unexpected opcode {:?}",
                op
            ))),
        }
    }

    fn execute_add(&mut self) -> Result<()> {
        let b = self.state.stack.pop()?;
        let a = self.state.stack.pop()?;
        let result = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
            (Value::Str(x), Value::Str(y)) => {
                let joined = format!("{}{}", x.as_str(), y.as_str());
                Value::Str(self.strings.intern(&joined))
            }
            _ => {
                return Err(RuntimeError::TypeError {
                    expected: "two numbers or two strings".into(),
                    got: format!("{} + {}", a.type_name(), b.type_name()),
                });
            }
        };
        self.state.stack.push(result)
    }

    fn execute_div(&mut self) -> Result<()> {
        let b = self.state.stack.pop()?;
        let a = self.state.stack.pop()?;
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => {
                if *y == 0.0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                self.state.stack.push(Value::Number(x / y))
            }
            _ => Err(RuntimeError::TypeError {
                expected: "number".into(),
                got: format!("{} / {}", a.type_name(), b.type_name()),
            }),
        }
    }

    fn execute_negate(&mut self) -> Result<()> {
        let value = self.state.stack.pop()?;
        match value {
            Value::Number(n) => self.state.stack.push(Value::Number(-n)),
            other => Err(RuntimeError::TypeError {
                expected: "number".into(),
                got: other.type_name().into(),
            }),
        }
    }

    /// Perform a binary numeric operation.
    pub(crate) fn binary_num_op<F>(&mut self, op: F, name: &str) -> Result<()>
    where
        F: Fn(f64, f64) -> f64,
    {
        let b = self.state.stack.pop()?;
        let a = self.state.stack.pop()?;
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => self.state.stack.push(Value::Number(op(*x, *y))),
            _ => Err(RuntimeError::TypeError {
                expected: "number".into(),
                got: format!("{} {} {}", a.type_name(), name, b.type_name()),
            }),
        }
    }

    /// Perform an ordering comparison. Numbers only.
    pub(crate) fn comparison_op<F>(&mut self, op: F, name: &str) -> Result<()>
    where
        F: Fn(f64, f64) -> bool,
    {
        let b = self.state.stack.pop()?;
        let a = self.state.stack.pop()?;
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => self.state.stack.push(Value::Bool(op(*x, *y))),
            _ => Err(RuntimeError::TypeError {
                expected: "number".into(),
                got: format!("{} {} {}", a.type_name(), name, b.type_name()),
            }),
        }
    }
}

// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Call, closure and upvalue handlers.

use std::rc::Rc;

use crate::chunk::{Constant, JitState};
use crate::heap::{Handle, UpvalueState};
use crate::jit;
use crate::opcode::OpCode;
use crate::value::Value;
use crate::vm::{Dispatched, Result, RuntimeError, Vm};

impl Vm {
    /// Dispatch a call to the callable at `stack[top - argc - 1]`.
    ///
    /// Script functions push a frame; native functions run synchronously;
    /// calling a suspended coroutine resumes it with the first argument.
    pub(crate) fn call_stack_top(&mut self, argc: usize) -> Result<Dispatched> {
        let fn_index = self
            .state
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or(RuntimeError::StackUnderflow)?;
        let callee = self.state.stack.get(fn_index)?;

        match callee {
            Value::Function(handle) => self.call_function(handle, fn_index, argc),
            Value::Native(native) => {
                // Copy the argument window out; natives must not retain
                // it past the call anyway, and the VM stack stays free
                // for re-entrant calls.
                let mut args = Vec::with_capacity(argc);
                for i in 0..argc {
                    args.push(self.state.stack.get(fn_index + 1 + i)?);
                }
                let result = native(self, &args)?;
                self.state.stack.truncate(fn_index);
                self.state.stack.push(result)?;
                Ok(Dispatched::Immediate)
            }
            Value::Coroutine(handle) => {
                if argc > 1 {
                    return Err(RuntimeError::ArityError {
                        expected: 1,
                        got: argc,
                    });
                }
                let arg = if argc == 1 {
                    self.state.stack.get(fn_index + 1)?
                } else {
                    Value::Nil
                };
                self.state.stack.truncate(fn_index);
                self.resume_value(handle, arg)?;
                Ok(Dispatched::Frame)
            }
            other => Err(RuntimeError::NotCallable(other.type_name().into())),
        }
    }

    fn call_function(&mut self, handle: Handle, fn_index: usize, argc: usize) -> Result<Dispatched> {
        let proto = {
            let func = self
                .heap
                .get_function(handle)
                .ok_or_else(|| RuntimeError::Internal("stale closure handle".into()))?;
            Rc::clone(&func.proto)
        };

        if argc != proto.arity as usize {
            return Err(RuntimeError::ArityError {
                expected: proto.arity as usize,
                got: argc,
            });
        }
        if self.state.frames.len() + self.jit_frames >= self.config.frame_stack_size {
            return Err(RuntimeError::FrameStackOverflow);
        }

        // Profile-guided JIT: one-shot compilation when the call counter
        // crosses the threshold.
        let calls = proto.calls.get().saturating_add(1);
        proto.calls.set(calls);
        if self.config.enable_jit
            && calls == self.config.jit_threshold
            && matches!(*proto.jit.borrow(), JitState::Cold)
        {
            let compiled = jit::compile(&proto);
            let mut slot = proto.jit.borrow_mut();
            *slot = match compiled {
                Some(native) => {
                    log::debug!("jit: compiled {}", proto.name_str());
                    JitState::Compiled(Rc::new(native))
                }
                None => {
                    log::debug!("jit: bailed on {}", proto.name_str());
                    JitState::Failed
                }
            };
        }

        let native = match &*proto.jit.borrow() {
            JitState::Compiled(native) => Some(Rc::clone(native)),
            _ => None,
        };
        if let Some(native) = native {
            match jit::enter(self, &native, &proto, fn_index)? {
                jit::JitExit::Returned => return Ok(Dispatched::Immediate),
                jit::JitExit::Deopt(bytecode_offset) => {
                    // The native code kept the value stack exactly as the
                    // interpreter would have; resume interpreting the
                    // remaining instructions.
                    let mut frame =
                        super::super::CallFrame::new(handle, proto, fn_index);
                    frame.ip = bytecode_offset;
                    self.state.frames.push(frame);
                    return Ok(Dispatched::Frame);
                }
            }
        }

        self.state
            .frames
            .push(super::super::CallFrame::new(handle, proto, fn_index));
        Ok(Dispatched::Frame)
    }

    /// Instantiate a closure: read the prototype from the constant pool
    /// and bind its upvalues from the capture instructions that follow.
    pub(crate) fn execute_closure(&mut self, idx: u16) -> Result<()> {
        let proto = match self.frame().proto.chunk.constants.get(idx as usize) {
            Some(Constant::Proto(proto)) => Rc::clone(proto),
            _ => {
                return Err(RuntimeError::Internal(
                    "closure constant is not a prototype".into(),
                ));
            }
        };

        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for _ in 0..proto.upvalues.len() {
            let frame = self
                .state
                .frames
                .last_mut()
                .ok_or_else(|| RuntimeError::Internal("closure with no frame".into()))?;
            let capture = frame
                .proto
                .chunk
                .code
                .get(frame.ip)
                .copied()
                .ok_or_else(|| RuntimeError::Internal("truncated capture sequence".into()))?;
            frame.ip += 1;

            match capture {
                OpCode::CaptureLocal(slot) => {
                    let base = self.frame().base;
                    let handle = self.capture_upvalue(base + slot as usize);
                    upvalues.push(handle);
                }
                OpCode::CaptureUpvalue(idx) => {
                    let closure = self.frame().closure;
                    let func = self
                        .heap
                        .get_function(closure)
                        .ok_or_else(|| RuntimeError::Internal("stale closure handle".into()))?;
                    let handle = func
                        .upvalues
                        .get(idx as usize)
                        .copied()
                        .ok_or_else(|| {
                            RuntimeError::Internal("capture index out of bounds".into())
                        })?;
                    upvalues.push(handle);
                }
                other => {
                    return Err(RuntimeError::Internal(format!(
                        "expected capture instruction, got {:?}",
                        other
                    )));
                }
            }
        }

        let closure = self.heap.alloc_function(proto, upvalues);
        self.state.stack.push(Value::Function(closure))
    }

    /// Find or create the open upvalue aliasing `slot`. Exactly one
    /// upvalue object exists per captured stack slot, so every closure
    /// capturing the same variable shares mutations until close.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> Handle {
        for &handle in &self.state.open_upvalues {
            if let Some(upvalue) = self.heap.get_upvalue(handle) {
                if matches!(upvalue.state, UpvalueState::Open(s) if s == slot) {
                    return handle;
                }
            }
        }
        let handle = self.heap.alloc_upvalue(slot);
        self.state.open_upvalues.push(handle);
        handle
    }

    /// Close every open upvalue pointing at `from` or above: copy the
    /// stack slot into the upvalue, making it a private box.
    pub(crate) fn close_upvalues(&mut self, from: usize) -> Result<()> {
        let mut i = 0;
        while i < self.state.open_upvalues.len() {
            let handle = self.state.open_upvalues[i];
            let open_slot = match self.heap.get_upvalue(handle) {
                Some(upvalue) => match upvalue.state {
                    UpvalueState::Open(slot) if slot >= from => Some(slot),
                    _ => None,
                },
                None => None,
            };
            match open_slot {
                Some(slot) => {
                    let value = self.state.stack.get(slot)?;
                    self.heap
                        .get_upvalue_mut(handle)
                        .ok_or_else(|| RuntimeError::Internal("stale upvalue handle".into()))?
                        .state = UpvalueState::Closed(value);
                    self.state.open_upvalues.swap_remove(i);
                }
                None => i += 1,
            }
        }
        Ok(())
    }
}

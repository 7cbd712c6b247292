// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Coroutine handlers: explicit execution-state swaps, no host-stack
//! capture.
//!
//! A resume parks the caller's execution state on the resumer stack and
//! swaps the coroutine's state in; a yield swaps back and delivers the
//! yielded value as the resume's result. Because the parked state is an
//! ordinary value, suspension never unwinds the Rust stack.

use std::mem;

use crate::heap::{CoroutineStatus, Handle};
use crate::value::Value;
use crate::vm::{Result, RuntimeError, Vm};

impl Vm {
    /// Swap a suspended coroutine in. On first resume the coroutine's
    /// function is called with the argument (or without, for arity 0);
    /// on later resumes the argument becomes the pending yield's result.
    pub(crate) fn resume_value(&mut self, handle: Handle, arg: Value) -> Result<()> {
        // Validate before touching any state so errors leave the VM
        // consistent.
        let status = self
            .heap
            .get_coroutine(handle)
            .ok_or_else(|| RuntimeError::Internal("stale coroutine handle".into()))?
            .status;
        if status != CoroutineStatus::Suspended {
            return Err(RuntimeError::NotResumable(status));
        }

        // Work out the argument handling before taking the parked
        // state, so validation errors leave the coroutine resumable.
        let (fresh, arity) = {
            let saved = self
                .heap
                .get_coroutine(handle)
                .and_then(|c| c.saved.as_ref())
                .ok_or_else(|| {
                    RuntimeError::Internal("suspended coroutine without state".into())
                })?;
            if saved.frames.is_empty() {
                let callee = saved.stack.get(0)?;
                let arity = match &callee {
                    Value::Function(h) => {
                        self.heap
                            .get_function(*h)
                            .ok_or_else(|| {
                                RuntimeError::Internal("stale function handle".into())
                            })?
                            .proto
                            .arity
                    }
                    other => return Err(RuntimeError::NotCallable(other.type_name().into())),
                };
                (true, arity)
            } else {
                (false, 0)
            }
        };

        let mut incoming = self
            .heap
            .get_coroutine_mut(handle)
            .expect("checked above")
            .saved
            .take()
            .expect("checked above");

        let argc = if !fresh || arity == 1 {
            if let Err(err) = incoming.stack.push(arg) {
                // Put the state back; the coroutine stays suspended.
                self.heap
                    .get_coroutine_mut(handle)
                    .expect("checked above")
                    .saved = Some(incoming);
                return Err(err);
            }
            usize::from(fresh)
        } else {
            0
        };

        self.heap
            .get_coroutine_mut(handle)
            .expect("checked above")
            .status = CoroutineStatus::Running;
        let outgoing = mem::replace(&mut self.state, incoming);
        self.resumers.push(outgoing);
        self.active_coros.push(handle);

        if fresh {
            self.call_stack_top(argc)?;
        }
        Ok(())
    }

    /// `Yield`: suspend the innermost running coroutine.
    ///
    /// Returns `Some(value)` when the enclosing dispatch loop was
    /// entered for exactly this resume (a blocking `Vm::resume`) and
    /// should hand the value back to Rust; otherwise the value has been
    /// pushed as the in-script resume result.
    pub(crate) fn execute_yield(&mut self) -> Result<Option<Value>> {
        let entry = *self
            .loop_entries
            .last()
            .ok_or_else(|| RuntimeError::Internal("yield outside dispatch loop".into()))?;
        if self.active_coros.len() <= entry.coro_depth {
            // Either no coroutine is running, or the innermost resume
            // happened outside this dispatch loop (across a native
            // re-entry boundary).
            return Err(RuntimeError::YieldOutsideCoroutine);
        }

        let value = self.state.stack.pop()?;
        let handle = self
            .active_coros
            .pop()
            .expect("checked depth above");
        let resumer = self
            .resumers
            .pop()
            .ok_or_else(|| RuntimeError::Internal("coroutine without resumer".into()))?;

        let parked = mem::replace(&mut self.state, resumer);
        let coro = self
            .heap
            .get_coroutine_mut(handle)
            .ok_or_else(|| RuntimeError::Internal("stale coroutine handle".into()))?;
        coro.status = CoroutineStatus::Suspended;
        coro.saved = Some(parked);

        self.deliver_to_resumer(value, entry.watermark, entry.coro_depth)
    }

    /// The coroutine's outermost frame returned: mark it dead and
    /// deliver the return value to the resumer.
    pub(crate) fn finish_coroutine(&mut self, value: Value) -> Result<Option<Value>> {
        let entry = *self
            .loop_entries
            .last()
            .ok_or_else(|| RuntimeError::Internal("return outside dispatch loop".into()))?;
        let handle = self
            .active_coros
            .pop()
            .ok_or_else(|| RuntimeError::Internal("finish without active coroutine".into()))?;
        let resumer = self
            .resumers
            .pop()
            .ok_or_else(|| RuntimeError::Internal("coroutine without resumer".into()))?;

        self.state = resumer;
        let coro = self
            .heap
            .get_coroutine_mut(handle)
            .ok_or_else(|| RuntimeError::Internal("stale coroutine handle".into()))?;
        coro.status = CoroutineStatus::Dead;
        coro.saved = None;

        self.deliver_to_resumer(value, entry.watermark, entry.coro_depth)
    }

    /// After swapping back: either exit the dispatch loop (blocking
    /// resume) or push the value as the in-script resume result.
    fn deliver_to_resumer(
        &mut self,
        value: Value,
        watermark: usize,
        coro_depth: usize,
    ) -> Result<Option<Value>> {
        if self.active_coros.len() == coro_depth && self.state.frames.len() == watermark {
            Ok(Some(value))
        } else {
            self.state.stack.push(value)?;
            Ok(None)
        }
    }

    /// `Resume` opcode: arg = pop(), coroutine = pop(), resume it.
    pub(crate) fn execute_resume_op(&mut self) -> Result<()> {
        let arg = self.state.stack.pop()?;
        let coroutine = self.state.stack.pop()?;
        match coroutine {
            Value::Coroutine(handle) => self.resume_value(handle, arg),
            other => Err(RuntimeError::TypeError {
                expected: "coroutine".into(),
                got: other.type_name().into(),
            }),
        }
    }
}

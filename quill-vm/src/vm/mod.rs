// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Stack-based virtual machine for executing Quill bytecode.
//!
//! A [`Vm`] owns the heap, the string interner, the globals table and one
//! active execution state (value stack + frame stack + open upvalues).
//! Coroutines park whole execution states and swap them in on resume.
//!
//! The VM instance is the unit of exclusive ownership: it is
//! single-threaded and must not be shared across threads. Separate `Vm`
//! instances are fully independent, including their string tables.

pub mod error;
pub mod frame;
pub mod handlers;
pub mod stack;

use std::rc::Rc;

use quill_parser::Parser;

use crate::chunk::{Constant, Function, LineInfo};
use crate::compiler::{compile_program, CompileError};
use crate::gc::GcStats;
use crate::heap::{CoroutineStatus, Handle, Heap};
use crate::string::{Interner, Str};
use crate::table::Table;
use crate::value::{NativeFn, Value};

pub use error::{Error, Result, RuntimeError};
pub use frame::CallFrame;
pub use stack::ValueStack;

/// VM construction parameters. Defaults match the reference
/// configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Value stack capacity (slots). Overflow is a hard error.
    pub stack_size: usize,
    /// Call frame capacity. Overflow is a hard error.
    pub frame_stack_size: usize,
    /// Bytes allocated between collections.
    pub gc_threshold: usize,
    /// Calls before a function is handed to the JIT.
    pub jit_threshold: u32,
    /// Whether the JIT is used at all.
    pub enable_jit: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_size: 8192,
            frame_stack_size: 256,
            gc_threshold: 1024 * 1024,
            jit_threshold: 100,
            enable_jit: true,
        }
    }
}

/// One execution context: a value stack, its frames and the upvalues
/// still pointing into it. The VM runs exactly one; coroutines own
/// parked ones.
#[derive(Debug)]
pub struct ExecState {
    pub(crate) stack: ValueStack,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) open_upvalues: Vec<Handle>,
}

impl ExecState {
    pub(crate) fn new(stack_size: usize) -> Self {
        ExecState {
            stack: ValueStack::new(stack_size),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
        }
    }

    /// Heap handles reachable from this context; GC roots.
    pub(crate) fn gc_handles(&self) -> Vec<Handle> {
        let mut out: Vec<Handle> = self.stack.iter().filter_map(|v| v.handle()).collect();
        out.extend(self.frames.iter().map(|f| f.closure));
        out.extend(self.open_upvalues.iter().copied());
        out
    }

    pub(crate) fn size_bytes(&self) -> usize {
        self.stack.len() * std::mem::size_of::<Value>()
            + self.frames.len() * std::mem::size_of::<CallFrame>()
    }

    fn clear(&mut self) {
        self.stack.truncate(0);
        self.frames.clear();
        self.open_upvalues.clear();
    }
}

/// Marks one `dispatch_loop` entry: where the loop should hand control
/// back to Rust.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopEntry {
    /// Frame depth at which a `Return` exits the loop.
    pub watermark: usize,
    /// Coroutine nesting at entry; a yield below this depth would cross
    /// a native boundary and is an error.
    pub coro_depth: usize,
}

/// How a call dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    /// A frame was pushed (or a coroutine swapped in); the dispatch loop
    /// produces the result.
    Frame,
    /// The call completed synchronously and its result is on the stack.
    Immediate,
}

/// The Quill virtual machine.
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) heap: Heap,
    pub(crate) strings: Interner,
    pub(crate) state: ExecState,
    /// Parked execution states of resume callers, innermost last.
    pub(crate) resumers: Vec<ExecState>,
    /// Coroutines currently running, innermost last.
    pub(crate) active_coros: Vec<Handle>,
    /// One entry per live `dispatch_loop` invocation.
    pub(crate) loop_entries: Vec<LoopEntry>,
    /// Native JIT activations, counted against the frame budget.
    pub(crate) jit_frames: usize,
    /// Error detail stashed by JIT runtime helpers.
    pub(crate) jit_error: Option<RuntimeError>,
    globals: Handle,
    last_error: Option<String>,
}

impl Vm {
    /// Create a VM with the given configuration.
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new(config.gc_threshold);
        let globals = heap.alloc_table(Table::with_capacity(64));
        Vm {
            state: ExecState::new(config.stack_size),
            resumers: Vec::new(),
            active_coros: Vec::new(),
            loop_entries: Vec::new(),
            jit_frames: 0,
            jit_error: None,
            strings: Interner::new(),
            heap,
            globals,
            config,
            last_error: None,
        }
    }

    /// Clear stack, frames, coroutine state and the error slot without
    /// reallocating. Globals and the heap survive.
    pub fn reset(&mut self) {
        self.state.clear();
        self.resumers.clear();
        self.active_coros.clear();
        self.loop_entries.clear();
        self.jit_frames = 0;
        self.jit_error = None;
        self.last_error = None;
    }

    // =========================================================================
    // Compilation
    // =========================================================================

    /// Compile source to a callable function of arity 0.
    pub fn compile(
        &mut self,
        source: &str,
        name: &str,
    ) -> std::result::Result<Function, CompileError> {
        let program = Parser::parse_source(source)?;
        compile_program(&program, name, &mut self.strings)
    }

    /// Convenience wrapper: read and compile a file.
    pub fn compile_file(
        &mut self,
        path: impl AsRef<std::path::Path>,
    ) -> std::result::Result<Function, CompileError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| CompileError {
            message: format!("Cannot read {}: {}", path.display(), e),
            line: 0,
            column: 0,
        })?;
        let name = path.to_string_lossy().into_owned();
        self.compile(&source, &name)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run a compiled function to completion.
    pub fn run(&mut self, function: &Function) -> Result<Value> {
        self.last_error = None;
        let result = self.run_inner(function);
        self.note_error(result)
    }

    fn run_inner(&mut self, function: &Function) -> Result<Value> {
        let handle = self.heap.alloc_function(Rc::clone(function), Vec::new());
        let watermark = self.state.frames.len();
        let coro_depth = self.active_coros.len();
        self.state.stack.push(Value::Function(handle))?;
        match self.call_stack_top(0)? {
            Dispatched::Frame => self.run_loop(watermark, coro_depth),
            Dispatched::Immediate => self.state.stack.pop(),
        }
    }

    /// Call a callable value with arguments.
    pub fn call(&mut self, callable: Value, args: &[Value]) -> Result<Value> {
        self.last_error = None;
        let result = self.call_inner(callable, args);
        self.note_error(result)
    }

    fn call_inner(&mut self, callable: Value, args: &[Value]) -> Result<Value> {
        let watermark = self.state.frames.len();
        let coro_depth = self.active_coros.len();
        self.state.stack.push(callable)?;
        for arg in args {
            self.state.stack.push(arg.clone())?;
        }
        match self.call_stack_top(args.len())? {
            Dispatched::Frame => self.run_loop(watermark, coro_depth),
            Dispatched::Immediate => self.state.stack.pop(),
        }
    }

    /// Compile and run in one step.
    pub fn eval(&mut self, source: &str) -> std::result::Result<Value, Error> {
        let function = self.compile(source, "<eval>")?;
        Ok(self.run(&function)?)
    }

    /// Message of the most recent runtime error, with source position.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn note_error(&mut self, result: Result<Value>) -> Result<Value> {
        if let Err(err) = &result {
            let position = self
                .error_position()
                .map(|li| format!(" at {}:{}", li.line, li.column))
                .unwrap_or_default();
            self.last_error = Some(format!("{}{}", err, position));
        }
        result
    }

    fn error_position(&self) -> Option<LineInfo> {
        let frame = self.state.frames.last()?;
        frame.proto.chunk.line_info(frame.ip.saturating_sub(1))
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    pub(crate) fn run_loop(&mut self, watermark: usize, coro_depth: usize) -> Result<Value> {
        self.loop_entries.push(LoopEntry {
            watermark,
            coro_depth,
        });
        let result = self.dispatch_loop();
        self.loop_entries.pop();
        result
    }

    fn dispatch_loop(&mut self) -> Result<Value> {
        use crate::opcode::OpCode;

        loop {
            // GC safe point: all live objects are reachable from the
            // root set here.
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let op = self.read_op()?;

            #[cfg(feature = "op_trace")]
            {
                let frame = self.state.frames.last().unwrap();
                log::trace!(
                    "[{}] {:>4} {:?}",
                    frame.proto.name_str(),
                    frame.ip - 1,
                    op
                );
            }

            match op {
                // Constants & stack, handled inline.
                OpCode::Const(idx) => {
                    let value = self.constant_value(idx)?;
                    self.state.stack.push(value)?;
                }
                OpCode::Nil => self.state.stack.push(Value::Nil)?,
                OpCode::True => self.state.stack.push(Value::Bool(true))?,
                OpCode::False => self.state.stack.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.state.stack.pop()?;
                }
                OpCode::Dup => {
                    let value = self.state.stack.peek(0)?;
                    self.state.stack.push(value)?;
                }
                OpCode::Not => {
                    let value = self.state.stack.pop()?;
                    self.state.stack.push(Value::Bool(!value.is_truthy()))?;
                }

                // Equality is type-generic; ordering lives in the
                // arithmetic handler.
                OpCode::Eq => {
                    let b = self.state.stack.pop()?;
                    let a = self.state.stack.pop()?;
                    self.state.stack.push(Value::Bool(a == b))?;
                }
                OpCode::Ne => {
                    let b = self.state.stack.pop()?;
                    let a = self.state.stack.pop()?;
                    self.state.stack.push(Value::Bool(a != b))?;
                }

                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow
                | OpCode::Negate
                | OpCode::Lt
                | OpCode::Le
                | OpCode::Gt
                | OpCode::Ge => self.execute_arithmetic(op)?,

                OpCode::GetLocal(_)
                | OpCode::SetLocal(_)
                | OpCode::GetGlobal(_)
                | OpCode::SetGlobal(_)
                | OpCode::DefineGlobal(_)
                | OpCode::GetUpvalue(_)
                | OpCode::SetUpvalue(_) => self.execute_variables(op)?,

                OpCode::NewTable(_) | OpCode::GetField | OpCode::SetField => {
                    self.execute_tables(op)?
                }

                OpCode::Jump(offset) => self.jump(offset)?,
                OpCode::JumpIfFalse(offset) => {
                    if !self.state.stack.peek(0)?.is_truthy() {
                        self.jump(offset)?;
                    }
                }
                OpCode::JumpIfTrue(offset) => {
                    if self.state.stack.peek(0)?.is_truthy() {
                        self.jump(offset)?;
                    }
                }
                OpCode::PopJumpIfFalse(offset) => {
                    if !self.state.stack.pop()?.is_truthy() {
                        self.jump(offset)?;
                    }
                }

                OpCode::Call(argc) => {
                    self.call_stack_top(argc as usize)?;
                }

                OpCode::Closure(idx) => self.execute_closure(idx)?,
                OpCode::CaptureLocal(_) | OpCode::CaptureUpvalue(_) => {
                    return Err(RuntimeError::Internal(
                        "capture instruction outside closure context".into(),
                    ));
                }
                OpCode::CloseUpvalue => {
                    let slot = self.state.stack.len().saturating_sub(1);
                    self.close_upvalues(slot)?;
                    self.state.stack.pop()?;
                }

                OpCode::Return => {
                    let result = self.state.stack.pop()?;
                    let frame = self
                        .state
                        .frames
                        .pop()
                        .ok_or_else(|| RuntimeError::Internal("return with no frame".into()))?;
                    self.close_upvalues(frame.base)?;
                    self.state.stack.truncate(frame.base);

                    let entry = *self
                        .loop_entries
                        .last()
                        .expect("dispatch loop without entry");
                    if self.active_coros.len() > entry.coro_depth {
                        if self.state.frames.is_empty() {
                            // The coroutine's outermost frame returned.
                            if let Some(value) = self.finish_coroutine(result)? {
                                return Ok(value);
                            }
                        } else {
                            self.state.stack.push(result)?;
                        }
                    } else if self.state.frames.len() == entry.watermark {
                        return Ok(result);
                    } else {
                        self.state.stack.push(result)?;
                    }
                }

                OpCode::Yield => {
                    if let Some(value) = self.execute_yield()? {
                        return Ok(value);
                    }
                }
                OpCode::Resume => self.execute_resume_op()?,
            }
        }
    }

    fn read_op(&mut self) -> Result<crate::opcode::OpCode> {
        let frame = self
            .state
            .frames
            .last_mut()
            .ok_or_else(|| RuntimeError::Internal("no active frame".into()))?;
        let op = frame
            .proto
            .chunk
            .code
            .get(frame.ip)
            .copied()
            .ok_or_else(|| RuntimeError::Internal("instruction pointer out of bounds".into()))?;
        frame.ip += 1;
        Ok(op)
    }

    pub(crate) fn frame(&self) -> &CallFrame {
        self.state.frames.last().expect("no active frame")
    }

    pub(crate) fn constant_value(&self, idx: u16) -> Result<Value> {
        let frame = self.frame();
        match frame.proto.chunk.constants.get(idx as usize) {
            Some(Constant::Nil) => Ok(Value::Nil),
            Some(Constant::Bool(b)) => Ok(Value::Bool(*b)),
            Some(Constant::Number(n)) => Ok(Value::Number(*n)),
            Some(Constant::Str(s)) => Ok(Value::Str(s.clone())),
            Some(Constant::Proto(_)) => Err(RuntimeError::Internal(
                "prototype constant loaded as value".into(),
            )),
            None => Err(RuntimeError::Internal(
                "constant index out of bounds".into(),
            )),
        }
    }

    pub(crate) fn constant_str(&self, idx: u16) -> Result<Str> {
        match self.frame().proto.chunk.constants.get(idx as usize) {
            Some(Constant::Str(s)) => Ok(s.clone()),
            _ => Err(RuntimeError::Internal(
                "expected string constant".into(),
            )),
        }
    }

    pub(crate) fn jump(&mut self, offset: i16) -> Result<()> {
        let frame = self
            .state
            .frames
            .last_mut()
            .ok_or_else(|| RuntimeError::Internal("jump with no frame".into()))?;
        let new_ip = frame.ip as i64 + offset as i64;
        if new_ip < 0 {
            return Err(RuntimeError::Internal(
                "jump produced a negative instruction pointer".into(),
            ));
        }
        frame.ip = new_ip as usize;
        Ok(())
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Force a full stop-the-world collection cycle.
    pub fn collect_garbage(&mut self) {
        self.heap.mark(self.globals);

        let mut roots = self.state.gc_handles();
        for parked in &self.resumers {
            roots.extend(parked.gc_handles());
        }
        roots.extend(self.active_coros.iter().copied());
        for handle in roots {
            self.heap.mark(handle);
        }

        self.heap.trace_references();
        let freed = self.heap.sweep();
        let pruned = self.strings.prune();
        self.heap.adjust_threshold(self.config.gc_threshold);

        log::debug!(
            "gc: freed {} objects, pruned {} strings, {} live, {} bytes",
            freed,
            pruned,
            self.heap.live_objects,
            self.heap.bytes_allocated
        );
    }

    /// Collector statistics.
    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    // =========================================================================
    // Stack protocol for native functions
    // =========================================================================

    /// Push a value onto the VM stack.
    pub fn push(&mut self, value: Value) -> Result<()> {
        self.state.stack.push(value)
    }

    /// Pop a value from the VM stack.
    pub fn pop(&mut self) -> Result<Value> {
        self.state.stack.pop()
    }

    /// Peek at the stack; `distance` counts down from the top.
    pub fn peek(&self, distance: usize) -> Result<Value> {
        self.state.stack.peek(distance)
    }

    /// Current stack top index.
    pub fn stack_top(&self) -> usize {
        self.state.stack.len()
    }

    /// Truncate the stack to `top` slots.
    pub fn set_stack_top(&mut self, top: usize) -> Result<()> {
        if top > self.state.stack.len() {
            return Err(RuntimeError::StackUnderflow);
        }
        self.state.stack.truncate(top);
        Ok(())
    }

    // =========================================================================
    // Globals & values
    // =========================================================================

    /// Intern a string in this VM.
    pub fn intern(&mut self, text: &str) -> Str {
        self.strings.intern(text)
    }

    /// Make a string value.
    pub fn new_string(&mut self, text: &str) -> Value {
        Value::Str(self.strings.intern(text))
    }

    /// Allocate an empty table.
    pub fn new_table(&mut self) -> Value {
        Value::Table(self.heap.alloc_table(Table::new()))
    }

    /// Wrap host data for scripts to carry around opaquely.
    pub fn new_userdata(&mut self, data: Box<dyn std::any::Any>) -> Value {
        Value::Userdata(self.heap.alloc_userdata(data))
    }

    /// Borrow the host data inside a userdata value.
    pub fn userdata(&self, value: &Value) -> Option<&dyn std::any::Any> {
        match value {
            Value::Userdata(handle) => self.heap.get_userdata(*handle),
            _ => None,
        }
    }

    /// Set a global by name.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let key = self.strings.intern(name);
        self.heap
            .get_table_mut(self.globals)
            .expect("globals table")
            .insert(key, value);
    }

    /// Get a global by name. Missing globals read as nil.
    pub fn get_global(&mut self, name: &str) -> Value {
        let key = self.strings.intern(name);
        self.heap
            .get_table(self.globals)
            .and_then(|t| t.get(&key).cloned())
            .unwrap_or(Value::Nil)
    }

    /// Whether a global with this name exists.
    pub fn has_global(&mut self, name: &str) -> bool {
        let key = self.strings.intern(name);
        self.heap
            .get_table(self.globals)
            .map(|t| t.contains_key(&key))
            .unwrap_or(false)
    }

    /// Register a native function as a global.
    pub fn bind_native(&mut self, name: &str, function: NativeFn) {
        self.set_global(name, Value::Native(function));
    }

    pub(crate) fn globals_handle(&self) -> Handle {
        self.globals
    }

    /// Render a value for display.
    pub fn render(&self, value: &Value) -> String {
        value.display(&self.heap)
    }

    // =========================================================================
    // Table access for the embedding host
    // =========================================================================

    /// Set `table[key] = value`.
    pub fn table_set(&mut self, table: &Value, key: &str, value: Value) -> Result<()> {
        let handle = self.expect_table(table)?;
        let key = self.strings.intern(key);
        self.heap
            .get_table_mut(handle)
            .ok_or_else(|| RuntimeError::Internal("stale table handle".into()))?
            .insert(key, value);
        Ok(())
    }

    /// Get `table[key]`; nil when absent.
    pub fn table_get(&mut self, table: &Value, key: &str) -> Result<Value> {
        let handle = self.expect_table(table)?;
        let key = self.strings.intern(key);
        Ok(self
            .heap
            .get_table(handle)
            .and_then(|t| t.get(&key).cloned())
            .unwrap_or(Value::Nil))
    }

    /// Whether `table` has `key`.
    pub fn table_has(&mut self, table: &Value, key: &str) -> Result<bool> {
        let handle = self.expect_table(table)?;
        let key = self.strings.intern(key);
        Ok(self
            .heap
            .get_table(handle)
            .map(|t| t.contains_key(&key))
            .unwrap_or(false))
    }

    /// Remove `table[key]`, returning the removed value if any.
    pub fn table_remove(&mut self, table: &Value, key: &str) -> Result<Option<Value>> {
        let handle = self.expect_table(table)?;
        let key = self.strings.intern(key);
        Ok(self
            .heap
            .get_table_mut(handle)
            .and_then(|t| t.remove(&key)))
    }

    /// Number of entries in a table.
    pub fn table_len(&self, table: &Value) -> Result<usize> {
        let handle = self.expect_table(table)?;
        Ok(self.heap.get_table(handle).map(|t| t.len()).unwrap_or(0))
    }

    fn expect_table(&self, value: &Value) -> Result<Handle> {
        match value {
            Value::Table(handle) => Ok(*handle),
            other => Err(RuntimeError::TypeError {
                expected: "table".into(),
                got: other.type_name().into(),
            }),
        }
    }

    // =========================================================================
    // Coroutines
    // =========================================================================

    /// Create a suspended coroutine from a function value. The function
    /// must take zero or one parameter; the first resume argument is
    /// passed to it.
    pub fn create_coroutine(&mut self, function: Value) -> Result<Value> {
        match &function {
            Value::Function(handle) => {
                let arity = self
                    .heap
                    .get_function(*handle)
                    .ok_or_else(|| RuntimeError::Internal("stale function handle".into()))?
                    .proto
                    .arity;
                if arity > 1 {
                    return Err(RuntimeError::ArityError {
                        expected: arity as usize,
                        got: 1,
                    });
                }
            }
            other => {
                return Err(RuntimeError::TypeError {
                    expected: "function".into(),
                    got: other.type_name().into(),
                });
            }
        }
        let mut state = ExecState::new(self.config.stack_size);
        state
            .stack
            .push(function)
            .expect("fresh coroutine stack cannot overflow");
        Ok(Value::Coroutine(self.heap.alloc_coroutine(state)))
    }

    /// Resume a coroutine and block until it yields, returns or errors.
    pub fn resume(&mut self, coroutine: &Value, arg: Value) -> Result<Value> {
        self.last_error = None;
        let handle = match coroutine {
            Value::Coroutine(handle) => *handle,
            other => {
                return Err(RuntimeError::TypeError {
                    expected: "coroutine".into(),
                    got: other.type_name().into(),
                });
            }
        };
        let watermark = self.state.frames.len();
        let coro_depth = self.active_coros.len();
        let result = self
            .resume_value(handle, arg)
            .and_then(|_| self.run_loop(watermark, coro_depth));
        self.note_error(result)
    }

    /// Status of a coroutine value.
    pub fn coroutine_status(&self, coroutine: &Value) -> Option<CoroutineStatus> {
        match coroutine {
            Value::Coroutine(handle) => self.heap.get_coroutine(*handle).map(|c| c.status),
            _ => None,
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}

// quill-embed - Engine implementation
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! The Engine struct - main entry point for embedding Quill.

use std::path::Path;

use quill_vm::{
    CompileError, CoroutineStatus, Error, Function, GcStats, NativeFn, Value, Vm, VmConfig,
};

use crate::convert::{FromQuillVal, IntoQuillVal};

/// The Quill scripting engine.
///
/// `Engine` wraps a [`Vm`] in a high-level interface for evaluating
/// Quill code, registering Rust functions and moving values across the
/// boundary.
///
/// # Thread Safety
///
/// **`Engine` is NOT thread-safe.** The VM uses `Rc` and interior
/// mutability internally. Do not share an `Engine` between threads;
/// separate `Engine` instances are fully independent (each has its own
/// string table) and may live on different threads.
pub struct Engine {
    vm: Vm,
}

impl Engine {
    /// Create an engine with the default VM configuration.
    pub fn new() -> Self {
        Engine { vm: Vm::default() }
    }

    /// Create an engine with an explicit VM configuration.
    pub fn with_config(config: VmConfig) -> Self {
        Engine {
            vm: Vm::new(config),
        }
    }

    /// Evaluate a string of Quill code, returning the value of the
    /// final expression statement (or nil).
    pub fn eval(&mut self, source: &str) -> Result<Value, Error> {
        self.vm.eval(source)
    }

    /// Evaluate and convert the result to a Rust type.
    pub fn eval_as<T: FromQuillVal>(&mut self, source: &str) -> Result<T, Error> {
        let value = self.vm.eval(source)?;
        T::from_quill(&value, &self.vm).map_err(Error::Runtime)
    }

    /// Evaluate a file of Quill code.
    pub fn eval_file(&mut self, path: impl AsRef<Path>) -> Result<Value, Error> {
        let function = self.vm.compile_file(path)?;
        Ok(self.vm.run(&function)?)
    }

    /// Compile source without running it.
    pub fn compile(&mut self, source: &str, name: &str) -> Result<Function, CompileError> {
        self.vm.compile(source, name)
    }

    /// Run a previously compiled function.
    pub fn run(&mut self, function: &Function) -> Result<Value, Error> {
        Ok(self.vm.run(function)?)
    }

    /// Call a global function by name.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let callable = self.vm.get_global(name);
        Ok(self.vm.call(callable, args)?)
    }

    /// Get a global by name; nil when absent.
    pub fn get(&mut self, name: &str) -> Value {
        self.vm.get_global(name)
    }

    /// Get a global converted to a Rust type. `None` when the global is
    /// missing or has the wrong type.
    pub fn get_as<T: FromQuillVal>(&mut self, name: &str) -> Option<T> {
        let value = self.vm.get_global(name);
        T::from_quill(&value, &self.vm).ok()
    }

    /// Set a global by name.
    pub fn set(&mut self, name: &str, value: impl IntoQuillVal) {
        let value = value.into_quill(&mut self.vm);
        self.vm.set_global(name, value);
    }

    /// Whether a global exists.
    pub fn has(&mut self, name: &str) -> bool {
        self.vm.has_global(name)
    }

    /// Register a native Rust function as a global.
    pub fn register_native(&mut self, name: &str, function: NativeFn) {
        self.vm.bind_native(name, function);
    }

    /// Create a suspended coroutine from a function value.
    pub fn create_coroutine(&mut self, function: Value) -> Result<Value, Error> {
        Ok(self.vm.create_coroutine(function)?)
    }

    /// Resume a coroutine, blocking until it yields or returns.
    pub fn resume(&mut self, coroutine: &Value, arg: impl IntoQuillVal) -> Result<Value, Error> {
        let arg = arg.into_quill(&mut self.vm);
        Ok(self.vm.resume(coroutine, arg)?)
    }

    /// Status of a coroutine value.
    pub fn coroutine_status(&self, coroutine: &Value) -> Option<CoroutineStatus> {
        self.vm.coroutine_status(coroutine)
    }

    /// Force a garbage collection cycle.
    pub fn collect_garbage(&mut self) {
        self.vm.collect_garbage();
    }

    /// Collector statistics.
    pub fn gc_stats(&self) -> GcStats {
        self.vm.gc_stats()
    }

    /// Serialise the globals table (hot-reload support).
    pub fn save_state(&self) -> Result<String, Error> {
        Ok(self.vm.save_state()?)
    }

    /// Restore globals from a prior [`Engine::save_state`].
    pub fn load_state(&mut self, data: &str) -> Result<(), Error> {
        Ok(self.vm.load_state(data)?)
    }

    /// Clear execution state after a runtime error.
    pub fn reset(&mut self) {
        self.vm.reset();
    }

    /// Render a value for display.
    pub fn render(&self, value: &Value) -> String {
        self.vm.render(value)
    }

    /// Direct access to the underlying VM for advanced use.
    pub fn vm(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

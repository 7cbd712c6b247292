// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Tracing garbage collection over the object heap.
//!
//! Synchronous stop-the-world mark-sweep: the VM marks its roots (value
//! stack, frames, globals, open upvalues, parked coroutine resumers),
//! `trace_references` drains the grey worklist, and `sweep` frees every
//! unmarked slot onto the free list. Interned strings are `Rc`-owned and
//! pruned from the intern table afterwards when nothing else references
//! them.

use crate::heap::{Handle, Heap, Object, UpvalueState};
use crate::value::Value;

/// Collector statistics, queryable through the VM.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Cumulative bytes handed out by the heap.
    pub bytes_allocated: usize,
    /// Cumulative bytes released by sweeps.
    pub bytes_freed: usize,
    /// Number of completed collections.
    pub collections: u64,
    /// Objects currently live on the heap.
    pub live_objects: usize,
}

impl Object {
    /// Handles directly reachable from this object.
    fn children(&self) -> Vec<Handle> {
        match self {
            Object::Table(table) => {
                let mut out: Vec<Handle> =
                    table.iter().filter_map(|(_, v)| v.handle()).collect();
                if let Some(meta) = table.metatable {
                    out.push(meta);
                }
                out
            }
            Object::Function(func) => func.upvalues.clone(),
            Object::Upvalue(upvalue) => match &upvalue.state {
                // Open upvalues point into a stack, which is traced as a
                // root by whichever execution state owns it.
                UpvalueState::Open(_) => Vec::new(),
                UpvalueState::Closed(value) => value.handle().into_iter().collect(),
            },
            Object::Coroutine(coro) => match &coro.saved {
                Some(state) => state.gc_handles(),
                None => Vec::new(),
            },
            Object::Userdata(_) => Vec::new(),
        }
    }
}

impl Heap {
    /// Mark a handle reachable and queue it for tracing.
    pub(crate) fn mark(&mut self, handle: Handle) {
        if self.marked.contains(&handle.index()) {
            return;
        }
        if self.get(handle).is_some() {
            self.marked.insert(handle.index());
            self.grey.push(handle);
        }
    }

    /// Mark the handle carried by a value, if any.
    pub(crate) fn mark_value(&mut self, value: &Value) {
        if let Some(handle) = value.handle() {
            self.mark(handle);
        }
    }

    /// Drain the grey worklist, marking everything transitively
    /// reachable.
    pub(crate) fn trace_references(&mut self) {
        while let Some(handle) = self.grey.pop() {
            let children = match self.get(handle) {
                Some(obj) => obj.children(),
                None => Vec::new(),
            };
            for child in children {
                self.mark(child);
            }
        }
    }

    /// Free every unmarked object and reset mark state for the next
    /// cycle. Returns the number of objects freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut freed_bytes = 0;
        for idx in 0..self.objects.len() {
            if self.marked.contains(&idx) {
                continue;
            }
            if let Some(obj) = self.objects[idx].take() {
                freed_bytes += obj.size_bytes();
                freed += 1;
                self.free_list.push(idx);
            }
        }
        self.marked.clear();
        self.bytes_freed += freed_bytes;
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.live_objects -= freed;
        self.collections += 1;
        freed
    }

    /// Recompute the allocation threshold after a collection.
    pub(crate) fn adjust_threshold(&mut self, gc_threshold: usize) {
        self.next_gc = self.bytes_allocated + gc_threshold;
    }

    pub(crate) fn stats(&self) -> GcStats {
        GcStats {
            bytes_allocated: self.bytes_allocated,
            bytes_freed: self.bytes_freed,
            collections: self.collections,
            live_objects: self.live_objects,
        }
    }
}

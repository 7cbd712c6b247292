// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! The object heap.
//!
//! Mutable, potentially-cyclic runtime objects (tables, closures,
//! upvalues, coroutines, userdata) live in a slot heap indexed by
//! [`Handle`] and are reclaimed by the tracing collector in [`crate::gc`].
//! Immutable, acyclic data (interned strings, function prototypes) is
//! `Rc`-owned and never enters this heap.

use std::any::Any;
use std::collections::HashSet;
use std::rc::Rc;

use crate::chunk::FunctionProto;
use crate::table::Table;
use crate::value::Value;
use crate::vm::ExecState;

/// A handle to a heap-allocated object: an index into the heap's slot
/// storage. Handles stay valid until the object becomes unreachable and a
/// collection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// State of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created or yielded; may be resumed.
    Suspended,
    /// Currently executing.
    Running,
    /// Returned from its outermost frame; may not be resumed.
    Dead,
}

impl std::fmt::Display for CoroutineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoroutineStatus::Suspended => write!(f, "suspended"),
            CoroutineStatus::Running => write!(f, "running"),
            CoroutineStatus::Dead => write!(f, "dead"),
        }
    }
}

/// A captured variable.
///
/// Open while the owning frame is live (points at a live stack slot);
/// closed (owning a copied value) afterwards. Exactly one upvalue object
/// exists per captured stack slot, shared by every closure capturing it.
#[derive(Debug)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Upvalue {
    pub state: UpvalueState,
}

/// A runtime closure: a shared prototype plus its bound upvalues.
#[derive(Debug)]
pub struct ScriptFn {
    pub proto: Rc<FunctionProto>,
    pub upvalues: Vec<Handle>,
}

/// A coroutine: a parked execution state (its own value stack, frame
/// stack and open-upvalue list) plus a status. While the coroutine runs,
/// its state is swapped into the VM and `saved` is `None`.
#[derive(Debug)]
pub struct Coroutine {
    pub status: CoroutineStatus,
    pub saved: Option<ExecState>,
}

/// A heap object.
pub enum Object {
    Table(Table),
    Function(ScriptFn),
    Upvalue(Upvalue),
    Coroutine(Coroutine),
    Userdata(Box<dyn Any>),
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Object::Table(t) => write!(f, "Table(len={})", t.len()),
            Object::Function(func) => write!(f, "Function({:?})", func.proto.name),
            Object::Upvalue(u) => write!(f, "Upvalue({:?})", u.state),
            Object::Coroutine(c) => write!(f, "Coroutine({})", c.status),
            Object::Userdata(_) => write!(f, "Userdata"),
        }
    }
}

impl Object {
    /// Rough footprint for GC accounting.
    pub(crate) fn size_bytes(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        match self {
            Object::Table(t) => base + t.size_bytes(),
            Object::Function(f) => base + f.upvalues.len() * std::mem::size_of::<Handle>(),
            Object::Upvalue(_) => base,
            Object::Coroutine(c) => {
                base + c
                    .saved
                    .as_ref()
                    .map(|s| s.size_bytes())
                    .unwrap_or(0)
            }
            Object::Userdata(_) => base,
        }
    }
}

/// The object heap: slot storage with a free list, plus the mark state
/// used by the collector.
pub struct Heap {
    pub(crate) objects: Vec<Option<Object>>,
    pub(crate) free_list: Vec<usize>,
    pub(crate) marked: HashSet<usize>,
    pub(crate) grey: Vec<Handle>,

    pub(crate) bytes_allocated: usize,
    pub(crate) bytes_freed: usize,
    pub(crate) next_gc: usize,
    pub(crate) live_objects: usize,
    pub(crate) collections: u64,
}

impl Heap {
    pub fn new(gc_threshold: usize) -> Self {
        Heap {
            objects: Vec::new(),
            free_list: Vec::new(),
            marked: HashSet::new(),
            grey: Vec::new(),
            bytes_allocated: 0,
            bytes_freed: 0,
            next_gc: gc_threshold,
            live_objects: 0,
            collections: 0,
        }
    }

    pub(crate) fn alloc(&mut self, obj: Object) -> Handle {
        self.bytes_allocated += obj.size_bytes();
        self.live_objects += 1;
        if let Some(idx) = self.free_list.pop() {
            self.objects[idx] = Some(obj);
            Handle(idx)
        } else {
            let idx = self.objects.len();
            self.objects.push(Some(obj));
            Handle(idx)
        }
    }

    pub fn alloc_table(&mut self, table: Table) -> Handle {
        self.alloc(Object::Table(table))
    }

    pub fn alloc_function(&mut self, proto: Rc<FunctionProto>, upvalues: Vec<Handle>) -> Handle {
        self.alloc(Object::Function(ScriptFn { proto, upvalues }))
    }

    pub fn alloc_upvalue(&mut self, slot: usize) -> Handle {
        self.alloc(Object::Upvalue(Upvalue {
            state: UpvalueState::Open(slot),
        }))
    }

    pub fn alloc_coroutine(&mut self, state: ExecState) -> Handle {
        self.alloc(Object::Coroutine(Coroutine {
            status: CoroutineStatus::Suspended,
            saved: Some(state),
        }))
    }

    pub fn alloc_userdata(&mut self, data: Box<dyn Any>) -> Handle {
        self.alloc(Object::Userdata(data))
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&Object> {
        self.objects.get(handle.0).and_then(|o| o.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut Object> {
        self.objects.get_mut(handle.0).and_then(|o| o.as_mut())
    }

    pub fn get_table(&self, handle: Handle) -> Option<&Table> {
        match self.get(handle)? {
            Object::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn get_table_mut(&mut self, handle: Handle) -> Option<&mut Table> {
        match self.get_mut(handle)? {
            Object::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn get_function(&self, handle: Handle) -> Option<&ScriptFn> {
        match self.get(handle)? {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn get_upvalue(&self, handle: Handle) -> Option<&Upvalue> {
        match self.get(handle)? {
            Object::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn get_upvalue_mut(&mut self, handle: Handle) -> Option<&mut Upvalue> {
        match self.get_mut(handle)? {
            Object::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn get_coroutine(&self, handle: Handle) -> Option<&Coroutine> {
        match self.get(handle)? {
            Object::Coroutine(c) => Some(c),
            _ => None,
        }
    }

    pub fn get_coroutine_mut(&mut self, handle: Handle) -> Option<&mut Coroutine> {
        match self.get_mut(handle)? {
            Object::Coroutine(c) => Some(c),
            _ => None,
        }
    }

    pub fn get_userdata(&self, handle: Handle) -> Option<&dyn Any> {
        match self.get(handle)? {
            Object::Userdata(d) => Some(d.as_ref()),
            _ => None,
        }
    }

    /// True once cumulative allocation has crossed the GC threshold.
    #[inline]
    pub(crate) fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }
}

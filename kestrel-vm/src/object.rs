// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Heap object kinds.
//!
//! Every heap object is an [`Obj`]: a mark bit plus a sum-typed body.
//! Class instances and struct literals share one kind, distinguished by a
//! nullable class pointer. Objects are owned by the collector and reached
//! through raw pointers embedded in [`Value`]s; `trace` enqueues every
//! owned pointer onto the collector's gray stack and `size` reports the
//! bytes charged against the heap.

use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use ahash::AHashMap;

use crate::natives::NativeFn;
use crate::value::Value;

/// Worklist of objects waiting to be traced.
pub type GrayStack = Vec<NonNull<Obj>>;

pub struct Obj {
    pub marked: bool,
    pub body: ObjBody,
}

pub enum ObjBody {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Native(ObjNative),
    BoundNative(ObjBoundNative),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Array(ObjArray),
    File(ObjFile),
    Mutex(ObjMutex),
    Future(ObjFuture),
}

/// Immutable UTF-8 text, interned by content in the collector.
pub struct ObjString {
    pub text: String,
}

/// Compiled function metadata; the code itself lives in the shared
/// bytecode buffer at `bytecode_offset`.
pub struct ObjFunction {
    pub name: String,
    pub arity: u8,
    pub upvalue_count: u8,
    pub bytecode_offset: usize,
    pub constants_offset: usize,
}

pub struct ObjClosure {
    /// Points at an `ObjFunction`.
    pub function: NonNull<Obj>,
    /// One `ObjUpvalue` per captured variable.
    pub upvalues: Vec<NonNull<Obj>>,
}

/// A captured local. The capturing rewrite leaves an upvalue-tagged value
/// in the original stack slot, so local reads and writes redirect here.
pub struct ObjUpvalue {
    pub value: Value,
}

pub struct ObjNative {
    pub name: String,
    /// -1 means variadic.
    pub arity: i8,
    pub func: NativeFn,
}

/// A native function bound to a receiver by built-in method lookup.
pub struct ObjBoundNative {
    pub name: String,
    pub arity: i8,
    pub func: NativeFn,
    pub receiver: Value,
}

pub struct ObjClass {
    pub name: String,
    /// Method name to closure value. Superclass methods are snapshotted
    /// in at class declaration, so later superclass edits are invisible.
    pub methods: AHashMap<String, Value>,
}

/// A class instance, or a struct literal when `class` is `None`.
pub struct ObjInstance {
    pub class: Option<NonNull<Obj>>,
    pub fields: AHashMap<String, Value>,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    /// Points at an `ObjClosure`.
    pub method: NonNull<Obj>,
}

pub struct ObjArray {
    pub values: Vec<Value>,
    /// Number of elements currently holding heap pointers; when zero the
    /// collector skips tracing the element vector.
    pub heap_ptr_count: usize,
}

/// Opaque to the core; the native library reads and writes through it.
pub struct ObjFile {
    pub path: String,
    pub handle: Option<std::fs::File>,
}

/// Opaque to the core.
pub struct ObjMutex {
    pub lock: std::sync::Mutex<()>,
}

/// Handle to a child worker: its join handle, its cancel token, and the
/// result cell the worker writes exactly once before exiting.
pub struct ObjFuture {
    pub handle: Option<JoinHandle<()>>,
    pub cancel: Arc<AtomicBool>,
    pub value: Value,
}

impl Obj {
    pub fn new(body: ObjBody) -> Self {
        Self {
            marked: false,
            body,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.body {
            ObjBody::String(_) => "string",
            ObjBody::Function(_) => "function",
            ObjBody::Closure(_) => "function",
            ObjBody::Upvalue(_) => "upvalue",
            ObjBody::Native(_) => "native function",
            ObjBody::BoundNative(_) => "bound native function",
            ObjBody::Class(_) => "class",
            ObjBody::Instance(inst) => {
                if inst.class.is_some() {
                    "instance"
                } else {
                    "struct"
                }
            }
            ObjBody::BoundMethod(_) => "method",
            ObjBody::Array(_) => "array",
            ObjBody::File(_) => "file",
            ObjBody::Mutex(_) => "mutex",
            ObjBody::Future(_) => "future",
        }
    }

    /// Enqueue every value or object this one keeps alive.
    pub fn trace(&self, gray: &mut GrayStack) {
        match &self.body {
            ObjBody::String(_) | ObjBody::Function(_) | ObjBody::Native(_) => {}
            ObjBody::File(_) | ObjBody::Mutex(_) => {}
            ObjBody::Closure(closure) => {
                gray.push(closure.function);
                for &upvalue in &closure.upvalues {
                    gray.push(upvalue);
                }
            }
            ObjBody::Upvalue(upvalue) => mark_value(upvalue.value, gray),
            ObjBody::BoundNative(bound) => mark_value(bound.receiver, gray),
            ObjBody::Class(class) => {
                for &method in class.methods.values() {
                    mark_value(method, gray);
                }
            }
            ObjBody::Instance(instance) => {
                if let Some(class) = instance.class {
                    gray.push(class);
                }
                for &field in instance.fields.values() {
                    mark_value(field, gray);
                }
            }
            ObjBody::BoundMethod(bound) => {
                mark_value(bound.receiver, gray);
                gray.push(bound.method);
            }
            ObjBody::Array(array) => {
                if array.heap_ptr_count > 0 {
                    for &element in &array.values {
                        mark_value(element, gray);
                    }
                }
            }
            ObjBody::Future(future) => mark_value(future.value, gray),
        }
    }

    /// Bytes charged against the heap for this object.
    pub fn size(&self) -> usize {
        let payload = match &self.body {
            ObjBody::String(s) => s.text.capacity(),
            ObjBody::Closure(c) => c.upvalues.capacity() * mem::size_of::<NonNull<Obj>>(),
            ObjBody::Class(c) => c.methods.capacity() * (mem::size_of::<String>() + mem::size_of::<Value>()),
            ObjBody::Instance(i) => i.fields.capacity() * (mem::size_of::<String>() + mem::size_of::<Value>()),
            ObjBody::Array(a) => a.values.capacity() * mem::size_of::<Value>(),
            ObjBody::File(f) => f.path.capacity(),
            _ => 0,
        };
        mem::size_of::<Obj>() + payload
    }

    pub fn string(&self) -> Option<&ObjString> {
        match &self.body {
            ObjBody::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<&ObjFunction> {
        match &self.body {
            ObjBody::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn closure(&self) -> Option<&ObjClosure> {
        match &self.body {
            ObjBody::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn class(&self) -> Option<&ObjClass> {
        match &self.body {
            ObjBody::Class(c) => Some(c),
            _ => None,
        }
    }
}

/// Push the object behind `value` onto the gray stack, if there is one.
#[inline]
pub fn mark_value(value: Value, gray: &mut GrayStack) {
    if value.is_obj() {
        gray.push(value.as_obj());
    }
}

/// Mutable view of the object behind a collector-owned pointer.
///
/// # Safety
///
/// The caller must ensure the object is live and that no other view of it
/// is active. Within the VM that holds by construction: an object is
/// mutated only by the worker executing an instruction on it, and the
/// collector only touches objects while every worker is paused.
#[inline]
pub unsafe fn obj_mut<'a>(ptr: NonNull<Obj>) -> &'a mut Obj {
    unsafe { &mut *ptr.as_ptr() }
}

/// Shared view of the object behind a collector-owned pointer; same
/// liveness contract as [`obj_mut`].
#[inline]
pub unsafe fn obj_ref<'a>(ptr: NonNull<Obj>) -> &'a Obj {
    unsafe { &*ptr.as_ptr() }
}

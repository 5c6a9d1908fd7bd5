// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Native function registration.
//!
//! The native library lives outside the core; it registers free functions
//! by name and per-kind built-in methods here, and the core only knows
//! their names, arities and entry points. A native receives the calling
//! worker and its argument count, manipulates the worker's stack
//! directly, and returns `true` when the callable it was invoked through
//! is still on the stack and should be collapsed away by the VM.

use ahash::AHashMap;

use crate::object::ObjBody;
use crate::value::Value;
use crate::vm::error::Result;
use crate::vm::worker::Worker;

/// A native entry point. `true` tells the VM to collapse the callable
/// slot under the result.
pub type NativeFn = fn(&mut Worker, usize) -> Result<bool>;

/// A registered free native function. Arity -1 means variadic.
#[derive(Clone, Copy)]
pub struct NativeDef {
    pub name: &'static str,
    pub arity: i8,
    pub func: NativeFn,
}

/// The set of free native functions known to the compiler and the VM.
/// Registration order fixes the index `GET_NATIVE` embeds.
#[derive(Default)]
pub struct NativeRegistry {
    defs: Vec<NativeDef>,
    index: AHashMap<&'static str, u16>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, arity: i8, func: NativeFn) {
        let idx = self.defs.len() as u16;
        self.defs.push(NativeDef { name, arity, func });
        self.index.insert(name, idx);
    }

    pub fn lookup(&self, name: &str) -> Option<u16> {
        self.index.get(name).copied()
    }

    pub fn defs(&self) -> &[NativeDef] {
        &self.defs
    }
}

/// Which built-in method table a receiver dispatches through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Common = 0,
    String,
    Array,
    File,
    Mutex,
    Future,
}

const BUILTIN_TABLE_COUNT: usize = 6;

/// One built-in method: entry point plus declared arity (-1 variadic).
/// The receiver is prepended implicitly by binding.
#[derive(Clone, Copy)]
pub struct BuiltinMethod {
    pub arity: i8,
    pub func: NativeFn,
}

/// Per-kind method tables for String, Array, File, Mutex, Future and a
/// Common table for every other receiver.
#[derive(Default)]
pub struct BuiltinTables {
    tables: [AHashMap<&'static str, BuiltinMethod>; BUILTIN_TABLE_COUNT],
}

impl BuiltinTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: BuiltinKind, name: &'static str, arity: i8, func: NativeFn) {
        self.tables[kind as usize].insert(name, BuiltinMethod { arity, func });
    }

    pub fn lookup(&self, kind: BuiltinKind, name: &str) -> Option<BuiltinMethod> {
        self.tables[kind as usize].get(name).copied()
    }

    /// The table a receiver value dispatches through.
    pub fn kind_of(receiver: Value) -> BuiltinKind {
        if !receiver.is_obj() {
            return BuiltinKind::Common;
        }
        match &receiver.obj_ref().body {
            ObjBody::String(_) => BuiltinKind::String,
            ObjBody::Array(_) => BuiltinKind::Array,
            ObjBody::File(_) => BuiltinKind::File,
            ObjBody::Mutex(_) => BuiltinKind::Mutex,
            ObjBody::Future(_) => BuiltinKind::Future,
            _ => BuiltinKind::Common,
        }
    }
}

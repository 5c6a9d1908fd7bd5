// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Call frames.

use std::ptr::NonNull;

use crate::object::Obj;

/// One activation record. `base` indexes the worker's value stack; slot
/// zero of the frame is the callee itself (`this` inside methods).
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    /// Points at an `ObjClosure`.
    pub closure: NonNull<Obj>,
    /// Absolute offset into the shared bytecode buffer.
    pub ip: usize,
    /// First stack slot of this frame.
    pub base: usize,
}

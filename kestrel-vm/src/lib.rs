// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! # kestrel-vm
//!
//! The core of the Kestrel scripting language: a single-pass bytecode
//! compiler over the [`kestrel_ast`] contract, a NaN-boxed stack virtual
//! machine with one OS thread per worker, and a stop-the-world mark-sweep
//! garbage collector coordinated through cooperative safepoints.
//!
//! The front end (lexing, parsing, macros, import resolution) and the
//! native function library live outside this crate; they deliver modules
//! and register natives, and everything in between is here.

pub mod chunk;
pub mod compiler;
pub mod gc;
pub mod natives;
pub mod object;
pub mod opcode;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, Code, LineSpan};
pub use compiler::{Program, compile};
pub use gc::Gc;
pub use natives::{BuiltinKind, BuiltinTables, NativeFn, NativeRegistry};
pub use opcode::OpCode;
pub use value::{Value, ValueKind, values_equal};
pub use vm::{ErrorCode, RuntimeError, Vm, Worker};

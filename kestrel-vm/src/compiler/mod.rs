// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Single-pass bytecode compiler.
//!
//! Modules arrive in dependency order from the external import resolver;
//! each is walked once, emitting into the program-wide code block and
//! populating the global table. Diagnostics accumulate in the caller's
//! [`ErrorSink`](kestrel_ast::ErrorSink); a statement that fails to
//! compile resynchronizes at the next statement boundary.

pub mod codegen;
pub mod emit;
pub mod types;

pub use codegen::{Program, compile};
pub use types::{FuncKind, Global, LOCAL_MAX, SHORT_CONSTANT_LIMIT, UPVALUE_MAX};

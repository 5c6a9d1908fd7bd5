// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Runtime errors.
//!
//! The dispatch loop unwinds with a numeric error code; the outer handler
//! prints the message with a source-mapped frame trace and surfaces the
//! code. A child worker that errors terminates and writes nil to its
//! future.

use std::fmt;

/// Numeric runtime error codes surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Value-stack or frame-stack exhaustion.
    StackOverflow = 1,
    /// Call with the wrong number of arguments.
    Arity = 2,
    /// Operand of the wrong type.
    Type = 3,
    /// Property or method missing on the receiver.
    NameNotFound = 4,
    /// Bytecode operand out of expected range; indicates a compiler bug.
    MalformedBytecode = 6,
    /// Subscript outside an array's bounds.
    IndexRange = 9,
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
}

impl RuntimeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn stack_overflow(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StackOverflow, message)
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Arity, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Type, message)
    }

    pub fn name_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NameNotFound, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedBytecode, message)
    }

    pub fn index_range(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IndexRange, message)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for VM execution.
pub type Result<T> = std::result::Result<T, RuntimeError>;

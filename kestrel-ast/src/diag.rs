// kestrel-ast - AST, token and module contracts for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Structured compile diagnostics.
//!
//! The compiler accumulates diagnostics here and resynchronizes at the
//! next statement boundary, so one pass over a module can surface several
//! errors. Rendering them (colors, source excerpts) is the front end's
//! concern.

use std::fmt;

use crate::token::Token;

/// One compile-time diagnostic: a message anchored to the token that
/// provoked it. System errors (allocation failure, internal invariant
/// breaks) carry no token.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub token: Option<Token>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(tok) => write!(
                f,
                "[line {}] Error at '{}': {}",
                tok.line + 1,
                tok.lexeme,
                self.message
            ),
            None => write!(f, "Error: {}", self.message),
        }
    }
}

/// Accumulator the compiler reports into.
#[derive(Debug, Default)]
pub struct ErrorSink {
    diagnostics: Vec<Diagnostic>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error anchored to a source token.
    pub fn compile_error(&mut self, message: impl Into<String>, token: Token) {
        self.diagnostics.push(Diagnostic {
            message: message.into(),
            token: Some(token),
        });
    }

    /// Record an error with no source anchor.
    pub fn system_error(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            message: message.into(),
            token: None,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

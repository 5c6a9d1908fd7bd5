// kestrel-ast - AST, token and module contracts for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! # kestrel-ast
//!
//! The contract between the external front end (lexer, parser, macro
//! expander, import resolver) and the Kestrel core. The front end delivers
//! [`Module`]s in dependency order, each holding a macro-free tree of
//! [`Stmt`]/[`Expr`] nodes whose leaves are [`Token`]s with source
//! positions. The core reports structured compile diagnostics into an
//! [`ErrorSink`]; presentation is the front end's business.

pub mod ast;
pub mod diag;
pub mod module;
pub mod token;

pub use ast::{Expr, FuncDecl, Stmt, StructEntry, SwitchCase};
pub use diag::{Diagnostic, ErrorSink};
pub use module::{DeclInfo, DeclKind, Dependency, Module};
pub use token::{Token, TokenKind};

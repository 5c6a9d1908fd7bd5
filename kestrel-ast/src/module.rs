// kestrel-ast - AST, token and module contracts for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Module units as delivered by the external import resolver.
//!
//! The resolver topologically orders modules, so a module's dependencies
//! always precede it in the unit list and their global slots are already
//! assigned by the time the importer compiles.

use crate::ast::Stmt;
use crate::token::Token;

/// What kind of top-level declaration a global slot was created for.
/// The compiler rejects assignment to function and class names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Let,
    Function,
    Class,
}

/// A top-level declaration of a module, in source order. The position of
/// a declaration inside this list fixes its global-table index.
#[derive(Debug, Clone)]
pub struct DeclInfo {
    pub name: String,
    pub kind: DeclKind,
}

/// An import edge. `alias` is present for `import mod as m` (reached as
/// `m::name`); absent for plain imports, whose exports join the importer's
/// top-level name search.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub alias: Option<Token>,
    /// Index of the imported module in the unit list.
    pub module: usize,
}

/// One source file after parsing, macro expansion and import resolution.
#[derive(Debug, Clone)]
pub struct Module {
    /// File name, used in diagnostics and runtime traces.
    pub name: String,
    pub statements: Vec<Stmt>,
    pub top_declarations: Vec<DeclInfo>,
    pub dependencies: Vec<Dependency>,
    /// Names this module exports; a subset of `top_declarations`.
    pub exports: Vec<String>,
}

impl Module {
    /// A standalone module with no imports and no exports.
    pub fn standalone(name: impl Into<String>, statements: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            statements,
            top_declarations: Vec::new(),
            dependencies: Vec::new(),
            exports: Vec::new(),
        }
    }
}

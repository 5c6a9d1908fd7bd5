// kestrel-ast - AST, token and module contracts for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The macro-free AST node set consumed by the compiler.
//!
//! The parser guarantees some shape invariants the compiler relies on:
//! dot-access fields are `Expr::Literal` identifier tokens, switch case
//! constants are literal tokens, and no macro node survives expansion.

use crate::token::Token;

/// Expression nodes.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Number, string, true/false/nil, identifier or `this`; the token
    /// kind distinguishes them.
    Literal { token: Token },

    /// Prefix `- ! ~` and prefix/postfix `++`/`--`.
    Unary {
        op: Token,
        operand: Box<Expr>,
        is_prefix: bool,
    },

    /// Arithmetic, bitwise, comparison, and short-circuit `and`/`or`
    /// (distinguished by the operator token).
    Binary {
        op: Token,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Ternary `cond ? then : else`; the else arm is optional.
    Conditional {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },

    /// `name = value`; compound assignments arrive already lowered.
    Assignment { name: Token, value: Box<Expr> },

    /// `target.field = value` or `target[field] = value`; the accessor
    /// token tells which.
    SetField {
        accessor: Token,
        target: Box<Expr>,
        field: Box<Expr>,
        value: Box<Expr>,
    },

    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },

    /// `new Class(args)`; the class is an identifier or module access.
    New {
        class: Box<Expr>,
        args: Vec<Expr>,
    },

    /// `target.field` or `target[field]`.
    FieldAccess {
        accessor: Token,
        target: Box<Expr>,
        field: Box<Expr>,
    },

    ArrayLiteral { members: Vec<Expr> },

    StructLiteral { fields: Vec<StructEntry> },

    FuncLiteral { params: Vec<Token>, body: Vec<Stmt> },

    /// `super.method`, only meaningful inside class methods.
    Super { method: Token },

    /// `alias::name` into a module imported with an alias.
    ModuleAccess { module: Token, name: Token },

    /// `async f(args)` spawns a worker and yields a future.
    Async {
        keyword: Token,
        callee: Box<Expr>,
        args: Vec<Expr>,
    },

    /// `await expr` blocks on a future.
    Await { keyword: Token, expr: Box<Expr> },
}

/// One `name: value` entry of a struct literal.
#[derive(Debug, Clone)]
pub struct StructEntry {
    pub name: Token,
    pub value: Expr,
}

/// Statement nodes.
#[derive(Debug, Clone)]
pub enum Stmt {
    Expression { expr: Expr },

    Block { statements: Vec<Stmt> },

    /// `let name = init;`; a missing initializer means nil.
    VarDecl {
        name: Token,
        initializer: Option<Expr>,
    },

    FuncDecl(FuncDecl),

    ClassDecl {
        name: Token,
        /// Identifier or module-access expression naming the superclass.
        superclass: Option<Expr>,
        methods: Vec<FuncDecl>,
    },

    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },

    While {
        condition: Expr,
        body: Box<Stmt>,
    },

    For {
        initializer: Option<Box<Stmt>>,
        condition: Option<Expr>,
        increment: Option<Expr>,
        body: Box<Stmt>,
    },

    Break { keyword: Token },

    Continue { keyword: Token },

    /// Falls through to the next switch case.
    Advance { keyword: Token },

    Switch {
        subject: Expr,
        cases: Vec<SwitchCase>,
    },

    Return {
        keyword: Token,
        value: Option<Expr>,
    },
}

/// A named function declaration; also the shape of class methods.
#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: Token,
    pub params: Vec<Token>,
    pub body: Vec<Stmt>,
}

/// One case of a switch statement. A case may match several constants
/// (`case 1 | 4 | 9:`); the default case has none and `is_default` set.
#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub constants: Vec<Token>,
    pub body: Vec<Stmt>,
    pub is_default: bool,
}

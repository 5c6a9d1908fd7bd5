// kestrel-vm - Shared test helpers
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! AST builders and a compile-and-run harness.
//!
//! The front end is external to this crate, so tests assemble the trees
//! it would deliver. The builders keep the programs readable; `run_stmts`
//! wires a single module through the compiler and VM and hands back the
//! VM so tests can inspect globals.

#![allow(dead_code)]

use std::sync::Arc;

use kestrel_ast::{
    DeclInfo, DeclKind, Dependency, ErrorSink, Expr, FuncDecl, Module, Stmt, StructEntry,
    SwitchCase, Token, TokenKind,
};
use kestrel_vm::{
    BuiltinTables, Gc, NativeRegistry, RuntimeError, Value, Vm, compile,
};

// =============================================================================
// Tokens
// =============================================================================

pub fn tok(kind: TokenKind, lexeme: &str) -> Token {
    Token::new(kind, lexeme, 0, 0)
}

pub fn ident(name: &str) -> Token {
    tok(TokenKind::Identifier, name)
}

pub fn kw(name: &str) -> Token {
    tok(TokenKind::Keyword, name)
}

fn number_lexeme(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

// =============================================================================
// Expressions
// =============================================================================

pub fn num(n: f64) -> Expr {
    Expr::Literal {
        token: tok(TokenKind::Number, &number_lexeme(n)),
    }
}

pub fn str_lit(s: &str) -> Expr {
    Expr::Literal {
        token: tok(TokenKind::Str, s),
    }
}

pub fn lit_true() -> Expr {
    Expr::Literal {
        token: tok(TokenKind::True, "true"),
    }
}

pub fn lit_false() -> Expr {
    Expr::Literal {
        token: tok(TokenKind::False, "false"),
    }
}

pub fn lit_nil() -> Expr {
    Expr::Literal {
        token: tok(TokenKind::Nil, "nil"),
    }
}

pub fn var(name: &str) -> Expr {
    Expr::Literal {
        token: ident(name),
    }
}

pub fn this() -> Expr {
    Expr::Literal {
        token: tok(TokenKind::This, "this"),
    }
}

pub fn assign(name: &str, value: Expr) -> Expr {
    Expr::Assignment {
        name: ident(name),
        value: Box::new(value),
    }
}

pub fn bin(kind: TokenKind, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op: tok(kind, ""),
        left: Box::new(left),
        right: Box::new(right),
    }
}

pub fn add(left: Expr, right: Expr) -> Expr {
    bin(TokenKind::Plus, left, right)
}

pub fn unary(kind: TokenKind, operand: Expr) -> Expr {
    Expr::Unary {
        op: tok(kind, ""),
        operand: Box::new(operand),
        is_prefix: true,
    }
}

pub fn postfix(kind: TokenKind, operand: Expr) -> Expr {
    Expr::Unary {
        op: tok(kind, ""),
        operand: Box::new(operand),
        is_prefix: false,
    }
}

pub fn ternary(condition: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
    Expr::Conditional {
        condition: Box::new(condition),
        then_branch: Box::new(then_branch),
        else_branch: Some(Box::new(else_branch)),
    }
}

pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: Box::new(callee),
        args,
    }
}

pub fn call_named(name: &str, args: Vec<Expr>) -> Expr {
    call(var(name), args)
}

pub fn new_instance(class: &str, args: Vec<Expr>) -> Expr {
    Expr::New {
        class: Box::new(var(class)),
        args,
    }
}

pub fn get_prop(target: Expr, field: &str) -> Expr {
    Expr::FieldAccess {
        accessor: tok(TokenKind::Dot, "."),
        target: Box::new(target),
        field: Box::new(var(field)),
    }
}

pub fn get_index(target: Expr, index: Expr) -> Expr {
    Expr::FieldAccess {
        accessor: tok(TokenKind::LeftBracket, "["),
        target: Box::new(target),
        field: Box::new(index),
    }
}

pub fn set_prop(target: Expr, field: &str, value: Expr) -> Expr {
    Expr::SetField {
        accessor: tok(TokenKind::Dot, "."),
        target: Box::new(target),
        field: Box::new(var(field)),
        value: Box::new(value),
    }
}

pub fn set_index(target: Expr, index: Expr, value: Expr) -> Expr {
    Expr::SetField {
        accessor: tok(TokenKind::LeftBracket, "["),
        target: Box::new(target),
        field: Box::new(index),
        value: Box::new(value),
    }
}

pub fn array(members: Vec<Expr>) -> Expr {
    Expr::ArrayLiteral { members }
}

pub fn struct_lit(fields: Vec<(&str, Expr)>) -> Expr {
    Expr::StructLiteral {
        fields: fields
            .into_iter()
            .map(|(name, value)| StructEntry {
                name: ident(name),
                value,
            })
            .collect(),
    }
}

pub fn func_expr(params: &[&str], body: Vec<Stmt>) -> Expr {
    Expr::FuncLiteral {
        params: params.iter().map(|p| ident(p)).collect(),
        body,
    }
}

pub fn super_method(name: &str) -> Expr {
    Expr::Super {
        method: ident(name),
    }
}

pub fn module_access(module: &str, name: &str) -> Expr {
    Expr::ModuleAccess {
        module: ident(module),
        name: ident(name),
    }
}

pub fn async_call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Async {
        keyword: kw("async"),
        callee: Box::new(callee),
        args,
    }
}

pub fn await_expr(expr: Expr) -> Expr {
    Expr::Await {
        keyword: kw("await"),
        expr: Box::new(expr),
    }
}

// =============================================================================
// Statements
// =============================================================================

pub fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::Expression { expr }
}

pub fn let_stmt(name: &str, initializer: Expr) -> Stmt {
    Stmt::VarDecl {
        name: ident(name),
        initializer: Some(initializer),
    }
}

pub fn let_uninit(name: &str) -> Stmt {
    Stmt::VarDecl {
        name: ident(name),
        initializer: None,
    }
}

pub fn block(statements: Vec<Stmt>) -> Stmt {
    Stmt::Block { statements }
}

pub fn func_decl(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    Stmt::FuncDecl(method_decl(name, params, body))
}

pub fn method_decl(name: &str, params: &[&str], body: Vec<Stmt>) -> FuncDecl {
    FuncDecl {
        name: ident(name),
        params: params.iter().map(|p| ident(p)).collect(),
        body,
    }
}

pub fn class_decl(name: &str, superclass: Option<&str>, methods: Vec<FuncDecl>) -> Stmt {
    Stmt::ClassDecl {
        name: ident(name),
        superclass: superclass.map(|s| var(s)),
        methods,
    }
}

pub fn if_stmt(condition: Expr, then_branch: Stmt) -> Stmt {
    Stmt::If {
        condition,
        then_branch: Box::new(then_branch),
        else_branch: None,
    }
}

pub fn if_else(condition: Expr, then_branch: Stmt, else_branch: Stmt) -> Stmt {
    Stmt::If {
        condition,
        then_branch: Box::new(then_branch),
        else_branch: Some(Box::new(else_branch)),
    }
}

pub fn while_stmt(condition: Expr, body: Stmt) -> Stmt {
    Stmt::While {
        condition,
        body: Box::new(body),
    }
}

pub fn for_stmt(
    initializer: Option<Stmt>,
    condition: Option<Expr>,
    increment: Option<Expr>,
    body: Stmt,
) -> Stmt {
    Stmt::For {
        initializer: initializer.map(Box::new),
        condition,
        increment,
        body: Box::new(body),
    }
}

pub fn break_stmt() -> Stmt {
    Stmt::Break {
        keyword: kw("break"),
    }
}

pub fn continue_stmt() -> Stmt {
    Stmt::Continue {
        keyword: kw("continue"),
    }
}

pub fn advance_stmt() -> Stmt {
    Stmt::Advance {
        keyword: kw("advance"),
    }
}

pub fn case(constants: Vec<Token>, body: Vec<Stmt>) -> SwitchCase {
    SwitchCase {
        constants,
        body,
        is_default: false,
    }
}

pub fn default_case(body: Vec<Stmt>) -> SwitchCase {
    SwitchCase {
        constants: Vec::new(),
        body,
        is_default: true,
    }
}

pub fn switch_stmt(subject: Expr, cases: Vec<SwitchCase>) -> Stmt {
    Stmt::Switch { subject, cases }
}

pub fn ret(value: Expr) -> Stmt {
    Stmt::Return {
        keyword: kw("return"),
        value: Some(value),
    }
}

pub fn ret_none() -> Stmt {
    Stmt::Return {
        keyword: kw("return"),
        value: None,
    }
}

// =============================================================================
// Modules and the run harness
// =============================================================================

/// Build a module, deriving the declaration table and export list from
/// the top-level statements the way the import resolver would.
pub fn module(name: &str, statements: Vec<Stmt>) -> Module {
    module_with_deps(name, statements, Vec::new())
}

pub fn module_with_deps(name: &str, statements: Vec<Stmt>, dependencies: Vec<Dependency>) -> Module {
    let mut top_declarations = Vec::new();
    for stmt in &statements {
        match stmt {
            Stmt::VarDecl { name, .. } => top_declarations.push(DeclInfo {
                name: name.lexeme.clone(),
                kind: DeclKind::Let,
            }),
            Stmt::FuncDecl(decl) => top_declarations.push(DeclInfo {
                name: decl.name.lexeme.clone(),
                kind: DeclKind::Function,
            }),
            Stmt::ClassDecl { name, .. } => top_declarations.push(DeclInfo {
                name: name.lexeme.clone(),
                kind: DeclKind::Class,
            }),
            _ => {}
        }
    }
    let exports = top_declarations.iter().map(|d| d.name.clone()).collect();
    Module {
        name: name.to_owned(),
        statements,
        top_declarations,
        dependencies,
        exports,
    }
}

pub fn plain_import(module: usize) -> Dependency {
    Dependency {
        alias: None,
        module,
    }
}

pub fn aliased_import(alias: &str, module: usize) -> Dependency {
    Dependency {
        alias: Some(ident(alias)),
        module,
    }
}

/// A finished run: the VM for global inspection plus the outcome.
pub struct Run {
    pub vm: Arc<Vm>,
    pub result: Result<Value, RuntimeError>,
}

pub fn run_configured(
    units: Vec<Module>,
    registry: NativeRegistry,
    builtins: BuiltinTables,
    gc: Gc,
) -> Run {
    let mut errors = ErrorSink::new();
    let Some(program) = compile(&units, &registry, &gc, &mut errors) else {
        let rendered: Vec<String> = errors.diagnostics().iter().map(|d| d.to_string()).collect();
        panic!("compile failed: {:?}", rendered);
    };
    let vm = Vm::new(program, gc, &registry, builtins);
    let result = vm.interpret();
    Run { vm, result }
}

pub fn run_stmts(statements: Vec<Stmt>) -> Run {
    run_configured(
        vec![module("main", statements)],
        NativeRegistry::new(),
        BuiltinTables::new(),
        Gc::new(),
    )
}

pub fn run_with_natives(statements: Vec<Stmt>, registry: NativeRegistry) -> Run {
    run_configured(
        vec![module("main", statements)],
        registry,
        BuiltinTables::new(),
        Gc::new(),
    )
}

/// Compile only, collecting rendered diagnostics.
pub fn compile_errors(units: Vec<Module>) -> Vec<String> {
    let gc = Gc::new();
    let registry = NativeRegistry::new();
    let mut errors = ErrorSink::new();
    let _ = compile(&units, &registry, &gc, &mut errors);
    errors.diagnostics().iter().map(|d| d.to_string()).collect()
}

pub fn compile_errors_stmts(statements: Vec<Stmt>) -> Vec<String> {
    compile_errors(vec![module("main", statements)])
}

pub fn assert_has_error(errors: &[String], needle: &str) {
    assert!(
        errors.iter().any(|e| e.contains(needle)),
        "expected a diagnostic containing {:?}, got {:?}",
        needle,
        errors
    );
}

// =============================================================================
// Result inspection
// =============================================================================

pub fn global(run: &Run, name: &str) -> Value {
    run.vm
        .global(name)
        .unwrap_or_else(|| panic!("no global named '{}'", name))
}

pub fn global_int(run: &Run, name: &str) -> i32 {
    let value = global(run, name);
    assert!(value.is_int(), "global '{}' is {:?}, not an int", name, value);
    value.as_int()
}

pub fn global_double(run: &Run, name: &str) -> f64 {
    let value = global(run, name);
    assert!(
        value.is_double(),
        "global '{}' is {:?}, not a double",
        name,
        value
    );
    value.as_double()
}

pub fn global_bool(run: &Run, name: &str) -> bool {
    let value = global(run, name);
    assert!(value.is_bool(), "global '{}' is {:?}, not a bool", name, value);
    value.as_bool()
}

pub fn global_string(run: &Run, name: &str) -> String {
    let value = global(run, name);
    assert!(
        value.is_string(),
        "global '{}' is {:?}, not a string",
        name,
        value
    );
    match &value.obj_ref().body {
        kestrel_vm::object::ObjBody::String(s) => s.text.clone(),
        _ => unreachable!(),
    }
}

pub fn expect_ok(run: &Run) {
    if let Err(err) = &run.result {
        panic!("program failed: [{:?}] {}", err.code, err.message);
    }
}

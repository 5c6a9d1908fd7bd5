// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Code generation: one pass over each module's AST, modules in
//! dependency order.
//!
//! Name resolution is three-tier (local, then upvalue, then global, then
//! native). Control flow lowers to 16-bit relative jumps; break, continue
//! and advance emit scope jumps patched when their loop or switch
//! finishes. Top-level functions and classes are bound straight into
//! their global cells at compile time; mutable `let` globals initialize
//! through `SET_GLOBAL` + `POP`.

use std::ptr::NonNull;

use kestrel_ast::{
    DeclKind, ErrorSink, Expr, FuncDecl, Module, Stmt, StructEntry, SwitchCase, Token, TokenKind,
};

use crate::chunk::Code;
use crate::compiler::types::{
    ClassState, FuncKind, FuncState, Global, Local, LOCAL_MAX, ScopeJumpKind,
    SHORT_CONSTANT_LIMIT, UPVALUE_MAX, UpvalueInfo,
};
use crate::gc::Gc;
use crate::natives::NativeRegistry;
use crate::object::{self, Obj, ObjBody, ObjClass, ObjClosure, ObjFunction, mark_value};
use crate::opcode::OpCode;
use crate::value::Value;

/// Statement-level unwind signal: the diagnostic is already in the sink,
/// the driver resynchronizes at the next statement boundary.
pub(crate) struct Unwind;

type CResult<T> = Result<T, Unwind>;

/// Everything the compiler produced: the shared code block, the global
/// table with compile-time bindings, and the script entry closure.
pub struct Program {
    pub code: Code,
    pub globals: Vec<Global>,
    pub main: NonNull<Obj>,
    pub source_files: Vec<String>,
}

/// Compile modules, delivered in dependency order, into a [`Program`].
/// Returns `None` when any diagnostic was reported.
pub fn compile(
    units: &[Module],
    natives: &NativeRegistry,
    gc: &Gc,
    errors: &mut ErrorSink,
) -> Option<Program> {
    let mut compiler = Compiler {
        gc,
        units,
        natives,
        errors: &mut *errors,
        code: Code::new(),
        globals: Vec::new(),
        current: FuncState::new(FuncKind::Script),
        class_state: None,
        cur_unit: 0,
        cur_global_base: 0,
        source_files: Vec::new(),
    };

    for (i, unit) in units.iter().enumerate() {
        compiler.cur_unit = i;
        compiler.cur_global_base = compiler.globals.len();
        compiler.current.file = i as u16;
        compiler.source_files.push(unit.name.clone());
        for decl in &unit.top_declarations {
            compiler.globals.push(Global {
                name: decl.name.clone(),
                value: Value::NIL,
                defined: false,
                kind: decl.kind,
            });
        }
        for stmt in &unit.statements {
            // An error already resynchronized; carry on with the next
            // statement so one pass can surface several diagnostics.
            let _ = compiler.statement(stmt);
        }
    }

    let program = compiler.finish();
    if errors.has_errors() { None } else { Some(program) }
}

struct Compiler<'a> {
    gc: &'a Gc,
    units: &'a [Module],
    natives: &'a NativeRegistry,
    errors: &'a mut ErrorSink,
    code: Code,
    globals: Vec<Global>,
    current: FuncState,
    class_state: Option<Box<ClassState>>,
    cur_unit: usize,
    /// Global-table index of the current module's first declaration.
    cur_global_base: usize,
    source_files: Vec<String>,
}

/// Outcome of a global lookup.
enum GlobalRes {
    Found(usize),
    /// The name is declared in this module but its initializer has not
    /// finished compiling.
    UseBeforeInit,
    NotFound,
}

enum LocalRes {
    Slot(u8),
    OwnInitializer,
    NotFound,
}

enum UpvalueError {
    OwnInitializer,
    TooMany,
}

impl<'a> Compiler<'a> {
    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self, stmt: &Stmt) -> CResult<()> {
        let result = self.statement_inner(stmt);
        // Track whether the body's most recent statement was a return, so
        // the implicit return is appended exactly when needed.
        self.current.has_return = matches!(stmt, Stmt::Return { .. }) && result.is_ok();
        result
    }

    fn statement_inner(&mut self, stmt: &Stmt) -> CResult<()> {
        match stmt {
            Stmt::Expression { expr } => {
                self.expression(expr)?;
                self.current.emit_op(OpCode::Pop);
                Ok(())
            }
            Stmt::Block { statements } => {
                self.begin_scope();
                let mut result = Ok(());
                for s in statements {
                    result = self.statement(s);
                    if result.is_err() {
                        break;
                    }
                }
                self.end_scope();
                result
            }
            Stmt::VarDecl { name, initializer } => self.var_decl(name, initializer.as_ref()),
            Stmt::FuncDecl(decl) => self.func_decl(decl),
            Stmt::ClassDecl {
                name,
                superclass,
                methods,
            } => self.class_decl(name, superclass.as_ref(), methods),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => self.if_stmt(condition, then_branch, else_branch.as_deref()),
            Stmt::While { condition, body } => self.while_stmt(condition, body),
            Stmt::For {
                initializer,
                condition,
                increment,
                body,
            } => self.for_stmt(
                initializer.as_deref(),
                condition.as_ref(),
                increment.as_ref(),
                body,
            ),
            Stmt::Break { keyword } => self.break_stmt(keyword),
            Stmt::Continue { keyword } => self.continue_stmt(keyword),
            Stmt::Advance { keyword } => self.advance_stmt(keyword),
            Stmt::Switch { subject, cases } => self.switch_stmt(subject, cases),
            Stmt::Return { keyword, value } => self.return_stmt(keyword, value.as_ref()),
        }
    }

    fn var_decl(&mut self, name: &Token, initializer: Option<&Expr>) -> CResult<()> {
        let index = self.parse_var(name)?;
        match initializer {
            Some(expr) => self.expression(expr)?,
            None => self.current.emit_op(OpCode::Nil),
        }
        self.define_var(index);
        if self.current.scope_depth > 0 {
            // The initializer's stack slot simply becomes the local.
            return Ok(());
        }
        if index <= SHORT_CONSTANT_LIMIT {
            self.current.emit_op(OpCode::SetGlobal);
            self.current.emit_byte(index as u8);
        } else {
            self.current.emit_op_u16(OpCode::SetGlobalLong, index);
        }
        self.current.emit_op(OpCode::Pop);
        Ok(())
    }

    fn func_decl(&mut self, decl: &FuncDecl) -> CResult<()> {
        let index = self.parse_var(&decl.name)?;
        // Defined before the body compiles so the function can recurse.
        self.define_var(index);
        if self.current.scope_depth == 0 {
            let (func, upvalues) =
                self.function(&decl.name.lexeme, &decl.params, &decl.body, FuncKind::Function)?;
            if !upvalues.is_empty() {
                return Err(self.error(
                    decl.name.clone(),
                    "Global function with captured variables detected.",
                ));
            }
            let closure = self.gc.alloc(ObjBody::Closure(ObjClosure {
                function: func,
                upvalues: Vec::new(),
            }));
            // Bound at compile time; no bytecode needed.
            self.globals[index as usize].value = Value::object(closure);
            Ok(())
        } else {
            // A local function lands in its own slot like any initializer.
            let (func, upvalues) =
                self.function(&decl.name.lexeme, &decl.params, &decl.body, FuncKind::Function)?;
            self.emit_closure(func, &upvalues)
        }
    }

    fn class_decl(
        &mut self,
        name: &Token,
        superclass: Option<&Expr>,
        methods: &[FuncDecl],
    ) -> CResult<()> {
        self.set_line(name);
        if self.current.scope_depth > 0 {
            return Err(self.error(name.clone(), "Classes can only be declared at top level."));
        }
        let index = self.parse_var(name)?;
        let class_ptr = self.gc.alloc(ObjBody::Class(ObjClass {
            name: name.lexeme.clone(),
            methods: Default::default(),
        }));

        let enclosing = self.class_state.take();
        self.class_state = Some(Box::new(ClassState {
            enclosing,
            superclass: None,
        }));

        let result = self.class_body(name, superclass, methods, class_ptr, index);

        let state = self.class_state.take();
        self.class_state = state.and_then(|s| s.enclosing);
        result?;

        // Bound at compile time, like top-level functions.
        self.globals[index as usize].value = Value::object(class_ptr);
        Ok(())
    }

    fn class_body(
        &mut self,
        name: &Token,
        superclass: Option<&Expr>,
        methods: &[FuncDecl],
        class_ptr: NonNull<Obj>,
        index: u16,
    ) -> CResult<()> {
        if let Some(parent) = superclass {
            let (sup_index, sup_token) = match parent {
                Expr::Literal { token } if token.kind == TokenKind::Identifier => {
                    let res = self.resolve_global(token, false)?;
                    let idx = match res {
                        GlobalRes::Found(idx) => idx,
                        GlobalRes::UseBeforeInit => {
                            return Err(self.error(
                                token.clone(),
                                format!(
                                    "Trying to access variable '{}' before it's initialized.",
                                    token.lexeme
                                ),
                            ));
                        }
                        GlobalRes::NotFound => {
                            return Err(
                                self.error(token.clone(), "Variable isn't defined.")
                            );
                        }
                    };
                    (idx, token)
                }
                Expr::ModuleAccess { module, name } => {
                    (self.resolve_module_variable(module, name)?, name)
                }
                _ => return Err(self.error(name.clone(), "Superclass must be a class name.")),
            };
            let sup_value = self.globals[sup_index].value;
            if !sup_value.is_class() {
                return Err(self.error(
                    sup_token.clone(),
                    "Superclass must name a class known at compile time.",
                ));
            }
            let sup_ptr = sup_value.as_obj();
            if let Some(state) = self.class_state.as_deref_mut() {
                state.superclass = Some(sup_ptr);
            }
            // Copy-down inheritance: snapshot the superclass's methods
            // now; own methods compiled below override them. The parent
            // constructor is re-keyed under the subclass name so
            // `new Sub(args)` finds it; a subclass constructor compiled
            // below simply overwrites that entry.
            unsafe {
                let (mut inherited, sup_ctor) = match &object::obj_ref(sup_ptr).body {
                    ObjBody::Class(c) => (c.methods.clone(), c.methods.get(&c.name).copied()),
                    _ => unreachable!("checked is_class above"),
                };
                if let Some(ctor) = sup_ctor {
                    inherited.insert(name.lexeme.clone(), ctor);
                }
                if let ObjBody::Class(c) = &mut object::obj_mut(class_ptr).body {
                    c.methods = inherited;
                }
            }
        }

        // Defined only after the superclass check, so a class can't name
        // itself as its parent.
        self.define_var(index);

        for decl in methods {
            let closure = self.method(decl, name)?;
            unsafe {
                if let ObjBody::Class(c) = &mut object::obj_mut(class_ptr).body {
                    c.methods
                        .insert(decl.name.lexeme.clone(), Value::object(closure));
                }
            }
        }
        Ok(())
    }

    fn method(&mut self, decl: &FuncDecl, class_name: &Token) -> CResult<NonNull<Obj>> {
        self.set_line(&decl.name);
        // A method named after its class is the constructor.
        let kind = if decl.name.lexeme == class_name.lexeme {
            FuncKind::Constructor
        } else {
            FuncKind::Method
        };
        let (func, upvalues) = self.function(&decl.name.lexeme, &decl.params, &decl.body, kind)?;
        if !upvalues.is_empty() {
            return Err(self.error(decl.name.clone(), "Upvalues captured in method."));
        }
        Ok(self.gc.alloc(ObjBody::Closure(ObjClosure {
            function: func,
            upvalues: Vec::new(),
        })))
    }

    fn if_stmt(
        &mut self,
        condition: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
    ) -> CResult<()> {
        self.expression(condition)?;
        let then_jump = self.current.emit_jump(OpCode::JumpIfFalsePop);
        self.statement(then_branch)?;
        match else_branch {
            Some(else_branch) => {
                let else_jump = self.current.emit_jump(OpCode::Jump);
                self.patch(then_jump)?;
                self.statement(else_branch)?;
                self.patch(else_jump)
            }
            None => self.patch(then_jump),
        }
    }

    fn while_stmt(&mut self, condition: &Expr, body: &Stmt) -> CResult<()> {
        // Loop inversion: test once up front, then re-test at the bottom.
        self.expression(condition)?;
        let exit_jump = self.current.emit_jump(OpCode::JumpIfFalsePop);
        let loop_start = self.current.offset();
        // The body always gets its own scope so scope jumps can tell
        // loop-owned locals apart, braces or not.
        self.current.scopes_with_loop.push(self.current.scope_depth);
        self.begin_scope();
        let body_result = self.statement(body);
        self.end_scope();
        self.current.scopes_with_loop.pop();
        body_result?;
        // Continue re-tests the condition.
        self.scope_patch(ScopeJumpKind::Continue)?;
        self.expression(condition)?;
        let loop_result = self.current.emit_loop_if_true(loop_start);
        self.emit_result(loop_result)?;
        self.patch(exit_jump)?;
        self.scope_patch(ScopeJumpKind::Break)
    }

    fn for_stmt(
        &mut self,
        initializer: Option<&Stmt>,
        condition: Option<&Expr>,
        increment: Option<&Expr>,
        body: &Stmt,
    ) -> CResult<()> {
        // The whole loop gets a scope so an initializer declaration stays
        // local to it.
        self.begin_scope();
        let result = self.for_stmt_inner(initializer, condition, increment, body);
        self.end_scope();
        result
    }

    fn for_stmt_inner(
        &mut self,
        initializer: Option<&Stmt>,
        condition: Option<&Expr>,
        increment: Option<&Expr>,
        body: &Stmt,
    ) -> CResult<()> {
        if let Some(init) = initializer {
            self.statement(init)?;
        }
        let mut exit_jump = None;
        if let Some(cond) = condition {
            self.expression(cond)?;
            exit_jump = Some(self.current.emit_jump(OpCode::JumpIfFalsePop));
        }
        let loop_start = self.current.offset();
        self.current.scopes_with_loop.push(self.current.scope_depth);
        self.begin_scope();
        let body_result = self.statement(body);
        self.end_scope();
        self.current.scopes_with_loop.pop();
        body_result?;
        // Continue lands here, before the increment.
        self.scope_patch(ScopeJumpKind::Continue)?;
        if let Some(inc) = increment {
            self.expression(inc)?;
            self.current.emit_op(OpCode::Pop);
        }
        match condition {
            Some(cond) => {
                self.expression(cond)?;
                let r = self.current.emit_loop_if_true(loop_start);
                self.emit_result(r)?;
            }
            None => {
                let r = self.current.emit_loop(loop_start);
                self.emit_result(r)?;
            }
        }
        if let Some(exit) = exit_jump {
            self.patch(exit)?;
        }
        self.scope_patch(ScopeJumpKind::Break)
    }

    fn break_stmt(&mut self, keyword: &Token) -> CResult<()> {
        self.set_line(keyword);
        if self.current.scopes_with_loop.is_empty() && self.current.scopes_with_switch.is_empty() {
            return Err(self.error(
                keyword.clone(),
                "Cannot use 'break' outside of a loop or switch.",
            ));
        }
        let to_pop = self.locals_to_pop(true, true);
        let to_pop = self.check_pop_count(keyword, to_pop)?;
        self.current.emit_scope_jump(ScopeJumpKind::Break, to_pop);
        Ok(())
    }

    fn continue_stmt(&mut self, keyword: &Token) -> CResult<()> {
        self.set_line(keyword);
        if self.current.scopes_with_loop.is_empty() {
            return Err(self.error(keyword.clone(), "Cannot use 'continue' outside of a loop."));
        }
        let to_pop = self.locals_to_pop(true, false);
        let to_pop = self.check_pop_count(keyword, to_pop)?;
        self.current.emit_scope_jump(ScopeJumpKind::Continue, to_pop);
        Ok(())
    }

    fn advance_stmt(&mut self, keyword: &Token) -> CResult<()> {
        self.set_line(keyword);
        if self.current.scopes_with_switch.is_empty() {
            return Err(self.error(keyword.clone(), "Cannot use 'advance' outside of a switch."));
        }
        let to_pop = self.locals_to_pop(false, true);
        let to_pop = self.check_pop_count(keyword, to_pop)?;
        self.current.emit_scope_jump(ScopeJumpKind::Advance, to_pop);
        Ok(())
    }

    /// Count the locals live above the innermost loop/switch scope; they
    /// are popped at the jump site.
    fn locals_to_pop(&self, check_loops: bool, check_switches: bool) -> usize {
        let loop_depth = self.current.scopes_with_loop.last().copied();
        let switch_depth = self.current.scopes_with_switch.last().copied();
        let mut to_pop = 0;
        for local in self.current.locals.iter().rev() {
            if local.depth != -1 {
                let in_loop =
                    check_loops && loop_depth.is_some_and(|d| local.depth <= d as i32);
                let in_switch =
                    check_switches && switch_depth.is_some_and(|d| local.depth <= d as i32);
                if in_loop || in_switch {
                    break;
                }
            }
            to_pop += 1;
        }
        to_pop
    }

    fn check_pop_count(&mut self, keyword: &Token, to_pop: usize) -> CResult<u8> {
        if to_pop > u8::MAX as usize {
            return Err(self.error(keyword.clone(), "Too many variables to pop."));
        }
        Ok(to_pop as u8)
    }

    fn switch_stmt(&mut self, subject: &Expr, cases: &[SwitchCase]) -> CResult<()> {
        self.current
            .scopes_with_switch
            .push(self.current.scope_depth);
        let result = self.switch_inner(subject, cases);
        self.current.scopes_with_switch.pop();
        result?;
        self.scope_patch(ScopeJumpKind::Break)
    }

    fn switch_inner(&mut self, subject: &Expr, cases: &[SwitchCase]) -> CResult<()> {
        self.expression(subject)?;

        // Collect one constant index per case constant; a case with
        // several constants dispatches each to the same body.
        let mut constants: Vec<u16> = Vec::new();
        let mut is_long = false;
        for case in cases {
            for tok in &case.constants {
                // Invalid constants are reported and skipped so the rest
                // of the switch still compiles.
                let Ok(value) = self.case_constant(tok) else {
                    continue;
                };
                let Ok(idx) = self.make_constant(tok, value) else {
                    continue;
                };
                if idx > SHORT_CONSTANT_LIMIT {
                    is_long = true;
                }
                constants.push(idx);
            }
        }

        let n = constants.len();
        if is_long {
            self.current.emit_op_u16(OpCode::SwitchLong, n as u16);
            for &c in &constants {
                self.current.emit_u16(c);
            }
        } else {
            self.current.emit_op_u16(OpCode::Switch, n as u16);
            for &c in &constants {
                self.current.emit_byte(c as u8);
            }
        }

        // One forward jump per constant, plus the default slot last.
        let mut jumps = Vec::with_capacity(n + 1);
        for _ in 0..n + 1 {
            jumps.push(self.current.offset());
            self.current.emit_u16(0xffff);
        }

        let mut has_default = false;
        let mut implicit_breaks = Vec::with_capacity(cases.len());
        let mut next_jump = 0;
        for case in cases {
            if case.is_default {
                has_default = true;
                self.patch(jumps[n])?;
            } else {
                for _ in &case.constants {
                    if next_jump < n {
                        self.patch(jumps[next_jump])?;
                        next_jump += 1;
                    }
                }
            }
            // Each body gets a scope of its own; advance sites inside it
            // are strictly deeper than the switch and patch cleanly.
            self.begin_scope();
            let mut body_result = Ok(());
            for s in &case.body {
                body_result = self.statement(s);
                if body_result.is_err() {
                    break;
                }
            }
            self.end_scope();
            body_result?;
            // Implicit break at the end of every case.
            implicit_breaks.push(self.current.emit_jump(OpCode::Jump));
            // Advance from this case falls through to the next one.
            self.scope_patch(ScopeJumpKind::Advance)?;
        }

        if !has_default {
            self.patch(jumps[n])?;
        }
        for jump in implicit_breaks {
            self.patch(jump)?;
        }
        Ok(())
    }

    fn case_constant(&mut self, tok: &Token) -> CResult<Value> {
        self.set_line(tok);
        match tok.kind {
            TokenKind::Number => {
                let num = self.number_value(tok)?;
                Ok(Value::number(num))
            }
            TokenKind::True => Ok(Value::TRUE),
            TokenKind::False => Ok(Value::FALSE),
            TokenKind::Nil => Ok(Value::NIL),
            TokenKind::Str => Ok(Value::object(self.gc.intern(&tok.lexeme))),
            _ => Err(self.error(tok.clone(), "Case expression can only be a constant.")),
        }
    }

    fn return_stmt(&mut self, keyword: &Token, value: Option<&Expr>) -> CResult<()> {
        self.set_line(keyword);
        match self.current.kind {
            FuncKind::Script => {
                Err(self.error(keyword.clone(), "Can't return from top-level code."))
            }
            FuncKind::Constructor => {
                if value.is_some() {
                    return Err(
                        self.error(keyword.clone(), "Can't return a value from a constructor.")
                    );
                }
                // A bare return in a constructor yields `this`.
                self.emit_return();
                Ok(())
            }
            _ => {
                match value {
                    Some(expr) => {
                        self.expression(expr)?;
                        self.current.emit_op(OpCode::Return);
                    }
                    None => self.emit_return(),
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self, expr: &Expr) -> CResult<()> {
        match expr {
            Expr::Literal { token } => self.literal(token),
            Expr::Unary {
                op,
                operand,
                is_prefix,
            } => self.unary(op, operand, *is_prefix),
            Expr::Binary { op, left, right } => self.binary(op, left, right),
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => self.conditional(condition, then_branch, else_branch.as_deref()),
            Expr::Assignment { name, value } => {
                // The right side stays on the stack; assignment is an
                // expression.
                self.expression(value)?;
                self.named_var(name, true)
            }
            Expr::SetField {
                accessor,
                target,
                field,
                value,
            } => self.set_field(accessor, target, field, value),
            Expr::Call { callee, args } => self.call(callee, args),
            Expr::New { class, args } => {
                self.expression(class)?;
                self.arg_list(args)?;
                self.current.emit_op(OpCode::Call);
                self.current.emit_byte(args.len() as u8);
                Ok(())
            }
            Expr::FieldAccess {
                accessor,
                target,
                field,
            } => self.field_access(accessor, target, field),
            Expr::ArrayLiteral { members } => self.array_literal(members),
            Expr::StructLiteral { fields } => self.struct_literal(fields),
            Expr::FuncLiteral { params, body } => {
                let (func, upvalues) =
                    self.function("anonymous", params, body, FuncKind::Function)?;
                self.emit_closure(func, &upvalues)
            }
            Expr::Super { method } => self.super_access(method),
            Expr::ModuleAccess { module, name } => {
                let index = self.resolve_module_variable(module, name)?;
                if index <= SHORT_CONSTANT_LIMIT as usize {
                    self.current.emit_op(OpCode::GetGlobal);
                    self.current.emit_byte(index as u8);
                } else {
                    self.current.emit_op_u16(OpCode::GetGlobalLong, index as u16);
                }
                Ok(())
            }
            Expr::Async {
                keyword,
                callee,
                args,
            } => {
                self.set_line(keyword);
                self.expression(callee)?;
                self.arg_list(args)?;
                self.current.emit_op(OpCode::LaunchAsync);
                self.current.emit_byte(args.len() as u8);
                Ok(())
            }
            Expr::Await { keyword, expr } => {
                self.set_line(keyword);
                self.expression(expr)?;
                self.current.emit_op(OpCode::Await);
                Ok(())
            }
        }
    }

    fn literal(&mut self, token: &Token) -> CResult<()> {
        self.set_line(token);
        match token.kind {
            TokenKind::Number => {
                let value = self.number_value(token)?;
                if value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
                    self.current.emit_op(OpCode::LoadInt);
                    self.current.emit_byte(value as u8);
                    Ok(())
                } else {
                    self.emit_constant(token, Value::number(value))
                }
            }
            TokenKind::Str => {
                let s = self.gc.intern(&token.lexeme);
                self.emit_constant(token, Value::object(s))
            }
            TokenKind::True => {
                self.current.emit_op(OpCode::True);
                Ok(())
            }
            TokenKind::False => {
                self.current.emit_op(OpCode::False);
                Ok(())
            }
            TokenKind::Nil => {
                self.current.emit_op(OpCode::Nil);
                Ok(())
            }
            TokenKind::This => {
                if self.class_state.is_none() {
                    return Err(self.error(
                        token.clone(),
                        "Can't use keyword 'this' outside of a class.",
                    ));
                }
                self.named_var(token, false)
            }
            TokenKind::Identifier => self.named_var(token, false),
            _ => Err(self.error(token.clone(), "Unexpected literal token.")),
        }
    }

    fn unary(&mut self, op: &Token, operand: &Expr, is_prefix: bool) -> CResult<()> {
        self.set_line(op);
        if matches!(op.kind, TokenKind::Increment | TokenKind::Decrement) {
            return self.increment(op, operand, is_prefix);
        }
        self.expression(operand)?;
        match op.kind {
            TokenKind::Minus => self.current.emit_op(OpCode::Negate),
            TokenKind::Bang => self.current.emit_op(OpCode::Not),
            TokenKind::Tilde => self.current.emit_op(OpCode::BinNot),
            _ => return Err(self.error(op.clone(), "Unexpected unary operator.")),
        }
        Ok(())
    }

    /// Fused increment/decrement. The operand byte packs the sign, the
    /// prefix flag and the target kind: 0 local, 1 upvalue, 2/3 global
    /// (short/long index), 4/5 dot field (short/long name), 6 subscript.
    fn increment(&mut self, op: &Token, operand: &Expr, is_prefix: bool) -> CResult<()> {
        let mut arg: Option<u16> = None;
        let target: u8;
        match operand {
            Expr::Literal { token } if token.kind == TokenKind::Identifier => {
                self.set_line(token);
                if let Some(slot) = self.resolve_local(token)? {
                    arg = Some(slot as u16);
                    target = 0;
                } else if let Some(idx) = self.resolve_upvalue(token)? {
                    arg = Some(idx as u16);
                    target = 1;
                } else {
                    match self.resolve_global(token, true)? {
                        GlobalRes::Found(index) => {
                            target = if index > SHORT_CONSTANT_LIMIT as usize { 3 } else { 2 };
                            arg = Some(index as u16);
                        }
                        GlobalRes::UseBeforeInit => {
                            return Err(self.error(
                                token.clone(),
                                format!(
                                    "Trying to access variable '{}' before it's initialized.",
                                    token.lexeme
                                ),
                            ));
                        }
                        GlobalRes::NotFound => {
                            return Err(self.error(
                                token.clone(),
                                format!("Variable '{}' isn't declared.", token.lexeme),
                            ));
                        }
                    }
                }
            }
            Expr::FieldAccess {
                accessor,
                target: callee,
                field,
            } => {
                self.set_line(accessor);
                self.expression(callee)?;
                if accessor.kind == TokenKind::Dot {
                    let name = self.field_name(field)?;
                    let idx = self.identifier_constant(&name)?;
                    target = if idx > SHORT_CONSTANT_LIMIT { 5 } else { 4 };
                    arg = Some(idx);
                } else {
                    self.expression(field)?;
                    target = 6;
                }
            }
            _ => return Err(self.error(op.clone(), "Left side is not incrementable.")),
        }

        let args = u8::from(op.kind == TokenKind::Increment)
            | (u8::from(is_prefix) << 1)
            | (target << 2);
        self.current.emit_op(OpCode::Increment);
        self.current.emit_byte(args);
        if let Some(arg) = arg {
            if arg > SHORT_CONSTANT_LIMIT {
                self.current.emit_u16(arg);
            } else {
                self.current.emit_byte(arg as u8);
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: &Token, left: &Expr, right: &Expr) -> CResult<()> {
        self.set_line(op);

        if op.kind == TokenKind::Or {
            // A truthy left side is the whole expression's value.
            self.expression(left)?;
            let jump = self.current.emit_jump(OpCode::JumpIfTrue);
            self.current.emit_op(OpCode::Pop);
            self.expression(right)?;
            return self.patch(jump);
        }
        if op.kind == TokenKind::And {
            // A falsey left side short-circuits.
            self.expression(left)?;
            let jump = self.current.emit_jump(OpCode::JumpIfFalse);
            self.current.emit_op(OpCode::Pop);
            self.expression(right)?;
            return self.patch(jump);
        }

        if is_comparison(op.kind) && (is_comparison_expr(left) || is_comparison_expr(right)) {
            return Err(self.error(
                op.clone(),
                "Chained comparisons are not allowed; parenthesize and compare explicitly.",
            ));
        }

        let opcode = match op.kind {
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Subtract,
            TokenKind::Star => OpCode::Multiply,
            TokenKind::Slash => OpCode::Divide,
            TokenKind::Percent => OpCode::Mod,
            TokenKind::BitshiftLeft => OpCode::BitshiftLeft,
            TokenKind::BitshiftRight => OpCode::BitshiftRight,
            TokenKind::BitAnd => OpCode::BitwiseAnd,
            TokenKind::BitOr => OpCode::BitwiseOr,
            TokenKind::BitXor => OpCode::BitwiseXor,
            TokenKind::EqualEqual => OpCode::Equal,
            TokenKind::BangEqual => OpCode::NotEqual,
            TokenKind::Greater => OpCode::Greater,
            TokenKind::GreaterEqual => OpCode::GreaterEqual,
            TokenKind::Less => OpCode::Less,
            TokenKind::LessEqual => OpCode::LessEqual,
            _ => return Err(self.error(op.clone(), "Unexpected binary operator.")),
        };
        self.expression(left)?;
        self.expression(right)?;
        self.current.emit_op(opcode);
        Ok(())
    }

    fn conditional(
        &mut self,
        condition: &Expr,
        then_branch: &Expr,
        else_branch: Option<&Expr>,
    ) -> CResult<()> {
        self.expression(condition)?;
        let then_jump = self.current.emit_jump(OpCode::JumpIfFalsePop);
        self.expression(then_branch)?;
        let else_jump = self.current.emit_jump(OpCode::Jump);
        self.patch(then_jump)?;
        match else_branch {
            Some(e) => self.expression(e)?,
            None => self.current.emit_op(OpCode::Nil),
        }
        self.patch(else_jump)
    }

    fn set_field(
        &mut self,
        accessor: &Token,
        target: &Expr,
        field: &Expr,
        value: &Expr,
    ) -> CResult<()> {
        self.set_line(accessor);
        match accessor.kind {
            TokenKind::LeftBracket => {
                // Computed keys go through the generic SET.
                self.expression(value)?;
                self.expression(target)?;
                self.expression(field)?;
                self.current.emit_op(OpCode::Set);
                Ok(())
            }
            TokenKind::Dot => {
                // A dot field is always a known name; a constant skips
                // the stack traffic.
                self.expression(value)?;
                self.expression(target)?;
                let name = self.field_name(field)?;
                let idx = self.identifier_constant(&name)?;
                if idx <= SHORT_CONSTANT_LIMIT {
                    self.current.emit_op(OpCode::SetProperty);
                    self.current.emit_byte(idx as u8);
                } else {
                    self.current.emit_op_u16(OpCode::SetPropertyLong, idx);
                }
                Ok(())
            }
            _ => Err(self.error(accessor.clone(), "Unexpected accessor.")),
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr]) -> CResult<()> {
        // receiver.name(args) fuses lookup and call into INVOKE.
        if let Expr::FieldAccess {
            accessor,
            target,
            field,
        } = callee
            && accessor.kind == TokenKind::Dot
        {
            self.expression(target)?;
            self.arg_list(args)?;
            let name = self.field_name(field)?;
            let idx = self.identifier_constant(&name)?;
            if idx > SHORT_CONSTANT_LIMIT {
                self.current.emit_op(OpCode::InvokeLong);
                self.current.emit_byte(args.len() as u8);
                self.current.emit_u16(idx);
            } else {
                self.current.emit_op(OpCode::Invoke);
                self.current.emit_byte(args.len() as u8);
                self.current.emit_byte(idx as u8);
            }
            return Ok(());
        }

        if let Expr::Super { method } = callee {
            let superclass = self.super_context(method)?;
            let this = Token::synthetic("this");
            self.named_var(&this, false)?;
            self.arg_list(args)?;
            let idx = self.identifier_constant(method)?;
            // The superclass rides the stack and is popped by the invoke.
            self.emit_constant(method, Value::object(superclass))?;
            if idx > SHORT_CONSTANT_LIMIT {
                self.current.emit_op(OpCode::SuperInvokeLong);
                self.current.emit_byte(args.len() as u8);
                self.current.emit_u16(idx);
            } else {
                self.current.emit_op(OpCode::SuperInvoke);
                self.current.emit_byte(args.len() as u8);
                self.current.emit_byte(idx as u8);
            }
            return Ok(());
        }

        self.expression(callee)?;
        self.arg_list(args)?;
        self.current.emit_op(OpCode::Call);
        self.current.emit_byte(args.len() as u8);
        Ok(())
    }

    fn arg_list(&mut self, args: &[Expr]) -> CResult<()> {
        if args.len() > u8::MAX as usize {
            return Err(self.system_err("Too many call arguments."));
        }
        for arg in args {
            self.expression(arg)?;
        }
        Ok(())
    }

    fn field_access(&mut self, accessor: &Token, target: &Expr, field: &Expr) -> CResult<()> {
        self.set_line(accessor);
        self.expression(target)?;
        match accessor.kind {
            TokenKind::LeftBracket => {
                self.expression(field)?;
                self.current.emit_op(OpCode::Get);
                Ok(())
            }
            TokenKind::Dot => {
                let name = self.field_name(field)?;
                let idx = self.identifier_constant(&name)?;
                if idx <= SHORT_CONSTANT_LIMIT {
                    self.current.emit_op(OpCode::GetProperty);
                    self.current.emit_byte(idx as u8);
                } else {
                    self.current.emit_op_u16(OpCode::GetPropertyLong, idx);
                }
                Ok(())
            }
            _ => Err(self.error(accessor.clone(), "Unexpected accessor.")),
        }
    }

    fn array_literal(&mut self, members: &[Expr]) -> CResult<()> {
        if members.len() > u8::MAX as usize {
            return Err(self.system_err("Array literal has too many elements."));
        }
        // Members land on the stack in order; the VM pops them in reverse.
        for member in members {
            self.expression(member)?;
        }
        self.current.emit_op(OpCode::CreateArray);
        self.current.emit_byte(members.len() as u8);
        Ok(())
    }

    fn struct_literal(&mut self, fields: &[StructEntry]) -> CResult<()> {
        if fields.len() > u8::MAX as usize {
            return Err(self.system_err("Struct literal has too many fields."));
        }
        let mut constants = Vec::with_capacity(fields.len());
        let mut is_long = false;
        for entry in fields {
            self.expression(&entry.value)?;
            self.set_line(&entry.name);
            let idx = self.identifier_constant(&entry.name)?;
            if idx > SHORT_CONSTANT_LIMIT {
                is_long = true;
            }
            constants.push(idx);
        }
        // Field names are emitted in reverse: the VM pairs them with
        // values popped off the stack.
        if is_long {
            self.current.emit_op(OpCode::CreateStructLong);
            self.current.emit_byte(constants.len() as u8);
            for &c in constants.iter().rev() {
                self.current.emit_u16(c);
            }
        } else {
            self.current.emit_op(OpCode::CreateStruct);
            self.current.emit_byte(constants.len() as u8);
            for &c in constants.iter().rev() {
                self.current.emit_byte(c as u8);
            }
        }
        Ok(())
    }

    fn super_access(&mut self, method: &Token) -> CResult<()> {
        let superclass = self.super_context(method)?;
        let idx = self.identifier_constant(method)?;
        // `this` is always local slot 0 of a method body.
        let this = Token::synthetic("this");
        self.named_var(&this, false)?;
        self.emit_constant(method, Value::object(superclass))?;
        if idx <= SHORT_CONSTANT_LIMIT {
            self.current.emit_op(OpCode::GetSuper);
            self.current.emit_byte(idx as u8);
        } else {
            self.current.emit_op_u16(OpCode::GetSuperLong, idx);
        }
        Ok(())
    }

    fn super_context(&mut self, method: &Token) -> CResult<NonNull<Obj>> {
        self.set_line(method);
        match self.class_state.as_deref() {
            None => Err(self.error(method.clone(), "Can't use 'super' outside of a class.")),
            Some(state) => match state.superclass {
                Some(ptr) => Ok(ptr),
                None => Err(self.error(
                    method.clone(),
                    "Can't use 'super' in a class with no superclass.",
                )),
            },
        }
    }

    // =========================================================================
    // Functions
    // =========================================================================

    fn function(
        &mut self,
        name: &str,
        params: &[Token],
        body: &[Stmt],
        kind: FuncKind,
    ) -> CResult<(NonNull<Obj>, Vec<UpvalueInfo>)> {
        self.begin_func(kind);
        self.current.name = name.to_owned();
        self.current.arity = params.len() as u8;
        let result = self.function_body(params, body);
        // The state always unwinds, even when the body errored, so the
        // statement driver resynchronizes in the right function.
        let finished = self.end_func();
        result?;
        finished
    }

    fn function_body(&mut self, params: &[Token], body: &[Stmt]) -> CResult<()> {
        if params.len() > u8::MAX as usize {
            return Err(self.system_err("Too many parameters."));
        }
        // Returning pops the whole frame, so the body scope never needs
        // an explicit end.
        self.begin_scope();
        // Arguments sit on the stack in call order; each becomes a local.
        for param in params {
            let index = self.parse_var(param)?;
            self.define_var(index);
        }
        for stmt in body {
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn begin_func(&mut self, kind: FuncKind) {
        let line = self.current.line;
        let file = self.current.file;
        let enclosing = std::mem::replace(&mut self.current, FuncState::new(kind));
        self.current.line = line;
        self.current.file = file;
        self.current.enclosing = Some(Box::new(enclosing));
    }

    /// Seal the current function: implicit return, merge its chunk into
    /// the shared code block, restore the enclosing state.
    fn end_func(&mut self) -> CResult<(NonNull<Obj>, Vec<UpvalueInfo>)> {
        if !self.current.has_return {
            self.emit_return();
        }
        let enclosing = match self.current.enclosing.take() {
            Some(e) => e,
            None => return Err(self.system_err("Function state underflow.")),
        };
        let finished = std::mem::replace(&mut self.current, *enclosing);
        Ok(self.seal(finished))
    }

    fn seal(&mut self, state: FuncState) -> (NonNull<Obj>, Vec<UpvalueInfo>) {
        let FuncState {
            chunk,
            name,
            arity,
            upvalues,
            ..
        } = state;
        let (bytecode_offset, constants_offset) = self.code.append(chunk);
        let func = self.gc.alloc(ObjBody::Function(ObjFunction {
            name,
            arity,
            upvalue_count: upvalues.len() as u8,
            bytecode_offset,
            constants_offset,
        }));
        (func, upvalues)
    }

    fn emit_return(&mut self) {
        // Constructors implicitly return the instance in slot 0.
        if self.current.kind == FuncKind::Constructor {
            self.current.emit_op(OpCode::GetLocal);
            self.current.emit_byte(0);
        } else {
            self.current.emit_op(OpCode::Nil);
        }
        self.current.emit_op(OpCode::Return);
    }

    fn emit_closure(&mut self, func: NonNull<Obj>, upvalues: &[UpvalueInfo]) -> CResult<()> {
        if upvalues.is_empty() {
            // Nothing to capture: the closure itself is a constant.
            let closure = self.gc.alloc(ObjBody::Closure(ObjClosure {
                function: func,
                upvalues: Vec::new(),
            }));
            let idx = self.make_constant_raw(Value::object(closure))?;
            return self.emit_constant_index(idx);
        }
        let constant = self.make_constant_raw(Value::object(func))?;
        if constant <= SHORT_CONSTANT_LIMIT {
            self.current.emit_op(OpCode::Closure);
            self.current.emit_byte(constant as u8);
        } else {
            self.current.emit_op_u16(OpCode::ClosureLong, constant);
        }
        for up in upvalues {
            self.current.emit_byte(u8::from(up.is_local));
            self.current.emit_byte(up.index);
        }
        Ok(())
    }

    /// The completed script function, sealed and wrapped in a closure.
    fn finish(mut self) -> Program {
        if !self.current.has_return {
            self.emit_return();
        }
        let mut script = std::mem::replace(&mut self.current, FuncState::new(FuncKind::Script));
        script.name = "script".to_owned();
        let (func, _) = self.seal(script);
        let main = self.gc.alloc(ObjBody::Closure(ObjClosure {
            function: func,
            upvalues: Vec::new(),
        }));

        // Compile-time collection: the compiler is the sole root
        // provider, and everything it produced is a root.
        let code = &self.code;
        let globals = &self.globals;
        self.gc.collect_with(|gray| {
            for &constant in &code.constants {
                mark_value(constant, gray);
            }
            for global in globals {
                mark_value(global.value, gray);
            }
            gray.push(main);
        });
        self.gc
            .should_collect
            .store(false, std::sync::atomic::Ordering::SeqCst);

        Program {
            code: self.code,
            globals: self.globals,
            main,
            source_files: self.source_files,
        }
    }

    // =========================================================================
    // Name resolution
    // =========================================================================

    /// Read or write a name through the local -> upvalue -> global ->
    /// native tiers.
    fn named_var(&mut self, token: &Token, can_assign: bool) -> CResult<()> {
        self.set_line(token);
        if let Some(slot) = self.resolve_local(token)? {
            self.current.emit_op(if can_assign {
                OpCode::SetLocal
            } else {
                OpCode::GetLocal
            });
            self.current.emit_byte(slot);
            return Ok(());
        }
        if let Some(idx) = self.resolve_upvalue(token)? {
            self.current.emit_op(if can_assign {
                OpCode::SetUpvalue
            } else {
                OpCode::GetUpvalue
            });
            self.current.emit_byte(idx);
            return Ok(());
        }
        let resolution = self.resolve_global(token, can_assign)?;
        if let GlobalRes::Found(index) = resolution {
            if index > SHORT_CONSTANT_LIMIT as usize {
                self.current.emit_op_u16(
                    if can_assign {
                        OpCode::SetGlobalLong
                    } else {
                        OpCode::GetGlobalLong
                    },
                    index as u16,
                );
            } else {
                self.current.emit_op(if can_assign {
                    OpCode::SetGlobal
                } else {
                    OpCode::GetGlobal
                });
                self.current.emit_byte(index as u8);
            }
            return Ok(());
        }
        // Last tier: registered native functions.
        if let Some(native) = self.natives.lookup(&token.lexeme) {
            self.current.emit_op_u16(OpCode::GetNative, native);
            return Ok(());
        }
        match resolution {
            GlobalRes::UseBeforeInit => Err(self.error(
                token.clone(),
                format!(
                    "Trying to access variable '{}' before it's initialized.",
                    token.lexeme
                ),
            )),
            _ => Err(self.error(
                token.clone(),
                format!(
                    "'{}' doesn't match any declared variable name or native function name.",
                    token.lexeme
                ),
            )),
        }
    }

    fn resolve_local(&mut self, token: &Token) -> CResult<Option<u8>> {
        match resolve_local_in(&self.current, &token.lexeme) {
            LocalRes::Slot(slot) => Ok(Some(slot)),
            LocalRes::OwnInitializer => Err(self.error(
                token.clone(),
                "Can't read local variable in its own initializer.",
            )),
            LocalRes::NotFound => Ok(None),
        }
    }

    fn resolve_upvalue(&mut self, token: &Token) -> CResult<Option<u8>> {
        match resolve_upvalue_in(&mut self.current, &token.lexeme) {
            Ok(found) => Ok(found),
            Err(UpvalueError::OwnInitializer) => Err(self.error(
                token.clone(),
                "Can't read local variable in its own initializer.",
            )),
            Err(UpvalueError::TooMany) => Err(self.error(
                token.clone(),
                "Too many closure variables in function.",
            )),
        }
    }

    /// Resolve a name against the global table: the current module's
    /// declarations first, then (for reads) the exports of unaliased
    /// imports.
    fn resolve_global(&mut self, token: &Token, can_assign: bool) -> CResult<GlobalRes> {
        let units = self.units;
        let unit = &units[self.cur_unit];
        let mut index = self.cur_global_base;
        let mut found: Option<(usize, DeclKind)> = None;
        for decl in &unit.top_declarations {
            if decl.name == token.lexeme {
                // A reference in top-level code to a not-yet-initialized
                // global provably runs before its initializer. Function
                // bodies run later, so forward references from them are
                // fine (and mutual recursion depends on it).
                if !self.globals[index].defined && self.current.kind == FuncKind::Script {
                    return Ok(GlobalRes::UseBeforeInit);
                }
                found = Some((index, decl.kind));
                break;
            }
            index += 1;
        }

        if can_assign {
            return match found {
                Some((_, DeclKind::Function)) => {
                    Err(self.error(token.clone(), "Cannot assign to a function."))
                }
                Some((_, DeclKind::Class)) => {
                    Err(self.error(token.clone(), "Cannot assign to a class."))
                }
                Some((index, DeclKind::Let)) => Ok(GlobalRes::Found(index)),
                None => Err(self.error(
                    token.clone(),
                    "Cannot assign to a variable not declared in this module.",
                )),
            };
        }

        match found {
            Some((index, _)) => Ok(GlobalRes::Found(index)),
            None => self.check_symbol(token),
        }
    }

    /// Search the exports of every unaliased dependency. Exactly one
    /// match resolves; more than one is an ambiguity error.
    fn check_symbol(&mut self, token: &Token) -> CResult<GlobalRes> {
        let units = self.units;
        let unit = &units[self.cur_unit];
        let mut matches: Vec<usize> = Vec::new();
        for dep in &unit.dependencies {
            if dep.alias.is_some() {
                continue;
            }
            let dep_module = &units[dep.module];
            if !dep_module.exports.iter().any(|e| e == &token.lexeme) {
                continue;
            }
            if let Some(pos) = dep_module
                .top_declarations
                .iter()
                .position(|d| d.name == token.lexeme)
            {
                matches.push(global_base(units, dep.module) + pos);
            }
        }
        match matches.len() {
            0 => Ok(GlobalRes::NotFound),
            1 => Ok(GlobalRes::Found(matches[0])),
            _ => Err(self.error(
                token.clone(),
                format!(
                    "'{}' is exported by more than one imported module; import one with an alias.",
                    token.lexeme
                ),
            )),
        }
    }

    /// Resolve `alias::name` to a global index.
    fn resolve_module_variable(&mut self, module: &Token, name: &Token) -> CResult<usize> {
        let units = self.units;
        let unit = &units[self.cur_unit];
        let dep = unit.dependencies.iter().find(|d| {
            d.alias
                .as_ref()
                .is_some_and(|alias| alias.lexeme == module.lexeme)
        });
        let Some(dep) = dep else {
            return Err(self.error(module.clone(), "Module alias doesn't exist."));
        };
        let dep_module = &units[dep.module];
        if !dep_module.exports.iter().any(|e| e == &name.lexeme) {
            return Err(self.error(
                name.clone(),
                format!("Module {} doesn't export this symbol.", module.lexeme),
            ));
        }
        match dep_module
            .top_declarations
            .iter()
            .position(|d| d.name == name.lexeme)
        {
            Some(pos) => Ok(global_base(units, dep.module) + pos),
            None => Err(self.system_err("Exported symbol missing from module declarations.")),
        }
    }

    /// Declare a variable; for globals, return its table index.
    fn parse_var(&mut self, name: &Token) -> CResult<u16> {
        self.set_line(name);
        self.declare_var(name)?;
        if self.current.scope_depth > 0 {
            return Ok(0);
        }
        let start = self.cur_global_base;
        for (i, global) in self.globals[start..].iter().enumerate() {
            if global.name == name.lexeme {
                return Ok((start + i) as u16);
            }
        }
        Err(self.system_err(format!(
            "Global '{}' missing from the declaration table.",
            name.lexeme
        )))
    }

    /// Reserve a stack slot for a local; globals are pre-declared.
    fn declare_var(&mut self, name: &Token) -> CResult<()> {
        if self.current.scope_depth == 0 {
            return Ok(());
        }
        for local in self.current.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.current.scope_depth as i32 {
                break;
            }
            if local.name == name.lexeme {
                return Err(self.error(
                    name.clone(),
                    "Already a variable with this name in this scope.",
                ));
            }
        }
        if self.current.locals.len() == LOCAL_MAX {
            return Err(self.error(name.clone(), "Too many local variables in function."));
        }
        self.current.locals.push(Local {
            name: name.lexeme.clone(),
            depth: -1,
            captured: false,
        });
        Ok(())
    }

    /// Mark a local ready, or flag a global's cell as initialized.
    fn define_var(&mut self, index: u16) {
        if self.current.scope_depth > 0 {
            if let Some(local) = self.current.locals.last_mut() {
                local.depth = self.current.scope_depth as i32;
            }
            return;
        }
        self.globals[index as usize].defined = true;
    }

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        let mut to_pop = 0u32;
        while let Some(local) = self.current.locals.last() {
            if local.depth > self.current.scope_depth as i32 {
                self.current.locals.pop();
                to_pop += 1;
            } else {
                break;
            }
        }
        if to_pop == 1 {
            self.current.emit_op(OpCode::Pop);
        } else if to_pop > 1 {
            self.current.emit_op(OpCode::PopN);
            self.current.emit_byte(to_pop as u8);
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn set_line(&mut self, token: &Token) {
        self.current.line = token.line;
    }

    fn number_value(&mut self, token: &Token) -> CResult<f64> {
        match token.lexeme.parse::<f64>() {
            Ok(v) => Ok(v),
            Err(_) => Err(self.error(token.clone(), "Invalid number literal.")),
        }
    }

    fn field_name(&mut self, field: &Expr) -> CResult<Token> {
        match field {
            Expr::Literal { token } if token.kind == TokenKind::Identifier => Ok(token.clone()),
            _ => Err(self.system_err("Dot access field must be an identifier.")),
        }
    }

    /// Interned-string constant for an identifier token.
    fn identifier_constant(&mut self, token: &Token) -> CResult<u16> {
        self.set_line(token);
        let s = self.gc.intern(&token.lexeme);
        self.make_constant(token, Value::object(s))
    }

    fn make_constant(&mut self, token: &Token, value: Value) -> CResult<u16> {
        let idx = self.current.chunk.add_constant(value);
        if idx > u16::MAX as usize {
            return Err(self.error(token.clone(), "Too many constants in one chunk."));
        }
        Ok(idx as u16)
    }

    fn make_constant_raw(&mut self, value: Value) -> CResult<u16> {
        let idx = self.current.chunk.add_constant(value);
        if idx > u16::MAX as usize {
            return Err(self.system_err("Too many constants in one chunk."));
        }
        Ok(idx as u16)
    }

    fn emit_constant(&mut self, token: &Token, value: Value) -> CResult<()> {
        let idx = self.make_constant(token, value)?;
        self.emit_constant_index(idx)
    }

    fn emit_constant_index(&mut self, idx: u16) -> CResult<()> {
        if idx <= SHORT_CONSTANT_LIMIT {
            self.current.emit_op(OpCode::Constant);
            self.current.emit_byte(idx as u8);
        } else {
            self.current.emit_op_u16(OpCode::ConstantLong, idx);
        }
        Ok(())
    }

    fn patch(&mut self, offset: usize) -> CResult<()> {
        let r = self.current.patch_jump(offset);
        self.emit_result(r)
    }

    fn scope_patch(&mut self, kind: ScopeJumpKind) -> CResult<()> {
        let r = self.current.patch_scope_jumps(kind);
        self.emit_result(r)
    }

    fn emit_result(&mut self, result: Result<(), &'static str>) -> CResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(message) => Err(self.system_err(message)),
        }
    }

    fn error(&mut self, token: Token, message: impl Into<String>) -> Unwind {
        self.errors.compile_error(message, token);
        Unwind
    }

    fn system_err(&mut self, message: impl Into<String>) -> Unwind {
        let file = self
            .source_files
            .get(self.cur_unit)
            .cloned()
            .unwrap_or_default();
        self.errors.system_error(format!(
            "Compile error [line {}] in '{}': {}",
            self.current.line + 1,
            file,
            message.into()
        ));
        Unwind
    }
}

/// Global-table index of a module's first declaration.
fn global_base(units: &[Module], module: usize) -> usize {
    units[..module]
        .iter()
        .map(|u| u.top_declarations.len())
        .sum()
}

fn resolve_local_in(func: &FuncState, name: &str) -> LocalRes {
    for (i, local) in func.locals.iter().enumerate().rev() {
        if local.name == name {
            if local.depth == -1 {
                return LocalRes::OwnInitializer;
            }
            return LocalRes::Slot(i as u8);
        }
    }
    LocalRes::NotFound
}

/// Resolve `name` as a capture of an enclosing function's variable,
/// threading the capture through intermediate functions.
fn resolve_upvalue_in(func: &mut FuncState, name: &str) -> Result<Option<u8>, UpvalueError> {
    let Some(enclosing) = func.enclosing.as_deref_mut() else {
        return Ok(None);
    };

    let mut captured_local = None;
    match resolve_local_in(enclosing, name) {
        LocalRes::Slot(slot) => {
            enclosing.locals[slot as usize].captured = true;
            captured_local = Some(slot);
        }
        LocalRes::OwnInitializer => return Err(UpvalueError::OwnInitializer),
        LocalRes::NotFound => {}
    }
    let transitive = if captured_local.is_none() {
        resolve_upvalue_in(enclosing, name)?
    } else {
        None
    };

    if let Some(slot) = captured_local {
        return add_upvalue(func, slot, true).map(Some);
    }
    if let Some(index) = transitive {
        return add_upvalue(func, index, false).map(Some);
    }
    Ok(None)
}

/// Record a capture, deduplicating against identical existing ones.
fn add_upvalue(func: &mut FuncState, index: u8, is_local: bool) -> Result<u8, UpvalueError> {
    for (i, up) in func.upvalues.iter().enumerate() {
        if up.index == index && up.is_local == is_local {
            return Ok(i as u8);
        }
    }
    if func.upvalues.len() == UPVALUE_MAX {
        return Err(UpvalueError::TooMany);
    }
    func.upvalues.push(UpvalueInfo { index, is_local });
    Ok((func.upvalues.len() - 1) as u8)
}

fn is_comparison(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual
    )
}

fn is_comparison_expr(expr: &Expr) -> bool {
    matches!(expr, Expr::Binary { op, .. } if is_comparison(op.kind))
}

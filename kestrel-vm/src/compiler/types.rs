// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Compiler-time entities: per-function state, class context, limits.

use std::ptr::NonNull;

use kestrel_ast::DeclKind;

use crate::chunk::Chunk;
use crate::object::Obj;
use crate::opcode::OpCode;
use crate::value::Value;

/// Locals per function; slot indexes are one byte.
pub const LOCAL_MAX: usize = 256;
/// Upvalues per function; upvalue indexes are one byte.
pub const UPVALUE_MAX: usize = 256;
/// Largest constant index the short opcode variants can carry.
pub const SHORT_CONSTANT_LIMIT: u16 = u8::MAX as u16;

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    /// The implicit top-level function spanning all modules.
    Script,
    Function,
    Method,
    Constructor,
}

/// A lexically scoped stack slot. `depth` is -1 between declaration and
/// initialization, which is how reads inside the initializer are caught.
#[derive(Debug)]
pub struct Local {
    pub name: String,
    pub depth: i32,
    pub captured: bool,
}

/// A capture recorded on the function being compiled: index into the
/// enclosing function's locals (`is_local`) or upvalue array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueInfo {
    pub index: u8,
    pub is_local: bool,
}

/// The flavors of pending scope jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeJumpKind {
    Break,
    Continue,
    Advance,
}

impl ScopeJumpKind {
    /// The placeholder opcode emitted at the jump site; patched into
    /// `JumpPopN` when the enclosing loop or switch finishes.
    pub fn placeholder(self) -> OpCode {
        match self {
            ScopeJumpKind::Break => OpCode::ScopeJumpBreak,
            ScopeJumpKind::Continue => OpCode::ScopeJumpContinue,
            ScopeJumpKind::Advance => OpCode::ScopeJumpAdvance,
        }
    }
}

/// Everything tracked while compiling one function body. Nested function
/// literals push a fresh state and link back through `enclosing`.
pub struct FuncState {
    pub enclosing: Option<Box<FuncState>>,
    pub kind: FuncKind,
    pub chunk: Chunk,
    pub name: String,
    pub arity: u8,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueInfo>,
    pub scope_depth: u32,
    /// Scope depths that directly contain a loop; break/continue consult
    /// the innermost entry.
    pub scopes_with_loop: Vec<u32>,
    /// Scope depths that directly contain a switch.
    pub scopes_with_switch: Vec<u32>,
    /// Bytecode positions of pending scope-jump patch sites.
    pub scope_jumps: Vec<usize>,
    /// Whether the most recent statement in the body was a return; when
    /// set, no implicit return is appended.
    pub has_return: bool,
    pub line: u32,
    pub file: u16,
}

impl FuncState {
    pub fn new(kind: FuncKind) -> Self {
        // Slot 0 belongs to the callee; in methods and constructors it is
        // addressable as `this`.
        let slot_zero = Local {
            name: match kind {
                FuncKind::Method | FuncKind::Constructor => "this".to_owned(),
                _ => String::new(),
            },
            depth: 0,
            captured: false,
        };
        Self {
            enclosing: None,
            kind,
            chunk: Chunk::new(),
            name: String::new(),
            arity: 0,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            scopes_with_loop: Vec::new(),
            scopes_with_switch: Vec::new(),
            scope_jumps: Vec::new(),
            has_return: false,
            line: 0,
            file: 0,
        }
    }
}

/// Class declaration context; tracks the superclass for `super`
/// resolution and nesting for methods-within-methods errors.
pub struct ClassState {
    pub enclosing: Option<Box<ClassState>>,
    pub superclass: Option<NonNull<Obj>>,
}

/// One global-table entry. The index of the entry is stable and is what
/// the bytecode embeds.
pub struct Global {
    pub name: String,
    pub value: Value,
    pub defined: bool,
    pub kind: DeclKind,
}

// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Bytecode instruction set.
//!
//! Single-byte opcodes; short operands are 8-bit, long operands 16-bit
//! big-endian. Jump offsets are unsigned and relative to the byte after
//! the offset. Opcodes that reference the constant pool come in a short
//! (8-bit index) and a long (16-bit index) variant.

/// Bytecode instructions for the Kestrel VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // =========================================================================
    // Stack shuffling
    // =========================================================================
    /// Pop the top value.
    Pop,
    /// `u8 n`: pop n values.
    PopN,

    // =========================================================================
    // Literals
    // =========================================================================
    /// `u8 idx`: push constant.
    Constant,
    /// `u16 idx`: push constant.
    ConstantLong,
    Nil,
    True,
    False,
    /// `u8 n`: push the int n without touching the pool.
    LoadInt,

    // =========================================================================
    // Arithmetic
    // =========================================================================
    /// Numbers add (int + int stays int unless it overflows to double);
    /// two strings concatenate.
    Add,
    Subtract,
    Multiply,
    Divide,
    /// Integer-only.
    Mod,
    /// Integer-only.
    BitshiftLeft,
    /// Integer-only.
    BitshiftRight,
    /// Integer-only.
    BitwiseAnd,
    /// Integer-only.
    BitwiseOr,
    /// Integer-only.
    BitwiseXor,
    Negate,
    /// Bitwise complement, integer-only.
    BinNot,
    /// Logical not; pushes a bool.
    Not,
    /// `u8 args`: fused increment/decrement. The operand packs sign,
    /// prefix/postfix and the target kind; further operand bytes depend
    /// on the target kind.
    Increment,

    // =========================================================================
    // Comparison
    // =========================================================================
    /// Deep equality on strings, value equality otherwise.
    Equal,
    NotEqual,
    Greater,
    /// Inclusive comparisons tolerate DBL_EPSILON.
    GreaterEqual,
    Less,
    LessEqual,

    // =========================================================================
    // Variables
    // =========================================================================
    /// `u8 slot`: push a local; redirects through an upvalue cell when
    /// the slot holds one.
    GetLocal,
    /// `u8 slot`: store top of stack into a local (upvalue-aware).
    SetLocal,
    /// `u8 idx`: push from the frame closure's upvalue array.
    GetUpvalue,
    /// `u8 idx`: store into the frame closure's upvalue array.
    SetUpvalue,
    /// `u8 idx`: push a global cell's value.
    GetGlobal,
    /// `u16 idx`.
    GetGlobalLong,
    /// `u8 idx`: store top of stack into a global cell, leaving it.
    SetGlobal,
    /// `u16 idx`.
    SetGlobalLong,
    /// `u8 idx`: pop into a global cell.
    DefineGlobal,
    /// `u16 idx`.
    DefineGlobalLong,
    /// `u16 idx`: push a registered native function.
    GetNative,

    // =========================================================================
    // Control flow
    // =========================================================================
    /// `u16 off`: jump forward.
    Jump,
    /// `u16 off`: jump forward if the top is truthy. Does not pop.
    JumpIfTrue,
    /// `u16 off`: jump forward if the top is falsey. Does not pop.
    JumpIfFalse,
    /// `u16 off`: pop, jump forward if it was falsey.
    JumpIfFalsePop,
    /// `u16 off`: jump backward.
    Loop,
    /// `u16 off`: pop, jump backward if it was truthy.
    LoopIfTrue,
    /// `u8 n, u16 off`: pop n values, then jump forward. Break, continue
    /// and advance patch into this.
    JumpPopN,
    /// `u16 n`, n 8-bit constant indexes, n+1 16-bit forward jumps (one
    /// per case plus the default). Linear scan on raw value equality.
    Switch,
    /// Same, with 16-bit constant indexes.
    SwitchLong,

    // =========================================================================
    // Functions
    // =========================================================================
    /// `u8 argc`: call the value at stack\[top - argc - 1\].
    Call,
    /// Pop the result, pop the frame, write the result into the old base
    /// slot.
    Return,
    /// `u8 idx`, then one `(is_local: u8, index: u8)` pair per upvalue:
    /// build a closure from the function constant.
    Closure,
    /// `u16 idx`, same pairs.
    ClosureLong,
    /// `u8 argc, u8 name-idx`: fused property lookup + call.
    Invoke,
    /// `u8 argc, u16 name-idx`.
    InvokeLong,
    /// `u8 argc, u8 name-idx`: invoke starting from the superclass on
    /// top of the stack.
    SuperInvoke,
    /// `u8 argc, u16 name-idx`.
    SuperInvokeLong,
    /// `u8 name-idx`: bind a superclass method over the receiver on top.
    GetSuper,
    /// `u16 name-idx`.
    GetSuperLong,

    // =========================================================================
    // Objects and arrays
    // =========================================================================
    /// `u16 name-idx`: push a fresh class.
    Class,
    /// `u16 name-idx`: pop a method closure into the class below it.
    Method,
    /// Copy the methods of the class at peek(1) down into the class on
    /// top.
    Inherit,
    /// `u8 n`: pop n elements into a fresh array.
    CreateArray,
    /// `u8 n`, then n 8-bit field-name constants in reverse: pop n
    /// values into a fresh struct literal.
    CreateStruct,
    /// `u8 n`, then n 16-bit field-name constants in reverse.
    CreateStructLong,
    /// Subscript read: pops field and target.
    Get,
    /// Subscript write: pops field and target, leaves the stored value.
    Set,
    /// `u8 name-idx`: field read, method binding, or built-in method
    /// binding, in that order.
    GetProperty,
    /// `u16 name-idx`.
    GetPropertyLong,
    /// `u8 name-idx`: field write on an instance or struct.
    SetProperty,
    /// `u16 name-idx`.
    SetPropertyLong,

    // =========================================================================
    // Async
    // =========================================================================
    /// `u8 argc`: spawn a child worker over the callee and arguments,
    /// push a future.
    LaunchAsync,
    /// Pop a future, block until its worker finishes, push its result.
    Await,

    // =========================================================================
    // Scope-jump placeholders
    // =========================================================================
    // Break/continue/advance emit these with a scope depth and pop count;
    // the compiler patches them into JumpPopN when the enclosing loop or
    // switch finishes. Executing one means the compiler left it unpatched.
    ScopeJumpBreak,
    ScopeJumpContinue,
    ScopeJumpAdvance,
}

impl OpCode {
    /// Decode a byte; `None` for bytes past the last opcode.
    #[inline]
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        if byte <= OpCode::ScopeJumpAdvance as u8 {
            // SAFETY: repr(u8) with contiguous discriminants from zero;
            // the bound is the last variant.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            None
        }
    }
}

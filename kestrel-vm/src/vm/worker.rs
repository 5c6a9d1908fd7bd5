// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Worker execution: the fetch-decode-execute loop.
//!
//! Every worker owns a fixed value stack and frame stack. The top of each
//! dispatch iteration is the safepoint: the cancel token is checked, then
//! the collection flag. The instruction pointer, frame base and constant
//! offset are cached in locals across dispatch and re-synced around
//! calls.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::chunk::Code;
use crate::natives::{BuiltinMethod, BuiltinTables};
use crate::object::{
    self, Obj, ObjArray, ObjBody, ObjBoundMethod, ObjBoundNative, ObjClass, ObjClosure,
    ObjFunction, ObjFuture, ObjInstance, ObjUpvalue, GrayStack, mark_value,
};
use crate::opcode::OpCode;
use crate::value::{FLOAT_EQ_EPSILON, Value, values_equal};
use crate::vm::Vm;
use crate::vm::error::{Result, RuntimeError};
use crate::vm::frame::CallFrame;

/// Call-frame ceiling per worker.
pub const FRAMES_MAX: usize = 64;
/// Value-stack slots per worker.
pub const STACK_MAX: usize = FRAMES_MAX * 1024;

/// How a dispatch loop ended, short of a runtime error.
pub(crate) enum RunExit {
    Finished(Value),
    Cancelled,
}

/// One executing thread of the VM.
pub struct Worker {
    vm: Arc<Vm>,
    stack: Box<[Value]>,
    top: usize,
    frames: Vec<CallFrame>,
    cancel: Arc<AtomicBool>,
    /// The future this worker reports into; `None` for the main worker.
    future: Option<NonNull<Obj>>,
}

// A worker is handed to its own OS thread at spawn; the raw pointers it
// carries are only touched under the safepoint protocol.
unsafe impl Send for Worker {}

impl Worker {
    pub(crate) fn new(vm: Arc<Vm>, future: Option<NonNull<Obj>>) -> Self {
        Self {
            vm,
            stack: vec![Value::NIL; STACK_MAX].into_boxed_slice(),
            top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            cancel: Arc::new(AtomicBool::new(false)),
            future,
        }
    }

    /// The shared VM; natives reach the collector and globals through it.
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.top == self.stack.len() {
            return Err(RuntimeError::stack_overflow("Stack overflow."));
        }
        self.stack[self.top] = value;
        self.top += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.top -= 1;
        self.stack[self.top]
    }

    pub fn peek(&self, depth: usize) -> Value {
        self.stack[self.top - 1 - depth]
    }

    /// Mark this worker's roots: every live stack slot and every frame's
    /// closure.
    pub(crate) fn mark(&self, gray: &mut GrayStack) {
        for &value in &self.stack[..self.top] {
            mark_value(value, gray);
        }
        for frame in &self.frames {
            gray.push(frame.closure);
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    pub(crate) fn run(&mut self) -> Result<RunExit> {
        let vm = Arc::clone(&self.vm);
        let code = &vm.code;
        let (mut ip, mut base, mut const_off) = self.frame_cache()?;

        loop {
            // Safepoint: cancellation first, then collection.
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(RunExit::Cancelled);
            }
            if vm.gc.should_collect.load(Ordering::SeqCst) {
                if self.future.is_none() {
                    vm.pause_and_collect(self);
                } else {
                    vm.park_for_collection();
                }
            }
            // Keep the frame's ip current so error traces map correctly.
            if let Some(frame) = self.frames.last_mut() {
                frame.ip = ip;
            }

            let byte = read_byte(code, &mut ip);
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(RuntimeError::malformed(format!("Unknown opcode {byte}.")));
            };

            match op {
                // Stack shuffling
                OpCode::Pop => {
                    self.top -= 1;
                }
                OpCode::PopN => {
                    let n = read_byte(code, &mut ip) as usize;
                    self.top -= n;
                }

                // Literals
                OpCode::Constant => {
                    let idx = read_byte(code, &mut ip) as usize;
                    self.push(code.constants[const_off + idx])?;
                }
                OpCode::ConstantLong => {
                    let idx = read_u16(code, &mut ip) as usize;
                    self.push(code.constants[const_off + idx])?;
                }
                OpCode::Nil => self.push(Value::NIL)?,
                OpCode::True => self.push(Value::TRUE)?,
                OpCode::False => self.push(Value::FALSE)?,
                OpCode::LoadInt => {
                    let n = read_byte(code, &mut ip);
                    self.push(Value::int(n as i32))?;
                }

                // Unary
                OpCode::Negate => {
                    let value = self.pop();
                    if !value.is_number() {
                        return Err(RuntimeError::type_error(format!(
                            "Operand must be a number, got {}.",
                            value.type_name()
                        )));
                    }
                    if value.is_int() {
                        self.push(Value::int(value.as_int().wrapping_neg()))?;
                    } else {
                        self.push(Value::double(-value.as_double()))?;
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::boolean(value.is_falsey()))?;
                }
                OpCode::BinNot => {
                    let value = self.peek(0);
                    if !value.is_number() {
                        return Err(RuntimeError::type_error(format!(
                            "Operand must be a number, got {}.",
                            value.type_name()
                        )));
                    }
                    if !value.is_int() {
                        return Err(RuntimeError::type_error(
                            "Number must be an integer, got a float.",
                        ));
                    }
                    self.stack[self.top - 1] = Value::int(!value.as_int());
                }
                OpCode::Increment => {
                    self.increment_op(code, &mut ip, base, const_off)?;
                }

                // Arithmetic
                OpCode::Add => self.add_op()?,
                OpCode::Subtract => {
                    self.arithmetic(|a, b| a - b, |a, b| a - b)?;
                }
                OpCode::Multiply => {
                    self.arithmetic(|a, b| a * b, |a, b| a * b)?;
                }
                OpCode::Divide => self.divide_op()?,
                OpCode::Mod => self.int_binary(
                    |a, b| a.wrapping_rem(b),
                    |b| b == 0,
                    "Modulo by zero.",
                )?,
                OpCode::BitshiftLeft => {
                    self.int_binary(|a, b| a.wrapping_shl(b as u32), |_| false, "")?;
                }
                OpCode::BitshiftRight => {
                    self.int_binary(|a, b| a.wrapping_shr(b as u32), |_| false, "")?;
                }
                OpCode::BitwiseAnd => self.int_binary(|a, b| a & b, |_| false, "")?,
                OpCode::BitwiseOr => self.int_binary(|a, b| a | b, |_| false, "")?,
                OpCode::BitwiseXor => self.int_binary(|a, b| a ^ b, |_| false, "")?,

                // Comparison
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(values_equal(a, b)))?;
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(!values_equal(a, b)))?;
                }
                OpCode::Greater => self.compare(|a, b| a > b)?,
                OpCode::GreaterEqual => self.compare(|a, b| a >= b - FLOAT_EQ_EPSILON)?,
                OpCode::Less => self.compare(|a, b| a < b)?,
                OpCode::LessEqual => self.compare(|a, b| a < b + FLOAT_EQ_EPSILON)?,

                // Variables
                OpCode::GetLocal => {
                    let slot = read_byte(code, &mut ip) as usize;
                    let value = self.stack[base + slot];
                    // A captured slot redirects through its upvalue cell.
                    if value.is_upvalue() {
                        let cell = upvalue_of(value.as_obj())?;
                        self.push(cell.value)?;
                    } else {
                        self.push(value)?;
                    }
                }
                OpCode::SetLocal => {
                    let slot = read_byte(code, &mut ip) as usize;
                    let current = self.stack[base + slot];
                    let value = self.peek(0);
                    if current.is_upvalue() {
                        unsafe {
                            if let ObjBody::Upvalue(cell) =
                                &mut object::obj_mut(current.as_obj()).body
                            {
                                cell.value = value;
                            }
                        }
                    } else {
                        self.stack[base + slot] = value;
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = read_byte(code, &mut ip) as usize;
                    let closure = self.current_closure()?;
                    let cell = closure_upvalue(closure, slot)?;
                    let value = upvalue_of(cell)?.value;
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = read_byte(code, &mut ip) as usize;
                    let closure = self.current_closure()?;
                    let cell = closure_upvalue(closure, slot)?;
                    let value = self.peek(0);
                    unsafe {
                        if let ObjBody::Upvalue(upvalue) = &mut object::obj_mut(cell).body {
                            upvalue.value = value;
                        }
                    }
                }
                OpCode::GetGlobal => {
                    let idx = read_byte(code, &mut ip) as usize;
                    self.push(vm.globals[idx].get())?;
                }
                OpCode::GetGlobalLong => {
                    let idx = read_u16(code, &mut ip) as usize;
                    self.push(vm.globals[idx].get())?;
                }
                OpCode::SetGlobal => {
                    let idx = read_byte(code, &mut ip) as usize;
                    vm.globals[idx].set(self.peek(0));
                }
                OpCode::SetGlobalLong => {
                    let idx = read_u16(code, &mut ip) as usize;
                    vm.globals[idx].set(self.peek(0));
                }
                OpCode::DefineGlobal => {
                    let idx = read_byte(code, &mut ip) as usize;
                    let value = self.pop();
                    vm.globals[idx].set(value);
                }
                OpCode::DefineGlobalLong => {
                    let idx = read_u16(code, &mut ip) as usize;
                    let value = self.pop();
                    vm.globals[idx].set(value);
                }
                OpCode::GetNative => {
                    let idx = read_u16(code, &mut ip) as usize;
                    let native = vm.native(idx).ok_or_else(|| {
                        RuntimeError::malformed("Native function index out of range.")
                    })?;
                    self.push(Value::object(native))?;
                }

                // Control flow
                OpCode::Jump => {
                    let offset = read_u16(code, &mut ip) as usize;
                    ip += offset;
                }
                OpCode::JumpIfTrue => {
                    let offset = read_u16(code, &mut ip) as usize;
                    if !self.peek(0).is_falsey() {
                        ip += offset;
                    }
                }
                OpCode::JumpIfFalse => {
                    let offset = read_u16(code, &mut ip) as usize;
                    if self.peek(0).is_falsey() {
                        ip += offset;
                    }
                }
                OpCode::JumpIfFalsePop => {
                    let offset = read_u16(code, &mut ip) as usize;
                    if self.pop().is_falsey() {
                        ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = read_u16(code, &mut ip) as usize;
                    ip -= offset;
                }
                OpCode::LoopIfTrue => {
                    let offset = read_u16(code, &mut ip) as usize;
                    if !self.pop().is_falsey() {
                        ip -= offset;
                    }
                }
                OpCode::JumpPopN => {
                    let n = read_byte(code, &mut ip) as usize;
                    self.top -= n;
                    let offset = read_u16(code, &mut ip) as usize;
                    ip += offset;
                }
                OpCode::Switch => {
                    let value = self.pop();
                    let n = read_u16(code, &mut ip) as usize;
                    let const_base = ip;
                    let jump_base = ip + n;
                    let mut target = jump_base + n * 2;
                    for i in 0..n {
                        let ci = code.bytecode[const_base + i] as usize;
                        if value.raw() == code.constants[const_off + ci].raw() {
                            target = jump_base + i * 2;
                            break;
                        }
                    }
                    ip = target;
                    let jump = read_u16(code, &mut ip) as usize;
                    ip += jump;
                }
                OpCode::SwitchLong => {
                    let value = self.pop();
                    let n = read_u16(code, &mut ip) as usize;
                    let const_base = ip;
                    let jump_base = ip + n * 2;
                    let mut target = jump_base + n * 2;
                    for i in 0..n {
                        let hi = code.bytecode[const_base + i * 2] as usize;
                        let lo = code.bytecode[const_base + i * 2 + 1] as usize;
                        let ci = (hi << 8) | lo;
                        if value.raw() == code.constants[const_off + ci].raw() {
                            target = jump_base + i * 2;
                            break;
                        }
                    }
                    ip = target;
                    let jump = read_u16(code, &mut ip) as usize;
                    ip += jump;
                }

                // Functions
                OpCode::Call => {
                    let argc = read_byte(code, &mut ip) as usize;
                    self.store_ip(ip);
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                    (ip, base, const_off) = self.frame_cache()?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    self.frames.pop();
                    if self.frames.is_empty() {
                        return Ok(RunExit::Finished(result));
                    }
                    self.top = base;
                    self.push(result)?;
                    (ip, base, const_off) = self.frame_cache()?;
                }
                OpCode::Closure => {
                    self.closure_op(code, &mut ip, base, const_off, false)?;
                }
                OpCode::ClosureLong => {
                    self.closure_op(code, &mut ip, base, const_off, true)?;
                }
                OpCode::Invoke | OpCode::InvokeLong => {
                    let argc = read_byte(code, &mut ip) as usize;
                    let idx = if op == OpCode::InvokeLong {
                        read_u16(code, &mut ip) as usize
                    } else {
                        read_byte(code, &mut ip) as usize
                    };
                    let name = constant_string(code, const_off + idx)?;
                    self.store_ip(ip);
                    self.invoke(name, argc)?;
                    (ip, base, const_off) = self.frame_cache()?;
                }
                OpCode::SuperInvoke | OpCode::SuperInvokeLong => {
                    let argc = read_byte(code, &mut ip) as usize;
                    let idx = if op == OpCode::SuperInvokeLong {
                        read_u16(code, &mut ip) as usize
                    } else {
                        read_byte(code, &mut ip) as usize
                    };
                    let name = constant_string(code, const_off + idx)?;
                    let superclass = self.pop();
                    let class_ptr = class_ptr_of(superclass)?;
                    self.store_ip(ip);
                    if !self.invoke_from_class(class_ptr, name, argc)? {
                        return Err(RuntimeError::name_not_found(format!(
                            "{} doesn't contain method '{}'.",
                            class_name(class_ptr),
                            name
                        )));
                    }
                    (ip, base, const_off) = self.frame_cache()?;
                }
                OpCode::GetSuper | OpCode::GetSuperLong => {
                    let idx = if op == OpCode::GetSuperLong {
                        read_u16(code, &mut ip) as usize
                    } else {
                        read_byte(code, &mut ip) as usize
                    };
                    let name = constant_string(code, const_off + idx)?;
                    let superclass = self.pop();
                    let class_ptr = class_ptr_of(superclass)?;
                    let method = class_method(class_ptr, name);
                    let Some(method) = method else {
                        return Err(RuntimeError::name_not_found(format!(
                            "{} doesn't contain method '{}'.",
                            class_name(class_ptr),
                            name
                        )));
                    };
                    let receiver = self.peek(0);
                    let bound = self.vm.gc.alloc(ObjBody::BoundMethod(ObjBoundMethod {
                        receiver,
                        method: method.as_obj(),
                    }));
                    self.stack[self.top - 1] = Value::object(bound);
                }

                // Objects and arrays
                OpCode::Class => {
                    let idx = read_u16(code, &mut ip) as usize;
                    let name = constant_string(code, const_off + idx)?;
                    let class = self.vm.gc.alloc(ObjBody::Class(ObjClass {
                        name: name.to_owned(),
                        methods: Default::default(),
                    }));
                    self.push(Value::object(class))?;
                }
                OpCode::Method => {
                    let idx = read_u16(code, &mut ip) as usize;
                    let name = constant_string(code, const_off + idx)?;
                    // The compiler emits the class below the method.
                    let method = self.peek(0);
                    let class = self.peek(1);
                    let class_ptr = class_ptr_of(class)?;
                    unsafe {
                        if let ObjBody::Class(c) = &mut object::obj_mut(class_ptr).body {
                            c.methods.insert(name.to_owned(), method);
                        }
                    }
                    self.top -= 1;
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !superclass.is_class() {
                        return Err(RuntimeError::type_error(format!(
                            "Superclass must be a class, got {}.",
                            superclass.type_name()
                        )));
                    }
                    let subclass = class_ptr_of(self.peek(0))?;
                    let (inherited, sup_ctor) = unsafe {
                        match &object::obj_ref(superclass.as_obj()).body {
                            ObjBody::Class(c) => {
                                (c.methods.clone(), c.methods.get(&c.name).copied())
                            }
                            _ => unreachable!("checked is_class above"),
                        }
                    };
                    unsafe {
                        if let ObjBody::Class(c) = &mut object::obj_mut(subclass).body {
                            for (name, method) in inherited {
                                c.methods.insert(name, method);
                            }
                            // The parent constructor answers to the
                            // subclass name until one of its own lands.
                            if let Some(ctor) = sup_ctor {
                                c.methods.insert(c.name.clone(), ctor);
                            }
                        }
                    }
                }
                OpCode::CreateArray => {
                    let n = read_byte(code, &mut ip) as usize;
                    let mut values = vec![Value::NIL; n];
                    let mut heap_ptr_count = 0;
                    // The stack holds the elements in source order; popping
                    // walks them backwards.
                    for i in (0..n).rev() {
                        let value = self.pop();
                        if value.is_obj() {
                            heap_ptr_count += 1;
                        }
                        values[i] = value;
                    }
                    let array = self.vm.gc.alloc(ObjBody::Array(ObjArray {
                        values,
                        heap_ptr_count,
                    }));
                    self.push(Value::object(array))?;
                }
                OpCode::CreateStruct | OpCode::CreateStructLong => {
                    let n = read_byte(code, &mut ip) as usize;
                    let instance = self.vm.gc.alloc(ObjBody::Instance(ObjInstance {
                        class: None,
                        fields: Default::default(),
                    }));
                    // Field names arrive in reverse declaration order,
                    // pairing with the values popped off the stack.
                    for _ in 0..n {
                        let idx = if op == OpCode::CreateStructLong {
                            read_u16(code, &mut ip) as usize
                        } else {
                            read_byte(code, &mut ip) as usize
                        };
                        let name = constant_string(code, const_off + idx)?;
                        let value = self.pop();
                        unsafe {
                            if let ObjBody::Instance(inst) = &mut object::obj_mut(instance).body {
                                inst.fields.insert(name.to_owned(), value);
                            }
                        }
                    }
                    self.push(Value::object(instance))?;
                }
                OpCode::Get => self.get_op()?,
                OpCode::Set => self.set_op()?,
                OpCode::GetProperty | OpCode::GetPropertyLong => {
                    let idx = if op == OpCode::GetPropertyLong {
                        read_u16(code, &mut ip) as usize
                    } else {
                        read_byte(code, &mut ip) as usize
                    };
                    let name = constant_string(code, const_off + idx)?;
                    self.get_property(name)?;
                }
                OpCode::SetProperty | OpCode::SetPropertyLong => {
                    let idx = if op == OpCode::SetPropertyLong {
                        read_u16(code, &mut ip) as usize
                    } else {
                        read_byte(code, &mut ip) as usize
                    };
                    let name = constant_string(code, const_off + idx)?;
                    let target = self.pop();
                    if !target.is_instance() {
                        return Err(RuntimeError::type_error(format!(
                            "Only instances and structs have properties, got {}.",
                            target.type_name()
                        )));
                    }
                    let value = self.peek(0);
                    unsafe {
                        if let ObjBody::Instance(inst) = &mut object::obj_mut(target.as_obj()).body
                        {
                            inst.fields.insert(name.to_owned(), value);
                        }
                    }
                }

                // Async
                OpCode::LaunchAsync => {
                    let argc = read_byte(code, &mut ip) as usize;
                    self.store_ip(ip);
                    self.launch_async(argc)?;
                }
                OpCode::Await => {
                    self.store_ip(ip);
                    self.await_op()?;
                }

                OpCode::ScopeJumpBreak | OpCode::ScopeJumpContinue | OpCode::ScopeJumpAdvance => {
                    return Err(RuntimeError::malformed("Unpatched scope jump executed."));
                }
            }
        }
    }

    fn store_ip(&mut self, ip: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    fn frame_cache(&self) -> Result<(usize, usize, usize)> {
        let frame = self
            .frames
            .last()
            .copied()
            .ok_or_else(|| RuntimeError::malformed("No active call frame."))?;
        let func = function_of(frame.closure)?;
        Ok((frame.ip, frame.base, func.constants_offset))
    }

    fn current_closure(&self) -> Result<NonNull<Obj>> {
        self.frames
            .last()
            .map(|f| f.closure)
            .ok_or_else(|| RuntimeError::malformed("No active call frame."))
    }

    // =========================================================================
    // Calls
    // =========================================================================

    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> Result<()> {
        if callee.is_obj() {
            match &callee.obj_ref().body {
                ObjBody::Closure(_) => return self.call_closure(callee.as_obj(), argc),
                ObjBody::Native(native) => {
                    let (func, arity) = (native.func, native.arity);
                    if arity != -1 && argc != arity as usize {
                        return Err(RuntimeError::arity(format!(
                            "Function {} expects {} arguments but got {}.",
                            native.name, arity, argc
                        )));
                    }
                    if func(self, argc)? {
                        self.collapse_native_result();
                    }
                    return Ok(());
                }
                ObjBody::BoundNative(bound) => {
                    let (func, arity, receiver) = (bound.func, bound.arity, bound.receiver);
                    if arity != -1 && argc != arity as usize {
                        return Err(RuntimeError::arity(format!(
                            "Function {} expects {} arguments but got {}.",
                            bound.name, arity, argc
                        )));
                    }
                    self.stack[self.top - argc - 1] = receiver;
                    if func(self, argc)? {
                        self.collapse_native_result();
                    }
                    return Ok(());
                }
                ObjBody::Class(class) => {
                    let class_ptr = callee.as_obj();
                    let constructor = class.methods.get(&class.name).copied();
                    // The callee slot becomes the fresh instance, so the
                    // collector can reach it through the stack.
                    let instance = self.vm.gc.alloc(ObjBody::Instance(ObjInstance {
                        class: Some(class_ptr),
                        fields: Default::default(),
                    }));
                    self.stack[self.top - argc - 1] = Value::object(instance);
                    return match constructor {
                        Some(ctor) => self.call_closure(ctor.as_obj(), argc),
                        None if argc != 0 => Err(RuntimeError::arity(format!(
                            "Class constructor expects 0 arguments but got {}.",
                            argc
                        ))),
                        None => Ok(()),
                    };
                }
                ObjBody::BoundMethod(bound) => {
                    let (receiver, method) = (bound.receiver, bound.method);
                    // The receiver lands in frame slot 0, where `this`
                    // resolves.
                    self.stack[self.top - argc - 1] = receiver;
                    return self.call_closure(method, argc);
                }
                _ => {}
            }
        }
        Err(RuntimeError::type_error(
            "Can only call functions and classes.",
        ))
    }

    fn call_closure(&mut self, closure: NonNull<Obj>, argc: usize) -> Result<()> {
        let func = function_of(closure)?;
        if argc != func.arity as usize {
            return Err(RuntimeError::arity(format!(
                "Expected {} arguments for function call but got {}.",
                func.arity, argc
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeError::stack_overflow("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: func.bytecode_offset,
            base: self.top - argc - 1,
        });
        Ok(())
    }

    /// After a native that returned `true`, the callable is still under
    /// the result; slide the result down over it.
    fn collapse_native_result(&mut self) {
        self.stack[self.top - 2] = self.stack[self.top - 1];
        self.top -= 1;
    }

    /// Fused property lookup + call: instance field first, then the class
    /// method table, then the built-in table for the receiver's kind.
    fn invoke(&mut self, name: &str, argc: usize) -> Result<()> {
        let receiver = self.peek(argc);
        if receiver.is_instance() {
            if let ObjBody::Instance(instance) = &receiver.obj_ref().body {
                if let Some(&field) = instance.fields.get(name) {
                    // A callable field replaces the receiver slot.
                    self.stack[self.top - argc - 1] = field;
                    return self.call_value(field, argc);
                }
                if let Some(class_ptr) = instance.class
                    && self.invoke_from_class(class_ptr, name, argc)?
                {
                    return Ok(());
                }
            }
        }
        let method = self.find_builtin(receiver, name)?;
        if method.arity != -1 && argc != method.arity as usize {
            return Err(RuntimeError::arity(format!(
                "Method {} expects {} arguments but got {}.",
                name, method.arity, argc
            )));
        }
        if (method.func)(self, argc)? {
            self.collapse_native_result();
        }
        Ok(())
    }

    fn invoke_from_class(
        &mut self,
        class_ptr: NonNull<Obj>,
        name: &str,
        argc: usize,
    ) -> Result<bool> {
        match class_method(class_ptr, name) {
            Some(method) => {
                // The receiver already sits in the frame's zeroth slot.
                self.call_closure(method.as_obj(), argc)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_builtin(&self, receiver: Value, name: &str) -> Result<BuiltinMethod> {
        let kind = BuiltinTables::kind_of(receiver);
        self.vm.builtins.lookup(kind, name).ok_or_else(|| {
            RuntimeError::name_not_found(format!(
                "{} doesn't contain property '{}'.",
                receiver.type_name(),
                name
            ))
        })
    }

    /// Property read: instance field, then bound class method, then bound
    /// built-in method on the receiver's primitive kind.
    fn get_property(&mut self, name: &str) -> Result<()> {
        let target = self.pop();
        if target.is_instance() {
            if let ObjBody::Instance(instance) = &target.obj_ref().body {
                if let Some(&field) = instance.fields.get(name) {
                    return self.push(field);
                }
                if let Some(class_ptr) = instance.class
                    && let Some(method) = class_method(class_ptr, name)
                {
                    let bound = self.vm.gc.alloc(ObjBody::BoundMethod(ObjBoundMethod {
                        receiver: target,
                        method: method.as_obj(),
                    }));
                    return self.push(Value::object(bound));
                }
            }
        }
        let method = self.find_builtin(target, name)?;
        let bound = self.vm.gc.alloc(ObjBody::BoundNative(ObjBoundNative {
            name: name.to_owned(),
            arity: method.arity,
            func: method.func,
            receiver: target,
        }));
        self.push(Value::object(bound))
    }

    // =========================================================================
    // Arithmetic helpers
    // =========================================================================

    /// Numeric binary op: int stays int unless the 64-bit result leaves
    /// i32 range, in which case it promotes to double.
    fn arithmetic(&mut self, int_op: fn(i64, i64) -> i64, float_op: fn(f64, f64) -> f64) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(RuntimeError::type_error(format!(
                "Operands must be numbers, got '{}' and '{}'.",
                a.type_name(),
                b.type_name()
            )));
        }
        let result = if a.is_int() && b.is_int() {
            let wide = int_op(a.as_int() as i64, b.as_int() as i64);
            if wide >= i32::MIN as i64 && wide <= i32::MAX as i64 {
                Value::int(wide as i32)
            } else {
                Value::double(wide as f64)
            }
        } else {
            Value::double(float_op(a.as_number(), b.as_number()))
        };
        self.stack[self.top - 2] = result;
        self.top -= 1;
        Ok(())
    }

    fn add_op(&mut self) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.is_number() && b.is_number() {
            return self.arithmetic(|x, y| x + y, |x, y| x + y);
        }
        if a.is_string() && b.is_string() {
            let concatenated = {
                let (sa, sb) = (a.obj_ref(), b.obj_ref());
                match (&sa.body, &sb.body) {
                    (ObjBody::String(x), ObjBody::String(y)) => format!("{}{}", x.text, y.text),
                    _ => unreachable!("checked is_string above"),
                }
            };
            let obj = self.vm.gc.intern(&concatenated);
            self.top -= 2;
            return self.push(Value::object(obj));
        }
        Err(RuntimeError::type_error(format!(
            "Operands must be two numbers or two strings, got {} and {}.",
            a.type_name(),
            b.type_name()
        )))
    }

    fn divide_op(&mut self) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.is_int() && b.is_int() && b.as_int() == 0 {
            return Err(RuntimeError::type_error("Division by zero."));
        }
        self.arithmetic(|x, y| x / y, |x, y| x / y)
    }

    /// Integer-only binary op; never promotes.
    fn int_binary(
        &mut self,
        op: fn(i32, i32) -> i32,
        rejects: fn(i32) -> bool,
        reject_message: &str,
    ) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_int() || !b.is_int() {
            return Err(RuntimeError::type_error(format!(
                "Operands must be integers, got '{}' and '{}'.",
                a.type_name(),
                b.type_name()
            )));
        }
        if rejects(b.as_int()) {
            return Err(RuntimeError::type_error(reject_message));
        }
        self.stack[self.top - 2] = Value::int(op(a.as_int(), b.as_int()));
        self.top -= 1;
        Ok(())
    }

    fn compare(&mut self, op: fn(f64, f64) -> bool) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(RuntimeError::type_error(format!(
                "Operands must be two numbers, got {} and {}.",
                a.type_name(),
                b.type_name()
            )));
        }
        self.stack[self.top - 2] = Value::boolean(op(a.as_number(), b.as_number()));
        self.top -= 1;
        Ok(())
    }

    // =========================================================================
    // Compound increment
    // =========================================================================

    /// One-opcode increment/decrement. The operand byte packs the sign
    /// (bit 0), prefix flag (bit 1) and target kind (bits 2..): 0 local,
    /// 1 upvalue, 2/3 global, 4/5 dot field, 6 subscript.
    fn increment_op(
        &mut self,
        code: &Code,
        ip: &mut usize,
        base: usize,
        const_off: usize,
    ) -> Result<()> {
        let args = read_byte(code, ip);
        let sign: i32 = if args & 0b01 != 0 { 1 } else { -1 };
        let is_prefix = args & 0b10 != 0;
        let target = args >> 2;

        match target {
            0 => {
                let slot = read_byte(code, ip) as usize;
                let current = self.stack[base + slot];
                // A captured local redirects through its cell.
                if current.is_upvalue() {
                    let cell_ptr = current.as_obj();
                    let old = upvalue_of(cell_ptr)?.value;
                    let (new_value, pushed) = incremented(old, sign, is_prefix)?;
                    unsafe {
                        if let ObjBody::Upvalue(cell) = &mut object::obj_mut(cell_ptr).body {
                            cell.value = new_value;
                        }
                    }
                    self.push(pushed)
                } else {
                    let (new_value, pushed) = incremented(current, sign, is_prefix)?;
                    self.stack[base + slot] = new_value;
                    self.push(pushed)
                }
            }
            1 => {
                let slot = read_byte(code, ip) as usize;
                let closure = self.current_closure()?;
                let cell_ptr = closure_upvalue(closure, slot)?;
                let old = upvalue_of(cell_ptr)?.value;
                let (new_value, pushed) = incremented(old, sign, is_prefix)?;
                unsafe {
                    if let ObjBody::Upvalue(cell) = &mut object::obj_mut(cell_ptr).body {
                        cell.value = new_value;
                    }
                }
                self.push(pushed)
            }
            2 | 3 => {
                let idx = if target == 3 {
                    read_u16(code, ip) as usize
                } else {
                    read_byte(code, ip) as usize
                };
                let old = self.vm.globals[idx].get();
                let (new_value, pushed) = incremented(old, sign, is_prefix)?;
                self.vm.globals[idx].set(new_value);
                self.push(pushed)
            }
            4 | 5 => {
                let idx = if target == 5 {
                    read_u16(code, ip) as usize
                } else {
                    read_byte(code, ip) as usize
                };
                let name = constant_string(code, const_off + idx)?;
                let target_value = self.pop();
                if !target_value.is_instance() {
                    return Err(RuntimeError::type_error(format!(
                        "Only instances and structs have properties, got {}.",
                        target_value.type_name()
                    )));
                }
                let inst_ptr = target_value.as_obj();
                let old = match &target_value.obj_ref().body {
                    ObjBody::Instance(inst) => inst.fields.get(name).copied(),
                    _ => None,
                };
                let Some(old) = old else {
                    return Err(RuntimeError::name_not_found(format!(
                        "Field '{}' doesn't exist.",
                        name
                    )));
                };
                let (new_value, pushed) = incremented(old, sign, is_prefix)?;
                unsafe {
                    if let ObjBody::Instance(inst) = &mut object::obj_mut(inst_ptr).body {
                        inst.fields.insert(name.to_owned(), new_value);
                    }
                }
                self.push(pushed)
            }
            6 => {
                let field = self.pop();
                let target_value = self.pop();
                if target_value.is_array() {
                    let index = self.check_array_bounds(target_value, field)?;
                    let arr_ptr = target_value.as_obj();
                    let old = match &target_value.obj_ref().body {
                        ObjBody::Array(arr) => arr.values[index],
                        _ => unreachable!("checked is_array above"),
                    };
                    let (new_value, pushed) = incremented(old, sign, is_prefix)?;
                    unsafe {
                        if let ObjBody::Array(arr) = &mut object::obj_mut(arr_ptr).body {
                            arr.values[index] = new_value;
                        }
                    }
                    return self.push(pushed);
                }
                if !target_value.is_instance() {
                    return Err(RuntimeError::type_error(format!(
                        "Expected an array or struct, got {}.",
                        target_value.type_name()
                    )));
                }
                if !field.is_string() {
                    return Err(RuntimeError::type_error(format!(
                        "Expected a string for field name, got {}.",
                        field.type_name()
                    )));
                }
                let name = match &field.obj_ref().body {
                    ObjBody::String(s) => s.text.clone(),
                    _ => unreachable!("checked is_string above"),
                };
                let inst_ptr = target_value.as_obj();
                let old = match &target_value.obj_ref().body {
                    ObjBody::Instance(inst) => inst.fields.get(&name).copied(),
                    _ => None,
                };
                let Some(old) = old else {
                    return Err(RuntimeError::name_not_found(format!(
                        "Field '{}' doesn't exist.",
                        name
                    )));
                };
                let (new_value, pushed) = incremented(old, sign, is_prefix)?;
                unsafe {
                    if let ObjBody::Instance(inst) = &mut object::obj_mut(inst_ptr).body {
                        inst.fields.insert(name, new_value);
                    }
                }
                self.push(pushed)
            }
            _ => Err(RuntimeError::malformed(
                "Unrecognized target in increment operand.",
            )),
        }
    }

    // =========================================================================
    // Subscripts
    // =========================================================================

    fn check_array_bounds(&self, array: Value, field: Value) -> Result<usize> {
        if !field.is_int() {
            return Err(RuntimeError::type_error(format!(
                "Index must be an integer, got {}.",
                field.type_name()
            )));
        }
        let len = match &array.obj_ref().body {
            ObjBody::Array(arr) => arr.values.len(),
            _ => 0,
        };
        let index = field.as_int();
        if index < 0 || index as usize >= len {
            return Err(RuntimeError::index_range(format!(
                "Index {} outside of range [0, {}].",
                index,
                len as i64 - 1
            )));
        }
        Ok(index as usize)
    }

    fn get_op(&mut self) -> Result<()> {
        let field = self.pop();
        let target = self.pop();
        if target.is_array() {
            let index = self.check_array_bounds(target, field)?;
            let value = match &target.obj_ref().body {
                ObjBody::Array(arr) => arr.values[index],
                _ => unreachable!("checked is_array above"),
            };
            return self.push(value);
        }
        // Only struct literals are subscriptable; class instances go
        // through properties.
        if let ObjBody::Instance(instance) = target_instance_body(target)? {
            if instance.class.is_none() {
                if !field.is_string() {
                    return Err(RuntimeError::type_error(format!(
                        "Expected a string for field name, got {}.",
                        field.type_name()
                    )));
                }
                let name = match &field.obj_ref().body {
                    ObjBody::String(s) => &s.text,
                    _ => unreachable!("checked is_string above"),
                };
                return match instance.fields.get(name) {
                    Some(&value) => self.push(value),
                    None => Err(RuntimeError::name_not_found(format!(
                        "Field '{}' doesn't exist.",
                        name
                    ))),
                };
            }
        }
        Err(RuntimeError::type_error(format!(
            "Expected an array or struct, got {}.",
            target.type_name()
        )))
    }

    fn set_op(&mut self) -> Result<()> {
        let field = self.pop();
        let target = self.pop();
        let value = self.peek(0);
        if target.is_array() {
            let index = self.check_array_bounds(target, field)?;
            unsafe {
                if let ObjBody::Array(arr) = &mut object::obj_mut(target.as_obj()).body {
                    // Keep the tracing hint in step with the element.
                    let old = arr.values[index];
                    if value.is_obj() && !old.is_obj() {
                        arr.heap_ptr_count += 1;
                    } else if !value.is_obj() && old.is_obj() {
                        arr.heap_ptr_count -= 1;
                    }
                    arr.values[index] = value;
                }
            }
            return Ok(());
        }
        if let ObjBody::Instance(instance) = target_instance_body(target)? {
            if instance.class.is_none() {
                if !field.is_string() {
                    return Err(RuntimeError::type_error(format!(
                        "Expected a string for field name, got {}.",
                        field.type_name()
                    )));
                }
                let name = match &field.obj_ref().body {
                    ObjBody::String(s) => s.text.clone(),
                    _ => unreachable!("checked is_string above"),
                };
                unsafe {
                    if let ObjBody::Instance(inst) = &mut object::obj_mut(target.as_obj()).body {
                        inst.fields.insert(name, value);
                    }
                }
                return Ok(());
            }
        }
        Err(RuntimeError::type_error(format!(
            "Expected an array or struct, got {}.",
            target.type_name()
        )))
    }

    // =========================================================================
    // Closures
    // =========================================================================

    fn closure_op(
        &mut self,
        code: &Code,
        ip: &mut usize,
        base: usize,
        const_off: usize,
        long: bool,
    ) -> Result<()> {
        let idx = if long {
            read_u16(code, ip) as usize
        } else {
            read_byte(code, ip) as usize
        };
        let func_value = code.constants[const_off + idx];
        if !func_value.is_function() {
            return Err(RuntimeError::malformed("Closure constant is not a function."));
        }
        let func_ptr = func_value.as_obj();
        let count = function_of_raw(func_ptr)?.upvalue_count as usize;
        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            let is_local = read_byte(code, ip);
            let index = read_byte(code, ip) as usize;
            if is_local == 1 {
                upvalues.push(self.capture_local(base + index));
            } else {
                let closure = self.current_closure()?;
                upvalues.push(closure_upvalue(closure, index)?);
            }
        }
        let closure = self.vm.gc.alloc(ObjBody::Closure(ObjClosure {
            function: func_ptr,
            upvalues,
        }));
        self.push(Value::object(closure))
    }

    /// Capture a stack slot into an upvalue cell, rewriting the slot so
    /// the original local and every capture share the cell. A slot that
    /// was already captured reuses its cell.
    fn capture_local(&mut self, slot: usize) -> NonNull<Obj> {
        let current = self.stack[slot];
        if current.is_upvalue() {
            return current.as_obj();
        }
        let cell = self
            .vm
            .gc
            .alloc(ObjBody::Upvalue(ObjUpvalue { value: current }));
        self.stack[slot] = Value::object(cell);
        cell
    }

    // =========================================================================
    // Async
    // =========================================================================

    /// Spawn a child worker over the callee and arguments at the top of
    /// the stack, leaving a future in their place. The child's zeroth
    /// stack slot holds the future so the collector reaches it while the
    /// child runs.
    fn launch_async(&mut self, argc: usize) -> Result<()> {
        let future = self.vm.gc.alloc(ObjBody::Future(ObjFuture {
            handle: None,
            cancel: Arc::new(AtomicBool::new(false)),
            value: Value::NIL,
        }));
        let mut child = Box::new(Worker::new(Arc::clone(&self.vm), Some(future)));
        unsafe {
            if let ObjBody::Future(f) = &mut object::obj_mut(future).body {
                f.cancel = Arc::clone(&child.cancel);
            }
        }
        child.push(Value::object(future))?;

        // Copy the callee and its arguments across.
        let src = self.top - argc - 1;
        for i in 0..=argc {
            child.push(self.stack[src + i])?;
        }
        let callee = self.stack[src];
        child.call_value(callee, argc)?;
        self.top = src;

        let child_ptr = NonNull::from(&mut *child);
        self.vm.register_child(child_ptr);
        let handle = thread::spawn(move || child.run_child());
        unsafe {
            if let ObjBody::Future(f) = &mut object::obj_mut(future).body {
                f.handle = Some(handle);
            }
        }
        self.push(Value::object(future))
    }

    /// Thread body of a child worker: run to completion, publish the
    /// result into the future, deregister, wake the main worker.
    fn run_child(mut self: Box<Self>) {
        let vm = Arc::clone(&self.vm);
        let Some(future) = self.future else {
            return;
        };
        // A native or constructor-less class callee already completed
        // synchronously during launch, leaving only the result above the
        // future slot.
        let result = if self.frames.is_empty() {
            self.pop()
        } else {
            match self.run() {
                Ok(RunExit::Finished(value)) => value,
                Ok(RunExit::Cancelled) => Value::NIL,
                Err(err) => {
                    self.report_runtime_error(&err);
                    Value::NIL
                }
            }
        };
        let child_ptr = NonNull::from(&mut *self);
        vm.publish_and_deregister(future, result, child_ptr);
    }

    fn await_op(&mut self) -> Result<()> {
        let value = self.pop();
        if !value.is_future() {
            return Err(RuntimeError::type_error(format!(
                "Await can only be applied to a future, got {}.",
                value.type_name()
            )));
        }
        let future = value.as_obj();
        let handle = unsafe {
            match &mut object::obj_mut(future).body {
                ObjBody::Future(f) => f.handle.take(),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            if self.future.is_none() {
                // The main worker keeps servicing collection requests
                // while it waits, else parked children would never wake.
                let vm = Arc::clone(&self.vm);
                loop {
                    if handle.is_finished() {
                        break;
                    }
                    if vm.gc.should_collect.load(Ordering::SeqCst) {
                        vm.pause_and_collect(self);
                        continue;
                    }
                    vm.idle_wait(Duration::from_millis(1));
                }
                let _ = handle.join();
            } else {
                // A child blocked on a join counts as paused.
                let vm = Arc::clone(&self.vm);
                vm.block_as_paused(|| {
                    let _ = handle.join();
                });
            }
        }
        // The result was published before the worker exited.
        let result = match &unsafe { object::obj_ref(future) }.body {
            ObjBody::Future(f) => f.value,
            _ => Value::NIL,
        };
        self.push(result)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Print the error and a source-mapped trace of the frame stack.
    pub(crate) fn report_runtime_error(&self, err: &RuntimeError) {
        eprintln!("Runtime error: \n{}", err.message);
        for (depth, frame) in self.frames.iter().enumerate().rev() {
            let name = function_of(frame.closure)
                .map(|f| {
                    if f.name.is_empty() {
                        "script".to_owned()
                    } else {
                        f.name.clone()
                    }
                })
                .unwrap_or_else(|_| "script".to_owned());
            // The top frame's ip points at the failing instruction; lower
            // frames point just past their call's operands.
            let offset = if depth == self.frames.len() - 1 {
                frame.ip
            } else {
                frame.ip.saturating_sub(1)
            };
            match self.vm.code.line_for(offset) {
                Some(span) => {
                    let file = self
                        .vm
                        .source_files
                        .get(span.file as usize)
                        .map(String::as_str)
                        .unwrap_or("<unknown>");
                    eprintln!("{}:{} | in {}", file, span.line + 1, name);
                }
                None => eprintln!("<unknown> | in {}", name),
            }
        }
        eprintln!("\nExited with code: {}", err.code as u8);
    }
}

// =============================================================================
// Raw object access helpers
// =============================================================================

fn read_byte(code: &Code, ip: &mut usize) -> u8 {
    let byte = code.bytecode[*ip];
    *ip += 1;
    byte
}

fn read_u16(code: &Code, ip: &mut usize) -> u16 {
    let hi = code.bytecode[*ip] as u16;
    let lo = code.bytecode[*ip + 1] as u16;
    *ip += 2;
    (hi << 8) | lo
}

fn constant_string<'c>(code: &'c Code, index: usize) -> Result<&'c str> {
    let value = code
        .constants
        .get(index)
        .copied()
        .ok_or_else(|| RuntimeError::malformed("Constant index out of range."))?;
    if !value.is_obj() {
        return Err(RuntimeError::malformed("Constant is not a string."));
    }
    match &value.obj_ref().body {
        ObjBody::String(s) => Ok(&s.text),
        _ => Err(RuntimeError::malformed("Constant is not a string.")),
    }
}

/// The function metadata behind a closure pointer.
fn function_of<'o>(closure: NonNull<Obj>) -> Result<&'o ObjFunction> {
    let obj = unsafe { object::obj_ref(closure) };
    let closure = obj
        .closure()
        .ok_or_else(|| RuntimeError::malformed("Frame closure is not a closure."))?;
    function_of_raw(closure.function)
}

fn function_of_raw<'o>(func: NonNull<Obj>) -> Result<&'o ObjFunction> {
    unsafe { object::obj_ref(func) }
        .function()
        .ok_or_else(|| RuntimeError::malformed("Closure target is not a function."))
}

fn upvalue_of<'o>(cell: NonNull<Obj>) -> Result<&'o ObjUpvalue> {
    match &unsafe { object::obj_ref(cell) }.body {
        ObjBody::Upvalue(upvalue) => Ok(upvalue),
        _ => Err(RuntimeError::malformed("Expected an upvalue cell.")),
    }
}

fn closure_upvalue(closure: NonNull<Obj>, index: usize) -> Result<NonNull<Obj>> {
    let obj = unsafe { object::obj_ref(closure) };
    let closure = obj
        .closure()
        .ok_or_else(|| RuntimeError::malformed("Frame closure is not a closure."))?;
    closure
        .upvalues
        .get(index)
        .copied()
        .ok_or_else(|| RuntimeError::malformed("Upvalue index out of range."))
}

fn class_ptr_of(value: Value) -> Result<NonNull<Obj>> {
    if !value.is_class() {
        return Err(RuntimeError::malformed("Expected a class."));
    }
    Ok(value.as_obj())
}

fn class_method(class_ptr: NonNull<Obj>, name: &str) -> Option<Value> {
    match &unsafe { object::obj_ref(class_ptr) }.body {
        ObjBody::Class(class) => class.methods.get(name).copied(),
        _ => None,
    }
}

fn class_name(class_ptr: NonNull<Obj>) -> String {
    match &unsafe { object::obj_ref(class_ptr) }.body {
        ObjBody::Class(class) => class.name.clone(),
        _ => "<class>".to_owned(),
    }
}

fn target_instance_body<'o>(value: Value) -> Result<&'o ObjBody> {
    if !value.is_instance() {
        return Err(RuntimeError::type_error(format!(
            "Expected an array or struct, got {}.",
            value.type_name()
        )));
    }
    Ok(&unsafe { object::obj_ref(value.as_obj()) }.body)
}

/// Add or subtract one; ints wrap, doubles stay doubles. Returns the new
/// stored value and the value the expression yields (old for postfix).
fn incremented(value: Value, sign: i32, is_prefix: bool) -> Result<(Value, Value)> {
    if !value.is_number() {
        return Err(RuntimeError::type_error(format!(
            "Operand must be a number, got {}.",
            value.type_name()
        )));
    }
    let new_value = if value.is_int() {
        Value::int(value.as_int().wrapping_add(sign))
    } else {
        Value::double(value.as_double() + sign as f64)
    };
    let pushed = if is_prefix { new_value } else { value };
    Ok((new_value, pushed))
}

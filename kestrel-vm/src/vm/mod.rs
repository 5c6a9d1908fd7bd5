// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The shared virtual machine and its worker coordination.
//!
//! A [`Vm`] owns the compiled program, the global table, the registered
//! natives, the collector and the safepoint machinery. Each worker is an
//! OS thread executing bytecode against this shared state. The main
//! worker runs collections; children rendezvous with it through a pause
//! mutex and two condition variables.

pub mod error;
pub mod frame;
pub mod worker;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::chunk::Code;
use crate::compiler::Program;
use crate::gc::Gc;
use crate::natives::{BuiltinTables, NativeRegistry};
use crate::object::{self, Obj, ObjBody, ObjNative, mark_value};
use crate::value::Value;

pub use error::{ErrorCode, RuntimeError};
pub use frame::CallFrame;
pub use worker::Worker;

use error::Result;
use worker::RunExit;

/// One global-table cell. Workers race on these by language design; the
/// atomic makes the 64-bit load/store well-defined without ordering cost.
pub struct GlobalCell {
    raw: AtomicU64,
}

impl GlobalCell {
    fn new(value: Value) -> Self {
        Self {
            raw: AtomicU64::new(value.raw()),
        }
    }

    #[inline]
    pub fn get(&self) -> Value {
        Value::from_raw(self.raw.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, value: Value) {
        self.raw.store(value.raw(), Ordering::Relaxed);
    }
}

/// Shared state of one running program.
pub struct Vm {
    pub code: Code,
    pub globals: Vec<GlobalCell>,
    pub builtins: BuiltinTables,
    pub gc: Gc,
    pub source_files: Vec<String>,
    global_names: Vec<String>,
    natives: Vec<NonNull<Obj>>,
    main_closure: NonNull<Obj>,
    /// Guards the pause handshake and future publication.
    pause_lock: Mutex<()>,
    /// Children signal the main worker here when they pause or exit.
    main_cv: Condvar,
    /// The main worker broadcasts here once collection is done.
    child_cv: Condvar,
    paused: AtomicUsize,
    /// Live child workers; the main worker is not registered.
    workers: Mutex<Vec<NonNull<Worker>>>,
}

// Raw object and worker pointers cross thread boundaries here; every
// access is serialized by the allocation mutex, the worker-list mutex or
// the safepoint protocol.
unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

impl Vm {
    /// Assemble a VM around a compiled program. Native function objects
    /// are materialized in registration order so `GET_NATIVE` indexes
    /// stay aligned with the compiler's.
    pub fn new(
        program: Program,
        gc: Gc,
        registry: &NativeRegistry,
        builtins: BuiltinTables,
    ) -> Arc<Vm> {
        let natives = registry
            .defs()
            .iter()
            .map(|def| {
                gc.alloc(ObjBody::Native(ObjNative {
                    name: def.name.to_owned(),
                    arity: def.arity,
                    func: def.func,
                }))
            })
            .collect();
        let mut globals = Vec::with_capacity(program.globals.len());
        let mut global_names = Vec::with_capacity(program.globals.len());
        for global in &program.globals {
            globals.push(GlobalCell::new(global.value));
            global_names.push(global.name.clone());
        }
        Arc::new(Vm {
            code: program.code,
            globals,
            builtins,
            gc,
            source_files: program.source_files,
            global_names,
            natives,
            main_closure: program.main,
            pause_lock: Mutex::new(()),
            main_cv: Condvar::new(),
            child_cv: Condvar::new(),
            paused: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Run the program's script function on the calling thread (which
    /// becomes the main worker). Blocks until the script and every child
    /// worker have finished. On a runtime error the trace has already
    /// been printed; the error carries the numeric exit code.
    pub fn interpret(self: &Arc<Self>) -> Result<Value> {
        let mut worker = Worker::new(Arc::clone(self), None);
        worker.push(Value::object(self.main_closure))?;
        worker.call_value(Value::object(self.main_closure), 0)?;
        match worker.run() {
            Ok(RunExit::Finished(value)) => {
                self.wait_for_children(&worker);
                Ok(value)
            }
            Ok(RunExit::Cancelled) => Ok(Value::NIL),
            Err(err) => {
                worker.report_runtime_error(&err);
                self.wait_for_children(&worker);
                Err(err)
            }
        }
    }

    /// Read a global by source name; test and embedding hook.
    pub fn global(&self, name: &str) -> Option<Value> {
        let index = self.global_names.iter().position(|n| n == name)?;
        Some(self.globals[index].get())
    }

    pub(crate) fn native(&self, index: usize) -> Option<NonNull<Obj>> {
        self.natives.get(index).copied()
    }

    // =========================================================================
    // Safepoint protocol
    // =========================================================================

    fn all_children_paused(&self) -> bool {
        let children = self.workers.lock().expect("worker list poisoned").len();
        self.paused.load(Ordering::SeqCst) >= children
    }

    /// Main-worker side: wait until every child worker has parked, then
    /// collect with the full root set and release the children.
    pub(crate) fn pause_and_collect(&self, main: &Worker) {
        let mut guard = self.pause_lock.lock().expect("pause mutex poisoned");
        while !self.all_children_paused() {
            guard = self.main_cv.wait(guard).expect("pause mutex poisoned");
        }
        drop(guard);
        self.collect_runtime(main);
    }

    /// Child-worker side: count in as paused, wake the main worker, and
    /// sleep until the collection flag clears.
    pub(crate) fn park_for_collection(&self) {
        {
            let _guard = self.pause_lock.lock().expect("pause mutex poisoned");
            self.paused.fetch_add(1, Ordering::SeqCst);
        }
        self.main_cv.notify_one();

        let mut guard = self.pause_lock.lock().expect("pause mutex poisoned");
        while self.gc.should_collect.load(Ordering::SeqCst) {
            guard = self.child_cv.wait(guard).expect("pause mutex poisoned");
        }
        self.paused.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    /// Collect with the VM as root provider: globals, constants, natives,
    /// the entry closure, the main worker and every child worker.
    pub(crate) fn collect_runtime(&self, main: &Worker) {
        self.gc.collect_with(|gray| {
            for cell in &self.globals {
                mark_value(cell.get(), gray);
            }
            for &constant in &self.code.constants {
                mark_value(constant, gray);
            }
            for &native in &self.natives {
                gray.push(native);
            }
            gray.push(self.main_closure);
            main.mark(gray);
            let workers = self.workers.lock().expect("worker list poisoned");
            for &child in workers.iter() {
                unsafe { child.as_ref() }.mark(gray);
            }
        });
        {
            let _guard = self.pause_lock.lock().expect("pause mutex poisoned");
            self.gc.should_collect.store(false, Ordering::SeqCst);
        }
        self.child_cv.notify_all();
    }

    /// Also a safepoint: a worker blocked here is counted paused so a
    /// collection requested meanwhile can proceed; its stack stays
    /// scannable while it sleeps.
    pub(crate) fn block_as_paused(&self, blocked: impl FnOnce()) {
        {
            let _guard = self.pause_lock.lock().expect("pause mutex poisoned");
            self.paused.fetch_add(1, Ordering::SeqCst);
        }
        self.main_cv.notify_one();
        blocked();
        let _guard = self.pause_lock.lock().expect("pause mutex poisoned");
        self.paused.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sleep briefly on the main condition variable; children signal it
    /// when they pause or exit.
    pub(crate) fn idle_wait(&self, timeout: Duration) {
        let guard = self.pause_lock.lock().expect("pause mutex poisoned");
        let _ = self
            .main_cv
            .wait_timeout(guard, timeout)
            .expect("pause mutex poisoned");
    }

    pub(crate) fn register_child(&self, child: NonNull<Worker>) {
        self.workers
            .lock()
            .expect("worker list poisoned")
            .push(child);
    }

    /// Publish a child's result into its future and drop the child from
    /// the worker list, all under the pause mutex so a collecting main
    /// worker never observes a half-gone child.
    pub(crate) fn publish_and_deregister(
        &self,
        future: NonNull<Obj>,
        result: Value,
        child: NonNull<Worker>,
    ) {
        {
            let _guard = self.pause_lock.lock().expect("pause mutex poisoned");
            unsafe {
                if let ObjBody::Future(f) = &mut object::obj_mut(future).body {
                    f.value = result;
                }
            }
            let mut workers = self.workers.lock().expect("worker list poisoned");
            workers.retain(|&w| w != child);
        }
        self.main_cv.notify_one();
    }

    /// Block the main worker until every child worker has exited,
    /// servicing collection requests meanwhile.
    pub(crate) fn wait_for_children(&self, main: &Worker) {
        loop {
            if self.workers.lock().expect("worker list poisoned").is_empty() {
                return;
            }
            if self.gc.should_collect.load(Ordering::SeqCst) {
                self.pause_and_collect(main);
                continue;
            }
            let guard = self.pause_lock.lock().expect("pause mutex poisoned");
            let _ = self
                .main_cv
                .wait_timeout(guard, Duration::from_millis(1))
                .expect("pause mutex poisoned");
        }
    }
}

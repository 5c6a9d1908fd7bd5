// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Stop-the-world mark-sweep collector.
//!
//! The collector owns every heap object. `alloc` only bumps the tracked
//! heap size and raises `should_collect` when the threshold is crossed;
//! the collection itself runs at a safepoint, either synchronously during
//! compilation (compiler roots) or by the main worker once every child
//! has paused (VM roots). Marking is iterative over an explicit gray
//! stack. Sweeping prunes unmarked intern-table entries first, frees
//! unmarked objects, recomputes live bytes, and doubles the threshold if
//! live bytes still exceed it.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;

use crate::object::{GrayStack, Obj, ObjBody, ObjString};

/// Initial heap-size threshold in bytes.
pub const HEAP_START_SIZE: usize = 1024 * 1024;

struct GcState {
    /// Every live object, in allocation order.
    objects: Vec<NonNull<Obj>>,
    /// Content-keyed string table. Not a strong root: entries for
    /// unmarked strings are dropped at the start of every sweep.
    interned: AHashMap<String, NonNull<Obj>>,
    heap_size: usize,
    heap_limit: usize,
}

// Object pointers are handed between workers, but every access is fenced
// by the allocation mutex or the safepoint protocol.
unsafe impl Send for GcState {}

pub struct Gc {
    state: Mutex<GcState>,
    /// Raised by `alloc` when the threshold is crossed; every worker
    /// polls it at the top of each dispatch iteration.
    pub should_collect: AtomicBool,
}

impl Gc {
    pub fn new() -> Self {
        Self::with_limit(HEAP_START_SIZE)
    }

    /// A collector with a custom starting threshold; tests use tiny
    /// limits to force collection pressure.
    pub fn with_limit(heap_limit: usize) -> Self {
        Self {
            state: Mutex::new(GcState {
                objects: Vec::new(),
                interned: AHashMap::new(),
                heap_size: 0,
                heap_limit,
            }),
            should_collect: AtomicBool::new(false),
        }
    }

    /// Allocate a heap object. Never collects inline; crossing the
    /// threshold only raises `should_collect`.
    pub fn alloc(&self, body: ObjBody) -> NonNull<Obj> {
        let mut state = self.state.lock().expect("allocator mutex poisoned");
        let ptr = register(&mut state, Obj::new(body));
        if state.heap_size > state.heap_limit {
            self.should_collect.store(true, Ordering::SeqCst);
        }
        ptr
    }

    /// Allocate or reuse the interned string for `text`.
    pub fn intern(&self, text: &str) -> NonNull<Obj> {
        let mut state = self.state.lock().expect("allocator mutex poisoned");
        if let Some(&existing) = state.interned.get(text) {
            return existing;
        }
        let ptr = register(
            &mut state,
            Obj::new(ObjBody::String(ObjString {
                text: text.to_owned(),
            })),
        );
        state.interned.insert(text.to_owned(), ptr);
        if state.heap_size > state.heap_limit {
            self.should_collect.store(true, Ordering::SeqCst);
        }
        ptr
    }

    /// Run a full collection. `mark_roots` enqueues every root; the
    /// caller is responsible for having brought the system to a safepoint
    /// first (trivially true at compile time).
    pub fn collect_with(&self, mark_roots: impl FnOnce(&mut GrayStack)) {
        let mut state = self.state.lock().expect("allocator mutex poisoned");
        let mut gray: GrayStack = Vec::new();
        mark_roots(&mut gray);

        // Iterative mark; marking an already-marked object is a no-op.
        while let Some(ptr) = gray.pop() {
            let obj = unsafe { &mut *ptr.as_ptr() };
            if obj.marked {
                continue;
            }
            obj.marked = true;
            obj.trace(&mut gray);
        }

        sweep(&mut state);
    }

    /// Live bytes as of the last sweep or allocation.
    pub fn heap_size(&self) -> usize {
        self.state.lock().expect("allocator mutex poisoned").heap_size
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("allocator mutex poisoned");
        for ptr in state.objects.drain(..) {
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
        state.interned.clear();
    }
}

fn register(state: &mut GcState, obj: Obj) -> NonNull<Obj> {
    state.heap_size += obj.size();
    let ptr = NonNull::from(Box::leak(Box::new(obj)));
    state.objects.push(ptr);
    ptr
}

fn sweep(state: &mut GcState) {
    // The intern table holds weak entries: filter before freeing so that
    // surviving strings keep their table slots.
    state
        .interned
        .retain(|_, ptr| unsafe { ptr.as_ref().marked });

    let mut live_bytes = 0;
    state.objects.retain(|&ptr| unsafe {
        let obj = &mut *ptr.as_ptr();
        if obj.marked {
            obj.marked = false;
            live_bytes += obj.size();
            true
        } else {
            drop(Box::from_raw(ptr.as_ptr()));
            false
        }
    });
    state.heap_size = live_bytes;

    if state.heap_size > state.heap_limit {
        state.heap_limit *= 2;
    }
}

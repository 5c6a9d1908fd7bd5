// kestrel-vm - Collection soundness under a single worker
// Copyright (c) 2025 Tom Waddington. MIT licensed.

mod common;

use common::*;
use kestrel_ast::TokenKind;
use kestrel_vm::{BuiltinTables, Gc, NativeRegistry};

fn pressured(stmts: Vec<kestrel_ast::Stmt>, limit: usize) -> Run {
    run_configured(
        vec![module("main", stmts)],
        NativeRegistry::new(),
        BuiltinTables::new(),
        Gc::with_limit(limit),
    )
}

#[test]
fn garbage_arrays_are_collected_while_live_ones_survive() {
    // Allocate thousands of short-lived arrays under a small threshold;
    // the long-lived accumulator array must keep its contents.
    let run = pressured(
        vec![
            let_stmt("keep", array(vec![num(1.0), num(2.0), num(3.0)])),
            let_stmt("sum", num(0.0)),
            for_stmt(
                Some(let_stmt("i", num(0.0))),
                Some(bin(TokenKind::Less, var("i"), num(2000.0))),
                Some(assign("i", add(var("i"), num(1.0)))),
                block(vec![
                    let_stmt("junk", array(vec![var("i"), var("i"), var("i")])),
                    expr_stmt(assign(
                        "sum",
                        add(var("sum"), get_index(var("junk"), num(2.0))),
                    )),
                ]),
            ),
            let_stmt("kept", get_index(var("keep"), num(1.0))),
        ],
        8 * 1024,
    );
    expect_ok(&run);
    assert_eq!(global_int(&run, "kept"), 2);
    assert_eq!(global_int(&run, "sum"), (0..2000).sum::<i32>());
}

#[test]
fn interned_strings_survive_through_globals() {
    // Concatenation churns the intern table; strings referenced from a
    // global must survive every sweep.
    let run = pressured(
        vec![
            let_stmt("tag", add(str_lit("kes"), str_lit("trel"))),
            for_stmt(
                Some(let_stmt("i", num(0.0))),
                Some(bin(TokenKind::Less, var("i"), num(500.0))),
                Some(assign("i", add(var("i"), num(1.0)))),
                block(vec![
                    // Fresh garbage strings each iteration.
                    let_stmt("junk", add(str_lit("x"), str_lit("y"))),
                    expr_stmt(var("junk")),
                ]),
            ),
            let_stmt("same", bin(TokenKind::EqualEqual, var("tag"), str_lit("kestrel"))),
        ],
        4 * 1024,
    );
    expect_ok(&run);
    assert!(global_bool(&run, "same"));
}

#[test]
fn upvalue_cells_are_reachable_through_closures() {
    // The captured cell is only reachable through the returned closure;
    // collection pressure must not free it between calls.
    let run = pressured(
        vec![
            func_decl(
                "make_counter",
                &[],
                vec![
                    let_stmt("count", num(0.0)),
                    func_decl("tick", &[], vec![
                        expr_stmt(assign("count", add(var("count"), num(1.0)))),
                        ret(var("count")),
                    ]),
                    ret(var("tick")),
                ],
            ),
            let_stmt("counter", call_named("make_counter", vec![])),
            let_stmt("last", num(0.0)),
            for_stmt(
                Some(let_stmt("i", num(0.0))),
                Some(bin(TokenKind::Less, var("i"), num(300.0))),
                Some(assign("i", add(var("i"), num(1.0)))),
                block(vec![
                    let_stmt("junk", array(vec![var("i")])),
                    expr_stmt(var("junk")),
                    expr_stmt(assign("last", call_named("counter", vec![]))),
                ]),
            ),
        ],
        4 * 1024,
    );
    expect_ok(&run);
    assert_eq!(global_int(&run, "last"), 300);
}

#[test]
fn instances_keep_their_fields_across_collections() {
    let run = pressured(
        vec![
            class_decl(
                "Holder",
                None,
                vec![method_decl("Holder", &["v"], vec![expr_stmt(set_prop(
                    this(),
                    "v",
                    var("v"),
                ))])],
            ),
            let_stmt("h", new_instance("Holder", vec![str_lit("payload")])),
            for_stmt(
                Some(let_stmt("i", num(0.0))),
                Some(bin(TokenKind::Less, var("i"), num(1000.0))),
                Some(assign("i", add(var("i"), num(1.0)))),
                block(vec![expr_stmt(array(vec![var("i"), var("i")]))]),
            ),
            let_stmt("v", get_prop(var("h"), "v")),
        ],
        8 * 1024,
    );
    expect_ok(&run);
    assert_eq!(global_string(&run, "v"), "payload");
}

#[test]
fn heap_size_shrinks_after_dropping_garbage() {
    // After the run, only compile-time objects and a few globals remain;
    // live bytes must be far below what the loop allocated in total.
    let run = pressured(
        vec![for_stmt(
            Some(let_stmt("i", num(0.0))),
            Some(bin(TokenKind::Less, var("i"), num(5000.0))),
            Some(assign("i", add(var("i"), num(1.0)))),
            block(vec![expr_stmt(array(vec![
                var("i"),
                var("i"),
                var("i"),
                var("i"),
            ]))]),
        )],
        8 * 1024,
    );
    expect_ok(&run);
    // 5000 arrays of four values dwarf any plausible live remainder.
    assert!(run.vm.gc.heap_size() < 1024 * 1024);
}

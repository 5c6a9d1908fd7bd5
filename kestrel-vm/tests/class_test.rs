// kestrel-vm - Class, method and inheritance tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

mod common;

use common::*;
use kestrel_ast::TokenKind;
use kestrel_vm::ErrorCode;

#[test]
fn constructor_sets_fields_and_methods_read_them() {
    // class Point { Point(x, y) { this.x = x; this.y = y; } sum() { return this.x + this.y; } }
    let run = run_stmts(vec![
        class_decl(
            "Point",
            None,
            vec![
                method_decl("Point", &["x", "y"], vec![
                    expr_stmt(set_prop(this(), "x", var("x"))),
                    expr_stmt(set_prop(this(), "y", var("y"))),
                ]),
                method_decl("sum", &[], vec![ret(add(
                    get_prop(this(), "x"),
                    get_prop(this(), "y"),
                ))]),
            ],
        ),
        let_stmt("p", new_instance("Point", vec![num(3.0), num(4.0)])),
        let_stmt("r", call(get_prop(var("p"), "sum"), vec![])),
        let_stmt("x", get_prop(var("p"), "x")),
    ]);
    expect_ok(&run);
    assert_eq!(global_int(&run, "r"), 7);
    assert_eq!(global_int(&run, "x"), 3);
}

#[test]
fn subclass_inherits_constructor_and_methods() {
    // class A { A(n) { this.n = n; } get() { return this.n; } }
    // class B : A {}  let b = new B(7); b.get() == 7
    let run = run_stmts(vec![
        class_decl(
            "A",
            None,
            vec![
                method_decl("A", &["n"], vec![expr_stmt(set_prop(this(), "n", var("n")))]),
                method_decl("get", &[], vec![ret(get_prop(this(), "n"))]),
            ],
        ),
        class_decl("B", Some("A"), vec![]),
        let_stmt("b", new_instance("B", vec![num(7.0)])),
        let_stmt("r", call(get_prop(var("b"), "get"), vec![])),
    ]);
    expect_ok(&run);
    assert_eq!(global_int(&run, "r"), 7);
}

#[test]
fn subclass_overrides_are_a_snapshot() {
    let run = run_stmts(vec![
        class_decl(
            "Base",
            None,
            vec![method_decl("describe", &[], vec![ret(str_lit("base"))])],
        ),
        class_decl(
            "Derived",
            Some("Base"),
            vec![method_decl("describe", &[], vec![ret(str_lit("derived"))])],
        ),
        let_stmt("b", call(get_prop(new_instance("Base", vec![]), "describe"), vec![])),
        let_stmt(
            "d",
            call(get_prop(new_instance("Derived", vec![]), "describe"), vec![]),
        ),
    ]);
    expect_ok(&run);
    assert_eq!(global_string(&run, "b"), "base");
    assert_eq!(global_string(&run, "d"), "derived");
}

#[test]
fn super_invoke_reaches_the_parent_method() {
    // Derived.describe() = "derived+" + super.describe()
    let run = run_stmts(vec![
        class_decl(
            "Base",
            None,
            vec![method_decl("describe", &[], vec![ret(str_lit("base"))])],
        ),
        class_decl(
            "Derived",
            Some("Base"),
            vec![method_decl("describe", &[], vec![ret(add(
                str_lit("derived+"),
                call(super_method("describe"), vec![]),
            ))])],
        ),
        let_stmt(
            "r",
            call(get_prop(new_instance("Derived", vec![]), "describe"), vec![]),
        ),
    ]);
    expect_ok(&run);
    assert_eq!(global_string(&run, "r"), "derived+base");
}

#[test]
fn bound_methods_carry_their_receiver() {
    let run = run_stmts(vec![
        class_decl(
            "Counter",
            None,
            vec![
                method_decl("Counter", &[], vec![expr_stmt(set_prop(
                    this(),
                    "count",
                    num(0.0),
                ))]),
                method_decl("bump", &[], vec![
                    expr_stmt(set_prop(
                        this(),
                        "count",
                        add(get_prop(this(), "count"), num(1.0)),
                    )),
                    ret(get_prop(this(), "count")),
                ]),
            ],
        ),
        let_stmt("c", new_instance("Counter", vec![])),
        // Detach the method, call it twice through the binding.
        let_stmt("bump", get_prop(var("c"), "bump")),
        expr_stmt(call_named("bump", vec![])),
        let_stmt("r", call_named("bump", vec![])),
        let_stmt("count", get_prop(var("c"), "count")),
    ]);
    expect_ok(&run);
    assert_eq!(global_int(&run, "r"), 2);
    assert_eq!(global_int(&run, "count"), 2);
}

#[test]
fn callable_instance_fields_win_over_methods() {
    // A field holding a function is invoked ahead of a same-named method.
    let run = run_stmts(vec![
        class_decl(
            "Holder",
            None,
            vec![method_decl("pick", &[], vec![ret(str_lit("method"))])],
        ),
        let_stmt("h", new_instance("Holder", vec![])),
        expr_stmt(set_prop(
            var("h"),
            "pick",
            func_expr(&[], vec![ret(str_lit("field"))]),
        )),
        let_stmt("r", call(get_prop(var("h"), "pick"), vec![])),
    ]);
    expect_ok(&run);
    assert_eq!(global_string(&run, "r"), "field");
}

#[test]
fn zero_argument_construction_without_a_constructor() {
    let run = run_stmts(vec![
        class_decl("Empty", None, vec![]),
        let_stmt("e", new_instance("Empty", vec![])),
        expr_stmt(set_prop(var("e"), "tag", num(5.0))),
        let_stmt("tag", get_prop(var("e"), "tag")),
    ]);
    expect_ok(&run);
    assert_eq!(global_int(&run, "tag"), 5);
}

#[test]
fn constructing_without_constructor_rejects_arguments() {
    let run = run_stmts(vec![
        class_decl("Empty", None, vec![]),
        expr_stmt(new_instance("Empty", vec![num(1.0)])),
    ]);
    assert_eq!(run.result.unwrap_err().code, ErrorCode::Arity);
}

#[test]
fn missing_property_is_error_code_four() {
    let run = run_stmts(vec![
        class_decl("Empty", None, vec![]),
        let_stmt("e", new_instance("Empty", vec![])),
        expr_stmt(call(get_prop(var("e"), "absent"), vec![])),
    ]);
    assert_eq!(run.result.unwrap_err().code, ErrorCode::NameNotFound);
}

#[test]
fn class_instances_do_not_answer_to_subscript() {
    let run = run_stmts(vec![
        class_decl("Boxed", None, vec![]),
        let_stmt("b", new_instance("Boxed", vec![])),
        expr_stmt(get_index(var("b"), str_lit("field"))),
    ]);
    assert_eq!(run.result.unwrap_err().code, ErrorCode::Type);
}

#[test]
fn constructor_returns_this_implicitly_and_on_bare_return() {
    let run = run_stmts(vec![
        class_decl(
            "Gate",
            None,
            vec![method_decl("Gate", &["open"], vec![
                expr_stmt(set_prop(this(), "state", str_lit("closed"))),
                if_stmt(var("open"), block(vec![
                    expr_stmt(set_prop(this(), "state", str_lit("open"))),
                    ret_none(),
                ])),
                expr_stmt(set_prop(this(), "sealed", lit_true())),
            ])],
        ),
        let_stmt("g", new_instance("Gate", vec![lit_true()])),
        let_stmt("state", get_prop(var("g"), "state")),
        let_stmt("g2", new_instance("Gate", vec![lit_false()])),
        let_stmt("sealed", get_prop(var("g2"), "sealed")),
    ]);
    expect_ok(&run);
    assert_eq!(global_string(&run, "state"), "open");
    assert!(global_bool(&run, "sealed"));
    // The bare-return path never set `sealed`.
    assert!(global(&run, "g").is_instance());
    let gate = global(&run, "g");
    match &gate.obj_ref().body {
        kestrel_vm::object::ObjBody::Instance(inst) => {
            assert!(!inst.fields.contains_key("sealed"));
        }
        _ => panic!("expected an instance"),
    }
}

#[test]
fn methods_can_call_their_own_class() {
    // Recursion through the class's global: a linked-list builder.
    let run = run_stmts(vec![
        class_decl(
            "Node",
            None,
            vec![
                method_decl("Node", &["value"], vec![
                    expr_stmt(set_prop(this(), "value", var("value"))),
                    expr_stmt(set_prop(this(), "next", lit_nil())),
                ]),
                method_decl("extend", &["value"], vec![
                    expr_stmt(set_prop(this(), "next", new_instance("Node", vec![var("value")]))),
                    ret(get_prop(this(), "next")),
                ]),
            ],
        ),
        let_stmt("head", new_instance("Node", vec![num(1.0)])),
        expr_stmt(call(get_prop(var("head"), "extend"), vec![num(2.0)])),
        let_stmt(
            "r",
            get_prop(get_prop(var("head"), "next"), "value"),
        ),
    ]);
    expect_ok(&run);
    assert_eq!(global_int(&run, "r"), 2);
}

#[test]
fn deep_inheritance_chain_copies_down() {
    let run = run_stmts(vec![
        class_decl(
            "A",
            None,
            vec![method_decl("origin", &[], vec![ret(str_lit("A"))])],
        ),
        class_decl("B", Some("A"), vec![]),
        class_decl("C", Some("B"), vec![]),
        let_stmt("r", call(get_prop(new_instance("C", vec![]), "origin"), vec![])),
    ]);
    expect_ok(&run);
    assert_eq!(global_string(&run, "r"), "A");
}

#[test]
fn invoke_on_struct_field_functions() {
    // struct.fn() goes through the invoke fast path with the field
    // replacing the receiver.
    let run = run_stmts(vec![
        let_stmt(
            "s",
            struct_lit(vec![(
                "compute",
                func_expr(&[], vec![ret(num(99.0))]),
            )]),
        ),
        let_stmt("r", call(get_prop(var("s"), "compute"), vec![])),
    ]);
    expect_ok(&run);
    assert_eq!(global_int(&run, "r"), 99);
}

#[test]
fn comparison_chain_check_does_not_block_classes() {
    // Regression guard: ordinary comparisons inside methods compile.
    let run = run_stmts(vec![
        class_decl(
            "Range",
            None,
            vec![
                method_decl("Range", &["lo", "hi"], vec![
                    expr_stmt(set_prop(this(), "lo", var("lo"))),
                    expr_stmt(set_prop(this(), "hi", var("hi"))),
                ]),
                method_decl("contains", &["n"], vec![ret(bin(
                    TokenKind::And,
                    bin(TokenKind::GreaterEqual, var("n"), get_prop(this(), "lo")),
                    bin(TokenKind::LessEqual, var("n"), get_prop(this(), "hi")),
                ))]),
            ],
        ),
        let_stmt("range", new_instance("Range", vec![num(1.0), num(10.0)])),
        let_stmt("inside", call(get_prop(var("range"), "contains"), vec![num(5.0)])),
        let_stmt("outside", call(get_prop(var("range"), "contains"), vec![num(50.0)])),
    ]);
    expect_ok(&run);
    assert!(global_bool(&run, "inside"));
    assert!(!global_bool(&run, "outside"));
}

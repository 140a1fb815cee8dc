//! End-to-end execution tests: each scenario compiles a source buffer and
//! checks the value of its final expression statement.

mod common;

use common::{eval, eval_num, eval_str};
use erkao_vm::{EngineLimits, FsResolver, GcTuning, Value, Vm, VmResult};

#[test]
fn test_operator_precedence() {
    assert_eq!(eval_num("let x = 1 + 2 * 3; x;"), 7.0);
    assert_eq!(eval_num("(1 + 2) * 3;"), 9.0);
    assert_eq!(eval_num("10 - 2 - 3;"), 5.0);
}

#[test]
fn test_for_loop_builds_string() {
    assert_eq!(
        eval_str("let s = \"a\"; for (let i = 0; i < 3; i = i + 1) s = s + \"b\"; s;"),
        "abbb"
    );
}

#[test]
fn test_while_and_continue_break() {
    assert_eq!(
        eval_num(
            "let t = 0; let i = 0;\n\
             while (i < 10) { i = i + 1; if (i == 3) continue; if (i == 6) break; t = t + i; }\n\
             t;"
        ),
        1.0 + 2.0 + 4.0 + 5.0
    );
}

#[test]
fn test_default_arguments() {
    let source = "fun f(a, b = a + 1) { return b; }";
    assert_eq!(eval_num(&format!("{source} f(10);")), 11.0);
    assert_eq!(eval_num(&format!("{source} f(10, 5);")), 5.0);
}

#[test]
fn test_default_argument_evaluated_per_call() {
    // The default expression runs on every call that omits the argument,
    // and never otherwise
    assert_eq!(
        eval_num(
            "let n = 0;\n\
             fun bump() { n = n + 1; return n; }\n\
             fun g(a = bump()) { return a; }\n\
             g(); g(); g(99);\n\
             n;"
        ),
        2.0
    );
}

#[test]
fn test_class_with_initializer() {
    assert_eq!(
        eval_num(
            "class Counter {\n\
               fun init(n) { this.n = n; }\n\
               fun inc() { this.n = this.n + 1; return this.n; }\n\
             }\n\
             let c = Counter(41);\n\
             c.inc();"
        ),
        42.0
    );
}

#[test]
fn test_bound_method_read_as_property() {
    assert_eq!(
        eval_num(
            "class Box { fun init(v) { this.v = v; } fun get() { return this.v; } }\n\
             let m = Box(7).get;\n\
             m();"
        ),
        7.0
    );
}

#[test]
fn test_recursive_fibonacci() {
    assert_eq!(
        eval_num("fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); } fib(10);"),
        55.0
    );
}

#[test]
fn test_try_catch_message() {
    assert_eq!(
        eval_str("let m = null; try { throw \"boom\"; } catch (e) { m = e.message; } m;"),
        "boom"
    );
}

#[test]
fn test_foreach_over_array() {
    assert_eq!(
        eval_num("let xs = [1,2,3]; let t = 0; foreach (v in xs) t = t + v; t;"),
        6.0
    );
}

#[test]
fn test_foreach_over_map_keys_in_insertion_order() {
    assert_eq!(
        eval_str("let m = {a: 1, b: 2}; let ks = \"\"; foreach (k in m) ks = ks + k; ks;"),
        "ab"
    );
}

#[test]
fn test_foreach_non_iterable_is_catchable() {
    assert_eq!(
        eval_num("let r = 0; try { foreach (v in 5) r = 1; } catch (e) { r = 2; } r;"),
        2.0
    );
}

#[test]
fn test_closure_captures_environment() {
    assert_eq!(
        eval_num(
            "fun counter() { let n = 0; return fun () { n = n + 1; return n; }; }\n\
             let c = counter();\n\
             c(); c();"
        ),
        2.0
    );
    // Two closures from two calls do not share state
    assert_eq!(
        eval_num(
            "fun counter() { let n = 0; return fun () { n = n + 1; return n; }; }\n\
             let a = counter(); let b = counter();\n\
             a(); a(); b();"
        ),
        1.0
    );
}

#[test]
fn test_short_circuit_yields_operand_value() {
    assert_eq!(eval_num("null or 5;"), 5.0);
    assert_eq!(eval_num("1 and 2;"), 2.0);
    let (_, value) = eval("false and 2;");
    assert_eq!(value, Value::Bool(false));
    // The right side must not run when short-circuited
    assert_eq!(
        eval_num("let n = 0; fun side() { n = n + 1; return true; } false and side(); n;"),
        0.0
    );
}

#[test]
fn test_optional_chaining() {
    let (_, value) = eval("let a = null; a?.x;");
    assert_eq!(value, Value::Null);
    let (_, value) = eval("let a = null; a?.f();");
    assert_eq!(value, Value::Null);
    let (_, value) = eval("let a = null; a?.[0];");
    assert_eq!(value, Value::Null);
    let (_, value) = eval("null?.x == null;");
    assert_eq!(value, Value::Bool(true));
    // No user code runs on the short-circuited path
    assert_eq!(
        eval_num("let n = 0; fun idx() { n = n + 1; return 0; } let a = null; a?.[idx()]; n;"),
        0.0
    );
}

#[test]
fn test_const_immutability() {
    let mut vm = Vm::new();
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(!vm.interpret("<test>", "const k = 1; k = 2;"));
    // Missing initializer is rejected at compile time
    let mut vm = Vm::new();
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(!vm.interpret("<test>", "const k;"));
    // Reading and shadowing are fine
    assert_eq!(eval_num("const k = 2; { let k = 3; } k;"), 2.0);
}

#[test]
fn test_string_interning_identity() {
    let mut vm = Vm::new();
    let first = vm.eval("<test>", "\"identity\";").unwrap();
    let second = vm.eval("<test>", "\"identity\";").unwrap();
    // Same literal text, same heap object
    assert_eq!(first, second);
    // Content equality through concatenation lands on the same object too
    let (_, joined) = eval("let a = \"ab\" + \"c\"; let b = \"a\" + \"bc\"; a == b;");
    assert_eq!(joined, Value::Bool(true));
}

#[test]
fn test_stack_balance_after_interpret() {
    let mut vm = Vm::new();
    assert!(vm.interpret(
        "<test>",
        "fun f(x) { return x * 2; } let r = 0; for (let i = 0; i < 5; i = i + 1) r = f(i); r;"
    ));
    assert_eq!(vm.stack_size(), 0);
    assert_eq!(vm.frame_count(), 0);
    assert_eq!(vm.try_depth(), 0);
}

#[test]
fn test_switch_without_fallthrough() {
    let source = "let r = 0; switch (DISC) { case 1: r = 10; case 2: r = 20; default: r = 30; } r;";
    assert_eq!(eval_num(&source.replace("DISC", "1")), 10.0);
    assert_eq!(eval_num(&source.replace("DISC", "2")), 20.0);
    assert_eq!(eval_num(&source.replace("DISC", "9")), 30.0);
}

#[test]
fn test_enum_match_with_payload() {
    assert_eq!(
        eval_num(
            "enum Shape { Circle(r), Dot }\n\
             let s = Shape.Circle(3);\n\
             let out = 0;\n\
             match (s) { case Shape.Circle(r): out = r; default: out = -1; }\n\
             out;"
        ),
        3.0
    );
    assert_eq!(
        eval_num(
            "enum Shape { Circle(r), Dot }\n\
             let out = 0;\n\
             match (Shape.Dot) { case Shape.Circle(r): out = r; case Shape.Dot: out = 7; }\n\
             out;"
        ),
        7.0
    );
}

#[test]
fn test_enum_variant_shape() {
    // Variant values are map-shaped and inspectable
    assert_eq!(eval_str("enum E { A(x) } E.A(1)._tag;"), "A");
    assert_eq!(eval_num("enum E { A(x) } E.A(9)._values[0];"), 9.0);
    assert_eq!(eval_str("enum E { A(x), B } E.B._enum;"), "E");
}

#[test]
fn test_unwrap_operator() {
    assert_eq!(eval_num("fun f() { return Option.Some(5)?; } f();"), 5.0);
    assert_eq!(
        eval_str(
            "fun g() { let v = Result.Err(\"bad\")?; return 99; }\n\
             let r = g();\n\
             let out = \"\";\n\
             match (r) { case Result.Err(m): out = m; default: out = \"?\"; }\n\
             out;"
        ),
        "bad"
    );
    // None early-returns None
    assert_eq!(
        eval_num(
            "fun h() { let v = Option.None?; return 1; }\n\
             let out = 0;\n\
             match (h()) { case Option.None: out = 4; default: out = -1; }\n\
             out;"
        ),
        4.0
    );
}

#[test]
fn test_string_interpolation() {
    assert_eq!(eval_str("let x = 7; \"v=${x}!\";"), "v=7!");
    assert_eq!(eval_str("\"${1/2}\";"), "0.5");
    assert_eq!(eval_str("let a = 1; let b = 2; \"${a}+${b}=${a+b}\";"), "1+2=3");
}

#[test]
fn test_array_and_map_indexing() {
    assert_eq!(eval_num("let xs = [1,2,3]; xs[1] = 9; xs[1];"), 9.0);
    assert_eq!(eval_num("let m = {}; m[\"k\"] = 4; m.k;"), 4.0);
    assert_eq!(eval_str("let s = \"abc\"; s[1];"), "b");
    let (_, missing) = eval("let m = {a: 1}; m[\"zz\"];");
    assert_eq!(missing, Value::Null);
}

#[test]
fn test_membership_operator() {
    let (_, value) = eval("let m = {a: 1}; \"a\" in m;");
    assert_eq!(value, Value::Bool(true));
    let (_, value) = eval("let m = {a: 1}; \"b\" in m;");
    assert_eq!(value, Value::Bool(false));
}

#[test]
fn test_inline_cache_transparency_across_shapes() {
    // The same property site sees many maps and instances; results must
    // match a cache-free evaluation
    assert_eq!(
        eval_num(
            "fun get(o) { return o.v; }\n\
             class C { fun init(v) { this.v = v; } }\n\
             let t = 0;\n\
             for (let i = 0; i < 10; i = i + 1) { t = t + get({v: i}); }\n\
             for (let i = 0; i < 10; i = i + 1) { t = t + get(C(i)); }\n\
             t;"
        ),
        90.0
    );
}

#[test]
fn test_map_mutation_invalidates_cache() {
    assert_eq!(
        eval_num(
            "let m = {a: 1};\n\
             fun read() { return m.a; }\n\
             read(); read();\n\
             m = {z: 0, a: 5};\n\
             read();"
        ),
        5.0
    );
}

fn add_one(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let n = args[0].as_number().unwrap_or(0.0);
    Ok(Value::Number(n + 1.0))
}

fn call_twice(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let f = args[0];
    let once = vm.call_value(f, &[args[1]])?;
    vm.call_value(f, &[once])
}

#[test]
fn test_native_functions_and_reentry() {
    let mut vm = Vm::new();
    vm.define_native("addOne", 1, add_one);
    vm.define_native("twice", 2, call_twice);

    let value = vm.eval("<test>", "addOne(41);").unwrap();
    assert_eq!(value, Value::Number(42.0));

    let value = vm
        .eval("<test>", "fun inc(x) { return x + 1; } twice(inc, 5);")
        .unwrap();
    assert_eq!(value, Value::Number(7.0));

    // Wrong arity is an error
    let mut vm = Vm::new();
    vm.define_native("addOne", 1, add_one);
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(!vm.interpret("<test>", "addOne(1, 2);"));
}

#[test]
fn test_determinism_across_runs() {
    let source = "let acc = \"\";\n\
                  for (let i = 0; i < 20; i = i + 1) { acc = acc + \"${i * 3}\" + \",\"; }\n\
                  acc;";
    let first = eval_str(source);
    let second = eval_str(source);
    assert_eq!(first, second);
}

fn small_heap_vm() -> Vm {
    Vm::with_config(
        EngineLimits::default(),
        GcTuning {
            promotion_age: 2,
            young_growth_factor: 1.5,
            min_young_bytes: 1024,
            heap_growth_factor: 1.5,
            min_heap_bytes: 4096,
            sweep_batch: 8,
        },
        Box::new(FsResolver),
    )
}

#[test]
fn test_gc_pressure_preserves_live_values() {
    let mut vm = small_heap_vm();
    let value = vm
        .eval(
            "<test>",
            "let keep = \"\";\n\
             for (let i = 0; i < 200; i = i + 1) {\n\
               let tmp = [\"${i}\", \"${i + 1}\"];\n\
               keep = tmp[0] + \"-\" + tmp[1];\n\
             }\n\
             keep;",
        )
        .unwrap();
    assert_eq!(vm.stringify(value), "199-200");
}

#[test]
fn test_gc_pressure_with_closures_and_classes() {
    let mut vm = small_heap_vm();
    let value = vm
        .eval(
            "<test>",
            "class Node { fun init(v) { this.v = v; } }\n\
             fun make(v) { let n = Node(v); return fun () { return n.v; }; }\n\
             let fns = [];\n\
             for (let i = 0; i < 50; i = i + 1) { fns = [make(i)]; }\n\
             fns[0]();",
        )
        .unwrap();
    assert_eq!(value, Value::Number(49.0));
}

#[test]
fn test_instruction_budget_terminates_runaway_loop() {
    let mut vm = Vm::with_config(
        EngineLimits::default().with_instruction_budget(10_000),
        GcTuning::default(),
        Box::new(FsResolver),
    );
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(!vm.interpret("<test>", "while (true) {}"));
}

#[test]
fn test_call_depth_limit() {
    let mut vm = Vm::new();
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(!vm.interpret("<test>", "fun r() { return r(); } r();"));
    // Budget errors are not catchable by script-level try
    let mut vm = Vm::new();
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(!vm.interpret(
        "<test>",
        "fun r() { return r(); } try { r(); } catch (e) { 1; }"
    ));
}

#[test]
fn test_yield_is_reserved() {
    let mut vm = Vm::new();
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(!vm.interpret("<test>", "yield 1;"));
}

//! Error handling tests: the try-frame model, wrapped error values and the
//! diagnostic wire format.

mod common;

use common::{eval, eval_num, eval_str, SharedBuf};
use erkao_vm::{Value, Vm};

#[test]
fn test_thrown_value_is_wrapped() {
    let (_, value) = eval("let t = false; try { throw 5; } catch (e) { t = e._error; } t;");
    assert_eq!(value, Value::Bool(true));
    assert_eq!(eval_num("let v = 0; try { throw 5; } catch (e) { v = e.value; } v;"), 5.0);
    assert_eq!(
        eval_str("let m = \"\"; try { throw \"boom\"; } catch (e) { m = e.message; } m;"),
        "boom"
    );
}

#[test]
fn test_rethrowing_keeps_the_wrapper() {
    // A caught error thrown again is not double-wrapped
    assert_eq!(
        eval_str(
            "let m = \"\";\n\
             try {\n\
               try { throw \"inner\"; } catch (e) { throw e; }\n\
             } catch (outer) { m = outer.message; }\n\
             m;"
        ),
        "inner"
    );
}

#[test]
fn test_trace_walks_the_frame_stack() {
    let (vm, value) = eval(
        "fun deep() { throw \"lost\"; }\n\
         fun mid() { deep(); }\n\
         let t = null;\n\
         try { mid(); } catch (e) { t = e.trace; }\n\
         t;",
    );
    let rendered = vm.stringify(value);
    assert!(rendered.contains("at deep"), "trace was: {rendered}");
    assert!(rendered.contains("at mid"), "trace was: {rendered}");
}

#[test]
fn test_runtime_errors_are_catchable() {
    // NameError
    assert_eq!(
        eval_num("let r = 0; try { missing; } catch (e) { r = 1; } r;"),
        1.0
    );
    // TypeError
    assert_eq!(
        eval_num("let r = 0; try { 1 + \"x\"; } catch (e) { r = 2; } r;"),
        2.0
    );
    // BoundsError
    assert_eq!(
        eval_num("let r = 0; let xs = [1]; try { xs[5]; } catch (e) { r = 3; } r;"),
        3.0
    );
    // ArityError
    assert_eq!(
        eval_num("fun f(a) { return a; } let r = 0; try { f(); } catch (e) { r = 4; } r;"),
        4.0
    );
}

#[test]
fn test_error_messages_carry_the_taxonomy() {
    assert!(eval_str("let m = \"\"; try { missing; } catch (e) { m = e.message; } m;")
        .contains("undefined variable 'missing'"));
    assert!(eval_str("let m = \"\"; try { [1][9]; } catch (e) { m = e.message; } m;")
        .contains("BoundsError"));
}

#[test]
fn test_unwind_restores_environment_and_stack() {
    // The throw happens deep in nested scopes; the handler still sees the
    // outer bindings and a balanced stack
    let mut vm = Vm::new();
    assert!(vm.interpret(
        "<test>",
        "let outer = 1;\n\
         try {\n\
           { let shadow = 2; { let deeper = 3; throw \"out\"; } }\n\
         } catch (e) { outer = outer + 10; }\n\
         outer;"
    ));
    assert_eq!(vm.stack_size(), 0);
    assert_eq!(vm.try_depth(), 0);
}

#[test]
fn test_handler_in_caller_catches_callee_throw() {
    assert_eq!(
        eval_num(
            "fun blow() { throw \"up\"; }\n\
             let r = 0;\n\
             try { blow(); } catch (e) { r = 7; }\n\
             r;"
        ),
        7.0
    );
}

#[test]
fn test_nested_try_inner_wins() {
    assert_eq!(
        eval_str(
            "let who = \"\";\n\
             try {\n\
               try { throw \"x\"; } catch (e) { who = \"inner\"; }\n\
             } catch (e) { who = \"outer\"; }\n\
             who;"
        ),
        "inner"
    );
}

#[test]
fn test_uncaught_throw_reports_and_fails() {
    let mut vm = Vm::new();
    let sink = SharedBuf::default();
    vm.set_diagnostic_writer(Box::new(sink.clone()));
    assert!(!vm.interpret("<test>", "throw \"unhandled\";"));
    let output = sink.contents();
    assert!(output.contains("uncaught throw"), "diag was: {output}");
    assert!(output.contains("unhandled"), "diag was: {output}");
}

#[test]
fn test_runtime_diagnostic_wire_format() {
    let mut vm = Vm::new();
    let sink = SharedBuf::default();
    vm.set_diagnostic_writer(Box::new(sink.clone()));
    assert!(!vm.interpret("demo.ek", "let x = 1;\nlet y = oops;\n"));
    let output = sink.contents();
    assert!(
        output.starts_with("demo.ek:2:9: RuntimeError:"),
        "diag was: {output}"
    );
    // Two-line snippet: the source line and a caret underline
    assert!(output.contains("    let y = oops;\n"), "diag was: {output}");
    assert!(output.contains("    ^^^^"), "diag was: {output}");
}

#[test]
fn test_compile_diagnostic_wire_format() {
    let mut vm = Vm::new();
    let sink = SharedBuf::default();
    vm.set_diagnostic_writer(Box::new(sink.clone()));
    assert!(!vm.interpret("demo.ek", "let 1 = 2;"));
    let output = sink.contents();
    assert!(output.contains("demo.ek:1:5: Error:"), "diag was: {output}");
}

#[test]
fn test_did_you_mean_in_output() {
    let mut vm = Vm::new();
    let sink = SharedBuf::default();
    vm.set_diagnostic_writer(Box::new(sink.clone()));
    assert!(!vm.interpret("demo.ek", "whle (true) {}"));
    let output = sink.contents();
    assert!(
        output.contains("did you mean 'while'?"),
        "diag was: {output}"
    );
}

#[test]
fn test_lex_error_is_fatal_and_reported() {
    let mut vm = Vm::new();
    let sink = SharedBuf::default();
    vm.set_diagnostic_writer(Box::new(sink.clone()));
    assert!(!vm.interpret("demo.ek", "let s = \"unterminated;"));
    assert!(sink.contents().contains("unterminated string"));
}

#[test]
fn test_invalid_assignment_target_reported() {
    let mut vm = Vm::new();
    let sink = SharedBuf::default();
    vm.set_diagnostic_writer(Box::new(sink.clone()));
    assert!(!vm.interpret("demo.ek", "1 + 2 = 3;"));
    assert!(sink.contents().contains("invalid assignment target"));
}

#[test]
fn test_const_reassignment_is_catchable() {
    assert_eq!(
        eval_num("const k = 1; let r = 0; try { k = 2; } catch (e) { r = 9; } r;"),
        9.0
    );
    assert_eq!(eval_num("const k = 1; k;"), 1.0);
}

#[test]
fn test_state_restored_after_failed_interpret() {
    // A failed run must leave the VM reusable
    let mut vm = Vm::new();
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(!vm.interpret("<test>", "throw \"bad\";"));
    assert_eq!(vm.frame_count(), 0);
    let value = vm.eval("<test>", "40 + 2;").unwrap();
    assert_eq!(value, Value::Number(42.0));
}

//! Module loading tests against real on-disk trees.

mod common;

use std::fs;
use std::path::Path;

use common::SharedBuf;
use erkao_vm::{Value, Vm};

/// Writes a module tree and evaluates `main.ek`, returning the VM and the
/// final expression value.
fn eval_tree(files: &[(&str, &str)], main_source: &str) -> (Vm, Value) {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, contents) in files {
        fs::write(dir.path().join(name), contents).expect("write module");
    }
    let main_path = dir.path().join("main.ek");
    fs::write(&main_path, main_source).expect("write main");

    let mut vm = Vm::new();
    let value = vm
        .eval(&main_path.to_string_lossy(), main_source)
        .unwrap_or_else(|e| panic!("eval failed: {e}"));
    // The tree must outlive execution only; the VM owns everything after
    drop(dir);
    (vm, value)
}

#[test]
fn test_import_with_alias() {
    let (vm, value) = eval_tree(
        &[("util.ek", "export let x = 5;")],
        "import \"./util.ek\" as u; u.x;",
    );
    assert_eq!(vm.stringify(value), "5");
}

#[test]
fn test_import_star_alias() {
    let (_, value) = eval_tree(
        &[("util.ek", "export let x = 5; export fun double(n) { return n * 2; }")],
        "import * as u from \"./util.ek\"; u.double(u.x);",
    );
    assert_eq!(value, Value::Number(10.0));
}

#[test]
fn test_default_export() {
    let (_, value) = eval_tree(
        &[("answer.ek", "export default 42;")],
        "import answer from \"./answer.ek\"; answer;",
    );
    assert_eq!(value, Value::Number(42.0));
}

#[test]
fn test_implicit_exports_when_nothing_explicit() {
    // A module with no export statements publishes its whole top level
    let (_, value) = eval_tree(
        &[("data.ek", "let a = 1; let b = 2;")],
        "import * as d from \"./data.ek\"; d.a + d.b;",
    );
    assert_eq!(value, Value::Number(3.0));
}

#[test]
fn test_private_bindings_are_not_exported() {
    let (_, value) = eval_tree(
        &[("vault.ek", "private let secret = 99; let open = 2;")],
        "import * as v from \"./vault.ek\"; v.open;",
    );
    assert_eq!(value, Value::Number(2.0));

    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("vault.ek"),
        "private let secret = 99; let open = 2;",
    )
    .unwrap();
    let main_path = dir.path().join("main.ek");
    let source = "import * as v from \"./vault.ek\"; v.secret;";
    fs::write(&main_path, source).unwrap();
    let mut vm = Vm::new();
    vm.set_diagnostic_writer(Box::new(std::io::sink()));
    assert!(vm.eval(&main_path.to_string_lossy(), source).is_err());
}

#[test]
fn test_module_idempotence_same_instance() {
    let (_, value) = eval_tree(
        &[("u.ek", "export let x = 1;")],
        "import \"./u.ek\" as a; import \"./u.ek\" as b; a == b;",
    );
    // Same resolved path, same record object
    assert_eq!(value, Value::Bool(true));
}

#[test]
fn test_module_body_runs_once() {
    // The module's side effect happens on first load only
    let (_, value) = eval_tree(
        &[("once.ek", "tick();")],
        "let n = 0;\n\
         fun tick() { n = n + 1; return n; }\n\
         import \"./once.ek\";\n\
         import \"./once.ek\" as again;\n\
         n;",
    );
    assert_eq!(value, Value::Number(1.0));
}

#[test]
fn test_cyclic_imports_load_successfully() {
    let (_, value) = eval_tree(
        &[
            ("a.ek", "import \"./b.ek\"; export let X = 1;"),
            ("b.ek", "import \"./a.ek\"; export let Y = 2;"),
        ],
        "import * as a from \"./a.ek\"; import * as b from \"./b.ek\"; a.X + b.Y;",
    );
    assert_eq!(value, Value::Number(3.0));
}

#[test]
fn test_export_from_with_renames() {
    let (_, value) = eval_tree(
        &[
            ("base.ek", "export let x = 5; export let y = 6;"),
            ("facade.ek", "export { x as renamed, y } from \"./base.ek\";"),
        ],
        "import * as f from \"./facade.ek\"; f.renamed + f.y;",
    );
    assert_eq!(value, Value::Number(11.0));
}

#[test]
fn test_export_star_from() {
    let (_, value) = eval_tree(
        &[
            ("base.ek", "export let x = 5; export let y = 6;"),
            ("all.ek", "export * from \"./base.ek\";"),
        ],
        "import * as a from \"./all.ek\"; a.x * a.y;",
    );
    assert_eq!(value, Value::Number(30.0));
}

#[test]
fn test_unresolvable_import_is_catchable() {
    let dir = tempfile::tempdir().unwrap();
    let main_path = dir.path().join("main.ek");
    let source = "let r = 0;\n\
                  try { import \"./missing.ek\"; } catch (e) { r = 1; }\n\
                  r;";
    fs::write(&main_path, source).unwrap();
    let mut vm = Vm::new();
    let value = vm.eval(&main_path.to_string_lossy(), source).unwrap();
    assert_eq!(value, Value::Number(1.0));
}

#[test]
fn test_failed_module_poisons_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("broken.ek"), "let = ;").unwrap();
    let main_path = dir.path().join("main.ek");
    let source = "let first = \"\"; let second = \"\";\n\
                  try { import \"./broken.ek\"; } catch (e) { first = e.message; }\n\
                  try { import \"./broken.ek\"; } catch (e) { second = e.message; }\n\
                  second;";
    fs::write(&main_path, source).unwrap();

    let mut vm = Vm::new();
    let sink = SharedBuf::default();
    vm.set_diagnostic_writer(Box::new(sink.clone()));
    let value = vm.eval(&main_path.to_string_lossy(), source).unwrap();
    assert!(vm.stringify(value).contains("previously failed"));
    // The broken module's own diagnostics were reported once
    assert!(sink.contents().contains("Error"));
}

#[test]
fn test_import_error_mentions_literal() {
    let dir = tempfile::tempdir().unwrap();
    let main_path = dir.path().join("main.ek");
    let source = "let m = \"\";\n\
                  try { import \"./nowhere.ek\"; } catch (e) { m = e.message; }\n\
                  m;";
    fs::write(&main_path, source).unwrap();
    let mut vm = Vm::new();
    let value = vm.eval(&main_path.to_string_lossy(), source).unwrap();
    assert!(vm.stringify(value).contains("./nowhere.ek"));
}

#[test]
fn test_module_paths_are_canonicalized() {
    // Two spellings of the same file share one record
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("u.ek"), "export let x = 1;").unwrap();
    fs::write(dir.path().join("sub/go.ek"), "import \"../u.ek\" as up; export let x = up.x;")
        .unwrap();
    let main_path = dir.path().join("main.ek");
    let source = "import \"./u.ek\" as direct;\n\
                  import \"./sub/go.ek\" as via;\n\
                  direct.x + via.x;";
    fs::write(&main_path, source).unwrap();
    let mut vm = Vm::new();
    let value = vm.eval(&main_path.to_string_lossy(), source).unwrap();
    assert_eq!(value, Value::Number(2.0));
}

#[test]
fn test_resolver_extension_inference() {
    let (_, value) = eval_tree(
        &[("util.ek", "export let x = 8;")],
        "import \"./util\" as u; u.x;",
    );
    assert_eq!(value, Value::Number(8.0));
}

#[test]
fn test_main_path_survives_relative_imports() {
    // Imports resolve relative to the importing file, not the process cwd
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("nested")).unwrap();
    fs::write(dir.path().join("nested/dep.ek"), "export let v = 3;").unwrap();
    let main_path = dir.path().join("nested/main.ek");
    let source = "import \"./dep.ek\" as d; d.v;";
    fs::write(&main_path, source).unwrap();
    assert!(Path::new(&main_path).is_absolute() || main_path.exists());

    let mut vm = Vm::new();
    let value = vm.eval(&main_path.to_string_lossy(), source).unwrap();
    assert_eq!(value, Value::Number(3.0));
}

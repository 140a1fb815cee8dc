//! Shared helpers for the integration suites.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use erkao_vm::{Value, Vm};

/// Evaluates a source buffer in a fresh VM, returning both so callers can
/// inspect heap-backed results.
pub fn eval(source: &str) -> (Vm, Value) {
    let mut vm = Vm::new();
    let value = vm
        .eval("<test>", source)
        .unwrap_or_else(|e| panic!("eval failed: {e}\nsource: {source}"));
    (vm, value)
}

/// Evaluates and expects a numeric result.
pub fn eval_num(source: &str) -> f64 {
    let (_, value) = eval(source);
    value
        .as_number()
        .unwrap_or_else(|| panic!("expected a number, got {value:?}"))
}

/// Evaluates and renders the result the way the language prints it.
pub fn eval_str(source: &str) -> String {
    let (vm, value) = eval(source);
    vm.stringify(value)
}

/// A clonable in-memory diagnostic sink.
#[derive(Clone, Default)]
pub struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//! Native function support for the Erkao VM.
//!
//! The standard library proper lives outside this crate; what this module
//! provides is the registration surface embedders use to expose host
//! functions, plus the two built-in enums (`Option` and `Result`) that the
//! unwrap operator `?` is defined over.

use crate::object::{NativeFn, ObjArray, ObjNative, Object};
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    /// Registers a host function as an immutable global binding.
    ///
    /// `arity` of `-1` accepts any argument count. The native runs to
    /// completion on the VM thread and may reenter script code through
    /// [`Vm::call_value`]; fresh allocations held across such a call
    /// should be protected with [`Vm::pin`].
    pub fn define_native(&mut self, name: &str, arity: i32, function: NativeFn) {
        let native = self.heap.alloc(Object::Native(ObjNative {
            name: name.to_string(),
            arity,
            function,
        }));
        let binding = self.heap.intern(name);
        self.heap
            .env_define(self.globals, binding, Value::Obj(native), false);
    }
}

/// Installs `Option { Some(x), None }` and `Result { Ok(x), Err(e) }`.
pub(crate) fn register_builtins(vm: &mut Vm) {
    register_enum(vm, "Option", &[("Some", 1), ("None", 0)]);
    register_enum(vm, "Result", &[("Ok", 1), ("Err", 1)]);
}

fn register_enum(vm: &mut Vm, name: &str, variants: &[(&str, usize)]) {
    let enum_name = vm.heap.intern(name);
    let table = vm.heap.new_map(variants.len());

    for (variant_name, arity) in variants {
        let variant = vm.heap.intern(variant_name);
        let value = if *arity == 0 {
            // Nullary variants are instant values with an empty payload
            let values = vm
                .heap
                .alloc(Object::Array(ObjArray { items: Vec::new() }));
            let shape = vm.heap.new_map(3);
            let _ = vm
                .heap
                .map_insert(shape, vm.syms.enum_tag, Value::Obj(enum_name));
            let _ = vm
                .heap
                .map_insert(shape, vm.syms.variant_tag, Value::Obj(variant));
            let _ = vm.heap.map_insert(shape, vm.syms.values, Value::Obj(values));
            Value::Obj(shape)
        } else {
            Value::Obj(vm.heap.alloc(Object::EnumCtor(crate::object::ObjEnumCtor {
                enum_name,
                variant,
                arity: *arity,
            })))
        };
        let _ = vm.heap.map_insert(table, variant, value);
    }

    let globals = vm.globals;
    vm.heap
        .env_define(globals, enum_name, Value::Obj(table), false);
}

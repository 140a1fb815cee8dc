//! Heap object module for the Erkao VM.
//!
//! This module provides the object kinds that live on the collected heap,
//! together with the per-object header the generational collector relies
//! on. Object bodies reference each other exclusively through [`Handle`]s;
//! the only non-handle ownership edges are the `Rc` links to shared chunks
//! and programs.

use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::VmResult;
use crate::heap::Handle;
use crate::map::OrderedMap;
use crate::program::Program;
use crate::value::Value;

/// Host function signature. Natives run to completion on the VM thread and
/// may reenter the interpreter through [`crate::vm::Vm::call_value`].
pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> VmResult<Value>;

/// Which generation an object currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Recently allocated; collected on every minor cycle
    Young,
    /// Survived promotion; swept incrementally after full cycles
    Old,
}

/// Bookkeeping carried by every heap object.
#[derive(Debug, Clone)]
pub struct ObjHeader {
    /// Current generation
    pub generation: Generation,
    /// Minor cycles survived, saturating
    pub age: u8,
    /// Tri-colour mark bit (true = reached this cycle)
    pub marked: bool,
    /// Old-generation owner known to reference young objects; consulted as
    /// a root by minor cycles
    pub remembered: bool,
    /// Approximate byte footprint, maintained so the generation byte
    /// counters never need to re-walk object contents
    pub size: usize,
}

impl ObjHeader {
    /// Header for a freshly allocated young object.
    pub fn young(size: usize) -> Self {
        Self {
            generation: Generation::Young,
            age: 0,
            marked: false,
            remembered: false,
            size,
        }
    }
}

/// An immutable interned string.
#[derive(Debug)]
pub struct ObjStr {
    /// The character data; never mutated after construction
    pub chars: Box<str>,
}

/// A growable array of values.
#[derive(Debug, Default)]
pub struct ObjArray {
    pub items: Vec<Value>,
}

/// An insertion-ordered map with interned-string keys.
#[derive(Debug, Default)]
pub struct ObjMap {
    pub entries: OrderedMap<Value>,
}

/// A compiled function, optionally closed over an environment.
///
/// The compiler produces a template (with `env == None`); executing
/// `CLOSURE` stamps out a copy whose `env` is the environment live at that
/// instant. All copies share one chunk.
#[derive(Debug)]
pub struct ObjFunction {
    /// Function name for diagnostics; `None` for anonymous functions
    pub name: Option<Handle>,
    /// Parameter names in declaration order
    pub params: Vec<Handle>,
    /// Declared parameter count
    pub arity: usize,
    /// Parameters without defaults; calls must supply at least this many
    pub min_arity: usize,
    /// True for `init` methods, whose calls yield the receiver
    pub is_initializer: bool,
    /// The compiled body
    pub chunk: Rc<Chunk>,
    /// Captured environment; `None` on compiler-produced templates
    pub env: Option<Handle>,
    /// Owning program, kept alive for diagnostics while the function exists
    pub program: Rc<Program>,
}

/// A host function exposed to scripts.
pub struct ObjNative {
    /// Display name
    pub name: String,
    /// Fixed arity, or `-1` for variadic
    pub arity: i32,
    /// The host implementation
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// A constructor for one enum variant. Calling it builds the map-shaped
/// variant value `{ _enum, _tag, _values }`.
#[derive(Debug)]
pub struct ObjEnumCtor {
    /// Name of the declaring enum
    pub enum_name: Handle,
    /// Variant name
    pub variant: Handle,
    /// Payload arity
    pub arity: usize,
}

/// A class: a name and its method table.
#[derive(Debug)]
pub struct ObjClass {
    pub name: Handle,
    /// Method name to function value, in declaration order
    pub methods: OrderedMap<Value>,
}

/// An instance of a class.
#[derive(Debug)]
pub struct ObjInstance {
    /// Defining class; module instances have no class
    pub class: Option<Handle>,
    /// Field name to value
    pub fields: OrderedMap<Value>,
}

/// A method read off an instance, carrying its receiver.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    /// The underlying function object
    pub method: Handle,
}

/// One binding in an environment.
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub value: Value,
    /// False for `const` bindings; `SET_VAR` refuses reassignment
    pub mutable: bool,
}

/// A lexical environment node: bindings plus a parent link.
///
/// Environments are ordinary heap objects because closures can keep them
/// alive long after the frame that pushed them has returned.
#[derive(Debug)]
pub struct ObjEnv {
    pub bindings: OrderedMap<Binding>,
    pub parent: Option<Handle>,
}

/// A heap object body.
#[derive(Debug)]
pub enum Object {
    Str(ObjStr),
    Array(ObjArray),
    Map(ObjMap),
    Function(ObjFunction),
    Native(ObjNative),
    EnumCtor(ObjEnumCtor),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Env(ObjEnv),
}

impl Object {
    /// A short noun for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::Str(_) => "string",
            Object::Array(_) => "array",
            Object::Map(_) => "map",
            Object::Function(_) => "function",
            Object::Native(_) => "native function",
            Object::EnumCtor(_) => "enum constructor",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "bound method",
            Object::Env(_) => "environment",
        }
    }

    /// Approximate byte footprint of the object body.
    ///
    /// Chunks are counted on the compiler-produced template only; closure
    /// copies share the template's chunk through the `Rc`.
    pub fn byte_size(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        match self {
            Object::Str(s) => base + s.chars.len(),
            Object::Array(a) => base + a.items.capacity() * std::mem::size_of::<Value>(),
            Object::Map(m) => base + m.entries.shallow_bytes(),
            Object::Function(f) => {
                let chunk = if f.env.is_none() { f.chunk.byte_size() } else { 0 };
                base + f.params.capacity() * std::mem::size_of::<Handle>() + chunk
            }
            Object::Native(_) => base,
            Object::EnumCtor(_) => base,
            Object::Class(c) => base + c.methods.shallow_bytes(),
            Object::Instance(i) => base + i.fields.shallow_bytes(),
            Object::BoundMethod(_) => base,
            Object::Env(e) => base + e.bindings.shallow_bytes(),
        }
    }

    /// Invokes `visit` for every handle directly reachable from this object.
    ///
    /// Inline-cache slots are deliberately not children: caches must never
    /// keep an object alive.
    pub fn for_each_child(&self, mut visit: impl FnMut(Handle)) {
        let mut visit_value = |value: &Value, visit: &mut dyn FnMut(Handle)| {
            if let Value::Obj(handle) = value {
                visit(*handle);
            }
        };
        match self {
            Object::Str(_) | Object::Native(_) => {}
            Object::Array(a) => {
                for item in &a.items {
                    visit_value(item, &mut visit);
                }
            }
            Object::Map(m) => {
                for (key, value) in m.entries.iter() {
                    visit(key);
                    visit_value(value, &mut visit);
                }
            }
            Object::Function(f) => {
                if let Some(name) = f.name {
                    visit(name);
                }
                for param in &f.params {
                    visit(*param);
                }
                if let Some(env) = f.env {
                    visit(env);
                }
                for constant in &f.chunk.constants {
                    visit_value(constant, &mut visit);
                }
            }
            Object::EnumCtor(e) => {
                visit(e.enum_name);
                visit(e.variant);
            }
            Object::Class(c) => {
                visit(c.name);
                for (key, value) in c.methods.iter() {
                    visit(key);
                    visit_value(value, &mut visit);
                }
            }
            Object::Instance(i) => {
                if let Some(class) = i.class {
                    visit(class);
                }
                for (key, value) in i.fields.iter() {
                    visit(key);
                    visit_value(value, &mut visit);
                }
            }
            Object::BoundMethod(b) => {
                visit_value(&b.receiver, &mut visit);
                visit(b.method);
            }
            Object::Env(e) => {
                for (key, binding) in e.bindings.iter() {
                    visit(key);
                    visit_value(&binding.value, &mut visit);
                }
                if let Some(parent) = e.parent {
                    visit(parent);
                }
            }
        }
    }
}

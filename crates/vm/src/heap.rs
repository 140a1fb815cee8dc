//! Heap module for the Erkao VM.
//!
//! This module provides the single VM-owned heap every subsystem allocates
//! from. Objects live in a slab of epoch-tagged slots; a [`Handle`] names a
//! slot together with the epoch it was allocated in, so a handle held past
//! its object's death (a stale inline-cache entry, for instance) misses
//! instead of aliasing whatever reuses the slot.
//!
//! Allocation never collects. It only accumulates byte counters and raises
//! pending-collection flags; the dispatch loop runs the collector at
//! safepoints, when every live value is reachable from VM roots.

use hashbrown::HashMap;

use crate::error::{VmError, VmResult};
use crate::limits::GcTuning;
use crate::map::OrderedMap;
use crate::object::{
    Binding, Generation, ObjArray, ObjEnv, ObjHeader, ObjInstance, ObjMap, ObjStr, Object,
};
use crate::value::{format_number, Value};

/// Rendering depth cap for [`Heap::stringify`]; cyclic structures bottom
/// out as `...`.
const STRINGIFY_DEPTH: u32 = 8;

/// An opaque reference to a heap object.
///
/// The epoch half makes handle identity safe across slot reuse: freeing an
/// object bumps its slot's epoch, so every handle minted for the dead
/// object stops resolving.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    slot: u32,
    epoch: u32,
}

impl Handle {
    fn new(slot: u32, epoch: u32) -> Self {
        Self { slot, epoch }
    }

    /// Packs the handle into its raw bit representation.
    pub fn to_bits(self) -> u64 {
        ((self.epoch as u64) << 32) | self.slot as u64
    }

    /// Rebuilds a handle from [`Handle::to_bits`] output.
    pub fn from_bits(bits: u64) -> Self {
        Self {
            slot: bits as u32,
            epoch: (bits >> 32) as u32,
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({}#{})", self.slot, self.epoch)
    }
}

struct HeapSlot {
    epoch: u32,
    cell: Option<(ObjHeader, Object)>,
}

/// The outcome of an environment assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    /// The binding was updated
    Assigned,
    /// The name resolves to a `const` binding
    Immutable,
    /// No binding of that name is visible
    Undefined,
}

/// The VM-owned heap: slab, generation lists, interner and GC scheduling
/// state.
pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,

    /// Handles of young-generation objects, in allocation order
    pub(crate) young: Vec<Handle>,
    /// Handles of old-generation objects
    pub(crate) old: Vec<Handle>,
    /// Old objects observed to reference young ones; minor-cycle roots
    pub(crate) remembered: Vec<Handle>,

    /// Interning table; exactly the live `Object::Str` contents
    strings: HashMap<Box<str>, Handle>,

    pub(crate) tuning: GcTuning,
    pub(crate) young_bytes: usize,
    pub(crate) old_bytes: usize,
    pub(crate) young_next: usize,
    pub(crate) heap_next: usize,
    pub(crate) minor_pending: bool,
    pub(crate) full_pending: bool,

    /// Tri-colour work queue, kept allocated between cycles
    pub(crate) gray: Vec<Handle>,
    /// Park position of the incremental old-generation sweep, if active
    pub(crate) old_sweep_cursor: Option<usize>,
}

impl Heap {
    /// Creates an empty heap with the given collector tuning.
    pub fn new(tuning: GcTuning) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            young: Vec::new(),
            old: Vec::new(),
            remembered: Vec::new(),
            strings: HashMap::new(),
            young_next: tuning.min_young_bytes,
            heap_next: tuning.min_heap_bytes,
            tuning,
            young_bytes: 0,
            old_bytes: 0,
            minor_pending: false,
            full_pending: false,
            gray: Vec::new(),
            old_sweep_cursor: None,
        }
    }

    // === Allocation ===

    /// Registers a new object on the young generation and returns its
    /// handle. Never collects; only raises pending flags.
    pub fn alloc(&mut self, object: Object) -> Handle {
        let size = object.byte_size();
        let header = ObjHeader::young(size);

        let handle = match self.free.pop() {
            Some(slot) => {
                let epoch = self.slots[slot as usize].epoch;
                self.slots[slot as usize].cell = Some((header, object));
                Handle::new(slot, epoch)
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(HeapSlot {
                    epoch: 0,
                    cell: Some((header, object)),
                });
                Handle::new(slot, 0)
            }
        };

        self.young.push(handle);
        self.young_bytes += size;
        if self.young_bytes > self.young_next {
            self.minor_pending = true;
        }
        if self.bytes_total() > self.heap_next && self.old_sweep_cursor.is_none() {
            self.full_pending = true;
        }
        handle
    }

    /// Interns a string, returning the canonical handle for its content.
    pub fn intern(&mut self, text: &str) -> Handle {
        if let Some(handle) = self.strings.get(text).copied() {
            // During an incremental old sweep an unmarked old string is
            // already condemned; it must not be resurrected through the
            // table. Drop the entry and intern afresh.
            let condemned = self.old_sweep_cursor.is_some()
                && self.header(handle).is_some_and(|h| {
                    h.generation == Generation::Old && !h.marked
                });
            if !condemned {
                return handle;
            }
            self.strings.remove(text);
        }
        let boxed: Box<str> = text.into();
        let handle = self.alloc(Object::Str(ObjStr {
            chars: boxed.clone(),
        }));
        self.strings.insert(boxed, handle);
        handle
    }

    /// Allocates an empty array with room for `capacity` items.
    pub fn new_array(&mut self, capacity: usize) -> Handle {
        self.alloc(Object::Array(ObjArray {
            items: Vec::with_capacity(capacity),
        }))
    }

    /// Allocates an empty map sized for `capacity` entries.
    pub fn new_map(&mut self, capacity: usize) -> Handle {
        self.alloc(Object::Map(ObjMap {
            entries: OrderedMap::with_capacity(capacity),
        }))
    }

    /// Allocates an environment node chained to `parent`.
    pub fn new_env(&mut self, parent: Option<Handle>) -> Handle {
        self.alloc(Object::Env(ObjEnv {
            bindings: OrderedMap::new(),
            parent,
        }))
    }

    /// Allocates a class-less instance (the shape module records use).
    pub fn new_instance(&mut self, class: Option<Handle>) -> Handle {
        self.alloc(Object::Instance(ObjInstance {
            class,
            fields: OrderedMap::new(),
        }))
    }

    // === Access ===

    /// Resolves a handle, if its object is still live.
    pub fn get(&self, handle: Handle) -> Option<&Object> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.cell.as_ref().map(|(_, obj)| obj)
    }

    /// Resolves a handle mutably, if its object is still live.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Object> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.cell.as_mut().map(|(_, obj)| obj)
    }

    pub(crate) fn header(&self, handle: Handle) -> Option<&ObjHeader> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.cell.as_ref().map(|(header, _)| header)
    }

    pub(crate) fn header_mut(&mut self, handle: Handle) -> Option<&mut ObjHeader> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.cell.as_mut().map(|(header, _)| header)
    }

    pub(crate) fn cell_mut(&mut self, handle: Handle) -> Option<&mut (ObjHeader, Object)> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.epoch != handle.epoch {
            return None;
        }
        slot.cell.as_mut()
    }

    /// Kind noun for error messages; `"freed object"` for stale handles.
    pub fn kind_name(&self, handle: Handle) -> &'static str {
        self.get(handle).map_or("freed object", Object::kind_name)
    }

    /// The interned string content behind `handle`, if it is a string.
    pub fn str_value(&self, handle: Handle) -> Option<&str> {
        match self.get(handle)? {
            Object::Str(s) => Some(&s.chars),
            _ => None,
        }
    }

    /// The string content of a string-valued `Value`.
    pub fn value_str(&self, value: Value) -> Option<&str> {
        self.str_value(value.as_obj()?)
    }

    // === Mutation through the write barrier ===

    /// Write barrier: a reference stored into an old-generation owner makes
    /// the owner a root for the next minor cycle.
    pub fn barrier(&mut self, owner: Handle, stored: Value) {
        let Value::Obj(child) = stored else { return };
        let owner_old = matches!(
            self.header(owner).map(|h| h.generation),
            Some(Generation::Old)
        );
        if !owner_old {
            return;
        }
        let child_young = matches!(
            self.header(child).map(|h| h.generation),
            Some(Generation::Young)
        );
        if child_young {
            self.remember(owner);
        }
    }

    /// Barrier for entry-storage growth: rehashing shifts entry indices and
    /// may copy young references around, so an old owner is conservatively
    /// remembered.
    pub fn barrier_rehash(&mut self, owner: Handle) {
        let owner_old = matches!(
            self.header(owner).map(|h| h.generation),
            Some(Generation::Old)
        );
        if owner_old {
            self.remember(owner);
        }
    }

    pub(crate) fn remember(&mut self, owner: Handle) {
        if let Some(header) = self.header_mut(owner) {
            if !header.remembered {
                header.remembered = true;
                self.remembered.push(owner);
            }
        }
    }

    /// Appends to an array, maintaining barrier and byte accounting.
    pub fn array_push(&mut self, array: Handle, value: Value) -> VmResult<()> {
        self.barrier(array, value);
        match self.get_mut(array) {
            Some(Object::Array(a)) => a.items.push(value),
            other => {
                return Err(VmError::internal(format!(
                    "ARRAY_APPEND on {}",
                    other.map_or("freed object", |o| o.kind_name())
                )))
            }
        }
        self.refresh_size(array);
        Ok(())
    }

    /// Overwrites one array element, maintaining the barrier. The caller
    /// has already bounds-checked `index`.
    pub fn array_set(&mut self, array: Handle, index: usize, value: Value) -> VmResult<()> {
        self.barrier(array, value);
        match self.get_mut(array) {
            Some(Object::Array(a)) if index < a.items.len() => {
                a.items[index] = value;
                Ok(())
            }
            Some(Object::Array(a)) => Err(VmError::bounds(index as i64, a.items.len())),
            other => Err(VmError::internal(format!(
                "array store on {}",
                other.map_or("freed object", |o| o.kind_name())
            ))),
        }
    }

    /// Stores `key -> value` into a map object. Returns the entry index the
    /// value lives at.
    pub fn map_insert(&mut self, map: Handle, key: Handle, value: Value) -> VmResult<u32> {
        self.barrier(map, Value::Obj(key));
        self.barrier(map, value);
        let (idx, fresh) = match self.get_mut(map) {
            Some(Object::Map(m)) => m.entries.insert(key, value),
            other => {
                return Err(VmError::internal(format!(
                    "map insert on {}",
                    other.map_or("freed object", |o| o.kind_name())
                )))
            }
        };
        if fresh {
            self.barrier_rehash(map);
            self.refresh_size(map);
        }
        Ok(idx)
    }

    /// Stores a field on an instance. Returns the entry index.
    pub fn instance_set(&mut self, instance: Handle, key: Handle, value: Value) -> VmResult<u32> {
        self.barrier(instance, Value::Obj(key));
        self.barrier(instance, value);
        let (idx, fresh) = match self.get_mut(instance) {
            Some(Object::Instance(i)) => i.fields.insert(key, value),
            other => {
                return Err(VmError::internal(format!(
                    "field store on {}",
                    other.map_or("freed object", |o| o.kind_name())
                )))
            }
        };
        if fresh {
            self.barrier_rehash(instance);
            self.refresh_size(instance);
        }
        Ok(idx)
    }

    /// Recomputes a mutated object's byte footprint and folds the delta
    /// into its generation's counter.
    pub(crate) fn refresh_size(&mut self, handle: Handle) {
        let Some((header, object)) = self.cell_mut(handle) else {
            return;
        };
        let new_size = object.byte_size();
        let old_size = header.size;
        header.size = new_size;
        let generation = header.generation;
        match generation {
            Generation::Young => {
                self.young_bytes = (self.young_bytes + new_size).saturating_sub(old_size);
            }
            Generation::Old => {
                self.old_bytes = (self.old_bytes + new_size).saturating_sub(old_size);
            }
        }
    }

    // === Environments ===

    /// Defines (or redefines) a binding in `env` itself.
    pub fn env_define(&mut self, env: Handle, name: Handle, value: Value, mutable: bool) {
        self.barrier(env, Value::Obj(name));
        self.barrier(env, value);
        let fresh = match self.get_mut(env) {
            Some(Object::Env(e)) => e.bindings.insert(name, Binding { value, mutable }).1,
            _ => return,
        };
        if fresh {
            self.barrier_rehash(env);
            self.refresh_size(env);
        }
    }

    /// Reads a binding, walking the environment chain.
    pub fn env_get(&self, env: Handle, name: Handle) -> Option<Value> {
        let mut current = Some(env);
        while let Some(handle) = current {
            match self.get(handle)? {
                Object::Env(e) => {
                    if let Some(binding) = e.bindings.get(name) {
                        return Some(binding.value);
                    }
                    current = e.parent;
                }
                _ => return None,
            }
        }
        None
    }

    /// Assigns to an existing binding, walking the environment chain and
    /// honouring `const`.
    pub fn env_assign(&mut self, env: Handle, name: Handle, value: Value) -> AssignOutcome {
        let mut current = Some(env);
        while let Some(handle) = current {
            let parent = match self.get(handle) {
                Some(Object::Env(e)) => {
                    if let Some(binding) = e.bindings.get(name) {
                        if !binding.mutable {
                            return AssignOutcome::Immutable;
                        }
                        self.barrier(handle, value);
                        if let Some(Object::Env(e)) = self.get_mut(handle) {
                            if let Some(binding) = e.bindings.get_mut(name) {
                                binding.value = value;
                            }
                        }
                        return AssignOutcome::Assigned;
                    }
                    e.parent
                }
                _ => return AssignOutcome::Undefined,
            };
            current = parent;
        }
        AssignOutcome::Undefined
    }

    // === Statistics and scheduling ===

    /// Total live heap bytes across both generations.
    pub fn bytes_total(&self) -> usize {
        self.young_bytes + self.old_bytes
    }

    /// Count of live objects, for tests and logging.
    pub fn object_count(&self) -> usize {
        self.young.len() + self.old.len()
    }

    /// True when the interner currently holds `text`.
    pub fn is_interned(&self, text: &str) -> bool {
        self.strings.contains_key(text)
    }

    /// Frees one object: bumps the slot epoch, returns the slot to the free
    /// list and unregisters interned strings. The caller maintains the
    /// generation lists and byte counters.
    pub(crate) fn free_object(&mut self, handle: Handle) -> usize {
        let slot = &mut self.slots[handle.slot as usize];
        debug_assert_eq!(slot.epoch, handle.epoch, "double free through stale handle");
        let Some((header, object)) = slot.cell.take() else {
            return 0;
        };
        slot.epoch = slot.epoch.wrapping_add(1);
        self.free.push(handle.slot);
        if let Object::Str(s) = &object {
            // Only drop the table entry if it still points at this object;
            // the content may have been re-interned mid-sweep
            if self.strings.get(&*s.chars) == Some(&handle) {
                self.strings.remove(&*s.chars);
            }
        }
        header.size
    }

    // === Rendering ===

    /// Renders a value the way `STRINGIFY` and the diagnostics do.
    pub fn stringify(&self, value: Value) -> String {
        let mut out = String::new();
        self.render(value, STRINGIFY_DEPTH, false, &mut out);
        out
    }

    fn render(&self, value: Value, depth: u32, quote_strings: bool, out: &mut String) {
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
            Value::Number(n) => out.push_str(&format_number(n)),
            Value::Obj(handle) => self.render_obj(handle, depth, quote_strings, out),
        }
    }

    fn render_obj(&self, handle: Handle, depth: u32, quote_strings: bool, out: &mut String) {
        if depth == 0 {
            out.push_str("...");
            return;
        }
        match self.get(handle) {
            None => out.push_str("<freed>"),
            Some(Object::Str(s)) => {
                if quote_strings {
                    out.push('"');
                    out.push_str(&s.chars);
                    out.push('"');
                } else {
                    out.push_str(&s.chars);
                }
            }
            Some(Object::Array(a)) => {
                out.push('[');
                for (i, item) in a.items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render(*item, depth - 1, true, out);
                }
                out.push(']');
            }
            Some(Object::Map(m)) => {
                out.push('{');
                for (i, (key, val)) in m.entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(self.str_value(key).unwrap_or("?"));
                    out.push_str(": ");
                    self.render(*val, depth - 1, true, out);
                }
                out.push('}');
            }
            Some(Object::Function(f)) => {
                let name = f
                    .name
                    .and_then(|n| self.str_value(n))
                    .unwrap_or("anonymous");
                out.push_str("<fun ");
                out.push_str(name);
                out.push('>');
            }
            Some(Object::Native(n)) => {
                out.push_str("<native ");
                out.push_str(&n.name);
                out.push('>');
            }
            Some(Object::EnumCtor(e)) => {
                out.push('<');
                out.push_str(self.str_value(e.enum_name).unwrap_or("?"));
                out.push('.');
                out.push_str(self.str_value(e.variant).unwrap_or("?"));
                out.push('>');
            }
            Some(Object::Class(c)) => {
                out.push_str("<class ");
                out.push_str(self.str_value(c.name).unwrap_or("?"));
                out.push('>');
            }
            Some(Object::Instance(i)) => match i.class {
                Some(class) => {
                    let name = match self.get(class) {
                        Some(Object::Class(c)) => self.str_value(c.name).unwrap_or("?"),
                        _ => "?",
                    };
                    out.push('<');
                    out.push_str(name);
                    out.push_str(" instance>");
                }
                None => {
                    out.push('{');
                    for (idx, (key, val)) in i.fields.iter().enumerate() {
                        if idx > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(self.str_value(key).unwrap_or("?"));
                        out.push_str(": ");
                        self.render(*val, depth - 1, true, out);
                    }
                    out.push('}');
                }
            },
            Some(Object::BoundMethod(b)) => {
                let name = match self.get(b.method) {
                    Some(Object::Function(f)) => {
                        f.name.and_then(|n| self.str_value(n)).unwrap_or("anonymous")
                    }
                    _ => "?",
                };
                out.push_str("<bound ");
                out.push_str(name);
                out.push('>');
            }
            Some(Object::Env(_)) => out.push_str("<environment>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(GcTuning::default())
    }

    #[test]
    fn test_interning_returns_same_handle() {
        let mut h = heap();
        let a = h.intern("hello");
        let b = h.intern("hello");
        let c = h.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(h.str_value(a), Some("hello"));
    }

    #[test]
    fn test_stale_handle_misses() {
        let mut h = heap();
        let s = h.intern("gone");
        h.free_object(s);
        assert!(h.get(s).is_none());
        assert!(!h.is_interned("gone"));
        // The slot is reusable; the old handle still misses
        let t = h.intern("new");
        assert!(h.get(s).is_none());
        assert_eq!(h.str_value(t), Some("new"));
    }

    #[test]
    fn test_env_chain_lookup_and_shadowing() {
        let mut h = heap();
        let name = h.intern("x");
        let root = h.new_env(None);
        let child = h.new_env(Some(root));

        h.env_define(root, name, Value::Number(1.0), true);
        assert_eq!(h.env_get(child, name), Some(Value::Number(1.0)));

        h.env_define(child, name, Value::Number(2.0), true);
        assert_eq!(h.env_get(child, name), Some(Value::Number(2.0)));
        assert_eq!(h.env_get(root, name), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_env_assign_honours_const() {
        let mut h = heap();
        let name = h.intern("k");
        let env = h.new_env(None);
        h.env_define(env, name, Value::Number(1.0), false);
        assert_eq!(
            h.env_assign(env, name, Value::Number(2.0)),
            AssignOutcome::Immutable
        );
        let missing = h.intern("missing");
        assert_eq!(
            h.env_assign(env, missing, Value::Null),
            AssignOutcome::Undefined
        );
    }

    #[test]
    fn test_allocation_raises_pending_flags() {
        let mut h = Heap::new(GcTuning {
            min_young_bytes: 64,
            ..GcTuning::default()
        });
        h.young_next = 64;
        h.intern("some string that is long enough to cross the threshold");
        assert!(h.minor_pending);
    }

    #[test]
    fn test_stringify_shapes() {
        let mut h = heap();
        let arr = h.new_array(2);
        h.array_push(arr, Value::Number(1.0)).unwrap();
        let s = h.intern("two");
        h.array_push(arr, Value::Obj(s)).unwrap();
        assert_eq!(h.stringify(Value::Obj(arr)), "[1, \"two\"]");

        let map = h.new_map(1);
        let key = h.intern("k");
        h.map_insert(map, key, Value::Bool(true)).unwrap();
        assert_eq!(h.stringify(Value::Obj(map)), "{k: true}");
        assert_eq!(h.stringify(Value::Obj(s)), "two");
    }
}

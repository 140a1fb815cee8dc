//! Property and index operations for the Erkao VM.
//!
//! Every site carries one inline-cache slot keyed on the shape it last
//! observed: instance field (owner, key, entry index), class method, or
//! map entry. Hits are revalidated by identity — strings are interned and
//! handles carry epochs — so a mutated, rehashed or collected shape misses
//! and the slot refills from the slow path.

use crate::chunk::CacheSlot;
use crate::error::{VmError, VmResult};
use crate::heap::Handle;
use crate::object::{ObjBoundMethod, Object};
use crate::value::Value;

use super::Vm;

enum Lookup {
    Field(Value, u32),
    MapValue(Value, u32),
    MapMissing,
    Method(Handle, Handle),
    MissingInstance,
    MissingModule,
    WrongKind,
}

impl Vm {
    pub(crate) fn op_get_property(&mut self, optional: bool) -> VmResult<()> {
        let name = self.read_name()?;
        let op_start = self.frame().last_op;
        let receiver = self.pop()?;
        if optional && receiver == Value::Null {
            self.push(Value::Null);
            return Ok(());
        }
        let Some(handle) = receiver.as_obj() else {
            return Err(VmError::type_error(format!(
                "only instances and maps have properties, got {}",
                self.kind_of(receiver)
            )));
        };

        // Fast path: the shape observed last time
        match self.frame().chunk.cache_at(op_start) {
            CacheSlot::Field { owner, key, index } if owner == handle && key == name => {
                if let Some(Object::Instance(i)) = self.heap.get(handle) {
                    if i.fields.key_at(index) == Some(name) {
                        if let Some(value) = i.fields.value_at(index).copied() {
                            self.push(value);
                            return Ok(());
                        }
                    }
                }
            }
            CacheSlot::MapEntry { map, key, index } if map == handle && key == name => {
                if let Some(Object::Map(m)) = self.heap.get(handle) {
                    if m.entries.key_at(index) == Some(name) {
                        if let Some(value) = m.entries.value_at(index).copied() {
                            self.push(value);
                            return Ok(());
                        }
                    }
                }
            }
            CacheSlot::Method {
                class,
                key,
                function,
            } if key == name => {
                if let Some(Object::Instance(i)) = self.heap.get(handle) {
                    if i.class == Some(class)
                        && i.fields.get(name).is_none()
                        && self.heap.get(function).is_some()
                    {
                        let bound = self.heap.alloc(Object::BoundMethod(ObjBoundMethod {
                            receiver,
                            method: function,
                        }));
                        self.push(Value::Obj(bound));
                        return Ok(());
                    }
                }
            }
            _ => {}
        }

        let lookup = match self.heap.get(handle) {
            Some(Object::Instance(i)) => {
                if let Some((value, idx)) = i
                    .fields
                    .index_of(name)
                    .and_then(|idx| i.fields.value_at(idx).map(|v| (*v, idx)))
                {
                    Lookup::Field(value, idx)
                } else if let Some(class) = i.class {
                    let method = match self.heap.get(class) {
                        Some(Object::Class(c)) => {
                            c.methods.get(name).copied().and_then(Value::as_obj)
                        }
                        _ => None,
                    };
                    match method {
                        Some(function) => Lookup::Method(class, function),
                        None => Lookup::MissingInstance,
                    }
                } else {
                    Lookup::MissingModule
                }
            }
            Some(Object::Map(m)) => match m
                .entries
                .index_of(name)
                .and_then(|idx| m.entries.value_at(idx).map(|v| (*v, idx)))
            {
                Some((value, idx)) => Lookup::MapValue(value, idx),
                None => Lookup::MapMissing,
            },
            _ => Lookup::WrongKind,
        };

        match lookup {
            Lookup::Field(value, index) => {
                self.frame().chunk.set_cache(
                    op_start,
                    CacheSlot::Field {
                        owner: handle,
                        key: name,
                        index,
                    },
                );
                self.push(value);
                Ok(())
            }
            Lookup::MapValue(value, index) => {
                self.frame().chunk.set_cache(
                    op_start,
                    CacheSlot::MapEntry {
                        map: handle,
                        key: name,
                        index,
                    },
                );
                self.push(value);
                Ok(())
            }
            Lookup::Method(class, function) => {
                self.frame().chunk.set_cache(
                    op_start,
                    CacheSlot::Method {
                        class,
                        key: name,
                        function,
                    },
                );
                let bound = self.heap.alloc(Object::BoundMethod(ObjBoundMethod {
                    receiver,
                    method: function,
                }));
                self.push(Value::Obj(bound));
                Ok(())
            }
            // Reading an absent map key yields null, so flexible records
            // (errors, enum variants) degrade gracefully
            Lookup::MapMissing => {
                self.push(Value::Null);
                Ok(())
            }
            Lookup::MissingInstance => Err(VmError::name(format!(
                "undefined property '{}'",
                self.name_text(name)
            ))),
            Lookup::MissingModule => Err(VmError::name(format!(
                "module has no export '{}'",
                self.name_text(name)
            ))),
            Lookup::WrongKind => Err(VmError::type_error(format!(
                "only instances and maps have properties, got {}",
                self.kind_of(receiver)
            ))),
        }
    }

    pub(crate) fn op_set_property(&mut self) -> VmResult<()> {
        let name = self.read_name()?;
        let op_start = self.frame().last_op;
        let value = self.pop()?;
        let receiver = self.pop()?;
        let Some(handle) = receiver.as_obj() else {
            return Err(VmError::type_error(format!(
                "only instances and maps have properties, got {}",
                self.kind_of(receiver)
            )));
        };

        let slot = match self.heap.get(handle) {
            Some(Object::Instance(_)) => {
                let index = self.heap.instance_set(handle, name, value)?;
                CacheSlot::Field {
                    owner: handle,
                    key: name,
                    index,
                }
            }
            Some(Object::Map(_)) => {
                let index = self.heap.map_insert(handle, name, value)?;
                CacheSlot::MapEntry {
                    map: handle,
                    key: name,
                    index,
                }
            }
            _ => {
                return Err(VmError::type_error(format!(
                    "only instances and maps have properties, got {}",
                    self.kind_of(receiver)
                )))
            }
        };
        self.frame().chunk.set_cache(op_start, slot);
        self.push(value);
        Ok(())
    }

    pub(crate) fn op_get_index(&mut self, optional: bool) -> VmResult<()> {
        let op_start = self.frame().last_op;
        let index = self.pop()?;
        let receiver = self.pop()?;
        if optional && receiver == Value::Null {
            self.push(Value::Null);
            return Ok(());
        }
        let Some(handle) = receiver.as_obj() else {
            return Err(VmError::type_error(format!(
                "cannot index {}",
                self.kind_of(receiver)
            )));
        };

        // Map-keyed sites cache their entry like property reads do
        if let Some(key) = index.as_obj() {
            if let CacheSlot::MapEntry {
                map,
                key: cached_key,
                index: entry,
            } = self.frame().chunk.cache_at(op_start)
            {
                if map == handle && cached_key == key {
                    if let Some(Object::Map(m)) = self.heap.get(handle) {
                        if m.entries.key_at(entry) == Some(key) {
                            if let Some(value) = m.entries.value_at(entry).copied() {
                                self.push(value);
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        enum Indexed {
            Value(Value),
            MapHit(Value, u32, Handle),
            Char(String),
        }

        let outcome = match self.heap.get(handle) {
            Some(Object::Array(a)) => {
                let i = self.integer_index(index, "array index")?;
                if i < 0 || i as usize >= a.items.len() {
                    return Err(VmError::bounds(i, a.items.len()));
                }
                Indexed::Value(a.items[i as usize])
            }
            Some(Object::Str(s)) => {
                let i = self.integer_index(index, "string index")?;
                let len = s.chars.chars().count();
                if i < 0 || i as usize >= len {
                    return Err(VmError::bounds(i, len));
                }
                let ch = s.chars.chars().nth(i as usize).unwrap_or('\0');
                Indexed::Char(ch.to_string())
            }
            Some(Object::Map(m)) => {
                if let Some(key) = index.as_obj().filter(|h| self.heap.str_value(*h).is_some()) {
                    match m
                        .entries
                        .index_of(key)
                        .and_then(|idx| m.entries.value_at(idx).map(|v| (*v, idx)))
                    {
                        Some((value, idx)) => Indexed::MapHit(value, idx, key),
                        None => Indexed::Value(Value::Null),
                    }
                } else if index.as_number().is_some() {
                    // Numeric indexing walks keys in insertion order; this
                    // is what foreach iterates with
                    let i = self.integer_index(index, "map position")?;
                    if i < 0 || i as usize >= m.entries.len() {
                        return Err(VmError::bounds(i, m.entries.len()));
                    }
                    match m.entries.nth_key(i as usize) {
                        Some(key) => Indexed::Value(Value::Obj(key)),
                        None => return Err(VmError::bounds(i, m.entries.len())),
                    }
                } else {
                    return Err(VmError::type_error(format!(
                        "map index must be a string or a position, got {}",
                        self.kind_of(index)
                    )));
                }
            }
            _ => {
                return Err(VmError::type_error(format!(
                    "cannot index {}",
                    self.kind_of(receiver)
                )))
            }
        };

        match outcome {
            Indexed::Value(value) => self.push(value),
            Indexed::MapHit(value, entry, key) => {
                self.frame().chunk.set_cache(
                    op_start,
                    CacheSlot::MapEntry {
                        map: handle,
                        key,
                        index: entry,
                    },
                );
                self.push(value);
            }
            Indexed::Char(text) => {
                let interned = self.heap.intern(&text);
                self.push(Value::Obj(interned));
            }
        }
        Ok(())
    }

    pub(crate) fn op_set_index(&mut self) -> VmResult<()> {
        let op_start = self.frame().last_op;
        let value = self.pop()?;
        let index = self.pop()?;
        let receiver = self.pop()?;
        let Some(handle) = receiver.as_obj() else {
            return Err(VmError::type_error(format!(
                "cannot index {}",
                self.kind_of(receiver)
            )));
        };

        enum Kind {
            Array(usize),
            Map,
            Other,
        }

        let kind = match self.heap.get(handle) {
            Some(Object::Array(a)) => Kind::Array(a.items.len()),
            Some(Object::Map(_)) => Kind::Map,
            _ => Kind::Other,
        };

        match kind {
            Kind::Array(len) => {
                let i = self.integer_index(index, "array index")?;
                if i < 0 || i as usize >= len {
                    return Err(VmError::bounds(i, len));
                }
                self.heap.array_set(handle, i as usize, value)?;
            }
            Kind::Map => {
                let key = self.expect_string_key(index, "map key")?;
                let entry = self.heap.map_insert(handle, key, value)?;
                self.frame().chunk.set_cache(
                    op_start,
                    CacheSlot::MapEntry {
                        map: handle,
                        key,
                        index: entry,
                    },
                );
            }
            Kind::Other => {
                return Err(VmError::type_error(format!(
                    "cannot index {}",
                    self.kind_of(receiver)
                )))
            }
        }
        self.push(value);
        Ok(())
    }

    fn integer_index(&self, value: Value, what: &str) -> VmResult<i64> {
        let Some(n) = value.as_number() else {
            return Err(VmError::type_error(format!(
                "{what} must be a number, got {}",
                self.kind_of(value)
            )));
        };
        if n.fract() != 0.0 || !n.is_finite() {
            return Err(VmError::type_error(format!("{what} must be an integer")));
        }
        Ok(n as i64)
    }
}

//! Call semantics for the Erkao VM.
//!
//! The calling convention: `CALL` finds the callee below its arguments, the
//! new frame's slot zero is the callee and slots 1..argc are the arguments.
//! Missing arguments arrive as `null` and the function's own prologue
//! applies defaults, so the convention never evaluates default expressions.
//! Classes construct instances (running `init` when present), enum
//! constructors build variant values, bound methods re-enter with their
//! receiver, and natives run to completion on the VM thread.

use std::rc::Rc;

use crate::chunk::CacheSlot;
use crate::error::{VmError, VmResult};
use crate::heap::Handle;
use crate::object::{NativeFn, ObjArray, ObjFunction, Object};
use crate::value::Value;

use super::{CallFrame, Vm};

/// Callee shape, copied out of the heap before dispatching so the borrow
/// does not outlive the call setup.
enum Callee {
    Function(Handle),
    Native {
        handle: Handle,
        arity: i32,
        function: NativeFn,
    },
    Class(Handle),
    EnumCtor {
        enum_name: Handle,
        variant: Handle,
        arity: usize,
    },
    Bound {
        receiver: Value,
        method: Handle,
    },
}

impl Vm {
    /// Stamps a closure out of a template over `env`.
    pub(crate) fn instantiate_closure(&mut self, template: Handle, env: Handle) -> VmResult<Handle> {
        let cloned = match self.heap.get(template) {
            Some(Object::Function(f)) => ObjFunction {
                name: f.name,
                params: f.params.clone(),
                arity: f.arity,
                min_arity: f.min_arity,
                is_initializer: f.is_initializer,
                chunk: Rc::clone(&f.chunk),
                env: Some(env),
                program: Rc::clone(&f.program),
            },
            _ => return Err(VmError::internal("CLOSURE over a non-function")),
        };
        Ok(self.heap.alloc(Object::Function(cloned)))
    }

    /// Dispatches a call with `argc` arguments on the stack above the
    /// callee. `optional` short-circuits a `null` callee to `null`.
    pub(crate) fn call_dispatch(&mut self, argc: usize, optional: bool) -> VmResult<()> {
        let callee = self.peek(argc)?;
        if optional && callee == Value::Null {
            self.stack.truncate(self.stack.len() - argc - 1);
            self.push(Value::Null);
            return Ok(());
        }

        let shape = self.callee_shape(callee)?;
        match shape {
            Callee::Function(function) => self.call_function(function, argc, None),
            Callee::Native {
                handle,
                arity,
                function,
            } => self.call_native(handle, arity, function, argc),
            Callee::Class(class) => self.call_class(class, argc),
            Callee::EnumCtor {
                enum_name,
                variant,
                arity,
            } => self.call_enum_ctor(enum_name, variant, arity, argc),
            Callee::Bound { receiver, method } => {
                self.call_function(method, argc, Some(receiver))
            }
        }
    }

    fn callee_shape(&self, callee: Value) -> VmResult<Callee> {
        let Some(handle) = callee.as_obj() else {
            return Err(VmError::type_error(format!(
                "can only call functions and classes, got {}",
                self.kind_of(callee)
            )));
        };
        match self.heap.get(handle) {
            Some(Object::Function(_)) => Ok(Callee::Function(handle)),
            Some(Object::Native(n)) => Ok(Callee::Native {
                handle,
                arity: n.arity,
                function: n.function,
            }),
            Some(Object::Class(_)) => Ok(Callee::Class(handle)),
            Some(Object::EnumCtor(e)) => Ok(Callee::EnumCtor {
                enum_name: e.enum_name,
                variant: e.variant,
                arity: e.arity,
            }),
            Some(Object::BoundMethod(b)) => Ok(Callee::Bound {
                receiver: b.receiver,
                method: b.method,
            }),
            _ => Err(VmError::type_error(format!(
                "can only call functions and classes, got {}",
                self.kind_of(callee)
            ))),
        }
    }

    /// Pushes a frame for a script function and switches into its call
    /// environment.
    pub(crate) fn call_function(
        &mut self,
        function: Handle,
        argc: usize,
        receiver: Option<Value>,
    ) -> VmResult<()> {
        let (arity, min_arity, is_initializer, params, env_parent, chunk, program, name) =
            match self.heap.get(function) {
                Some(Object::Function(f)) => (
                    f.arity,
                    f.min_arity,
                    f.is_initializer,
                    f.params.clone(),
                    f.env,
                    Rc::clone(&f.chunk),
                    Rc::clone(&f.program),
                    f.name,
                ),
                _ => return Err(VmError::internal("call target is not a function")),
            };

        if argc < min_arity || argc > arity {
            let display = name
                .and_then(|n| self.heap.str_value(n))
                .unwrap_or("anonymous")
                .to_string();
            let expected = if min_arity == arity {
                format!("'{display}' expects {arity} arguments")
            } else {
                format!("'{display}' expects between {min_arity} and {arity} arguments")
            };
            return Err(VmError::arity(expected, argc));
        }
        if self.frames.len() >= self.limits.max_invocation_frames {
            return Err(VmError::CallDepthExceeded {
                depth: self.frames.len(),
                limit: self.limits.max_invocation_frames,
            });
        }

        let parent = env_parent.unwrap_or(self.globals);
        let call_env = self.heap.new_env(Some(parent));
        let base = self.stack.len() - argc - 1;
        for (i, param) in params.iter().enumerate() {
            let value = if i < argc {
                self.stack[base + 1 + i]
            } else {
                Value::Null
            };
            self.heap.env_define(call_env, *param, value, true);
        }
        if let Some(receiver) = receiver {
            self.heap.env_define(call_env, self.syms.this, receiver, false);
        }

        self.frames.push(CallFrame {
            function,
            chunk,
            ip: 0,
            last_op: 0,
            base,
            prev_env: self.env,
            prev_program: self.current_program.take(),
            program: Rc::clone(&program),
            receiver,
            arg_count: argc,
            is_initializer,
            module: None,
        });
        self.env = call_env;
        self.current_program = Some(program);
        Ok(())
    }

    /// Runs a native to completion. The arguments stay on the VM stack for
    /// the duration of the call, so they remain GC roots while the native
    /// reenters the interpreter.
    fn call_native(
        &mut self,
        handle: Handle,
        arity: i32,
        function: NativeFn,
        argc: usize,
    ) -> VmResult<()> {
        if arity >= 0 && argc != arity as usize {
            let display = match self.heap.get(handle) {
                Some(Object::Native(n)) => n.name.clone(),
                _ => "native".to_string(),
            };
            return Err(VmError::arity(
                format!("'{display}' expects {arity} arguments"),
                argc,
            ));
        }
        let args: Vec<Value> = self.stack[self.stack.len() - argc..].to_vec();
        let result = function(self, &args)?;
        self.stack.truncate(self.stack.len() - argc - 1);
        self.push(result);
        Ok(())
    }

    /// A class used as a callee constructs an instance; `init`, when
    /// present, runs with the instance as receiver and the frame returns
    /// the receiver.
    fn call_class(&mut self, class: Handle, argc: usize) -> VmResult<()> {
        let init = match self.heap.get(class) {
            Some(Object::Class(c)) => c.methods.get(self.syms.init).copied(),
            _ => return Err(VmError::internal("constructor target is not a class")),
        };
        let instance = self.heap.new_instance(Some(class));

        match init.and_then(Value::as_obj) {
            Some(init_fn) => self.call_function(init_fn, argc, Some(Value::Obj(instance))),
            None => {
                if argc != 0 {
                    let name = match self.heap.get(class) {
                        Some(Object::Class(c)) => self.name_text(c.name),
                        _ => "class".to_string(),
                    };
                    return Err(VmError::arity(
                        format!("'{name}' has no 'init' and expects 0 arguments"),
                        argc,
                    ));
                }
                self.pop()?;
                self.push(Value::Obj(instance));
                Ok(())
            }
        }
    }

    /// Builds the map-shaped variant value `{_enum, _tag, _values}`.
    fn call_enum_ctor(
        &mut self,
        enum_name: Handle,
        variant: Handle,
        arity: usize,
        argc: usize,
    ) -> VmResult<()> {
        if argc != arity {
            let expected = format!(
                "'{}.{}' expects {arity} arguments",
                self.name_text(enum_name),
                self.name_text(variant)
            );
            return Err(VmError::arity(expected, argc));
        }
        let items: Vec<Value> = self.stack[self.stack.len() - argc..].to_vec();
        let values = self.heap.alloc(Object::Array(ObjArray { items }));
        let map = self.heap.new_map(3);
        self.heap
            .map_insert(map, self.syms.enum_tag, Value::Obj(enum_name))?;
        self.heap
            .map_insert(map, self.syms.variant_tag, Value::Obj(variant))?;
        self.heap
            .map_insert(map, self.syms.values, Value::Obj(values))?;
        self.stack.truncate(self.stack.len() - argc - 1);
        self.push(Value::Obj(map));
        Ok(())
    }

    /// `INVOKE name argc`: fused property load and call, with a
    /// method-shape inline cache.
    pub(crate) fn op_invoke(&mut self) -> VmResult<()> {
        let name = self.read_name()?;
        let argc = self.read_byte() as usize;
        let op_start = self.frame().last_op;
        let receiver = self.peek(argc)?;
        let Some(recv_handle) = receiver.as_obj() else {
            return Err(VmError::type_error(format!(
                "only instances and maps have methods, got {}",
                self.kind_of(receiver)
            )));
        };

        // Cache probe: class identity plus absence of a shadowing field
        if let CacheSlot::Method {
            class,
            key,
            function,
        } = self.frame().chunk.cache_at(op_start)
        {
            if key == name {
                if let Some(Object::Instance(i)) = self.heap.get(recv_handle) {
                    if i.class == Some(class)
                        && i.fields.get(name).is_none()
                        && self.heap.get(function).is_some()
                    {
                        return self.call_function(function, argc, Some(receiver));
                    }
                }
            }
        }

        enum Target {
            CallableValue(Value),
            Method { class: Handle, function: Handle },
        }

        let target = match self.heap.get(recv_handle) {
            Some(Object::Instance(i)) => {
                if let Some(value) = i.fields.get(name).copied() {
                    Target::CallableValue(value)
                } else if let Some(class) = i.class {
                    let method = match self.heap.get(class) {
                        Some(Object::Class(c)) => c.methods.get(name).copied(),
                        _ => None,
                    };
                    match method.and_then(Value::as_obj) {
                        Some(function) => Target::Method { class, function },
                        None => {
                            return Err(VmError::name(format!(
                                "undefined property '{}'",
                                self.name_text(name)
                            )))
                        }
                    }
                } else {
                    return Err(VmError::name(format!(
                        "module has no export '{}'",
                        self.name_text(name)
                    )));
                }
            }
            Some(Object::Map(m)) => Target::CallableValue(
                m.entries.get(name).copied().unwrap_or(Value::Null),
            ),
            _ => {
                return Err(VmError::type_error(format!(
                    "only instances and maps have methods, got {}",
                    self.kind_of(receiver)
                )))
            }
        };

        match target {
            Target::Method { class, function } => {
                self.frame().chunk.set_cache(
                    op_start,
                    CacheSlot::Method {
                        class,
                        key: name,
                        function,
                    },
                );
                self.call_function(function, argc, Some(receiver))
            }
            Target::CallableValue(Value::Null) => Err(VmError::type_error(format!(
                "'{}' is null and not callable",
                self.name_text(name)
            ))),
            Target::CallableValue(value) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = value;
                self.call_dispatch(argc, false)
            }
        }
    }

    /// Completes the current frame: truncates the stack to the frame base,
    /// restores environment and program, and pushes the result (module
    /// frames finish their import instead).
    pub(crate) fn do_return(&mut self, result: Value) -> VmResult<()> {
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => return Err(VmError::internal("RETURN without a frame")),
        };
        // Handlers registered by the finished frame are dead
        while matches!(self.tries.last(), Some(t) if t.frame_index >= self.frames.len()) {
            self.tries.pop();
        }

        self.stack.truncate(frame.base);
        self.env = frame.prev_env;
        self.current_program = frame.prev_program.clone();

        let result = if frame.is_initializer {
            frame.receiver.unwrap_or(result)
        } else {
            result
        };

        match frame.module {
            Some(module) => self.finish_module(module),
            None => {
                self.push(result);
                Ok(())
            }
        }
    }

    /// Reentry entry point for natives calling back into script code.
    ///
    /// Snapshots the frame count, stack depth, environment, current program
    /// and try depth; restores them if the nested execution fails, so a
    /// failing callback cannot corrupt the outer interpreter state.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        let base_frames = self.frames.len();
        let base_stack = self.stack.len();
        let base_tries = self.tries.len();
        let saved_env = self.env;
        let saved_program = self.current_program.clone();

        self.push(callee);
        for arg in args {
            self.push(*arg);
        }

        let outcome = self
            .call_dispatch(args.len(), false)
            .and_then(|()| {
                if self.frames.len() > base_frames {
                    self.run_until(base_frames)
                } else {
                    Ok(())
                }
            })
            .and_then(|()| self.pop());

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                self.frames.truncate(base_frames);
                self.stack.truncate(base_stack);
                self.tries.truncate(base_tries);
                self.env = saved_env;
                self.current_program = saved_program;
                Err(err)
            }
        }
    }

    /// Pins a value as a GC root; natives holding fresh allocations across
    /// a reentrant call use this. Pins are released LIFO with
    /// [`Vm::unpin`].
    pub fn pin(&mut self, value: Value) {
        self.pinned.push(value);
    }

    /// Releases the most recent pin.
    pub fn unpin(&mut self) {
        self.pinned.pop();
    }
}

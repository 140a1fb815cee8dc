//! Virtual machine module for the Erkao VM.
//!
//! The dispatch loop, value stack, frame stack and try-frame stack live
//! here; property and call semantics, and module loading, are split across
//! the sibling files by category. The VM is strictly single-threaded and
//! cooperative: the loop is the sole progress point, budgets are checked
//! around every instruction, and the collector only runs at safepoints.

mod calls;
mod frame;
mod modules;
mod props;

use std::io::Write;
use std::rc::Rc;

use hashbrown::HashMap;

pub use frame::{CallFrame, ModuleFrame, TryFrame};

use crate::compiler::{CompileMode, Compiler};
use crate::diagnostics;
use crate::error::{VmError, VmResult};
use crate::heap::{AssignOutcome, Handle, Heap};
use crate::lexer::lex;
use crate::limits::{EngineLimits, GcTuning};
use crate::object::{ObjArray, ObjClass, Object};
use crate::op_code::OpCode;
use crate::map::OrderedMap;
use crate::program::Program;
use crate::resolver::{FsResolver, ModuleResolver};
use crate::value::Value;

/// A module registry entry keyed by resolved path.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ModuleEntry {
    /// The module's record; inserted before its body runs, so self-imports
    /// observe the partially populated instance instead of recursing
    Loaded(Handle),
    /// A previous load attempt failed; importing again is an error
    Failed,
}

/// Pre-interned names the dispatch loop compares against.
pub(crate) struct Symbols {
    pub enum_tag: Handle,
    pub variant_tag: Handle,
    pub values: Handle,
    pub error: Handle,
    pub message: Handle,
    pub value: Handle,
    pub trace: Handle,
    pub this: Handle,
    pub result: Handle,
    pub option: Handle,
    pub ok: Handle,
    pub err: Handle,
    pub some: Handle,
    pub none: Handle,
    pub init: Handle,
}

impl Symbols {
    fn new(heap: &mut Heap) -> Self {
        Self {
            init: heap.intern("init"),
            enum_tag: heap.intern("_enum"),
            variant_tag: heap.intern("_tag"),
            values: heap.intern("_values"),
            error: heap.intern("_error"),
            message: heap.intern("message"),
            value: heap.intern("value"),
            trace: heap.intern("trace"),
            this: heap.intern("this"),
            result: heap.intern("Result"),
            option: heap.intern("Option"),
            ok: heap.intern("Ok"),
            err: heap.intern("Err"),
            some: heap.intern("Some"),
            none: heap.intern("None"),
        }
    }

    fn roots(&self, out: &mut Vec<Value>) {
        for handle in [
            self.enum_tag,
            self.variant_tag,
            self.values,
            self.error,
            self.message,
            self.value,
            self.trace,
            self.this,
            self.result,
            self.option,
            self.ok,
            self.err,
            self.some,
            self.none,
            self.init,
        ] {
            out.push(Value::Obj(handle));
        }
    }
}

/// The Erkao virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) tries: Vec<TryFrame>,
    /// Current environment register
    pub(crate) env: Handle,
    pub(crate) globals: Handle,
    pub(crate) modules: HashMap<String, ModuleEntry>,
    pub(crate) resolver: Box<dyn ModuleResolver>,
    pub(crate) limits: EngineLimits,
    pub(crate) instructions: u64,
    pub(crate) current_program: Option<Rc<Program>>,
    pub(crate) args_array: Option<Handle>,
    /// The most recent completed result, pinned as a GC root so values
    /// returned to the embedder stay live
    pub(crate) last_value: Value,
    /// Values pinned by natives across reentrant calls
    pub(crate) pinned: Vec<Value>,
    pub(crate) syms: Symbols,
    pub(crate) had_error: bool,
    diag: Box<dyn Write>,
}

impl Vm {
    /// Creates a VM with default limits, GC tuning and the filesystem
    /// module resolver.
    pub fn new() -> Self {
        Self::with_config(EngineLimits::default(), GcTuning::default(), Box::new(FsResolver))
    }

    /// Creates a VM with explicit configuration.
    pub fn with_config(
        limits: EngineLimits,
        tuning: GcTuning,
        resolver: Box<dyn ModuleResolver>,
    ) -> Self {
        let mut heap = Heap::new(tuning);
        let globals = heap.new_env(None);
        let syms = Symbols::new(&mut heap);
        let mut vm = Self {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            tries: Vec::new(),
            env: globals,
            globals,
            modules: HashMap::new(),
            resolver,
            limits,
            instructions: 0,
            current_program: None,
            args_array: None,
            last_value: Value::Null,
            pinned: Vec::new(),
            syms,
            had_error: false,
            diag: Box::new(std::io::stderr()),
        };
        crate::natives::register_builtins(&mut vm);
        vm
    }

    /// Redirects the diagnostic stream (default: stderr).
    pub fn set_diagnostic_writer(&mut self, writer: Box<dyn Write>) {
        self.diag = writer;
    }

    pub(crate) fn write_diag(&mut self, text: &str) {
        let _ = self.diag.write_all(text.as_bytes());
    }

    /// Publishes the host argument vector as the `args` global.
    pub fn set_args(&mut self, args: &[String]) {
        let handles: Vec<Value> = args
            .iter()
            .map(|a| Value::Obj(self.heap.intern(a)))
            .collect();
        let array = self.heap.alloc(Object::Array(ObjArray { items: handles }));
        self.args_array = Some(array);
        let name = self.heap.intern("args");
        self.heap
            .env_define(self.globals, name, Value::Obj(array), false);
    }

    /// Access to the heap, for embedders inspecting returned values.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Renders a value the way the language prints it.
    pub fn stringify(&self, value: Value) -> String {
        self.heap.stringify(value)
    }

    /// Value-stack depth; zero after a balanced `interpret`.
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Live call-frame count.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Live try-frame count.
    pub fn try_depth(&self) -> usize {
        self.tries.len()
    }

    // === Entry points ===

    /// Compiles and runs a script. Returns `true` on success; all
    /// diagnostics go to the configured writer.
    pub fn interpret(&mut self, path: &str, source: &str) -> bool {
        self.execute(path, source, CompileMode::Script).is_ok()
    }

    /// Compiles and runs a buffer, returning the value of its final
    /// top-level expression statement (or `null`).
    pub fn eval(&mut self, path: &str, source: &str) -> VmResult<Value> {
        self.execute(path, source, CompileMode::Eval)?;
        Ok(self.last_value)
    }

    fn execute(&mut self, path: &str, source: &str, mode: CompileMode) -> VmResult<()> {
        self.had_error = false;
        let program = Program::new(path, source);

        let tokens = match lex(source) {
            Ok(tokens) => tokens,
            Err(diags) => {
                for diagnostic in &diags {
                    let text = diagnostics::render_compile(path, source, diagnostic);
                    self.write_diag(&text);
                }
                self.had_error = true;
                return Err(VmError::type_error("lex error"));
            }
        };

        let template =
            match Compiler::compile(&mut self.heap, Rc::clone(&program), tokens, mode) {
                Ok(template) => template,
                Err(diags) => {
                    for diagnostic in &diags {
                        let text = diagnostics::render_compile(path, source, diagnostic);
                        self.write_diag(&text);
                    }
                    self.had_error = true;
                    return Err(VmError::type_error("compile error"));
                }
            };

        self.run_root(template, program)
    }

    /// Wraps a compiled root template in a frame over the globals and
    /// drives it to completion.
    pub(crate) fn run_root(&mut self, template: Handle, program: Rc<Program>) -> VmResult<()> {
        let closure = self.instantiate_closure(template, self.globals)?;
        let chunk = match self.heap.get(closure) {
            Some(Object::Function(f)) => Rc::clone(&f.chunk),
            _ => return Err(VmError::internal("root is not a function")),
        };

        // The root script runs directly in the globals environment, so
        // top-level bindings persist across `eval` calls
        let base = self.stack.len();
        let base_frames = self.frames.len();
        let base_tries = self.tries.len();
        let saved_env = self.env;
        self.frames.push(CallFrame {
            function: closure,
            chunk,
            ip: 0,
            last_op: 0,
            base,
            prev_env: self.env,
            prev_program: self.current_program.take(),
            program: Rc::clone(&program),
            receiver: None,
            arg_count: 0,
            is_initializer: false,
            module: None,
        });
        self.env = self.globals;
        self.current_program = Some(program);

        let result = self.run_until(base_frames);
        match result {
            Ok(()) => {
                self.last_value = self.pop()?;
                Ok(())
            }
            Err(err) => {
                // Leave the VM reusable: unwind everything this run built
                self.poison_unwound_modules(base_frames);
                self.frames.truncate(base_frames);
                self.stack.truncate(base);
                self.tries.truncate(base_tries);
                self.env = saved_env;
                self.current_program = None;
                self.had_error = true;
                Err(err)
            }
        }
    }

    /// Runs until the frame stack shrinks back to `base_frames`.
    pub(crate) fn run_until(&mut self, base_frames: usize) -> VmResult<()> {
        while self.frames.len() > base_frames {
            if let Err(err) = self.step() {
                self.recover(err, base_frames)?;
            }
        }
        Ok(())
    }

    /// Routes a failed instruction to the nearest eligible try handler, or
    /// reports and propagates when none exists.
    fn recover(&mut self, err: VmError, base_frames: usize) -> VmResult<()> {
        if !err.is_recoverable() {
            self.report_runtime_error(&err);
            return Err(err);
        }

        // Drop try-frames whose frames have already returned
        while let Some(t) = self.tries.last() {
            if t.frame_index >= self.frames.len() {
                self.tries.pop();
            } else {
                break;
            }
        }

        let eligible = matches!(self.tries.last(), Some(t) if t.frame_index >= base_frames);
        if !eligible {
            self.report_runtime_error(&err);
            return Err(err);
        }
        let handler = self.tries.pop().expect("eligible try frame");

        let error_value = match &err {
            VmError::Throw { value, .. } => *value,
            other => {
                let message = other.script_message();
                self.wrap_error_message(&message)
            }
        };

        // Unwinding past an in-flight module load leaves its record
        // poisoned, not half-populated
        self.poison_unwound_modules(handler.frame_index + 1);
        self.frames.truncate(handler.frame_index + 1);
        self.stack.truncate(handler.stack_top);
        self.env = handler.env;
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = handler.handler_ip;
        }
        if let Some(frame) = self.frames.last() {
            self.current_program = Some(Rc::clone(&frame.program));
        }
        self.push(error_value);
        Ok(())
    }

    /// Marks the registry entries of module frames above `keep` as failed.
    fn poison_unwound_modules(&mut self, keep: usize) {
        let failed: Vec<String> = self.frames[keep.min(self.frames.len())..]
            .iter()
            .filter_map(|frame| frame.module.as_ref().map(|m| m.key.clone()))
            .collect();
        for key in failed {
            log::debug!("module {key} unwound before completing; poisoning its record");
            self.modules.insert(key, ModuleEntry::Failed);
        }
    }

    /// One instruction: budget checks, dispatch, post-instruction checks.
    fn step(&mut self) -> VmResult<()> {
        self.instructions += 1;
        if self.limits.max_instructions > 0 && self.instructions > self.limits.max_instructions {
            return Err(VmError::InstructionLimitExceeded {
                executed: self.instructions,
                limit: self.limits.max_instructions,
            });
        }

        {
            let frame = self.frame_mut();
            frame.last_op = frame.ip;
        }
        let byte = self.read_byte();
        let Some(op) = OpCode::from_byte(byte) else {
            return Err(VmError::internal(format!("invalid opcode 0x{byte:02x}")));
        };
        log::trace!("{:04} {}", self.frame().last_op, op.name());

        self.dispatch(op)?;

        if self.stack.len() > self.limits.max_stack_size {
            return Err(VmError::StackOverflow {
                max_size: self.limits.max_stack_size,
            });
        }
        if self.limits.max_heap_bytes > 0 && self.heap.bytes_total() > self.limits.max_heap_bytes {
            let roots = self.collect_roots();
            self.heap.collect_now(&roots);
            if self.heap.bytes_total() > self.limits.max_heap_bytes {
                return Err(VmError::HeapLimitExceeded {
                    used: self.heap.bytes_total(),
                    limit: self.limits.max_heap_bytes,
                });
            }
        }
        // Budget checks are safepoints too: keep a parked old sweep moving
        if self.heap.old_sweep_active() {
            self.heap.advance_old_sweep();
        }
        Ok(())
    }

    fn dispatch(&mut self, op: OpCode) -> VmResult<()> {
        match op {
            OpCode::CONSTANT => {
                let value = self.read_constant();
                self.push(value);
            }
            OpCode::NULL => self.push(Value::Null),
            OpCode::TRUE => self.push(Value::Bool(true)),
            OpCode::FALSE => self.push(Value::Bool(false)),
            OpCode::POP => {
                self.pop()?;
            }

            OpCode::GET_VAR => {
                let name = self.read_name()?;
                match self.heap.env_get(self.env, name) {
                    Some(value) => self.push(value),
                    None => return Err(self.undefined_variable(name)),
                }
            }
            OpCode::SET_VAR => {
                let name = self.read_name()?;
                let value = self.peek(0)?;
                match self.heap.env_assign(self.env, name, value) {
                    AssignOutcome::Assigned => {}
                    AssignOutcome::Immutable => {
                        return Err(VmError::type_error(format!(
                            "cannot assign to constant '{}'",
                            self.name_text(name)
                        )))
                    }
                    AssignOutcome::Undefined => return Err(self.undefined_variable(name)),
                }
            }
            OpCode::DEFINE_VAR => {
                let name = self.read_name()?;
                let value = self.pop()?;
                self.heap.env_define(self.env, name, value, true);
            }
            OpCode::DEFINE_CONST => {
                let name = self.read_name()?;
                let value = self.pop()?;
                self.heap.env_define(self.env, name, value, false);
            }
            OpCode::GET_THIS => {
                let name = self.read_name()?;
                let receiver = self.frame().receiver;
                match receiver {
                    Some(value) => self.push(value),
                    None => match self.heap.env_get(self.env, name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(VmError::name("'this' is only available inside methods"))
                        }
                    },
                }
            }

            OpCode::GET_PROPERTY => self.op_get_property(false)?,
            OpCode::GET_PROPERTY_OPTIONAL => self.op_get_property(true)?,
            OpCode::SET_PROPERTY => self.op_set_property()?,
            OpCode::GET_INDEX => self.op_get_index(false)?,
            OpCode::GET_INDEX_OPTIONAL => self.op_get_index(true)?,
            OpCode::SET_INDEX => self.op_set_index()?,

            OpCode::MATCH_ENUM => {
                let enum_name = self.read_name()?;
                let variant_name = self.read_name()?;
                let value = self.pop()?;
                self.push(Value::Bool(self.is_enum_variant(value, enum_name, variant_name)));
            }
            OpCode::IS_ARRAY => {
                let value = self.pop()?;
                let is = matches!(
                    value.as_obj().and_then(|h| self.heap.get(h)),
                    Some(Object::Array(_))
                );
                self.push(Value::Bool(is));
            }
            OpCode::IS_MAP => {
                let value = self.pop()?;
                let is = matches!(
                    value.as_obj().and_then(|h| self.heap.get(h)),
                    Some(Object::Map(_))
                );
                self.push(Value::Bool(is));
            }
            OpCode::LEN => {
                let value = self.pop()?;
                let len = self.value_len(value)?;
                self.push(Value::Number(len as f64));
            }
            OpCode::MAP_HAS => {
                let container = self.pop()?;
                let key = self.pop()?;
                let has = self.container_has(container, key)?;
                self.push(Value::Bool(has));
            }

            OpCode::EQUAL => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(self.values_equal(a, b)));
            }
            OpCode::GREATER => self.numeric_compare(|a, b| a > b)?,
            OpCode::GREATER_EQUAL => self.numeric_compare(|a, b| a >= b)?,
            OpCode::LESS => self.numeric_compare(|a, b| a < b)?,
            OpCode::LESS_EQUAL => self.numeric_compare(|a, b| a <= b)?,
            OpCode::ADD => self.op_add()?,
            OpCode::SUBTRACT => self.numeric_binary(|a, b| a - b)?,
            OpCode::MULTIPLY => self.numeric_binary(|a, b| a * b)?,
            OpCode::DIVIDE => self.numeric_binary(|a, b| a / b)?,
            OpCode::NOT => {
                let value = self.pop()?;
                self.push(Value::Bool(value.is_falsey()));
            }
            OpCode::NEGATE => {
                let value = self.pop()?;
                match value.as_number() {
                    Some(n) => self.push(Value::Number(-n)),
                    None => {
                        return Err(VmError::type_error(format!(
                            "operand to '-' must be a number, got {}",
                            self.kind_of(value)
                        )))
                    }
                }
            }
            OpCode::STRINGIFY => {
                let value = self.pop()?;
                let text = self.heap.stringify(value);
                let handle = self.heap.intern(&text);
                self.push(Value::Obj(handle));
            }

            OpCode::JUMP => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip += offset;
            }
            OpCode::JUMP_IF_FALSE => {
                let offset = self.read_u16() as usize;
                if self.peek(0)?.is_falsey() {
                    self.frame_mut().ip += offset;
                }
            }
            OpCode::LOOP => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip -= offset;
            }
            OpCode::TRY => {
                let offset = self.read_u16() as usize;
                if self.tries.len() >= self.limits.max_try_nesting_depth {
                    return Err(VmError::CallDepthExceeded {
                        depth: self.tries.len(),
                        limit: self.limits.max_try_nesting_depth,
                    });
                }
                let handler_ip = self.frame().ip + offset;
                self.tries.push(TryFrame {
                    frame_index: self.frames.len() - 1,
                    handler_ip,
                    stack_top: self.stack.len(),
                    env: self.env,
                });
            }
            OpCode::END_TRY => {
                let current = self.frames.len() - 1;
                let matched = matches!(self.tries.last(), Some(t) if t.frame_index == current);
                if !matched {
                    return Err(VmError::internal("END_TRY without a matching TRY"));
                }
                self.tries.pop();
            }
            OpCode::THROW => {
                let value = self.pop()?;
                return Err(self.make_throw(value));
            }
            OpCode::TRY_UNWRAP => self.op_try_unwrap()?,

            OpCode::CALL => {
                let argc = self.read_byte() as usize;
                self.call_dispatch(argc, false)?;
            }
            OpCode::CALL_OPTIONAL => {
                let argc = self.read_byte() as usize;
                self.call_dispatch(argc, true)?;
            }
            OpCode::INVOKE => self.op_invoke()?,
            OpCode::ARG_COUNT => {
                let count = self.frame().arg_count;
                self.push(Value::Number(count as f64));
            }
            OpCode::CLOSURE => {
                let template = self.read_constant();
                let Some(handle) = template.as_obj() else {
                    return Err(VmError::internal("CLOSURE over a non-function constant"));
                };
                let closure = self.instantiate_closure(handle, self.env)?;
                self.push(Value::Obj(closure));
            }
            OpCode::RETURN => {
                let result = self.pop()?;
                self.do_return(result)?;
            }

            OpCode::BEGIN_SCOPE => {
                self.env = self.heap.new_env(Some(self.env));
            }
            OpCode::END_SCOPE => {
                let parent = match self.heap.get(self.env) {
                    Some(Object::Env(e)) => e.parent,
                    _ => None,
                };
                match parent {
                    Some(parent) => self.env = parent,
                    None => return Err(VmError::internal("END_SCOPE at the root environment")),
                }
            }

            OpCode::CLASS => {
                let name = self.read_name()?;
                let count = self.read_u16() as usize;
                self.op_class(name, count)?;
            }

            OpCode::IMPORT => {
                let has_alias = self.read_byte() != 0;
                let alias_idx = self.read_u16();
                self.op_import(has_alias, alias_idx)?;
            }
            OpCode::IMPORT_MODULE => self.op_import_module()?,
            OpCode::EXPORT => {
                let name = self.read_name()?;
                self.op_export(name)?;
            }
            OpCode::PRIVATE => {
                let name = self.read_name()?;
                self.op_private(name)?;
            }
            OpCode::EXPORT_VALUE => {
                let name = self.read_name()?;
                self.op_export_value(name)?;
            }
            OpCode::EXPORT_FROM => self.op_export_from()?,

            OpCode::ARRAY => {
                let capacity = self.read_u16() as usize;
                let array = self.heap.new_array(capacity);
                self.push(Value::Obj(array));
            }
            OpCode::ARRAY_APPEND => {
                let value = self.pop()?;
                let Some(array) = self.peek(0)?.as_obj() else {
                    return Err(VmError::internal("ARRAY_APPEND without an array"));
                };
                self.heap.array_push(array, value)?;
            }
            OpCode::MAP => {
                let capacity = self.read_u16() as usize;
                let map = self.heap.new_map(capacity);
                self.push(Value::Obj(map));
            }
            OpCode::MAP_SET => {
                let value = self.pop()?;
                let key = self.pop()?;
                let key = self.expect_string_key(key, "map key")?;
                let Some(map) = self.peek(0)?.as_obj() else {
                    return Err(VmError::internal("MAP_SET without a map"));
                };
                self.heap.map_insert(map, key, value)?;
            }

            OpCode::GC => {
                let roots = self.collect_roots();
                self.heap.gc_maybe(&roots);
            }
        }
        Ok(())
    }

    // === Frame and stack helpers ===

    pub(crate) fn frame(&self) -> &CallFrame {
        self.frames.last().expect("active call frame")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("active call frame")
    }

    pub(crate) fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    pub(crate) fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let value = frame.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    pub(crate) fn read_constant(&mut self) -> Value {
        let idx = self.read_u16() as usize;
        self.frame().chunk.constants[idx]
    }

    /// Reads a u16 name operand and returns its interned-string handle.
    pub(crate) fn read_name(&mut self) -> VmResult<Handle> {
        let value = self.read_constant();
        value
            .as_obj()
            .filter(|h| self.heap.str_value(*h).is_some())
            .ok_or_else(|| VmError::internal("name operand is not a string constant"))
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::internal("value stack underflow"))
    }

    pub(crate) fn peek(&self, depth: usize) -> VmResult<Value> {
        let len = self.stack.len();
        if depth >= len {
            return Err(VmError::internal("value stack underflow"));
        }
        Ok(self.stack[len - 1 - depth])
    }

    pub(crate) fn name_text(&self, name: Handle) -> String {
        self.heap.str_value(name).unwrap_or("?").to_string()
    }

    pub(crate) fn kind_of(&self, value: Value) -> &'static str {
        match value {
            Value::Obj(handle) => self.heap.kind_name(handle),
            other => other.tag_name(),
        }
    }

    fn undefined_variable(&self, name: Handle) -> VmError {
        VmError::name(format!("undefined variable '{}'", self.name_text(name)))
    }

    // === Value operations ===

    fn values_equal(&self, a: Value, b: Value) -> bool {
        // Strings are interned, so handle identity covers content equality
        a == b
    }

    fn numeric_compare(&mut self, op: fn(f64, f64) -> bool) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.push(Value::Bool(op(a, b)));
                Ok(())
            }
            _ => Err(VmError::type_error(format!(
                "comparison operands must be numbers, got {} and {}",
                self.kind_of(a),
                self.kind_of(b)
            ))),
        }
    }

    fn numeric_binary(&mut self, op: fn(f64, f64) -> f64) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.push(Value::Number(op(a, b)));
                Ok(())
            }
            _ => Err(VmError::type_error(format!(
                "arithmetic operands must be numbers, got {} and {}",
                self.kind_of(a),
                self.kind_of(b)
            ))),
        }
    }

    fn op_add(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            self.push(Value::Number(x + y));
            return Ok(());
        }
        let concatenated = match (a, b) {
            (Value::Obj(x), Value::Obj(y)) => {
                match (self.heap.str_value(x), self.heap.str_value(y)) {
                    (Some(x), Some(y)) => Some(format!("{x}{y}")),
                    _ => None,
                }
            }
            _ => None,
        };
        match concatenated {
            Some(text) => {
                let handle = self.heap.intern(&text);
                self.push(Value::Obj(handle));
                Ok(())
            }
            None => Err(VmError::type_error(format!(
                "operands to '+' must both be numbers or both be strings, got {} and {}",
                self.kind_of(a),
                self.kind_of(b)
            ))),
        }
    }

    fn value_len(&self, value: Value) -> VmResult<usize> {
        let Some(handle) = value.as_obj() else {
            return Err(VmError::type_error(format!(
                "{} has no length",
                self.kind_of(value)
            )));
        };
        match self.heap.get(handle) {
            Some(Object::Array(a)) => Ok(a.items.len()),
            Some(Object::Map(m)) => Ok(m.entries.len()),
            Some(Object::Str(s)) => Ok(s.chars.chars().count()),
            _ => Err(VmError::type_error(format!(
                "{} has no length",
                self.kind_of(value)
            ))),
        }
    }

    fn container_has(&self, container: Value, key: Value) -> VmResult<bool> {
        let key = match key.as_obj().filter(|h| self.heap.str_value(*h).is_some()) {
            Some(key) => key,
            None => {
                return Err(VmError::type_error(format!(
                    "membership key must be a string, got {}",
                    self.kind_of(key)
                )))
            }
        };
        match container.as_obj().and_then(|h| self.heap.get(h)) {
            Some(Object::Map(m)) => Ok(m.entries.get(key).is_some()),
            Some(Object::Instance(i)) => Ok(i.fields.get(key).is_some()),
            _ => Err(VmError::type_error(format!(
                "'in' requires a map, got {}",
                self.kind_of(container)
            ))),
        }
    }

    pub(crate) fn expect_string_key(&self, value: Value, what: &str) -> VmResult<Handle> {
        value
            .as_obj()
            .filter(|h| self.heap.str_value(*h).is_some())
            .ok_or_else(|| {
                VmError::type_error(format!("{what} must be a string, got {}", self.kind_of(value)))
            })
    }

    fn is_enum_variant(&self, value: Value, enum_name: Handle, variant: Handle) -> bool {
        let Some(Object::Map(m)) = value.as_obj().and_then(|h| self.heap.get(h)) else {
            return false;
        };
        let tagged_enum = m.entries.get(self.syms.enum_tag).copied();
        let tagged_variant = m.entries.get(self.syms.variant_tag).copied();
        tagged_enum == Some(Value::Obj(enum_name)) && tagged_variant == Some(Value::Obj(variant))
    }

    fn op_try_unwrap(&mut self) -> VmResult<()> {
        let value = self.peek(0)?;
        let Some(Object::Map(m)) = value.as_obj().and_then(|h| self.heap.get(h)) else {
            return Err(VmError::type_error(
                "'?' requires a Result or Option value",
            ));
        };
        let enum_name = m.entries.get(self.syms.enum_tag).copied();
        let tag = m.entries.get(self.syms.variant_tag).copied();
        let payload = m.entries.get(self.syms.values).copied();

        let unwrap = if enum_name == Some(Value::Obj(self.syms.result)) {
            if tag == Some(Value::Obj(self.syms.ok)) {
                true
            } else if tag == Some(Value::Obj(self.syms.err)) {
                false
            } else {
                return Err(VmError::type_error("malformed Result value"));
            }
        } else if enum_name == Some(Value::Obj(self.syms.option)) {
            if tag == Some(Value::Obj(self.syms.some)) {
                true
            } else if tag == Some(Value::Obj(self.syms.none)) {
                false
            } else {
                return Err(VmError::type_error("malformed Option value"));
            }
        } else {
            return Err(VmError::type_error(
                "'?' requires a Result or Option value",
            ));
        };

        if unwrap {
            let first = payload
                .and_then(|p| p.as_obj())
                .and_then(|h| match self.heap.get(h) {
                    Some(Object::Array(a)) => a.items.first().copied(),
                    _ => None,
                })
                .unwrap_or(Value::Null);
            self.pop()?;
            self.push(first);
        } else {
            // Early-return the variant itself from the current frame
            let value = self.pop()?;
            self.do_return(value)?;
        }
        Ok(())
    }

    fn op_class(&mut self, name: Handle, count: usize) -> VmResult<()> {
        if self.stack.len() < count {
            return Err(VmError::internal("CLASS without its methods"));
        }
        let methods_start = self.stack.len() - count;
        let mut methods = OrderedMap::with_capacity(count);
        for i in 0..count {
            let method = self.stack[methods_start + i];
            let Some(handle) = method.as_obj() else {
                return Err(VmError::internal("class method is not a function"));
            };
            let method_name = match self.heap.get(handle) {
                Some(Object::Function(f)) => f.name,
                _ => None,
            };
            let Some(method_name) = method_name else {
                return Err(VmError::internal("class method has no name"));
            };
            methods.insert(method_name, method);
        }
        self.stack.truncate(methods_start);
        let class = self.heap.alloc(Object::Class(ObjClass { name, methods }));
        self.push(Value::Obj(class));
        Ok(())
    }

    // === Errors as values ===

    /// Builds the `VmError::Throw` for a thrown value, wrapping it into the
    /// `{_error, message, value, trace}` shape if needed.
    pub(crate) fn make_throw(&mut self, value: Value) -> VmError {
        let wrapped = self.wrap_error_value(value);
        let message = self.error_message_of(wrapped);
        VmError::Throw {
            message,
            value: wrapped,
        }
    }

    fn error_message_of(&self, wrapped: Value) -> String {
        let Some(Object::Map(m)) = wrapped.as_obj().and_then(|h| self.heap.get(h)) else {
            return self.heap.stringify(wrapped);
        };
        m.entries
            .get(self.syms.message)
            .map(|v| self.heap.stringify(*v))
            .unwrap_or_else(|| "error".to_string())
    }

    fn wrap_error_value(&mut self, value: Value) -> Value {
        // Already wrapped?
        if let Some(Object::Map(m)) = value.as_obj().and_then(|h| self.heap.get(h)) {
            if m.entries.get(self.syms.error).is_some() {
                return value;
            }
        }
        let message = match value.as_obj().and_then(|h| self.heap.str_value(h)) {
            Some(text) => text.to_string(),
            None => self.heap.stringify(value),
        };
        self.build_error_map(&message, value)
    }

    pub(crate) fn wrap_error_message(&mut self, message: &str) -> Value {
        let text = self.heap.intern(message);
        self.build_error_map(message, Value::Obj(text))
    }

    fn build_error_map(&mut self, message: &str, value: Value) -> Value {
        let trace = self.capture_trace();
        let map = self.heap.new_map(4);
        let message_handle = self.heap.intern(message);
        let _ = self.heap.map_insert(map, self.syms.error, Value::Bool(true));
        let _ = self
            .heap
            .map_insert(map, self.syms.message, Value::Obj(message_handle));
        let _ = self.heap.map_insert(map, self.syms.value, value);
        let _ = self.heap.map_insert(map, self.syms.trace, Value::Obj(trace));
        Value::Obj(map)
    }

    /// Walks the frame stack, innermost first, into an array of strings.
    fn capture_trace(&mut self) -> Handle {
        let mut lines = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let name = match self.heap.get(frame.function) {
                Some(Object::Function(f)) => f
                    .name
                    .and_then(|n| self.heap.str_value(n))
                    .unwrap_or("<script>"),
                _ => "<script>",
            };
            let token = frame.chunk.token_at(frame.last_op);
            lines.push(format!(
                "at {} ({}:{})",
                name, frame.program.path, token.line
            ));
        }
        let items: Vec<Value> = lines
            .iter()
            .map(|l| Value::Obj(self.heap.intern(l)))
            .collect();
        self.heap.alloc(Object::Array(ObjArray { items }))
    }

    fn report_runtime_error(&mut self, err: &VmError) {
        let Some(frame) = self.frames.last() else {
            let _ = writeln!(self.diag, "RuntimeError: {err}");
            return;
        };
        let token = frame.chunk.token_at(frame.last_op);
        let message = match err {
            VmError::Throw { message, .. } => format!("uncaught throw: {message}"),
            other => other.to_string(),
        };
        let text = diagnostics::render_runtime(
            &frame.program.path,
            &frame.program.source,
            &token,
            &message,
        );
        let _ = self.diag.write_all(text.as_bytes());
        log::debug!("runtime error: {err}");
    }

    // === GC plumbing ===

    /// Gathers every root the collector must start from.
    pub(crate) fn collect_roots(&self) -> Vec<Value> {
        let mut roots = Vec::with_capacity(self.stack.len() + self.frames.len() * 4 + 32);
        roots.extend_from_slice(&self.stack);
        roots.push(Value::Obj(self.globals));
        roots.push(Value::Obj(self.env));
        roots.push(self.last_value);
        roots.extend_from_slice(&self.pinned);
        if let Some(args) = self.args_array {
            roots.push(Value::Obj(args));
        }
        for frame in &self.frames {
            roots.push(Value::Obj(frame.function));
            roots.push(Value::Obj(frame.prev_env));
            if let Some(receiver) = frame.receiver {
                roots.push(receiver);
            }
            if let Some(module) = &frame.module {
                roots.push(Value::Obj(module.instance));
                roots.push(Value::Obj(module.env));
                for name in &module.private {
                    roots.push(Value::Obj(*name));
                }
            }
        }
        for try_frame in &self.tries {
            roots.push(Value::Obj(try_frame.env));
        }
        for entry in self.modules.values() {
            if let ModuleEntry::Loaded(handle) = entry {
                roots.push(Value::Obj(*handle));
            }
        }
        self.syms.roots(&mut roots);
        roots
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

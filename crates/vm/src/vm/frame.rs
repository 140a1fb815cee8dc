//! Call frame module for the Erkao VM.
//!
//! A frame records everything needed to resume its caller: instruction
//! pointer, stack base, the environment and program to restore, the
//! receiver for bound methods, and the module wiring used when the frame
//! is a module's top-level script.

use std::rc::Rc;

use hashbrown::HashSet;

use crate::chunk::Chunk;
use crate::heap::Handle;
use crate::program::Program;
use crate::value::Value;

/// Module-specific frame state, present when the frame executes a module's
/// top-level script.
#[derive(Debug)]
pub struct ModuleFrame {
    /// The module record registered in the VM's module map before
    /// execution started (this is the cycle guard)
    pub instance: Handle,
    /// The module's top-level environment; its public bindings become the
    /// record's fields if nothing was exported explicitly
    pub env: Handle,
    /// Registry key: the resolved, canonical path
    pub key: String,
    /// Alias to bind in the importing environment on completion
    pub alias: Option<Handle>,
    /// Whether the import site expects the instance pushed
    pub push_result: bool,
    /// Bindings excluded from the public export set
    pub private: HashSet<Handle>,
}

/// One entry of the frame stack.
#[derive(Debug)]
pub struct CallFrame {
    /// The running function object
    pub function: Handle,
    /// The function's chunk, shared with the function object
    pub chunk: Rc<Chunk>,
    /// Offset of the next instruction
    pub ip: usize,
    /// Offset of the currently executing instruction, for diagnostics
    pub last_op: usize,
    /// Stack slot of the callee; arguments live just above it
    pub base: usize,
    /// Environment to restore on return
    pub prev_env: Handle,
    /// Program of the caller, restored on return
    pub prev_program: Option<Rc<Program>>,
    /// Program this frame executes, for diagnostics
    pub program: Rc<Program>,
    /// Receiver when the frame runs a method
    pub receiver: Option<Value>,
    /// Number of arguments actually supplied at the call site
    pub arg_count: usize,
    /// Copied from the function: calls yield the receiver
    pub is_initializer: bool,
    /// Module wiring, for module top-level frames only
    pub module: Option<ModuleFrame>,
}

/// A saved execution state used to resume after `THROW`.
#[derive(Debug, Clone)]
pub struct TryFrame {
    /// Index of the frame the handler belongs to
    pub frame_index: usize,
    /// Handler entry point within that frame's chunk
    pub handler_ip: usize,
    /// Value-stack depth to restore before entering the handler
    pub stack_top: usize,
    /// Environment to restore
    pub env: Handle,
}

//! Module loading for the Erkao VM.
//!
//! Imports resolve through the configured [`crate::resolver::ModuleResolver`]
//! and are cached in the VM's module registry under the resolved path. The
//! record is inserted *before* the module body runs: a cyclic import
//! observes the partially populated record instead of recursing, which is
//! the entire cycle guard. A failed load leaves a poisoned entry so the
//! failure is reported on every subsequent import.

use std::path::PathBuf;
use std::rc::Rc;

use hashbrown::HashSet;

use crate::diagnostics;
use crate::compiler::{CompileMode, Compiler};
use crate::error::{VmError, VmResult};
use crate::heap::Handle;
use crate::lexer::lex;
use crate::object::Object;
use crate::program::Program;
use crate::value::Value;

use super::{CallFrame, ModuleEntry, ModuleFrame, Vm};

impl Vm {
    /// `IMPORT has_alias alias`: load and (optionally) bind under an alias.
    pub(crate) fn op_import(&mut self, has_alias: bool, alias_idx: u16) -> VmResult<()> {
        let alias = if has_alias {
            let constant = self.frame().chunk.constants[alias_idx as usize];
            Some(
                constant
                    .as_obj()
                    .ok_or_else(|| VmError::internal("import alias is not a string"))?,
            )
        } else {
            None
        };
        self.load_module(alias, false)
    }

    /// `IMPORT_MODULE`: load and push the module record.
    pub(crate) fn op_import_module(&mut self) -> VmResult<()> {
        self.load_module(None, true)
    }

    fn load_module(&mut self, alias: Option<Handle>, push_result: bool) -> VmResult<()> {
        let path_value = self.pop()?;
        let Some(literal) = self.heap.value_str(path_value).map(str::to_string) else {
            return Err(VmError::type_error(format!(
                "import path must be a string, got {}",
                self.kind_of(path_value)
            )));
        };

        let importer = PathBuf::from(&self.frame().program.path);
        let Some(resolved) = self.resolver.resolve(&importer, &literal) else {
            return Err(VmError::import(format!("cannot resolve module '{literal}'")));
        };
        let key = resolved.to_string_lossy().into_owned();

        match self.modules.get(&key) {
            Some(ModuleEntry::Loaded(instance)) => {
                let instance = *instance;
                if push_result {
                    self.push(Value::Obj(instance));
                } else if let Some(alias) = alias {
                    self.heap
                        .env_define(self.env, alias, Value::Obj(instance), true);
                }
                return Ok(());
            }
            Some(ModuleEntry::Failed) => {
                return Err(VmError::import(format!(
                    "module '{literal}' previously failed to load"
                )));
            }
            None => {}
        }

        log::debug!("loading module {key}");
        let source = match std::fs::read_to_string(&resolved) {
            Ok(source) => source,
            Err(e) => {
                self.modules.insert(key, ModuleEntry::Failed);
                return Err(VmError::import(format!(
                    "cannot read module '{literal}': {e}"
                )));
            }
        };

        // Register the record before execution begins; this is what a
        // cyclic import finds instead of recursing
        let instance = self.heap.new_instance(None);
        self.modules
            .insert(key.clone(), ModuleEntry::Loaded(instance));

        let tokens = match lex(&source) {
            Ok(tokens) => tokens,
            Err(diags) => {
                self.report_module_diagnostics(&key, &source, &diags);
                self.modules.insert(key.clone(), ModuleEntry::Failed);
                return Err(VmError::import(format!(
                    "module '{literal}' failed to compile"
                )));
            }
        };
        let program = Program::new(key.clone(), source);
        let template = match Compiler::compile(
            &mut self.heap,
            Rc::clone(&program),
            tokens,
            CompileMode::Script,
        ) {
            Ok(template) => template,
            Err(diags) => {
                self.report_module_diagnostics(&key, &program.source, &diags);
                self.modules.insert(key.clone(), ModuleEntry::Failed);
                return Err(VmError::import(format!(
                    "module '{literal}' failed to compile"
                )));
            }
        };

        let closure = self.instantiate_closure(template, self.globals)?;
        let chunk = match self.heap.get(closure) {
            Some(Object::Function(f)) => Rc::clone(&f.chunk),
            _ => return Err(VmError::internal("module root is not a function")),
        };
        let module_env = self.heap.new_env(Some(self.globals));

        self.frames.push(CallFrame {
            function: closure,
            chunk,
            ip: 0,
            last_op: 0,
            base: self.stack.len(),
            prev_env: self.env,
            prev_program: self.current_program.take(),
            program: Rc::clone(&program),
            receiver: None,
            arg_count: 0,
            is_initializer: false,
            module: Some(ModuleFrame {
                instance,
                env: module_env,
                key,
                alias,
                push_result,
                private: HashSet::new(),
            }),
        });
        self.env = module_env;
        self.current_program = Some(program);
        Ok(())
    }

    fn report_module_diagnostics(
        &mut self,
        path: &str,
        source: &str,
        diags: &[crate::error::CompileDiagnostic],
    ) {
        for diagnostic in diags {
            let text = diagnostics::render_compile(path, source, diagnostic);
            self.write_diag(&text);
        }
    }

    /// Completes a module frame's import: publish exports, reinsert the
    /// record, and deliver it the way the import site asked.
    pub(crate) fn finish_module(&mut self, module: ModuleFrame) -> VmResult<()> {
        let fields_empty = matches!(
            self.heap.get(module.instance),
            Some(Object::Instance(i)) if i.fields.is_empty()
        );
        if fields_empty {
            // No explicit exports: the record becomes the public subset of
            // the module environment
            let bindings: Vec<(Handle, Value)> = match self.heap.get(module.env) {
                Some(Object::Env(e)) => e
                    .bindings
                    .iter()
                    .filter(|(name, _)| !module.private.contains(name))
                    .map(|(name, binding)| (name, binding.value))
                    .collect(),
                _ => Vec::new(),
            };
            for (name, value) in bindings {
                self.heap.instance_set(module.instance, name, value)?;
            }
        }

        self.modules
            .insert(module.key.clone(), ModuleEntry::Loaded(module.instance));
        if module.push_result {
            self.push(Value::Obj(module.instance));
        } else if let Some(alias) = module.alias {
            self.heap
                .env_define(self.env, alias, Value::Obj(module.instance), true);
        }
        Ok(())
    }

    fn module_instance(&self) -> VmResult<Handle> {
        self.frame()
            .module
            .as_ref()
            .map(|m| m.instance)
            .ok_or_else(|| VmError::type_error("'export' outside of a module"))
    }

    /// `EXPORT name`: copy a binding into the module record.
    pub(crate) fn op_export(&mut self, name: Handle) -> VmResult<()> {
        let instance = self.module_instance()?;
        let Some(value) = self.heap.env_get(self.env, name) else {
            return Err(VmError::name(format!(
                "cannot export undefined name '{}'",
                self.name_text(name)
            )));
        };
        self.heap.instance_set(instance, name, value)?;
        Ok(())
    }

    /// `PRIVATE name`: exclude a binding from the public export set.
    pub(crate) fn op_private(&mut self, name: Handle) -> VmResult<()> {
        match self.frame_mut().module.as_mut() {
            Some(module) => {
                module.private.insert(name);
                Ok(())
            }
            None => Err(VmError::type_error("'private' outside of a module")),
        }
    }

    /// `EXPORT_VALUE name`: pop a value into the module record.
    pub(crate) fn op_export_value(&mut self, name: Handle) -> VmResult<()> {
        let instance = self.module_instance()?;
        let value = self.pop()?;
        self.heap.instance_set(instance, name, value)?;
        Ok(())
    }

    /// `EXPORT_FROM count pairs...`: re-export from the record on the
    /// stack; a count of zero re-exports everything.
    pub(crate) fn op_export_from(&mut self) -> VmResult<()> {
        let count = self.read_u16() as usize;
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let src = self.read_name()?;
            let dst = self.read_name()?;
            pairs.push((src, dst));
        }

        let source_value = self.pop()?;
        let source = source_value
            .as_obj()
            .filter(|h| matches!(self.heap.get(*h), Some(Object::Instance(_))))
            .ok_or_else(|| VmError::internal("EXPORT_FROM without a module record"))?;
        let target = self.module_instance()?;

        if pairs.is_empty() {
            let all: Vec<(Handle, Value)> = match self.heap.get(source) {
                Some(Object::Instance(i)) => {
                    i.fields.iter().map(|(name, value)| (name, *value)).collect()
                }
                _ => Vec::new(),
            };
            for (name, value) in all {
                self.heap.instance_set(target, name, value)?;
            }
            return Ok(());
        }

        for (src_name, dst_name) in pairs {
            let value = match self.heap.get(source) {
                Some(Object::Instance(i)) => i.fields.get(src_name).copied(),
                _ => None,
            };
            let Some(value) = value else {
                return Err(VmError::import(format!(
                    "module does not export '{}'",
                    self.name_text(src_name)
                )));
            };
            self.heap.instance_set(target, dst_name, value)?;
        }
        Ok(())
    }
}

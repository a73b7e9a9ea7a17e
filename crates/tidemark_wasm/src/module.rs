//! In-process reference guest.
//!
//! Exports and imports are Rust closures over a [`LinearMemory`]. Every
//! import call goes through the module's hook slot, so a recording or replay
//! session sees exactly the traffic a compiled guest would produce.

use crate::hook::HookSlot;
use crate::host::{HostContext, HostFunction, HostRegistry};
use crate::instance::{GuestError, GuestInstance};
use crate::memory::{LinearMemory, MemoryLimit};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tidemark_core::{CallOutcome, GuestMemory, MemoryError, Value};
use tracing::trace;

/// Export implemented by the guest
pub type ExportFn = Rc<dyn Fn(&GuestModule, &[Value]) -> Result<Value, GuestError>>;

/// Module configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Name used in diagnostics
    pub name: String,
    /// Linear memory limits
    pub memory: MemoryLimit,
}

impl ModuleConfig {
    /// Create a new module config
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory: MemoryLimit::default(),
        }
    }

    /// Set memory limit
    #[must_use]
    pub fn with_memory_limit(mut self, limit: MemoryLimit) -> Self {
        self.memory = limit;
        self
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self::new("guest")
    }
}

/// A guest whose code is native closures
pub struct GuestModule {
    config: ModuleConfig,
    memory: LinearMemory,
    exports: HashMap<String, ExportFn>,
    imports: HostRegistry,
    hooks: HookSlot,
}

impl GuestModule {
    /// Create a module with empty export and import tables
    ///
    /// # Errors
    ///
    /// Returns error if the initial memory exceeds its limit
    pub fn new(config: ModuleConfig) -> Result<Self, MemoryError> {
        Ok(Self {
            memory: LinearMemory::new(config.memory.clone())?,
            config,
            exports: HashMap::new(),
            imports: HostRegistry::new(),
            hooks: HookSlot::new(),
        })
    }

    /// Add an export
    #[must_use]
    pub fn with_export<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&GuestModule, &[Value]) -> Result<Value, GuestError> + 'static,
    {
        self.exports.insert(name.into(), Rc::new(f));
        self
    }

    /// Provide a host implementation for an import
    #[must_use]
    pub fn with_import<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HostContext<'_>, &[Value]) -> CallOutcome + 'static,
    {
        self.imports.register(HostFunction::new(name, f));
        self
    }

    /// Provide or replace a host implementation
    pub fn define_import(&mut self, func: HostFunction) {
        self.imports.register(func);
    }

    /// Module configuration
    #[must_use]
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Linear memory, for growth and direct inspection
    #[must_use]
    pub fn linear_memory(&self) -> &LinearMemory {
        &self.memory
    }

    /// Host implementations
    #[must_use]
    pub fn imports(&self) -> &HostRegistry {
        &self.imports
    }

    /// Export names, sorted
    #[must_use]
    pub fn export_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exports.keys().cloned().collect();
        names.sort();
        names
    }

    /// Call an import from guest code.
    ///
    /// An attached interceptor decides whether the host implementation runs.
    /// A host throw surfaces as [`GuestError::Threw`].
    ///
    /// # Errors
    ///
    /// Returns error if the import is unresolved, the host throws, or the
    /// interceptor aborts
    pub fn call_import(&self, name: &str, args: &[Value]) -> Result<Value, GuestError> {
        trace!(import = name, args = args.len(), "Guest calling host");
        let host = self.imports.get(name).cloned();
        let mut invoke = |a: &[Value]| match &host {
            Some(func) => func.call(&HostContext::new(self), a),
            None => CallOutcome::Threw(GuestError::MissingImport(name.to_string()).to_string()),
        };
        let outcome = match self.hooks.current() {
            Some(hook) => hook
                .intercept(self, name, args, &mut invoke)
                .map_err(|e| GuestError::Aborted(e.to_string()))?,
            None if host.is_none() => return Err(GuestError::MissingImport(name.to_string())),
            None => invoke(args),
        };
        match outcome {
            CallOutcome::Returned(value) => Ok(value),
            CallOutcome::Threw(message) => Err(GuestError::Threw(message)),
        }
    }
}

impl fmt::Debug for GuestModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestModule")
            .field("name", &self.config.name)
            .field("pages", &self.memory.pages())
            .field("exports", &self.export_names())
            .field("imports", &self.imports.list())
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl GuestMemory for GuestModule {
    fn size(&self) -> u32 {
        self.memory.size()
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.memory.read(address, buf)
    }

    fn write(&self, address: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        self.memory.write(address, bytes)
    }
}

impl GuestInstance for GuestModule {
    fn call_export(&self, name: &str, args: &[Value]) -> Result<Value, GuestError> {
        let export = self
            .exports
            .get(name)
            .cloned()
            .ok_or_else(|| GuestError::MissingExport(name.to_string()))?;
        trace!(export = name, args = args.len(), "Host calling guest");
        export(self, args)
    }

    fn has_export(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    fn hooks(&self) -> &HookSlot {
        &self.hooks
    }

    fn memory(&self) -> &dyn GuestMemory {
        self
    }
}

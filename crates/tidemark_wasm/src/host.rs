//! Host functions imported by a guest.

use crate::instance::GuestInstance;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tidemark_core::{CallOutcome, GuestMemory, MemoryError, Value};
use tidemark_trace::Scalar;

/// Host function that can be called from the guest
pub type HostFn = Rc<dyn Fn(&HostContext<'_>, &[Value]) -> CallOutcome>;

/// What a host function sees of the calling guest
pub struct HostContext<'a> {
    guest: &'a dyn GuestInstance,
}

impl<'a> HostContext<'a> {
    /// Context for a call from `guest`
    #[must_use]
    pub fn new(guest: &'a dyn GuestInstance) -> Self {
        Self { guest }
    }

    /// The calling guest, for re-entrant export calls
    #[must_use]
    pub fn guest(&self) -> &'a dyn GuestInstance {
        self.guest
    }

    /// Guest memory for reads
    #[must_use]
    pub fn memory(&self) -> &dyn GuestMemory {
        self.guest.memory()
    }

    /// Copy `bytes` into guest memory and report it to the attached session
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside guest memory
    pub fn write_bytes(&self, address: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        self.guest.write(address, bytes)?;
        if let Some(hook) = self.guest.hooks().current() {
            hook.on_bulk_write(self.guest, address, bytes);
        }
        Ok(())
    }

    /// Store one element into guest memory and report it to the attached
    /// session
    ///
    /// # Errors
    ///
    /// Returns error if the element is outside guest memory
    pub fn write_scalar(&self, address: u32, value: Scalar) -> Result<(), MemoryError> {
        self.guest.write(address, &value.to_le_bytes())?;
        if let Some(hook) = self.guest.hooks().current() {
            hook.on_indexed_write(self.guest, address, value);
        }
        Ok(())
    }
}

/// Host function definition
#[derive(Clone)]
pub struct HostFunction {
    /// Import name
    pub name: String,
    implementation: HostFn,
}

impl HostFunction {
    /// Create a new host function
    #[must_use]
    pub fn new<F>(name: impl Into<String>, implementation: F) -> Self
    where
        F: Fn(&HostContext<'_>, &[Value]) -> CallOutcome + 'static,
    {
        Self {
            name: name.into(),
            implementation: Rc::new(implementation),
        }
    }

    /// Call the host function
    pub fn call(&self, ctx: &HostContext<'_>, args: &[Value]) -> CallOutcome {
        (self.implementation)(ctx, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Registry of host functions
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    functions: HashMap<String, HostFunction>,
}

impl HostRegistry {
    /// Create a new host registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function, replacing any with the same name
    pub fn register(&mut self, func: HostFunction) {
        self.functions.insert(func.name.clone(), func);
    }

    /// Get a function by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }

    /// Check if a function exists
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// List all registered function names, sorted
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

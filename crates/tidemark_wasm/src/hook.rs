//! Scoped interception of guest-to-host traffic.
//!
//! A guest owns one [`HookSlot`]. A session installs its interceptor and
//! holds the returned [`HookGuard`]; dropping the guard detaches it. Only one
//! interceptor may be attached at a time.

use crate::instance::GuestInstance;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tidemark_core::{CallOutcome, TraceError, TraceResult, Value};
use tidemark_trace::Scalar;
use tracing::{debug, warn};

/// Invokes the real host implementation of a callback
pub type HostInvoke<'a> = dyn FnMut(&[Value]) -> CallOutcome + 'a;

/// Observer and arbiter of guest-to-host calls and host writes into guest
/// memory
pub trait CallbackInterceptor {
    /// Handle a callback from `guest`. Implementations either run `host` and
    /// pass its outcome through, or produce an outcome of their own.
    ///
    /// # Errors
    ///
    /// An error aborts the guest's current export
    fn intercept(
        &self,
        guest: &dyn GuestInstance,
        method: &str,
        args: &[Value],
        host: &mut HostInvoke<'_>,
    ) -> TraceResult<CallOutcome>;

    /// Host code copied `bytes` into guest memory at `address`
    fn on_bulk_write(&self, _guest: &dyn GuestInstance, _address: u32, _bytes: &[u8]) {}

    /// Host code stored one element into guest memory at `address`
    fn on_indexed_write(&self, _guest: &dyn GuestInstance, _address: u32, _value: Scalar) {}
}

/// Shared, single-occupancy holder for an interceptor
#[derive(Clone, Default)]
pub struct HookSlot {
    inner: Rc<RefCell<Option<Rc<dyn CallbackInterceptor>>>>,
}

impl HookSlot {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `interceptor` until the returned guard is dropped
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::AlreadyAttached`] if the slot is occupied
    pub fn install(&self, interceptor: Rc<dyn CallbackInterceptor>) -> TraceResult<HookGuard> {
        let mut slot = self
            .inner
            .try_borrow_mut()
            .map_err(|_| TraceError::InvalidState("hook slot is in use".to_string()))?;
        if slot.is_some() {
            return Err(TraceError::AlreadyAttached);
        }
        *slot = Some(interceptor);
        debug!("Interceptor attached");
        Ok(HookGuard { slot: self.clone() })
    }

    /// The attached interceptor, if any
    #[must_use]
    pub fn current(&self) -> Option<Rc<dyn CallbackInterceptor>> {
        self.inner.borrow().clone()
    }

    /// Whether an interceptor is attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.borrow().is_some()
    }
}

impl fmt::Debug for HookSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Detaches its interceptor when dropped
#[must_use = "dropping the guard detaches the interceptor"]
pub struct HookGuard {
    slot: HookSlot,
}

impl HookGuard {
    /// Detach now
    pub fn detach(self) {}
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        match self.slot.inner.try_borrow_mut() {
            Ok(mut slot) => {
                slot.take();
                debug!("Interceptor detached");
            }
            Err(_) => warn!("Hook slot borrowed during detach; interceptor stays attached"),
        }
    }
}

impl fmt::Debug for HookGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookGuard").finish_non_exhaustive()
    }
}

//! TIDEMARK Guest Seams
//!
//! The guest instance abstraction driven by recording and replay sessions,
//! scoped interception hooks for guest-to-host calls, page-granular linear
//! memory, and an in-process reference guest built from closures.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hook;
pub mod host;
pub mod instance;
pub mod memory;
pub mod module;

pub use hook::{CallbackInterceptor, HookGuard, HookSlot, HostInvoke};
pub use host::{HostContext, HostFn, HostFunction, HostRegistry};
pub use instance::{GuestError, GuestInstance};
pub use memory::{LinearMemory, MemoryLimit, PAGE_SIZE};
pub use module::{ExportFn, GuestModule, ModuleConfig};

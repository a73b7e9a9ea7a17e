//! TIDEMARK Core Types
//!
//! Values, identifiers, configuration and the error taxonomy shared by the
//! recorder and the replayer. This crate performs no I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod id;
pub mod memory;
pub mod value;

// Re-exports
pub use config::{DirectionFilter, InternLimits, TraceConfig};
pub use error::{AllocationError, MemoryError, ProtocolError, TraceError, TraceResult};
pub use id::{AllocationId, Direction, MethodIndex};
pub use memory::GuestMemory;
pub use value::{CallOutcome, Value};

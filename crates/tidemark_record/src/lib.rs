//! TIDEMARK Recorder
//!
//! Captures every crossing of a guest/host boundary into a self-contained
//! trace: host-to-guest calls, guest-to-host callbacks, their outcomes, and
//! host writes into guest memory.
//!
//! Pointers are stored relative to the allocations they point into, so a
//! replay can run against a guest whose allocator hands out different
//! addresses.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod recorder;
pub mod session;

// Re-exports
pub use recorder::{Recorder, RecorderState, RecorderStats};
pub use session::{record, RecordingSession};

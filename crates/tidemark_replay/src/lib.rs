//! TIDEMARK Replay Engine
//!
//! Drives a fresh guest instance from a recorded boundary trace. Calls are
//! issued in recorded order, callbacks are answered from the trace, and
//! pointers are rebased onto the new instance's allocations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod state;
pub mod validate;

pub use config::{CompareOptions, ReplayConfig};
pub use engine::Replayer;
pub use state::{LooseEnd, ReplayState, ReplayStats};
pub use validate::{compare_args, values_match, ValueMismatch};

use tidemark_core::{TraceError, TraceResult};
use tidemark_wasm::GuestInstance;

/// Result of [`replay`]
#[derive(Debug)]
pub enum ReplayOutcome {
    /// Every event was replayed
    Ended(ReplayStats),
    /// Replay is paused at a top-level callback. The replayer stays attached
    /// and resumes when the guest makes the callback.
    LooseEnd {
        /// What the replayer is waiting for
        token: LooseEnd,
        /// The attached replayer
        replayer: Replayer,
    },
}

impl ReplayOutcome {
    /// Whether the whole trace was replayed
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        matches!(self, Self::Ended(_))
    }
}

/// Replay `bytes` against `guest` with the default configuration
///
/// # Errors
///
/// Returns error if the trace is malformed or the guest diverges from it
pub fn replay(bytes: &[u8], guest: &dyn GuestInstance) -> TraceResult<ReplayOutcome> {
    replay_with(bytes, guest, ReplayConfig::default())
}

/// Replay `bytes` against `guest`
///
/// # Errors
///
/// Returns error if the trace is malformed or the guest diverges from it
pub fn replay_with(
    bytes: &[u8],
    guest: &dyn GuestInstance,
    config: ReplayConfig,
) -> TraceResult<ReplayOutcome> {
    let mut replayer = Replayer::from_bytes(bytes, config)?;
    match replayer.start(guest)? {
        ReplayState::WaitingForCallback => {
            let token = replayer.loose_end().ok_or_else(|| {
                TraceError::InvalidState("waiting without a loose end".to_string())
            })?;
            Ok(ReplayOutcome::LooseEnd { token, replayer })
        }
        _ => replayer.finish().map(ReplayOutcome::Ended),
    }
}

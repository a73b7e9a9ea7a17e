//! Replayer states and bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replayer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplayState {
    /// Created, not started
    Idle,
    /// Consuming events
    Running,
    /// Paused at a top-level callback until the guest issues it
    WaitingForCallback,
    /// Stream exhausted with no open frames
    Ended,
    /// A fatal error stopped the replay
    Failed,
}

impl ReplayState {
    /// Whether the replayer can make no further progress
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingForCallback => "waiting-for-callback",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Resumption token for a loose end.
///
/// Replay resumes when the guest issues the callback named here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LooseEnd {
    /// Callback the replayer is waiting for
    pub method: String,
    /// Index of its enter event in the stream
    pub event_index: usize,
    /// Byte offset of that event in the trace file
    pub offset: usize,
}

impl fmt::Display for LooseEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "waiting for callback '{}' (event {} at offset {})",
            self.method, self.event_index, self.offset
        )
    }
}

/// Replay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    /// Events consumed
    pub events: usize,
    /// Exports invoked on the guest
    pub calls: usize,
    /// Callbacks answered from the trace
    pub callbacks: usize,
    /// Callbacks under another callback, consumed without the guest
    pub virtual_callbacks: usize,
    /// Callbacks forwarded to the real host
    pub passthrough: usize,
    /// Memory writes applied
    pub writes: usize,
    /// Callback or return values that differed from the trace
    pub argument_mismatches: usize,
    /// Loose ends reached
    pub loose_ends: usize,
}

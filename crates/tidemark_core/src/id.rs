//! Identifiers used on the trace wire.
//!
//! Allocation ids are local to one allocation map: recording-time ids and
//! replay-time ids are never compared with each other.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Allocation identifier - dense, monotonically increasing per map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(u32);

impl AllocationId {
    /// Create from a raw id
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw id
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Wire reference for this id (`id + 1`, since 0 encodes null)
    #[must_use]
    pub const fn wire_ref(&self) -> u32 {
        self.0 + 1
    }

    /// Decode a non-null, non-static wire reference
    #[must_use]
    pub const fn from_wire_ref(wire: u32) -> Option<Self> {
        match wire {
            0 => None,
            n => Some(Self(n - 1)),
        }
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc_{}", self.0)
    }
}

/// Index of a method name in the string table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodIndex(u32);

impl MethodIndex {
    /// Create from a raw string table index
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw index
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Get the index as a `usize`
    #[must_use]
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MethodIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a boundary crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Host calls into a guest export
    Call,
    /// Guest calls back into a host import
    Callback,
}

impl Direction {
    /// Both directions, call first
    pub const ALL: [Direction; 2] = [Direction::Call, Direction::Callback];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Callback => write!(f, "callback"),
        }
    }
}

//! The guest seam used by recording and replay sessions.

use crate::hook::HookSlot;
use tidemark_core::{CallOutcome, GuestMemory, MemoryError, TraceError, Value};

/// Failures surfaced by a guest instance
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuestError {
    /// No export with this name
    #[error("Guest has no export '{0}'")]
    MissingExport(String),

    /// No host implementation for an import the guest called
    #[error("No host implementation for import '{0}'")]
    MissingImport(String),

    /// The guest trapped
    #[error("Guest trapped: {0}")]
    Trap(String),

    /// A host callback threw and the guest did not catch it
    #[error("Host callback threw: {0}")]
    Threw(String),

    /// Guest memory access failed
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// An attached session stopped the guest
    #[error("Guest execution aborted: {0}")]
    Aborted(String),
}

impl GuestError {
    /// Whether the error is an exception visible to the caller of an export,
    /// as opposed to a failure of the embedding
    #[must_use]
    pub const fn is_throw(&self) -> bool {
        matches!(self, Self::Trap(_) | Self::Threw(_))
    }

    /// Convert an export result into a boundary outcome.
    ///
    /// # Errors
    ///
    /// Returns the error unchanged if it is not a guest-visible throw
    pub fn into_outcome(result: Result<Value, Self>) -> Result<CallOutcome, Self> {
        match result {
            Ok(value) => Ok(CallOutcome::Returned(value)),
            Err(e) if e.is_throw() => Ok(CallOutcome::Threw(e.to_string())),
            Err(e) => Err(e),
        }
    }
}

impl From<GuestError> for TraceError {
    fn from(err: GuestError) -> Self {
        match err {
            GuestError::Memory(e) => Self::Memory(e),
            other => Self::Guest(other.to_string()),
        }
    }
}

/// A live guest: exports, linear memory, and an interception hook slot.
///
/// All methods take `&self`. A guest may call back into the host while one
/// of its exports is running, and the host may call another export from
/// inside that callback.
pub trait GuestInstance: GuestMemory {
    /// Invoke an export
    ///
    /// # Errors
    ///
    /// Returns error if the export is missing, traps, or lets a host
    /// exception escape
    fn call_export(&self, name: &str, args: &[Value]) -> Result<Value, GuestError>;

    /// Whether an export exists
    fn has_export(&self, name: &str) -> bool;

    /// Slot through which guest-to-host calls are intercepted
    fn hooks(&self) -> &HookSlot;

    /// This instance as plain memory
    fn memory(&self) -> &dyn GuestMemory;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_outcome() {
        assert_eq!(
            GuestError::into_outcome(Ok(Value::U32(1))).unwrap(),
            CallOutcome::Returned(Value::U32(1))
        );
        assert!(GuestError::into_outcome(Err(GuestError::Trap("unreachable".into())))
            .unwrap()
            .is_throw());
        assert_eq!(
            GuestError::into_outcome(Err(GuestError::MissingExport("f".into()))),
            Err(GuestError::MissingExport("f".into()))
        );
    }

    #[test]
    fn test_trace_error_conversion() {
        let err: TraceError = GuestError::Aborted("replay failed".into()).into();
        assert!(matches!(err, TraceError::Guest(_)));
        let err: TraceError = GuestError::Memory(MemoryError::OutOfBounds {
            address: 4,
            len: 4,
            size: 4,
        })
        .into();
        assert!(matches!(err, TraceError::Memory(_)));
    }
}

//! Error taxonomy shared by the recorder and the replayer.
//!
//! Every variant is fatal for the trace or replay session it occurs in.
//! Nothing is retried automatically.

use crate::id::Direction;

/// Core result type
pub type TraceResult<T> = Result<T, TraceError>;

/// Malformed or unsupported trace data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// File does not start with the magic signature
    #[error("Invalid magic signature")]
    InvalidMagic,

    /// Format version is not supported by this build
    #[error("Unsupported trace format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    /// Buffer ended before a complete item could be read
    #[error("Truncated buffer at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A value kind byte is not recognized
    #[error("Unknown value kind byte 0x{byte:02X} at offset {offset}")]
    UnknownKind { byte: u8, offset: usize },

    /// An event tag is not recognized
    #[error("Unknown event tag {tag} at offset {offset}")]
    UnknownEventTag { tag: u8, offset: usize },

    /// A string index points past the end of the string table
    #[error("String index {index} out of range ({count} strings)")]
    StringIndexOutOfRange { index: u32, count: usize },

    /// A string table entry is not valid UTF-8
    #[error("String table entry {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    /// A type map is declared twice for one method
    #[error("Duplicate {direction} type map for method index {method}")]
    DuplicateTypeMap { direction: Direction, method: u32 },

    /// A type map has no return slot
    #[error("Empty type map for method index {method}")]
    EmptyTypeMap { method: u32 },

    /// No type map exists for a method referenced by an event
    #[error("No {direction} type map for method '{method}'")]
    MissingTypeMap { direction: Direction, method: String },

    /// A value cannot be represented by its declared kind
    #[error("Value {value} does not fit kind {kind}")]
    ValueKindMismatch { kind: String, value: String },

    /// An observed return value disagrees with the declared return kind
    #[error("Return kind mismatch for '{method}': declared {declared}, observed {observed}")]
    ReturnKindMismatch {
        method: String,
        declared: String,
        observed: String,
    },

    /// Argument count differs from the type map
    #[error("Arity mismatch for '{method}': type map declares {expected} arguments, got {actual}")]
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// A memory write event targets the null reference
    #[error("Memory write at offset {offset} targets a null reference")]
    NullWriteTarget { offset: usize },

    /// The string table reached its configured limit
    #[error("String table is full ({limit} entries)")]
    StringTableFull { limit: usize },

    /// An interned string exceeds the configured length limit
    #[error("String of {len} bytes exceeds intern limit of {limit} bytes")]
    StringTooLong { len: usize, limit: usize },

    /// A length or count does not fit the wire format
    #[error("Length {len} does not fit a u32 field")]
    LengthOverflow { len: usize },
}

/// Invalid allocation references or ranges.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// The id was never handed out by this map
    #[error("Unknown allocation id {id}")]
    UnknownId { id: u32 },

    /// The id was handed out but its allocation has been retired
    #[error("Allocation {id} has already been retired")]
    Retired { id: u32 },

    /// Relative offset is past the end of the allocation
    #[error("Offset {offset} out of bounds for allocation {id} of {size} bytes")]
    OutOfBounds { id: u32, offset: u32, size: u32 },

    /// A range end precedes its start or overflows the address space
    #[error("Invalid allocation range [0x{start:X}, 0x{end:X})")]
    InvalidRange { start: u64, end: u64 },

    /// A strided buffer header could not be interpreted
    #[error("Invalid buffer header at 0x{address:X}: {reason}")]
    InvalidHeader { address: u32, reason: String },
}

/// Guest memory access failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// Access extends past the end of linear memory
    #[error("Access of {len} bytes at 0x{address:X} is outside linear memory of {size} bytes")]
    OutOfBounds { address: u32, len: usize, size: u32 },

    /// Growing memory would exceed its configured maximum
    #[error("Memory size {requested} exceeds limit {limit}")]
    LimitExceeded { requested: u64, limit: u64 },
}

/// Umbrella error for recording and replay.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TraceError {
    /// Malformed trace or value
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Leave does not match the enter on top of the call stack
    #[error("Call stack mismatch: expected leave of {expected}, got {actual}")]
    StackMismatch { expected: String, actual: String },

    /// Bad allocation reference
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// Guest memory access failed
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Replayed behaviour disagrees with the recording
    #[error("Validation mismatch in '{method}': expected {expected}, got {actual}")]
    ValidationMismatch {
        method: String,
        expected: String,
        actual: String,
    },

    /// Recorder discarded its buffer after an earlier failure
    #[error("Trace corrupted: {reason}")]
    Corrupted { reason: String },

    /// Recorder was already finalized
    #[error("Trace already finalized")]
    Finalized,

    /// Another session already owns the guest's interception hooks
    #[error("Guest instance already has an attached trace session")]
    AlreadyAttached,

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Guest could not be driven
    #[error("Guest error: {0}")]
    Guest(String),

    /// Error annotated with its position in the event stream
    #[error("{source} (event at offset {offset}{})", describe_method(.method))]
    Context {
        offset: usize,
        method: Option<String>,
        source: Box<TraceError>,
    },
}

fn describe_method(method: &Option<String>) -> String {
    method
        .as_deref()
        .map(|m| format!(", method '{m}'"))
        .unwrap_or_default()
}

impl TraceError {
    /// Attach an event offset and method name.
    ///
    /// Errors that already carry context are returned unchanged.
    #[must_use]
    pub fn at(self, offset: usize, method: Option<&str>) -> Self {
        match self {
            Self::Context { .. } => self,
            other => Self::Context {
                offset,
                method: method.map(str::to_string),
                source: Box::new(other),
            },
        }
    }

    /// The error with any positional context stripped.
    #[must_use]
    pub fn root(&self) -> &TraceError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the root cause is a [`ProtocolError`].
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self.root(), Self::Protocol(_))
    }

    /// Whether the root cause is an [`AllocationError`].
    #[must_use]
    pub fn is_allocation(&self) -> bool {
        matches!(self.root(), Self::Allocation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TraceError::from(ProtocolError::InvalidMagic);
        assert_eq!(err.to_string(), "Invalid magic signature");

        let err = TraceError::from(AllocationError::Retired { id: 3 });
        assert_eq!(err.to_string(), "Allocation 3 has already been retired");
    }

    #[test]
    fn test_context_display() {
        let err = TraceError::from(ProtocolError::UnknownKind {
            byte: 0x42,
            offset: 10,
        })
        .at(96, Some("glDrawArrays"));
        let s = err.to_string();
        assert!(s.contains("0x42"));
        assert!(s.contains("offset 96"));
        assert!(s.contains("glDrawArrays"));
    }

    #[test]
    fn test_context_not_nested() {
        let err = TraceError::Finalized.at(1, None).at(2, Some("other"));
        match err {
            TraceError::Context { offset, method, .. } => {
                assert_eq!(offset, 1);
                assert!(method.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_root_classification() {
        let err = TraceError::from(AllocationError::UnknownId { id: 9 }).at(0, None);
        assert!(err.is_allocation());
        assert!(!err.is_protocol());
        assert_eq!(err.root(), &TraceError::Allocation(AllocationError::UnknownId { id: 9 }));
    }

    #[test]
    fn test_stack_mismatch_display() {
        let err = TraceError::StackMismatch {
            expected: "call 'alloc'".to_string(),
            actual: "call 'free'".to_string(),
        };
        let s = err.to_string();
        assert!(s.contains("alloc"));
        assert!(s.contains("free"));
    }
}

//! Value kind annotations.

use serde::{Deserialize, Serialize};
use std::fmt;
use tidemark_core::{ProtocolError, Value};

const FIXED_SIZE_FLAG: u8 = 0x80;

/// How a boundary value is encoded and what it means to the allocation map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// No value
    Void,
    /// Unsigned 32-bit integer
    Uint32,
    /// Signed 32-bit integer
    Int32,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Boolean
    Boolean,
    /// Interned string
    String,
    /// Address into guest memory
    Pointer,
    /// Address of an allocation being released
    FreedPointer,
    /// Start address of a new allocation
    AllocStart,
    /// Exclusive end address of a new allocation
    AllocEnd,
    /// Byte length of a new allocation
    AllocSize,
    /// Strided attribute buffer header address
    AttributeBuffer,
    /// Index buffer header address
    IndexBuffer,
    /// Address of a new allocation of `N` bytes
    FixedSizeAlloc(u8),
}

impl ValueKind {
    /// Wire byte for this kind
    #[must_use]
    pub const fn to_byte(&self) -> u8 {
        match self {
            Self::Void => 0,
            Self::Uint32 => 1,
            Self::Int32 => 2,
            Self::Float32 => 3,
            Self::Float64 => 4,
            Self::Boolean => 5,
            Self::String => 6,
            Self::Pointer => 7,
            Self::FreedPointer => 8,
            Self::AllocStart => 9,
            Self::AllocEnd => 10,
            Self::AllocSize => 11,
            Self::AttributeBuffer => 12,
            Self::IndexBuffer => 13,
            Self::FixedSizeAlloc(n) => FIXED_SIZE_FLAG | (*n & 0x7F),
        }
    }

    /// Parse a wire byte read at `offset`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownKind`] for unassigned bytes, including
    /// a fixed-size allocation of zero bytes.
    pub const fn from_byte(byte: u8, offset: usize) -> Result<Self, ProtocolError> {
        let kind = match byte {
            0 => Self::Void,
            1 => Self::Uint32,
            2 => Self::Int32,
            3 => Self::Float32,
            4 => Self::Float64,
            5 => Self::Boolean,
            6 => Self::String,
            7 => Self::Pointer,
            8 => Self::FreedPointer,
            9 => Self::AllocStart,
            10 => Self::AllocEnd,
            11 => Self::AllocSize,
            12 => Self::AttributeBuffer,
            13 => Self::IndexBuffer,
            b if b & FIXED_SIZE_FLAG != 0 && b & 0x7F != 0 => Self::FixedSizeAlloc(b & 0x7F),
            _ => return Err(ProtocolError::UnknownKind { byte, offset }),
        };
        Ok(kind)
    }

    /// Whether the kind is resolved through the allocation map
    #[must_use]
    pub const fn is_pointer_family(&self) -> bool {
        matches!(self, Self::Pointer | Self::FreedPointer)
    }

    /// Whether the kind feeds allocation reconciliation
    #[must_use]
    pub const fn is_alloc_boundary(&self) -> bool {
        matches!(
            self,
            Self::AllocStart
                | Self::AllocEnd
                | Self::AllocSize
                | Self::FixedSizeAlloc(_)
                | Self::AttributeBuffer
                | Self::IndexBuffer
        )
    }

    /// Whether `value` can be carried by this kind without loss.
    ///
    /// Integer kinds accept both signednesses as a bit reinterpretation;
    /// address-shaped kinds accept anything usable as an address.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Void, Value::Void)
            | (Self::Boolean, Value::Bool(_))
            | (Self::Float32, Value::F32(_))
            | (Self::Float64, Value::F64(_))
            | (Self::String, Value::String(_))
            | (Self::Uint32 | Self::Int32, Value::U32(_) | Value::I32(_)) => true,
            (kind, v) if kind.is_pointer_family() || kind.is_alloc_boundary() => {
                v.as_address().is_some()
            }
            _ => false,
        }
    }

    /// Kind inferred from the runtime variant of an untyped value
    #[must_use]
    pub const fn infer(value: &Value) -> Self {
        match value {
            Value::Void => Self::Void,
            Value::Bool(_) => Self::Boolean,
            Value::U32(_) => Self::Uint32,
            Value::I32(_) => Self::Int32,
            Value::F32(_) => Self::Float32,
            Value::F64(_) => Self::Float64,
            Value::String(_) => Self::String,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::Uint32 => write!(f, "u32"),
            Self::Int32 => write!(f, "i32"),
            Self::Float32 => write!(f, "f32"),
            Self::Float64 => write!(f, "f64"),
            Self::Boolean => write!(f, "bool"),
            Self::String => write!(f, "string"),
            Self::Pointer => write!(f, "ptr"),
            Self::FreedPointer => write!(f, "freed_ptr"),
            Self::AllocStart => write!(f, "alloc_start"),
            Self::AllocEnd => write!(f, "alloc_end"),
            Self::AllocSize => write!(f, "alloc_size"),
            Self::AttributeBuffer => write!(f, "attribute_buffer"),
            Self::IndexBuffer => write!(f, "index_buffer"),
            Self::FixedSizeAlloc(n) => write!(f, "fixed_alloc({n})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_size_byte() {
        assert_eq!(ValueKind::FixedSizeAlloc(16).to_byte(), 0x90);
        assert_eq!(
            ValueKind::from_byte(0x90, 0).unwrap(),
            ValueKind::FixedSizeAlloc(16)
        );
        assert!(ValueKind::from_byte(0x80, 3).is_err());
    }

    #[test]
    fn test_unknown_byte() {
        assert_eq!(
            ValueKind::from_byte(14, 9),
            Err(ProtocolError::UnknownKind { byte: 14, offset: 9 })
        );
    }

    #[test]
    fn test_accepts() {
        assert!(ValueKind::Uint32.accepts(&Value::I32(-1)));
        assert!(ValueKind::Pointer.accepts(&Value::F64(64.0)));
        assert!(ValueKind::AllocSize.accepts(&Value::U32(16)));
        assert!(!ValueKind::Float32.accepts(&Value::F64(1.0)));
        assert!(!ValueKind::Void.accepts(&Value::U32(0)));
        assert!(!ValueKind::Boolean.accepts(&Value::U32(1)));
        assert!(!ValueKind::Pointer.accepts(&Value::String("0".into())));
    }

    #[test]
    fn test_infer() {
        assert_eq!(ValueKind::infer(&Value::F64(1.0)), ValueKind::Float64);
        assert_eq!(ValueKind::infer(&Value::Bool(false)), ValueKind::Boolean);
        assert_eq!(ValueKind::infer(&Value::Void), ValueKind::Void);
    }

    #[test]
    fn test_families() {
        assert!(ValueKind::FreedPointer.is_pointer_family());
        assert!(!ValueKind::FreedPointer.is_alloc_boundary());
        assert!(ValueKind::FixedSizeAlloc(4).is_alloc_boundary());
        assert!(!ValueKind::Uint32.is_alloc_boundary());
    }

    proptest! {
        #[test]
        fn test_every_assigned_byte_is_stable(byte in any::<u8>()) {
            if let Ok(kind) = ValueKind::from_byte(byte, 0) {
                prop_assert_eq!(kind.to_byte(), byte);
            }
        }
    }
}

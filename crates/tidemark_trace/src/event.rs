//! Event types for the trace stream.
//!
//! Events are appended in the order the recorder observes them and are
//! replayed in the same order.

use crate::codec::{write_wire, AddressRef, WireValue};
use crate::encoding::{ByteReader, ByteWriter, WireEncode};
use serde::{Deserialize, Serialize};
use std::fmt;
use tidemark_core::{Direction, MethodIndex, ProtocolError};

/// Event tag on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Guest calls a host import (tag 0)
    CallbackEnter,
    /// Host calls a guest export (tag 1)
    CallEnter,
    /// Innermost crossing threw (tag 2)
    Throw,
    /// Innermost crossing returned (tag 3)
    Return,
    /// Raw bytes written to guest memory (tag 4)
    BulkWrite,
    /// One element written to guest memory (tags 5 to 12)
    IndexedWrite(ScalarType),
}

impl EventKind {
    /// Wire tag
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::CallbackEnter => 0,
            Self::CallEnter => 1,
            Self::Throw => 2,
            Self::Return => 3,
            Self::BulkWrite => 4,
            Self::IndexedWrite(ty) => ty.tag(),
        }
    }

    /// Parse a tag read at `offset`
    ///
    /// # Errors
    ///
    /// Returns error for unassigned tags
    pub const fn from_tag(tag: u8, offset: usize) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::CallbackEnter),
            1 => Ok(Self::CallEnter),
            2 => Ok(Self::Throw),
            3 => Ok(Self::Return),
            4 => Ok(Self::BulkWrite),
            _ => match ScalarType::from_tag(tag) {
                Some(ty) => Ok(Self::IndexedWrite(ty)),
                None => Err(ProtocolError::UnknownEventTag { tag, offset }),
            },
        }
    }

    /// Enter kind for a direction
    #[must_use]
    pub const fn enter(direction: Direction) -> Self {
        match direction {
            Direction::Call => Self::CallEnter,
            Direction::Callback => Self::CallbackEnter,
        }
    }

    /// Opens a frame
    pub const fn is_enter(self) -> bool {
        matches!(self, Self::CallEnter | Self::CallbackEnter)
    }

    /// Closes a frame
    pub const fn is_leave(self) -> bool {
        matches!(self, Self::Return | Self::Throw)
    }

    /// Mutates guest memory
    pub const fn is_write(self) -> bool {
        matches!(self, Self::BulkWrite | Self::IndexedWrite(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallbackEnter => write!(f, "callback"),
            Self::CallEnter => write!(f, "call"),
            Self::Throw => write!(f, "throw"),
            Self::Return => write!(f, "return"),
            Self::BulkWrite => write!(f, "bulk_write"),
            Self::IndexedWrite(ty) => write!(f, "write_{ty}"),
        }
    }
}

/// Element type of an indexed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    /// Unsigned byte
    U8,
    /// Signed byte
    I8,
    /// Unsigned 16-bit
    U16,
    /// Signed 16-bit
    I16,
    /// Unsigned 32-bit
    U32,
    /// Signed 32-bit
    I32,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl ScalarType {
    /// Event tag carrying this type
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::U8 => 5,
            Self::I8 => 6,
            Self::U16 => 7,
            Self::I16 => 8,
            Self::U32 => 9,
            Self::I32 => 10,
            Self::F32 => 11,
            Self::F64 => 12,
        }
    }

    /// Type for an event tag
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            5 => Some(Self::U8),
            6 => Some(Self::I8),
            7 => Some(Self::U16),
            8 => Some(Self::I16),
            9 => Some(Self::U32),
            10 => Some(Self::I32),
            11 => Some(Self::F32),
            12 => Some(Self::F64),
            _ => None,
        }
    }

    /// Width in bytes
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A single typed element stored into guest memory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    /// Unsigned byte
    U8(u8),
    /// Signed byte
    I8(i8),
    /// Unsigned 16-bit
    U16(u16),
    /// Signed 16-bit
    I16(i16),
    /// Unsigned 32-bit
    U32(u32),
    /// Signed 32-bit
    I32(i32),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
}

impl Scalar {
    /// Element type
    #[must_use]
    pub const fn scalar_type(&self) -> ScalarType {
        match self {
            Self::U8(_) => ScalarType::U8,
            Self::I8(_) => ScalarType::I8,
            Self::U16(_) => ScalarType::U16,
            Self::I16(_) => ScalarType::I16,
            Self::U32(_) => ScalarType::U32,
            Self::I32(_) => ScalarType::I32,
            Self::F32(_) => ScalarType::F32,
            Self::F64(_) => ScalarType::F64,
        }
    }

    /// Little-endian bytes as stored in guest memory
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match *self {
            Self::U8(v) => v.to_le_bytes().to_vec(),
            Self::I8(v) => v.to_le_bytes().to_vec(),
            Self::U16(v) => v.to_le_bytes().to_vec(),
            Self::I16(v) => v.to_le_bytes().to_vec(),
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::I32(v) => v.to_le_bytes().to_vec(),
            Self::F32(v) => v.to_le_bytes().to_vec(),
            Self::F64(v) => v.to_le_bytes().to_vec(),
        }
    }

    /// Read a payload of type `ty`
    ///
    /// # Errors
    ///
    /// Returns error on truncated input
    pub fn read(r: &mut ByteReader<'_>, ty: ScalarType) -> Result<Self, ProtocolError> {
        let bytes = r.get_bytes(ty.width())?;
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let value = match ty {
            ScalarType::U8 => Self::U8(buf[0]),
            ScalarType::I8 => Self::I8(i8::from_le_bytes([buf[0]])),
            ScalarType::U16 => Self::U16(u16::from_le_bytes([buf[0], buf[1]])),
            ScalarType::I16 => Self::I16(i16::from_le_bytes([buf[0], buf[1]])),
            ScalarType::U32 => Self::U32(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            ScalarType::I32 => Self::I32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            ScalarType::F32 => Self::F32(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            ScalarType::F64 => Self::F64(f64::from_le_bytes(buf)),
        };
        Ok(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v}u8"),
            Self::I8(v) => write!(f, "{v}i8"),
            Self::U16(v) => write!(f, "{v}u16"),
            Self::I16(v) => write!(f, "{v}i16"),
            Self::U32(v) => write!(f, "{v}u32"),
            Self::I32(v) => write!(f, "{v}i32"),
            Self::F32(v) => write!(f, "{v}f32"),
            Self::F64(v) => write!(f, "{v}f64"),
        }
    }
}

/// A decoded trace event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// A call or callback begins
    Enter {
        /// Boundary direction
        direction: Direction,
        /// Interned method name
        method: MethodIndex,
        /// Arguments in wire form
        args: Vec<WireValue>,
    },
    /// The innermost crossing returned
    Return {
        /// Return value in wire form
        value: WireValue,
    },
    /// The innermost crossing threw
    Throw,
    /// Raw bytes copied into guest memory
    BulkWrite {
        /// Destination
        target: AddressRef,
        /// Payload
        bytes: Vec<u8>,
    },
    /// One element stored into guest memory
    IndexedWrite {
        /// Destination
        target: AddressRef,
        /// Element
        value: Scalar,
    },
}

impl Event {
    /// Wire tag
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Enter { direction, .. } => EventKind::enter(*direction),
            Self::Return { .. } => EventKind::Return,
            Self::Throw => EventKind::Throw,
            Self::BulkWrite { .. } => EventKind::BulkWrite,
            Self::IndexedWrite { value, .. } => EventKind::IndexedWrite(value.scalar_type()),
        }
    }

    /// Whether this opens a frame
    pub const fn is_enter(&self) -> bool {
        self.kind().is_enter()
    }

    /// Whether this closes a frame
    pub const fn is_leave(&self) -> bool {
        self.kind().is_leave()
    }
}

impl WireEncode for Event {
    fn encode(&self, w: &mut ByteWriter) -> Result<(), ProtocolError> {
        w.put_u8(self.kind().tag());
        match self {
            Self::Enter { method, args, .. } => {
                w.put_u32(method.as_u32());
                for arg in args {
                    write_wire(w, arg);
                }
            }
            Self::Return { value } => write_wire(w, value),
            Self::Throw => {}
            Self::BulkWrite { target, bytes } => {
                target.write(w);
                w.put_len(bytes.len())?;
                w.put_bytes(bytes);
            }
            Self::IndexedWrite { target, value } => {
                target.write(w);
                w.put_bytes(&value.to_le_bytes());
            }
        }
        Ok(())
    }
}

/// An event and the byte offset of its tag in the trace file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedEvent {
    /// Offset from the start of the file
    pub offset: usize,
    /// The event
    pub event: Event,
}

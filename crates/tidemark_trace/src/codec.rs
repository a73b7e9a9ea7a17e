//! Value codec: live values to portable wire values and back.
//!
//! Encoding and decoding are split in two layers. [`read_wire`] and
//! [`write_wire`] move [`WireValue`]s to and from bytes and need only the
//! kind. [`encode_value`] and [`decode_value`] translate between live values
//! and wire values, consulting the string table and the allocation map.

use crate::alloc::AllocationMap;
use crate::encoding::{ByteReader, ByteWriter};
use crate::kind::ValueKind;
use crate::strings::{StringInterner, StringTable};
use serde::{Deserialize, Serialize};
use std::fmt;
use tidemark_core::{AllocationId, ProtocolError, TraceResult, Value};

const STATIC_REF: u32 = u32::MAX;

/// Portable reference to a guest address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressRef {
    /// Address zero
    Null,
    /// Offset into a tracked allocation
    Allocation {
        /// Allocation id
        id: AllocationId,
        /// Offset from the allocation's start
        offset: u32,
    },
    /// Absolute address outside every tracked allocation
    Static(u32),
}

impl AddressRef {
    /// Read a reference
    ///
    /// # Errors
    ///
    /// Returns error on truncated input
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        let raw = r.get_u32()?;
        if raw == STATIC_REF {
            return Ok(Self::Static(r.get_u32()?));
        }
        match AllocationId::from_wire_ref(raw) {
            None => Ok(Self::Null),
            Some(id) => Ok(Self::Allocation {
                id,
                offset: r.get_u32()?,
            }),
        }
    }

    /// Write a reference
    pub fn write(&self, w: &mut ByteWriter) {
        match self {
            Self::Null => w.put_u32(0),
            Self::Allocation { id, offset } => {
                w.put_u32(id.wire_ref());
                w.put_u32(*offset);
            }
            Self::Static(address) => {
                w.put_u32(STATIC_REF);
                w.put_u32(*address);
            }
        }
    }

    /// Reference for a pointer value as seen by `alloc`
    #[must_use]
    pub fn for_address(address: u32, alloc: &AllocationMap) -> Self {
        if address == 0 {
            return Self::Null;
        }
        match alloc.id_from_address(address) {
            Some((id, offset)) => Self::Allocation { id, offset },
            None => Self::Static(address),
        }
    }

    /// Absolute address in `alloc`
    ///
    /// # Errors
    ///
    /// Returns error if the allocation is unknown, retired, or too small
    pub fn resolve(&self, alloc: &AllocationMap) -> TraceResult<u32> {
        match *self {
            Self::Null => Ok(0),
            Self::Allocation { id, offset } => Ok(alloc.address_of(id, offset)?),
            Self::Static(address) => Ok(address),
        }
    }
}

impl fmt::Display for AddressRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Allocation { id, offset } => write!(f, "{id}+{offset}"),
            Self::Static(address) => write!(f, "static@0x{address:X}"),
        }
    }
}

/// A value in its on-wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    /// Nothing on the wire
    Void,
    /// Unsigned 32-bit integer, also used by allocation-boundary kinds
    U32(u32),
    /// Signed 32-bit integer
    I32(i32),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Boolean byte
    Bool(bool),
    /// String table index
    Str(u32),
    /// Pointer-family reference
    Ref(AddressRef),
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::U32(v) => write!(f, "{v}u32"),
            Self::I32(v) => write!(f, "{v}i32"),
            Self::F32(v) => write!(f, "{v}f32"),
            Self::F64(v) => write!(f, "{v}f64"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(i) => write!(f, "str#{i}"),
            Self::Ref(r) => write!(f, "{r}"),
        }
    }
}

/// Read one value of `kind`
///
/// # Errors
///
/// Returns error on truncated input
pub fn read_wire(r: &mut ByteReader<'_>, kind: ValueKind) -> Result<WireValue, ProtocolError> {
    let value = match kind {
        ValueKind::Void => WireValue::Void,
        ValueKind::Int32 => WireValue::I32(r.get_i32()?),
        ValueKind::Float32 => WireValue::F32(r.get_f32()?),
        ValueKind::Float64 => WireValue::F64(r.get_f64()?),
        ValueKind::Boolean => WireValue::Bool(r.get_u8()? != 0),
        ValueKind::String => WireValue::Str(r.get_u32()?),
        ValueKind::Pointer | ValueKind::FreedPointer => WireValue::Ref(AddressRef::read(r)?),
        ValueKind::Uint32
        | ValueKind::AllocStart
        | ValueKind::AllocEnd
        | ValueKind::AllocSize
        | ValueKind::AttributeBuffer
        | ValueKind::IndexBuffer
        | ValueKind::FixedSizeAlloc(_) => WireValue::U32(r.get_u32()?),
    };
    Ok(value)
}

/// Write one value. The caller guarantees it was produced for the same kind.
pub fn write_wire(w: &mut ByteWriter, value: &WireValue) {
    match value {
        WireValue::Void => {}
        WireValue::U32(v) | WireValue::Str(v) => w.put_u32(*v),
        WireValue::I32(v) => w.put_i32(*v),
        WireValue::F32(v) => w.put_f32(*v),
        WireValue::F64(v) => w.put_f64(*v),
        WireValue::Bool(v) => w.put_u8(u8::from(*v)),
        WireValue::Ref(r) => r.write(w),
    }
}

fn mismatch(kind: ValueKind, value: &Value) -> ProtocolError {
    ProtocolError::ValueKindMismatch {
        kind: kind.to_string(),
        value: value.to_string(),
    }
}

/// Translate a live value to its wire form.
///
/// A freed pointer that starts a tracked allocation retires it.
///
/// # Errors
///
/// Returns error if the value does not fit `kind`, interning fails, or a
/// retirement is rejected
pub fn encode_value(
    value: &Value,
    kind: ValueKind,
    alloc: &mut AllocationMap,
    interner: &mut StringInterner,
) -> TraceResult<WireValue> {
    if !kind.accepts(value) {
        return Err(mismatch(kind, value).into());
    }
    let wire = match (kind, value) {
        (ValueKind::Void, _) => WireValue::Void,
        (ValueKind::Boolean, Value::Bool(b)) => WireValue::Bool(*b),
        (ValueKind::Float32, Value::F32(v)) => WireValue::F32(*v),
        (ValueKind::Float64, Value::F64(v)) => WireValue::F64(*v),
        (ValueKind::String, Value::String(s)) => WireValue::Str(interner.intern(s)?),
        (ValueKind::Int32, Value::I32(v)) => WireValue::I32(*v),
        (ValueKind::Int32, Value::U32(v)) => WireValue::I32(*v as i32),
        (ValueKind::FreedPointer, v) => {
            let address = v.as_address().ok_or_else(|| mismatch(kind, value))?;
            match alloc.id_from_start(address) {
                Some(id) => {
                    alloc.retire(id)?;
                    WireValue::Ref(AddressRef::Allocation { id, offset: 0 })
                }
                None => WireValue::Ref(AddressRef::for_address(address, alloc)),
            }
        }
        (ValueKind::Pointer, v) => {
            let address = v.as_address().ok_or_else(|| mismatch(kind, value))?;
            WireValue::Ref(AddressRef::for_address(address, alloc))
        }
        (_, v) => WireValue::U32(v.as_address().ok_or_else(|| mismatch(kind, value))?),
    };
    Ok(wire)
}

/// Translate a wire value back to a live value.
///
/// Pointers resolve against `alloc`. A freed pointer at the start of a
/// tracked allocation retires it, so decoding the same one twice fails. A
/// freed pointer into the middle of one resolves like a plain pointer.
///
/// # Errors
///
/// Returns error on string index or allocation lookup failures, or when the
/// wire form does not belong to `kind`
pub fn decode_value(
    wire: &WireValue,
    kind: ValueKind,
    alloc: &mut AllocationMap,
    strings: &StringTable,
) -> TraceResult<Value> {
    let value = match (kind, wire) {
        (ValueKind::Void, WireValue::Void) => Value::Void,
        (ValueKind::Boolean, WireValue::Bool(b)) => Value::Bool(*b),
        (ValueKind::Float32, WireValue::F32(v)) => Value::F32(*v),
        (ValueKind::Float64, WireValue::F64(v)) => Value::F64(*v),
        (ValueKind::Int32, WireValue::I32(v)) => Value::I32(*v),
        (ValueKind::String, WireValue::Str(i)) => Value::String(strings.get(*i)?.to_string()),
        (ValueKind::Pointer, WireValue::Ref(r)) => Value::U32(r.resolve(alloc)?),
        (ValueKind::FreedPointer, WireValue::Ref(r)) => match *r {
            // Only a free of the allocation's start retired it when recording
            AddressRef::Allocation { id, offset: 0 } => {
                let address = alloc.address_of(id, 0)?;
                alloc.retire(id)?;
                Value::U32(address)
            }
            other => Value::U32(other.resolve(alloc)?),
        },
        (k, WireValue::U32(v)) if !k.is_pointer_family() && !matches!(k, ValueKind::Void) => {
            Value::U32(*v)
        }
        _ => {
            return Err(ProtocolError::ValueKindMismatch {
                kind: kind.to_string(),
                value: wire.to_string(),
            }
            .into())
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip_bytes(wire: &WireValue, kind: ValueKind) -> WireValue {
        let mut w = ByteWriter::new();
        write_wire(&mut w, wire);
        let bytes = w.into_vec();
        let mut r = ByteReader::new(&bytes);
        let back = read_wire(&mut r, kind).unwrap();
        assert!(r.is_empty());
        back
    }

    #[test]
    fn test_null_pointer_skips_map() {
        let mut alloc = AllocationMap::new();
        let mut interner = StringInterner::new();
        let wire = encode_value(&Value::U32(0), ValueKind::Pointer, &mut alloc, &mut interner).unwrap();
        assert_eq!(wire, WireValue::Ref(AddressRef::Null));

        let mut w = ByteWriter::new();
        write_wire(&mut w, &wire);
        assert_eq!(w.as_slice(), &[0, 0, 0, 0]);

        let table = StringTable::default();
        let value = decode_value(&wire, ValueKind::Pointer, &mut alloc, &table).unwrap();
        assert_eq!(value, Value::U32(0));
    }

    #[test]
    fn test_untracked_pointer_is_static() {
        let mut alloc = AllocationMap::new();
        let mut interner = StringInterner::new();
        let wire =
            encode_value(&Value::U32(0x400), ValueKind::Pointer, &mut alloc, &mut interner).unwrap();
        assert_eq!(wire, WireValue::Ref(AddressRef::Static(0x400)));
        assert_eq!(roundtrip_bytes(&wire, ValueKind::Pointer), wire);
    }

    #[test]
    fn test_strings_are_interned() {
        let mut alloc = AllocationMap::new();
        let mut interner = StringInterner::new();
        let a = encode_value(&Value::from("tex"), ValueKind::String, &mut alloc, &mut interner).unwrap();
        let b = encode_value(&Value::from("tex"), ValueKind::String, &mut alloc, &mut interner).unwrap();
        assert_eq!(a, b);
        let table = interner.into_table();
        assert_eq!(
            decode_value(&a, ValueKind::String, &mut alloc, &table).unwrap(),
            Value::from("tex")
        );
        assert!(decode_value(&WireValue::Str(9), ValueKind::String, &mut alloc, &table).is_err());
    }

    #[test]
    fn test_kind_mismatch() {
        let mut alloc = AllocationMap::new();
        let mut interner = StringInterner::new();
        let err = encode_value(&Value::F64(1.5), ValueKind::Uint32, &mut alloc, &mut interner)
            .unwrap_err();
        assert!(err.is_protocol());
        let err = decode_value(&WireValue::F64(1.0), ValueKind::Pointer, &mut alloc, &StringTable::default())
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_int32_bitcast() {
        let mut alloc = AllocationMap::new();
        let mut interner = StringInterner::new();
        let wire = encode_value(&Value::U32(u32::MAX), ValueKind::Int32, &mut alloc, &mut interner).unwrap();
        assert_eq!(wire, WireValue::I32(-1));
        let wire = encode_value(&Value::I32(-1), ValueKind::Uint32, &mut alloc, &mut interner).unwrap();
        assert_eq!(wire, WireValue::U32(u32::MAX));
    }

    #[test]
    fn test_freed_pointer_retires_on_both_sides() {
        let mut rec = AllocationMap::new();
        let mut interner = StringInterner::new();
        rec.insert(0x100, 0x110).unwrap();
        let wire =
            encode_value(&Value::U32(0x100), ValueKind::FreedPointer, &mut rec, &mut interner).unwrap();
        assert!(rec.is_empty());
        assert_eq!(
            roundtrip_bytes(&wire, ValueKind::FreedPointer),
            wire
        );

        let mut rep = AllocationMap::new();
        rep.insert(0x900, 0x910).unwrap();
        let table = StringTable::default();
        let value = decode_value(&wire, ValueKind::FreedPointer, &mut rep, &table).unwrap();
        assert_eq!(value, Value::U32(0x900));
        let err = decode_value(&wire, ValueKind::FreedPointer, &mut rep, &table).unwrap_err();
        assert_eq!(
            err,
            tidemark_core::TraceError::Allocation(tidemark_core::AllocationError::Retired { id: 0 })
        );
    }

    #[test]
    fn test_freed_interior_pointer_keeps_allocation() {
        let mut rec = AllocationMap::new();
        let mut interner = StringInterner::new();
        rec.insert(0x100, 0x110).unwrap();
        let wire =
            encode_value(&Value::U32(0x104), ValueKind::FreedPointer, &mut rec, &mut interner).unwrap();
        assert_eq!(
            wire,
            WireValue::Ref(AddressRef::Allocation {
                id: AllocationId::from_raw(0),
                offset: 4
            })
        );
        assert_eq!(rec.iter().count(), 1);

        let mut rep = AllocationMap::new();
        rep.insert(0x900, 0x910).unwrap();
        let table = StringTable::default();
        let value = decode_value(&wire, ValueKind::FreedPointer, &mut rep, &table).unwrap();
        assert_eq!(value, Value::U32(0x904));
        assert_eq!(rep.iter().count(), 1);
        let pointer = WireValue::Ref(AddressRef::Allocation {
            id: AllocationId::from_raw(0),
            offset: 8,
        });
        assert_eq!(
            decode_value(&pointer, ValueKind::Pointer, &mut rep, &table).unwrap(),
            Value::U32(0x908)
        );
    }

    #[test]
    fn test_boolean_is_one_byte() {
        let mut w = ByteWriter::new();
        write_wire(&mut w, &WireValue::Bool(true));
        assert_eq!(w.as_slice(), &[1]);
    }

    proptest! {
        #[test]
        fn test_pointer_stability(
            rec_base in 1u32..0x10_0000,
            rep_base in 1u32..0x10_0000,
            size in 1u32..0x1000,
            rel in 0u32..0x1000,
        ) {
            let rel = rel % (size + 1);
            let mut rec = AllocationMap::new();
            let mut rep = AllocationMap::new();
            let mut interner = StringInterner::new();
            rec.insert(rec_base, rec_base + size).unwrap();
            rep.insert(rep_base, rep_base + size).unwrap();

            let wire = encode_value(
                &Value::U32(rec_base + rel),
                ValueKind::Pointer,
                &mut rec,
                &mut interner,
            ).unwrap();
            let wire = roundtrip_bytes(&wire, ValueKind::Pointer);
            let value = decode_value(&wire, ValueKind::Pointer, &mut rep, &StringTable::default()).unwrap();
            let address = value.as_address().unwrap();
            prop_assert!(address >= rep_base && address <= rep_base + size);
            prop_assert_eq!(address - rep_base, rel);
        }
    }
}

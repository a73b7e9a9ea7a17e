//! Trace file layout.
//!
//! ```text
//! MAGIC | version:u16
//! string table | call type map | callback type map
//! event*
//! ```
//!
//! Parsing is structural: every event is decoded to wire values using the
//! type maps, and enter/leave nesting is checked before anything is replayed.

use crate::codec::{read_wire, AddressRef, WireValue};
use crate::encoding::{ByteReader, ByteWriter, WireDecode, WireEncode};
use crate::event::{Event, EventKind, Scalar, TracedEvent};
use crate::stream::EventStream;
use crate::strings::StringTable;
use crate::typemap::{TypeMap, TypeMapRegistry, TypeSignature};
use tidemark_core::{Direction, MethodIndex, ProtocolError, TraceError, TraceResult};
use tracing::debug;

/// File signature
pub const MAGIC: [u8; 8] = *b"TIDEMARK";

/// Format version written by this build and the only one it reads
pub const FORMAT_VERSION: u16 = 1;

/// A fully parsed trace
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFile {
    /// Format version from the header
    pub version: u16,
    /// String table
    pub strings: StringTable,
    /// Call and callback type maps
    pub types: TypeMapRegistry,
    /// Events in recorded order
    pub events: Vec<TracedEvent>,
}

impl TraceFile {
    /// Parse and structurally validate a trace
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed input and a stack mismatch when
    /// enter and leave events do not nest. Event errors carry the offset.
    pub fn parse(bytes: &[u8]) -> TraceResult<Self> {
        let mut r = ByteReader::new(bytes);
        let magic = r.get_bytes(MAGIC.len()).map_err(|_| ProtocolError::InvalidMagic)?;
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic.into());
        }
        let version = r.get_u16()?;
        if version != FORMAT_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            }
            .into());
        }

        let strings = StringTable::decode(&mut r)?;
        let calls = TypeMap::decode(&mut r, Direction::Call)?;
        let callbacks = TypeMap::decode(&mut r, Direction::Callback)?;
        let types = TypeMapRegistry::from_maps(calls, callbacks);
        if let Some(max) = types.max_method_index() {
            strings.get(max)?;
        }

        let mut parser = EventParser {
            strings: &strings,
            types: &types,
            frames: Vec::new(),
            context: None,
        };
        let mut events = Vec::new();
        while !r.is_empty() {
            let offset = r.offset();
            let event = parser
                .next_event(&mut r)
                .map_err(|e| e.at(offset, parser.current_method()))?;
            events.push(TracedEvent { offset, event });
        }
        if let Some(open) = parser.frames.last() {
            return Err(TraceError::StackMismatch {
                expected: format!("leave of {}", parser.describe(open)),
                actual: "end of stream".to_string(),
            }
            .at(r.offset(), parser.method_name(open.method)));
        }

        debug!(
            version,
            strings = strings.len(),
            events = events.len(),
            "Parsed trace"
        );
        Ok(Self {
            version,
            strings,
            types,
            events,
        })
    }

    /// Stream over a copy of the events
    #[must_use]
    pub fn stream(&self) -> EventStream {
        EventStream::new(self.events.clone())
    }

    /// Name of an interned method
    ///
    /// # Errors
    ///
    /// Returns error if the index is past the string table
    pub fn method_name(&self, method: MethodIndex) -> Result<&str, ProtocolError> {
        self.strings.get(method.as_u32())
    }

    /// Signature of a method
    ///
    /// # Errors
    ///
    /// Returns error if the method has no type map in `direction`
    pub fn signature(
        &self,
        direction: Direction,
        method: MethodIndex,
    ) -> Result<&TypeSignature, ProtocolError> {
        lookup(&self.types, &self.strings, direction, method)
    }

    /// Re-encode to bytes
    ///
    /// # Errors
    ///
    /// Returns error if a length does not fit the wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = ByteWriter::new();
        for traced in &self.events {
            traced.event.encode(&mut body)?;
        }
        encode_trace(&self.strings, &self.types, body.as_slice())
    }
}

/// Assemble a complete trace file from its sections
///
/// # Errors
///
/// Returns error if a length does not fit the wire format
pub fn encode_trace(
    strings: &impl WireEncode,
    types: &TypeMapRegistry,
    events: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let mut w = ByteWriter::with_capacity(events.len() + 256);
    w.put_bytes(&MAGIC);
    w.put_u16(FORMAT_VERSION);
    strings.encode(&mut w)?;
    types.encode(&mut w)?;
    w.put_bytes(events);
    Ok(w.into_vec())
}

fn lookup<'a>(
    types: &'a TypeMapRegistry,
    strings: &StringTable,
    direction: Direction,
    method: MethodIndex,
) -> Result<&'a TypeSignature, ProtocolError> {
    types
        .lookup(direction, method)
        .ok_or_else(|| ProtocolError::MissingTypeMap {
            direction,
            method: strings
                .get(method.as_u32())
                .map_or_else(|_| method.to_string(), str::to_string),
        })
}

struct Frame {
    direction: Direction,
    method: MethodIndex,
}

struct EventParser<'a> {
    strings: &'a StringTable,
    types: &'a TypeMapRegistry,
    frames: Vec<Frame>,
    // Method the event being parsed belongs to
    context: Option<MethodIndex>,
}

impl<'a> EventParser<'a> {
    fn method_name(&self, method: MethodIndex) -> Option<&'a str> {
        self.strings.get(method.as_u32()).ok()
    }

    fn current_method(&self) -> Option<&'a str> {
        self.context.and_then(|m| self.method_name(m))
    }

    fn describe(&self, frame: &Frame) -> String {
        format!(
            "{} '{}'",
            frame.direction,
            self.method_name(frame.method).unwrap_or("?")
        )
    }

    fn check_strings(&self, values: &[WireValue]) -> Result<(), ProtocolError> {
        for value in values {
            if let WireValue::Str(index) = value {
                self.strings.get(*index)?;
            }
        }
        Ok(())
    }

    fn write_target(r: &mut ByteReader<'_>, offset: usize) -> Result<AddressRef, ProtocolError> {
        match AddressRef::read(r)? {
            AddressRef::Null => Err(ProtocolError::NullWriteTarget { offset }),
            target => Ok(target),
        }
    }

    fn next_event(&mut self, r: &mut ByteReader<'_>) -> TraceResult<Event> {
        let offset = r.offset();
        self.context = self.frames.last().map(|f| f.method);
        let kind = EventKind::from_tag(r.get_u8()?, offset)?;
        let event = match kind {
            EventKind::CallEnter | EventKind::CallbackEnter => {
                let direction = if kind == EventKind::CallEnter {
                    Direction::Call
                } else {
                    Direction::Callback
                };
                let method = MethodIndex::from_raw(r.get_u32()?);
                self.strings.get(method.as_u32())?;
                self.context = Some(method);
                self.frames.push(Frame { direction, method });
                let signature = lookup(self.types, self.strings, direction, method)?;
                let args = signature
                    .args()
                    .iter()
                    .map(|k| read_wire(r, *k))
                    .collect::<Result<Vec<_>, _>>()?;
                self.check_strings(&args)?;
                Event::Enter {
                    direction,
                    method,
                    args,
                }
            }
            EventKind::Return | EventKind::Throw => {
                let frame = self.frames.pop().ok_or_else(|| TraceError::StackMismatch {
                    expected: "an open call or callback".to_string(),
                    actual: kind.to_string(),
                })?;
                self.context = Some(frame.method);
                if kind == EventKind::Throw {
                    Event::Throw
                } else {
                    let signature = lookup(self.types, self.strings, frame.direction, frame.method)?;
                    let value = read_wire(r, signature.return_kind())?;
                    self.check_strings(std::slice::from_ref(&value))?;
                    Event::Return { value }
                }
            }
            EventKind::BulkWrite => {
                let target = Self::write_target(r, offset)?;
                let len = r.get_len()?;
                let bytes = r.get_bytes(len)?.to_vec();
                Event::BulkWrite { target, bytes }
            }
            EventKind::IndexedWrite(ty) => {
                let target = Self::write_target(r, offset)?;
                let value = Scalar::read(r, ty)?;
                Event::IndexedWrite { target, value }
            }
        };
        Ok(event)
    }
}

//! TIDEMARK Trace Format
//!
//! Value kinds, string and type tables, the value codec, the allocation map,
//! and the binary trace file layout shared by the recorder and the replayer.
//! All encodings are little-endian and independent of the guest's memory
//! layout.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod codec;
pub mod encoding;
pub mod event;
pub mod format;
pub mod kind;
pub mod stream;
pub mod strings;
pub mod summary;
pub mod typemap;

pub use alloc::{AllocationMap, AllocationRange, AllocationStats};
pub use codec::{decode_value, encode_value, read_wire, write_wire, AddressRef, WireValue};
pub use encoding::{ByteReader, ByteWriter, WireDecode, WireEncode};
pub use event::{Event, EventKind, Scalar, ScalarType, TracedEvent};
pub use format::{encode_trace, TraceFile, FORMAT_VERSION, MAGIC};
pub use kind::ValueKind;
pub use stream::EventStream;
pub use strings::{StringInterner, StringTable};
pub use summary::TraceSummary;
pub use typemap::{TypeMap, TypeMapRegistry, TypeSignature};

//! String interning and the decoded string table.

use crate::encoding::{ByteReader, ByteWriter, WireDecode, WireEncode};
use indexmap::IndexSet;
use tidemark_core::{InternLimits, ProtocolError};

/// Deduplicates method names and string values into dense indices
#[derive(Debug, Clone, Default)]
pub struct StringInterner {
    strings: IndexSet<String>,
    limits: InternLimits,
}

impl StringInterner {
    /// Create an unlimited interner
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with size limits
    #[must_use]
    pub fn with_limits(limits: InternLimits) -> Self {
        Self {
            strings: IndexSet::new(),
            limits,
        }
    }

    /// Index of `s`, inserting it if unseen
    ///
    /// # Errors
    ///
    /// Returns error if the string or the table exceeds its limit
    pub fn intern(&mut self, s: &str) -> Result<u32, ProtocolError> {
        if let Some(index) = self.strings.get_index_of(s) {
            return to_index(index);
        }
        if let Some(limit) = self.limits.max_string_len {
            if s.len() > limit {
                return Err(ProtocolError::StringTooLong {
                    len: s.len(),
                    limit,
                });
            }
        }
        if let Some(limit) = self.limits.max_strings {
            if self.strings.len() >= limit {
                return Err(ProtocolError::StringTableFull { limit });
            }
        }
        let (index, _) = self.strings.insert_full(s.to_string());
        to_index(index)
    }

    /// Index of `s` if already interned
    #[must_use]
    pub fn lookup(&self, s: &str) -> Option<u32> {
        self.strings
            .get_index_of(s)
            .and_then(|i| u32::try_from(i).ok())
    }

    /// String at `index`
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get_index(index as usize).map(String::as_str)
    }

    /// Number of distinct strings
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether no strings are interned
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Freeze into a table
    #[must_use]
    pub fn into_table(self) -> StringTable {
        StringTable {
            strings: self.strings.into_iter().collect(),
        }
    }
}

fn to_index(index: usize) -> Result<u32, ProtocolError> {
    u32::try_from(index).map_err(|_| ProtocolError::LengthOverflow { len: index })
}

impl WireEncode for StringInterner {
    fn encode(&self, w: &mut ByteWriter) -> Result<(), ProtocolError> {
        encode_strings(self.strings.iter().map(String::as_str), self.strings.len(), w)
    }
}

fn encode_strings<'a>(
    strings: impl Iterator<Item = &'a str>,
    count: usize,
    w: &mut ByteWriter,
) -> Result<(), ProtocolError> {
    w.put_len(count)?;
    for s in strings {
        w.put_len(s.len())?;
        w.put_bytes(s.as_bytes());
    }
    Ok(())
}

/// Read-only string table of a parsed trace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTable {
    strings: Vec<String>,
}

impl StringTable {
    /// Build from an ordered list
    #[must_use]
    pub fn new(strings: Vec<String>) -> Self {
        Self { strings }
    }

    /// String at `index`
    ///
    /// # Errors
    ///
    /// Returns error if `index` is past the end of the table
    pub fn get(&self, index: u32) -> Result<&str, ProtocolError> {
        self.strings
            .get(index as usize)
            .map(String::as_str)
            .ok_or(ProtocolError::StringIndexOutOfRange {
                index,
                count: self.strings.len(),
            })
    }

    /// Index of `s`, if present
    #[must_use]
    pub fn position(&self, s: &str) -> Option<u32> {
        self.strings
            .iter()
            .position(|x| x == s)
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Number of strings
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Iterate in index order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }
}

impl WireEncode for StringTable {
    fn encode(&self, w: &mut ByteWriter) -> Result<(), ProtocolError> {
        encode_strings(self.iter(), self.strings.len(), w)
    }
}

impl WireDecode for StringTable {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        let count = r.get_len()?;
        let mut strings = Vec::with_capacity(count.min(r.remaining() / 4));
        for index in 0..count {
            let len = r.get_len()?;
            let bytes = r.get_bytes(len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8 { index })?;
            strings.push(s.to_string());
        }
        Ok(Self { strings })
    }
}

//! Type maps: per-method value kinds for each boundary direction.
//!
//! Slot 0 of a signature is the return kind; slots 1.. are argument kinds
//! in call order.

use crate::encoding::{ByteReader, ByteWriter, WireEncode};
use crate::kind::ValueKind;
use indexmap::IndexMap;
use tidemark_core::{Direction, MethodIndex, ProtocolError};

/// A method's kinds and how they were obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSignature {
    /// Declared up front by the embedder
    Registered(Vec<ValueKind>),
    /// Inferred from the first observed crossing
    Inferred(Vec<ValueKind>),
}

impl TypeSignature {
    /// Build a registered signature
    #[must_use]
    pub fn registered(ret: ValueKind, args: &[ValueKind]) -> Self {
        Self::Registered(slots(ret, args))
    }

    /// Build an inferred signature
    #[must_use]
    pub fn inferred(ret: ValueKind, args: &[ValueKind]) -> Self {
        Self::Inferred(slots(ret, args))
    }

    /// All slots, return first
    #[must_use]
    pub fn kinds(&self) -> &[ValueKind] {
        match self {
            Self::Registered(k) | Self::Inferred(k) => k,
        }
    }

    /// Return kind
    #[must_use]
    pub fn return_kind(&self) -> ValueKind {
        self.kinds().first().copied().unwrap_or(ValueKind::Void)
    }

    /// Argument kinds
    #[must_use]
    pub fn args(&self) -> &[ValueKind] {
        self.kinds().get(1..).unwrap_or(&[])
    }

    /// Whether this signature came from inference
    #[must_use]
    pub const fn is_inferred(&self) -> bool {
        matches!(self, Self::Inferred(_))
    }

    fn kinds_mut(&mut self) -> &mut Vec<ValueKind> {
        match self {
            Self::Registered(k) | Self::Inferred(k) => k,
        }
    }
}

fn slots(ret: ValueKind, args: &[ValueKind]) -> Vec<ValueKind> {
    let mut kinds = Vec::with_capacity(args.len() + 1);
    kinds.push(ret);
    kinds.extend_from_slice(args);
    kinds
}

/// Signatures for one direction, in first-registration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMap {
    entries: IndexMap<MethodIndex, TypeSignature>,
}

impl TypeMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signature for `method`
    #[must_use]
    pub fn get(&self, method: MethodIndex) -> Option<&TypeSignature> {
        self.entries.get(&method)
    }

    /// Insert or replace
    pub fn insert(&mut self, method: MethodIndex, signature: TypeSignature) {
        self.entries.insert(method, signature);
    }

    /// Whether `method` has a signature
    #[must_use]
    pub fn contains(&self, method: MethodIndex) -> bool {
        self.entries.contains_key(&method)
    }

    /// Number of methods
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (MethodIndex, &TypeSignature)> {
        self.entries.iter().map(|(m, s)| (*m, s))
    }

    /// Read a map for `direction`. Decoded signatures are `Registered`.
    ///
    /// # Errors
    ///
    /// Returns error on truncation, unknown kinds, empty or duplicate entries
    pub fn decode(r: &mut ByteReader<'_>, direction: Direction) -> Result<Self, ProtocolError> {
        let count = r.get_len()?;
        let mut map = Self::new();
        for _ in 0..count {
            let method = r.get_u32()?;
            let kind_count = r.get_len()?;
            if kind_count == 0 {
                return Err(ProtocolError::EmptyTypeMap { method });
            }
            let mut kinds = Vec::with_capacity(kind_count.min(r.remaining()));
            for _ in 0..kind_count {
                let offset = r.offset();
                kinds.push(ValueKind::from_byte(r.get_u8()?, offset)?);
            }
            let method_idx = MethodIndex::from_raw(method);
            if map.contains(method_idx) {
                return Err(ProtocolError::DuplicateTypeMap { direction, method });
            }
            map.insert(method_idx, TypeSignature::Registered(kinds));
        }
        Ok(map)
    }
}

impl WireEncode for TypeMap {
    fn encode(&self, w: &mut ByteWriter) -> Result<(), ProtocolError> {
        w.put_len(self.entries.len())?;
        for (method, signature) in &self.entries {
            w.put_u32(method.as_u32());
            w.put_len(signature.kinds().len())?;
            for kind in signature.kinds() {
                w.put_u8(kind.to_byte());
            }
        }
        Ok(())
    }
}

/// Call and callback type maps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMapRegistry {
    calls: TypeMap,
    callbacks: TypeMap,
}

impl TypeMapRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble from decoded maps
    #[must_use]
    pub fn from_maps(calls: TypeMap, callbacks: TypeMap) -> Self {
        Self { calls, callbacks }
    }

    /// Map for `direction`
    #[must_use]
    pub fn map(&self, direction: Direction) -> &TypeMap {
        match direction {
            Direction::Call => &self.calls,
            Direction::Callback => &self.callbacks,
        }
    }

    fn map_mut(&mut self, direction: Direction) -> &mut TypeMap {
        match direction {
            Direction::Call => &mut self.calls,
            Direction::Callback => &mut self.callbacks,
        }
    }

    /// Declare a method's kinds. Replaces any earlier signature.
    pub fn register(
        &mut self,
        direction: Direction,
        method: MethodIndex,
        args: &[ValueKind],
        ret: ValueKind,
    ) {
        self.map_mut(direction)
            .insert(method, TypeSignature::registered(ret, args));
    }

    /// Persist an inferred signature unless one already exists
    pub fn register_inferred(
        &mut self,
        direction: Direction,
        method: MethodIndex,
        args: &[ValueKind],
        ret: ValueKind,
    ) -> &TypeSignature {
        self.map_mut(direction)
            .entries
            .entry(method)
            .or_insert_with(|| TypeSignature::inferred(ret, args))
    }

    /// Signature for `method` in `direction`
    #[must_use]
    pub fn lookup(&self, direction: Direction, method: MethodIndex) -> Option<&TypeSignature> {
        self.map(direction).get(method)
    }

    /// Overwrite the return slot of an existing signature
    pub fn set_return_kind(&mut self, direction: Direction, method: MethodIndex, kind: ValueKind) {
        if let Some(signature) = self.map_mut(direction).entries.get_mut(&method) {
            if let Some(slot) = signature.kinds_mut().first_mut() {
                *slot = kind;
            }
        }
    }

    /// Highest method index referenced by either map
    #[must_use]
    pub fn max_method_index(&self) -> Option<u32> {
        self.calls
            .iter()
            .chain(self.callbacks.iter())
            .map(|(m, _)| m.as_u32())
            .max()
    }
}

impl WireEncode for TypeMapRegistry {
    fn encode(&self, w: &mut ByteWriter) -> Result<(), ProtocolError> {
        self.calls.encode(w)?;
        self.callbacks.encode(w)
    }
}

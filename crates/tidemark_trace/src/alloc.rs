//! Allocation map: portable identities for guest memory ranges.
//!
//! Ranges are detected from allocation-boundary kinds after each crossing
//! and are never taken from the guest's own allocator. Ids are local to one
//! map; a recording map and a replay map agree only on the order in which
//! ranges are created and retired.

use crate::kind::ValueKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tidemark_core::{AllocationError, AllocationId, GuestMemory, ProtocolError, TraceResult, Value};
use tracing::{debug, warn};

/// A tracked range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRange {
    /// Portable id
    pub id: AllocationId,
    /// First byte
    pub start: u32,
    /// One past the last byte
    pub end: u32,
}

impl AllocationRange {
    /// Width in bytes
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.end - self.start
    }

    // Zero-width ranges still occupy their start address.
    fn span_end(&self) -> u64 {
        span_end(self.start, self.end)
    }

    /// Whether `[start, end)` intersects this range
    #[must_use]
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        u64::from(start) < self.span_end() && span_end(start, end) > u64::from(self.start)
    }
}

fn span_end(start: u32, end: u32) -> u64 {
    u64::from(end).max(u64::from(start) + 1)
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStats {
    /// Ranges created
    pub created: u64,
    /// Ranges retired by a freed pointer
    pub retired: u64,
    /// Ranges evicted by an overlapping insertion
    pub evicted: u64,
}

/// Live ranges ordered by start address
#[derive(Debug, Clone, Default)]
pub struct AllocationMap {
    ranges: BTreeMap<u32, AllocationRange>,
    by_id: HashMap<AllocationId, u32>,
    next_id: u32,
    stats: AllocationStats,
}

impl AllocationMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `[start, end)` under a fresh id.
    ///
    /// Older ranges that overlap the new one are evicted.
    ///
    /// # Errors
    ///
    /// Returns error if `end < start`
    pub fn insert(&mut self, start: u32, end: u32) -> Result<AllocationId, AllocationError> {
        if end < start {
            return Err(AllocationError::InvalidRange {
                start: u64::from(start),
                end: u64::from(end),
            });
        }

        let limit = span_end(start, end);
        let conflicts: Vec<u32> = self
            .ranges
            .range(..=u32::try_from(limit - 1).unwrap_or(u32::MAX))
            .rev()
            .take_while(|(_, r)| r.span_end() > u64::from(start))
            .map(|(s, _)| *s)
            .collect();
        for key in conflicts {
            if let Some(old) = self.ranges.remove(&key) {
                self.by_id.remove(&old.id);
                self.stats.evicted += 1;
                warn!(
                    evicted = %old.id,
                    old_start = old.start,
                    old_end = old.end,
                    start,
                    end,
                    "Evicting overlapping allocation"
                );
            }
        }

        let id = AllocationId::from_raw(self.next_id);
        self.next_id += 1;
        self.ranges.insert(start, AllocationRange { id, start, end });
        self.by_id.insert(id, start);
        self.stats.created += 1;
        debug!(%id, start, end, "Allocation created");
        Ok(id)
    }

    /// Id and relative offset of the range containing `address`.
    ///
    /// The one-past-the-end address belongs to its range.
    #[must_use]
    pub fn id_from_address(&self, address: u32) -> Option<(AllocationId, u32)> {
        let (_, range) = self.ranges.range(..=address).next_back()?;
        (address <= range.end).then(|| (range.id, address - range.start))
    }

    /// Id of the range starting exactly at `address`
    #[must_use]
    pub fn id_from_start(&self, address: u32) -> Option<AllocationId> {
        self.ranges.get(&address).map(|r| r.id)
    }

    /// Range for a live id
    #[must_use]
    pub fn get(&self, id: AllocationId) -> Option<&AllocationRange> {
        self.by_id.get(&id).and_then(|s| self.ranges.get(s))
    }

    /// Absolute address of `(id, offset)`
    ///
    /// # Errors
    ///
    /// Returns error if the id is unknown or retired, or the offset is past
    /// the end of the range
    pub fn address_of(&self, id: AllocationId, offset: u32) -> Result<u32, AllocationError> {
        let range = self.get(id).ok_or_else(|| self.missing(id))?;
        if offset > range.size() {
            return Err(AllocationError::OutOfBounds {
                id: id.as_u32(),
                offset,
                size: range.size(),
            });
        }
        Ok(range.start + offset)
    }

    /// Stop tracking `id`, returning its range
    ///
    /// # Errors
    ///
    /// Returns error if the id is unknown or already retired
    pub fn retire(&mut self, id: AllocationId) -> Result<AllocationRange, AllocationError> {
        let start = self.by_id.remove(&id).ok_or_else(|| self.missing(id))?;
        let range = self
            .ranges
            .remove(&start)
            .ok_or(AllocationError::UnknownId { id: id.as_u32() })?;
        self.stats.retired += 1;
        debug!(%id, start = range.start, end = range.end, "Allocation retired");
        Ok(range)
    }

    fn missing(&self, id: AllocationId) -> AllocationError {
        if id.as_u32() < self.next_id {
            AllocationError::Retired { id: id.as_u32() }
        } else {
            AllocationError::UnknownId { id: id.as_u32() }
        }
    }

    /// Create ranges described by the allocation-boundary values of one
    /// crossing.
    ///
    /// The i-th `AllocStart` pairs with the i-th `AllocEnd` or `AllocSize`.
    /// A null start still consumes its partner. Buffer headers are read from
    /// `memory` as it is now. Freed pointers are handled by the codec.
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be used as an address, a header is
    /// invalid, or a range is malformed
    pub fn reconcile(
        &mut self,
        values: &[(ValueKind, &Value)],
        memory: &dyn GuestMemory,
    ) -> TraceResult<Vec<AllocationId>> {
        let mut starts = Vec::new();
        let mut extents = Vec::new();
        let mut created = Vec::new();

        for (kind, value) in values {
            if !kind.is_alloc_boundary() {
                continue;
            }
            let x = value.as_address().ok_or_else(|| ProtocolError::ValueKindMismatch {
                kind: kind.to_string(),
                value: value.to_string(),
            })?;
            match kind {
                ValueKind::AllocStart => starts.push(x),
                ValueKind::AllocEnd => extents.push(Extent::End(x)),
                ValueKind::AllocSize => extents.push(Extent::Size(x)),
                ValueKind::FixedSizeAlloc(n) if x != 0 => {
                    let end = checked_end(x, u64::from(*n))?;
                    created.push(self.insert(x, end)?);
                }
                ValueKind::AttributeBuffer if x != 0 => {
                    let header = read_header(memory, x)?;
                    let (data, stride, count) = (header[0], header[1], header[2]);
                    if stride == 0 {
                        return Err(invalid_header(x, "stride is zero").into());
                    }
                    created.extend(self.insert_strided(memory, x, data, stride, count)?);
                }
                ValueKind::IndexBuffer if x != 0 => {
                    let header = read_header(memory, x)?;
                    let (data, count, width) = (header[0], header[1], header[2]);
                    if !matches!(width, 1 | 2 | 4) {
                        return Err(invalid_header(x, &format!("index width {width}")).into());
                    }
                    created.extend(self.insert_strided(memory, x, data, width, count)?);
                }
                _ => {}
            }
        }

        if starts.len() != extents.len() {
            debug!(
                starts = starts.len(),
                extents = extents.len(),
                "Unpaired allocation boundaries"
            );
        }
        for (start, extent) in starts.into_iter().zip(extents) {
            if start == 0 {
                continue;
            }
            let end = match extent {
                Extent::End(end) => end,
                Extent::Size(size) => checked_end(start, u64::from(size))?,
            };
            created.push(self.insert(start, end)?);
        }
        Ok(created)
    }

    fn insert_strided(
        &mut self,
        memory: &dyn GuestMemory,
        header: u32,
        data: u32,
        stride: u32,
        count: u32,
    ) -> TraceResult<Vec<AllocationId>> {
        let extent = u64::from(stride) * u64::from(count);
        let end = u64::from(data) + extent;
        if end > u64::from(memory.size()) {
            return Err(invalid_header(
                header,
                &format!("buffer [0x{data:X}, 0x{end:X}) exceeds memory of {} bytes", memory.size()),
            )
            .into());
        }
        let mut ids = Vec::with_capacity(count as usize);
        for i in 0..count {
            let start = data + i * stride;
            ids.push(self.insert(start, start + stride)?);
        }
        Ok(ids)
    }

    /// Live ranges in address order
    pub fn iter(&self) -> impl Iterator<Item = &AllocationRange> {
        self.ranges.values()
    }

    /// Number of live ranges
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether no ranges are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Lifetime counters
    #[must_use]
    pub fn stats(&self) -> AllocationStats {
        self.stats
    }
}

enum Extent {
    End(u32),
    Size(u32),
}

fn checked_end(start: u32, size: u64) -> Result<u32, AllocationError> {
    let end = u64::from(start) + size;
    u32::try_from(end).map_err(|_| AllocationError::InvalidRange {
        start: u64::from(start),
        end,
    })
}

fn read_header(memory: &dyn GuestMemory, address: u32) -> TraceResult<[u32; 3]> {
    let mut fields = [0u32; 3];
    for (i, field) in fields.iter_mut().enumerate() {
        let at = address
            .checked_add(4 * i as u32)
            .ok_or_else(|| invalid_header(address, "header overflows address space"))?;
        *field = memory.read_u32(at)?;
    }
    Ok(fields)
}

fn invalid_header(address: u32, reason: &str) -> AllocationError {
    AllocationError::InvalidHeader {
        address,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use tidemark_core::memory::check_range;
    use tidemark_core::{MemoryError, TraceError};

    pub(crate) struct TestMemory(pub RefCell<Vec<u8>>);

    impl TestMemory {
        pub(crate) fn new(size: usize) -> Self {
            Self(RefCell::new(vec![0; size]))
        }

        pub(crate) fn put_u32s(&self, address: u32, words: &[u32]) {
            for (i, w) in words.iter().enumerate() {
                self.write(address + 4 * i as u32, &w.to_le_bytes()).unwrap();
            }
        }
    }

    impl GuestMemory for TestMemory {
        fn size(&self) -> u32 {
            self.0.borrow().len() as u32
        }

        fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
            let range = check_range(address, buf.len(), self.size())?;
            buf.copy_from_slice(&self.0.borrow()[range]);
            Ok(())
        }

        fn write(&self, address: u32, bytes: &[u8]) -> Result<(), MemoryError> {
            let range = check_range(address, bytes.len(), self.size())?;
            self.0.borrow_mut()[range].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut map = AllocationMap::new();
        let a = map.insert(100, 116).unwrap();
        let b = map.insert(116, 132).unwrap();
        assert_eq!(map.id_from_address(108), Some((a, 8)));
        assert_eq!(map.id_from_address(116), Some((b, 0)));
        assert_eq!(map.id_from_address(132), Some((b, 16)));
        assert_eq!(map.id_from_address(133), None);
        assert_eq!(map.id_from_address(99), None);
        assert_eq!(map.id_from_start(116), Some(b));
        assert_eq!(map.address_of(a, 16).unwrap(), 116);
    }

    #[test]
    fn test_address_of_out_of_bounds() {
        let mut map = AllocationMap::new();
        let a = map.insert(0x1000, 0x1010).unwrap();
        assert_eq!(
            map.address_of(a, 17),
            Err(AllocationError::OutOfBounds {
                id: 0,
                offset: 17,
                size: 16
            })
        );
    }

    #[test]
    fn test_retire_twice() {
        let mut map = AllocationMap::new();
        let a = map.insert(32, 48).unwrap();
        assert_eq!(map.retire(a).unwrap().start, 32);
        assert_eq!(map.retire(a), Err(AllocationError::Retired { id: 0 }));
        assert_eq!(
            map.address_of(AllocationId::from_raw(5), 0),
            Err(AllocationError::UnknownId { id: 5 })
        );
        assert_eq!(map.stats().retired, 1);
    }

    #[test]
    fn test_overlap_evicts_older() {
        let mut map = AllocationMap::new();
        let a = map.insert(0, 16).unwrap();
        let b = map.insert(16, 32).unwrap();
        let c = map.insert(8, 20).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.get(a).is_none());
        assert!(map.get(b).is_none());
        assert_eq!(map.get(c).unwrap().start, 8);
        assert_eq!(map.stats().evicted, 2);
        assert_eq!(map.address_of(a, 0), Err(AllocationError::Retired { id: 0 }));
    }

    #[test]
    fn test_zero_width_range() {
        let mut map = AllocationMap::new();
        let a = map.insert(64, 64).unwrap();
        assert_eq!(map.id_from_address(64), Some((a, 0)));
        let b = map.insert(64, 80).unwrap();
        assert!(map.get(a).is_none());
        assert_eq!(map.id_from_start(64), Some(b));
    }

    #[test]
    fn test_invalid_range() {
        let mut map = AllocationMap::new();
        assert!(matches!(
            map.insert(10, 5),
            Err(AllocationError::InvalidRange { start: 10, end: 5 })
        ));
    }

    #[test]
    fn test_reconcile_pairs_positionally() {
        let memory = TestMemory::new(256);
        let mut map = AllocationMap::new();
        let start_a = Value::U32(16);
        let size_a = Value::U32(8);
        let start_b = Value::U32(64);
        let end_b = Value::U32(96);
        let created = map
            .reconcile(
                &[
                    (ValueKind::AllocStart, &start_a),
                    (ValueKind::AllocStart, &start_b),
                    (ValueKind::AllocSize, &size_a),
                    (ValueKind::AllocEnd, &end_b),
                ],
                &memory,
            )
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(map.get(created[0]).unwrap().end, 24);
        assert_eq!(map.get(created[1]).unwrap().end, 96);
    }

    #[test]
    fn test_reconcile_null_start_consumes_extent() {
        let memory = TestMemory::new(64);
        let mut map = AllocationMap::new();
        let null = Value::U32(0);
        let real = Value::U32(8);
        let size = Value::U32(4);
        let created = map
            .reconcile(
                &[
                    (ValueKind::AllocStart, &null),
                    (ValueKind::AllocSize, &size),
                    (ValueKind::AllocStart, &real),
                    (ValueKind::AllocSize, &size),
                ],
                &memory,
            )
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(map.get(created[0]).unwrap().start, 8);
    }

    #[test]
    fn test_reconcile_fixed_size() {
        let memory = TestMemory::new(64);
        let mut map = AllocationMap::new();
        let x = Value::F64(40.0);
        let created = map
            .reconcile(&[(ValueKind::FixedSizeAlloc(12), &x)], &memory)
            .unwrap();
        assert_eq!(map.get(created[0]).unwrap().end, 52);
    }

    #[test]
    fn test_reconcile_attribute_buffer() {
        let memory = TestMemory::new(256);
        memory.put_u32s(0, &[64, 12, 3]);
        let mut map = AllocationMap::new();
        let header = Value::U32(0);
        // Header address 0 is treated as null
        assert!(map
            .reconcile(&[(ValueKind::AttributeBuffer, &header)], &memory)
            .unwrap()
            .is_empty());

        memory.put_u32s(16, &[64, 12, 3]);
        let header = Value::U32(16);
        let created = map
            .reconcile(&[(ValueKind::AttributeBuffer, &header)], &memory)
            .unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(map.id_from_address(76), Some((created[1], 0)));
        assert_eq!(map.get(created[2]).unwrap().end, 100);
    }

    #[test]
    fn test_reconcile_index_buffer_widths() {
        let memory = TestMemory::new(256);
        let header = Value::U32(16);
        for width in [1u32, 2, 4] {
            memory.put_u32s(16, &[64, 3, width]);
            let mut map = AllocationMap::new();
            let created = map
                .reconcile(&[(ValueKind::IndexBuffer, &header)], &memory)
                .unwrap();
            let ranges: Vec<(u32, u32)> = created
                .iter()
                .map(|id| {
                    let r = map.get(*id).unwrap();
                    (r.start, r.end)
                })
                .collect();
            let expected: Vec<(u32, u32)> =
                (0..3).map(|i| (64 + i * width, 64 + (i + 1) * width)).collect();
            assert_eq!(ranges, expected, "width {width}");
            assert_eq!(map.id_from_address(64 + width), Some((created[1], 0)));
        }
    }

    #[test]
    fn test_reconcile_rejects_bad_headers() {
        let memory = TestMemory::new(128);
        let mut map = AllocationMap::new();

        memory.put_u32s(4, &[32, 0, 4]);
        let header = Value::U32(4);
        let err = map
            .reconcile(&[(ValueKind::AttributeBuffer, &header)], &memory)
            .unwrap_err();
        assert!(err.is_allocation());

        memory.put_u32s(4, &[32, 10, 3]);
        let err = map
            .reconcile(&[(ValueKind::IndexBuffer, &header)], &memory)
            .unwrap_err();
        assert!(err.is_allocation());

        memory.put_u32s(4, &[32, 1000, 2]);
        let err = map
            .reconcile(&[(ValueKind::IndexBuffer, &header)], &memory)
            .unwrap_err();
        assert!(err.is_allocation());

        let header = Value::U32(126);
        let err = map
            .reconcile(&[(ValueKind::IndexBuffer, &header)], &memory)
            .unwrap_err();
        assert!(matches!(err, TraceError::Memory(_)));
    }

    #[test]
    fn test_reconcile_rejects_non_address() {
        let memory = TestMemory::new(16);
        let mut map = AllocationMap::new();
        let s = Value::String("x".into());
        let err = map
            .reconcile(&[(ValueKind::AllocStart, &s)], &memory)
            .unwrap_err();
        assert!(err.is_protocol());
    }

    proptest! {
        #[test]
        fn test_ranges_never_overlap(ops in proptest::collection::vec((0u32..512, 0u32..64), 1..64)) {
            let mut map = AllocationMap::new();
            for (start, size) in ops {
                map.insert(start, start + size).unwrap();
                let ranges: Vec<_> = map.iter().copied().collect();
                for pair in ranges.windows(2) {
                    prop_assert!(pair[0].span_end() <= u64::from(pair[1].start));
                }
            }
        }

        #[test]
        fn test_lookup_inverts_address_of(start in 0u32..1_000_000, size in 1u32..4096, rel in 0u32..4096) {
            let mut map = AllocationMap::new();
            let id = map.insert(start, start + size).unwrap();
            let rel = rel % (size + 1);
            let addr = map.address_of(id, rel).unwrap();
            prop_assert_eq!(map.id_from_address(addr), Some((id, rel)));
        }
    }
}

//! Boundary trace recorder.
//!
//! The recorder is driven from three extension points: enter, leave, and
//! memory write. It encodes each crossing as it happens and keeps the call
//! stack, the string table, the type maps, and the allocation map needed to
//! do so. Any failure discards everything buffered so far; a trace is either
//! complete and consistent or not produced at all.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::mem;
use tidemark_core::{
    CallOutcome, Direction, GuestMemory, MethodIndex, ProtocolError, TraceConfig, TraceError,
    TraceResult, Value,
};
use tidemark_trace::{
    encode_trace, encode_value, write_wire, AddressRef, AllocationMap, ByteWriter, Event,
    EventKind, Scalar, StringInterner, TypeMapRegistry, ValueKind, WireEncode,
};
use tracing::{debug, error, trace};

/// Recorder lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderState {
    /// Accepting events
    Recording,
    /// A failure discarded the buffer; holds the original error
    Corrupted(TraceError),
    /// The trace has been produced
    Finalized,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStats {
    /// Events written
    pub events: u64,
    /// Call enters written
    pub calls: u64,
    /// Callback enters written
    pub callbacks: u64,
    /// Memory writes written
    pub writes: u64,
    /// Memory writes dropped because they fell outside guest memory
    pub ignored_writes: u64,
    /// Crossings skipped by the direction filter
    pub filtered: u64,
}

struct Frame {
    direction: Direction,
    method: MethodIndex,
    name: String,
    args: Vec<Value>,
    kinds: Vec<ValueKind>,
}

/// Records boundary crossings into a trace
pub struct Recorder {
    config: TraceConfig,
    strings: StringInterner,
    types: TypeMapRegistry,
    alloc: AllocationMap,
    body: ByteWriter,
    frames: Vec<Frame>,
    // Inferred signatures whose return kind is not known yet
    pending_returns: HashSet<(Direction, MethodIndex)>,
    state: RecorderState,
    stats: RecorderStats,
}

impl Recorder {
    /// Create a recorder
    #[must_use]
    pub fn new(config: TraceConfig) -> Self {
        Self {
            strings: StringInterner::with_limits(config.intern),
            config,
            types: TypeMapRegistry::new(),
            alloc: AllocationMap::new(),
            body: ByteWriter::with_capacity(4096),
            frames: Vec::new(),
            pending_returns: HashSet::new(),
            state: RecorderState::Recording,
            stats: RecorderStats::default(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> &RecorderState {
        &self.state
    }

    /// The error that corrupted the recording, if any
    #[must_use]
    pub fn failure(&self) -> Option<&TraceError> {
        match &self.state {
            RecorderState::Corrupted(e) => Some(e),
            _ => None,
        }
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Current call nesting depth
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Allocation map as seen by the recorder
    #[must_use]
    pub fn allocations(&self) -> &AllocationMap {
        &self.alloc
    }

    /// Type maps as recorded so far
    #[must_use]
    pub fn types(&self) -> &TypeMapRegistry {
        &self.types
    }

    /// Declare kinds for a method before it is first crossed
    ///
    /// # Errors
    ///
    /// Returns error if the recorder is not recording or the name cannot be
    /// interned
    pub fn register_types(
        &mut self,
        direction: Direction,
        name: &str,
        args: &[ValueKind],
        ret: ValueKind,
    ) -> TraceResult<()> {
        self.ensure_recording()?;
        self.guard(name, |r| {
            let method = MethodIndex::from_raw(r.strings.intern(name)?);
            r.types.register(direction, method, args, ret);
            r.pending_returns.remove(&(direction, method));
            Ok(())
        })
    }

    /// A call or callback begins
    ///
    /// # Errors
    ///
    /// Returns error if an argument does not fit its kind, the argument count
    /// differs from the type map, or the recorder is not recording
    pub fn on_enter(&mut self, direction: Direction, name: &str, args: &[Value]) -> TraceResult<()> {
        self.ensure_recording()?;
        if !self.config.traces(direction) {
            self.stats.filtered += 1;
            return Ok(());
        }
        self.guard(name, |r| r.enter(direction, name, args))
    }

    fn enter(&mut self, direction: Direction, name: &str, args: &[Value]) -> TraceResult<()> {
        let method = MethodIndex::from_raw(self.strings.intern(name)?);
        if self.types.lookup(direction, method).is_none() {
            let inferred: Vec<ValueKind> = args.iter().map(ValueKind::infer).collect();
            self.types
                .register_inferred(direction, method, &inferred, ValueKind::Void);
            self.pending_returns.insert((direction, method));
            debug!(%direction, method = name, kinds = ?inferred, "Inferred type map");
        }
        let kinds = self
            .types
            .lookup(direction, method)
            .map(|s| s.args().to_vec())
            .unwrap_or_default();
        if kinds.len() != args.len() {
            return Err(ProtocolError::ArityMismatch {
                method: name.to_string(),
                expected: kinds.len(),
                actual: args.len(),
            }
            .into());
        }

        self.body.put_u8(EventKind::enter(direction).tag());
        self.body.put_u32(method.as_u32());
        for (arg, kind) in args.iter().zip(&kinds) {
            let wire = encode_value(arg, *kind, &mut self.alloc, &mut self.strings)?;
            write_wire(&mut self.body, &wire);
        }
        self.frames.push(Frame {
            direction,
            method,
            name: name.to_string(),
            args: args.to_vec(),
            kinds,
        });
        self.stats.events += 1;
        match direction {
            Direction::Call => self.stats.calls += 1,
            Direction::Callback => self.stats.callbacks += 1,
        }
        trace!(%direction, method = name, depth = self.frames.len(), "Enter");
        Ok(())
    }

    /// The innermost crossing ended.
    ///
    /// On return, allocation-boundary values among the arguments and the
    /// return value are reconciled against `memory`.
    ///
    /// # Errors
    ///
    /// Returns a stack mismatch if this does not match the innermost enter,
    /// or an encoding or allocation error
    pub fn on_leave(
        &mut self,
        memory: &dyn GuestMemory,
        direction: Direction,
        name: &str,
        outcome: &CallOutcome,
    ) -> TraceResult<()> {
        self.ensure_recording()?;
        if !self.config.traces(direction) {
            return Ok(());
        }
        self.guard(name, |r| r.leave(memory, direction, name, outcome))
    }

    fn leave(
        &mut self,
        memory: &dyn GuestMemory,
        direction: Direction,
        name: &str,
        outcome: &CallOutcome,
    ) -> TraceResult<()> {
        let actual = format!("leave of {direction} '{name}'");
        let frame = self.frames.pop().ok_or_else(|| TraceError::StackMismatch {
            expected: "an open call or callback".to_string(),
            actual: actual.clone(),
        })?;
        if frame.direction != direction || frame.name != name {
            return Err(TraceError::StackMismatch {
                expected: format!("leave of {} '{}'", frame.direction, frame.name),
                actual,
            });
        }

        match outcome {
            CallOutcome::Threw(_) => {
                self.body.put_u8(EventKind::Throw.tag());
            }
            CallOutcome::Returned(value) => {
                let key = (direction, frame.method);
                if self.pending_returns.remove(&key) {
                    self.types
                        .set_return_kind(direction, frame.method, ValueKind::infer(value));
                }
                let ret_kind = self
                    .types
                    .lookup(direction, frame.method)
                    .map_or(ValueKind::Void, |s| s.return_kind());
                let wire = encode_value(value, ret_kind, &mut self.alloc, &mut self.strings)?;
                self.body.put_u8(EventKind::Return.tag());
                write_wire(&mut self.body, &wire);

                let mut values: Vec<(ValueKind, &Value)> =
                    frame.kinds.iter().copied().zip(&frame.args).collect();
                values.push((ret_kind, value));
                self.alloc.reconcile(&values, memory)?;
            }
        }
        self.stats.events += 1;
        trace!(%direction, method = name, %outcome, "Leave");
        Ok(())
    }

    /// Host code copied `bytes` into guest memory at `address`.
    ///
    /// Returns whether the write was recorded. Writes outside the current
    /// guest memory are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the recorder is not recording
    pub fn on_bulk_write(
        &mut self,
        memory: &dyn GuestMemory,
        address: u32,
        bytes: &[u8],
    ) -> TraceResult<bool> {
        self.ensure_recording()?;
        if !self.accepts_write(memory, address, bytes.len()) {
            return Ok(false);
        }
        let event = Event::BulkWrite {
            target: self.write_target(address),
            bytes: bytes.to_vec(),
        };
        self.guard("", |r| r.push_write(&event))?;
        Ok(true)
    }

    /// Host code stored one element into guest memory at `address`.
    ///
    /// Returns whether the write was recorded.
    ///
    /// # Errors
    ///
    /// Returns error if the recorder is not recording
    pub fn on_indexed_write(
        &mut self,
        memory: &dyn GuestMemory,
        address: u32,
        value: Scalar,
    ) -> TraceResult<bool> {
        self.ensure_recording()?;
        if !self.accepts_write(memory, address, value.scalar_type().width()) {
            return Ok(false);
        }
        let event = Event::IndexedWrite {
            target: self.write_target(address),
            value,
        };
        self.guard("", |r| r.push_write(&event))?;
        Ok(true)
    }

    fn accepts_write(&mut self, memory: &dyn GuestMemory, address: u32, len: usize) -> bool {
        if !self.config.memory_writes || len == 0 {
            return false;
        }
        if !memory.contains(address, len) {
            self.stats.ignored_writes += 1;
            trace!(address, len, "Ignoring write outside guest memory");
            return false;
        }
        true
    }

    // Address zero is a valid write destination, so it is never encoded as null.
    fn write_target(&self, address: u32) -> AddressRef {
        match AddressRef::for_address(address, &self.alloc) {
            AddressRef::Null => AddressRef::Static(0),
            target => target,
        }
    }

    fn push_write(&mut self, event: &Event) -> TraceResult<()> {
        event.encode(&mut self.body)?;
        self.stats.events += 1;
        self.stats.writes += 1;
        Ok(())
    }

    /// Produce the trace file. A recorder can be finalized once.
    ///
    /// # Errors
    ///
    /// Returns the original error if recording failed earlier,
    /// [`TraceError::Finalized`] on a second call, or a stack mismatch if
    /// crossings are still open
    pub fn finalize(&mut self) -> TraceResult<Vec<u8>> {
        match &self.state {
            RecorderState::Finalized => return Err(TraceError::Finalized),
            RecorderState::Corrupted(e) => return Err(e.clone()),
            RecorderState::Recording => {}
        }
        if let Some(open) = self.frames.last() {
            let err = TraceError::StackMismatch {
                expected: format!("leave of {} '{}'", open.direction, open.name),
                actual: "finalize".to_string(),
            };
            let name = open.name.clone();
            self.corrupt(err.clone().at(self.body.len(), Some(&name)));
            return Err(self.failure().cloned().unwrap_or(err));
        }

        let strings = mem::take(&mut self.strings);
        let types = mem::take(&mut self.types);
        let body = mem::take(&mut self.body);
        self.alloc = AllocationMap::new();
        self.state = RecorderState::Finalized;
        let bytes = encode_trace(&strings, &types, body.as_slice())?;
        debug!(
            bytes = bytes.len(),
            events = self.stats.events,
            strings = strings.len(),
            "Trace finalized"
        );
        Ok(bytes)
    }

    /// Discard the recording because the embedding failed.
    ///
    /// Has no effect once the recorder has failed or been finalized.
    pub fn abort(&mut self, err: TraceError) {
        if self.state == RecorderState::Recording {
            self.corrupt(err);
        }
    }

    fn ensure_recording(&self) -> TraceResult<()> {
        match &self.state {
            RecorderState::Recording => Ok(()),
            RecorderState::Finalized => Err(TraceError::Finalized),
            RecorderState::Corrupted(e) => Err(TraceError::Corrupted {
                reason: e.to_string(),
            }),
        }
    }

    fn guard<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> TraceResult<T>,
    ) -> TraceResult<T> {
        let offset = self.body.len();
        f(self).map_err(|e| {
            let method = (!name.is_empty()).then_some(name);
            let e = e.at(offset, method);
            self.corrupt(e.clone());
            e
        })
    }

    fn corrupt(&mut self, err: TraceError) {
        error!(error = %err, depth = self.frames.len(), "Recording failed, discarding trace");
        self.body.clear();
        self.frames.clear();
        self.strings = StringInterner::new();
        self.types = TypeMapRegistry::new();
        self.alloc = AllocationMap::new();
        self.pending_returns.clear();
        self.state = RecorderState::Corrupted(err);
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("state", &self.state)
            .field("depth", &self.frames.len())
            .field("bytes", &self.body.len())
            .field("stats", &self.stats)
            .finish()
    }
}

//! Replay engine.
//!
//! The replayer walks the event stream in recorded order. Call events are
//! issued to the guest directly. Callback events are not issued: the
//! replayer waits for the guest to make the callback itself, checks it
//! against the trace, and answers with the recorded outcome. A top-level
//! callback that the guest has not yet made is a loose end; the replayer
//! hands control back to the embedding and resumes when the callback
//! arrives.
//!
//! Shared state lives behind a `RefCell` that is never borrowed while guest
//! or host code runs.

use crate::config::ReplayConfig;
use crate::state::{LooseEnd, ReplayState, ReplayStats};
use crate::validate::{comparable, compare_args, describe, values_match};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tidemark_core::{
    CallOutcome, Direction, GuestMemory, MethodIndex, ProtocolError, TraceError, TraceResult,
    Value,
};
use tidemark_trace::{
    decode_value, AllocationMap, AllocationRange, AllocationStats, Event, EventStream, TraceFile,
    TracedEvent, ValueKind, WireValue,
};
use tidemark_wasm::{CallbackInterceptor, GuestError, GuestInstance, HookGuard, HostInvoke};
use tracing::{debug, error, info, trace, warn};

type LooseEndHandler = Box<dyn FnOnce(&LooseEnd)>;

struct Frame {
    direction: Direction,
    method: MethodIndex,
    name: String,
    args: Vec<Value>,
    kinds: Vec<ValueKind>,
    // Virtual frames are consumed from the stream without the guest
    live: bool,
}

enum Step {
    // The next event leaves the frame the caller is waiting on
    Leave,
    // A top-level callback has to come from the guest
    Yield(LooseEnd),
    End,
}

struct ReplayCore {
    trace: TraceFile,
    stream: EventStream,
    alloc: AllocationMap,
    frames: Vec<Frame>,
    state: ReplayState,
    failure: Option<TraceError>,
    config: ReplayConfig,
    stats: ReplayStats,
    loose_end: Option<LooseEnd>,
    on_loose_end: Option<LooseEndHandler>,
}

impl ReplayCore {
    fn new(trace: TraceFile, config: ReplayConfig) -> Self {
        Self {
            stream: trace.stream(),
            trace,
            alloc: AllocationMap::new(),
            frames: Vec::new(),
            state: ReplayState::Idle,
            failure: None,
            config,
            stats: ReplayStats::default(),
            loose_end: None,
            on_loose_end: None,
        }
    }

    fn peek(&self) -> Option<TracedEvent> {
        self.stream.peek().cloned()
    }

    fn advance(&mut self) -> TraceResult<TracedEvent> {
        let traced = self.stream.next().cloned().ok_or_else(|| TraceError::StackMismatch {
            expected: self.expected_leave(),
            actual: "end of stream".to_string(),
        })?;
        self.stats.events += 1;
        Ok(traced)
    }

    fn expected_leave(&self) -> String {
        self.frames.last().map_or_else(
            || "an open call or callback".to_string(),
            |f| format!("leave of {} '{}'", f.direction, f.name),
        )
    }

    fn name(&self, method: MethodIndex) -> TraceResult<String> {
        Ok(self.trace.method_name(method)?.to_string())
    }

    fn describe(&self, event: Option<&Event>) -> String {
        match event {
            None => "end of stream".to_string(),
            Some(Event::Enter {
                direction, method, ..
            }) => {
                let name = self.trace.method_name(*method).unwrap_or("?");
                format!("{direction} '{name}'")
            }
            Some(other) => other.kind().to_string(),
        }
    }

    // Callback method index, if the trace answers this callback at all
    fn callback_method(&self, name: &str) -> Option<MethodIndex> {
        let method = MethodIndex::from_raw(self.trace.strings.position(name)?);
        self.trace
            .types
            .lookup(Direction::Callback, method)
            .map(|_| method)
    }

    fn decode_args(
        &mut self,
        direction: Direction,
        method: MethodIndex,
        wire: &[WireValue],
    ) -> TraceResult<(Vec<ValueKind>, Vec<Value>)> {
        let kinds = self.trace.signature(direction, method)?.args().to_vec();
        let mut values = Vec::with_capacity(wire.len());
        for (w, kind) in wire.iter().zip(&kinds) {
            values.push(decode_value(w, *kind, &mut self.alloc, &self.trace.strings)?);
        }
        Ok((kinds, values))
    }

    fn return_kind(&self, direction: Direction, method: MethodIndex) -> TraceResult<ValueKind> {
        Ok(self.trace.signature(direction, method)?.return_kind())
    }

    fn reconcile(
        &mut self,
        memory: &dyn GuestMemory,
        frame: &Frame,
        ret: (ValueKind, &Value),
    ) -> TraceResult<()> {
        let mut values: Vec<(ValueKind, &Value)> =
            frame.kinds.iter().copied().zip(&frame.args).collect();
        values.push(ret);
        self.alloc.reconcile(&values, memory)?;
        Ok(())
    }

    fn begin_call(&mut self) -> TraceResult<(String, Vec<Value>)> {
        let traced = self.advance()?;
        let Event::Enter {
            direction: Direction::Call,
            method,
            args,
        } = traced.event
        else {
            return Err(TraceError::InvalidState(format!(
                "expected a call at offset {}",
                traced.offset
            )));
        };
        let name = self.name(method)?;
        let (kinds, values) = self
            .decode_args(Direction::Call, method, &args)
            .map_err(|e| e.at(traced.offset, Some(&name)))?;
        self.frames.push(Frame {
            direction: Direction::Call,
            method,
            name: name.clone(),
            args: values.clone(),
            kinds,
            live: true,
        });
        self.stats.calls += 1;
        Ok((name, values))
    }

    // Compare what the guest did with the recorded leave of the current call
    fn finish_call(&mut self, memory: &dyn GuestMemory, outcome: &CallOutcome) -> TraceResult<()> {
        let Some(frame) = self.frames.pop() else {
            return Err(TraceError::InvalidState("no call in progress".to_string()));
        };
        let next = self.peek();
        let offset = next.as_ref().map_or(0, |t| t.offset);
        self.check_call_leave(memory, &frame, next.map(|t| t.event), outcome)
            .map_err(|e| e.at(offset, Some(&frame.name)))?;
        self.advance()?;
        trace!(method = %frame.name, %outcome, "Call replayed");
        Ok(())
    }

    fn check_call_leave(
        &mut self,
        memory: &dyn GuestMemory,
        frame: &Frame,
        recorded: Option<Event>,
        outcome: &CallOutcome,
    ) -> TraceResult<()> {
        match (recorded, outcome) {
            (Some(Event::Throw), CallOutcome::Threw(_)) => Ok(()),
            (Some(Event::Return { value }), CallOutcome::Returned(actual)) => {
                let kind = self.return_kind(Direction::Call, frame.method)?;
                if !kind.accepts(actual) {
                    return Err(ProtocolError::ReturnKindMismatch {
                        method: frame.name.clone(),
                        declared: kind.to_string(),
                        observed: actual.type_name().to_string(),
                    }
                    .into());
                }
                let expected = decode_value(&value, kind, &mut self.alloc, &self.trace.strings)?;
                if comparable(kind)
                    && !values_match(&expected, actual, &self.config.compare_options())
                {
                    self.stats.argument_mismatches += 1;
                    self.value_mismatch(&frame.name, &expected.to_string(), &actual.to_string())?;
                }
                self.reconcile(memory, frame, (kind, actual))
            }
            (Some(recorded @ (Event::Return { .. } | Event::Throw)), _) => {
                Err(TraceError::ValidationMismatch {
                    method: frame.name.clone(),
                    expected: recorded.kind().to_string(),
                    actual: outcome.to_string(),
                })
            }
            (recorded, _) => Err(TraceError::ValidationMismatch {
                method: frame.name.clone(),
                expected: self.describe(recorded.as_ref()),
                actual: format!("{outcome} before that"),
            }),
        }
    }

    fn value_mismatch(&self, method: &str, expected: &str, actual: &str) -> TraceResult<()> {
        if self.config.strict_arguments {
            return Err(TraceError::ValidationMismatch {
                method: method.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        warn!(method, expected, actual, "Replayed value differs from trace");
        Ok(())
    }

    // The guest made a traced callback; it must be the next event
    fn enter_callback(&mut self, name: &str, method: MethodIndex, args: &[Value]) -> TraceResult<usize> {
        let next = self.peek();
        let offset = next.as_ref().map_or(0, |t| t.offset);
        let wire = match next.map(|t| t.event) {
            Some(Event::Enter {
                direction: Direction::Callback,
                method: m,
                args,
            }) if m == method => args,
            other => {
                return Err(TraceError::ValidationMismatch {
                    method: name.to_string(),
                    expected: self.describe(other.as_ref()),
                    actual: format!("callback '{name}'"),
                }
                .at(offset, Some(name)));
            }
        };
        self.advance()?;
        let (kinds, expected) = self
            .decode_args(Direction::Callback, method, &wire)
            .map_err(|e| e.at(offset, Some(name)))?;
        let diffs = compare_args(&expected, args, &kinds, &self.config.compare_options());
        if !diffs.is_empty() {
            self.stats.argument_mismatches += diffs.len();
            self.value_mismatch(name, "recorded arguments", &describe(&diffs))
                .map_err(|e| e.at(offset, Some(name)))?;
        }

        self.frames.push(Frame {
            direction: Direction::Callback,
            method,
            name: name.to_string(),
            args: args.to_vec(),
            kinds,
            live: true,
        });
        self.stats.callbacks += 1;
        if self.state == ReplayState::WaitingForCallback {
            self.state = ReplayState::Running;
            self.loose_end = None;
            debug!(method = name, "Loose end resumed");
        }
        Ok(self.frames.len())
    }

    // A callback recorded under another callback came from host code, which
    // does not run during replay
    fn enter_virtual(&mut self, traced: &TracedEvent) -> TraceResult<()> {
        let Event::Enter {
            direction,
            method,
            args,
        } = &traced.event
        else {
            return Ok(());
        };
        let name = self.name(*method)?;
        let (kinds, values) = self
            .decode_args(*direction, *method, args)
            .map_err(|e| e.at(traced.offset, Some(&name)))?;
        self.advance()?;
        trace!(method = %name, "Virtual callback");
        self.frames.push(Frame {
            direction: *direction,
            method: *method,
            name,
            args: values,
            kinds,
            live: false,
        });
        self.stats.virtual_callbacks += 1;
        Ok(())
    }

    // Consume the leave of the innermost frame and produce its outcome
    fn leave(&mut self, memory: &dyn GuestMemory) -> TraceResult<(Frame, CallOutcome)> {
        let traced = self.advance()?;
        let frame = self.frames.pop().ok_or_else(|| TraceError::StackMismatch {
            expected: "an open call or callback".to_string(),
            actual: traced.event.kind().to_string(),
        })?;
        let outcome = match traced.event {
            Event::Throw => CallOutcome::Threw(format!("replayed exception from '{}'", frame.name)),
            Event::Return { value } => CallOutcome::Returned(
                self.decode_return(memory, &frame, &value)
                    .map_err(|e| e.at(traced.offset, Some(&frame.name)))?,
            ),
            other => {
                return Err(TraceError::StackMismatch {
                    expected: format!("leave of {} '{}'", frame.direction, frame.name),
                    actual: other.kind().to_string(),
                }
                .at(traced.offset, Some(&frame.name)));
            }
        };
        Ok((frame, outcome))
    }

    fn decode_return(
        &mut self,
        memory: &dyn GuestMemory,
        frame: &Frame,
        wire: &WireValue,
    ) -> TraceResult<Value> {
        let kind = self.return_kind(frame.direction, frame.method)?;
        let value = decode_value(wire, kind, &mut self.alloc, &self.trace.strings)?;
        self.reconcile(memory, frame, (kind, &value))?;
        Ok(value)
    }

    fn apply_write(&mut self, memory: &dyn GuestMemory) -> TraceResult<()> {
        let traced = self.advance()?;
        let result = match &traced.event {
            Event::BulkWrite { target, bytes } => target.resolve(&self.alloc).and_then(|address| {
                memory.write(address, bytes).map_err(TraceError::from)
            }),
            Event::IndexedWrite { target, value } => {
                target.resolve(&self.alloc).and_then(|address| {
                    memory
                        .write(address, &value.to_le_bytes())
                        .map_err(TraceError::from)
                })
            }
            _ => Ok(()),
        };
        result.map_err(|e| e.at(traced.offset, None))?;
        self.stats.writes += 1;
        Ok(())
    }
}

/// Replay state shared with the guest's hook slot
struct ReplayShared {
    core: RefCell<ReplayCore>,
}

impl ReplayShared {
    fn with_core<T>(&self, f: impl FnOnce(&mut ReplayCore) -> TraceResult<T>) -> TraceResult<T> {
        let mut core = self
            .core
            .try_borrow_mut()
            .map_err(|_| TraceError::InvalidState("replayer is busy".to_string()))?;
        f(&mut core)
    }

    fn inspect<T: Default>(&self, f: impl FnOnce(&ReplayCore) -> T) -> T {
        self.core.try_borrow().map(|c| f(&c)).unwrap_or_default()
    }

    fn failure(&self) -> Option<TraceError> {
        self.inspect(|c| c.failure.clone())
    }

    // Latch the first failure and return it
    fn fail(&self, err: TraceError) -> TraceError {
        match self.core.try_borrow_mut() {
            Ok(mut core) => {
                if let Some(first) = &core.failure {
                    return first.clone();
                }
                error!(error = %err, event = core.stream.position(), "Replay failed");
                core.state = ReplayState::Failed;
                core.failure = Some(err.clone());
                err
            }
            Err(_) => err,
        }
    }

    // Consume events until the frame at `depth` is about to leave, a loose
    // end is reached, or the stream ends
    fn drive(&self, guest: &dyn GuestInstance, depth: usize) -> TraceResult<Step> {
        loop {
            let (next, limited) = self.with_core(|c| {
                Ok((c.peek(), depth == 0 && c.config.limit_reached(c.stats.events)))
            })?;
            if limited {
                info!("Event limit reached");
                return Ok(Step::End);
            }
            let Some(traced) = next else {
                if depth == 0 {
                    return Ok(Step::End);
                }
                return Err(self.with_core(|c| {
                    Ok(TraceError::StackMismatch {
                        expected: c.expected_leave(),
                        actual: "end of stream".to_string(),
                    })
                })?);
            };

            match &traced.event {
                Event::Enter {
                    direction: Direction::Call,
                    ..
                } => self.replay_call(guest)?,
                Event::Enter {
                    direction: Direction::Callback,
                    method,
                    ..
                } => {
                    let token = self.with_core(|c| {
                        let top = c.frames.last().map(|f| (f.direction, f.name.clone()));
                        match top {
                            None => Ok(Some(LooseEnd {
                                method: c.name(*method)?,
                                event_index: c.stream.position(),
                                offset: traced.offset,
                            })),
                            Some((Direction::Callback, _)) => {
                                c.enter_virtual(&traced)?;
                                Ok(None)
                            }
                            Some((Direction::Call, name)) => Err(TraceError::ValidationMismatch {
                                expected: c.describe(Some(&traced.event)),
                                actual: "no callback from the guest".to_string(),
                                method: name.clone(),
                            }
                            .at(traced.offset, Some(&name))),
                        }
                    })?;
                    if let Some(token) = token {
                        return Ok(Step::Yield(token));
                    }
                }
                Event::Return { .. } | Event::Throw => {
                    let done = self.with_core(|c| {
                        if c.frames.len() <= depth {
                            return Ok(true);
                        }
                        if c.frames.last().is_some_and(|f| f.live) {
                            return Err(TraceError::InvalidState(
                                "live frame left out of order".to_string(),
                            ));
                        }
                        c.leave(guest.memory())?;
                        Ok(false)
                    })?;
                    if done {
                        return Ok(Step::Leave);
                    }
                }
                Event::BulkWrite { .. } | Event::IndexedWrite { .. } => {
                    self.with_core(|c| c.apply_write(guest.memory()))?;
                }
            }
        }
    }

    fn replay_call(&self, guest: &dyn GuestInstance) -> TraceResult<()> {
        let (name, args) = self.with_core(ReplayCore::begin_call)?;
        debug!(method = %name, args = args.len(), "Issuing call");
        let result = guest.call_export(&name, &args);
        // Failures inside nested callbacks are latched before the guest unwinds
        if let Some(err) = self.failure() {
            return Err(err);
        }
        let outcome = GuestError::into_outcome(result).map_err(TraceError::from)?;
        self.with_core(|c| c.finish_call(guest.memory(), &outcome))
    }

    fn replay_callback(
        &self,
        guest: &dyn GuestInstance,
        name: &str,
        method: MethodIndex,
        args: &[Value],
    ) -> TraceResult<CallOutcome> {
        let depth = self.with_core(|c| c.enter_callback(name, method, args))?;
        match self.drive(guest, depth)? {
            Step::Leave => {}
            Step::Yield(_) | Step::End => {
                return Err(TraceError::StackMismatch {
                    expected: format!("leave of callback '{name}'"),
                    actual: "end of stream".to_string(),
                });
            }
        }
        let (_, outcome, top_level) = self.with_core(|c| {
            let (frame, outcome) = c.leave(guest.memory())?;
            Ok((frame, outcome, c.frames.is_empty()))
        })?;
        trace!(method = name, %outcome, "Callback answered");
        if top_level {
            self.resume(guest)?;
        }
        Ok(outcome)
    }

    // Continue at the top level until the stream ends or a loose end
    fn resume(&self, guest: &dyn GuestInstance) -> TraceResult<()> {
        match self.drive(guest, 0) {
            Ok(Step::End) => self.with_core(|c| {
                c.state = ReplayState::Ended;
                info!(events = c.stats.events, calls = c.stats.calls, "Replay ended");
                Ok(())
            }),
            Ok(Step::Yield(token)) => {
                let handler = self.with_core(|c| {
                    c.state = ReplayState::WaitingForCallback;
                    c.loose_end = Some(token.clone());
                    c.stats.loose_ends += 1;
                    Ok(c.on_loose_end.take())
                })?;
                info!(method = %token.method, offset = token.offset, "Loose end reached");
                if let Some(handler) = handler {
                    handler(&token);
                }
                Ok(())
            }
            Ok(Step::Leave) => Err(self.fail(TraceError::StackMismatch {
                expected: "an open call or callback".to_string(),
                actual: "leave".to_string(),
            })),
            Err(e) => Err(self.fail(e)),
        }
    }
}

impl CallbackInterceptor for ReplayShared {
    fn intercept(
        &self,
        guest: &dyn GuestInstance,
        method: &str,
        args: &[Value],
        host: &mut HostInvoke<'_>,
    ) -> TraceResult<CallOutcome> {
        let traced = self.with_core(|c| match c.state {
            ReplayState::Failed => Err(c
                .failure
                .clone()
                .unwrap_or_else(|| TraceError::InvalidState("replay failed".to_string()))),
            ReplayState::Idle | ReplayState::Ended => Ok(None),
            ReplayState::Running | ReplayState::WaitingForCallback => {
                let traced = c.callback_method(method);
                if traced.is_none() {
                    c.stats.passthrough += 1;
                }
                Ok(traced)
            }
        })?;
        let Some(index) = traced else {
            trace!(method, "Forwarding callback to host");
            return Ok(host(args));
        };
        self.replay_callback(guest, method, index, args)
            .map_err(|e| self.fail(e))
    }
}

/// Replays one trace against one guest instance
pub struct Replayer {
    shared: Rc<ReplayShared>,
    guard: Option<HookGuard>,
}

impl Replayer {
    /// Create a replayer for a parsed trace
    #[must_use]
    pub fn new(trace: TraceFile, config: ReplayConfig) -> Self {
        Self {
            shared: Rc::new(ReplayShared {
                core: RefCell::new(ReplayCore::new(trace, config)),
            }),
            guard: None,
        }
    }

    /// Parse `bytes` and create a replayer
    ///
    /// # Errors
    ///
    /// Returns error if the trace is malformed
    pub fn from_bytes(bytes: &[u8], config: ReplayConfig) -> TraceResult<Self> {
        Ok(Self::new(TraceFile::parse(bytes)?, config))
    }

    /// Register a one-shot notification for the next loose end
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::InvalidState`] if the replayer is busy; the
    /// handler is not armed in that case
    pub fn on_loose_end<F>(&self, handler: F) -> TraceResult<()>
    where
        F: FnOnce(&LooseEnd) + 'static,
    {
        let mut core = self
            .shared
            .core
            .try_borrow_mut()
            .map_err(|_| TraceError::InvalidState("replayer is busy".to_string()))?;
        core.on_loose_end = Some(Box::new(handler));
        Ok(())
    }

    /// Attach to `guest` and replay until the stream ends or a loose end is
    /// reached.
    ///
    /// Returns [`ReplayState::Ended`] or [`ReplayState::WaitingForCallback`].
    /// In the latter case the embedding keeps driving the guest; replay
    /// resumes when the guest makes the awaited callback.
    ///
    /// # Errors
    ///
    /// Returns error if the replayer was already started, another session
    /// owns the guest's hooks, or replay fails
    pub fn start(&mut self, guest: &dyn GuestInstance) -> TraceResult<ReplayState> {
        if self.state() != ReplayState::Idle {
            return Err(TraceError::InvalidState(format!(
                "replay already {}",
                self.state()
            )));
        }
        self.guard = Some(guest.hooks().install(self.shared.clone())?);
        self.shared.with_core(|c| {
            c.state = ReplayState::Running;
            debug!(events = c.stream.len(), "Replay started");
            Ok(())
        })?;
        self.shared.resume(guest)?;
        Ok(self.state())
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ReplayState {
        self.shared.inspect(|c| Some(c.state)).unwrap_or(ReplayState::Running)
    }

    /// Whether the stream was fully replayed
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.state() == ReplayState::Ended
    }

    /// The error that stopped the replay, if any
    #[must_use]
    pub fn error(&self) -> Option<TraceError> {
        self.shared.failure()
    }

    /// The pending loose end, if the replayer is waiting on one
    #[must_use]
    pub fn loose_end(&self) -> Option<LooseEnd> {
        self.shared.inspect(|c| c.loose_end.clone())
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> ReplayStats {
        self.shared.inspect(|c| c.stats)
    }

    /// Allocation counters of the replay-side map
    #[must_use]
    pub fn allocation_stats(&self) -> AllocationStats {
        self.shared.inspect(|c| c.alloc.stats())
    }

    /// Live allocations in the guest being replayed, in address order
    #[must_use]
    pub fn allocations(&self) -> Vec<AllocationRange> {
        self.shared.inspect(|c| c.alloc.iter().copied().collect())
    }

    /// Events not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.shared.inspect(|c| c.stream.remaining())
    }

    /// Detach from the guest
    ///
    /// # Errors
    ///
    /// Returns the replay error if it failed, or an invalid state error if it
    /// had not ended
    pub fn finish(mut self) -> TraceResult<ReplayStats> {
        self.guard.take();
        match self.state() {
            ReplayState::Ended => Ok(self.stats()),
            ReplayState::Failed => Err(self
                .error()
                .unwrap_or_else(|| TraceError::InvalidState("replay failed".to_string()))),
            state => Err(TraceError::InvalidState(format!(
                "replay {state} with {} events left",
                self.remaining()
            ))),
        }
    }
}

impl fmt::Debug for Replayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replayer")
            .field("state", &self.state())
            .field("attached", &self.guard.is_some())
            .field("remaining", &self.remaining())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tidemark_core::TraceConfig;
    use tidemark_record::record;
    use tidemark_wasm::{GuestModule, ModuleConfig};

    fn adder() -> GuestModule {
        GuestModule::new(ModuleConfig::default())
            .unwrap()
            .with_export("add", |g, args| {
                let bias = g.call_import("bias", &[])?;
                match (args, bias) {
                    ([Value::I32(a), Value::I32(b)], Value::I32(c)) => Ok(Value::I32(a + b + c)),
                    _ => Err(GuestError::Trap("bad arguments".into())),
                }
            })
            .with_import("bias", |_ctx, _args| CallOutcome::Returned(Value::I32(100)))
    }

    fn record_add() -> Vec<u8> {
        let g = adder();
        record(&g, TraceConfig::default(), |s| {
            s.call(&g, "add", &[Value::I32(1), Value::I32(2)])?;
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn test_loose_end_handler_rejected_while_busy() {
        let replayer = Replayer::from_bytes(&record_add(), ReplayConfig::default()).unwrap();
        {
            let _busy = replayer.shared.core.borrow_mut();
            assert!(matches!(
                replayer.on_loose_end(|_| {}),
                Err(TraceError::InvalidState(_))
            ));
        }
        assert!(replayer.shared.core.borrow().on_loose_end.is_none());
        replayer.on_loose_end(|_| {}).unwrap();
        assert!(replayer.shared.core.borrow().on_loose_end.is_some());
    }

    #[test]
    fn test_replay_answers_callback_from_trace() {
        let bytes = record_add();
        // The live host would answer differently; replay must not ask it
        let g = GuestModule::new(ModuleConfig::default())
            .unwrap()
            .with_export("add", |g, args| {
                let bias = g.call_import("bias", &[])?;
                match (args, bias) {
                    ([Value::I32(a), Value::I32(b)], Value::I32(c)) => Ok(Value::I32(a + b + c)),
                    _ => Err(GuestError::Trap("bad arguments".into())),
                }
            })
            .with_import("bias", |_ctx, _args| CallOutcome::Returned(Value::I32(-5)));
        let mut replayer = Replayer::from_bytes(&bytes, ReplayConfig::default()).unwrap();
        assert_eq!(replayer.start(&g).unwrap(), ReplayState::Ended);
        let stats = replayer.finish().unwrap();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.callbacks, 1);
        assert_eq!(stats.argument_mismatches, 0);
        assert!(!g.hooks().is_attached());
    }

    #[test]
    fn test_outcome_mismatch_fails() {
        let bytes = record_add();
        let g = GuestModule::new(ModuleConfig::default())
            .unwrap()
            .with_export("add", |g, _args| {
                g.call_import("bias", &[])?;
                Err(GuestError::Trap("changed".into()))
            });
        let mut replayer = Replayer::from_bytes(&bytes, ReplayConfig::default()).unwrap();
        let err = replayer.start(&g).unwrap_err();
        assert!(matches!(err.root(), TraceError::ValidationMismatch { .. }));
        assert_eq!(replayer.state(), ReplayState::Failed);
        assert!(replayer.finish().is_err());
    }

    #[test]
    fn test_return_value_mismatch_lenient_and_strict() {
        let bytes = record_add();
        let drifted = || {
            GuestModule::new(ModuleConfig::default())
                .unwrap()
                .with_export("add", |g, _args| {
                    g.call_import("bias", &[])?;
                    Ok(Value::I32(0))
                })
        };

        let g = drifted();
        let mut lenient = Replayer::from_bytes(&bytes, ReplayConfig::default()).unwrap();
        assert_eq!(lenient.start(&g).unwrap(), ReplayState::Ended);
        assert_eq!(lenient.finish().unwrap().argument_mismatches, 1);

        let g = drifted();
        let config = ReplayConfig::new().with_strict_arguments(true);
        let mut strict = Replayer::from_bytes(&bytes, config).unwrap();
        assert!(strict.start(&g).is_err());
    }

    #[test]
    fn test_unexpected_callback_fails() {
        let bytes = record_add();
        let g = GuestModule::new(ModuleConfig::default())
            .unwrap()
            .with_export("add", |_g, _args| Ok(Value::I32(103)));
        let mut replayer = Replayer::from_bytes(&bytes, ReplayConfig::default()).unwrap();
        let err = replayer.start(&g).unwrap_err();
        assert!(matches!(err.root(), TraceError::ValidationMismatch { .. }));
    }

    #[test]
    fn test_untraced_callback_passes_through() {
        let bytes = record_add();
        let hits = Rc::new(Cell::new(0));
        let seen = hits.clone();
        let g = adder()
            .with_export("add", |g, args| {
                g.call_import("log", &[])?;
                let bias = g.call_import("bias", &[])?;
                match (args, bias) {
                    ([Value::I32(a), Value::I32(b)], Value::I32(c)) => Ok(Value::I32(a + b + c)),
                    _ => Err(GuestError::Trap("bad arguments".into())),
                }
            })
            .with_import("log", move |_ctx, _args| {
                seen.set(seen.get() + 1);
                CallOutcome::Returned(Value::Void)
            });
        let mut replayer = Replayer::from_bytes(&bytes, ReplayConfig::default()).unwrap();
        assert_eq!(replayer.start(&g).unwrap(), ReplayState::Ended);
        assert_eq!(hits.get(), 1);
        assert_eq!(replayer.stats().passthrough, 1);
    }

    #[test]
    fn test_start_twice_rejected() {
        let bytes = record_add();
        let g = adder();
        let mut replayer = Replayer::from_bytes(&bytes, ReplayConfig::default()).unwrap();
        replayer.start(&g).unwrap();
        assert!(matches!(replayer.start(&g), Err(TraceError::InvalidState(_))));
    }

    #[test]
    fn test_event_limit() {
        let g = adder();
        let bytes = record(&g, TraceConfig::default(), |s| {
            s.call(&g, "add", &[Value::I32(1), Value::I32(2)])?;
            s.call(&g, "add", &[Value::I32(3), Value::I32(4)])?;
            Ok(())
        })
        .unwrap();
        let g = adder();
        let mut replayer =
            Replayer::from_bytes(&bytes, ReplayConfig::new().with_max_events(4)).unwrap();
        assert_eq!(replayer.start(&g).unwrap(), ReplayState::Ended);
        assert_eq!(replayer.stats().calls, 1);
        assert_eq!(replayer.remaining(), 4);
    }
}

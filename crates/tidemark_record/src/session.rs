//! Recording sessions attached to a live guest.
//!
//! A session installs an interceptor on the guest's hook slot. Host-driven
//! calls go through [`RecordingSession::call`]; guest-driven callbacks and
//! host writes into guest memory arrive through the interceptor. The
//! recorder borrow is never held while guest or host code runs, so either
//! side may re-enter the other.

use crate::recorder::{Recorder, RecorderStats};
use std::cell::RefCell;
use std::rc::Rc;
use tidemark_core::{CallOutcome, Direction, TraceConfig, TraceError, TraceResult, Value};
use tidemark_trace::{AllocationStats, Scalar, ValueKind};
use tidemark_wasm::{CallbackInterceptor, GuestError, GuestInstance, HookGuard, HostInvoke};
use tracing::{debug, warn};

struct SessionCore {
    recorder: RefCell<Recorder>,
}

impl SessionCore {
    fn with_recorder<T>(&self, f: impl FnOnce(&mut Recorder) -> TraceResult<T>) -> TraceResult<T> {
        let mut recorder = self
            .recorder
            .try_borrow_mut()
            .map_err(|_| TraceError::InvalidState("recorder is busy".to_string()))?;
        f(&mut recorder)
    }

    // Interceptor paths cannot return recording errors to guest code, so
    // failures stay latched in the recorder and surface at `finish`.
    fn latch(&self, what: &str, result: TraceResult<impl Sized>) {
        if let Err(e) = result {
            warn!(error = %e, "Recording {what} failed");
        }
    }
}

impl CallbackInterceptor for SessionCore {
    fn intercept(
        &self,
        guest: &dyn GuestInstance,
        method: &str,
        args: &[Value],
        host: &mut HostInvoke<'_>,
    ) -> TraceResult<CallOutcome> {
        self.latch(
            "callback enter",
            self.with_recorder(|r| r.on_enter(Direction::Callback, method, args)),
        );
        let outcome = host(args);
        self.latch(
            "callback leave",
            self.with_recorder(|r| r.on_leave(guest.memory(), Direction::Callback, method, &outcome)),
        );
        Ok(outcome)
    }

    fn on_bulk_write(&self, guest: &dyn GuestInstance, address: u32, bytes: &[u8]) {
        self.latch(
            "memory write",
            self.with_recorder(|r| r.on_bulk_write(guest.memory(), address, bytes)),
        );
    }

    fn on_indexed_write(&self, guest: &dyn GuestInstance, address: u32, value: Scalar) {
        self.latch(
            "indexed write",
            self.with_recorder(|r| r.on_indexed_write(guest.memory(), address, value)),
        );
    }
}

/// A recorder attached to one guest instance
pub struct RecordingSession {
    core: Rc<SessionCore>,
    guard: Option<HookGuard>,
}

impl RecordingSession {
    /// Attach a new recorder to `guest`
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::AlreadyAttached`] if another session owns the
    /// guest's hooks
    pub fn attach(guest: &dyn GuestInstance, config: TraceConfig) -> TraceResult<Self> {
        let core = Rc::new(SessionCore {
            recorder: RefCell::new(Recorder::new(config)),
        });
        let guard = guest.hooks().install(core.clone())?;
        debug!("Recording session attached");
        Ok(Self {
            core,
            guard: Some(guard),
        })
    }

    /// Declare kinds for a method before it is first crossed
    ///
    /// # Errors
    ///
    /// Returns error if the recording has already failed
    pub fn register_types(
        &self,
        direction: Direction,
        name: &str,
        args: &[ValueKind],
        ret: ValueKind,
    ) -> TraceResult<()> {
        self.core
            .with_recorder(|r| r.register_types(direction, name, args, ret))
    }

    /// Call a guest export and record the crossing.
    ///
    /// A trap or an escaped host exception is returned as
    /// [`CallOutcome::Threw`]; it is part of the trace, not a failure.
    ///
    /// # Errors
    ///
    /// Returns error if recording fails or the guest cannot be driven at all
    pub fn call(
        &self,
        guest: &dyn GuestInstance,
        name: &str,
        args: &[Value],
    ) -> TraceResult<CallOutcome> {
        self.core
            .with_recorder(|r| r.on_enter(Direction::Call, name, args))?;
        let result = guest.call_export(name, args);
        let outcome = match GuestError::into_outcome(result) {
            Ok(outcome) => outcome,
            Err(e) => {
                // The crossing cannot be closed, so this recording is unusable
                let err = TraceError::from(e);
                self.core.with_recorder(|r| {
                    r.abort(err.clone());
                    Ok(())
                })?;
                return Err(err);
            }
        };
        if let Some(e) = self.error() {
            return Err(e);
        }
        self.core
            .with_recorder(|r| r.on_leave(guest.memory(), Direction::Call, name, &outcome))?;
        Ok(outcome)
    }

    /// Host-side bulk copy into guest memory, recorded as one event
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside guest memory or recording fails
    pub fn write_memory(
        &self,
        guest: &dyn GuestInstance,
        address: u32,
        bytes: &[u8],
    ) -> TraceResult<()> {
        guest.write(address, bytes)?;
        self.core
            .with_recorder(|r| r.on_bulk_write(guest.memory(), address, bytes))?;
        Ok(())
    }

    /// Host-side element store into guest memory, recorded as one event
    ///
    /// # Errors
    ///
    /// Returns error if the element is outside guest memory or recording fails
    pub fn write_scalar(
        &self,
        guest: &dyn GuestInstance,
        address: u32,
        value: Scalar,
    ) -> TraceResult<()> {
        guest.write(address, &value.to_le_bytes())?;
        self.core
            .with_recorder(|r| r.on_indexed_write(guest.memory(), address, value))?;
        Ok(())
    }

    /// The error that invalidated this recording, if any
    #[must_use]
    pub fn error(&self) -> Option<TraceError> {
        self.core
            .recorder
            .try_borrow()
            .ok()
            .and_then(|r| r.failure().cloned())
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        self.core
            .recorder
            .try_borrow()
            .map(|r| r.stats())
            .unwrap_or_default()
    }

    /// Allocation counters of the recording-side map
    #[must_use]
    pub fn allocation_stats(&self) -> AllocationStats {
        self.core
            .recorder
            .try_borrow()
            .map(|r| r.allocations().stats())
            .unwrap_or_default()
    }

    /// Detach from the guest and produce the trace bytes
    ///
    /// # Errors
    ///
    /// Returns the first recording error, or a stack mismatch if crossings
    /// are still open
    pub fn finish(mut self) -> TraceResult<Vec<u8>> {
        if let Some(guard) = self.guard.take() {
            guard.detach();
        }
        self.core.with_recorder(Recorder::finalize)
    }
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("attached", &self.guard.is_some())
            .field("recorder", &self.core.recorder)
            .finish()
    }
}

/// Attach a session, run `f`, and return the finished trace
///
/// # Errors
///
/// Returns error if attaching, `f`, or finalizing fails
pub fn record<F>(guest: &dyn GuestInstance, config: TraceConfig, f: F) -> TraceResult<Vec<u8>>
where
    F: FnOnce(&RecordingSession) -> TraceResult<()>,
{
    let session = RecordingSession::attach(guest, config)?;
    f(&session)?;
    session.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::GuestMemory;
    use tidemark_trace::{Event, EventKind, TraceFile, TraceSummary};
    use tidemark_wasm::{GuestModule, MemoryLimit, ModuleConfig};

    fn guest() -> GuestModule {
        GuestModule::new(ModuleConfig::new("demo").with_memory_limit(MemoryLimit::with_pages(1)))
            .unwrap()
            .with_export("main", |g, args| {
                let seed = args.first().and_then(Value::as_address).unwrap_or(0);
                let t = g.call_import("now", &[])?;
                g.call_import("fill", &[Value::U32(64), Value::U32(seed)])?;
                let got = g.read_u32(64)?;
                Ok(Value::U32(got + t.as_address().unwrap_or(0)))
            })
            .with_export("trap", |_g, _args| Err(GuestError::Trap("unreachable".into())))
            .with_import("now", |_ctx, _args| CallOutcome::Returned(Value::U32(1)))
            .with_import("fill", |ctx, args| {
                let (Some(addr), Some(v)) = (
                    args.first().and_then(Value::as_address),
                    args.get(1).and_then(Value::as_address),
                ) else {
                    return CallOutcome::Threw("bad args".into());
                };
                match ctx.write_scalar(addr, Scalar::U32(v)) {
                    Ok(()) => CallOutcome::Returned(Value::Void),
                    Err(e) => CallOutcome::Threw(e.to_string()),
                }
            })
    }

    #[test]
    fn test_record_callbacks_and_writes() {
        let g = guest();
        let bytes = record(&g, TraceConfig::default(), |s| {
            let out = s.call(&g, "main", &[Value::U32(41)])?;
            assert_eq!(out, CallOutcome::Returned(Value::U32(42)));
            Ok(())
        })
        .unwrap();
        assert!(!g.hooks().is_attached());

        let trace = TraceFile::parse(&bytes).unwrap();
        let kinds: Vec<EventKind> = trace.events.iter().map(|e| e.event.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::CallEnter,
                EventKind::CallbackEnter,
                EventKind::Return,
                EventKind::CallbackEnter,
                EventKind::IndexedWrite(tidemark_trace::ScalarType::U32),
                EventKind::Return,
                EventKind::Return,
            ]
        );
        let summary = TraceSummary::from_trace(&trace);
        assert_eq!(summary.max_depth, 2);
    }

    #[test]
    fn test_trap_is_recorded_as_throw() {
        let g = guest();
        let bytes = record(&g, TraceConfig::default(), |s| {
            assert!(s.call(&g, "trap", &[])?.is_throw());
            Ok(())
        })
        .unwrap();
        let trace = TraceFile::parse(&bytes).unwrap();
        assert_eq!(trace.events[1].event, Event::Throw);
    }

    #[test]
    fn test_missing_export_fails_recording() {
        let g = guest();
        let session = RecordingSession::attach(&g, TraceConfig::default()).unwrap();
        let err = session.call(&g, "absent", &[]).unwrap_err();
        assert!(matches!(err, TraceError::Guest(_)));
        assert_eq!(session.error(), Some(err.clone()));
        assert_eq!(session.finish().unwrap_err(), err);
    }

    #[test]
    fn test_second_session_rejected() {
        let g = guest();
        let first = RecordingSession::attach(&g, TraceConfig::default()).unwrap();
        assert!(matches!(
            RecordingSession::attach(&g, TraceConfig::default()),
            Err(TraceError::AlreadyAttached)
        ));
        drop(first);
        assert!(RecordingSession::attach(&g, TraceConfig::default()).is_ok());
    }

    #[test]
    fn test_reentrant_call_inside_callback() {
        let slot: Rc<RefCell<Option<Rc<RecordingSession>>>> = Rc::new(RefCell::new(None));
        let inner = slot.clone();
        let g = GuestModule::new(ModuleConfig::default())
            .unwrap()
            .with_export("outer", |g, _args| g.call_import("reenter", &[]))
            .with_export("leaf", |_g, _args| Ok(Value::I32(-1)))
            .with_import("reenter", move |ctx, _args| {
                let session = inner.borrow().clone();
                match session {
                    Some(s) => s
                        .call(ctx.guest(), "leaf", &[])
                        .unwrap_or_else(|e| CallOutcome::Threw(e.to_string())),
                    None => CallOutcome::Threw("no session".into()),
                }
            });

        let session = Rc::new(RecordingSession::attach(&g, TraceConfig::default()).unwrap());
        *slot.borrow_mut() = Some(session.clone());
        assert_eq!(
            session.call(&g, "outer", &[]).unwrap(),
            CallOutcome::Returned(Value::I32(-1))
        );
        slot.borrow_mut().take();

        let session = Rc::try_unwrap(session).unwrap();
        let trace = TraceFile::parse(&session.finish().unwrap()).unwrap();
        let kinds: Vec<EventKind> = trace.events.iter().map(|e| e.event.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::CallEnter,
                EventKind::CallbackEnter,
                EventKind::CallEnter,
                EventKind::Return,
                EventKind::Return,
                EventKind::Return,
            ]
        );
    }

    #[test]
    fn test_write_memory_helpers() {
        let g = guest();
        let session = RecordingSession::attach(&g, TraceConfig::default()).unwrap();
        session.write_memory(&g, 8, b"abc").unwrap();
        session.write_scalar(&g, 12, Scalar::F32(1.0)).unwrap();
        assert!(session.write_memory(&g, u32::MAX, b"x").is_err());
        assert_eq!(session.stats().writes, 2);
        let trace = TraceFile::parse(&session.finish().unwrap()).unwrap();
        assert_eq!(trace.events.len(), 2);
    }
}

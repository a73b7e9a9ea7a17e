//! Aggregate statistics over a parsed trace.

use crate::event::{Event, EventKind};
use crate::format::TraceFile;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tidemark_core::Direction;

/// Counts derived from one trace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Total events
    pub events: usize,
    /// Host-to-guest calls
    pub calls: usize,
    /// Guest-to-host callbacks
    pub callbacks: usize,
    /// Return events
    pub returns: usize,
    /// Throw events
    pub throws: usize,
    /// Bulk writes
    pub bulk_writes: usize,
    /// Total payload bytes of bulk writes
    pub bulk_bytes: usize,
    /// Indexed writes
    pub indexed_writes: usize,
    /// Deepest call nesting
    pub max_depth: usize,
    /// Enter count per direction and method, in first-seen order
    pub methods: IndexMap<String, usize>,
}

impl TraceSummary {
    /// Summarize `trace`
    #[must_use]
    pub fn from_trace(trace: &TraceFile) -> Self {
        let mut summary = Self {
            events: trace.events.len(),
            ..Self::default()
        };
        let mut depth = 0usize;
        for traced in &trace.events {
            match &traced.event {
                Event::Enter {
                    direction, method, ..
                } => {
                    depth += 1;
                    summary.max_depth = summary.max_depth.max(depth);
                    match direction {
                        Direction::Call => summary.calls += 1,
                        Direction::Callback => summary.callbacks += 1,
                    }
                    let name = trace
                        .method_name(*method)
                        .map_or_else(|_| method.to_string(), str::to_string);
                    *summary
                        .methods
                        .entry(format!("{direction} {name}"))
                        .or_insert(0) += 1;
                }
                Event::Return { .. } => {
                    depth = depth.saturating_sub(1);
                    summary.returns += 1;
                }
                Event::Throw => {
                    depth = depth.saturating_sub(1);
                    summary.throws += 1;
                }
                Event::BulkWrite { bytes, .. } => {
                    summary.bulk_writes += 1;
                    summary.bulk_bytes += bytes.len();
                }
                Event::IndexedWrite { .. } => summary.indexed_writes += 1,
            }
        }
        summary
    }

    /// Count for one event kind
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::CallEnter => self.calls,
            EventKind::CallbackEnter => self.callbacks,
            EventKind::Return => self.returns,
            EventKind::Throw => self.throws,
            EventKind::BulkWrite => self.bulk_writes,
            EventKind::IndexedWrite(_) => self.indexed_writes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AddressRef, WireValue};
    use crate::event::{Scalar, TracedEvent};
    use crate::strings::StringTable;
    use crate::typemap::TypeMapRegistry;
    use tidemark_core::MethodIndex;

    fn traced(event: Event) -> TracedEvent {
        TracedEvent { offset: 0, event }
    }

    #[test]
    fn test_summary_counts() {
        let trace = TraceFile {
            version: 1,
            strings: StringTable::new(vec!["draw".into(), "log".into()]),
            types: TypeMapRegistry::new(),
            events: vec![
                traced(Event::Enter {
                    direction: Direction::Call,
                    method: MethodIndex::from_raw(0),
                    args: vec![],
                }),
                traced(Event::Enter {
                    direction: Direction::Callback,
                    method: MethodIndex::from_raw(1),
                    args: vec![],
                }),
                traced(Event::Throw),
                traced(Event::BulkWrite {
                    target: AddressRef::Static(8),
                    bytes: vec![0; 12],
                }),
                traced(Event::IndexedWrite {
                    target: AddressRef::Static(8),
                    value: Scalar::F32(1.0),
                }),
                traced(Event::Return {
                    value: WireValue::Void,
                }),
            ],
        };
        let summary = TraceSummary::from_trace(&trace);
        assert_eq!(summary.events, 6);
        assert_eq!(summary.count(EventKind::CallEnter), 1);
        assert_eq!(summary.count(EventKind::CallbackEnter), 1);
        assert_eq!(summary.throws, 1);
        assert_eq!(summary.bulk_bytes, 12);
        assert_eq!(summary.indexed_writes, 1);
        assert_eq!(summary.max_depth, 2);
        assert_eq!(summary.methods.get("call draw"), Some(&1));
        assert_eq!(summary.methods.get("callback log"), Some(&1));
    }
}

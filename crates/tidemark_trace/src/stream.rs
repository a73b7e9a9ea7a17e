//! Event stream for sequential event access.

use crate::event::TracedEvent;

/// Event stream for reading events in recorded order
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    events: Vec<TracedEvent>,
    position: usize,
}

impl EventStream {
    /// Stream positioned at the first event
    pub fn new(events: Vec<TracedEvent>) -> Self {
        Self {
            events,
            position: 0,
        }
    }

    /// Consume the next event
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&TracedEvent> {
        let event = self.events.get(self.position)?;
        self.position += 1;
        Some(event)
    }

    /// Next event without consuming it
    pub fn peek(&self) -> Option<&TracedEvent> {
        self.events.get(self.position)
    }

    /// Events not yet consumed
    pub fn remaining(&self) -> usize {
        self.events.len().saturating_sub(self.position)
    }

    /// Whether every event was consumed
    pub fn is_end(&self) -> bool {
        self.position >= self.events.len()
    }

    /// Index of the next event to be read
    pub fn position(&self) -> usize {
        self.position
    }

    /// Rewind to the first event
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Total events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the stream holds no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn make_test_event(offset: usize) -> TracedEvent {
        TracedEvent {
            offset,
            event: Event::Throw,
        }
    }

    #[test]
    fn test_stream_next() {
        let mut stream = EventStream::new(vec![make_test_event(10), make_test_event(11)]);
        assert_eq!(stream.next().unwrap().offset, 10);
        assert_eq!(stream.next().unwrap().offset, 11);
        assert!(stream.next().is_none());
        assert!(stream.is_end());
    }

    #[test]
    fn test_stream_peek() {
        let stream = EventStream::new(vec![make_test_event(0)]);
        assert_eq!(stream.peek().unwrap().offset, 0);
        assert_eq!(stream.peek().unwrap().offset, 0);
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn test_stream_remaining() {
        let mut stream = EventStream::new(vec![make_test_event(0), make_test_event(1)]);
        assert_eq!(stream.remaining(), 2);
        stream.next();
        assert_eq!(stream.remaining(), 1);
        stream.reset();
        assert_eq!(stream.remaining(), 2);
        assert_eq!(stream.len(), 2);
    }
}

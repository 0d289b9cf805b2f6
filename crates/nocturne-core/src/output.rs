//! Output sink abstraction.
//!
//! The engine emits MIDI through a single polymorphic seam: anything
//! implementing [`MidiSink`]. The CLI provides a midir-backed sink;
//! [`NullSink`] satisfies the trait when MIDI output is disabled, and
//! [`CollectorSink`] records traffic for tests.

use std::sync::Mutex;

/// Destination for the engine's MIDI traffic.
///
/// Implementations must be cheap and non-blocking: `note_on` and
/// `note_off` are called from the clock and scheduler threads.
pub trait MidiSink: Send + Sync {
    /// Send a note-on. `channel` is 1-based.
    fn note_on(&self, note: u8, velocity: u8, channel: u8);

    /// Send a note-off. `channel` is 1-based.
    fn note_off(&self, note: u8, channel: u8);

    /// Send a control change. `channel` is 1-based.
    fn control_change(&self, controller: u8, value: u8, channel: u8);

    /// Release the underlying port. Called once during shutdown, after
    /// all pending note-offs have been flushed.
    fn close(&self) {}
}

/// Sink that discards everything. Used when MIDI output is disabled.
#[derive(Default)]
pub struct NullSink;

impl MidiSink for NullSink {
    fn note_on(&self, _note: u8, _velocity: u8, _channel: u8) {}
    fn note_off(&self, _note: u8, _channel: u8) {}
    fn control_change(&self, _controller: u8, _value: u8, _channel: u8) {}
}

/// One recorded sink call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    NoteOn { note: u8, velocity: u8, channel: u8 },
    NoteOff { note: u8, channel: u8 },
    ControlChange { controller: u8, value: u8, channel: u8 },
}

/// Sink that records every call, for assertions in tests.
#[derive(Default)]
pub struct CollectorSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn note_ons(&self) -> Vec<SinkEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, SinkEvent::NoteOn { .. }))
            .collect()
    }

    pub fn note_offs(&self) -> Vec<SinkEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, SinkEvent::NoteOff { .. }))
            .collect()
    }
}

impl MidiSink for CollectorSink {
    fn note_on(&self, note: u8, velocity: u8, channel: u8) {
        self.events.lock().unwrap().push(SinkEvent::NoteOn {
            note,
            velocity,
            channel,
        });
    }

    fn note_off(&self, note: u8, channel: u8) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::NoteOff { note, channel });
    }

    fn control_change(&self, controller: u8, value: u8, channel: u8) {
        self.events.lock().unwrap().push(SinkEvent::ControlChange {
            controller,
            value,
            channel,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_records_in_order() {
        let sink = CollectorSink::new();
        sink.note_on(60, 100, 1);
        sink.control_change(74, 64, 1);
        sink.note_off(60, 1);

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            SinkEvent::NoteOn {
                note: 60,
                velocity: 100,
                channel: 1
            }
        );
        assert_eq!(sink.note_ons().len(), 1);
        assert_eq!(sink.note_offs().len(), 1);
    }
}

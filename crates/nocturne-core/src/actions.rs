//! Semantic event dispatch.
//!
//! [`ActionHandler`] turns inbound [`SemanticEvent`]s into state
//! writes, manual sequencer triggers, and outbound control changes.
//! Every event, whatever its kind, counts as an interaction and resets
//! the idle timer first.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::events::{ControlChangeEvent, EventKind, SemanticEvent};
use crate::idle::InteractionSink;
use crate::sequencer::{Sequencer, PATTERN_PRESETS, PROBABILITY_PRESETS};
use crate::state::{DirectionPattern, ParamValue, State};

/// Callback receiving outbound control changes.
pub type CcCallback = Arc<dyn Fn(ControlChangeEvent) + Send + Sync>;

/// Translates controller gestures into engine operations.
pub struct ActionHandler {
    state: Arc<State>,
    sequencer: Arc<Sequencer>,
    interaction: Arc<dyn InteractionSink>,
    /// Parameter name to outbound controller number.
    cc_routes: HashMap<String, u8>,
    cc_callback: RwLock<Option<CcCallback>>,
    output_channel: u8,
    n_scales: usize,
}

impl ActionHandler {
    pub fn new(
        state: Arc<State>,
        sequencer: Arc<Sequencer>,
        interaction: Arc<dyn InteractionSink>,
        cc_routes: HashMap<String, u8>,
        output_channel: u8,
        n_scales: usize,
    ) -> Self {
        Self {
            state,
            sequencer,
            interaction,
            cc_routes,
            cc_callback: RwLock::new(None),
            output_channel,
            n_scales: n_scales.max(1),
        }
    }

    pub fn set_cc_callback(&self, callback: CcCallback) {
        *self.cc_callback.write().unwrap() = Some(callback);
    }

    /// Dispatch one event.
    pub fn handle(&self, event: &SemanticEvent) {
        self.interaction.touch();
        let value = event.value.min(127);
        let fraction = value as f64 / 127.0;

        match &event.kind {
            EventKind::TriggerStep => {
                self.sequencer.trigger_step(value, event.raw_note);
            }
            EventKind::Tempo => {
                self.set("bpm", ParamValue::Float(60.0 + fraction * 140.0));
            }
            EventKind::Swing => {
                self.set("swing", ParamValue::Float(fraction * 0.5));
            }
            EventKind::Density => {
                self.set("density", ParamValue::Float(fraction));
            }
            EventKind::NoteProbability => {
                self.set("note_probability", ParamValue::Float(fraction));
            }
            EventKind::SequenceLength => {
                let length = (1 + (value as i64 * 31 + 63) / 127).clamp(1, 32);
                self.set("sequence_length", ParamValue::Int(length));
            }
            EventKind::ScaleSelect => {
                let index = ((value / 16) as usize).min(self.n_scales - 1);
                self.set("scale_index", ParamValue::Int(index as i64));
            }
            EventKind::RootNoteUp => self.nudge_root(1),
            EventKind::RootNoteDown => self.nudge_root(-1),
            EventKind::PatternPreset => {
                let name = PATTERN_PRESETS[((value / 16) as usize).min(PATTERN_PRESETS.len() - 1)];
                self.sequencer.apply_pattern_preset(name);
            }
            EventKind::ProbabilityPreset => {
                let name =
                    PROBABILITY_PRESETS[((value / 16) as usize).min(PROBABILITY_PRESETS.len() - 1)];
                self.sequencer.apply_probability_preset(name);
            }
            EventKind::DirectionPattern => {
                let index = ((value as usize * DirectionPattern::ALL.len()) / 128)
                    .min(DirectionPattern::ALL.len() - 1);
                self.set(
                    "direction_pattern",
                    ParamValue::Direction(DirectionPattern::ALL[index]),
                );
            }
            EventKind::Mode => {
                self.set("mode", ParamValue::Int((value / 16) as i64));
            }
            EventKind::Palette => {
                self.set("palette", ParamValue::Int((value / 16) as i64));
            }
            EventKind::Voices => {
                let voices = (1 + (value as i64 * 3 + 63) / 127).clamp(1, 4);
                self.set("voices", ParamValue::Int(voices));
            }
            EventKind::Drift => {
                self.set("drift", ParamValue::Float(-0.2 + fraction * 0.4));
            }
            EventKind::ChaosLock => {
                let current = self.state.get_bool("chaos_lock").unwrap_or(false);
                self.set("chaos_lock", ParamValue::Bool(!current));
            }
            EventKind::CcParameter(name) => {
                self.set(name, ParamValue::Int(value as i64));
                self.forward_cc(name, value);
            }
        }
        log::debug!(
            "action_handled kind={:?} source={} value={value}",
            event.kind,
            event.source
        );
    }

    fn set(&self, key: &str, value: ParamValue) {
        self.state.set(key, value, "midi");
    }

    fn nudge_root(&self, delta: i64) {
        let current = self.state.get_i64("root_note").unwrap_or(60);
        self.set("root_note", ParamValue::Int((current + delta).clamp(0, 127)));
    }

    /// Continuous parameters with a configured controller route also
    /// go straight out to the synth.
    fn forward_cc(&self, parameter: &str, value: u8) {
        let Some(&controller) = self.cc_routes.get(parameter) else {
            return;
        };
        let callback = self.cc_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(ControlChangeEvent {
                controller,
                value,
                channel: self.output_channel,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSource, NoteEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingSink(AtomicUsize);

    impl InteractionSink for CountingSink {
        fn touch(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        state: Arc<State>,
        handler: ActionHandler,
        touches: Arc<CountingSink>,
        notes: Arc<Mutex<Vec<NoteEvent>>>,
        ccs: Arc<Mutex<Vec<ControlChangeEvent>>>,
    }

    fn fixture() -> Fixture {
        let state = Arc::new(State::new(5));
        let sequencer = Arc::new(Sequencer::new(
            state.clone(),
            vec!["major".to_string(), "minor".to_string()],
            24,
            1,
        ));
        let notes = Arc::new(Mutex::new(Vec::new()));
        let note_sink = notes.clone();
        sequencer.set_note_callback(Arc::new(move |event| {
            note_sink.lock().unwrap().push(event);
        }));

        let touches = Arc::new(CountingSink(AtomicUsize::new(0)));
        let mut routes = HashMap::new();
        routes.insert("filter_cutoff".to_string(), 74);

        let handler = ActionHandler::new(
            state.clone(),
            sequencer,
            touches.clone(),
            routes,
            1,
            5,
        );
        let ccs = Arc::new(Mutex::new(Vec::new()));
        let cc_sink = ccs.clone();
        handler.set_cc_callback(Arc::new(move |event| {
            cc_sink.lock().unwrap().push(event);
        }));

        Fixture {
            state,
            handler,
            touches,
            notes,
            ccs,
        }
    }

    fn cc_event(kind: EventKind, value: u8) -> SemanticEvent {
        SemanticEvent::new(kind, EventSource::Cc, value)
    }

    #[test]
    fn test_every_event_touches_idle() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::Tempo, 64));
        f.handler.handle(&cc_event(EventKind::Density, 10));
        assert_eq!(f.touches.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_tempo_scaling() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::Tempo, 0));
        assert_eq!(f.state.get_f64("bpm"), Some(60.0));
        f.handler.handle(&cc_event(EventKind::Tempo, 127));
        assert_eq!(f.state.get_f64("bpm"), Some(200.0));
        f.handler.handle(&cc_event(EventKind::Tempo, 64));
        let bpm = f.state.get_f64("bpm").unwrap();
        assert!((bpm - (60.0 + 64.0 / 127.0 * 140.0)).abs() < 0.1);
    }

    #[test]
    fn test_swing_and_density_scaling() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::Swing, 127));
        assert_eq!(f.state.get_f64("swing"), Some(0.5));
        f.handler.handle(&cc_event(EventKind::Swing, 0));
        assert_eq!(f.state.get_f64("swing"), Some(0.0));

        f.handler.handle(&cc_event(EventKind::Density, 100));
        let density = f.state.get_f64("density").unwrap();
        assert!((density - 100.0 / 127.0).abs() < 0.01);
    }

    #[test]
    fn test_sequence_length_buckets() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::SequenceLength, 0));
        assert_eq!(f.state.get_i64("sequence_length"), Some(1));
        f.handler.handle(&cc_event(EventKind::SequenceLength, 127));
        assert_eq!(f.state.get_i64("sequence_length"), Some(32));
        f.handler.handle(&cc_event(EventKind::SequenceLength, 64));
        assert_eq!(f.state.get_i64("sequence_length"), Some(17));
    }

    #[test]
    fn test_scale_select_clamps_to_scale_count() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::ScaleSelect, 32));
        assert_eq!(f.state.get_i64("scale_index"), Some(2));
        f.handler.handle(&cc_event(EventKind::ScaleSelect, 127));
        // Only five scales configured.
        assert_eq!(f.state.get_i64("scale_index"), Some(4));
    }

    #[test]
    fn test_root_note_up_down_clamped() {
        let f = fixture();
        f.handler
            .handle(&SemanticEvent::new(EventKind::RootNoteUp, EventSource::Button, 100));
        assert_eq!(f.state.get_i64("root_note"), Some(61));
        f.handler
            .handle(&SemanticEvent::new(EventKind::RootNoteDown, EventSource::Button, 100));
        assert_eq!(f.state.get_i64("root_note"), Some(60));

        f.state.set("root_note", ParamValue::Int(127), "test");
        f.handler
            .handle(&SemanticEvent::new(EventKind::RootNoteUp, EventSource::Button, 100));
        assert_eq!(f.state.get_i64("root_note"), Some(127));
    }

    #[test]
    fn test_direction_buckets_span_all_patterns() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::DirectionPattern, 0));
        assert_eq!(
            f.state.get_direction("direction_pattern"),
            Some(DirectionPattern::Forward)
        );
        f.handler.handle(&cc_event(EventKind::DirectionPattern, 127));
        assert_eq!(
            f.state.get_direction("direction_pattern"),
            Some(DirectionPattern::Fugue)
        );
        f.handler.handle(&cc_event(EventKind::DirectionPattern, 64));
        assert_eq!(
            f.state.get_direction("direction_pattern"),
            Some(DirectionPattern::PingPong)
        );
    }

    #[test]
    fn test_chaos_lock_toggles() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::ChaosLock, 127));
        assert_eq!(f.state.get_bool("chaos_lock"), Some(true));
        f.handler.handle(&cc_event(EventKind::ChaosLock, 127));
        assert_eq!(f.state.get_bool("chaos_lock"), Some(false));
    }

    #[test]
    fn test_drift_scaling() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::Drift, 0));
        assert!((f.state.get_f64("drift").unwrap() + 0.2).abs() < 1e-9);
        f.handler.handle(&cc_event(EventKind::Drift, 127));
        assert!((f.state.get_f64("drift").unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_pattern_preset_by_bucket() {
        let f = fixture();
        // Bucket 1 is "offbeat".
        f.handler.handle(&cc_event(EventKind::PatternPreset, 16));
        assert_eq!(
            f.state.get_bool_list("step_pattern").unwrap(),
            vec![false, true, false, true, false, true, false, true]
        );
    }

    #[test]
    fn test_voices_mapping() {
        let f = fixture();
        f.handler.handle(&cc_event(EventKind::Voices, 0));
        assert_eq!(f.state.get_i64("voices"), Some(1));
        f.handler.handle(&cc_event(EventKind::Voices, 127));
        assert_eq!(f.state.get_i64("voices"), Some(4));
    }

    #[test]
    fn test_trigger_step_emits_note() {
        let f = fixture();
        f.state.set("velocity_range", ParamValue::Int(0), "test");
        let event = SemanticEvent::new(EventKind::TriggerStep, EventSource::Button, 100)
            .with_raw_note(64);
        f.handler.handle(&event);

        let notes = f.notes.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].pitch, Some(64));
        assert_eq!(notes[0].velocity, 80);
        assert_eq!(f.state.get_i64("step_position"), Some(1));
    }

    #[test]
    fn test_cc_parameter_writes_state_and_forwards() {
        let f = fixture();
        f.handler.handle(&cc_event(
            EventKind::CcParameter("filter_cutoff".to_string()),
            85,
        ));
        assert_eq!(f.state.get_i64("filter_cutoff"), Some(85));

        let ccs = f.ccs.lock().unwrap();
        assert_eq!(ccs.len(), 1);
        assert_eq!(
            ccs[0],
            ControlChangeEvent {
                controller: 74,
                value: 85,
                channel: 1
            }
        );
    }

    #[test]
    fn test_unrouted_cc_parameter_still_writes_state() {
        let f = fixture();
        f.handler.handle(&cc_event(
            EventKind::CcParameter("reverb_mix".to_string()),
            45,
        ));
        assert_eq!(f.state.get_i64("reverb_mix"), Some(45));
        assert!(f.ccs.lock().unwrap().is_empty());
    }
}

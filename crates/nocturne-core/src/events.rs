//! Event types flowing through the engine.
//!
//! Three event families cross the engine boundary:
//!
//! - [`SemanticEvent`] - inbound, a decoded controller gesture
//! - [`NoteEvent`] - outbound, a note produced by the sequencer
//! - [`ControlChangeEvent`] - outbound, a continuous parameter change
//!
//! [`StateChange`] notifications are internal but public so listeners
//! registered on the state store can inspect them.

use crate::state::ParamValue;

/// Where a semantic event originated on the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSource {
    Button,
    Cc,
    Joystick,
    Switch,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Button => write!(f, "button"),
            EventSource::Cc => write!(f, "cc"),
            EventSource::Joystick => write!(f, "joystick"),
            EventSource::Switch => write!(f, "switch"),
        }
    }
}

/// The closed set of controller gestures the engine understands.
///
/// The input router maps raw notes and CC numbers onto these; anything
/// it cannot map is dropped before it reaches the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Manually advance the sequencer one step and sound it.
    TriggerStep,
    Tempo,
    Swing,
    Density,
    NoteProbability,
    SequenceLength,
    ScaleSelect,
    RootNoteUp,
    RootNoteDown,
    PatternPreset,
    ProbabilityPreset,
    DirectionPattern,
    Mode,
    Palette,
    Voices,
    Drift,
    ChaosLock,
    /// Write straight into the named continuous state parameter
    /// (e.g. `filter_cutoff`) and forward it to the synth.
    CcParameter(String),
}

impl EventKind {
    /// Parse a mapping-config action name.
    pub fn from_action(name: &str) -> Option<Self> {
        let kind = match name {
            "trigger_step" => EventKind::TriggerStep,
            "tempo" => EventKind::Tempo,
            "swing" => EventKind::Swing,
            "density" => EventKind::Density,
            "note_probability" => EventKind::NoteProbability,
            "sequence_length" => EventKind::SequenceLength,
            "scale_select" => EventKind::ScaleSelect,
            "root_note_up" => EventKind::RootNoteUp,
            "root_note_down" => EventKind::RootNoteDown,
            "pattern_preset" => EventKind::PatternPreset,
            "probability_preset" => EventKind::ProbabilityPreset,
            "direction_pattern" => EventKind::DirectionPattern,
            "mode" => EventKind::Mode,
            "palette" => EventKind::Palette,
            "voices" => EventKind::Voices,
            "drift" => EventKind::Drift,
            "chaos_lock" => EventKind::ChaosLock,
            "filter_cutoff" | "reverb_mix" | "master_volume" => {
                EventKind::CcParameter(name.to_string())
            }
            _ => return None,
        };
        Some(kind)
    }
}

/// A decoded controller gesture.
///
/// `value` is the raw 0-127 MIDI value (velocity for buttons, CC value
/// for knobs); the action handler owns all scaling into parameter
/// domains.
#[derive(Clone, Debug)]
pub struct SemanticEvent {
    pub kind: EventKind,
    pub source: EventSource,
    pub value: u8,
    pub raw_note: Option<u8>,
    pub raw_cc: Option<u8>,
    /// 1-based MIDI channel.
    pub channel: u8,
}

impl SemanticEvent {
    /// Create an event with no raw note/CC attribution.
    pub fn new(kind: EventKind, source: EventSource, value: u8) -> Self {
        Self {
            kind,
            source,
            value,
            raw_note: None,
            raw_cc: None,
            channel: 1,
        }
    }

    pub fn with_raw_note(mut self, note: u8) -> Self {
        self.raw_note = Some(note);
        self
    }

    pub fn with_raw_cc(mut self, cc: u8) -> Self {
        self.raw_cc = Some(cc);
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }
}

/// A note produced by the sequencer or fugue timeline.
///
/// A rest (`pitch == None`) occupies musical time but produces no MIDI
/// output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteEvent {
    pub pitch: Option<u8>,
    pub velocity: u8,
    /// How long the note should sound; the note scheduler emits the
    /// matching note-off this many seconds after the note-on.
    pub duration_seconds: f64,
    pub step_index: usize,
    /// 0 in all monophonic modes.
    pub voice_index: usize,
}

impl NoteEvent {
    pub fn new(pitch: u8, velocity: u8, duration_seconds: f64, step_index: usize) -> Self {
        Self {
            pitch: Some(pitch),
            velocity,
            duration_seconds,
            step_index,
            voice_index: 0,
        }
    }

    pub fn rest(duration_seconds: f64, step_index: usize) -> Self {
        Self {
            pitch: None,
            velocity: 0,
            duration_seconds,
            step_index,
            voice_index: 0,
        }
    }

    pub fn with_voice(mut self, voice_index: usize) -> Self {
        self.voice_index = voice_index;
        self
    }

    pub fn is_rest(&self) -> bool {
        self.pitch.is_none()
    }
}

/// A continuous controller value bound for an external synth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlChangeEvent {
    pub controller: u8,
    pub value: u8,
    /// 1-based MIDI channel.
    pub channel: u8,
}

/// A single state parameter change, delivered to state listeners.
#[derive(Clone, Debug)]
pub struct StateChange {
    pub parameter: String,
    pub old_value: Option<ParamValue>,
    pub new_value: ParamValue,
    /// Free-form origin tag: "midi", "mutation", "idle", "idle_restore",
    /// "config", "sequencer".
    pub source: String,
}

//! Raw-MIDI to semantic-event routing.
//!
//! The router owns the mapping section of the config: which notes are
//! buttons for which action, which CC numbers drive which parameter.
//! Unmapped input is dropped here, before it reaches the engine.

use std::collections::HashMap;

use anyhow::Context;
use nocturne_core::{Config, EventKind, EventSource, SemanticEvent};

use crate::midi_in::MidiMessage;

/// Maps raw notes and CCs onto semantic events.
pub struct Router {
    note_map: HashMap<u8, EventKind>,
    cc_map: HashMap<u8, EventKind>,
    /// 0-based wire channel the router listens on.
    input_channel: u8,
}

impl Router {
    /// Build the maps from the config. Button keys may be ranges
    /// (`"60-69"`); CC keys are single numbers. Unknown action names
    /// were already rejected by config validation.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut note_map = HashMap::new();
        for (key, action) in &config.mapping.buttons {
            let kind = EventKind::from_action(action)
                .with_context(|| format!("unknown button action '{action}'"))?;
            for note in parse_note_range(key)? {
                note_map.insert(note, kind.clone());
            }
        }

        let mut cc_map = HashMap::new();
        for (key, action) in &config.mapping.ccs {
            let kind = EventKind::from_action(action)
                .with_context(|| format!("unknown cc action '{action}'"))?;
            let cc: u8 = key
                .parse()
                .with_context(|| format!("invalid CC number '{key}' in mapping.ccs"))?;
            cc_map.insert(cc, kind);
        }

        log::debug!(
            "router_built notes={} ccs={}",
            note_map.len(),
            cc_map.len()
        );
        Ok(Self {
            note_map,
            cc_map,
            input_channel: config.midi.input_channel.saturating_sub(1),
        })
    }

    /// Translate one parsed message. None when the message is on the
    /// wrong channel, unmapped, or a release.
    pub fn route(&self, msg: &MidiMessage) -> Option<SemanticEvent> {
        match *msg {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } if channel == self.input_channel => {
                let kind = self.note_map.get(&note)?.clone();
                Some(
                    SemanticEvent::new(kind, EventSource::Button, velocity)
                        .with_raw_note(note)
                        .with_channel(channel + 1),
                )
            }
            // Button releases carry no action.
            MidiMessage::NoteOff { .. } => None,
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } if channel == self.input_channel => {
                let kind = self.cc_map.get(&controller)?.clone();
                Some(
                    SemanticEvent::new(kind, EventSource::Cc, value)
                        .with_raw_cc(controller)
                        .with_channel(channel + 1),
                )
            }
            _ => None,
        }
    }
}

/// Parse `"60"` or `"60-69"` into the notes it covers.
fn parse_note_range(key: &str) -> anyhow::Result<Vec<u8>> {
    match key.split_once('-') {
        Some((start, end)) => {
            let start: u8 = start
                .trim()
                .parse()
                .with_context(|| format!("invalid note range '{key}'"))?;
            let end: u8 = end
                .trim()
                .parse()
                .with_context(|| format!("invalid note range '{key}'"))?;
            if start > end {
                anyhow::bail!("reversed note range '{key}'");
            }
            Ok((start..=end).collect())
        }
        None => {
            let note: u8 = key
                .trim()
                .parse()
                .with_context(|| format!("invalid note '{key}'"))?;
            Ok(vec![note])
        }
    }
}

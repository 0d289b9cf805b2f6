//! MIDI output adapter.
//!
//! A midir-backed [`MidiSink`]. Channels arrive 1-based from the
//! engine and go on the wire 0-based. Closing sends All Notes Off on
//! the configured channel as a belt-and-braces companion to the note
//! scheduler's drain.

use std::sync::Mutex;

use midir::{MidiOutput, MidiOutputConnection};
use nocturne_core::MidiSink;

const ALL_NOTES_OFF: u8 = 123;

/// midir-backed output sink.
pub struct MidirSink {
    connection: Mutex<Option<MidiOutputConnection>>,
    port_name: String,
}

impl MidirSink {
    /// List available output port names.
    pub fn list_ports() -> anyhow::Result<Vec<String>> {
        let midi_out = MidiOutput::new("nocturne-probe")?;
        Ok(midi_out
            .ports()
            .iter()
            .map(|p| {
                midi_out
                    .port_name(p)
                    .unwrap_or_else(|_| "<unknown>".to_string())
            })
            .collect())
    }

    /// Open a port by name substring, or for `"auto"` the first port
    /// that does not look like a loopback.
    pub fn open(selector: &str) -> anyhow::Result<Self> {
        let midi_out = MidiOutput::new("nocturne")?;
        let ports = midi_out.ports();
        if ports.is_empty() {
            anyhow::bail!("no MIDI output ports available");
        }

        let names: Vec<String> = ports
            .iter()
            .map(|p| {
                midi_out
                    .port_name(p)
                    .unwrap_or_else(|_| "<unknown>".to_string())
            })
            .collect();

        let wanted = selector.to_lowercase();
        let index = if selector == "auto" {
            names
                .iter()
                .position(|n| {
                    let lower = n.to_lowercase();
                    !lower.contains("through") && !lower.contains("virtual") && !lower.contains("loopback")
                })
                .unwrap_or(0)
        } else {
            names
                .iter()
                .position(|n| n.to_lowercase().contains(&wanted))
                .ok_or_else(|| anyhow::anyhow!("no MIDI output port matching '{selector}'"))?
        };

        let name = names[index].clone();
        let connection = midi_out
            .connect(&ports[index], "nocturne-output")
            .map_err(|e| anyhow::anyhow!("failed to open output '{name}': {e}"))?;

        log::info!("midi_output_connected port={name}");
        Ok(Self {
            connection: Mutex::new(Some(connection)),
            port_name: name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn send(&self, bytes: &[u8]) {
        let mut connection = self.connection.lock().unwrap();
        if let Some(conn) = connection.as_mut() {
            if let Err(e) = conn.send(bytes) {
                log::error!("midi_send_failed bytes={bytes:?} error={e}");
            }
        }
    }
}

impl MidiSink for MidirSink {
    fn note_on(&self, note: u8, velocity: u8, channel: u8) {
        let wire_channel = channel.saturating_sub(1) & 0x0F;
        self.send(&[0x90 | wire_channel, note & 0x7F, velocity & 0x7F]);
    }

    fn note_off(&self, note: u8, channel: u8) {
        let wire_channel = channel.saturating_sub(1) & 0x0F;
        self.send(&[0x80 | wire_channel, note & 0x7F, 0]);
    }

    fn control_change(&self, controller: u8, value: u8, channel: u8) {
        let wire_channel = channel.saturating_sub(1) & 0x0F;
        self.send(&[0xB0 | wire_channel, controller & 0x7F, value & 0x7F]);
    }

    fn close(&self) {
        let mut guard = self.connection.lock().unwrap();
        if let Some(mut conn) = guard.take() {
            for channel in 0..16u8 {
                let _ = conn.send(&[0xB0 | channel, ALL_NOTES_OFF, 0]);
            }
            conn.close();
            log::info!("midi_output_closed port={}", self.port_name);
        }
    }
}

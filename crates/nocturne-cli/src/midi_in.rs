//! MIDI input adapter.
//!
//! Opens a midir input port and parses raw bytes into [`MidiMessage`]s
//! delivered over a crossbeam channel. The connection object must stay
//! alive for the callback to keep firing, so the manager owns it.

use crossbeam_channel::{unbounded, Receiver, Sender};
use midir::{MidiInput, MidiInputConnection};

/// The subset of MIDI messages the engine cares about.
#[derive(Debug, Clone, Copy)]
pub enum MidiMessage {
    /// Channel is 0-based as on the wire.
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
}

impl MidiMessage {
    /// Parse raw MIDI bytes. Returns None for anything the engine
    /// does not consume (clock, sysex, aftertouch, ...).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        let status = bytes[0];
        let channel = status & 0x0F;

        match status & 0xF0 {
            0x90 if bytes.len() >= 3 => {
                let (note, velocity) = (bytes[1], bytes[2]);
                if velocity == 0 {
                    // Note-on with velocity 0 is a note-off.
                    Some(MidiMessage::NoteOff { channel, note })
                } else {
                    Some(MidiMessage::NoteOn {
                        channel,
                        note,
                        velocity,
                    })
                }
            }
            0x80 if bytes.len() >= 3 => Some(MidiMessage::NoteOff {
                channel,
                note: bytes[1],
            }),
            0xB0 if bytes.len() >= 3 => Some(MidiMessage::ControlChange {
                channel,
                controller: bytes[1],
                value: bytes[2],
            }),
            _ => None,
        }
    }
}

/// Owns the midir connection and feeds parsed messages to a channel.
pub struct MidiInputManager {
    message_tx: Sender<MidiMessage>,
    connection: Option<MidiInputConnection<()>>,
    port_name: Option<String>,
}

impl MidiInputManager {
    pub fn new() -> (Self, Receiver<MidiMessage>) {
        let (tx, rx) = unbounded();
        (
            Self {
                message_tx: tx,
                connection: None,
                port_name: None,
            },
            rx,
        )
    }

    /// List available input port names.
    pub fn list_ports() -> anyhow::Result<Vec<String>> {
        let midi_in = MidiInput::new("nocturne-probe")?;
        Ok(midi_in
            .ports()
            .iter()
            .map(|p| {
                midi_in
                    .port_name(p)
                    .unwrap_or_else(|_| "<unknown>".to_string())
            })
            .collect())
    }

    /// Open a port by name substring (case-insensitive), or the first
    /// port for `"auto"`.
    pub fn open(&mut self, selector: &str) -> anyhow::Result<String> {
        let midi_in = MidiInput::new("nocturne")?;
        let ports = midi_in.ports();
        if ports.is_empty() {
            anyhow::bail!("no MIDI input ports available");
        }

        let wanted = selector.to_lowercase();
        let port = if selector == "auto" {
            ports.first()
        } else {
            ports.iter().find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.to_lowercase().contains(&wanted))
                    .unwrap_or(false)
            })
        };
        let port = port
            .ok_or_else(|| anyhow::anyhow!("no MIDI input port matching '{selector}'"))?;
        let name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| "<unknown>".to_string());

        let tx = self.message_tx.clone();
        let connection = midi_in
            .connect(
                port,
                "nocturne-input",
                move |_timestamp, bytes, _| {
                    if let Some(msg) = MidiMessage::from_bytes(bytes) {
                        log::debug!("midi_in {msg:?}");
                        let _ = tx.send(msg);
                    }
                },
                (),
            )
            .map_err(|e| anyhow::anyhow!("failed to connect to '{name}': {e}"))?;

        self.connection = Some(connection);
        self.port_name = Some(name.clone());
        log::info!("midi_input_connected port={name}");
        Ok(name)
    }

    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            log::info!("midi_input_closed port={:?}", self.port_name.take());
        }
    }
}

impl Drop for MidiInputManager {
    fn drop(&mut self) {
        self.close();
    }
}

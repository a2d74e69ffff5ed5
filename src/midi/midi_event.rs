//! 3 byte MIDI messages and the structured event that goes over the wire.
//!
//! Devices hand us raw `[status, note, velocity]` triples.  Between players the same
//! event travels as json: `{"command": 9, "note": 60, "velocity": 100}`.  The command is
//! the top nibble of the status byte; the channel in the bottom nibble is dropped.
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NOTE_OFF: u8 = 0x08;
pub const NOTE_ON: u8 = 0x09;

/// The two commands the jam cares about.  Anything else is carried but ignored.
#[derive(FromPrimitive, PartialEq, Debug, Clone, Copy)]
pub enum MidiCommand {
    NoteOff = 8,
    NoteOn = 9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub command: u8,
    pub note: u8,
    pub velocity: u8,
}

impl MidiEvent {
    pub fn new(command: u8, note: u8, velocity: u8) -> MidiEvent {
        MidiEvent {
            command,
            note,
            velocity,
        }
    }
    pub fn note_on(note: u8, velocity: u8) -> MidiEvent {
        MidiEvent::new(NOTE_ON, note, velocity)
    }
    pub fn note_off(note: u8) -> MidiEvent {
        MidiEvent::new(NOTE_OFF, note, 0)
    }
    /// None for any command other than note on/off
    pub fn kind(&self) -> Option<MidiCommand> {
        MidiCommand::from_u8(self.command)
    }
    fn note_name(&self) -> String {
        if self.note <= 127 {
            wmidi::Note::from_u8_lossy(self.note).to_string()
        } else {
            self.note.to_string()
        }
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind() {
            Some(cmd) => write!(f, "{{ {:?} {} vel: {} }}", cmd, self.note_name(), self.velocity),
            None => write!(
                f,
                "{{ cmd: {} note: {} vel: {} }}",
                self.command, self.note, self.velocity
            ),
        }
    }
}

/// split a 3 byte message.  Callers must have checked the length already.
pub fn decode(bytes: &[u8; 3]) -> MidiEvent {
    let status = bytes[0];
    // channel (status & 0x0f) is not used by the jam
    MidiEvent {
        command: status >> 4,
        note: bytes[1],
        velocity: bytes[2],
    }
}

/// build the 3 byte message for an event.  Channel is always 0.
pub fn encode(event: &MidiEvent) -> [u8; 3] {
    [(event.command & 0x0f) << 4, event.note, event.velocity]
}

/// Filter for raw device input.  Anything that is not exactly 3 bytes (sysex, clock,
/// running status fragments) is dropped without complaint.
pub fn from_device_message(bytes: &[u8]) -> Option<MidiEvent> {
    let triple: &[u8; 3] = bytes.try_into().ok()?;
    Some(decode(triple))
}

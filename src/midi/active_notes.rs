//! Which notes are sounding right now.
//!
//! Two independent streams feed the tracker: events arriving from other players
//! ("remote") and events this player makes on a device or the on-screen keyboard
//! ("local").  Both are applied to the same list.  The list is a multiset: the same
//! note pressed from both sides shows up twice and each note off removes one of them.
use log::trace;
use std::cell::RefCell;
use std::rc::Rc;

use super::midi_event::{MidiCommand, MidiEvent};

/// Cheap to clone; every clone shares the same set.  Handlers for either stream can
/// each hold a clone and call in whenever their events arrive.
#[derive(Clone, Default)]
pub struct ActiveNoteTracker {
    notes: Rc<RefCell<Vec<u8>>>,
}

impl ActiveNoteTracker {
    pub fn new() -> ActiveNoteTracker {
        ActiveNoteTracker::default()
    }

    pub fn apply_remote(&self, event: &MidiEvent) {
        trace!("remote note event: {}", event);
        self.apply(event);
    }

    pub fn apply_local(&self, event: &MidiEvent) {
        trace!("local note event: {}", event);
        self.apply(event);
    }

    fn apply(&self, event: &MidiEvent) {
        let mut notes = self.notes.borrow_mut();
        match event.kind() {
            Some(MidiCommand::NoteOn) => notes.push(event.note),
            Some(MidiCommand::NoteOff) => {
                if let Some(idx) = notes.iter().position(|n| *n == event.note) {
                    notes.remove(idx);
                }
            }
            None => {}
        }
    }

    /// snapshot of the sounding notes in the order they were struck
    pub fn active_notes(&self) -> Vec<u8> {
        self.notes.borrow().clone()
    }

    pub fn is_active(&self, note: u8) -> bool {
        self.notes.borrow().contains(&note)
    }

    pub fn clear(&self) {
        self.notes.borrow_mut().clear();
    }
}

//! MIDI events as they travel between players, and the merged view of what is sounding.
pub mod active_notes;
pub mod midi_event;

//! play_away - peer to peer jam library
//!
//! provides the pieces a jam client needs to find other players through a signaling
//! broker, keep direct data/media connections to them alive, and merge the MIDI notes
//! everybody is playing into one view of what is sounding.
#[macro_use]
extern crate num_derive;

pub mod broker;
pub mod client;
pub mod common;
pub mod media;
pub mod midi;
pub mod peer;

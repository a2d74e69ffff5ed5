//! Everything we know about the signaling broker: where it lives and how to ask it who
//! is around.  Signaling itself belongs to the peer transport.
pub mod broker_api;
pub mod broker_config;

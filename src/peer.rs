//! Peer to peer plumbing: one broker identity per player ([`peer_session`]), the data
//! connections hanging off it ([`connection_registry`]) and the media calls layered on
//! those connections ([`call_bridge`]).
//!
//! The actual transport sits behind the traits in [`transport`].  [`loopback`] is an
//! in-memory broker implementing them, used by the tests and the demos.
pub mod call_bridge;
pub mod connection_registry;
pub mod connection_state;
pub mod loopback;
pub mod peer_error;
pub mod peer_session;
pub mod transport;

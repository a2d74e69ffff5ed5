//! Local capture devices and the stream handed to calls.
pub mod local_media;

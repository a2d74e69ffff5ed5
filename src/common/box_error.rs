//! Error type used by every fallible infrastructure call in the crate.
//!
//! Config loading, broker discovery and transport sends all return this so `?` works
//! across the different error sources (io, json, reqwest, url) without a wrapper enum.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // handed to log/threads in the demos
        + std::marker::Sync,
>;

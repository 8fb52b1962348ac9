//! Collector channel
//!
//! Row codec, the half-duplex conduit and its Unix socket front end.

pub mod codec;
pub mod conduit;
pub mod frame;
pub mod server;

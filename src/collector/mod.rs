//! Privileged collector
//!
//! Walks live process state and serves it one encoded row at a time.

pub mod enumerator;
pub mod procfs;

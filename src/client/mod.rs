//! Query client
//!
//! Syscall proxy over a channel endpoint, the snapshot loader that stages
//! each cycle into SQLite, and the single-statement query executor.

pub mod executor;
pub mod loader;
pub mod proxy;

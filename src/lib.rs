//! kquery: relational queries over a live snapshot of the host's processes
//!
//! A privileged collector walks `/proc` and serves one encoded row per
//! request over a half-duplex channel; an unprivileged client stages the rows
//! into SQLite, runs one statement, and empties the staging table again.
//!
//! # Architecture
//!
//! ## Collector ([`collector`])
//! - [`collector::procfs`]: Process sources (live `/proc` walker, fixed table)
//! - [`collector::enumerator`]: Per-session cursor over an owned snapshot
//!
//! ## Channel ([`channel`])
//! - [`channel::codec`]: Versioned row encoding with quote escaping
//! - [`channel::conduit`]: Sessions sharing one system-wide response slot
//! - [`channel::frame`]: NUL-terminated framing
//! - [`channel::server`]: Unix socket front end used by `kqueryd`
//!
//! ## Client ([`client`])
//! - [`client::proxy`]: Blocking command round trips over an endpoint
//! - [`client::loader`]: Populate -> query -> reset cycles
//! - [`client::executor`]: Single statement execution and row rendering
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured session events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: JSON configuration loading and validation
//! - [`config::types`]: Error taxonomy and shared records
//!
//! # Design Principles
//!
//! 1. **Owned snapshots** - Rows never borrow live process state
//! 2. **One pair in flight** - A single response slot guards the channel
//! 3. **Reset always** - The staging table is emptied after every cycle

// Privileged collector
pub mod collector;

// Channel protocol
pub mod channel;

// Query client
pub mod client;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Daemon signal handling
pub mod signal;

// CLI entrypoint wiring shared by the kquery/kqueryd binaries.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;

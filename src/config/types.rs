/// Core types and error definitions for kquery
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upper bound (exclusive) on a channel request, terminator included
pub const DEFAULT_MAX_CALL: usize = 128;

/// Default size of the response buffer, terminator included
pub const DEFAULT_MAX_RESP: usize = 1024;

/// Name of the staging table
pub const STAGING_TABLE: &str = "process";

/// Custom error types for kquery
#[derive(Error, Debug)]
pub enum KqueryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel I/O error: {0}")]
    ChannelIo(String),

    #[error("Command too long: {len} bytes (limit {limit})")]
    CommandTooLong { len: usize, limit: usize },

    #[error("Response slot allocation failed ({size} bytes)")]
    AllocationFailure { size: usize },

    #[error("SQL error: {0}")]
    Relational(#[from] rusqlite::Error),

    #[error("Malformed row: {reason} ({row:?})")]
    MalformedRow { row: String, reason: String },

    #[error("Row format mismatch: producer sent {remote:?}, expected {local:?}")]
    ProtocolMismatch { local: String, remote: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KqueryError {
    pub fn malformed(row: &str, reason: impl Into<String>) -> Self {
        KqueryError::MalformedRow {
            row: row.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error ends the client session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KqueryError::ChannelIo(_) | KqueryError::ProtocolMismatch { .. }
        )
    }
}

/// Result type for kquery operations
pub type Result<T> = std::result::Result<T, KqueryError>;

/// Immutable per-process values captured at snapshot time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub name: String,
    pub parent_pid: i32,
    /// Kernel `TASK_*` state value, -1 if unrecognized
    pub state: i64,
    /// Kernel `PF_*` flag bitmask
    pub flags: i64,
    pub priority: i32,
    /// Mapped region count, 0 without an address space
    pub num_vmas: i32,
    /// Total virtual memory in pages, 0 without an address space
    pub total_vm: i64,
}

/// Outcome of a single query execution inside a cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryOutcome {
    /// Query ran; number of result rows emitted
    Rows(usize),
    /// Store rejected the statement; message shown to the operator
    Failed(String),
}

/// Summary of one populate -> query -> reset cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Count announced by the producer (None if the count reply was empty or unparsable)
    pub announced: Option<usize>,
    /// Rows that made it into the staging table
    pub staged: usize,
    /// Rows received but rejected (decode or insert failure)
    pub skipped: usize,
    /// Channel round trips performed during population
    pub round_trips: u64,
    pub query: QueryOutcome,
}

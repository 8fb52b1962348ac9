//! Cursor-driven process enumeration.
//!
//! One enumerator belongs to one channel session. The first call of a cycle
//! captures a snapshot and answers with the process count; each later call
//! answers with one encoded row; once every row has been served the next call
//! answers with the empty sentinel and drops the snapshot.
//!
//! The snapshot owns its records. Nothing read from the process source is
//! borrowed across calls, so a process exiting mid-cycle cannot invalidate
//! rows that are still to be served.

use crate::channel::codec::encode_row;
use crate::collector::procfs::ProcessSource;
use crate::config::types::{ProcessRecord, Result};
use std::sync::Arc;
use std::time::Instant;

/// Enumeration position within one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    NotStarted,
    /// Index of the next row to serve
    At(usize),
    /// Every row served; the sentinel is next
    Finished,
}

/// Records captured at the start of a cycle
#[derive(Debug)]
pub struct ProcessSnapshot {
    records: Vec<ProcessRecord>,
    captured_at: Instant,
}

impl ProcessSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

pub struct Enumerator {
    source: Arc<dyn ProcessSource>,
    snapshot: Option<ProcessSnapshot>,
    cursor: Cursor,
    captures: u64,
}

impl Enumerator {
    pub fn new(source: Arc<dyn ProcessSource>) -> Self {
        Self {
            source,
            snapshot: None,
            cursor: Cursor::NotStarted,
            captures: 0,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Number of snapshots taken over the enumerator's lifetime
    pub fn captures(&self) -> u64 {
        self.captures
    }

    pub fn snapshot(&self) -> Option<&ProcessSnapshot> {
        self.snapshot.as_ref()
    }

    /// Reference enumeration step: count, then rows, then the sentinel.
    pub fn get_next_row(&mut self) -> Result<String> {
        match self.cursor {
            Cursor::NotStarted => self.capture(),
            Cursor::At(_) | Cursor::Finished => Ok(self.advance()),
        }
    }

    /// Start a fresh cycle regardless of the current position.
    pub fn begin(&mut self) -> Result<String> {
        if self.cursor != Cursor::NotStarted {
            log::debug!("Restarting enumeration from {:?}", self.cursor);
            self.reset();
        }
        self.capture()
    }

    /// Serve the next row without ever capturing. Outside a cycle this keeps
    /// answering with the sentinel.
    pub fn next_row(&mut self) -> String {
        self.advance()
    }

    /// Drop any captured snapshot and return to `NotStarted`.
    pub fn reset(&mut self) {
        self.snapshot = None;
        self.cursor = Cursor::NotStarted;
    }

    fn capture(&mut self) -> Result<String> {
        let records = self.source.capture()?;
        let count = records.len();

        self.captures += 1;
        self.snapshot = Some(ProcessSnapshot {
            records,
            captured_at: Instant::now(),
        });
        self.cursor = if count == 0 {
            Cursor::Finished
        } else {
            Cursor::At(0)
        };

        log::debug!(
            "Captured {} processes from {} (capture #{})",
            count,
            self.source.source_name(),
            self.captures
        );
        Ok(count.to_string())
    }

    fn advance(&mut self) -> String {
        match self.cursor {
            Cursor::NotStarted => String::new(),
            Cursor::Finished => {
                if let Some(snapshot) = &self.snapshot {
                    log::debug!(
                        "Enumeration of {} processes complete after {:?}",
                        snapshot.len(),
                        snapshot.captured_at().elapsed()
                    );
                }
                self.reset();
                String::new()
            }
            Cursor::At(index) => {
                let Some(snapshot) = &self.snapshot else {
                    log::warn!("Cursor at {} without a snapshot, resetting", index);
                    self.reset();
                    return String::new();
                };
                let row = encode_row(&snapshot.records[index]);
                self.cursor = if index + 1 >= snapshot.len() {
                    Cursor::Finished
                } else {
                    Cursor::At(index + 1)
                };
                row
            }
        }
    }
}

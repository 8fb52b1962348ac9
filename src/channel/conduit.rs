//! Half-duplex request/response channel.
//!
//! A [`Channel`] is shared by every client of one collector. Each opened
//! [`ChannelSession`] owns its enumeration cursor and its pending response,
//! but all sessions contend for a single response slot: a session takes the
//! slot on `write` and gives it back on the matching `read`, so at most one
//! (request, response) pair is in flight across the whole channel. Producer
//! dispatch runs while the slot is held.

use crate::channel::codec::fields_descriptor;
use crate::collector::enumerator::{Cursor, Enumerator};
use crate::collector::procfs::ProcessSource;
use crate::config::settings::KqueryConfig;
use crate::config::types::{KqueryError, Result};
use crate::observability::audit::{events, SessionId};
use crate::observability::metrics::ChannelMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Requests understood by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Count on the first call of a cycle, then rows, then the sentinel
    GetRow,
    /// Capture a fresh snapshot and answer with its count
    Begin,
    /// Next row of the current cycle, never captures
    NextRow,
    /// Row format descriptor
    Fields,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "process_get_row" => Some(Command::GetRow),
            "process_begin" => Some(Command::Begin),
            "process_next_row" => Some(Command::NextRow),
            "process_fields" => Some(Command::Fields),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::GetRow => "process_get_row",
            Command::Begin => "process_begin",
            Command::NextRow => "process_next_row",
            Command::Fields => "process_fields",
        }
    }
}

/// Command text up to the first terminator, trailing whitespace removed
fn request_text(request: &[u8]) -> String {
    let end = request.iter().position(|&b| b == 0).unwrap_or(request.len());
    String::from_utf8_lossy(&request[..end]).trim_end().to_string()
}

fn truncate_at_char_boundary(text: &mut String, max_len: usize) -> bool {
    if text.len() <= max_len {
        return false;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    true
}

/// The single response slot all sessions contend for
#[derive(Debug, Default)]
struct ResponseSlot {
    owner: Mutex<Option<u64>>,
    released: Condvar,
}

impl ResponseSlot {
    /// Block until the slot is free (or already ours), then take it.
    fn acquire(&self, session: u64) {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(current) = *owner {
            if current == session {
                break;
            }
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *owner = Some(session);
    }

    fn release(&self, session: u64) {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(session) {
            *owner = None;
            self.released.notify_all();
        }
    }

    fn owner(&self) -> Option<u64> {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ChannelShared {
    source: Arc<dyn ProcessSource>,
    slot: ResponseSlot,
    next_session: AtomicU64,
    max_call: usize,
    max_resp: usize,
    metrics: ChannelMetrics,
}

/// Collector-side conduit; cheap to clone, all clones share one slot
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn new(source: Arc<dyn ProcessSource>, max_call: usize, max_resp: usize) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                source,
                slot: ResponseSlot::default(),
                next_session: AtomicU64::new(1),
                max_call: max_call.max(2),
                max_resp: max_resp.max(2),
                metrics: ChannelMetrics::new(),
            }),
        }
    }

    pub fn from_config(source: Arc<dyn ProcessSource>, config: &KqueryConfig) -> Self {
        Self::new(source, config.max_call, config.max_resp)
    }

    /// Open a new session with its own cursor and response buffer
    pub fn open(&self) -> ChannelSession {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.open_sessions.inc();
        ChannelSession {
            id,
            audit_id: SessionId::new(),
            shared: Arc::clone(&self.shared),
            enumerator: Enumerator::new(Arc::clone(&self.shared.source)),
            response: None,
            holds_slot: false,
            requests: 0,
        }
    }

    /// Session currently holding the response slot, if any
    pub fn in_flight(&self) -> Option<u64> {
        self.shared.slot.owner()
    }

    pub fn max_call(&self) -> usize {
        self.shared.max_call
    }

    pub fn max_resp(&self) -> usize {
        self.shared.max_resp
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.shared.metrics
    }
}

/// One opened endpoint of the channel
pub struct ChannelSession {
    id: u64,
    audit_id: SessionId,
    shared: Arc<ChannelShared>,
    enumerator: Enumerator,
    response: Option<String>,
    holds_slot: bool,
    requests: u64,
}

impl ChannelSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn audit_id(&self) -> &SessionId {
        &self.audit_id
    }

    pub fn enumerator(&self) -> &Enumerator {
        &self.enumerator
    }

    /// Requests served over the session's lifetime
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn has_pending_response(&self) -> bool {
        self.response.is_some()
    }

    /// Accept one request and produce its response into the session slot.
    ///
    /// Returns the number of request bytes consumed.
    pub fn write(&mut self, request: &[u8]) -> Result<usize> {
        let limit = self.shared.max_call;
        if request.len() >= limit {
            self.shared.metrics.requests_rejected.inc();
            let err = KqueryError::CommandTooLong {
                len: request.len(),
                limit,
            };
            events::request_rejected(&self.audit_id, err.to_string());
            return Err(err);
        }

        if self.holds_slot {
            if self.response.take().is_some() {
                log::warn!(
                    "Session {} wrote again before reading; discarding unread response",
                    self.id
                );
            }
        } else {
            self.shared.slot.acquire(self.id);
            self.holds_slot = true;
        }

        let size = self.shared.max_resp;
        let mut buffer = String::new();
        if buffer.try_reserve_exact(size).is_err() {
            self.shared.metrics.allocation_failures.inc();
            self.release_slot();
            log::error!("Session {}: failed to allocate {} byte response", self.id, size);
            return Err(KqueryError::AllocationFailure { size });
        }

        let command = request_text(request);
        self.dispatch(&command, &mut buffer);

        if truncate_at_char_boundary(&mut buffer, size - 1) {
            self.shared.metrics.responses_truncated.inc();
            log::warn!(
                "Response to {:?} exceeds {} bytes, truncated",
                command,
                size - 1
            );
        }

        self.requests += 1;
        self.shared.metrics.requests_total.inc();
        self.response = Some(buffer);
        Ok(request.len())
    }

    fn dispatch(&mut self, command: &str, out: &mut String) {
        let produced = match Command::parse(command) {
            Some(Command::GetRow) => {
                let was_idle = self.enumerator.cursor() == Cursor::NotStarted;
                let result = self.enumerator.get_next_row();
                if was_idle && result.is_ok() {
                    self.shared.metrics.snapshots_captured.inc();
                }
                result
            }
            Some(Command::Begin) => {
                let result = self.enumerator.begin();
                if result.is_ok() {
                    self.shared.metrics.snapshots_captured.inc();
                }
                result
            }
            Some(Command::NextRow) => Ok(self.enumerator.next_row()),
            Some(Command::Fields) => Ok(fields_descriptor()),
            None => {
                self.shared.metrics.requests_unrecognized.inc();
                log::warn!(
                    "Session {}: unrecognized command {:?}, answering with empty response",
                    self.id,
                    command
                );
                events::unrecognized_command(&self.audit_id, command);
                Ok(String::new())
            }
        };

        match produced {
            Ok(text) => out.push_str(&text),
            Err(e) => {
                // Degrade to an empty response; the collector keeps serving
                self.shared.metrics.producer_failures.inc();
                log::error!("Session {}: producer for {:?} failed: {}", self.id, command, e);
            }
        }
    }

    /// Copy the pending response into `buf` followed by a NUL terminator.
    ///
    /// At most `buf.len() - 1` response bytes are copied; the rest is dropped.
    /// Returns the number of bytes written, terminator included. The pending
    /// response is consumed and the slot released whatever the buffer size.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let response = self.response.take().unwrap_or_default();
        self.release_slot();

        if buf.is_empty() {
            return Ok(0);
        }

        let bytes = response.as_bytes();
        let n = bytes.len().min(buf.len() - 1);
        buf[..n].copy_from_slice(&bytes[..n]);
        buf[n] = 0;

        if n < bytes.len() {
            self.shared.metrics.responses_truncated.inc();
            log::debug!(
                "Session {}: response of {} bytes truncated to {} by reader",
                self.id,
                bytes.len(),
                n
            );
        }
        self.shared.metrics.response_bytes.add(n as u64);
        Ok(n + 1)
    }

    fn release_slot(&mut self) {
        if self.holds_slot {
            self.shared.slot.release(self.id);
            self.holds_slot = false;
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.response = None;
        self.release_slot();
        self.shared.metrics.open_sessions.dec();
    }
}

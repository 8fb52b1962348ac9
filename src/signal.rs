//! Daemon control signals
//!
//! SIGINT and SIGTERM stop the collector; SIGHUP asks for a metrics dump and
//! leaves the channel serving. The handler only stores into atomics, the
//! daemon's main thread turns them into [`DaemonEvent`]s.

use crate::channel::server::ServerHandle;
use crate::config::types::Result;
use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

/// Signal number that requested shutdown, 0 while serving
static SHUTDOWN_SIGNAL: AtomicI32 = AtomicI32::new(0);

static METRICS_REQUESTED: AtomicBool = AtomicBool::new(false);

const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// What woke the daemon's main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    Shutdown(Signal),
    DumpMetrics,
    /// The accept loop exited without being asked to
    ServerStopped,
}

extern "C" fn on_signal(signo: libc::c_int) {
    if signo == Signal::SIGHUP as libc::c_int {
        METRICS_REQUESTED.store(true, Ordering::SeqCst);
    } else {
        SHUTDOWN_SIGNAL.store(signo, Ordering::SeqCst);
    }
}

/// Installed control-signal handlers for the collector daemon
pub struct DaemonSignals;

impl DaemonSignals {
    /// Install handlers for SIGINT, SIGTERM and SIGHUP.
    ///
    /// Call before the accept thread is spawned.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in SHUTDOWN_SIGNALS.iter().chain(&[Signal::SIGHUP]) {
            // The handler touches nothing but the statics above
            unsafe { signal::sigaction(*sig, &action) }.map_err(std::io::Error::from)?;
        }

        log::info!("Control signals installed (SIGINT/SIGTERM stop, SIGHUP dumps metrics)");
        Ok(Self)
    }

    pub fn shutdown_signal(&self) -> Option<Signal> {
        match SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            signo => Signal::try_from(signo).ok(),
        }
    }

    /// True once per SIGHUP received since the last call
    pub fn take_metrics_request(&self) -> bool {
        METRICS_REQUESTED.swap(false, Ordering::SeqCst)
    }

    /// Block until a control signal arrives or the server's accept loop dies.
    pub fn next_event(&self, server: &ServerHandle, poll: Duration) -> DaemonEvent {
        loop {
            if let Some(sig) = self.shutdown_signal() {
                return DaemonEvent::Shutdown(sig);
            }
            if self.take_metrics_request() {
                return DaemonEvent::DumpMetrics;
            }
            if server.is_stopped() {
                return DaemonEvent::ServerStopped;
            }
            std::thread::sleep(poll);
        }
    }
}

impl Drop for DaemonSignals {
    fn drop(&mut self) {
        for sig in SHUTDOWN_SIGNALS.iter().chain(&[Signal::SIGHUP]) {
            if let Err(e) = unsafe { signal::signal(*sig, SigHandler::SigDfl) } {
                debug!("Failed to restore default handler for {}: {}", sig.as_str(), e);
            }
        }
    }
}

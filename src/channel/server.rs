//! Unix socket front end for the collector channel.
//!
//! Each accepted connection gets its own [`ChannelSession`]. Requests and
//! responses travel as NUL-terminated frames; the connection thread performs
//! the session `write` then `read` for every request frame, so the response
//! slot is only ever held for the duration of one dispatch.

use crate::channel::conduit::{Channel, ChannelSession};
use crate::channel::frame::{read_frame, write_frame};
use crate::config::types::{KqueryError, Result};
use crate::observability::audit::events;
use crossbeam_channel::{self, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::fs;
use std::io::{BufReader, ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ChannelServer {
    channel: Channel,
    listener: UnixListener,
    path: PathBuf,
}

impl ChannelServer {
    /// Bind the socket, replacing a stale socket file left by a previous run.
    pub fn bind(channel: Channel, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666))?;

        info!("Channel listening on {}", path.display());
        Ok(Self {
            channel,
            listener,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the accept loop on a background thread
    pub fn spawn(self) -> Result<ServerHandle> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let path = self.path.clone();

        let thread = thread::Builder::new()
            .name("kquery-accept".to_string())
            .spawn(move || {
                loop {
                    match self.listener.accept() {
                        Ok((stream, _)) => self.spawn_connection(stream),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            match shutdown_rx.recv_timeout(ACCEPT_POLL_INTERVAL) {
                                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                                Err(RecvTimeoutError::Timeout) => {}
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            error!("Accept on {} failed: {}", self.path.display(), e);
                            thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                    }
                }
                info!("Channel accept loop stopped");
            })?;

        Ok(ServerHandle {
            shutdown: shutdown_tx,
            thread: Some(thread),
            path,
        })
    }

    fn spawn_connection(&self, stream: UnixStream) {
        let channel = self.channel.clone();
        let spawned = thread::Builder::new()
            .name("kquery-conn".to_string())
            .spawn(move || {
                if let Err(e) = serve_connection(&channel, stream) {
                    warn!("Channel connection ended with error: {}", e);
                }
            });
        if let Err(e) = spawned {
            error!("Failed to spawn connection thread: {}", e);
        }
    }
}

/// Serve one client until it closes its end of the socket.
pub fn serve_connection(channel: &Channel, stream: UnixStream) -> Result<()> {
    // Accepted sockets inherit the listener's non-blocking flag
    stream.set_nonblocking(false)?;

    let mut session = channel.open();
    let peer = peer_description(&stream);
    events::session_opened(session.audit_id(), &peer);

    let result = serve_requests(channel, &mut session, &stream);
    events::session_closed(session.audit_id(), session.requests());
    result
}

fn serve_requests(channel: &Channel, session: &mut ChannelSession, stream: &UnixStream) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut request = vec![0u8; channel.max_call() + 1];
    let mut response = vec![0u8; channel.max_resp()];

    loop {
        let frame = match read_frame(&mut reader, &mut request)? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        match session.write(&request[..frame.len]) {
            Ok(_) | Err(KqueryError::AllocationFailure { .. }) => {}
            Err(KqueryError::CommandTooLong { len, limit }) => {
                debug!(
                    "Session {}: rejected {} byte request (limit {})",
                    session.id(),
                    len + frame.dropped,
                    limit
                );
            }
            Err(e) => return Err(e),
        }

        // Every request frame gets exactly one response frame; rejected
        // requests read back the empty response.
        let n = session.read(&mut response)?;
        write_frame(&mut writer, &response[..n])?;
        writer.flush()?;
    }
}

fn peer_description(stream: &UnixStream) -> String {
    match nix::sys::socket::getsockopt(stream, nix::sys::socket::sockopt::PeerCredentials) {
        Ok(cred) => format!("pid {} uid {}", cred.pid(), cred.uid()),
        Err(_) => "unknown peer".to_string(),
    }
}

/// Handle to a running accept loop
pub struct ServerHandle {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl ServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the accept loop has exited
    pub fn is_stopped(&self) -> bool {
        self.thread.as_ref().map_or(true, |thread| thread.is_finished())
    }

    /// Stop accepting, wait for the loop to exit and remove the socket file.
    ///
    /// Connections already accepted finish on their own threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.shutdown.send(());
        if thread.join().is_err() {
            error!("Channel accept thread panicked");
        }
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed socket {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove socket {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

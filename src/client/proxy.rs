//! Client side of the channel: one blocking round trip per call.

use crate::channel::conduit::ChannelSession;
use crate::channel::frame::{read_frame, write_frame};
use crate::config::types::{KqueryError, Result};
use log::{trace, warn};
use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// An opened channel endpoint
///
/// `write_request` takes the NUL-terminated command, `read_response` fills the
/// buffer with the NUL-terminated response and returns the bytes written.
pub trait Endpoint: Send {
    fn describe(&self) -> String;
    fn write_request(&mut self, request: &[u8]) -> Result<usize>;
    fn read_response(&mut self, buf: &mut [u8]) -> Result<usize>;
}

impl Endpoint for ChannelSession {
    fn describe(&self) -> String {
        format!("in-process session {}", self.id())
    }

    fn write_request(&mut self, request: &[u8]) -> Result<usize> {
        self.write(request)
    }

    fn read_response(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf)
    }
}

impl<E: Endpoint + ?Sized> Endpoint for Box<E> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn write_request(&mut self, request: &[u8]) -> Result<usize> {
        (**self).write_request(request)
    }

    fn read_response(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_response(buf)
    }
}

/// Connection to a collector daemon
pub struct SocketEndpoint {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    description: String,
}

impl SocketEndpoint {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| {
            KqueryError::ChannelIo(format!("cannot open channel {}: {}", path.display(), e))
        })?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            description: format!("socket {}", path.display()),
        })
    }
}

impl Endpoint for SocketEndpoint {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn write_request(&mut self, request: &[u8]) -> Result<usize> {
        write_frame(&mut self.writer, request)?;
        Ok(request.len())
    }

    fn read_response(&mut self, buf: &mut [u8]) -> Result<usize> {
        match read_frame(&mut self.reader, buf)? {
            Some(frame) => Ok(frame.len),
            None => Err(KqueryError::ChannelIo("collector closed the channel".to_string())),
        }
    }
}

/// Issues commands over one endpoint and returns their textual responses
pub struct SyscallProxy<E: Endpoint> {
    endpoint: E,
    max_call: usize,
    response: Vec<u8>,
    round_trips: u64,
}

impl<E: Endpoint> SyscallProxy<E> {
    pub fn new(endpoint: E, max_call: usize, max_resp: usize) -> Self {
        Self {
            endpoint,
            max_call,
            response: vec![0u8; max_resp.max(1)],
            round_trips: 0,
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Completed round trips since the proxy was opened
    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }

    /// Send `command` and block until its response arrives.
    ///
    /// An over-long command is rejected before anything is written. Every
    /// other endpoint failure is a `ChannelIo` error.
    pub fn do_call(&mut self, command: &str) -> Result<String> {
        let mut request = Vec::with_capacity(command.len() + 1);
        request.extend_from_slice(command.as_bytes());
        request.push(0);

        if request.len() >= self.max_call {
            return Err(KqueryError::CommandTooLong {
                len: request.len(),
                limit: self.max_call,
            });
        }

        match self.endpoint.write_request(&request) {
            Ok(_) => {}
            Err(e @ KqueryError::AllocationFailure { .. }) => {
                // Nothing is pending; the read below yields the empty response
                warn!("{}: {}", command, e);
            }
            Err(KqueryError::ChannelIo(msg)) => return Err(KqueryError::ChannelIo(msg)),
            Err(e) => {
                return Err(KqueryError::ChannelIo(format!("write of {:?} failed: {}", command, e)))
            }
        }

        let n = match self.endpoint.read_response(&mut self.response) {
            Ok(n) => n,
            Err(KqueryError::ChannelIo(msg)) => return Err(KqueryError::ChannelIo(msg)),
            Err(e) => {
                return Err(KqueryError::ChannelIo(format!("read after {:?} failed: {}", command, e)))
            }
        };
        self.round_trips += 1;

        let filled = &self.response[..n.min(self.response.len())];
        let end = filled.iter().position(|&b| b == 0).unwrap_or(filled.len());
        let text = String::from_utf8_lossy(&filled[..end]).into_owned();
        trace!("{} -> {:?}", command, text);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::conduit::Channel;
    use crate::collector::procfs::StaticProcessSource;
    use crate::config::types::ProcessRecord;
    use std::io;
    use std::sync::Arc;

    fn channel(max_call: usize, max_resp: usize) -> Channel {
        let records = vec![ProcessRecord {
            pid: 7,
            name: "sshd".to_string(),
            parent_pid: 1,
            state: 1,
            flags: 256,
            priority: 120,
            num_vmas: 40,
            total_vm: 2048,
        }];
        Channel::new(Arc::new(StaticProcessSource::new(records)), max_call, max_resp)
    }

    struct BrokenEndpoint;

    impl Endpoint for BrokenEndpoint {
        fn describe(&self) -> String {
            "broken".to_string()
        }

        fn write_request(&mut self, _request: &[u8]) -> Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed").into())
        }

        fn read_response(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_round_trips_over_session() {
        let channel = channel(128, 1024);
        let mut proxy = SyscallProxy::new(channel.open(), 128, 1024);

        assert_eq!(proxy.do_call("process_begin").unwrap(), "1");
        let row = proxy.do_call("process_next_row").unwrap();
        assert!(row.starts_with("INSERT INTO process VALUES (7,'sshd'"));
        assert_eq!(proxy.do_call("process_next_row").unwrap(), "");
        assert_eq!(proxy.round_trips(), 3);
        assert_eq!(channel.in_flight(), None);
    }

    #[test]
    fn test_long_command_rejected_locally() {
        let channel = channel(16, 1024);
        let mut proxy = SyscallProxy::new(channel.open(), 16, 1024);

        let err = proxy.do_call("process_next_row").unwrap_err();
        assert!(matches!(err, KqueryError::CommandTooLong { len: 17, limit: 16 }));
        assert_eq!(proxy.round_trips(), 0);
        assert_eq!(channel.metrics().requests_rejected.get(), 0);
    }

    #[test]
    fn test_small_response_buffer_truncates() {
        let channel = channel(128, 1024);
        let mut proxy = SyscallProxy::new(channel.open(), 128, 10);

        proxy.do_call("process_begin").unwrap();
        assert_eq!(proxy.do_call("process_next_row").unwrap(), "INSERT IN");
    }

    #[test]
    fn test_allocation_failure_reads_empty_response() {
        let source = Arc::new(StaticProcessSource::new(Vec::new()));
        let channel = Channel::new(source, 128, usize::MAX);
        let mut proxy = SyscallProxy::new(channel.open(), 128, 1024);

        assert_eq!(proxy.do_call("process_begin").unwrap(), "");
        assert_eq!(proxy.round_trips(), 1);
        assert_eq!(channel.in_flight(), None);
        assert!(!proxy.endpoint().has_pending_response());
    }

    #[test]
    fn test_write_failure_is_channel_io() {
        let mut proxy = SyscallProxy::new(BrokenEndpoint, 128, 1024);
        let err = proxy.do_call("process_begin").unwrap_err();
        assert!(matches!(err, KqueryError::ChannelIo(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_boxed_endpoint() {
        let channel = channel(128, 1024);
        let endpoint: Box<dyn Endpoint> = Box::new(channel.open());
        let mut proxy = SyscallProxy::new(endpoint, 128, 1024);
        assert!(proxy.endpoint().describe().starts_with("in-process session"));
        assert_eq!(proxy.do_call("bogus_call").unwrap(), "");
    }
}

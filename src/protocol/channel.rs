//! Client end of the video server connection

use crate::error::{Result, SinkError};
use crate::protocol::wire::{self, ClientMessage, FrameMessage, ServerMessage};
use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, MsgFlags};
use std::io::IoSlice;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// Size of a single inbound receive.
const RECEIVE_LEN: usize = 64;

pub struct FrameChannel {
    stream: UnixStream,
    path: PathBuf,
    refresh_rate: AtomicU32,
    /// Microseconds, 0 until the server announced a rate.
    refresh_period: AtomicI64,
}

impl FrameChannel {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|source| SinkError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("connected to video server at {:?}", path);

        Ok(Self {
            stream,
            path: path.to_path_buf(),
            refresh_rate: AtomicU32::new(0),
            refresh_period: AtomicI64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn refresh_rate(&self) -> u32 {
        self.refresh_rate.load(Ordering::Relaxed)
    }

    pub fn refresh_period(&self) -> i64 {
        self.refresh_period.load(Ordering::Relaxed)
    }

    fn send_raw(&self, data: &[u8], fds: &[RawFd]) -> Result<usize> {
        let iov = [IoSlice::new(data)];
        let cmsgs = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &cmsgs };

        loop {
            match socket::sendmsg::<()>(
                self.stream.as_raw_fd(),
                &iov,
                cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
                Ok(sent) => return Ok(sent),
            }
        }
    }

    /// Sends a control message. Failures are logged and otherwise ignored.
    fn send_control(&self, msg: ClientMessage) {
        let bytes = msg.to_bytes();
        match self.send_raw(&bytes, &[]) {
            Ok(sent) if sent == bytes.len() => log::trace!("sent {:?} to video server", msg),
            Ok(sent) => log::error!(
                "short send of {:?} to video server: {} of {}",
                msg,
                sent,
                bytes.len()
            ),
            Err(e) => log::error!("failed to send {:?} to video server: {}", msg, e),
        }
    }

    pub fn send_hide(&self, hide: bool) {
        self.send_control(ClientMessage::Hide(hide));
    }

    pub fn send_session_info(&self, sync_type: u8, session_id: u32) {
        self.send_control(ClientMessage::SessionInfo {
            sync_type,
            session_id,
        });
    }

    pub fn send_flush(&self) {
        self.send_control(ClientMessage::Flush);
    }

    /// Sends a frame together with duplicated plane descriptors.
    ///
    /// The duplicates are closed once the call returns; the receiver owns its
    /// own copies. Anything short of a full-length send is an error.
    pub fn send_frame(&self, frame: &FrameMessage, fds: Vec<OwnedFd>) -> Result<()> {
        let bytes = ClientMessage::Frame(*frame).to_bytes();
        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();

        let sent = self.send_raw(&bytes, &raw)?;
        drop(fds);

        if sent != bytes.len() {
            return Err(SinkError::ShortSend {
                sent,
                expected: bytes.len(),
            });
        }
        Ok(())
    }

    /// Reads whatever the server sent, without blocking.
    ///
    /// Rate updates are applied to the channel; every decoded message is also
    /// returned to the caller.
    pub fn drain(&self) -> Vec<ServerMessage> {
        let mut buf = [0u8; RECEIVE_LEN];

        let len = loop {
            match socket::recv(self.stream.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok(len) => break len,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Vec::new(),
                Err(e) => {
                    log::debug!("video server receive failed: {}", e);
                    return Vec::new();
                }
            }
        };

        let messages = wire::parse_server_messages(&buf[..len]);
        for msg in &messages {
            if let ServerMessage::Rate(rate) = msg {
                self.set_rate(*rate);
            }
        }
        messages
    }

    fn set_rate(&self, rate: u32) {
        log::debug!("got rate {} from video server", rate);
        self.refresh_rate.store(rate, Ordering::Relaxed);
        if rate != 0 {
            self.refresh_period
                .store(1_000_000 / i64::from(rate), Ordering::Relaxed);
        }
    }

    /// Forces the connection down, waking anybody blocked on it.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("video server shutdown: {}", e);
        }
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        log::debug!("closing video server connection {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;

    fn pair() -> (tempfile::TempDir, FrameChannel, UnixStream) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video");
        let listener = UnixListener::bind(&path).unwrap();
        let channel = FrameChannel::connect(&path).unwrap();
        let (server, _) = listener.accept().unwrap();
        (dir, channel, server)
    }

    #[test]
    fn test_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = FrameChannel::connect(&dir.path().join("missing"));
        assert!(matches!(result, Err(SinkError::Connect { .. })));
    }

    #[test]
    fn test_control_messages_reach_server() {
        let (_dir, channel, mut server) = pair();
        channel.send_hide(true);
        channel.send_flush();

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"VS\x02H\x01VS\x01S");
    }

    #[test]
    fn test_drain_without_data() {
        let (_dir, channel, _server) = pair();
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn test_drain_updates_rate() {
        let (_dir, channel, mut server) = pair();
        let mut out = ServerMessage::Rate(50).to_bytes();
        ServerMessage::BufferReleased(1).encode(&mut out);
        server.write_all(&out).unwrap();

        let mut messages = Vec::new();
        for _ in 0..100 {
            messages = channel.drain();
            if !messages.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert_eq!(
            messages,
            vec![ServerMessage::Rate(50), ServerMessage::BufferReleased(1)]
        );
        assert_eq!(channel.refresh_rate(), 50);
        assert_eq!(channel.refresh_period(), 20_000);
    }
}

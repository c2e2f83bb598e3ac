//! Minimal video server
//!
//! Accepts sink connections, decodes frames together with their plane
//! descriptors and answers with release, status and rate messages. Used by
//! the `serve` command and by the integration tests.

use crate::error::Result;
use crate::protocol::wire::{ClientMessage, MARKER, ServerMessage};
use bytes::{Buf, BytesMut};
use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessageOwned, MsgFlags, UnixAddr};
use std::collections::VecDeque;
use std::io::{IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A decoded client message with the descriptors that came with it.
#[derive(Debug)]
pub struct ClientEvent {
    pub message: ClientMessage,
    pub fds: Vec<OwnedFd>,
}

pub struct PlaneServer {
    listener: UnixListener,
    path: PathBuf,
}

impl PlaneServer {
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        log::info!("video server listening on {:?}", path);
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        Ok(self.listener.set_nonblocking(nonblocking)?)
    }

    /// Waits for the next sink. With a non-blocking listener `None` means
    /// nobody is waiting.
    pub fn accept(&self) -> Result<Option<ServerConnection>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                log::info!("sink connected");
                Ok(Some(ServerConnection::new(stream)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PlaneServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct ServerConnection {
    stream: UnixStream,
    pending: BytesMut,
    fds: VecDeque<Vec<OwnedFd>>,
    closed: bool,
}

impl ServerConnection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            pending: BytesMut::with_capacity(256),
            fds: VecDeque::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    /// Performs one receive and returns every complete message it finished.
    /// An empty list means the read timed out or the peer went away.
    pub fn poll(&mut self) -> Result<Vec<ClientEvent>> {
        if self.closed {
            return Ok(Vec::new());
        }

        let mut buf = [0u8; 512];
        let mut cmsg = nix::cmsg_space!([RawFd; 3]);
        let mut received = Vec::new();

        let bytes = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = loop {
                match socket::recvmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EAGAIN) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                    Ok(msg) => break msg,
                }
            };

            for control in msg.cmsgs()? {
                match control {
                    ControlMessageOwned::ScmRights(raw) => {
                        for fd in raw {
                            // SAFETY: descriptor freshly received and owned by nobody else
                            received.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                    other => log::warn!("unexpected control message {:?}", other),
                }
            }
            msg.bytes
        };

        if bytes == 0 {
            log::info!("sink disconnected");
            self.closed = true;
            return Ok(Vec::new());
        }

        if !received.is_empty() {
            self.fds.push_back(received);
        }
        self.pending.extend_from_slice(&buf[..bytes]);

        Ok(self.take_messages())
    }

    fn take_messages(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();

        while self.pending.len() >= 4 {
            if self.pending[..2] != MARKER {
                log::error!("bad marker from sink, dropping {} bytes", self.pending.len());
                self.pending.clear();
                break;
            }
            let len = self.pending[2] as usize;
            if self.pending.len() < len + 3 {
                break;
            }

            let mut record = self.pending.split_to(len + 3);
            record.advance(3);
            if record.is_empty() {
                continue;
            }
            let kind = record[0];

            let Some(message) = ClientMessage::decode(kind, &record[1..]) else {
                log::warn!("skipping record type {:?} len {}", kind as char, len);
                continue;
            };

            let fds = match message {
                ClientMessage::Frame(_) => self.fds.pop_front().unwrap_or_default(),
                _ => Vec::new(),
            };
            events.push(ClientEvent { message, fds });
        }

        events
    }

    pub fn send(&mut self, msg: ServerMessage) -> Result<()> {
        self.stream.write_all(&msg.to_bytes())?;
        Ok(())
    }

    pub fn send_rate(&mut self, rate: u32) -> Result<()> {
        self.send(ServerMessage::Rate(rate))
    }

    pub fn send_release(&mut self, buffer_id: u32) -> Result<()> {
        self.send(ServerMessage::BufferReleased(buffer_id))
    }

    pub fn send_status(&mut self, frame_time: i64, num_dropped: u32) -> Result<()> {
        self.send(ServerMessage::Status {
            frame_time,
            num_dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::channel::FrameChannel;
    use crate::protocol::wire::FrameMessage;

    #[test]
    fn test_frame_arrives_with_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video");
        let server = PlaneServer::bind(&path).unwrap();
        let channel = FrameChannel::connect(&path).unwrap();
        let mut conn = server.accept().unwrap().unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let memfd = nix::sys::memfd::memfd_create(
            c"test-plane",
            nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC,
        )
        .unwrap();
        let frame = FrameMessage {
            width: 64,
            height: 32,
            buffer_id: 1,
            frame_time: 40_000,
            ..Default::default()
        };
        channel
            .send_frame(&frame, vec![memfd.try_clone().unwrap(), memfd])
            .unwrap();

        let events = conn.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, ClientMessage::Frame(frame));
        assert_eq!(events[0].fds.len(), 2);
    }

    #[test]
    fn test_reply_is_drained_by_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video");
        let server = PlaneServer::bind(&path).unwrap();
        let channel = FrameChannel::connect(&path).unwrap();
        let mut conn = server.accept().unwrap().unwrap();

        conn.send_status(1_000, 2).unwrap();

        let mut got = Vec::new();
        for _ in 0..100 {
            got = channel.drain();
            if !got.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            got,
            vec![ServerMessage::Status {
                frame_time: 1_000,
                num_dropped: 2
            }]
        );
    }

    #[test]
    fn test_disconnect_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video");
        let server = PlaneServer::bind(&path).unwrap();
        let channel = FrameChannel::connect(&path).unwrap();
        let mut conn = server.accept().unwrap().unwrap();

        drop(channel);
        assert!(conn.poll().unwrap().is_empty());
        assert!(conn.is_closed());
    }
}

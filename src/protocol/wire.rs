//! Byte layout of the video server protocol
//!
//! Every record starts with a 4 byte header: the marker `'V' 'S'`, a length
//! byte counting the type byte plus the body, and the type byte. Multi-byte
//! fields are big-endian.

use bytes::{Buf, BufMut, BytesMut};

pub const MARKER: [u8; 2] = *b"VS";
pub const HEADER_LEN: usize = 4;

/// Largest record the client ever sends (header plus a Frame body).
pub const MAX_RECORD_LEN: usize = 3 + FRAME_LEN as usize;

pub const TYPE_HIDE: u8 = b'H';
pub const TYPE_SESSION_INFO: u8 = b'I';
pub const TYPE_FLUSH: u8 = b'S';
pub const TYPE_FRAME: u8 = b'F';

pub const TYPE_RATE: u8 = b'R';
pub const TYPE_BUFFER_RELEASE: u8 = b'B';
pub const TYPE_STATUS: u8 = b'S';

const HIDE_LEN: u8 = 2;
const SESSION_INFO_LEN: u8 = 6;
const FLUSH_LEN: u8 = 1;
const FRAME_LEN: u8 = 65;
const RATE_LEN: u8 = 5;
const BUFFER_RELEASE_LEN: u8 = 5;
const STATUS_LEN: u8 = 13;

/// Description of one frame handed to the video server.
///
/// The plane descriptors travel out of band as ancillary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMessage {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc code.
    pub format: u32,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub offsets: [u32; 3],
    pub strides: [u32; 3],
    pub buffer_id: u32,
    /// Presentation time in microseconds.
    pub frame_time: i64,
}

/// Messages from the sink to the video server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    Hide(bool),
    SessionInfo { sync_type: u8, session_id: u32 },
    Flush,
    Frame(FrameMessage),
}

/// Messages from the video server to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    Rate(u32),
    BufferReleased(u32),
    Status { frame_time: i64, num_dropped: u32 },
}

fn put_header(buf: &mut BytesMut, len: u8, kind: u8) {
    buf.put_slice(&MARKER);
    buf.put_u8(len);
    buf.put_u8(kind);
}

impl ClientMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ClientMessage::Hide(hide) => {
                put_header(buf, HIDE_LEN, TYPE_HIDE);
                buf.put_u8(u8::from(*hide));
            }
            ClientMessage::SessionInfo {
                sync_type,
                session_id,
            } => {
                put_header(buf, SESSION_INFO_LEN, TYPE_SESSION_INFO);
                buf.put_u8(*sync_type);
                buf.put_u32(*session_id);
            }
            ClientMessage::Flush => put_header(buf, FLUSH_LEN, TYPE_FLUSH),
            ClientMessage::Frame(frame) => {
                put_header(buf, FRAME_LEN, TYPE_FRAME);
                buf.put_u32(frame.width);
                buf.put_u32(frame.height);
                buf.put_u32(frame.format);
                buf.put_u32(frame.x as u32);
                buf.put_u32(frame.y as u32);
                buf.put_u32(frame.w as u32);
                buf.put_u32(frame.h as u32);
                for plane in 0..3 {
                    buf.put_u32(frame.offsets[plane]);
                    buf.put_u32(frame.strides[plane]);
                }
                buf.put_u32(frame.buffer_id);
                buf.put_i64(frame.frame_time);
            }
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MAX_RECORD_LEN);
        self.encode(&mut buf);
        buf
    }

    /// Server side decoding of one record body. `None` when the body is too
    /// short for its type or the type is unknown.
    pub fn decode(kind: u8, mut body: &[u8]) -> Option<Self> {
        let declared = body.len() + 1;
        let need = |len: u8| declared >= len as usize;
        match kind {
            TYPE_HIDE if need(HIDE_LEN) => Some(ClientMessage::Hide(body.get_u8() != 0)),
            TYPE_SESSION_INFO if need(SESSION_INFO_LEN) => Some(ClientMessage::SessionInfo {
                sync_type: body.get_u8(),
                session_id: body.get_u32(),
            }),
            TYPE_FLUSH => Some(ClientMessage::Flush),
            TYPE_FRAME if need(FRAME_LEN) => {
                let mut frame = FrameMessage {
                    width: body.get_u32(),
                    height: body.get_u32(),
                    format: body.get_u32(),
                    x: body.get_u32() as i32,
                    y: body.get_u32() as i32,
                    w: body.get_u32() as i32,
                    h: body.get_u32() as i32,
                    ..Default::default()
                };
                for plane in 0..3 {
                    frame.offsets[plane] = body.get_u32();
                    frame.strides[plane] = body.get_u32();
                }
                frame.buffer_id = body.get_u32();
                frame.frame_time = body.get_i64();
                Some(ClientMessage::Frame(frame))
            }
            _ => None,
        }
    }
}

impl ServerMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ServerMessage::Rate(rate) => {
                put_header(buf, RATE_LEN, TYPE_RATE);
                buf.put_u32(*rate);
            }
            ServerMessage::BufferReleased(index) => {
                put_header(buf, BUFFER_RELEASE_LEN, TYPE_BUFFER_RELEASE);
                buf.put_u32(*index);
            }
            ServerMessage::Status {
                frame_time,
                num_dropped,
            } => {
                put_header(buf, STATUS_LEN, TYPE_STATUS);
                buf.put_i64(*frame_time);
                buf.put_u32(*num_dropped);
            }
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + STATUS_LEN as usize);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(kind: u8, mut body: &[u8]) -> Option<Self> {
        let declared = body.len() + 1;
        let need = |len: u8| declared >= len as usize;
        match kind {
            TYPE_RATE if need(RATE_LEN) => Some(ServerMessage::Rate(body.get_u32())),
            TYPE_BUFFER_RELEASE if need(BUFFER_RELEASE_LEN) => {
                Some(ServerMessage::BufferReleased(body.get_u32()))
            }
            TYPE_STATUS if need(STATUS_LEN) => Some(ServerMessage::Status {
                frame_time: body.get_i64(),
                num_dropped: body.get_u32(),
            }),
            _ => None,
        }
    }
}

/// Splits one receive into `(type, body)` records.
///
/// Parsing stops at a bad marker or at a record whose declared length runs
/// past the end of `data`; whatever follows is dropped.
pub fn records(data: &[u8]) -> Records<'_> {
    Records { rest: data }
}

pub struct Records<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest;
        if rest.len() < HEADER_LEN || rest[..2] != MARKER {
            self.rest = &[];
            return None;
        }

        let len = rest[2] as usize;
        if len == 0 || rest.len() < len + 3 {
            self.rest = &[];
            return None;
        }

        self.rest = &rest[len + 3..];
        Some((rest[3], &rest[4..len + 3]))
    }
}

/// Decodes every complete inbound record of one receive. Records that are
/// too short for their type and unknown types are skipped.
pub fn parse_server_messages(data: &[u8]) -> Vec<ServerMessage> {
    records(data)
        .filter_map(|(kind, body)| ServerMessage::decode(kind, body))
        .collect()
}

pub fn parse_client_messages(data: &[u8]) -> Vec<ClientMessage> {
    records(data)
        .filter_map(|(kind, body)| ClientMessage::decode(kind, body))
        .collect()
}

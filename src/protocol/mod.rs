//! Framed protocol spoken with the out-of-process video server
//!
//! [`channel::FrameChannel`] is the sink's end of the socket,
//! [`server::PlaneServer`] a small server speaking the other end.

pub mod channel;
pub mod server;
pub mod wire;

pub use channel::FrameChannel;
pub use server::{ClientEvent, PlaneServer, ServerConnection};
pub use wire::{ClientMessage, FrameMessage, ServerMessage};

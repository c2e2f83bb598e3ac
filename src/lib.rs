//! Out-of-process video frame delivery
//!
//! Decoded frames are copied into a small pool of shareable plane buffers and
//! either handed to an external video-plane server over a local socket, with
//! the plane descriptors passed alongside, or attached to a local display.
//! [`sink::VideoSink`] ties the pieces together.

pub mod assets;
pub mod buffer;
pub mod config;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod sink;
pub mod utils;
pub mod workers;

pub use config::SinkConfig;
pub use error::{Result, SinkError};
pub use sink::{SinkBuilder, VideoSink};

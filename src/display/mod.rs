//! Local display path
//!
//! When frames are not handed to the video server they are attached directly
//! to a compositor surface. The compositor client itself lives outside this
//! crate; [`DisplayClient`] is the seam it plugs into. [`HeadlessDisplay`] is
//! an in-process implementation used by the demo and the tests.

pub mod headless;

pub use headless::HeadlessDisplay;

use crate::error::Result;
use std::os::fd::OwnedFd;
use std::time::Duration;

/// Called by the display once it no longer reads from an attached buffer.
pub type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

/// A pool buffer described the way a compositor expects a planar buffer.
#[derive(Debug)]
pub struct PlanarBuffer {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// DRM fourcc code.
    pub format: u32,
    /// Duplicated plane descriptors, owned by the display from now on.
    pub fds: Vec<OwnedFd>,
    pub offsets: [u32; 3],
    pub strides: [u32; 3],
}

/// Outcome of one dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Events were processed or the wait timed out.
    Continue,
    /// The connection is gone; the dispatch loop should stop.
    Closed,
}

/// Compositor client used by the local display path.
pub trait DisplayClient: Send + Sync {
    /// Waits up to `timeout` for compositor events and processes them.
    /// Release callbacks of attached buffers run from here.
    fn dispatch(&self, timeout: Duration) -> Result<DispatchStatus>;

    /// Makes a blocked `dispatch` return early.
    fn wake(&self);

    /// Shuts the connection down for good; `dispatch` reports
    /// [`DispatchStatus::Closed`] from then on.
    fn shutdown(&self);

    /// Shows `buffer` on the surface. `on_release` runs once the compositor
    /// let go of it. Returns `false` when the buffer could not be attached,
    /// in which case `on_release` is dropped without being called.
    fn attach_planar(&self, buffer: PlanarBuffer, on_release: ReleaseCallback) -> bool;

    /// Removes whatever is attached to the surface.
    fn detach(&self);
}

//! Event callbacks a session raises towards its owner

use std::os::fd::BorrowedFd;
use std::sync::Arc;

/// One plane of a frame handed out in texture mode.
#[derive(Debug, Clone, Copy)]
pub struct TexturePlane<'a> {
    pub fd: Option<BorrowedFd<'a>>,
    pub len: u64,
    pub stride: u32,
}

impl TexturePlane<'_> {
    pub fn empty() -> Self {
        Self {
            fd: None,
            len: 0,
            stride: 0,
        }
    }
}

/// Frame handed to [`SinkCallbacks::on_new_texture`].
///
/// The descriptors are only valid for the duration of the callback; dup them
/// to keep the planes around.
#[derive(Debug, Clone, Copy)]
pub struct TextureFrame<'a> {
    /// DRM fourcc code.
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub planes: [TexturePlane<'a>; 3],
}

type Notify = Arc<dyn Fn() + Send + Sync>;
type TextureFn = Arc<dyn Fn(&TextureFrame<'_>) + Send + Sync>;
type TimecodeFn = Arc<dyn Fn(i64) + Send + Sync>;

/// Callbacks are optional; unset ones are skipped.
#[derive(Clone, Default)]
pub struct SinkCallbacks {
    on_first_frame: Option<Notify>,
    on_first_frame_displayed: Option<Notify>,
    on_new_texture: Option<TextureFn>,
    on_timecode: Option<TimecodeFn>,
    on_end_of_stream: Option<Notify>,
}

impl SinkCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// First frame rendered by the session. Raised from a helper thread.
    pub fn with_first_frame<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_first_frame = Some(Arc::new(f));
        self
    }

    /// First status report from the video server.
    pub fn with_first_frame_displayed<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_first_frame_displayed = Some(Arc::new(f));
        self
    }

    pub fn with_new_texture<F>(mut self, f: F) -> Self
    where
        F: Fn(&TextureFrame<'_>) + Send + Sync + 'static,
    {
        self.on_new_texture = Some(Arc::new(f));
        self
    }

    /// Playback position in nanoseconds, after every position update.
    pub fn with_timecode<F>(mut self, f: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.on_timecode = Some(Arc::new(f));
        self
    }

    pub fn with_end_of_stream<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_end_of_stream = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_first_frame(&self) {
        if let Some(f) = &self.on_first_frame {
            f();
        }
    }

    pub(crate) fn emit_first_frame_displayed(&self) {
        if let Some(f) = &self.on_first_frame_displayed {
            f();
        }
    }

    pub(crate) fn has_texture(&self) -> bool {
        self.on_new_texture.is_some()
    }

    pub(crate) fn emit_new_texture(&self, frame: &TextureFrame<'_>) {
        if let Some(f) = &self.on_new_texture {
            f(frame);
        }
    }

    pub(crate) fn emit_timecode(&self, position: i64) {
        if let Some(f) = &self.on_timecode {
            f(position);
        }
    }

    pub(crate) fn emit_end_of_stream(&self) {
        if let Some(f) = &self.on_end_of_stream {
            f();
        }
    }
}

impl std::fmt::Debug for SinkCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkCallbacks")
            .field("on_first_frame", &self.on_first_frame.is_some())
            .field("on_first_frame_displayed", &self.on_first_frame_displayed.is_some())
            .field("on_new_texture", &self.on_new_texture.is_some())
            .field("on_timecode", &self.on_timecode.is_some())
            .field("on_end_of_stream", &self.on_end_of_stream.is_some())
            .finish()
    }
}

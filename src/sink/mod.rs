//! The video sink session
//!
//! A [`VideoSink`] owns the buffer pool, the connection to the video server,
//! the local display and the background workers of one playback session.
//! Frames come in through [`VideoSink::render`] on the caller's thread, the
//! lifecycle is driven through [`StateTransitions`].
//!
//! All session state sits behind one mutex together with the pool; socket
//! I/O, plane copies and callbacks always run with the mutex released.

pub mod callbacks;
pub mod frame;
pub mod lifecycle;
pub mod render;

pub use callbacks::{SinkCallbacks, TextureFrame, TexturePlane};
pub use frame::{PixelLayout, VideoFrame, VideoInfo};
pub use lifecycle::StateTransitions;
pub use render::RenderOutcome;

use crate::buffer::{BufferPool, PlaneAllocator};
use crate::config::SinkConfig;
use crate::display::DisplayClient;
use crate::pipeline::{ElementState, PtsTracker, Segment, SinkStats, VideoRect, WindowGeometry};
use crate::protocol::{FrameChannel, ServerMessage};
use crate::workers::{DispatchWorker, EosWorker, FirstFrameWorker, WorkerClose};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Mutable state of a session, guarded together with the pool.
#[derive(Debug, Default)]
pub(crate) struct SinkState {
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_displayed: u64,
    pub server_dropped: u32,
    pub local_dropped: u64,
    pub frame_number: u64,

    pub playing: bool,
    pub paused: bool,
    pub video_started: bool,
    pub flush_started: bool,
    pub eos_seen: bool,
    /// Frames go to the local display instead of the video server.
    pub capture_enabled: bool,
    /// Set when the server could not be reached; no way back to video mode.
    pub capture_locked: bool,
    pub force_aspect_ratio: bool,

    pub video_rect: VideoRect,
    pub pts: PtsTracker,
    pub segment: Segment,
    pub video_info: Option<VideoInfo>,

    /// Frames still sent to the server after switching to capture mode.
    pub frames_before_hide_video: u32,
    /// Frames still shown locally after switching to video mode.
    pub frames_before_hide_gfx: u32,

    pub session_sync: (u8, u32),
    pub sent_sync: Option<(u8, u32)>,
    pub session_info_pending: bool,

    pub first_frame_sent: bool,
    pub first_frame_displayed: bool,
    /// Bumped on every stop so stale display releases are ignored.
    pub generation: u64,
}

impl SinkState {
    /// Rectangle the next frame is placed in.
    pub fn frame_rect(&self, width: u32, height: u32) -> VideoRect {
        if self.force_aspect_ratio {
            self.video_rect.letterbox(width, height)
        } else {
            self.video_rect
        }
    }

    pub fn reset_counters(&mut self) {
        self.frames_in = 0;
        self.frames_out = 0;
        self.frames_displayed = 0;
        self.server_dropped = 0;
        self.local_dropped = 0;
        self.frame_number = 0;
    }
}

pub(crate) struct Inner {
    pub state: SinkState,
    pub pool: BufferPool,
}

impl AsMut<BufferPool> for Inner {
    fn as_mut(&mut self) -> &mut BufferPool {
        &mut self.pool
    }
}

/// What the session's threads and callbacks share.
pub(crate) struct Shared {
    pub inner: Mutex<Inner>,
    /// Signaled on resume, flush and stop; paired with `inner`.
    pub cond: Condvar,
    pub channel: Mutex<Option<Arc<FrameChannel>>>,
    pub callbacks: SinkCallbacks,
    pub config: SinkConfig,
    pub stopping: AtomicBool,
    pub display: Option<Arc<dyn DisplayClient>>,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channel(&self) -> Option<Arc<FrameChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Drains and applies whatever the video server sent so far.
    pub fn pump(&self) {
        if let Some(channel) = self.channel() {
            let messages = channel.drain();
            if !messages.is_empty() {
                self.apply_server_messages(&messages);
            }
        }
    }

    pub fn apply_server_messages(&self, messages: &[ServerMessage]) {
        let mut first_displayed = false;
        let mut positions = Vec::new();

        {
            let mut inner = self.lock();
            let Inner { state, pool } = &mut *inner;

            for msg in messages {
                match *msg {
                    ServerMessage::Rate(rate) => {
                        log::debug!("video server refresh rate {} Hz", rate);
                    }
                    ServerMessage::BufferReleased(id) => {
                        let index = id as usize;
                        let locked = pool.buffer(index).is_some_and(|b| b.lock_count > 0);
                        if !locked {
                            log::error!("release for buffer {} which is not locked", id);
                            continue;
                        }
                        if pool.unlock(index)
                            && let Err(e) = pool.release(index)
                        {
                            log::error!("unable to release buffer {}: {}", index, e);
                        }
                    }
                    ServerMessage::Status {
                        frame_time,
                        num_dropped,
                    } => {
                        let position = state.pts.on_status(frame_time, &state.segment);
                        state.server_dropped = num_dropped;
                        if state.frames_displayed == 0 && !state.first_frame_displayed {
                            state.first_frame_displayed = true;
                            first_displayed = true;
                        }
                        state.frames_displayed += 1;
                        if self.config.frame_debug {
                            log::debug!(
                                target: crate::assets::FRAME_LOG_TARGET,
                                "status: frame time {} dropped {} position {}",
                                frame_time,
                                num_dropped,
                                position
                            );
                        }
                        positions.push(position);
                    }
                }
            }
        }

        if first_displayed {
            self.callbacks.emit_first_frame_displayed();
        }
        for position in positions {
            self.callbacks.emit_timecode(position);
        }
    }

    /// Release of a buffer by the local display.
    pub fn release_from_display(&self, index: usize, generation: u64) {
        let mut inner = self.lock();
        if inner.state.generation != generation {
            log::debug!("ignoring display release of buffer {} from old session", index);
            return;
        }
        if inner.pool.unlock(index)
            && let Err(e) = inner.pool.release(index)
        {
            log::error!("unable to release buffer {}: {}", index, e);
        }
    }

    pub fn stats(&self) -> SinkStats {
        let refresh_rate = self.channel().map(|c| c.refresh_rate()).unwrap_or(0);
        let inner = self.lock();
        let state = &inner.state;
        SinkStats {
            frames_in: state.frames_in,
            frames_out: state.frames_out,
            frames_displayed: state.frames_displayed,
            server_dropped: state.server_dropped,
            local_dropped: state.local_dropped,
            position: state.pts.position(),
            refresh_rate,
        }
    }
}

#[derive(Default)]
pub(crate) struct Workers {
    pub dispatch: Option<DispatchWorker>,
    pub eos: Option<EosWorker>,
    pub first_frame: Option<FirstFrameWorker>,
}

impl WorkerClose for Workers {
    fn close(&mut self) {
        if let Some(mut worker) = self.first_frame.take() {
            worker.close();
        }
        if let Some(mut worker) = self.eos.take() {
            worker.close();
        }
        if let Some(mut worker) = self.dispatch.take() {
            worker.close();
        }
    }
}

/// One playback session.
pub struct VideoSink {
    pub(crate) shared: Arc<Shared>,
    pub(crate) workers: Mutex<Workers>,
    pub(crate) element: Mutex<ElementState>,
}

pub struct SinkBuilder {
    config: SinkConfig,
    callbacks: SinkCallbacks,
    display: Option<Arc<dyn DisplayClient>>,
    allocator: Option<Box<dyn PlaneAllocator>>,
}

impl SinkBuilder {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            callbacks: SinkCallbacks::default(),
            display: None,
            allocator: None,
        }
    }

    pub fn with_callbacks(mut self, callbacks: SinkCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_display(mut self, display: Arc<dyn DisplayClient>) -> Self {
        self.display = Some(display);
        self
    }

    /// Skips opening the DRM device on `Null -> Ready`.
    pub fn with_allocator(mut self, allocator: Box<dyn PlaneAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn build(self) -> VideoSink {
        let mut pool = BufferPool::new(self.config.num_buffers.max(1));
        if let Some(allocator) = self.allocator {
            pool.set_allocator(allocator);
        }

        let state = SinkState {
            capture_enabled: self.config.capture_only,
            force_aspect_ratio: self.config.force_aspect_ratio,
            ..Default::default()
        };

        VideoSink {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner { state, pool }),
                cond: Condvar::new(),
                channel: Mutex::new(None),
                callbacks: self.callbacks,
                config: self.config,
                stopping: AtomicBool::new(true),
                display: self.display,
            }),
            workers: Mutex::new(Workers::default()),
            element: Mutex::new(ElementState::Null),
        }
    }
}

impl VideoSink {
    pub fn new(config: SinkConfig) -> Self {
        SinkBuilder::new(config).build()
    }

    pub fn builder(config: SinkConfig) -> SinkBuilder {
        SinkBuilder::new(config)
    }

    pub fn config(&self) -> &SinkConfig {
        &self.shared.config
    }

    /// Current segment; timestamps before `segment.start` are not tracked.
    pub fn set_segment(&self, segment: Segment) {
        let mut inner = self.shared.lock();
        if inner.state.segment != segment {
            log::debug!(
                "segment start {} position {}",
                segment.start,
                segment.position
            );
        }
        inner.state.segment = segment;
    }

    /// Upstream reached end of stream; EOS is raised once output drains.
    pub fn eos_event(&self) {
        log::debug!("upstream EOS");
        self.shared.lock().state.eos_seen = true;
    }

    pub fn set_video_info(&self, info: VideoInfo) {
        log::info!(
            "video info {}x{} {} @ {:.2} fps",
            info.width,
            info.height,
            info.layout,
            info.frame_rate
        );
        self.shared.lock().state.video_info = Some(info);
    }

    /// Timing source the video server should bind this connection to.
    pub fn set_session_sync(&self, sync_type: u8, session_id: u32) {
        let mut inner = self.shared.lock();
        inner.state.session_sync = (sync_type, session_id);
        inner.state.session_info_pending = true;
    }

    /// Switches between the local display (`use_gfx`) and the video server.
    ///
    /// The path being left keeps receiving frames for a few more frames
    /// before it is hidden.
    pub fn set_video_path(&self, use_gfx: bool) {
        let channel = self.shared.channel();
        let mut hide_video = false;
        let mut hide_gfx = false;

        {
            let mut inner = self.shared.lock();
            let state = &mut inner.state;
            let config = &self.shared.config;

            if use_gfx && !state.capture_enabled {
                log::info!("switching to local display");
                state.capture_enabled = true;
                state.frames_before_hide_gfx = 0;
                state.frames_before_hide_video = config.hide_video_frames_delay;
                hide_video = state.frames_before_hide_video == 0;
            } else if !use_gfx && state.capture_enabled {
                if state.capture_locked || channel.is_none() {
                    log::warn!("no video server connection, staying on local display");
                    return;
                }
                log::info!("switching to video server");
                state.capture_enabled = false;
                state.frames_before_hide_video = 0;
                state.frames_before_hide_gfx = config.hide_gfx_frames_delay;
                hide_gfx = state.frames_before_hide_gfx == 0;
            }
        }

        if hide_video && let Some(channel) = &channel {
            channel.send_hide(true);
        }
        if hide_gfx {
            if let Some(display) = &self.shared.display {
                display.detach();
            }
            if let Some(channel) = &channel {
                channel.send_hide(false);
            }
        }
    }

    pub fn set_video_rectangle(&self, rect: VideoRect) {
        log::debug!("video rectangle {:?}", rect);
        self.shared.lock().state.video_rect = rect;
    }

    /// Applies a window move or output scale change.
    pub fn update_video_position(&self, geometry: &WindowGeometry) {
        self.set_video_rectangle(geometry.video_rect());
    }

    pub fn set_force_aspect_ratio(&self, force: bool) {
        self.shared.lock().state.force_aspect_ratio = force;
    }

    pub fn video_rectangle(&self) -> VideoRect {
        self.shared.lock().state.video_rect
    }

    /// Playback position in nanoseconds.
    pub fn position(&self) -> i64 {
        self.shared.lock().state.pts.position()
    }

    pub fn is_capture_enabled(&self) -> bool {
        self.shared.lock().state.capture_enabled
    }

    pub fn is_connected(&self) -> bool {
        self.shared.channel().is_some()
    }

    pub fn stats(&self) -> SinkStats {
        self.shared.stats()
    }

    /// Buffers currently held by the display or the video server.
    pub fn buffers_outstanding(&self) -> usize {
        self.shared.lock().pool.outstanding()
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        if self.state() != ElementState::Null {
            self.stop_video();
        }
    }
}

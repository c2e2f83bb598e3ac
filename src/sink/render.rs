//! Per-frame work: pause handling, PTS bookkeeping, buffer fill and routing

use crate::assets::{FRAME_LOG_TARGET, PAUSE_POLL_MS};
use crate::buffer::acquire;
use crate::display::PlanarBuffer;
use crate::error::{Result, SinkError};
use crate::pipeline::VideoRect;
use crate::pipeline::pts::frame_time_us;
use crate::protocol::{FrameChannel, FrameMessage};
use crate::sink::callbacks::{TextureFrame, TexturePlane};
use crate::sink::frame::{PlaneTarget, VideoFrame, VideoInfo, copy_planes};
use crate::sink::{Inner, VideoSink};
use crate::workers::{DispatchWorker, EosSample, EosWorker, FirstFrameWorker, WorkerClose};
use drm_fourcc::DrmFourcc;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

/// What happened to a frame passed to [`VideoSink::render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Handed to the display, the video server or the texture callback
    Rendered,
    /// Consumed without reaching any output
    Dropped,
    /// Not looked at: the session is stopped or flushing
    Skipped,
}

/// Outputs a frame goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    gfx: bool,
    video: bool,
}

/// Plane handles of a buffer plus what describes them.
struct PlaneHandles {
    fds: Vec<OwnedFd>,
    pitches: [u32; 2],
    sizes: [u64; 2],
}

impl VideoSink {
    /// Renders one decoded frame.
    ///
    /// Blocks while the session is paused and while every pool buffer is in
    /// flight; inbound server messages keep being processed meanwhile.
    pub fn render(&self, frame: &VideoFrame) -> Result<RenderOutcome> {
        if !self.wait_while_paused() {
            return Ok(RenderOutcome::Skipped);
        }

        let shared = &self.shared;
        let (info, generation) = {
            let mut inner = shared.lock();
            let state = &mut inner.state;
            let info = state.video_info.ok_or(SinkError::NoVideoInfo)?;

            let frames_in = state.frames_in;
            state.frames_in += 1;
            state.video_started = true;
            if let Some(pts) = frame.pts {
                let segment = state.segment;
                state
                    .pts
                    .on_input(pts, &segment, frame.discontinuity, frames_in);
            }
            (info, state.generation)
        };

        let expected = info.frame_size();
        if frame.data.len() < expected {
            log::warn!(
                "dropping frame of {} bytes, {}x{} {} needs {}",
                frame.data.len(),
                info.width,
                info.height,
                info.layout,
                expected
            );
            shared.lock().state.local_dropped += 1;
            return Ok(RenderOutcome::Dropped);
        }

        self.ensure_workers(info.frame_rate);

        let acquired = acquire(
            &shared.inner,
            info.width,
            info.height,
            || shared.pump(),
            || shared.is_stopping() || shared.lock().state.flush_started,
        );
        let Some(index) = acquired else {
            let mut inner = shared.lock();
            if shared.is_stopping() || inner.state.flush_started {
                return Ok(RenderOutcome::Skipped);
            }
            inner.state.local_dropped += 1;
            return Ok(RenderOutcome::Dropped);
        };

        let channel = shared.channel();
        if let Some(channel) = &channel {
            self.send_pending_session_info(channel);
        }

        if let Err(e) = self.fill_buffer(index, &info, &frame.data) {
            log::error!("unable to fill buffer {}: {}", index, e);
            self.release_if_unheld(index);
            shared.lock().state.local_dropped += 1;
            return Ok(RenderOutcome::Dropped);
        }

        self.notify_first_frame();

        let frame_time = frame.pts.map(frame_time_us).unwrap_or(0);
        let (rect, route, frame_number, position) = {
            let mut inner = shared.lock();
            let Inner { state, pool } = &mut *inner;

            state.frame_number += 1;
            if let Some(buffer) = pool.buffer_mut(index) {
                buffer.frame_time = frame_time;
                buffer.frame_number = state.frame_number;
            }

            let position = match (frame.pts, &channel) {
                (Some(pts), None) => {
                    let segment = state.segment;
                    Some(state.pts.on_local_render(pts, &segment))
                }
                _ => None,
            };

            let route = Route {
                gfx: state.capture_enabled || state.frames_before_hide_gfx > 0,
                video: channel.is_some()
                    && (!state.capture_enabled || state.frames_before_hide_video > 0),
            };
            (
                state.frame_rect(info.width, info.height),
                route,
                state.frame_number,
                position,
            )
        };

        if let Some(position) = position {
            shared.callbacks.emit_timecode(position);
        }

        let mut shown = false;
        if route.gfx {
            shown |= self.show_local(index, &info, generation);
        }
        if route.video
            && let Some(channel) = &channel
        {
            shown |= self.send_to_server(channel, index, &info, rect, frame_time, generation);
        }

        self.advance_path_switch(channel.as_deref());
        self.release_if_unheld(index);

        {
            let mut inner = shared.lock();
            if !shown {
                inner.state.local_dropped += 1;
            }
            inner.state.frames_out += 1;
        }

        if shared.config.frame_debug {
            log::debug!(
                target: FRAME_LOG_TARGET,
                "frame {} buffer {} pts {:?} time {}us route {:?} rect {:?}",
                frame_number,
                index,
                frame.pts,
                frame_time,
                route,
                rect
            );
        }

        Ok(if shown {
            RenderOutcome::Rendered
        } else {
            RenderOutcome::Dropped
        })
    }

    /// Returns `false` when the frame must not be rendered.
    fn wait_while_paused(&self) -> bool {
        let shared = &self.shared;
        let mut inner = shared.lock();
        loop {
            if shared.is_stopping() || inner.state.flush_started {
                return false;
            }
            if !inner.state.paused {
                return true;
            }

            inner = match shared
                .cond
                .wait_timeout(inner, Duration::from_millis(PAUSE_POLL_MS))
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
            drop(inner);
            shared.pump();
            inner = shared.lock();
        }
    }

    /// Starts the dispatch and EOS threads on first use.
    fn ensure_workers(&self, frame_rate: f64) {
        if self.shared.is_stopping() {
            return;
        }
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());

        if workers.dispatch.is_none()
            && let Some(display) = &self.shared.display
        {
            match DispatchWorker::spawn(Arc::clone(display)) {
                Ok(worker) => workers.dispatch = Some(worker),
                Err(e) => log::error!("unable to start dispatch thread: {}", e),
            }
        }

        // the monitor exits after raising EOS and re-arms on the next frame
        if workers.eos.as_ref().is_none_or(EosWorker::is_finished) {
            if let Some(mut finished) = workers.eos.take() {
                finished.close();
            }
            let sampler_shared = Arc::clone(&self.shared);
            let eos_shared = Arc::clone(&self.shared);
            let sampler = move || {
                let inner = sampler_shared.lock();
                EosSample {
                    playing: inner.state.playing,
                    eos_seen: inner.state.eos_seen,
                    frames_out: inner.state.frames_out,
                }
            };
            match EosWorker::spawn(frame_rate, sampler, move || {
                eos_shared.callbacks.emit_end_of_stream()
            }) {
                Ok(worker) => workers.eos = Some(worker),
                Err(e) => log::error!("unable to start eos thread: {}", e),
            }
        }
    }

    fn send_pending_session_info(&self, channel: &FrameChannel) {
        let sync = {
            let mut inner = self.shared.lock();
            let state = &mut inner.state;
            if !state.session_info_pending {
                return;
            }
            state.session_info_pending = false;
            if state.sent_sync == Some(state.session_sync) {
                return;
            }
            state.sent_sync = Some(state.session_sync);
            state.session_sync
        };

        let (sync_type, session_id) = sync;
        log::debug!("session info: sync {} session {}", sync_type, session_id);
        channel.send_session_info(sync_type, session_id);
    }

    /// Copies the frame into the buffer planes. The mapping is set up under
    /// the session lock, the copy runs without it.
    fn fill_buffer(&self, index: usize, info: &VideoInfo, data: &[u8]) -> Result<()> {
        let (mut mappings, luma_pitch, chroma_pitch) = {
            let inner = self.shared.lock();
            let buffer = inner
                .pool
                .buffer(index)
                .ok_or(SinkError::BadBufferIndex(index))?;
            (
                inner.pool.map(index)?,
                buffer.pitch(0) as usize,
                buffer.pitch(1) as usize,
            )
        };

        let [luma, chroma, ..] = mappings.as_mut_slice() else {
            return Err(SinkError::Allocation {
                width: info.width,
                height: info.height,
                reason: "buffer has no chroma plane".to_string(),
            });
        };

        copy_planes(
            info,
            data,
            &mut PlaneTarget {
                data: luma.as_mut_slice(),
                pitch: luma_pitch,
            },
            &mut PlaneTarget {
                data: chroma.as_mut_slice(),
                pitch: chroma_pitch,
            },
        )
    }

    fn notify_first_frame(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.state.first_frame_sent {
                return;
            }
            inner.state.first_frame_sent = true;
        }

        let callbacks = self.shared.callbacks.clone();
        match FirstFrameWorker::spawn(move || callbacks.emit_first_frame()) {
            Ok(worker) => {
                let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
                workers.first_frame = Some(worker);
            }
            Err(e) => log::error!("unable to start first frame thread: {}", e),
        }
    }

    /// Duplicates the plane handles of a buffer, taking a hold on it when
    /// `hold` is set. Nothing is handed out once the session of `generation`
    /// has been stopped.
    fn plane_handles(&self, index: usize, hold: bool, generation: u64) -> Option<PlaneHandles> {
        let mut inner = self.shared.lock();
        if self.shared.is_stopping() || inner.state.generation != generation {
            log::debug!("buffer {} belongs to a stopped session", index);
            return None;
        }
        let buffer = inner.pool.buffer(index)?;
        let handles = match buffer.dup_fds() {
            Ok(fds) => PlaneHandles {
                fds,
                pitches: [buffer.pitch(0), buffer.pitch(1)],
                sizes: [buffer.size(0), buffer.size(1)],
            },
            Err(e) => {
                log::error!("unable to duplicate planes of buffer {}: {}", index, e);
                return None;
            }
        };
        if hold {
            inner.pool.lock(index).ok()?;
        }
        Some(handles)
    }

    fn show_local(&self, index: usize, info: &VideoInfo, generation: u64) -> bool {
        let shared = &self.shared;

        if shared.config.enable_texture && shared.callbacks.has_texture() {
            let Some(handles) = self.plane_handles(index, false, generation) else {
                return false;
            };
            let plane = |i: usize| TexturePlane {
                fd: handles.fds.get(i).map(|fd| fd.as_fd()),
                len: handles.sizes[i],
                stride: handles.pitches[i],
            };
            let texture = TextureFrame {
                format: DrmFourcc::Nv12 as u32,
                width: info.width,
                height: info.height,
                planes: [plane(0), plane(1), TexturePlane::empty()],
            };
            shared.callbacks.emit_new_texture(&texture);
            return true;
        }

        let Some(display) = &shared.display else {
            return false;
        };
        let Some(handles) = self.plane_handles(index, true, generation) else {
            return false;
        };

        let planar = PlanarBuffer {
            index,
            width: info.width,
            height: info.height,
            format: DrmFourcc::Nv12 as u32,
            fds: handles.fds,
            offsets: [0; 3],
            strides: [handles.pitches[0], handles.pitches[1], 0],
        };

        let weak = Arc::downgrade(shared);
        let attached = display.attach_planar(
            planar,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.release_from_display(index, generation);
                }
            }),
        );

        if !attached {
            log::warn!("display refused buffer {}", index);
            shared.lock().pool.unlock(index);
        }
        attached
    }

    fn send_to_server(
        &self,
        channel: &FrameChannel,
        index: usize,
        info: &VideoInfo,
        rect: VideoRect,
        frame_time: i64,
        generation: u64,
    ) -> bool {
        let shared = &self.shared;
        shared.pump();

        let Some(handles) = self.plane_handles(index, true, generation) else {
            return false;
        };
        let message = FrameMessage {
            width: info.width,
            height: info.height,
            format: DrmFourcc::Nv12 as u32,
            x: rect.x,
            y: rect.y,
            w: rect.w,
            h: rect.h,
            offsets: [0; 3],
            strides: [handles.pitches[0], handles.pitches[1], info.width],
            buffer_id: index as u32,
            frame_time,
        };

        match channel.send_frame(&message, handles.fds) {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to send buffer {} to video server: {}", index, e);
                shared.lock().pool.unlock(index);
                false
            }
        }
    }

    /// Counts down the frames the previous path keeps receiving after a
    /// switch, hiding it when the count runs out.
    fn advance_path_switch(&self, channel: Option<&FrameChannel>) {
        let (hide_video, hide_gfx) = {
            let mut inner = self.shared.lock();
            let state = &mut inner.state;
            let mut hide_video = false;
            let mut hide_gfx = false;

            if state.capture_enabled && state.frames_before_hide_video > 0 {
                state.frames_before_hide_video -= 1;
                hide_video = state.frames_before_hide_video == 0;
            }
            if !state.capture_enabled && state.frames_before_hide_gfx > 0 {
                state.frames_before_hide_gfx -= 1;
                hide_gfx = state.frames_before_hide_gfx == 0;
            }
            (hide_video, hide_gfx)
        };

        if hide_video && let Some(channel) = channel {
            log::debug!("hiding video plane");
            channel.send_hide(true);
        }
        if hide_gfx {
            log::debug!("hiding local display");
            if let Some(display) = &self.shared.display {
                display.detach();
            }
            if let Some(channel) = channel {
                channel.send_hide(false);
            }
        }
    }

    /// Returns the buffer to the pool unless the display or the server holds it.
    fn release_if_unheld(&self, index: usize) {
        let mut inner = self.shared.lock();
        let unheld = inner.pool.buffer(index).is_some_and(|b| b.lock_count == 0);
        if unheld && let Err(e) = inner.pool.release(index) {
            log::error!("unable to release buffer {}: {}", index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemfdAllocator;
    use crate::config::SinkConfig;
    use crate::display::HeadlessDisplay;
    use crate::sink::{PixelLayout, SinkCallbacks};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    const W: u32 = 64;
    const H: u32 = 32;

    fn nv12_frame(pts_ms: u64) -> VideoFrame {
        let info = VideoInfo::new(W, H, PixelLayout::Nv12, 30.0);
        VideoFrame::new(vec![0x80u8; info.frame_size()], Some(pts_ms * 1_000_000))
    }

    fn capture_sink(display: Option<Arc<HeadlessDisplay>>, callbacks: SinkCallbacks) -> VideoSink {
        let config = SinkConfig::default().with_capture_only(true);
        let mut builder = VideoSink::builder(config)
            .with_allocator(Box::new(MemfdAllocator::new()))
            .with_callbacks(callbacks);
        if let Some(display) = display {
            builder = builder.with_display(display);
        }
        let sink = builder.build();
        sink.set_video_info(VideoInfo::new(W, H, PixelLayout::Nv12, 30.0));
        sink
    }

    #[test]
    fn test_render_before_start_is_skipped() {
        let sink = capture_sink(None, SinkCallbacks::new());
        assert_eq!(sink.render(&nv12_frame(0)).unwrap(), RenderOutcome::Skipped);
        assert_eq!(sink.stats().frames_in, 0);
    }

    #[test]
    fn test_missing_video_info() {
        let sink = VideoSink::builder(SinkConfig::default().with_capture_only(true))
            .with_allocator(Box::new(MemfdAllocator::new()))
            .build();
        sink.start().unwrap();
        assert!(matches!(
            sink.render(&nv12_frame(0)),
            Err(SinkError::NoVideoInfo)
        ));
    }

    #[test]
    fn test_capture_frames_reach_display() {
        let display = Arc::new(HeadlessDisplay::new());
        let sink = capture_sink(Some(Arc::clone(&display)), SinkCallbacks::new());
        sink.start().unwrap();

        for i in 0..20 {
            assert_eq!(
                sink.render(&nv12_frame(i * 33)).unwrap(),
                RenderOutcome::Rendered
            );
            assert!(sink.buffers_outstanding() <= sink.config().num_buffers);
        }

        assert_eq!(display.attached(), 20);
        assert_eq!(display.last_size(), Some((W, H)));
        let stats = sink.stats();
        assert_eq!(stats.frames_in, 20);
        assert_eq!(stats.frames_out, 20);
        assert_eq!(stats.local_dropped, 0);
        sink.stop().unwrap();
    }

    #[test]
    fn test_capture_without_display_advances_position() {
        let positions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&positions);
        let callbacks =
            SinkCallbacks::new().with_timecode(move |pos| seen.lock().unwrap().push(pos));
        let sink = capture_sink(None, callbacks);
        sink.start().unwrap();

        sink.render(&nv12_frame(1_000)).unwrap();
        sink.render(&nv12_frame(1_040)).unwrap();

        assert_eq!(*positions.lock().unwrap(), vec![0, 40_000_000]);
        assert_eq!(sink.position(), 40_000_000);
        assert_eq!(sink.buffers_outstanding(), 0);
    }

    #[test]
    fn test_texture_mode_hands_out_planes() {
        let textures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&textures);
        let callbacks = SinkCallbacks::new().with_new_texture(move |texture| {
            assert_eq!(texture.format, DrmFourcc::Nv12 as u32);
            assert!(texture.planes[0].fd.is_some());
            assert!(texture.planes[1].fd.is_some());
            assert!(texture.planes[2].fd.is_none());
            assert_eq!(texture.planes[0].len, u64::from(W * H));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let config = SinkConfig::default().with_capture_only(true).with_texture(true);
        let sink = VideoSink::builder(config)
            .with_allocator(Box::new(MemfdAllocator::new()))
            .with_callbacks(callbacks)
            .build();
        sink.set_video_info(VideoInfo::new(W, H, PixelLayout::Nv12, 30.0));
        sink.start().unwrap();

        for i in 0..6 {
            assert_eq!(sink.render(&nv12_frame(i)).unwrap(), RenderOutcome::Rendered);
        }
        assert_eq!(textures.load(Ordering::SeqCst), 6);
        assert_eq!(sink.buffers_outstanding(), 0);
    }

    #[test]
    fn test_short_frame_dropped() {
        let sink = capture_sink(None, SinkCallbacks::new());
        sink.start().unwrap();
        let frame = VideoFrame::new(vec![0u8; 16], Some(0));
        assert_eq!(sink.render(&frame).unwrap(), RenderOutcome::Dropped);
        let stats = sink.stats();
        assert_eq!(stats.local_dropped, 1);
        assert_eq!(stats.frames_out, 0);
    }

    #[test]
    fn test_first_frame_raised_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let callbacks = SinkCallbacks::new().with_first_frame(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let sink = capture_sink(None, callbacks);
        sink.start().unwrap();
        for i in 0..5 {
            sink.render(&nv12_frame(i)).unwrap();
        }
        sink.stop().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_hold_taken_for_stopped_session() {
        let sink = capture_sink(None, SinkCallbacks::new());
        sink.start().unwrap();
        let (index, generation) = {
            let mut inner = sink.shared.lock();
            let index = inner.pool.claim(W, H).unwrap();
            (index, inner.state.generation)
        };
        assert!(sink.plane_handles(index, false, generation).is_some());

        sink.stop_video();
        assert!(sink.plane_handles(index, true, generation).is_none());
        let inner = sink.shared.lock();
        assert_eq!(inner.pool.buffer(index).map(|b| b.lock_count), Some(0));
    }

    #[test]
    fn test_eos_monitor_rearms_after_firing() {
        let (tx, rx) = std::sync::mpsc::channel();
        let callbacks = SinkCallbacks::new().with_end_of_stream(move || {
            let _ = tx.send(());
        });
        let sink = capture_sink(None, callbacks);
        sink.start().unwrap();

        for i in 0..3 {
            sink.render(&nv12_frame(i * 33)).unwrap();
        }
        sink.eos_event();
        assert!(rx.recv_timeout(Duration::from_secs(3)).is_ok());

        for i in 3..6 {
            sink.render(&nv12_frame(i * 33)).unwrap();
        }
        assert!(rx.recv_timeout(Duration::from_secs(3)).is_ok());
        sink.stop().unwrap();
    }

    #[test]
    fn test_paused_render_returns_on_flush() {
        let sink = Arc::new(capture_sink(None, SinkCallbacks::new()));
        sink.start().unwrap();
        sink.pause().unwrap();

        let render_sink = Arc::clone(&sink);
        let start = Instant::now();
        let handle = thread::spawn(move || render_sink.render(&nv12_frame(0)).unwrap());

        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        sink.flush_start();

        assert_eq!(handle.join().unwrap(), RenderOutcome::Skipped);
        assert!(start.elapsed() < Duration::from_secs(2));
        sink.flush_stop();
    }
}

//! Session lifecycle
//!
//! The host walks the session through [`ElementState`]s one step at a time;
//! each step is a [`Transition`] handled by [`StateTransitions::change_state`].

use crate::buffer::open_allocator;
use crate::error::{Result, SinkError};
use crate::pipeline::{ElementState, PtsTracker, Transition, TransitionOutcome};
use crate::protocol::FrameChannel;
use crate::sink::VideoSink;
use crate::workers::WorkerClose;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Element behavior for the six single-step state changes.
pub trait StateTransitions {
    fn change_state(&self, transition: Transition) -> TransitionOutcome;
}

impl StateTransitions for VideoSink {
    fn change_state(&self, transition: Transition) -> TransitionOutcome {
        log::debug!("state change {}", transition);

        match transition {
            Transition::NullToReady => {
                let mut inner = self.shared.lock();
                if !inner.pool.has_allocator() {
                    inner
                        .pool
                        .set_allocator(open_allocator(&self.shared.config.drm_device));
                }
                TransitionOutcome::done()
            }
            Transition::ReadyToPaused => {
                self.open_session();
                TransitionOutcome::done()
            }
            Transition::PausedToPlaying => {
                let mut inner = self.shared.lock();
                inner.state.playing = true;
                inner.state.paused = false;
                inner.state.session_info_pending = true;
                self.shared.cond.notify_all();
                TransitionOutcome::done()
            }
            Transition::PlayingToPaused => {
                let mut inner = self.shared.lock();
                inner.state.playing = false;
                inner.state.paused = true;
                TransitionOutcome::chained()
            }
            Transition::PausedToReady => {
                self.stop_video();
                TransitionOutcome::chained()
            }
            Transition::ReadyToNull => {
                self.stop_video();
                self.shared.lock().pool.teardown();
                TransitionOutcome::done()
            }
        }
    }
}

impl VideoSink {
    pub fn state(&self) -> ElementState {
        *self.element.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies a single transition, which must start from the current state.
    pub fn transition(&self, transition: Transition) -> Result<TransitionOutcome> {
        let mut element = self.element.lock().unwrap_or_else(|e| e.into_inner());
        if *element != transition.from_state() {
            return Err(SinkError::InvalidTransition {
                from: element.to_string(),
                to: transition.to_state().to_string(),
            });
        }

        let outcome = self.change_state(transition);
        if outcome.success {
            *element = transition.to_state();
        } else {
            log::error!("state change {} failed", transition);
        }
        Ok(outcome)
    }

    /// Walks to `target` one transition at a time.
    pub fn set_state(&self, target: ElementState) -> Result<()> {
        let current = self.state();
        for step in Transition::path(current, target) {
            let outcome = self.transition(step)?;
            if !outcome.success {
                return Err(SinkError::InvalidTransition {
                    from: step.from_state().to_string(),
                    to: step.to_state().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.set_state(ElementState::Playing)
    }

    pub fn pause(&self) -> Result<()> {
        self.set_state(ElementState::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        self.set_state(ElementState::Playing)
    }

    pub fn stop(&self) -> Result<()> {
        self.set_state(ElementState::Null)
    }

    /// Drops everything queued: counters restart, the server discards its
    /// frames and a blocked render returns.
    pub fn flush_start(&self) {
        log::debug!("flush start");
        {
            let mut inner = self.shared.lock();
            let state = &mut inner.state;
            state.flush_started = true;
            state.video_started = false;
            state.reset_counters();
            state.pts.reset();
            self.shared.cond.notify_all();
        }
        if let Some(channel) = self.shared.channel() {
            channel.send_flush();
        }
    }

    pub fn flush_stop(&self) {
        log::debug!("flush stop");
        self.shared.lock().state.flush_started = false;
    }

    /// Connects to the video server unless the session is capture-only.
    fn open_session(&self) {
        let shared = &self.shared;
        let config = &shared.config;

        let capture_only = config.capture_only || shared.lock().state.capture_locked;
        let channel = if capture_only {
            None
        } else {
            match config.socket_path().and_then(|path| FrameChannel::connect(&path)) {
                Ok(channel) => Some(channel),
                Err(e) => {
                    log::warn!("{}, rendering to local display only", e);
                    None
                }
            }
        };

        {
            let mut inner = shared.lock();
            let state = &mut inner.state;
            state.reset_counters();
            state.pts = PtsTracker::new();
            state.playing = true;
            state.paused = false;
            state.flush_started = false;
            state.eos_seen = false;
            if channel.is_none() {
                state.capture_enabled = true;
                if !capture_only {
                    state.capture_locked = true;
                }
            }
        }

        *shared.channel.lock().unwrap_or_else(|e| e.into_inner()) = channel.map(Arc::new);
        shared.stopping.store(false, Ordering::Release);
    }

    /// Tears down the running session. Safe to call more than once.
    pub(crate) fn stop_video(&self) {
        let shared = &self.shared;
        shared.stopping.store(true, Ordering::Release);
        shared.cond.notify_all();

        let channel = shared
            .channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(channel) = &channel {
            channel.shutdown();
        }
        if let Some(display) = &shared.display {
            display.detach();
        }

        {
            let mut inner = shared.lock();
            inner.pool.unlock_all();
            let state = &mut inner.state;
            state.generation += 1;
            state.video_started = false;
            state.playing = false;
            state.paused = false;
            state.eos_seen = false;
            state.video_info = None;
            state.frames_before_hide_video = 0;
            state.frames_before_hide_gfx = 0;
            state.sent_sync = None;
            state.session_info_pending = false;
            state.first_frame_sent = false;
            state.first_frame_displayed = false;
        }

        let mut workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        workers.close();

        log::info!("{}", shared.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemfdAllocator;
    use crate::config::SinkConfig;

    fn sink(config: SinkConfig) -> VideoSink {
        VideoSink::builder(config)
            .with_allocator(Box::new(MemfdAllocator::new()))
            .build()
    }

    #[test]
    fn test_outcomes() {
        let sink = sink(SinkConfig::default().with_capture_only(true));
        assert_eq!(
            sink.transition(Transition::NullToReady).unwrap(),
            TransitionOutcome::done()
        );
        assert_eq!(
            sink.transition(Transition::ReadyToPaused).unwrap(),
            TransitionOutcome::done()
        );
        assert_eq!(
            sink.transition(Transition::PausedToPlaying).unwrap(),
            TransitionOutcome::done()
        );
        assert_eq!(
            sink.transition(Transition::PlayingToPaused).unwrap(),
            TransitionOutcome::chained()
        );
        assert_eq!(
            sink.transition(Transition::PausedToReady).unwrap(),
            TransitionOutcome::chained()
        );
        assert_eq!(
            sink.transition(Transition::ReadyToNull).unwrap(),
            TransitionOutcome::done()
        );
        assert_eq!(sink.state(), ElementState::Null);
    }

    #[test]
    fn test_illegal_jump_rejected() {
        let sink = sink(SinkConfig::default().with_capture_only(true));
        assert!(matches!(
            sink.transition(Transition::PausedToPlaying),
            Err(SinkError::InvalidTransition { .. })
        ));
        assert_eq!(sink.state(), ElementState::Null);
    }

    #[test]
    fn test_unreachable_server_locks_capture_mode() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(SinkConfig::default().with_runtime_dir(dir.path()));
        sink.start().unwrap();

        assert!(!sink.is_connected());
        assert!(sink.is_capture_enabled());
        sink.set_video_path(false);
        assert!(sink.is_capture_enabled());
        sink.stop().unwrap();
    }

    #[test]
    fn test_stop_restores_pool_and_state() {
        let sink = sink(SinkConfig::default().with_capture_only(true));
        sink.start().unwrap();
        {
            let mut inner = sink.shared.lock();
            let index = inner.pool.claim(64, 64).unwrap();
            inner.pool.lock(index).unwrap();
        }
        let generation = sink.shared.lock().state.generation;

        sink.set_state(ElementState::Ready).unwrap();

        let inner = sink.shared.lock();
        assert_eq!(inner.pool.outstanding(), 0);
        assert_eq!(inner.pool.semaphore().available(), inner.pool.capacity());
        assert_eq!(inner.state.generation, generation + 1);
        assert!(!inner.state.playing);
        assert!(sink.shared.is_stopping());
    }

    #[test]
    fn test_flush_resets_counters() {
        let sink = sink(SinkConfig::default().with_capture_only(true));
        sink.start().unwrap();
        {
            let mut inner = sink.shared.lock();
            inner.state.frames_in = 7;
            inner.state.frames_out = 6;
            inner.state.frames_displayed = 5;
        }
        sink.flush_start();
        let stats = sink.stats();
        assert_eq!((stats.frames_in, stats.frames_out, stats.frames_displayed), (0, 0, 0));
        sink.flush_stop();
        assert!(!sink.shared.lock().state.flush_started);
    }
}

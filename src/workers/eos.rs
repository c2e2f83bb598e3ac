//! End-of-stream detection
//!
//! Upstream EOS only says no more input is coming; the frames already queued
//! still have to be shown. The worker watches the output counter and raises
//! EOS once it stopped moving for [`EOS_COUNTDOWN`] consecutive frame periods.

use crate::assets::{DEFAULT_EOS_FRAME_RATE, EOS_COUNTDOWN};
use crate::error::Result;
use crate::utils::sos::SignalOfStop;
use crate::workers::{WorkerClose, join_worker};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const THREAD_NAME: &str = "plane_sink_eos";

/// One observation of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EosSample {
    pub playing: bool,
    pub eos_seen: bool,
    pub frames_out: u64,
}

/// Countdown over consecutive stalled samples.
#[derive(Debug, Clone)]
pub struct EosDetector {
    countdown: u32,
    last_frames_out: u64,
}

impl EosDetector {
    pub fn new(frames_out: u64) -> Self {
        Self {
            countdown: EOS_COUNTDOWN,
            last_frames_out: frames_out,
        }
    }

    pub fn countdown(&self) -> u32 {
        self.countdown
    }

    /// Feeds one sample. Returns `true` when end-of-stream should be raised.
    pub fn sample(&mut self, sample: EosSample) -> bool {
        let stalled = sample.playing
            && sample.eos_seen
            && self.last_frames_out > 0
            && self.last_frames_out == sample.frames_out;

        if stalled {
            self.countdown = self.countdown.saturating_sub(1);
            self.countdown == 0
        } else {
            self.last_frames_out = sample.frames_out;
            self.countdown = EOS_COUNTDOWN;
            false
        }
    }
}

/// Sampling interval for a stream frame rate; unknown rates use 30 fps.
pub fn sample_interval(frame_rate: f64) -> Duration {
    let rate = if frame_rate > 0.0 {
        frame_rate
    } else {
        DEFAULT_EOS_FRAME_RATE
    };
    Duration::from_secs_f64(1.0 / rate)
}

pub struct EosWorker {
    handle: Option<JoinHandle<()>>,
    sos: SignalOfStop,
}

impl EosWorker {
    /// Starts sampling through `sampler` every frame period. `on_eos` runs at
    /// most once, from the worker thread, after which the worker exits.
    pub fn spawn<P, E>(frame_rate: f64, sampler: P, on_eos: E) -> Result<Self>
    where
        P: Fn() -> EosSample + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let sos = SignalOfStop::new();
        let thread_sos = sos.clone();
        let interval = sample_interval(frame_rate);

        log::debug!("starting {} thread ({:?})", THREAD_NAME, interval);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let mut detector = EosDetector::new(sampler().frames_out);
                while !thread_sos.wait_timeout(interval) {
                    if detector.sample(sampler()) {
                        log::info!("EOS detected");
                        on_eos();
                        break;
                    }
                }
                log::debug!("eos thread: exit");
            })?;

        Ok(Self {
            handle: Some(handle),
            sos,
        })
    }

    /// `true` once the thread returned, either after raising EOS or on close.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl WorkerClose for EosWorker {
    fn close(&mut self) {
        self.sos.cancel();
        join_worker(THREAD_NAME, self.handle.take());
    }
}

impl Drop for EosWorker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Instant;

    fn stalled(frames_out: u64) -> EosSample {
        EosSample {
            playing: true,
            eos_seen: true,
            frames_out,
        }
    }

    #[test]
    fn test_fires_after_ten_stalled_samples() {
        let mut detector = EosDetector::new(42);
        for _ in 0..9 {
            assert!(!detector.sample(stalled(42)));
        }
        assert!(detector.sample(stalled(42)));
    }

    #[test]
    fn test_progress_resets_countdown() {
        let mut detector = EosDetector::new(1);
        for _ in 0..9 {
            assert!(!detector.sample(stalled(1)));
        }
        assert_eq!(detector.countdown(), 1);

        assert!(!detector.sample(stalled(2)));
        assert_eq!(detector.countdown(), EOS_COUNTDOWN);
        for _ in 0..9 {
            assert!(!detector.sample(stalled(2)));
        }
        assert!(detector.sample(stalled(2)));
    }

    #[test]
    fn test_requires_playing_eos_and_output() {
        let mut detector = EosDetector::new(0);
        for _ in 0..20 {
            assert!(!detector.sample(stalled(0)));
        }

        let mut detector = EosDetector::new(5);
        let paused = EosSample {
            playing: false,
            ..stalled(5)
        };
        let no_eos = EosSample {
            eos_seen: false,
            ..stalled(5)
        };
        for _ in 0..20 {
            assert!(!detector.sample(paused));
            assert!(!detector.sample(no_eos));
        }
    }

    #[test]
    fn test_sample_interval() {
        assert_eq!(sample_interval(0.0), Duration::from_secs_f64(1.0 / 30.0));
        assert_eq!(sample_interval(50.0).as_micros(), 20_000);
    }

    #[test]
    fn test_worker_raises_eos_once() {
        let frames = Arc::new(AtomicU64::new(7));
        let raised = Arc::new(AtomicUsize::new(0));

        let sampled_frames = Arc::clone(&frames);
        let eos_raised = Arc::clone(&raised);
        let worker = EosWorker::spawn(
            1000.0,
            move || stalled(sampled_frames.load(Ordering::SeqCst)),
            move || {
                eos_raised.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        let start = Instant::now();
        while !worker.is_finished() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.is_finished());
        assert_eq!(raised.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_does_not_wait_an_interval() {
        let mut worker = EosWorker::spawn(0.01, EosSample::default, || {}).unwrap();
        let start = Instant::now();
        worker.close();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(worker.is_finished());
    }
}

//! Presentation time bookkeeping
//!
//! Input timestamps are nanoseconds; the sink tracks them as 90 kHz ticks,
//! the unit the video server works in. `first` anchors the running time of
//! the current segment and is what playback position is measured from.

use crate::assets::{NANOS_PER_SECOND, PTS_CLOCK_HZ};

const NANOS_PER_MILLI: i64 = 1_000_000;
const TICKS_PER_MILLI: i64 = 90;
/// Nanoseconds per tick, truncated.
const NANOS_PER_TICK: i64 = (NANOS_PER_SECOND / PTS_CLOCK_HZ) as i64;

/// Converts nanoseconds to 90 kHz ticks without intermediate overflow.
pub fn ns_to_ticks(ns: u64) -> u64 {
    (ns / NANOS_PER_SECOND) * PTS_CLOCK_HZ
        + ((ns % NANOS_PER_SECOND) * PTS_CLOCK_HZ) / NANOS_PER_SECOND
}

/// Converts 90 kHz ticks to nanoseconds, millisecond part first.
pub fn ticks_to_ns(ticks: i64) -> i64 {
    (ticks / TICKS_PER_MILLI) * NANOS_PER_MILLI
        + (ticks % TICKS_PER_MILLI) * NANOS_PER_MILLI / TICKS_PER_MILLI
}

/// Frame time sent on the wire, in microseconds rounded to nearest.
pub fn frame_time_us(pts_ns: u64) -> i64 {
    ((pts_ns + 500) / 1000) as i64
}

/// The part of the upstream segment the sink cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    /// Timestamps below this are outside the segment (ns).
    pub start: u64,
    /// Stream position at the start of the segment (ns).
    pub position: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PtsTracker {
    /// Ticks of the most recent input frame.
    current_input: u64,
    /// Ticks the running time of the segment is measured from.
    first: i64,
    /// Ticks of the frame last reported as displayed.
    current: u64,
    /// Segment position `first` was anchored for; `None` after a reset.
    anchored_segment: Option<u64>,
    /// Distance between the last two forward input timestamps.
    last_step: u64,
    /// Playback position in nanoseconds.
    position: i64,
}

impl PtsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the anchor; the next input frame re-anchors `first`.
    pub fn reset(&mut self) {
        self.anchored_segment = None;
        self.last_step = 0;
    }

    pub fn current_input(&self) -> u64 {
        self.current_input
    }

    pub fn first(&self) -> i64 {
        self.first
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// Running time of the latest input frame, in ticks.
    pub fn running_ticks(&self) -> i64 {
        self.current_input as i64 - self.first
    }

    fn first_ns(&self) -> i64 {
        ticks_to_ns(self.first)
    }

    /// Records an input frame timestamp.
    ///
    /// A change of segment position re-anchors `first`. Without a
    /// discontinuity marker, a backward jump that lands above one second is
    /// taken as a short clip looping back to its start: `first` moves back by
    /// the jump plus one frame step so running time keeps increasing.
    pub fn on_input(
        &mut self,
        pts_ns: u64,
        segment: &Segment,
        discontinuity: bool,
        frames_in: u64,
    ) {
        if pts_ns < segment.start {
            return;
        }

        if self.anchored_segment.is_none() {
            self.current_input = 0;
        }
        let prev = self.current_input;
        let current = ns_to_ticks(pts_ns);
        self.current_input = current;

        if self.anchored_segment != Some(segment.position) {
            self.first = current as i64;
            self.anchored_segment = Some(segment.position);
            self.last_step = 0;
            log::debug!("segment start changed, first pts now {}", self.first);
            return;
        }

        if current == 0 && frames_in != 0 {
            return;
        }

        if current >= prev {
            if current > prev {
                self.last_step = current - prev;
            }
            return;
        }

        if !discontinuity && current > PTS_CLOCK_HZ {
            self.first -= (prev - current + self.last_step) as i64;
            log::debug!(
                "pts went back from {} to {}, first pts now {}",
                prev,
                current,
                self.first
            );
        }
    }

    /// Applies a status report from the video server and returns the new
    /// position in nanoseconds.
    pub fn on_status(&mut self, frame_time_us: i64, segment: &Segment) -> i64 {
        let current_ns = frame_time_us.saturating_mul(1000);
        self.position = segment.position as i64 + current_ns - self.first_ns();
        self.current = (current_ns / NANOS_PER_TICK).max(0) as u64;
        self.position
    }

    /// Position update for frames that never reach a video server.
    pub fn on_local_render(&mut self, pts_ns: u64, segment: &Segment) -> i64 {
        self.position = segment.position as i64 + pts_ns as i64 - self.first_ns();
        self.current = pts_ns / NANOS_PER_TICK as u64;
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_tick_conversions() {
        assert_eq!(ns_to_ticks(NANOS_PER_SECOND), 90_000);
        assert_eq!(ns_to_ticks(40 * MS), 3_600);
        assert_eq!(ticks_to_ns(90_000), 1_000_000_000);
        assert_eq!(ticks_to_ns(45), 500_000);
        assert_eq!(frame_time_us(1_499), 1);
        assert_eq!(frame_time_us(1_500), 2);
    }

    #[test]
    fn test_first_frame_anchors() {
        let mut pts = PtsTracker::new();
        let segment = Segment::default();
        pts.on_input(5_000 * MS, &segment, false, 0);
        assert_eq!(pts.first(), 450_000);
        assert_eq!(pts.running_ticks(), 0);

        pts.on_input(5_040 * MS, &segment, false, 1);
        assert_eq!(pts.running_ticks(), 3_600);
    }

    #[test]
    fn test_segment_change_reanchors() {
        let mut pts = PtsTracker::new();
        pts.on_input(2_000 * MS, &Segment::default(), false, 0);

        let seek = Segment {
            start: 30_000 * MS,
            position: 30_000 * MS,
        };
        pts.on_input(10_000 * MS, &seek, false, 1);
        assert_eq!(pts.first(), 180_000);

        pts.on_input(30_000 * MS, &seek, false, 1);
        assert_eq!(pts.first(), 2_700_000);
    }

    #[test]
    fn test_reset_restarts_from_zero() {
        let mut pts = PtsTracker::new();
        let segment = Segment::default();
        pts.on_input(9_000 * MS, &segment, false, 0);
        pts.reset();
        pts.on_input(3_000 * MS, &segment, false, 1);
        assert_eq!(pts.first(), 270_000);
        assert_eq!(pts.running_ticks(), 0);
    }

    #[test]
    fn test_status_position() {
        let mut pts = PtsTracker::new();
        let segment = Segment {
            start: 0,
            position: 1_000 * MS,
        };
        pts.on_input(2_000 * MS, &segment, false, 0);

        let mut last = i64::MIN;
        for frame in 0..50u64 {
            let frame_time = (2_000_000 + frame * 40_000) as i64;
            let position = pts.on_status(frame_time, &segment);
            assert_eq!(position, (1_000 + frame as i64 * 40) * MS as i64);
            assert!(position >= last);
            last = position;
        }
    }

    #[test]
    fn test_local_render_position() {
        let mut pts = PtsTracker::new();
        let segment = Segment::default();
        pts.on_input(1_000 * MS, &segment, false, 0);
        assert_eq!(pts.on_local_render(1_500 * MS, &segment), 500 * MS as i64);
        assert_eq!(pts.current(), 1_500 * MS / 11_111);
    }

    #[test]
    fn test_looped_clip_keeps_running_time_increasing() {
        let mut pts = PtsTracker::new();
        let segment = Segment::default();

        // 100 frames of 40 ms starting at 10 s, played twice
        let mut last = i64::MIN;
        let mut frames_in = 0;
        for _ in 0..2 {
            for frame in 0..100u64 {
                pts.on_input((10_000 + frame * 40) * MS, &segment, false, frames_in);
                frames_in += 1;
                let running = pts.running_ticks();
                assert!(running > last, "running time went back to {running}");
                last = running;
            }
        }
        assert_eq!(last, 199 * 3_600);
    }

    #[test]
    fn test_discontinuity_is_not_compensated() {
        let mut pts = PtsTracker::new();
        let segment = Segment::default();
        pts.on_input(20_000 * MS, &segment, false, 0);
        pts.on_input(20_040 * MS, &segment, false, 1);
        pts.on_input(5_000 * MS, &segment, true, 2);
        assert_eq!(pts.first(), 1_800_000);
    }

    #[test]
    fn test_backward_jump_below_one_second_is_kept() {
        let mut pts = PtsTracker::new();
        let segment = Segment::default();
        pts.on_input(3_000 * MS, &segment, false, 0);
        pts.on_input(3_040 * MS, &segment, false, 1);
        pts.on_input(500 * MS, &segment, false, 2);
        assert_eq!(pts.first(), 270_000);
    }
}

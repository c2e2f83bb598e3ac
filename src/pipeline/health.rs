//! Session counters and their printable summary

/// Snapshot of a session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SinkStats {
    /// Frames handed to the render path
    pub frames_in: u64,
    /// Frames the render path finished with
    pub frames_out: u64,
    /// Frames the video server reported as shown
    pub frames_displayed: u64,
    /// Drops reported by the video server
    pub server_dropped: u32,
    /// Frames dropped locally (no buffer, failed send, bad input)
    pub local_dropped: u64,
    /// Playback position in nanoseconds
    pub position: i64,
    /// Refresh rate announced by the video server, 0 if unknown
    pub refresh_rate: u32,
}

impl SinkStats {
    /// Share of input frames that never reached a display, as a percentage.
    pub fn drop_rate(&self) -> f64 {
        if self.frames_in == 0 {
            return 0.0;
        }
        let dropped = self.local_dropped + u64::from(self.server_dropped);
        (dropped as f64 / self.frames_in as f64) * 100.0
    }
}

impl std::fmt::Display for SinkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stats: {} in, {} out, {} displayed ({} server drops, {} local drops, {:.2}%), position {:.3}s, refresh {} Hz",
            self.frames_in,
            self.frames_out,
            self.frames_displayed,
            self.server_dropped,
            self.local_dropped,
            self.drop_rate(),
            self.position as f64 / 1e9,
            self.refresh_rate
        )
    }
}

//! Throughput measurement for a capture session.

use std::time::{Duration, Instant};

/// Counts frames since a start marker.
///
/// Owned by the acquisition loop. Consumers see a copy through `SessionStats`, never
/// the tracker itself.
#[derive(Clone, Debug, Default)]
pub struct RateTracker {
    started_at: Option<Instant>,
    frames: u64,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start now and zero the count. Calling again discards the prior count.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, instant: Instant) {
        self.started_at = Some(instant);
        self.frames = 0;
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Time since `start`, or `None` if never started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| start.elapsed())
    }

    /// Frames per second since `start`.
    ///
    /// `None` when the tracker was never started or no time has elapsed.
    pub fn throughput(&self) -> Option<f64> {
        self.throughput_at(Instant::now())
    }

    /// Frames per second between `start` and `now`.
    pub fn throughput_at(&self, now: Instant) -> Option<f64> {
        let start = self.started_at?;
        let secs = now.checked_duration_since(start)?.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(self.frames as f64 / secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_is_undefined_before_start() {
        let mut tracker = RateTracker::new();
        tracker.record_frame();
        assert!(!tracker.is_started());
        assert_eq!(tracker.throughput(), None);
        assert_eq!(tracker.elapsed(), None);
    }

    #[test]
    fn throughput_is_undefined_for_zero_elapsed() {
        let mut tracker = RateTracker::new();
        let start = Instant::now();
        tracker.start_at(start);
        tracker.record_frame();
        assert_eq!(tracker.throughput_at(start), None);
    }

    #[test]
    fn ten_frames_over_two_seconds_is_five_fps() {
        let mut tracker = RateTracker::new();
        let start = Instant::now();
        tracker.start_at(start);
        for _ in 0..10 {
            tracker.record_frame();
        }
        let fps = tracker
            .throughput_at(start + Duration::from_secs(2))
            .unwrap();
        assert!((fps - 5.0).abs() < 1e-9, "fps was {}", fps);
    }

    #[test]
    fn restart_discards_prior_count() {
        let mut tracker = RateTracker::new();
        tracker.start();
        tracker.record_frame();
        tracker.record_frame();
        tracker.start();
        assert_eq!(tracker.frame_count(), 0);
    }

    #[test]
    fn instant_before_start_has_no_throughput() {
        let mut tracker = RateTracker::new();
        let start = Instant::now() + Duration::from_secs(5);
        tracker.start_at(start);
        tracker.record_frame();
        assert_eq!(tracker.throughput_at(Instant::now()), None);
    }
}

//! Frame timing and fence-wait statistics.

use std::sync::Arc;
use std::time::Duration;

use interop_core::Clock;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Frame statistics, owned by the application and passed to the
/// orchestrator each frame.
///
/// Frames per second are computed over one-second windows. While paused,
/// total time stops accumulating but frames are still counted.
pub struct FrameStatsAccumulator {
    clock: Arc<dyn Clock>,
    last_tick: Option<Duration>,
    time_step: Duration,
    total_time: Duration,
    frames: u64,
    window_start: Duration,
    window_frames: u32,
    fps: f64,
    paused: bool,
    show_fps: bool,
    fence_waits: u64,
    fence_wait_time: Duration,
}

impl FrameStatsAccumulator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            last_tick: None,
            time_step: Duration::ZERO,
            total_time: Duration::ZERO,
            frames: 0,
            window_start: now,
            window_frames: 0,
            fps: 0.0,
            paused: false,
            show_fps: true,
            fence_waits: 0,
            fence_wait_time: Duration::ZERO,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Advance by one frame.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.time_step = self
            .last_tick
            .map_or(Duration::ZERO, |last| now.saturating_sub(last));
        self.last_tick = Some(now);
        if !self.paused {
            self.total_time += self.time_step;
        }

        self.frames += 1;
        self.window_frames += 1;
        let window = now.saturating_sub(self.window_start);
        if window >= FPS_WINDOW {
            self.fps = f64::from(self.window_frames) / window.as_secs_f64();
            self.window_frames = 0;
            self.window_start = now;
        }
    }

    /// Record a host-side block on a frame slot's fence.
    pub fn record_fence_wait(&mut self, waited: Duration) {
        self.fence_waits += 1;
        self.fence_wait_time += waited;
    }

    pub fn toggle_pause(&mut self) {
        self.paused = !self.paused;
    }

    pub fn toggle_fps(&mut self) {
        self.show_fps = !self.show_fps;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn shows_fps(&self) -> bool {
        self.show_fps
    }

    /// Overlay text: the frame rate, or a hint to bring it back.
    pub fn fps_text(&self) -> String {
        if self.show_fps {
            format!("fps: {:.2}", self.fps)
        } else {
            "[F1]".to_string()
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn time_step(&self) -> Duration {
        self.time_step
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn fence_waits(&self) -> u64 {
        self.fence_waits
    }

    pub fn fence_wait_time(&self) -> Duration {
        self.fence_wait_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop_core::ManualClock;

    fn stats() -> (Arc<ManualClock>, FrameStatsAccumulator) {
        let clock = Arc::new(ManualClock::new());
        let stats = FrameStatsAccumulator::new(clock.clone());
        (clock, stats)
    }

    #[test]
    fn fps_over_one_second_window() {
        let (clock, mut stats) = stats();
        for _ in 0..60 {
            clock.advance(Duration::from_micros(16_667));
            stats.tick();
        }
        assert_eq!(stats.fps_text(), "fps: 60.00");
        assert_eq!(stats.frame_count(), 60);
    }

    #[test]
    fn f1_hides_fps() {
        let (_clock, mut stats) = stats();
        stats.toggle_fps();
        assert_eq!(stats.fps_text(), "[F1]");
        stats.toggle_fps();
        assert!(stats.fps_text().starts_with("fps: "));
    }

    #[test]
    fn pause_stops_total_time() {
        let (clock, mut stats) = stats();
        stats.tick();
        clock.advance(Duration::from_millis(10));
        stats.tick();
        assert_eq!(stats.total_time(), Duration::from_millis(10));

        stats.toggle_pause();
        clock.advance(Duration::from_millis(10));
        stats.tick();
        assert_eq!(stats.total_time(), Duration::from_millis(10));
        assert_eq!(stats.time_step(), Duration::from_millis(10));

        stats.toggle_pause();
        clock.advance(Duration::from_millis(5));
        stats.tick();
        assert_eq!(stats.total_time(), Duration::from_millis(15));
    }

    #[test]
    fn fence_waits_accumulate() {
        let (_clock, mut stats) = stats();
        stats.record_fence_wait(Duration::from_millis(2));
        stats.record_fence_wait(Duration::from_millis(3));
        assert_eq!(stats.fence_waits(), 2);
        assert_eq!(stats.fence_wait_time(), Duration::from_millis(5));
    }
}

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::Renderer;
use crate::backend::GpuBackend;

/// Wall-clock time spent in each phase of the last [`Renderer::render`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTimings {
    /// World transform pass over the rendered subtree.
    pub transform: Duration,
    /// Scene traversal, batching and every backend call it made.
    pub traversal: Duration,
    pub total: Duration,
}

/// Frame-rate summary over the frames rendered since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderLoopMetrics {
    pub frame_count: u64,
    /// Frames divided by the time between the first frame's start and the last frame's end.
    pub average_frames_per_second: f64,
    pub average_frame_time: Duration,
    /// Frames that finished within the last second.
    pub rolling_frames_per_second: f64,
    pub rolling_average_frame_time: Duration,
}

const ROLLING_WINDOW: Duration = Duration::from_secs(1);
const MAX_ROLLING_SAMPLES: usize = 16_384;

#[derive(Debug, Clone, Copy)]
struct FrameSample {
    finished_at: Instant,
    duration: Duration,
}

#[derive(Debug)]
pub(super) struct FrameRateTracker {
    frame_count: u64,
    total_duration: Duration,
    first_started_at: Option<Instant>,
    last_finished_at: Option<Instant>,
    window: VecDeque<FrameSample>,
    window_duration: Duration,
}

impl Default for FrameRateTracker {
    fn default() -> Self {
        Self {
            frame_count: 0,
            total_duration: Duration::ZERO,
            first_started_at: None,
            last_finished_at: None,
            window: VecDeque::new(),
            window_duration: Duration::ZERO,
        }
    }
}

impl FrameRateTracker {
    pub(super) fn record(&mut self, started_at: Instant, finished_at: Instant) {
        let duration = finished_at.saturating_duration_since(started_at);
        self.first_started_at.get_or_insert(started_at);
        self.last_finished_at = Some(finished_at);
        self.frame_count += 1;
        self.total_duration += duration;

        if self.window.len() == MAX_ROLLING_SAMPLES {
            self.pop_oldest();
        }
        self.window.push_back(FrameSample {
            finished_at,
            duration,
        });
        self.window_duration += duration;

        while let Some(oldest) = self.window.front() {
            if finished_at.saturating_duration_since(oldest.finished_at) <= ROLLING_WINDOW {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some(sample) = self.window.pop_front() {
            self.window_duration = self.window_duration.saturating_sub(sample.duration);
        }
    }

    pub(super) fn snapshot(&self) -> RenderLoopMetrics {
        let elapsed = match (self.first_started_at, self.last_finished_at) {
            (Some(first), Some(last)) => last.saturating_duration_since(first).as_secs_f64(),
            _ => 0.0,
        };
        RenderLoopMetrics {
            frame_count: self.frame_count,
            average_frames_per_second: if elapsed > 0.0 {
                self.frame_count as f64 / elapsed
            } else {
                0.0
            },
            average_frame_time: mean(self.total_duration, self.frame_count),
            rolling_frames_per_second: self.window.len() as f64,
            rolling_average_frame_time: mean(self.window_duration, self.window.len() as u64),
        }
    }

    pub(super) fn reset(&mut self) {
        *self = Self::default();
    }
}

fn mean(total: Duration, count: u64) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(total.as_secs_f64() / count as f64)
    }
}

impl<B: GpuBackend> Renderer<B> {
    pub fn last_phase_timings(&self) -> PhaseTimings {
        self.last_phase_timings
    }

    pub fn render_loop_metrics(&self) -> RenderLoopMetrics {
        self.frame_rate.snapshot()
    }

    /// Starts a new measurement window.
    pub fn reset_render_loop_metrics(&mut self) {
        self.frame_rate.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Duration, expected: Duration) {
        let difference = actual.abs_diff(expected);
        assert!(
            difference < Duration::from_micros(1),
            "{actual:?} is not close to {expected:?}"
        );
    }

    #[test]
    fn empty_tracker_reports_zeroes() {
        assert_eq!(
            FrameRateTracker::default().snapshot(),
            RenderLoopMetrics::default()
        );
    }

    #[test]
    fn averages_cover_every_recorded_frame() {
        let mut tracker = FrameRateTracker::default();
        let start = Instant::now();
        tracker.record(start, start + Duration::from_millis(10));
        tracker.record(
            start + Duration::from_millis(20),
            start + Duration::from_millis(40),
        );

        let metrics = tracker.snapshot();
        assert_eq!(metrics.frame_count, 2);
        assert_close(metrics.average_frame_time, Duration::from_millis(15));
        assert!((metrics.average_frames_per_second - 50.0).abs() < 1e-6);
    }

    #[test]
    fn rolling_window_drops_frames_older_than_a_second() {
        let mut tracker = FrameRateTracker::default();
        let start = Instant::now();
        tracker.record(start, start + Duration::from_millis(10));
        tracker.record(
            start + Duration::from_millis(600),
            start + Duration::from_millis(620),
        );
        tracker.record(
            start + Duration::from_millis(1_300),
            start + Duration::from_millis(1_330),
        );

        let metrics = tracker.snapshot();
        assert_eq!(metrics.rolling_frames_per_second, 2.0);
        assert_close(metrics.rolling_average_frame_time, Duration::from_millis(25));

        tracker.reset();
        assert_eq!(tracker.snapshot().frame_count, 0);
    }
}

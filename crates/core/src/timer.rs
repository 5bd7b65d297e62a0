//! Frame timing for the orchestration loop.

use std::time::{Duration, Instant};

/// Number of frames kept in the rolling average.
const HISTORY_LEN: usize = 60;

/// Measures CPU time between consecutive frames.
///
/// Each call to [`Timer::tick`] closes one frame interval. The last
/// `HISTORY_LEN` intervals feed a rolling average used for frame statistics.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    frames: u64,
    history: [Duration; HISTORY_LEN],
    cursor: usize,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frames: 0,
            history: [Duration::ZERO; HISTORY_LEN],
            cursor: 0,
        }
    }

    /// Total elapsed time since the timer was created or reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Closes the current frame interval and returns its duration.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;

        self.history[self.cursor] = delta;
        self.cursor = (self.cursor + 1) % HISTORY_LEN;
        self.frames += 1;
        delta
    }

    /// Number of intervals recorded by [`Timer::tick`].
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Rolling average over the last recorded intervals.
    pub fn average_frame_time(&self) -> Duration {
        let samples = (self.frames as usize).min(HISTORY_LEN);
        if samples == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.history[..samples].iter().sum();
        total / samples as u32
    }

    /// Reset the timer to the current time and forget recorded intervals.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_is_zero_before_first_tick() {
        let timer = Timer::new();
        assert_eq!(timer.frame_count(), 0);
        assert_eq!(timer.average_frame_time(), Duration::ZERO);
    }

    #[test]
    fn test_tick_counts_frames() {
        let mut timer = Timer::new();
        for _ in 0..3 {
            timer.tick();
        }
        assert_eq!(timer.frame_count(), 3);
        assert!(timer.average_frame_time() <= timer.elapsed());
    }

    #[test]
    fn test_reset_clears_history() {
        let mut timer = Timer::new();
        timer.tick();
        timer.reset();
        assert_eq!(timer.frame_count(), 0);
    }
}

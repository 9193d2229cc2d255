//! Wall clock timing.

use crate::common::*;

/// Accumulates the durations between `tic` and `toc`.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    start: Option<Instant>,
    total: Duration,
    calls: usize,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tic(&mut self) {
        self.start = Some(Instant::now());
    }

    /// Stop the timer and return the elapsed seconds since the last `tic`.
    pub fn toc(&mut self) -> f64 {
        let elapsed = match self.start.take() {
            Some(start) => start.elapsed(),
            None => Duration::ZERO,
        };
        self.total += elapsed;
        self.calls += 1;
        elapsed.as_secs_f64()
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn total_time(&self) -> f64 {
        self.total.as_secs_f64()
    }

    pub fn average_time(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_time() / self.calls as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Format seconds as `H:MM:SS`.
pub fn time_str(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let hours = seconds / 3600;
    let minutes = seconds % 3600 / 60;
    let seconds = seconds % 60;
    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}

// src/bridge/accumulator.rs - Sliding-window byte accumulator
//
// Backs the bridge's instant bitrate estimate: samples older than the
// window are evicted from the front, the running total covers what's left.

use std::collections::VecDeque;

/// Default window: one second, so `instant()` reads directly as per-second.
const DEFAULT_WINDOW_MS: u64 = 1000;

pub(crate) struct WindowAccumulator {
    window_ms: u64,
    samples: VecDeque<(u64, u64)>,
    total: u64,
    last_ms: u64,
}

impl WindowAccumulator {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW_MS)
    }

    pub fn with_window(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            samples: VecDeque::with_capacity(64),
            total: 0,
            last_ms: 0,
        }
    }

    /// Record `value` bytes at `now_ms` and evict anything that fell out
    /// of the window. A non-monotone clock is clamped forward.
    pub fn update(&mut self, now_ms: u64, value: u64) {
        let now_ms = now_ms.max(self.last_ms);
        self.samples.push_back((now_ms, value));
        self.total += value;
        self.evict(now_ms);
    }

    /// Advance the window without recording a sample (decays idle periods).
    pub fn decay(&mut self, now_ms: u64) {
        let now_ms = now_ms.max(self.last_ms);
        self.evict(now_ms);
    }

    /// Window total scaled to bytes per second.
    pub fn instant(&self) -> u64 {
        self.total * 1000 / self.window_ms
    }

    fn evict(&mut self, now_ms: u64) {
        self.last_ms = now_ms;
        let horizon = now_ms.saturating_sub(self.window_ms);
        while let Some(&(ts, value)) = self.samples.front() {
            if ts > horizon {
                break;
            }
            self.total -= value;
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_within_window() {
        let mut acc = WindowAccumulator::new();
        acc.update(1000, 100);
        acc.update(1500, 200);
        assert_eq!(acc.instant(), 300);
    }

    #[test]
    fn test_evicts_old_samples() {
        let mut acc = WindowAccumulator::new();
        acc.update(1000, 100);
        acc.update(2500, 50);
        // The first sample is older than the 1s window.
        assert_eq!(acc.instant(), 50);
    }

    #[test]
    fn test_decay_empties_idle_window() {
        let mut acc = WindowAccumulator::new();
        acc.update(1000, 400);
        assert_eq!(acc.instant(), 400);

        acc.decay(5000);
        assert_eq!(acc.instant(), 0);
    }

    #[test]
    fn test_instant_scales_to_per_second() {
        let mut acc = WindowAccumulator::with_window(500);
        acc.update(1000, 100);
        assert_eq!(acc.instant(), 200);
    }

    #[test]
    fn test_clock_step_back_is_clamped() {
        let mut acc = WindowAccumulator::new();
        acc.update(2000, 100);
        acc.update(1000, 100); // clamped to 2000
        assert_eq!(acc.instant(), 200);
    }
}

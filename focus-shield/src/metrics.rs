// Windowed blocked-traffic counter

//! Counter normalization with periodic epoch reset
//!
//! The packet engine keeps a raw, ever-growing blocked counter. Observers see a
//! per-window value instead: `max(0, raw - offset)`, where `offset` is
//! re-baselined to the raw counter once the window (24h by default) elapses.

use std::time::{Duration, Instant};

/// Default window after which the displayed counter starts over
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Current epoch of the displayed counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsEpoch {
    /// When the current window began
    pub window_start: Instant,
    /// Raw counter value the window counts from
    pub offset: u64,
}

/// Stateful normalizer from raw engine counter to displayed counter
#[derive(Debug)]
pub struct MetricsWindow {
    epoch: MetricsEpoch,
    window: Duration,
    displayed: u64,
}

impl MetricsWindow {
    /// Fresh window starting now
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    /// Fresh window starting at `start`
    pub fn starting_at(window: Duration, start: Instant) -> Self {
        Self {
            epoch: MetricsEpoch {
                window_start: start,
                offset: 0,
            },
            window,
            displayed: 0,
        }
    }

    /// Feed the current raw counter and get the displayed value
    pub fn update(&mut self, raw: u64) -> u64 {
        self.update_at(raw, Instant::now())
    }

    /// [`update`](Self::update) with an explicit clock reading
    pub fn update_at(&mut self, raw: u64, now: Instant) -> u64 {
        if now.saturating_duration_since(self.epoch.window_start) >= self.window {
            log::debug!(
                "Counter window elapsed, rebaselining offset {} -> {}",
                self.epoch.offset,
                raw
            );
            self.epoch = MetricsEpoch {
                window_start: now,
                offset: raw,
            };
        }

        self.displayed = raw.saturating_sub(self.epoch.offset);
        self.displayed
    }

    /// Zero the displayed value and restart the window clock
    ///
    /// The raw counter is unknown here, so `offset` is left as is: until the
    /// window elapses again, the next [`update`](Self::update) reports
    /// `raw - offset` against the old baseline and may jump back up.
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    /// [`reset`](Self::reset) with an explicit clock reading
    pub fn reset_at(&mut self, now: Instant) {
        self.epoch.window_start = now;
        self.displayed = 0;
    }

    /// Last value handed out
    pub fn displayed(&self) -> u64 {
        self.displayed
    }

    /// Current window start and offset
    pub fn epoch(&self) -> MetricsEpoch {
        self.epoch
    }

    /// Window length
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

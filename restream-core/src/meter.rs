//! Frame-rate and byte-rate meters.
//!
//! Both meters keep `(timestamp, weight)` samples over a rolling window
//! and derive a rate from it. The scheduler uses [`FrameRateMeter`] to
//! report its draw rate; the sender uses both to report send fps and
//! bytes/second per media type.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Window used by [`FrameRateMeter::new`].
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Sampling granularity of the sender's byte speedometers.
pub const SPEED_GRANULARITY: Duration = Duration::from_millis(3000);

// ── FrameRateMeter ───────────────────────────────────────────────

/// Rolling-window frame counter.
///
/// `fps` is `(n - 1) / span` where `n` frames were counted within the
/// window and `span` is the time between the oldest and newest of them.
#[derive(Debug)]
pub struct FrameRateMeter {
    ticks: VecDeque<Instant>,
    window: Duration,
}

impl FrameRateMeter {
    /// Create a meter with a one-second window.
    pub fn new() -> Self {
        Self::with_window(FPS_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            ticks: VecDeque::with_capacity(128),
            window,
        }
    }

    /// Count one frame at the current instant.
    pub fn count(&mut self) {
        self.count_at(Instant::now());
    }

    /// Count with an explicit timestamp (useful for testing).
    pub fn count_at(&mut self, when: Instant) {
        self.ticks.push_back(when);
        while let Some(&ts) = self.ticks.front() {
            if when.duration_since(ts) > self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames per second over the window ending now.
    pub fn fps(&self) -> f32 {
        self.fps_at(Instant::now())
    }

    /// Frames per second over the window ending at `now`.
    ///
    /// Ticks older than the window are ignored, so a meter that stops
    /// counting decays to zero.
    pub fn fps_at(&self, now: Instant) -> f32 {
        let mut live = self
            .ticks
            .iter()
            .filter(|ts| now.saturating_duration_since(**ts) <= self.window);
        let Some(first) = live.next() else {
            return 0.0;
        };
        let (n, last) = live.fold((1usize, first), |(n, _), ts| (n + 1, ts));
        if n < 2 {
            return 0.0;
        }
        let span = last.duration_since(*first).as_secs_f32();
        if span <= 0.0 {
            return 0.0;
        }
        (n - 1) as f32 / span
    }

    /// Forget every counted frame.
    pub fn reset(&mut self) {
        self.ticks.clear();
    }
}

impl Default for FrameRateMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ── ByteSpeedometer ──────────────────────────────────────────────

/// Rolling-window byte counter.
///
/// Reports the number of bytes gained within the last `granularity`
/// divided by the granularity, i.e. a smoothed bytes/second figure.
#[derive(Debug)]
pub struct ByteSpeedometer {
    samples: VecDeque<(Instant, u64)>,
    granularity: Duration,
}

impl ByteSpeedometer {
    pub fn new(granularity: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
            granularity,
        }
    }

    /// Record that `bytes` were sent at the current instant.
    pub fn gain(&mut self, bytes: u64) {
        self.gain_at(Instant::now(), bytes);
    }

    pub fn gain_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.evict(when);
    }

    /// Bytes per second over the granularity window ending now.
    pub fn speed(&self) -> u64 {
        self.speed_at(Instant::now())
    }

    pub fn speed_at(&self, now: Instant) -> u64 {
        (self.window_bytes_at(now) as f64 / self.granularity.as_secs_f64()) as u64
    }

    /// Bytes gained within the window ending now.
    pub fn window_bytes(&self) -> u64 {
        self.window_bytes_at(Instant::now())
    }

    pub fn window_bytes_at(&self, now: Instant) -> u64 {
        self.samples
            .iter()
            .filter(|(ts, _)| now.saturating_duration_since(*ts) <= self.granularity)
            .map(|(_, b)| *b)
            .sum()
    }

    /// Number of samples currently in the window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    // ── Internal ─────────────────────────────────────────────────

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, _)) = self.samples.front() {
            if now.duration_since(ts) > self.granularity {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

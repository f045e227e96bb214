//! Replaceable pixel/sample filters behind a bounded-wait lock.
//!
//! A slow or stuck filter must never stall the pacing loop, so the
//! per-frame path only ever *tries* to take the lock, for a few
//! milliseconds at most, and falls back to pass-through otherwise.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// Default time the per-frame path waits for the filter lock.
pub const FILTER_LOCK_TOLERATION: Duration = Duration::from_millis(3);

/// Parameters handed to [`Filter::on_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterParams {
    /// Frame dimensions of the NV21 buffers the filter will see.
    Video { width: u32, height: u32 },
    /// Number of bytes in one audio chunk.
    Audio { frame_size: usize },
}

/// A pixel or sample transform supplied by the application.
///
/// Lifecycle: `on_init` once after installation, `on_frame` for every
/// frame while installed, `on_destroy` once when replaced or torn down.
pub trait Filter: Send {
    fn on_init(&mut self, params: FilterParams);

    /// Transform `input` into `output`.
    ///
    /// Return `false` to signal that `output` was left untouched and the
    /// caller should use `input` instead.
    fn on_frame(&mut self, input: &[u8], output: &mut [u8], timestamp_ms: u64, sequence: u64)
    -> bool;

    fn on_destroy(&mut self) {}
}

// ── FilterGate ───────────────────────────────────────────────────

/// Owned slot for at most one installed [`Filter`].
pub struct FilterGate {
    slot: Mutex<Option<Box<dyn Filter>>>,
    params: FilterParams,
    toleration: Duration,
}

/// Exclusive access to the installed filter, see [`FilterGate::acquire`].
pub type FilterGuard<'a> = MutexGuard<'a, Option<Box<dyn Filter>>>;

impl FilterGate {
    pub fn new(params: FilterParams, toleration: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            params,
            toleration,
        }
    }

    /// Run the installed filter on one frame, if it can be reached in time.
    ///
    /// Returns `true` only when a filter ran and produced `output`.
    pub fn try_apply(&self, input: &[u8], output: &mut [u8], timestamp_ms: u64, sequence: u64) -> bool {
        let Some(mut guard) = self.slot.try_lock_for(self.toleration) else {
            trace!(sequence, "filter lock busy, passing frame through");
            return false;
        };
        match guard.as_mut() {
            Some(filter) => filter.on_frame(input, output, timestamp_ms, sequence),
            None => false,
        }
    }

    /// Replace the installed filter.
    ///
    /// The previous filter is destroyed before the new one is
    /// initialised, both under the lock.
    pub fn set_filter(&self, filter: Option<Box<dyn Filter>>) {
        let mut guard = self.slot.lock();
        if let Some(mut old) = guard.take() {
            old.on_destroy();
        }
        *guard = filter;
        if let Some(new) = guard.as_mut() {
            new.on_init(self.params);
            debug!("filter installed");
        }
    }

    /// Block until the filter slot is free and hold it.
    ///
    /// While the guard lives, every frame passes through unfiltered.
    pub fn acquire(&self) -> FilterGuard<'_> {
        self.slot.lock()
    }

    pub fn has_filter(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Destroy and remove the installed filter.
    pub fn destroy(&self) {
        self.set_filter(None);
    }
}

// ── Tests ────────────────────────────────────────────────────────

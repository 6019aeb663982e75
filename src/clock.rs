//! Session-relative monotonic time
//!
//! Every record carries its timestamp as nanoseconds elapsed since the session
//! started. Deltas stay small (a one-hour session fits in 6 varint bytes) and
//! are immune to wall-clock adjustments. The wall-clock origin is captured once
//! and sent in the handshake so a viewer can anchor the timeline.
//!
//! ```text
//! session start ──┬── Instant::now()      → origin (monotonic)
//!                 └── SystemTime::now()   → origin_unix_ns (handshake only)
//!
//! event           ─── origin.elapsed()    → timestamp_ns (delta, in record)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic clock anchored at session start
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
    origin_unix_ns: u64,
}

impl SessionClock {
    /// Start a clock at the current instant
    pub fn start() -> Self {
        let origin_unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            origin: Instant::now(),
            origin_unix_ns,
        }
    }

    /// Nanoseconds elapsed since session start
    ///
    /// Saturates after ~584 years.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Convert an instant taken elsewhere into a session delta
    ///
    /// Instants before the session start clamp to zero.
    pub fn delta_ns(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.origin).as_nanos()).unwrap_or(u64::MAX)
    }

    /// Wall-clock time of the session start, in nanoseconds since the UNIX epoch
    pub fn origin_unix_ns(&self) -> u64 {
        self.origin_unix_ns
    }
}

/// Session-wide frame index
///
/// A single atomic counter shared by every thread that marks frames.
#[derive(Debug)]
pub struct FrameCounter {
    counter: AtomicU64,
}

impl FrameCounter {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Advance and return the index of the frame just completed (starts at 1)
    #[inline]
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Frames marked so far
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new()
    }
}

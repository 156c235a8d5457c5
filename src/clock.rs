//! Monotonic time and timer abstractions.
//!
//! The core depends on nothing host-specific beyond a monotonic clock and a
//! single-shot relative timer (spec §1, §5). Both are expressed as traits so
//! an embedder can back them with whatever the host actually offers — a
//! hardware timer in a kernel, `tokio::time` in userspace, or a manually
//! stepped fake in tests.

use core::ops::{Add, Sub};

/// A monotonic timestamp, in nanoseconds since an arbitrary epoch.
///
/// Never compared across `Clock` instances; only meaningful relative to
/// other `Instant`s produced by the same clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant(pub u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub fn saturating_sub(self, other: Instant) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(rhs.0))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs.0))
    }
}

/// A span of nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms * 1_000_000)
    }

    pub const fn from_micros(us: u64) -> Self {
        Duration(us * 1_000)
    }

    pub const fn from_secs(s: u64) -> Self {
        Duration(s * 1_000_000_000)
    }

    pub const fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

/// Source of monotonic time. Implemented by the embedder; the core never
/// reads a real clock directly so it stays host-agnostic and deterministic
/// under test.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Opaque handle identifying an armed timer, returned by [`Timer::arm`] and
/// passed back to [`Timer::cancel`]. The embedder is free to make this a
/// hardware timer slot, a `tokio::time::Sleep` handle, whatever fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// A single-shot, relative, cancellable timer facility (spec §5: "arming and
/// firing of the idle-slice timer ... and the scheduled-dispatch work
/// item"). The core arms at most one idle timer per in-service stream at a
/// time; cancellation is best-effort, matching spec §5's "a racing timer
/// callback must observe state changes and no-op if it no longer applies".
pub trait Timer {
    /// Arms a one-shot timer to fire after `after`. Re-arming under the same
    /// `id` replaces any previous arming.
    fn arm(&mut self, after: Duration, id: TimerId);

    /// Cancels a previously armed timer. No-op if it already fired or was
    /// never armed.
    fn cancel(&mut self, id: TimerId);
}

//! Monotonic timebase for timer ordering.
//!
//! Every comparison in the timer queue uses this source; wall-clock time is
//! never consulted, so host clock steps cannot reorder or starve timers.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::OnceLock;

fn epoch() -> std::time::Instant {
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    *EPOCH.get_or_init(std::time::Instant::now)
}

/// The clock all timer expirations are measured against.
pub struct MonotonicClock;

impl MonotonicClock {
    /// The current instant. Non-decreasing within a process.
    pub fn now() -> MonoTime {
        MonoTime(epoch().elapsed().as_secs_f64())
    }
}

/// A monotonic instant: seconds since a process-private epoch.
///
/// Instants are plain ordered scalars. Subtracting two yields seconds as
/// `f64`; adding seconds yields a new instant (which may lie before the
/// epoch, e.g. `now - 10.0` early in the process lifetime).
#[derive(Clone, Copy, PartialEq)]
pub struct MonoTime(f64);

impl MonoTime {
    pub(crate) const ZERO: MonoTime = MonoTime(0.0);
}

impl Sub for MonoTime {
    type Output = f64;

    fn sub(self, rhs: MonoTime) -> f64 {
        self.0 - rhs.0
    }
}

impl Add<f64> for MonoTime {
    type Output = MonoTime;

    fn add(self, seconds: f64) -> MonoTime {
        MonoTime(self.0 + seconds)
    }
}

impl Sub<f64> for MonoTime {
    type Output = MonoTime;

    fn sub(self, seconds: f64) -> MonoTime {
        MonoTime(self.0 - seconds)
    }
}

impl Eq for MonoTime {}

impl Ord for MonoTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for MonoTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for MonoTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.0)
    }
}

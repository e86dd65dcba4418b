//! The expiration callback contract.

use crate::clock::MonoTime;

/// User code invoked when a timer expires.
///
/// `expire` runs on the queue's processing thread with no queue lock held, so
/// it is free to start, cancel, or destroy timers on the same queue,
/// including the one that is expiring. Implementations use `&self` plus
/// interior state because the notifier is shared with the queue for as long
/// as a start is pending.
pub trait Notify: Send + Sync + 'static {
    /// Called once per expiration with the processing instant.
    fn expire(&self, now: MonoTime) -> Expire;

    /// Hook for the `show` debug dumps.
    fn show(&self, _level: u32) {}
}

/// What the queue should do with the timer after its callback returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expire {
    /// Leave the timer in limbo until the next `start`.
    NoRestart,
    /// Schedule another expiration `delay` after the callback returned.
    Restart(RestartDelay),
}

impl Expire {
    /// Shorthand for `Expire::Restart(RestartDelay::from_secs(seconds))`.
    pub fn after(seconds: f64) -> Self {
        Expire::Restart(RestartDelay::from_secs(seconds))
    }
}

/// A validated restart delay: finite and non-negative.
///
/// The validation lives here, at the construction boundary, so an invalid
/// delay is a panic in the notifier's own code path and never becomes queue
/// state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartDelay(f64);

impl RestartDelay {
    /// # Panics
    ///
    /// Panics if `seconds` is negative or not finite; requesting a restart
    /// with such a delay is a logic error in the notifier.
    pub fn from_secs(seconds: f64) -> Self {
        assert!(
            seconds.is_finite() && seconds >= 0.0,
            "timer restart requested with invalid delay {seconds}"
        );
        RestartDelay(seconds)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_delays_pass_through() {
        assert_eq!(RestartDelay::from_secs(0.0).as_secs(), 0.0);
        assert_eq!(RestartDelay::from_secs(2.5).as_secs(), 2.5);
        assert_eq!(Expire::after(1.0), Expire::Restart(RestartDelay::from_secs(1.0)));
    }

    #[test]
    #[should_panic(expected = "invalid delay")]
    fn negative_delay_is_a_logic_error() {
        RestartDelay::from_secs(-0.001);
    }

    #[test]
    #[should_panic(expected = "invalid delay")]
    fn infinite_delay_is_a_logic_error() {
        RestartDelay::from_secs(f64::INFINITY);
    }

    #[test]
    #[should_panic(expected = "invalid delay")]
    fn nan_delay_is_a_logic_error() {
        RestartDelay::from_secs(f64::NAN);
    }
}

//! Monotonic time source used for every deadline in the crate.
//!
//! The core never sleeps on its own: response windows, grace periods and
//! retry backoff are all expressed as an [`Instant`] deadline that is
//! compared against [`Clock::now`]. Waiting for data races the port read
//! against [`Clock::sleep_until`], so no wait can outlive its deadline.

use core::{
    fmt::{Display, Formatter},
    ops::{Add, AddAssign},
    time::Duration,
};
use serde::Serialize;

/// A point in time, in milliseconds since an arbitrary epoch (usually boot).
#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Default, Debug)]
#[serde(transparent)]
pub struct Instant(u64);

impl Instant {
    /// The epoch itself.
    pub const ZERO: Self = Self(0);

    /// Constructs an instant from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the number of milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        let millis = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);

        Self(self.0.saturating_add(millis))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Display for Instant {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        write!(f, "{}.{:03}s", self.0 / 1000, self.0 % 1000)
    }
}

/// Source of the current time plus an asynchronous sleep.
///
/// Implemented on top of `tokio::time` for host builds
/// (see [`serial::TokioClock`](crate::serial)) and `embassy-time` on the firmware.
#[allow(async_fn_in_trait)]
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> Instant;

    /// Completes once [`Clock::now`] has reached `deadline`.
    ///
    /// Must return immediately if the deadline has already passed.
    async fn sleep_until(&self, deadline: Instant);
}

impl<C: Clock> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        (**self).sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn add_saturates() {
        let t = Instant::from_millis(u64::MAX - 1) + Duration::from_secs(1);

        assert_eq!(t, Instant::from_millis(u64::MAX), "addition should saturate");
    }

    #[test]
    fn duration_since() {
        let a = Instant::from_millis(1500);
        let b = Instant::from_millis(4000);

        assert_eq!(b.saturating_duration_since(a), Duration::from_millis(2500));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
        assert_eq!(b.to_string(), "4.000s");
    }
}

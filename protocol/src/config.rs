//! Timing and retry parameters of the locker.
//!
//! All values are plain configuration. [`Config::default`] mirrors the
//! timing constants of the deployed firmware, the `with_*` methods
//! override individual values and [`Config::apply`] merges an update
//! received from the cloud mirror's `/config` path.

use core::{ops::RangeInclusive, time::Duration};
use log::{info, warn};
use serde::Deserialize;

/// Accepted range of remote timeouts and grace periods, in milliseconds.
const REMOTE_TIMEOUT_MS: RangeInclusive<u64> = 100..=60_000;

/// Accepted range of the remote door timeout, in milliseconds.
const REMOTE_DOOR_TIMEOUT_MS: RangeInclusive<u64> = 1_000..=3_600_000;

/// Accepted range of the remote retry backoff unit, in milliseconds.
const REMOTE_BACKOFF_MS: RangeInclusive<u64> = 0..=60_000;

/// Highest accepted remote retry count.
const REMOTE_MAX_RETRIES: u8 = 10;

/// Controller configuration.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Config {
    /// How long a command may wait for `OK`/`ERROR:`.
    pub response_timeout: Duration,
    /// Time allowed for the door sensor to corroborate an actuation.
    pub grace_period: Duration,
    /// How long a session waits for the door to be closed after unlocking.
    pub door_timeout: Duration,
    /// Retries after the first failed attempt of a session command.
    pub max_retries: u8,
    /// Backoff unit, multiplied by the attempt number.
    pub retry_backoff: Duration,
    /// Consecutive `ERROR:` replies that fault a lock.
    pub max_consecutive_failures: u8,
    /// Longest accepted wire line, excluding the terminator.
    pub max_line_len: usize,
    /// How long each control loop tick listens for unsolicited frames.
    pub poll_interval: Duration,
    /// Interval between `AT+STATUS` health checks.
    pub health_check_interval: Duration,
    /// Minimum time between reconnection attempts.
    pub reconnect_interval: Duration,
    /// Number of mirror records buffered while offline.
    pub mirror_backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(2),
            door_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            max_consecutive_failures: 2,
            max_line_len: 64,
            poll_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            mirror_backlog: 128,
        }
    }
}

impl Config {
    /// Sets the command response timeout.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the sensor grace period.
    #[must_use]
    pub fn with_grace_period(mut self, period: Duration) -> Self {
        self.grace_period = period;
        self
    }

    /// Sets the door timeout of sessions.
    #[must_use]
    pub fn with_door_timeout(mut self, timeout: Duration) -> Self {
        self.door_timeout = timeout;
        self
    }

    /// Sets the retry count and backoff unit of session commands.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u8, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Sets the control loop poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the health check interval.
    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Returns the backoff before retry number `attempt` (starting at 1).
    #[must_use]
    pub fn backoff(&self, attempt: u8) -> Duration {
        self.retry_backoff * u32::from(attempt)
    }

    /// Merges a remote update. Absent fields keep their current value.
    ///
    /// Values outside their accepted range are clamped to it.
    pub fn apply(&mut self, update: &RemoteConfig) {
        apply_millis(
            "response timeout",
            update.response_timeout_ms,
            REMOTE_TIMEOUT_MS,
            &mut self.response_timeout,
        );
        apply_millis(
            "grace period",
            update.grace_period_ms,
            REMOTE_TIMEOUT_MS,
            &mut self.grace_period,
        );
        apply_millis(
            "door timeout",
            update.door_timeout_ms,
            REMOTE_DOOR_TIMEOUT_MS,
            &mut self.door_timeout,
        );
        apply_millis(
            "retry backoff",
            update.retry_backoff_ms,
            REMOTE_BACKOFF_MS,
            &mut self.retry_backoff,
        );

        if let Some(retries) = update.max_retries {
            if retries > REMOTE_MAX_RETRIES {
                warn!("Remote retry count {retries} out of range, using {REMOTE_MAX_RETRIES}");
            }

            self.max_retries = retries.min(REMOTE_MAX_RETRIES);
        }

        info!("Configuration updated: {self:?}");
    }
}

/// Sets `field` to `val` milliseconds, clamped to `range`.
fn apply_millis(name: &str, val: Option<u64>, range: RangeInclusive<u64>, field: &mut Duration) {
    let Some(val) = val else {
        return;
    };
    let clamped = val.clamp(*range.start(), *range.end());

    if clamped != val {
        warn!("Remote {name} of {val} ms out of range, using {clamped} ms");
    }

    *field = Duration::from_millis(clamped);
}

/// Configuration update published to the `/config` mirror path.
///
/// ```json
/// { "grace_period_ms": 3000, "max_retries": 5 }
/// ```
#[derive(Deserialize, PartialEq, Eq, Clone, Default, Debug)]
#[serde(default)]
pub struct RemoteConfig {
    /// Overrides [`Config::response_timeout`].
    pub response_timeout_ms: Option<u64>,
    /// Overrides [`Config::grace_period`].
    pub grace_period_ms: Option<u64>,
    /// Overrides [`Config::door_timeout`].
    pub door_timeout_ms: Option<u64>,
    /// Overrides [`Config::max_retries`].
    pub max_retries: Option<u8>,
    /// Overrides [`Config::retry_backoff`].
    pub retry_backoff_ms: Option<u64>,
}

impl RemoteConfig {
    /// Decodes a JSON update.
    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;

    #[test]
    fn linear_backoff() {
        let config = Config::default();

        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(3), Duration::from_millis(1500));
    }

    #[test]
    fn apply_remote_update() -> serde_json::Result<()> {
        init_logger();

        let mut config = Config::default();
        let update = RemoteConfig::from_json(r#"{"grace_period_ms":3500,"max_retries":1}"#)?;

        config.apply(&update);

        assert_eq!(config.grace_period, Duration::from_millis(3500));
        assert_eq!(config.max_retries, 1);
        assert_eq!(
            config.door_timeout,
            Duration::from_secs(60),
            "absent fields should be kept"
        );

        Ok(())
    }

    #[test]
    fn remote_values_are_clamped() -> serde_json::Result<()> {
        init_logger();

        let mut config = Config::default();
        let update = RemoteConfig::from_json(
            r#"{"response_timeout_ms":0,"grace_period_ms":18446744073709551615,"door_timeout_ms":10,"max_retries":200}"#,
        )?;

        config.apply(&update);

        assert_eq!(
            config.response_timeout,
            Duration::from_millis(100),
            "zero timeout should be raised"
        );
        assert_eq!(config.grace_period, Duration::from_secs(60));
        assert_eq!(config.door_timeout, Duration::from_secs(1));
        assert_eq!(config.max_retries, 10);

        Ok(())
    }
}

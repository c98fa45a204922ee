//! Reconnect-with-backoff for transport failures.
//
// Relays and the status board use this to survive `ChannelUnavailable`:
// they wait out an exponentially growing delay and subscribe again. The
// pipeline never retries a dropped message; only connections are retried.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defines a policy for retrying a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of consecutive attempts. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// The delay before the first retry.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound for the delay between retries.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after each failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Start a fresh backoff sequence for this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
            current: self.initial_backoff,
        }
    }
}

/// Iterator-like backoff state; reset after every successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        self.attempt += 1;
        let delay = self.current.min(self.policy.max_backoff);
        let grown = self.current.as_secs_f64() * self.policy.multiplier.max(1.0);
        self.current = Duration::from_secs_f64(grown.min(self.policy.max_backoff.as_secs_f64()));
        Some(delay)
    }

    /// Number of failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.policy.initial_backoff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
        };
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.attempt(), 4);
    }

    #[test]
    fn test_backoff_exhausts() {
        let policy = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        };
        let mut backoff = policy.backoff();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(policy.initial_backoff));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: RetryPolicy = toml::from_str(
            r#"
            max_attempts = 5
            initial_backoff = "250ms"
            max_backoff = "5s"
            "#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));
        assert_eq!(policy.max_backoff, Duration::from_secs(5));
        assert_eq!(policy.multiplier, 2.0);
    }
}

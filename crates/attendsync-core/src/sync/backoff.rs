use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;
use crate::models::SyncState;

/// Exponential backoff for records the server rejected or never saw.
///
/// The delay after `n` failed attempts is `base * 2^(n-1)`, capped at `max`,
/// with a random spread of `+/- jitter` applied on top.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: Duration::from_secs(config.retry_base_secs),
            max: Duration::from_secs(config.retry_max_secs),
            jitter: config.retry_jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt, without jitter.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempts - 1).min(20);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Epoch milliseconds at which a record with `attempts` failures may be retried.
    pub fn next_retry_at(&self, now_ms: i64, attempts: u32) -> i64 {
        let delay = self.delay_for(attempts).as_millis() as f64;
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        now_ms + (delay * (1.0 + spread)).max(0.0) as i64
    }

    /// Whether an automatic pass may submit this record now.
    pub fn is_due(sync: &SyncState, now_ms: i64) -> bool {
        sync.next_retry_at.map(|at| at <= now_ms).unwrap_or(true)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(5), Duration::from_secs(480));
        assert_eq!(policy.delay_for(8), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(400), Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let at = policy.next_retry_at(0, 1);
            assert!((24_000..=36_000).contains(&at), "{}", at);
        }
    }

    #[test]
    fn test_is_due() {
        let mut sync = SyncState::default();
        assert!(RetryPolicy::is_due(&sync, 0));
        sync.next_retry_at = Some(1_000);
        assert!(!RetryPolicy::is_due(&sync, 999));
        assert!(RetryPolicy::is_due(&sync, 1_000));
    }
}

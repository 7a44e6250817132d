//! Exponential backoff with seeded jitter.
//!
//! The jitter for attempt `n` is drawn from a ChaCha stream seeded with
//! `seed ^ key ^ n`. The key is derived from the request id and the target
//! peer, so concurrent retries spread out while a given seed, request and
//! peer always produce the same delay schedule.

use crate::config::RetryConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;
use uuid::Uuid;
use verity_core::{Digest, NodeId};

/// Jitter key for one request sent to one peer
#[must_use]
pub fn jitter_key(request_id: &Uuid, peer: &NodeId) -> u64 {
    let digest = Digest::sha256(format!("{request_id}|{peer}").as_bytes());
    digest
        .as_bytes()
        .iter()
        .take(8)
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// Backoff schedule for delegation retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total attempts, including the first
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// `min(base * 2^attempt, max)` in milliseconds, without jitter
    #[must_use]
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms)
    }

    /// Jitter for `attempt` under `key`, in `0..=max_jitter_ms`
    #[must_use]
    pub fn jitter_ms(&self, attempt: u32, key: u64) -> u64 {
        if self.config.max_jitter_ms == 0 {
            return 0;
        }
        let seed = self.config.jitter_seed ^ key ^ u64::from(attempt);
        ChaCha8Rng::seed_from_u64(seed).gen_range(0..=self.config.max_jitter_ms)
    }

    /// Delay to sleep after failed `attempt` (zero-based). `key` comes from
    /// [`jitter_key`].
    #[must_use]
    pub fn delay(&self, attempt: u32, key: u64) -> Duration {
        Duration::from_millis(
            self.base_delay_ms(attempt)
                .saturating_add(self.jitter_ms(attempt, key)),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms(0), 100);
        assert_eq!(policy.base_delay_ms(1), 200);
        assert_eq!(policy.base_delay_ms(4), 1_600);
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms(20), 30_000);
        assert_eq!(policy.base_delay_ms(200), 30_000);
    }

    #[test]
    fn test_jitter_reproducible_per_seed() {
        let a = RetryPolicy::new(RetryConfig {
            jitter_seed: 42,
            ..RetryConfig::default()
        });
        let b = a;
        let key = jitter_key(&Uuid::nil(), &NodeId::new("peer").unwrap());
        for attempt in 0..8 {
            assert_eq!(a.delay(attempt, key), b.delay(attempt, key));
        }
    }

    #[test]
    fn test_jitter_differs_across_requests() {
        let policy = RetryPolicy::new(RetryConfig {
            max_jitter_ms: 1_000_000,
            ..RetryConfig::default()
        });
        let peer = NodeId::new("peer").unwrap();
        let a = jitter_key(&Uuid::from_u128(1), &peer);
        let b = jitter_key(&Uuid::from_u128(2), &peer);
        let c = jitter_key(&Uuid::from_u128(1), &NodeId::new("other").unwrap());
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(policy.jitter_ms(1, a), policy.jitter_ms(1, b));
        assert_eq!(policy.jitter_ms(1, a), policy.jitter_ms(1, a));
    }

    #[test]
    fn test_zero_jitter() {
        let policy = RetryPolicy::new(RetryConfig {
            max_jitter_ms: 0,
            ..RetryConfig::default()
        });
        assert_eq!(policy.delay(3, 7), Duration::from_millis(800));
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(attempt in 0u32..64, seed in any::<u64>(), key in any::<u64>()) {
            let config = RetryConfig { jitter_seed: seed, ..RetryConfig::default() };
            let policy = RetryPolicy::new(config);
            let ms = u64::try_from(policy.delay(attempt, key).as_millis()).unwrap();
            let base = policy.base_delay_ms(attempt);
            prop_assert!(ms >= base);
            prop_assert!(ms <= base + config.max_jitter_ms);
            prop_assert!(base <= config.max_delay_ms);
        }
    }
}

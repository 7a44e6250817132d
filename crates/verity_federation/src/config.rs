//! Federation configuration.

use serde::{Deserialize, Serialize};

/// Circuit breaker settings, shared by every peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a trial
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// Retry settings for transient delegation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Upper bound of the jitter added to each delay
    pub max_jitter_ms: u64,
    /// Seed for the jitter stream, mixed with each request and peer
    pub jitter_seed: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            max_attempts: 3,
            max_jitter_ms: 100,
            jitter_seed: 0,
        }
    }
}

/// When a peer stops being trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    /// Rejected requests tolerated from one node before it is quarantined
    pub failure_threshold: u32,
    /// Peers whose trust score drops below this are quarantined
    pub trust_threshold: u32,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            trust_threshold: 35,
        }
    }
}

/// Federation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Per-attempt delegation timeout
    pub max_delegation_latency_ms: u64,
    /// Requests at or beyond this depth are rejected
    pub max_delegation_depth: u32,
    /// Lifetime of a handshake challenge
    pub challenge_ttl_ms: u64,
    /// Lifetime of a session token
    pub session_ttl_ms: u64,
    /// Outstanding challenges remembered per peer
    pub nonce_capacity: usize,
    /// Live sessions an acceptor keeps; the oldest is dropped when full
    pub session_capacity: usize,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub quarantine: QuarantineConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_delegation_latency_ms: 5_000,
            max_delegation_depth: 5,
            challenge_ttl_ms: 5 * 60 * 1_000,
            session_ttl_ms: 15 * 60 * 1_000,
            nonce_capacity: 1_024,
            session_capacity: 4_096,
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            quarantine: QuarantineConfig::default(),
        }
    }
}

impl FederationConfig {
    /// Every problem with the configuration
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_delegation_latency_ms == 0 {
            problems.push("federation.max_delegation_latency_ms must be positive".to_string());
        }
        if self.max_delegation_depth == 0 {
            problems.push("federation.max_delegation_depth must be at least 1".to_string());
        }
        if self.challenge_ttl_ms == 0 {
            problems.push("federation.challenge_ttl_ms must be positive".to_string());
        }
        if self.nonce_capacity == 0 {
            problems.push("federation.nonce_capacity must be positive".to_string());
        }
        if self.session_capacity == 0 {
            problems.push("federation.session_capacity must be positive".to_string());
        }
        if self.quarantine.trust_threshold > 100 {
            problems.push("federation.quarantine.trust_threshold must be at most 100".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            problems.push("federation.breaker.failure_threshold must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("federation.retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            problems.push("federation.retry.base_delay_ms exceeds max_delay_ms".to_string());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FederationConfig::default();
        assert_eq!(config.max_delegation_latency_ms, 5_000);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.challenge_ttl_ms, 300_000);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.max_delegation_depth, 5);
        assert_eq!(config.quarantine.failure_threshold, 5);
        assert_eq!(config.quarantine.trust_threshold, 35);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let config = FederationConfig {
            max_delegation_depth: 0,
            breaker: BreakerConfig {
                failure_threshold: 0,
                ..BreakerConfig::default()
            },
            retry: RetryConfig {
                base_delay_ms: 10,
                max_delay_ms: 5,
                ..RetryConfig::default()
            },
            ..FederationConfig::default()
        };
        assert_eq!(config.validate().len(), 3);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: FederationConfig =
            serde_json::from_str(r#"{"breaker": {"failure_threshold": 2}}"#).unwrap();
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.max_delegation_depth, 5);
    }
}

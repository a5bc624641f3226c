//! Configuration types
//!
//! Every tunable number in the core has a named default below and can be
//! overridden from `CONDUCTOR_*` environment variables via
//! [`ConductorConfig::from_env`].

use crate::envelope::Priority;
use crate::error::{ConductorError, ConductorResult, ConfigError};
use crate::usage::TokenUsage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Idle time after which a session is reaped (30 minutes).
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 1800;

/// Interval between session reaper ticks.
pub const DEFAULT_SESSION_CLEANUP_INTERVAL_SECS: u64 = 60;

/// USD per input token.
pub const DEFAULT_PRICE_INPUT: f64 = 0.00003;

/// USD per output token.
pub const DEFAULT_PRICE_OUTPUT: f64 = 0.00015;

/// USD per cache-read input token.
pub const DEFAULT_PRICE_CACHE_READ: f64 = 0.000003;

/// USD per cache-creation input token.
pub const DEFAULT_PRICE_CACHE_CREATION: f64 = 0.0000375;

/// Delay before re-submitting a rejected envelope.
pub const DEFAULT_AGENT_BACKOFF_MS: u64 = 1000;

/// Upper bound on any single retry delay.
pub const DEFAULT_AGENT_MAX_BACKOFF_MS: u64 = 30_000;

/// Growth factor between consecutive retry delays. 1.0 keeps the delay fixed.
pub const DEFAULT_AGENT_BACKOFF_MULTIPLIER: f64 = 1.0;

/// Admission attempts before an envelope is dead-lettered.
pub const DEFAULT_AGENT_MAX_ATTEMPTS: u32 = 10;

/// Bounded inbox size per agent.
pub const DEFAULT_AGENT_INBOX_CAPACITY: usize = 256;

/// How long a terminal progress record is kept (5 minutes).
pub const DEFAULT_PROGRESS_RETENTION_SECS: u64 = 300;

/// How long a closed context is kept (30 minutes).
pub const DEFAULT_CONTEXT_RETENTION_SECS: u64 = 1800;

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Bounded delay-and-retry policy for admission rejections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RetryPolicy {
    /// Base delay for a medium-priority envelope on its first retry.
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub initial_backoff: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Total admission attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(DEFAULT_AGENT_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_AGENT_MAX_BACKOFF_MS),
            backoff_multiplier: DEFAULT_AGENT_BACKOFF_MULTIPLIER,
            max_attempts: DEFAULT_AGENT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based) of an envelope.
    ///
    /// Higher priorities back off less aggressively. The result never
    /// exceeds `max_backoff`.
    pub fn delay_for(&self, attempt: u32, priority: Priority) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_backoff.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let scaled = base * priority.backoff_factor();
        let capped = scaled.min(self.max_backoff.as_nanos() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_nanos(capped as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Whether another admission attempt is allowed after `attempts` tries.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_attempts == 0 {
            return Err(invalid("agent.max_attempts", self.max_attempts, "must be at least 1"));
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(invalid(
                "agent.backoff_multiplier",
                self.backoff_multiplier,
                "must be a finite number >= 1.0",
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(invalid(
                "agent.max_backoff",
                format!("{:?}", self.max_backoff),
                "must not be smaller than the initial backoff",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// COMPONENT CONFIGS
// ============================================================================

/// Shared configuration handed to every worker agent at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentRuntimeConfig {
    pub retry: RetryPolicy,
    pub inbox_capacity: usize,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            inbox_capacity: DEFAULT_AGENT_INBOX_CAPACITY,
        }
    }
}

/// Linear per-token pricing in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PricingConfig {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_creation: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input: DEFAULT_PRICE_INPUT,
            output: DEFAULT_PRICE_OUTPUT,
            cache_read: DEFAULT_PRICE_CACHE_READ,
            cache_creation: DEFAULT_PRICE_CACHE_CREATION,
        }
    }
}

impl PricingConfig {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens as f64 * self.input
            + usage.output_tokens as f64 * self.output
            + usage.cache_read_input_tokens as f64 * self.cache_read
            + usage.cache_creation_input_tokens as f64 * self.cache_creation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionConfig {
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub idle_timeout: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub cleanup_interval: Duration,
    pub pricing: PricingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_SESSION_IDLE_TIMEOUT_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_SESSION_CLEANUP_INTERVAL_SECS),
            pricing: PricingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ProgressConfig {
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub retention: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(DEFAULT_PROGRESS_RETENTION_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ContextConfig {
    /// Closed contexts older than this are evicted.
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub retention: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(DEFAULT_CONTEXT_RETENTION_SECS),
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ConductorConfig {
    pub agent: AgentRuntimeConfig,
    pub session: SessionConfig,
    pub progress: ProgressConfig,
    pub context: ContextConfig,
}

impl ConductorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CONDUCTOR_SESSION_IDLE_TIMEOUT_SECS` (default: 1800)
    /// - `CONDUCTOR_SESSION_CLEANUP_INTERVAL_SECS` (default: 60)
    /// - `CONDUCTOR_PRICE_INPUT`, `CONDUCTOR_PRICE_OUTPUT`,
    ///   `CONDUCTOR_PRICE_CACHE_READ`, `CONDUCTOR_PRICE_CACHE_CREATION`
    /// - `CONDUCTOR_AGENT_BACKOFF_MS` (default: 1000)
    /// - `CONDUCTOR_AGENT_MAX_BACKOFF_MS` (default: 30000)
    /// - `CONDUCTOR_AGENT_BACKOFF_MULTIPLIER` (default: 1.0)
    /// - `CONDUCTOR_AGENT_MAX_ATTEMPTS` (default: 10)
    /// - `CONDUCTOR_AGENT_INBOX_CAPACITY` (default: 256)
    /// - `CONDUCTOR_PROGRESS_RETENTION_SECS` (default: 300)
    /// - `CONDUCTOR_CONTEXT_RETENTION_SECS` (default: 1800)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self {
            agent: AgentRuntimeConfig {
                retry: RetryPolicy {
                    initial_backoff: Duration::from_millis(env_or(
                        "CONDUCTOR_AGENT_BACKOFF_MS",
                        DEFAULT_AGENT_BACKOFF_MS,
                    )),
                    max_backoff: Duration::from_millis(env_or(
                        "CONDUCTOR_AGENT_MAX_BACKOFF_MS",
                        DEFAULT_AGENT_MAX_BACKOFF_MS,
                    )),
                    backoff_multiplier: env_or(
                        "CONDUCTOR_AGENT_BACKOFF_MULTIPLIER",
                        DEFAULT_AGENT_BACKOFF_MULTIPLIER,
                    ),
                    max_attempts: env_or("CONDUCTOR_AGENT_MAX_ATTEMPTS", DEFAULT_AGENT_MAX_ATTEMPTS),
                },
                inbox_capacity: env_or(
                    "CONDUCTOR_AGENT_INBOX_CAPACITY",
                    DEFAULT_AGENT_INBOX_CAPACITY,
                ),
            },
            session: SessionConfig {
                idle_timeout: Duration::from_secs(env_or(
                    "CONDUCTOR_SESSION_IDLE_TIMEOUT_SECS",
                    DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
                )),
                cleanup_interval: Duration::from_secs(env_or(
                    "CONDUCTOR_SESSION_CLEANUP_INTERVAL_SECS",
                    DEFAULT_SESSION_CLEANUP_INTERVAL_SECS,
                )),
                pricing: PricingConfig {
                    input: env_or("CONDUCTOR_PRICE_INPUT", DEFAULT_PRICE_INPUT),
                    output: env_or("CONDUCTOR_PRICE_OUTPUT", DEFAULT_PRICE_OUTPUT),
                    cache_read: env_or("CONDUCTOR_PRICE_CACHE_READ", DEFAULT_PRICE_CACHE_READ),
                    cache_creation: env_or(
                        "CONDUCTOR_PRICE_CACHE_CREATION",
                        DEFAULT_PRICE_CACHE_CREATION,
                    ),
                },
            },
            progress: ProgressConfig {
                retention: Duration::from_secs(env_or(
                    "CONDUCTOR_PROGRESS_RETENTION_SECS",
                    DEFAULT_PROGRESS_RETENTION_SECS,
                )),
            },
            context: ContextConfig {
                retention: Duration::from_secs(env_or(
                    "CONDUCTOR_CONTEXT_RETENTION_SECS",
                    DEFAULT_CONTEXT_RETENTION_SECS,
                )),
            },
        }
    }

    /// Short timers for local runs and tests.
    pub fn development() -> Self {
        let mut config = Self::default();
        config.agent.retry.initial_backoff = Duration::from_millis(20);
        config.agent.retry.max_backoff = Duration::from_millis(200);
        config.session.cleanup_interval = Duration::from_secs(5);
        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConductorResult<()> {
        self.agent.retry.validate()?;

        if self.agent.inbox_capacity == 0 {
            return Err(invalid(
                "agent.inbox_capacity",
                self.agent.inbox_capacity,
                "must be at least 1",
            ));
        }

        let pricing = &self.session.pricing;
        for (field, rate) in [
            ("session.pricing.input", pricing.input),
            ("session.pricing.output", pricing.output),
            ("session.pricing.cache_read", pricing.cache_read),
            ("session.pricing.cache_creation", pricing.cache_creation),
        ] {
            if rate < 0.0 || !rate.is_finite() {
                return Err(invalid(field, rate, "must be a finite non-negative rate"));
            }
        }

        if self.session.idle_timeout.is_zero() {
            return Err(invalid(
                "session.idle_timeout",
                format!("{:?}", self.session.idle_timeout),
                "must be positive",
            ));
        }

        if self.session.cleanup_interval.is_zero() {
            return Err(invalid(
                "session.cleanup_interval",
                format!("{:?}", self.session.cleanup_interval),
                "must be positive",
            ));
        }

        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConductorError {
    ConductorError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Medium),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Retry delays never exceed the configured cap.
        #[test]
        fn prop_delay_never_exceeds_max(
            initial_ms in 1u64..5_000,
            extra_ms in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..64,
            priority in priority_strategy(),
        ) {
            let policy = RetryPolicy {
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(initial_ms + extra_ms),
                backoff_multiplier: multiplier,
                max_attempts: 10,
            };
            prop_assert!(policy.delay_for(attempt, priority) <= policy.max_backoff);
        }

        /// Cost is linear in each token component.
        #[test]
        fn prop_cost_is_additive(
            a in 0u64..1_000_000,
            b in 0u64..1_000_000,
        ) {
            let pricing = PricingConfig::default();
            let both = pricing.cost(&TokenUsage::new(a, b));
            let split = pricing.cost(&TokenUsage::new(a, 0)) + pricing.cost(&TokenUsage::new(0, b));
            prop_assert!((both - split).abs() < 1e-6);
        }
    }
}

//! Configuration loaded from `HERALD_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::TimeLimits;
use crate::domain::RetryPolicy;
use crate::queue::RedisBrokerOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Deployment profile; picks defaults for logging and the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Development,
    Production,
    Testing,
}

impl Profile {
    /// Level used when `RUST_LOG` is unset.
    pub fn default_log_level(self) -> &'static str {
        match self {
            Profile::Development | Profile::Testing => "debug",
            Profile::Production => "warn",
        }
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Profile::Development),
            "production" | "prod" => Ok(Profile::Production),
            "testing" | "test" => Ok(Profile::Testing),
            _ => Err("expected development, production or testing".to_string()),
        }
    }
}

/// Which halves of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Api,
    Worker,
    All,
}

impl Role {
    pub fn runs_api(self) -> bool {
        matches!(self, Role::Api | Role::All)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(Role::Api),
            "worker" => Ok(Role::Worker),
            "all" => Ok(Role::All),
            _ => Err("expected api, worker or all".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err("expected fixed or exponential".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeraldConfig {
    pub profile: Profile,
    pub role: Role,
    pub bind_addr: SocketAddr,

    /// `memory://` or a `redis://` / `rediss://` URL.
    pub broker_url: String,

    /// Retries allowed after the first attempt.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub retry_backoff: BackoffKind,

    pub hard_time_limit: Duration,
    pub soft_time_limit: Duration,

    pub worker_concurrency: usize,
    pub visibility_timeout: Duration,
    pub result_ttl: Duration,
    pub poll_interval: Duration,

    pub rate_limit_per_minute: u32,
    /// Key rate limits on `X-Forwarded-For`; only safe behind a proxy that
    /// overwrites it.
    pub trust_forwarded_for: bool,
    pub max_body_bytes: usize,
}

impl HeraldConfig {
    pub const MEMORY_BROKER_URL: &'static str = "memory://";
    pub const DEFAULT_REDIS_URL: &'static str = "redis://localhost:6379/0";

    /// Multiplier and cap for `HERALD_RETRY_BACKOFF=exponential`.
    pub const EXPONENTIAL_MULTIPLIER: f64 = 2.0;
    pub const EXPONENTIAL_MAX_DELAY: Duration = Duration::from_secs(3600);

    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let profile: Profile = parse(&lookup, "HERALD_ENV", Profile::Development)?;
        let default_broker = match profile {
            Profile::Testing => Self::MEMORY_BROKER_URL,
            Profile::Development | Profile::Production => Self::DEFAULT_REDIS_URL,
        };

        let config = Self {
            profile,
            role: parse(&lookup, "HERALD_ROLE", Role::All)?,
            bind_addr: parse(
                &lookup,
                "HERALD_BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 5000)),
            )?,
            broker_url: lookup("HERALD_BROKER_URL").unwrap_or_else(|| default_broker.to_string()),
            max_attempts: parse(&lookup, "HERALD_MAX_ATTEMPTS", RetryPolicy::DEFAULT_MAX_ATTEMPTS)?,
            retry_delay: secs(&lookup, "HERALD_RETRY_DELAY_SECONDS", 60)?,
            retry_backoff: parse(&lookup, "HERALD_RETRY_BACKOFF", BackoffKind::Fixed)?,
            hard_time_limit: secs(&lookup, "HERALD_HARD_TIME_LIMIT_SECONDS", 1800)?,
            soft_time_limit: secs(&lookup, "HERALD_SOFT_TIME_LIMIT_SECONDS", 1500)?,
            worker_concurrency: parse(&lookup, "HERALD_WORKER_CONCURRENCY", 4)?,
            visibility_timeout: secs(&lookup, "HERALD_VISIBILITY_TIMEOUT_SECONDS", 3600)?,
            result_ttl: secs(&lookup, "HERALD_RESULT_TTL_SECONDS", 86_400)?,
            poll_interval: Duration::from_millis(parse(
                &lookup,
                "HERALD_POLL_INTERVAL_MS",
                1000u64,
            )?),
            rate_limit_per_minute: parse(&lookup, "HERALD_RATE_LIMIT_PER_MINUTE", 60)?,
            trust_forwarded_for: parse(&lookup, "HERALD_TRUST_FORWARDED_FOR", false)?,
            max_body_bytes: parse(&lookup, "HERALD_MAX_BODY_BYTES", 16_384)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.soft_time_limit >= self.hard_time_limit {
            return Err(ConfigError::Inconsistent(format!(
                "soft time limit ({}s) must be below hard time limit ({}s)",
                self.soft_time_limit.as_secs(),
                self.hard_time_limit.as_secs()
            )));
        }
        if self.hard_time_limit >= self.visibility_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "hard time limit ({}s) must be below visibility timeout ({}s)",
                self.hard_time_limit.as_secs(),
                self.visibility_timeout.as_secs()
            )));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Inconsistent(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "poll interval must be positive".to_string(),
            ));
        }
        if !self.uses_memory_broker()
            && !self.broker_url.starts_with("redis://")
            && !self.broker_url.starts_with("rediss://")
        {
            return Err(ConfigError::Invalid {
                key: "HERALD_BROKER_URL",
                value: self.broker_url.clone(),
                reason: "expected memory:// or a redis:// URL".to_string(),
            });
        }
        if self.uses_memory_broker() && self.role != Role::All {
            return Err(ConfigError::Inconsistent(
                "the in-memory broker needs HERALD_ROLE=all".to_string(),
            ));
        }
        Ok(())
    }

    pub fn uses_memory_broker(&self) -> bool {
        self.broker_url.starts_with(Self::MEMORY_BROKER_URL)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry_backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(self.max_attempts, self.retry_delay),
            BackoffKind::Exponential => RetryPolicy::exponential(
                self.max_attempts,
                self.retry_delay,
                Self::EXPONENTIAL_MULTIPLIER,
                Self::EXPONENTIAL_MAX_DELAY,
            ),
        }
    }

    pub fn time_limits(&self) -> TimeLimits {
        TimeLimits::new(self.soft_time_limit, self.hard_time_limit)
    }

    pub fn redis_options(&self) -> RedisBrokerOptions {
        RedisBrokerOptions {
            visibility_timeout: self.visibility_timeout,
            result_ttl: self.result_ttl,
            poll_interval: self.poll_interval,
            ..RedisBrokerOptions::default()
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn secs<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Backoff;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<HeraldConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HeraldConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.profile, Profile::Development);
        assert_eq!(config.role, Role::All);
        assert_eq!(config.bind_addr, "0.0.0.0:5000".parse().unwrap());
        assert_eq!(config.broker_url, "redis://localhost:6379/0");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(60));
        assert_eq!(config.hard_time_limit, Duration::from_secs(1800));
        assert_eq!(config.soft_time_limit, Duration::from_secs(1500));
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.result_ttl, Duration::from_secs(86_400));
        assert_eq!(config.rate_limit_per_minute, 60);
        assert!(!config.trust_forwarded_for);
    }

    #[test]
    fn forwarded_for_trust_is_opt_in() {
        let config = load(&[("HERALD_TRUST_FORWARDED_FOR", "true")]).unwrap();
        assert!(config.trust_forwarded_for);

        assert!(load(&[("HERALD_TRUST_FORWARDED_FOR", "yes")]).is_err());
    }

    #[test]
    fn testing_profile_uses_memory_broker() {
        let config = load(&[("HERALD_ENV", "testing")]).unwrap();

        assert!(config.uses_memory_broker());
        assert_eq!(config.profile.default_log_level(), "debug");
    }

    #[test]
    fn production_logs_warnings_only() {
        let config = load(&[("HERALD_ENV", "production")]).unwrap();
        assert_eq!(config.profile.default_log_level(), "warn");
    }

    #[test]
    fn unparsable_value_names_the_key() {
        let err = load(&[("HERALD_MAX_ATTEMPTS", "three")]).unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { key: "HERALD_MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn soft_limit_must_be_below_hard_limit() {
        let err = load(&[
            ("HERALD_SOFT_TIME_LIMIT_SECONDS", "1800"),
            ("HERALD_HARD_TIME_LIMIT_SECONDS", "1800"),
        ])
        .unwrap_err();

        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn hard_limit_must_be_below_visibility_timeout() {
        let err = load(&[("HERALD_VISIBILITY_TIMEOUT_SECONDS", "1000")]).unwrap_err();
        assert!(err.to_string().contains("visibility timeout"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(load(&[("HERALD_WORKER_CONCURRENCY", "0")]).is_err());
    }

    #[test]
    fn memory_broker_cannot_be_split_across_roles() {
        let err = load(&[("HERALD_BROKER_URL", "memory://"), ("HERALD_ROLE", "api")]).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn unknown_broker_scheme_is_rejected() {
        let err = load(&[("HERALD_BROKER_URL", "amqp://localhost")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "HERALD_BROKER_URL", .. }));
    }

    #[test]
    fn exponential_backoff_policy() {
        let config = load(&[
            ("HERALD_RETRY_BACKOFF", "exponential"),
            ("HERALD_RETRY_DELAY_SECONDS", "10"),
        ])
        .unwrap();

        let policy = config.retry_policy();
        assert!(matches!(policy.backoff, Backoff::Exponential { .. }));
        assert_eq!(policy.next_delay(1), Duration::from_secs(10));
        assert_eq!(policy.next_delay(2), Duration::from_secs(20));
    }
}

//! Dispatcher configuration
//!
//! Defines all configurable parameters for the dispatcher including polling,
//! retry behaviour, rate limit fallback and the job store connection.

use anyhow::Context;
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::{DispatchSettings, RetryPolicy};

/// Which job store backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local store, for development and demos
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("unknown store backend '{}', expected postgres or memory", other),
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier used in logs; worker tasks append their index
    pub dispatcher_id: String,

    pub store: StoreBackend,

    /// PostgreSQL connection string, required for the postgres backend
    pub database_url: Option<String>,

    /// Base URL of the collaborator service executing job steps
    pub collaborator_url: String,

    /// Per-request timeout against the collaborator
    pub request_timeout: Duration,

    /// How often an idle worker polls for claimable jobs
    pub poll_interval: Duration,

    pub max_attempts: i32,

    /// Number of concurrent dispatch workers in this process
    pub workers: usize,

    pub retry_policy: RetryPolicy,

    /// Suspension applied when the provider reports no quota reset time
    pub rate_limit_wait: Duration,

    /// How long a claim survives without a heartbeat before any dispatcher
    /// may requeue the job
    pub claim_lease: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(dispatcher_id: String, collaborator_url: String) -> Self {
        Self {
            dispatcher_id,
            store: StoreBackend::Postgres,
            database_url: None,
            collaborator_url,
            request_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            workers: 1,
            retry_policy: RetryPolicy::default(),
            rate_limit_wait: Duration::from_secs(60 * 60),
            claim_lease: Duration::from_secs(5 * 60),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DISPATCHER_ID (optional, default: random UUID)
    /// - STORE (optional, postgres or memory, default: postgres)
    /// - DATABASE_URL (required for the postgres store)
    /// - COLLABORATOR_URL (optional, default: http://localhost:8090)
    /// - REQUEST_TIMEOUT (optional, seconds, default: 120)
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - MAX_ATTEMPTS (optional, default: 3)
    /// - DISPATCHER_WORKERS (optional, default: 1)
    /// - RETRY_POLICY (optional, default: exponential:30:1800)
    /// - RATE_LIMIT_DEFAULT_WAIT (optional, seconds, default: 3600)
    /// - CLAIM_LEASE (optional, seconds, default: 300)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key lookup; unset keys keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("DISPATCHER_ID") {
            config.dispatcher_id = id;
        }
        if let Some(store) = lookup("STORE") {
            config.store = store.parse()?;
        }
        config.database_url = lookup("DATABASE_URL");
        if let Some(url) = lookup("COLLABORATOR_URL") {
            config.collaborator_url = url;
        }

        let seconds = |key: &str| -> anyhow::Result<Option<Duration>> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .with_context(|| format!("{} must be a number of seconds", key))
                })
                .transpose()
        };

        if let Some(timeout) = seconds("REQUEST_TIMEOUT")? {
            config.request_timeout = timeout;
        }
        if let Some(interval) = seconds("POLL_INTERVAL")? {
            config.poll_interval = interval;
        }
        if let Some(wait) = seconds("RATE_LIMIT_DEFAULT_WAIT")? {
            config.rate_limit_wait = wait;
        }
        if let Some(lease) = seconds("CLAIM_LEASE")? {
            config.claim_lease = lease;
        }

        if let Some(raw) = lookup("MAX_ATTEMPTS") {
            config.max_attempts = raw
                .trim()
                .parse()
                .context("MAX_ATTEMPTS must be an integer")?;
        }
        if let Some(raw) = lookup("DISPATCHER_WORKERS") {
            config.workers = raw
                .trim()
                .parse()
                .context("DISPATCHER_WORKERS must be an integer")?;
        }
        if let Some(raw) = lookup("RETRY_POLICY") {
            config.retry_policy = raw.parse()?;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatcher_id.is_empty() {
            anyhow::bail!("dispatcher_id cannot be empty");
        }

        if self.store == StoreBackend::Postgres
            && self.database_url.as_deref().is_none_or(str::is_empty)
        {
            anyhow::bail!("DATABASE_URL is required for the postgres store");
        }

        if !self.collaborator_url.starts_with("http://")
            && !self.collaborator_url.starts_with("https://")
        {
            anyhow::bail!("collaborator_url must start with http:// or https://");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.max_attempts < 1 {
            anyhow::bail!("max_attempts must be at least 1");
        }

        if self.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }

        if self.rate_limit_wait.is_zero() {
            anyhow::bail!("rate_limit_wait must be greater than 0");
        }

        if self.claim_lease < Duration::from_secs(3) {
            anyhow::bail!("claim_lease must be at least 3 seconds");
        }

        Ok(())
    }

    /// Settings handed to each dispatch worker
    pub fn dispatch_settings(&self) -> anyhow::Result<DispatchSettings> {
        Ok(DispatchSettings {
            poll_interval: self.poll_interval,
            max_attempts: self.max_attempts,
            retry_policy: self.retry_policy,
            rate_limit_wait: chrono::Duration::from_std(self.rate_limit_wait)
                .context("rate_limit_wait out of range")?,
            lease: chrono::Duration::from_std(self.claim_lease)
                .context("claim_lease out of range")?,
            ..Default::default()
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8090".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.rate_limit_wait, Duration::from_secs(3600));

        // Postgres is the default store and needs a URL
        assert!(config.validate().is_err());
        let config = Config {
            store: StoreBackend::Memory,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("DISPATCHER_ID", "dispatch-a"),
            ("DATABASE_URL", "postgres://localhost/quill"),
            ("POLL_INTERVAL", "2"),
            ("MAX_ATTEMPTS", "5"),
            ("DISPATCHER_WORKERS", "4"),
            ("RETRY_POLICY", "fixed:10"),
            ("RATE_LIMIT_DEFAULT_WAIT", "900"),
            ("CLAIM_LEASE", "120"),
        ]))
        .unwrap();

        assert_eq!(config.dispatcher_id, "dispatch-a");
        assert_eq!(config.store, StoreBackend::Postgres);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.workers, 4);
        assert_eq!(
            config.retry_policy,
            RetryPolicy::Fixed(chrono::Duration::seconds(10))
        );
        assert!(config.validate().is_ok());

        let settings = config.dispatch_settings().unwrap();
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.rate_limit_wait, chrono::Duration::minutes(15));
        assert_eq!(settings.lease, chrono::Duration::minutes(2));
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(40));
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("POLL_INTERVAL", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("STORE", "redis")])).is_err());
        assert!(Config::from_lookup(lookup(&[("RETRY_POLICY", "sometimes")])).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config {
            store: StoreBackend::Memory,
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        config.collaborator_url = "not-a-url".to_string();
        assert!(config.validate().is_err());
        config.collaborator_url = "http://localhost:8090".to_string();

        config.max_attempts = 0;
        assert!(config.validate().is_err());
        config.max_attempts = 1;

        config.workers = 0;
        assert!(config.validate().is_err());
        config.workers = 1;

        config.claim_lease = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}

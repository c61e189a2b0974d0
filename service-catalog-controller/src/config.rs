use std::time::Duration;

use anyhow::Context;

/// Maximum number of times a key is retried before it is dropped.
pub const MAX_RETRIES: u32 = 15;

/// Initial backoff of the polling queue.
pub const POLLING_START_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff cap of the polling queue.
pub const POLLING_MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Per-item backoff of the primary queues.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Overall rate limit of the primary queues.
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent workers per queue.
    pub workers: usize,
    pub max_retries: u32,
    /// Interval of the periodic full resync of all kinds.
    pub resync_interval: Duration,
    /// How long failing catalog fetches and asynchronous instance operations
    /// are retried before giving up.
    pub reconciliation_retry_duration: Duration,
    /// Send the platform context (namespace) with provision requests.
    pub osb_context_profile: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_retries: MAX_RETRIES,
            resync_interval: Duration::from_secs(300),
            reconciliation_retry_duration: Duration::from_secs(7 * 24 * 60 * 60),
            osb_context_profile: true,
        }
    }
}

impl ControllerConfig {
    /// Read the configuration from `SERVICE_CATALOG_*` environment variables,
    /// falling back to the defaults for unset or empty variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(env_var)
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("SERVICE_CATALOG_WORKERS") {
            config.workers = v
                .parse()
                .with_context(|| format!("invalid SERVICE_CATALOG_WORKERS {:?}", v))?;
            if config.workers == 0 {
                anyhow::bail!("SERVICE_CATALOG_WORKERS must be at least 1");
            }
        }
        if let Some(v) = lookup("SERVICE_CATALOG_MAX_RETRIES") {
            config.max_retries = v
                .parse()
                .with_context(|| format!("invalid SERVICE_CATALOG_MAX_RETRIES {:?}", v))?;
        }
        if let Some(v) = lookup("SERVICE_CATALOG_RESYNC_INTERVAL_SECONDS") {
            let secs: u64 = v.parse().with_context(|| {
                format!("invalid SERVICE_CATALOG_RESYNC_INTERVAL_SECONDS {:?}", v)
            })?;
            config.resync_interval = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("SERVICE_CATALOG_RECONCILIATION_RETRY_SECONDS") {
            let secs: u64 = v.parse().with_context(|| {
                format!("invalid SERVICE_CATALOG_RECONCILIATION_RETRY_SECONDS {:?}", v)
            })?;
            config.reconciliation_retry_duration = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("SERVICE_CATALOG_OSB_CONTEXT_PROFILE") {
            config.osb_context_profile = v
                .parse()
                .with_context(|| format!("invalid SERVICE_CATALOG_OSB_CONTEXT_PROFILE {:?}", v))?;
        }
        info!(
            "controller configuration: {} workers, {} max retries, resync every {:?}",
            config.workers, config.max_retries, config.resync_interval
        );
        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

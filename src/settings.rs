use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_LEASE_DURATION_SECS: i32 = 30;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub log_format: LogFormat,
    pub lock: LockConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// What the renewal task does when an attempt fails with an error other than
/// a lost race or a busy lease.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RenewalErrorPolicy {
    /// Clear `keep_locking` and exit the loop.
    #[default]
    Stop,
    /// Keep renewing on the refresh interval while `keep_locking` holds.
    Retry,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("lease_name must not be empty")]
    EmptyLeaseName,
    #[error("namespace must not be empty")]
    EmptyNamespace,
    #[error("holder_identity must not be empty")]
    EmptyHolderIdentity,
    #[error("lease_duration_secs must be positive, got {0}")]
    InvalidLeaseDuration(i32),
}

/// Settings for one named lease. Immutable once handed to a `LeaseLock`.
#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    pub lease_name: String,
    pub namespace: String,
    #[serde(default = "default_holder_identity")]
    pub holder_identity: String,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: i32,
    /// Delay between renewals; half the lease duration when unset.
    #[serde(default)]
    pub refresh_interval_ms: Option<u64>,
    /// Delay between acquisition attempts in `get_lock(true)`; the full lease
    /// duration when unset.
    #[serde(default)]
    pub try_interval_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub create_lease_if_not_exist: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    #[serde(default)]
    pub on_renewal_error: RenewalErrorPolicy,
}

fn default_lease_duration_secs() -> i32 {
    DEFAULT_LEASE_DURATION_SECS
}

fn default_true() -> bool {
    true
}

/// `<hostname>-<pid>`, unique per process on a host.
pub fn default_holder_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{}-{}", host, std::process::id())
}

impl LockConfig {
    pub fn new(lease_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            holder_identity: default_holder_identity(),
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            refresh_interval_ms: None,
            try_interval_ms: None,
            create_lease_if_not_exist: true,
            labels: BTreeMap::new(),
            max_attempts: None,
            max_wait_ms: None,
            on_renewal_error: RenewalErrorPolicy::default(),
        }
    }

    pub fn with_holder_identity(mut self, identity: impl Into<String>) -> Self {
        self.holder_identity = identity.into();
        self
    }

    pub fn with_lease_duration_secs(mut self, secs: i32) -> Self {
        self.lease_duration_secs = secs;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_try_interval(mut self, interval: Duration) -> Self {
        self.try_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_create_lease_if_not_exist(mut self, create: bool) -> Self {
        self.create_lease_if_not_exist = create;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait_ms = Some(wait.as_millis() as u64);
        self
    }

    pub fn with_renewal_error_policy(mut self, policy: RenewalErrorPolicy) -> Self {
        self.on_renewal_error = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_name.is_empty() {
            return Err(ConfigError::EmptyLeaseName);
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.holder_identity.is_empty() {
            return Err(ConfigError::EmptyHolderIdentity);
        }
        if self.lease_duration_secs <= 0 {
            return Err(ConfigError::InvalidLeaseDuration(self.lease_duration_secs));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs.max(0) as u64)
    }

    /// Zero counts as unset so the renewal task never spins.
    pub fn refresh_interval(&self) -> Duration {
        match self.refresh_interval_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.lease_duration() / 2,
        }
    }

    /// Zero counts as unset, like `refresh_interval`.
    pub fn try_interval(&self) -> Duration {
        match self.try_interval_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.lease_duration(),
        }
    }

    /// The policy `get_lock(true)` waits under.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: self.try_interval(),
            max_attempts: self.max_attempts,
            max_wait: self.max_wait_ms.map(Duration::from_millis),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&data)?;
        cfg.lock.validate()?;
        Ok(cfg)
    }
}

//! TOML configuration.
//!
//! Every section and field is optional; a missing config file yields the
//! defaults below.
//!
//! ```toml
//! [ledger]
//! path = ".diaspora-tools-migrate-user-cache"
//!
//! [resolve]
//! wait_attempts = 10
//! backoff_secs = 3
//!
//! [http]
//! timeout_secs = 30
//! max_retries = 3
//! retry_backoff_ms = 1000
//!
//! [membership]
//! conflict_statuses = [400, 409]
//! not_found_statuses = [404]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MembershipError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub resolve: ResolveConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".diaspora-tools-migrate-user-cache")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolveConfig {
    /// Attempt budget when `--wait` is given. Without it the budget is 1.
    #[serde(default = "default_wait_attempts")]
    pub wait_attempts: u32,
    /// Fixed pause between attempts in wait mode.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            wait_attempts: default_wait_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

fn default_wait_attempts() -> u32 {
    10
}
fn default_backoff_secs() -> u64 {
    3
}

impl ResolveConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for idempotent requests on network errors, 429 and 5xx.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles on each further retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            user_agent: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

impl HttpConfig {
    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base...
    pub fn retry_delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms) * (1u32 << retry.saturating_sub(1).min(5))
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("pod-migrate/{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Mapping from membership-endpoint HTTP status to outcome class.
///
/// Pods differ in which status they use for "already a member", so the
/// mapping is configuration rather than code.
#[derive(Debug, Deserialize, Clone)]
pub struct MembershipConfig {
    #[serde(default = "default_conflict_statuses")]
    pub conflict_statuses: Vec<u16>,
    #[serde(default = "default_not_found_statuses")]
    pub not_found_statuses: Vec<u16>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            conflict_statuses: default_conflict_statuses(),
            not_found_statuses: default_not_found_statuses(),
        }
    }
}

fn default_conflict_statuses() -> Vec<u16> {
    vec![400, 409]
}
fn default_not_found_statuses() -> Vec<u16> {
    vec![404]
}

impl MembershipConfig {
    /// Classify a failed membership mutation by its status code.
    pub fn classify(&self, status: u16, body: &str) -> MembershipError {
        if self.conflict_statuses.contains(&status) {
            MembershipError::Conflict
        } else if self.not_found_statuses.contains(&status) {
            MembershipError::NotFound
        } else {
            MembershipError::Other(format!("status {}: {}", status, body.trim()))
        }
    }
}

/// Load and validate the configuration file.
///
/// A missing file is not an error: the defaults are returned.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.resolve.wait_attempts == 0 {
        anyhow::bail!("resolve.wait_attempts must be >= 1");
    }

    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }

    let m = &config.membership;
    for status in m.conflict_statuses.iter().chain(&m.not_found_statuses) {
        if !(100..=599).contains(status) {
            anyhow::bail!("membership status {} is not a valid HTTP status", status);
        }
    }
    if let Some(dup) = m
        .conflict_statuses
        .iter()
        .find(|s| m.not_found_statuses.contains(s))
    {
        anyhow::bail!(
            "membership status {} is listed as both conflict and not-found",
            dup
        );
    }

    Ok(())
}

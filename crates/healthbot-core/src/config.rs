//! File-based configuration (TOML).
//!
//! Every field has a default, so an empty file is a valid config.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HealthError, Result};

/// Top-level config structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthbotConfig {
    pub scheduler: SchedulerConfig,
    pub detection: DetectionConfig,
    pub clustering: ClusteringConfig,
    pub cleaner: CleanerConfig,
    pub notifications: NotificationsConfig,
}

/// Poller pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub pollers: usize,
    pub poll_period_ms: u64,
    /// Upper bound of the random delay added to each poll period.
    pub poll_jitter_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pollers: 16,
            poll_period_ms: 15_000,
            poll_jitter_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }
}

/// A `(server, branch)` pair the detector watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedBranch {
    pub server: String,
    pub branch: String,
}

/// Issue detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Status changes at or above which a history counts as flaky.
    pub flaky_status_change_border: usize,
    /// Flaky rate (percent) that raises a high-flaky-rate issue.
    pub high_flaky_rate_percent: f64,
    /// Suites whose new failures are reported as trusted suite failures.
    pub trusted_suites: Vec<String>,
    pub tracked: Vec<TrackedBranch>,
    pub detect_quiet_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            flaky_status_change_border: 6,
            high_flaky_rate_percent: 20.0,
            trusted_suites: Vec::new(),
            tracked: Vec::new(),
            detect_quiet_secs: 900,
        }
    }
}

/// Defect clustering settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub issue_lookback_days: i64,
    pub quiet_period_secs: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            issue_lookback_days: 14,
            quiet_period_secs: 300,
        }
    }
}

/// Cleaner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub enabled: bool,
    /// Records younger than this are never removed.
    pub safe_days: i64,
    /// Deletion budget per run and per record kind.
    pub items_to_delete: usize,
    pub quiet_period_secs: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safe_days: 180,
            items_to_delete: 100_000,
            quiet_period_secs: 24 * 60 * 60,
        }
    }
}

/// Notification recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub address: String,
    /// Servers followed; empty follows all.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Tracked branches followed; empty follows all.
    #[serde(default)]
    pub branches: Vec<String>,
    /// Build tags followed; empty follows all.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Subscriber {
    pub fn follows_server(&self, server_id: &str) -> bool {
        self.servers.is_empty() || self.servers.iter().any(|s| s == server_id)
    }

    pub fn follows_branch(&self, branch: Option<&str>) -> bool {
        if self.branches.is_empty() {
            return true;
        }
        branch.is_some_and(|b| self.branches.iter().any(|s| s == b))
    }

    /// Untagged builds pass any filter.
    pub fn follows_tags(&self, build_tags: &BTreeSet<String>) -> bool {
        self.tags.is_empty()
            || build_tags.is_empty()
            || self.tags.iter().any(|t| build_tags.contains(t))
    }
}

/// Notification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub max_retries: u32,
    pub recent_window_mins: i64,
    pub quiet_period_secs: u64,
    pub subscribers: Vec<Subscriber>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            recent_window_mins: 120,
            quiet_period_secs: 300,
            subscribers: Vec::new(),
        }
    }
}

impl HealthbotConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        debug!(path = %path.display(), "Loaded config from file");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| HealthError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.pollers == 0 {
            return Err(HealthError::Config("scheduler.pollers must be at least 1".into()));
        }
        if self.scheduler.poll_period_ms == 0 {
            return Err(HealthError::Config("scheduler.poll_period_ms must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.detection.high_flaky_rate_percent) {
            return Err(HealthError::Config(
                "detection.high_flaky_rate_percent must be within 0..=100".into(),
            ));
        }
        if self.clustering.issue_lookback_days <= 0 {
            return Err(HealthError::Config(
                "clustering.issue_lookback_days must be positive".into(),
            ));
        }
        if self.cleaner.safe_days <= 0 {
            return Err(HealthError::Config("cleaner.safe_days must be positive".into()));
        }
        if self.notifications.recent_window_mins <= 0 {
            return Err(HealthError::Config(
                "notifications.recent_window_mins must be positive".into(),
            ));
        }
        if let Some(bad) = self
            .notifications
            .subscribers
            .iter()
            .find(|s| s.address.trim().is_empty())
        {
            return Err(HealthError::Config(format!(
                "subscriber with empty address: {bad:?}"
            )));
        }
        Ok(())
    }
}

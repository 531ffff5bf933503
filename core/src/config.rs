use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MirrorError, Result};
use crate::reference::OverrideSets;

/// Mirror controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Compute and record mirror actions without touching the registry
    pub dry_run: bool,

    /// Registry serving the source image streams
    pub source_registry: String,

    /// Name of the cluster the source image streams live on
    pub source_cluster: String,

    /// Repository every mirrored tag is pushed into
    pub destination_repository: String,

    /// Number of concurrent reconcile workers
    pub workers: usize,

    /// Number of mirror records kept in memory
    pub retention: usize,

    /// Attempts per object before a transient failure is given up on
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    pub base_backoff_ms: u64,

    /// Retry delay ceiling in seconds
    pub max_backoff_secs: u64,

    /// Timeout for one registry mirror operation in seconds
    pub push_timeout_secs: u64,

    /// Timeout for one cluster API call in seconds
    pub cluster_timeout_secs: u64,

    /// Interval between cluster listings in seconds
    pub poll_interval_secs: u64,

    /// Interval between full re-syncs of every object in seconds
    pub resync_interval_secs: u64,

    /// Time in-flight work is given to finish on shutdown in seconds
    pub grace_period_secs: u64,

    /// Always-mirrored tags, streams and namespaces
    pub overrides: OverrideSets,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            source_registry: "registry.ci.openshift.org".to_string(),
            source_cluster: "app.ci".to_string(),
            destination_repository: "quay.io/openshift/ci".to_string(),
            workers: 4,
            retention: 1000,
            max_attempts: 5,
            base_backoff_ms: 1000,
            max_backoff_secs: 300,
            push_timeout_secs: 60,
            cluster_timeout_secs: 30,
            poll_interval_secs: 30,
            resync_interval_secs: 600,
            grace_period_secs: 10,
            overrides: OverrideSets::default(),
        }
    }
}

impl MirrorConfig {
    /// Check settings that would make the controller unusable.
    /// Every problem is reported, not just the first.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.workers == 0 {
            errors.push(MirrorError::ConfigError("workers must be at least 1".to_string()));
        }
        if self.retention == 0 {
            errors.push(MirrorError::ConfigError("retention must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            errors.push(MirrorError::ConfigError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.source_registry.trim().is_empty() {
            errors.push(MirrorError::ConfigError(
                "source_registry must be set".to_string(),
            ));
        }
        if self.destination_repository.trim().is_empty() {
            errors.push(MirrorError::ConfigError(
                "destination_repository must be set".to_string(),
            ));
        } else if self.destination_repository.contains(':')
            && !self.destination_repository.contains('/')
        {
            errors.push(MirrorError::ConfigError(format!(
                "destination_repository '{}' must not carry a tag",
                self.destination_repository
            )));
        }
        if self.poll_interval_secs == 0 || self.resync_interval_secs == 0 {
            errors.push(MirrorError::ConfigError(
                "poll and resync intervals must be at least one second".to_string(),
            ));
        }
        if self.base_backoff_ms > self.max_backoff_secs * 1000 {
            errors.push(MirrorError::ConfigError(
                "base_backoff_ms must not exceed max_backoff_secs".to_string(),
            ));
        }

        match MirrorError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// Human-readable lines (default).
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: '{}' (supported: text, json)", s)),
        }
    }
}

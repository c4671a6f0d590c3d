//! YAML configuration for scheduler mode.
//!
//! Describes the nodes to collect from and the recurring jobs to run
//! against them, plus scheduler limits.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::Node;
use crate::registry::Registry;

/// Default maximum concurrent runs.
pub const DEFAULT_MAX_TASKS: usize = 4;

/// Default run-slot acquisition grace period.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Default per-run timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

fn default_max_tasks() -> usize {
    DEFAULT_MAX_TASKS
}

fn default_grace() -> Duration {
    DEFAULT_GRACE
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Configuration load and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the YAML document.
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Semantic validation failed.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Scheduler limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrent runs across all jobs.
    pub max_tasks: usize,

    /// Grace period for acquiring a run slot before a trigger is dropped.
    #[serde(with = "humantime_serde")]
    pub grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            grace: default_grace(),
        }
    }
}

/// One recurring job: a collector or group run against one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Collector or group path, e.g. `/local/system/loadavg`.
    pub collector: String,

    /// Hostname of the node to run against; must reference `nodes`.
    pub node: String,

    /// Cron expression, 6-field (`sec min hour day month weekday`).
    pub cron: String,

    /// Per-run timeout (default: 60s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduler limits.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Target nodes, keyed by hostname in [`JobConfig::node`].
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Recurring jobs.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Validate node references, collector names and cron expressions
    /// against the registry.
    pub fn validate(&self, registry: &Registry) -> Result<(), ConfigError> {
        let nodes: HashMap<&str, &Node> = self
            .nodes
            .iter()
            .map(|n| (n.hostname.as_str(), n))
            .collect();

        for node in &self.nodes {
            if node.hostname.is_empty() {
                return Err(ConfigError::Validation("node with empty hostname".into()));
            }
        }

        for job in &self.jobs {
            if !nodes.contains_key(job.node.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "job {} references unknown node {}",
                    job.collector, job.node
                )));
            }
            if registry.get(&job.collector).is_err() && registry.group(&job.collector).is_err() {
                return Err(ConfigError::Validation(format!(
                    "job references unknown collector or group {}",
                    job.collector
                )));
            }
            cron::Schedule::from_str(&job.cron).map_err(|e| {
                ConfigError::Validation(format!(
                    "job {} has invalid cron {:?}: {}",
                    job.collector, job.cron, e
                ))
            })?;
        }
        Ok(())
    }

    /// Look up a configured node by hostname.
    pub fn node(&self, hostname: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }
}

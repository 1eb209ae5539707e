use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::core::task::Capability;
use crate::{Error, Result};

/// Upper bound on an assignment deadline (30 days).
pub const MAX_ASSIGNMENT_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// What `publish`/`send_direct` do when the target queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for room in the queue.
    #[default]
    Block,
    /// Fail immediately with `TopicFull` / `InboxFull`.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_retries: u32,
    pub scheduling_timeout_secs: u64,
    pub assignment_timeout_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub tick_interval_ms: u64,
    pub topic_capacity: usize,
    pub inbox_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub history_limit: usize,
    pub max_remediation_loops: u32,
    pub review_capability: String,
    pub test_capability: String,
    pub remediation_capability: String,
    pub max_request_len: usize,
    pub state_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            scheduling_timeout_secs: 120,
            assignment_timeout_secs: 300,
            heartbeat_timeout_secs: 30,
            heartbeat_interval_secs: 10,
            tick_interval_ms: 500,
            topic_capacity: 256,
            inbox_capacity: 64,
            backpressure: BackpressurePolicy::Block,
            history_limit: 1000,
            max_remediation_loops: 3,
            review_capability: "review".to_string(),
            test_capability: "test".to_string(),
            remediation_capability: "backend".to_string(),
            max_request_len: 10_000,
            state_dir: None,
        }
    }
}

impl Config {
    pub fn forge_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".forge"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::forge_dir()?.join("forge.toml"))
    }

    /// Directory holding persisted project records.
    pub fn projects_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::forge_dir()?.join("projects")),
        }
    }

    pub fn scheduling_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduling_timeout_secs)
    }

    /// Per-assignment deadline, capped at [`MAX_ASSIGNMENT_TIMEOUT_SECS`].
    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.assignment_timeout_secs.min(MAX_ASSIGNMENT_TIMEOUT_SECS))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn review_capability(&self) -> Capability {
        Capability::new(&self.review_capability)
    }

    pub fn test_capability(&self) -> Capability {
        Capability::new(&self.test_capability)
    }

    pub fn remediation_capability(&self) -> Capability {
        Capability::new(&self.remediation_capability)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!("Config::load path={}", path.display());
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        debug!(
            "Config loaded: max_retries={}, assignment_timeout={}s, backpressure={:?}",
            config.max_retries, config.assignment_timeout_secs, config.backpressure
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let forge_dir = Self::forge_dir()?;
        if !forge_dir.exists() {
            debug!("Creating forge directory");
            fs::create_dir_all(&forge_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

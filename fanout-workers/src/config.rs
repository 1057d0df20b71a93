//! Harness configuration.
//!
//! Loaded from a TOML file (default: `fanout.toml`). Every section and field
//! is optional; missing values fall back to the defaults below.

use fanout_types::{ChaosLevel, Env};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`WorkersConfig::env`].
pub const ENV_VAR: &str = "FANOUT_ENV";

/// Environment variable overriding [`StreamsConfig::timeout_ms`].
pub const STREAM_TIMEOUT_VAR: &str = "DEFAULT_STREAM_TIMEOUT_MS";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Worker provisioning.
    pub workers: WorkersConfig,
    /// Stream verification.
    pub streams: StreamsConfig,
    /// Network simulation.
    pub network: NetworkConfig,
    /// Epoch/fork checking.
    pub forks: ForksConfig,
}

/// Worker provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Deployment to talk to (default: local).
    #[serde(default)]
    pub env: Env,
    /// Directory holding per-worker databases (default: `.data`).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Background sync period for workers with a sync mode (default: 5000).
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Per-worker buffer of observed stream events (default: 1024).
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Stream verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Per-receiver wait budget (default: 10000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Reception percentage that counts as "almost all" (default: 95.0).
    #[serde(default = "default_almost_all_threshold")]
    pub almost_all_threshold: f64,
    /// Pause between consecutive triggered events (default: 0).
    #[serde(default)]
    pub send_interval_ms: u64,
}

/// Network simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Seed for every worker link; links are seeded from entropy when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Chaos level to run in the background, if any.
    #[serde(default)]
    pub chaos: Option<ChaosLevel>,
    /// Override of the level's re-roll interval.
    #[serde(default)]
    pub chaos_interval_ms: Option<u64>,
}

/// Epoch/fork checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForksConfig {
    /// Churn rounds per check (default: 3).
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    /// Members removed and re-added per round (default: 1).
    #[serde(default = "default_churn_members")]
    pub churn_members: usize,
    /// Try to repair a diverged group (default: true).
    #[serde(default = "default_repair")]
    pub repair: bool,
    /// Repairs per round before giving up (default: 2).
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from(".data")
}

fn default_sync_interval_ms() -> u64 {
    5_000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_almost_all_threshold() -> f64 {
    95.0
}

fn default_epochs() -> u32 {
    3
}

fn default_churn_members() -> usize {
    1
}

fn default_repair() -> bool {
    true
}

fn default_max_repair_attempts() -> u32 {
    2
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            env: Env::default(),
            data_dir: default_data_dir(),
            sync_interval_ms: default_sync_interval_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            almost_all_threshold: default_almost_all_threshold(),
            send_interval_ms: 0,
        }
    }
}

impl Default for ForksConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            churn_members: default_churn_members(),
            repair: default_repair(),
            max_repair_attempts: default_max_repair_attempts(),
        }
    }
}

impl StreamsConfig {
    /// Per-receiver wait budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `FANOUT_ENV` and `DEFAULT_STREAM_TIMEOUT_MS` from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay environment overrides from an arbitrary lookup.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_VAR) {
            self.workers.env = value
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", ENV_VAR, e)))?;
        }
        if let Some(value) = lookup(STREAM_TIMEOUT_VAR) {
            self.streams.timeout_ms = value.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} is not a number: {}", STREAM_TIMEOUT_VAR, value))
            })?;
        }
        Ok(())
    }

    /// Reject values the harness cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.streams.almost_all_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "streams.almost_all_threshold must be within 0..=100, got {}",
                threshold
            )));
        }
        if self.workers.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "workers.event_buffer must be at least 1".into(),
            ));
        }
        if self.workers.sync_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "workers.sync_interval_ms must be at least 1".into(),
            ));
        }
        if self.network.chaos_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "network.chaos_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.streams.timeout_ms, 10_000);
        assert_eq!(config.streams.almost_all_threshold, 95.0);
        assert_eq!(config.forks.epochs, 3);
        assert_eq!(config.workers.env, Env::Local);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[workers]
env = "dev"
data_dir = "/tmp/fanout"
sync_interval_ms = 250

[streams]
timeout_ms = 3000
almost_all_threshold = 90.0

[network]
seed = 42
chaos = "medium"

[forks]
epochs = 5
repair = false
"#;

        let config = HarnessConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.workers.env, Env::Dev);
        assert_eq!(config.workers.data_dir, PathBuf::from("/tmp/fanout"));
        assert_eq!(config.workers.sync_interval_ms, 250);
        assert_eq!(config.workers.event_buffer, 1024);
        assert_eq!(config.streams.timeout(), Duration::from_secs(3));
        assert_eq!(config.streams.almost_all_threshold, 90.0);
        assert_eq!(config.network.seed, Some(42));
        assert_eq!(config.network.chaos, Some(ChaosLevel::Medium));
        assert_eq!(config.forks.epochs, 5);
        assert!(!config.forks.repair);
        assert_eq!(config.forks.max_repair_attempts, 2);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = HarnessConfig::from_toml_str("").unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let err = HarnessConfig::from_toml_str("[streams]\nalmost_all_threshold = 101.0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = HarnessConfig::from_toml_str("[workers]\nevent_buffer = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_intervals_rejected() {
        let err = HarnessConfig::from_toml_str("[workers]\nsync_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = HarnessConfig::from_toml_str("[network]\nchaos = \"low\"\nchaos_interval_ms = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("chaos_interval_ms"));

        let config = HarnessConfig::from_toml_str("[network]\nchaos_interval_ms = 1\n").unwrap();
        assert_eq!(config.network.chaos_interval_ms, Some(1));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = HarnessConfig::from_toml_str("[streams\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> =
            HashMap::from([(ENV_VAR, "prod"), (STREAM_TIMEOUT_VAR, "2500")]);
        let mut config = HarnessConfig::default();
        config
            .apply_env_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.workers.env, Env::Production);
        assert_eq!(config.streams.timeout_ms, 2500);
    }

    #[test]
    fn bad_env_override_rejected() {
        let mut config = HarnessConfig::default();
        let err = config
            .apply_env_from(|key| (key == STREAM_TIMEOUT_VAR).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[forks]\nchurn_members = 2").unwrap();

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.forks.churn_members, 2);

        let missing = HarnessConfig::from_file(Path::new("/nonexistent/fanout.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}

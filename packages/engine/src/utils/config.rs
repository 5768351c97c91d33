// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. `replica-engine.toml` in the working directory, or the file named by
//!    `REPLICA_ENGINE_CONFIG`
//! 3. Environment variables such as `REPLICA_ENGINE__POOL__INSTANCES=4`

use crate::runtime::instance_pool::InstancePoolConfig;
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "REPLICA_ENGINE_CONFIG";

/// Default config file stem (any format the `config` crate understands)
pub const DEFAULT_CONFIG_FILE: &str = "replica-engine";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "REPLICA_ENGINE";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Instance pool sizing
    pub pool: InstancePoolConfig,

    /// Log output
    pub logging: LoggingConfig,

    /// Metrics exporter
    pub metrics: MetricsConfig,

    /// Settings for the demo binary
    pub demo: DemoConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listen address, e.g. `127.0.0.1:9000`. Disabled when unset.
    pub listen: Option<String>,
}

/// Demo binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Directory package to load at startup
    pub package: Option<String>,

    /// Module path of the pickled object inside the package
    pub module: String,

    /// File name of the pickled object inside the package
    pub file: String,

    /// Number of concurrent calls to fan out
    pub calls: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            package: None,
            module: "model".to_string(),
            file: "model.pkl".to_string(),
            calls: 16,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, optional file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref())
    }

    /// Load configuration using an explicit file path (or the default stem)
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: EngineConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        debug!("Engine configuration resolved: {:?}", config);
        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.instances, 2);
        assert_eq!(config.pool.active_limit, None);
        assert_eq!(config.logging.level, "info");
        assert!(config.metrics.listen.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[pool]\ninstances = 3\nactive_limit = 2\n\n[logging]\njson = true").unwrap();

        let config = EngineConfig::load_from(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.pool.instances, 3);
        assert_eq!(config.pool.active_limit, Some(2));
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_rejects_invalid_pool() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[pool]\ninstances = 0").unwrap();

        let result = EngineConfig::load_from(Some(file.path().to_str().unwrap()));
        assert!(matches!(result, Err(crate::EngineError::InvalidConfig(_))));
    }
}

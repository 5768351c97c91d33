// packages/engine/src/observability.rs
//! Tracing and metrics setup
//!
//! Metric names recorded by the engine:
//!
//! - `replica_engine_pool_instances` (gauge)
//! - `replica_engine_instance_usage{instance}` (gauge)
//! - `replica_engine_sessions_acquired_total` (counter)
//! - `replica_engine_materializations_total` (counter)
//! - `replica_engine_boundary_errors_total` (counter)
//!
//! Without an installed recorder these calls are no-ops.

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level. Calling this twice is not an
/// error; the first subscriber stays installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::InvalidConfig(format!("invalid log level '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        info!("Tracing initialized (level: {}, json: {})", config.level, config.json);
    }
    Ok(())
}

/// Install the Prometheus exporter when a listen address is configured
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let Some(listen) = config.listen.as_deref() else {
        return Ok(());
    };

    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| EngineError::InvalidConfig(format!("invalid metrics address '{listen}': {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::InvalidConfig(format!("failed to install metrics exporter: {e}")))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_listen() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_bad_metrics_address() {
        let config = MetricsConfig {
            listen: Some("not an address".to_string()),
        };
        assert!(matches!(
            init_metrics(&config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_tracing_init_is_repeatable() {
        let config = LoggingConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }
}

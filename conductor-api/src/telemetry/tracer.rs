//! Tracing Subscriber Initialization
//!
//! Plain text output for local development, one JSON object per line for
//! log shippers. `RUST_LOG` overrides the default filter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;
use crate::constants::DEFAULT_LOG_FILTER;
use crate::error::{ApiError, ApiResult};

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (production, staging, development)
    pub environment: String,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_lookup(LogFormat::default(), |key| std::env::var(key).ok())
    }
}

impl TelemetryConfig {
    /// Read `CONDUCTOR_SERVICE_NAME`, `CONDUCTOR_SERVICE_VERSION` and
    /// `CONDUCTOR_ENVIRONMENT`.
    pub fn from_env(log_format: LogFormat) -> Self {
        Self::from_lookup(log_format, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(log_format: LogFormat, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            service_name: lookup("CONDUCTOR_SERVICE_NAME")
                .unwrap_or_else(|| "conductor-api".to_string()),
            service_version: lookup("CONDUCTOR_SERVICE_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            environment: lookup("CONDUCTOR_ENVIRONMENT")
                .unwrap_or_else(|| "development".to_string()),
            log_format,
        }
    }
}

/// Filter from `RUST_LOG`, falling back to the crate defaults.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global tracing subscriber.
///
/// Call once at startup, before any events are emitted. Fails if a global
/// subscriber is already set.
pub fn init_tracer(config: &TelemetryConfig) -> ApiResult<()> {
    let registry = tracing_subscriber::registry().with(env_filter());

    let result = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        service_version = %config.service_version,
        environment = %config.environment,
        log_format = ?config.log_format,
        "Telemetry initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::from_lookup(LogFormat::Text, |_| None);
        assert_eq!(config.service_name, "conductor-api");
        assert_eq!(config.service_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(config.environment, "development");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_telemetry_config_from_lookup() {
        let config = TelemetryConfig::from_lookup(LogFormat::Json, |key| match key {
            "CONDUCTOR_SERVICE_NAME" => Some("conductor-edge".to_string()),
            "CONDUCTOR_ENVIRONMENT" => Some("production".to_string()),
            _ => None,
        });
        assert_eq!(config.service_name, "conductor-edge");
        assert_eq!(config.environment, "production");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig::from_lookup(LogFormat::Text, |_| None);
        let _ = init_tracer(&config);
        assert!(init_tracer(&config).is_err());
    }
}

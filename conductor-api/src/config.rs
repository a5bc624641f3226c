//! API Configuration Module
//!
//! Server binding, request timeout, CORS and log output settings. Values are
//! loaded from environment variables with sensible defaults for development.
//! Core behaviour (timeouts, pricing, backoff) lives in
//! [`conductor_core::ConductorConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BIND_HOST, DEFAULT_CORS_MAX_AGE_SECS, DEFAULT_EVICTION_INTERVAL_SECS, DEFAULT_PORT,
    DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::error::{ApiError, ApiResult};

// ============================================================================
// LOG FORMAT
// ============================================================================

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Parse a `CONDUCTOR_LOG_FORMAT` value. Anything but `json` is text.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ApiConfig {
    // ========================================================================
    // Server
    // ========================================================================
    pub bind_host: String,
    /// Read from `PORT` first, then `CONDUCTOR_API_PORT`. Kept as text so a
    /// bad value surfaces at startup instead of silently falling back.
    pub port: String,
    pub request_timeout: Duration,

    // ========================================================================
    // CORS Configuration
    // ========================================================================
    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,

    /// Whether to allow credentials in CORS requests.
    pub cors_allow_credentials: bool,

    /// Max age for CORS preflight cache in seconds.
    pub cors_max_age_secs: u64,

    // ========================================================================
    // Maintenance
    // ========================================================================
    /// Sweep interval for progress records and closed contexts.
    pub eviction_interval: Duration,

    pub log_format: LogFormat,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_PORT.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            cors_origins: Vec::new(),
            cors_allow_credentials: false,
            cors_max_age_secs: DEFAULT_CORS_MAX_AGE_SECS,
            eviction_interval: Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS),
            log_format: LogFormat::Text,
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CONDUCTOR_API_BIND`: Bind host (default: 0.0.0.0)
    /// - `PORT` or `CONDUCTOR_API_PORT`: Listen port (default: 3000)
    /// - `CONDUCTOR_REQUEST_TIMEOUT_SECS`: Per-request timeout (default: 30)
    /// - `CONDUCTOR_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `CONDUCTOR_CORS_ALLOW_CREDENTIALS`: "true" or "false" (default: false)
    /// - `CONDUCTOR_CORS_MAX_AGE_SECS`: Preflight cache duration (default: 86400)
    /// - `CONDUCTOR_EVICTION_INTERVAL_SECS`: Progress/context sweep interval (default: 30)
    /// - `CONDUCTOR_LOG_FORMAT`: "json" or "text" (default: text)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let bind_host = lookup("CONDUCTOR_API_BIND").unwrap_or(defaults.bind_host);

        let port = lookup("PORT")
            .or_else(|| lookup("CONDUCTOR_API_PORT"))
            .unwrap_or(defaults.port);

        let request_timeout = lookup("CONDUCTOR_REQUEST_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        let cors_origins = lookup("CONDUCTOR_CORS_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let cors_allow_credentials = lookup("CONDUCTOR_CORS_ALLOW_CREDENTIALS")
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        let cors_max_age_secs = lookup("CONDUCTOR_CORS_MAX_AGE_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CORS_MAX_AGE_SECS);

        let eviction_interval = lookup("CONDUCTOR_EVICTION_INTERVAL_SECS")
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.eviction_interval);

        let log_format = lookup("CONDUCTOR_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Self {
            bind_host,
            port,
            request_timeout,
            cors_origins,
            cors_allow_credentials,
            cors_max_age_secs,
            eviction_interval,
            log_format,
        }
    }

    /// Socket address to listen on.
    pub fn bind_addr(&self) -> ApiResult<SocketAddr> {
        let port = self
            .port
            .parse::<u16>()
            .map_err(|_| ApiError::invalid_input(format!("Invalid port value: {}", self.port)))?;

        let addr = format!("{}:{}", self.bind_host, port);
        addr.parse::<SocketAddr>()
            .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
    }

    /// Check if running in production mode (strict CORS).
    pub fn is_production(&self) -> bool {
        !self.cors_origins.is_empty()
    }

    /// Check if a given origin is allowed.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.cors_origins.is_empty() {
            return true;
        }

        self.cors_origins.iter().any(|allowed| {
            if allowed == origin {
                return true;
            }
            // *.example.com
            if let Some(pattern) = allowed.strip_prefix("*.") {
                if let Some(origin_domain) = origin.strip_prefix("https://") {
                    return origin_domain.ends_with(&format!(".{}", pattern))
                        || origin_domain == pattern;
                }
            }
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ApiConfig::default();
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.port, "3000");
        assert!(config.cors_origins.is_empty());
        assert!(!config.cors_allow_credentials);
        assert_eq!(config.cors_max_age_secs, 86400);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_port_prefers_platform_variable() -> ApiResult<()> {
        let config = ApiConfig::from_lookup(lookup_from(&[
            ("PORT", "8080"),
            ("CONDUCTOR_API_PORT", "9090"),
        ]));
        assert_eq!(config.bind_addr()?.port(), 8080);

        let config = ApiConfig::from_lookup(lookup_from(&[("CONDUCTOR_API_PORT", "9090")]));
        assert_eq!(config.bind_addr()?.port(), 9090);
        Ok(())
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let config = ApiConfig::from_lookup(lookup_from(&[("PORT", "not-a-port")]));
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = ApiConfig::from_lookup(lookup_from(&[
            ("CONDUCTOR_REQUEST_TIMEOUT_SECS", "soon"),
            ("CONDUCTOR_EVICTION_INTERVAL_SECS", "0"),
        ]));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.eviction_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Text);

        let config = ApiConfig::from_lookup(lookup_from(&[("CONDUCTOR_LOG_FORMAT", "json")]));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_origin_allowed() {
        let config = ApiConfig::default();
        assert!(config.is_origin_allowed("http://localhost:5173"));
        assert!(!config.is_production());

        let config = ApiConfig::from_lookup(lookup_from(&[(
            "CONDUCTOR_CORS_ORIGINS",
            "https://dash.example.com, *.internal.example.com",
        )]));
        assert!(config.is_production());
        assert!(config.is_origin_allowed("https://dash.example.com"));
        assert!(config.is_origin_allowed("https://ops.internal.example.com"));
        assert!(!config.is_origin_allowed("https://evil.com"));
        assert!(!config.is_origin_allowed("https://notinternal.example.com"));
    }
}

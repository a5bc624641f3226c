//! Constants for the Conductor API
//!
//! Centralizing constants makes them easy to find, modify, and test.

// ============================================================================
// SERVER
// ============================================================================

/// Default bind host.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// CORS
// ============================================================================

/// Default CORS max age in seconds (24 hours)
pub const DEFAULT_CORS_MAX_AGE_SECS: u64 = 86400;

// ============================================================================
// LOGGING
// ============================================================================

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str =
    "conductor_api=debug,conductor_agents=info,tower_http=debug,info";

// ============================================================================
// MAINTENANCE
// ============================================================================

/// How often progress records and closed contexts are swept (seconds).
pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 30;

// ============================================================================
// SCAN
// ============================================================================

/// Largest batch accepted by `POST /scan/start`.
pub const MAX_SCAN_BATCH_SIZE: usize = 100;

// ============================================================================
// SERVER URLs
// ============================================================================

/// Development server URL
pub const DEV_SERVER_URL: &str = "http://localhost:3000";

//! Conductor Telemetry
//!
//! Structured logging for the API layer through `tracing-subscriber`.
//! HTTP request spans come from `tower_http::trace::TraceLayer` in the router.

pub mod tracer;

pub use tracer::{init_tracer, TelemetryConfig};

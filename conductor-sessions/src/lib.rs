//! Session accounting and scan progress.
//!
//! Both stores are plain lock-guarded tables constructed once at startup and
//! handed to the API layer. Every operation that depends on the clock has an
//! `_at(now)` variant so expiry can be tested without waiting.

pub mod progress;
pub mod session_manager;

pub use progress::*;
pub use session_manager::*;

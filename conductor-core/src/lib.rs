//! Conductor Core - Data Model
//!
//! Pure data structures shared by every other crate: identifiers, the
//! message envelope, token usage, session and progress records, the error
//! taxonomy and configuration. No async runtime and no business logic beyond
//! small invariant helpers.

pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod progress;
pub mod session;
pub mod usage;

pub use config::*;
pub use envelope::*;
pub use error::*;
pub use identity::*;
pub use progress::*;
pub use session::*;
pub use usage::*;

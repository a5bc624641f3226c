//! Background Jobs for the Conductor API
//!
//! - `maintenance`: Expires idle sessions and evicts finished progress
//!   records and closed contexts
//!
//! # Usage
//!
//! ```ignore
//! use conductor_api::jobs::{maintenance_task, MaintenanceConfig, MaintenanceTargets};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(maintenance_task(
//!     MaintenanceTargets::from(&state),
//!     MaintenanceConfig::default(),
//!     shutdown_rx,
//! ));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod maintenance;

pub use maintenance::{
    maintenance_task, MaintenanceConfig, MaintenanceMetrics, MaintenanceSnapshot,
    MaintenanceTargets,
};

//! MSM CNI library
//!
//! This crate provides the core functionality for:
//! - Installing the msm-cni plugin on a node and keeping it installed
//! - Watching the CNI configuration directory for changes
//! - Readiness, liveness and metrics endpoints for the installer
//! - The plugin's interception pipeline and rule-programming backends

pub mod cni;
pub mod fs;
pub mod health;
pub mod install;
pub mod observability;
pub mod watch;

pub use health::{create_router, ReadinessFlag, ReadinessResponse};
pub use install::{check_install, InstallError, Installer, InstallerConfig};
pub use observability::{InstallerMetrics, StructuredLogger};

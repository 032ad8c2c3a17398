//! Observability infrastructure for the installer
//!
//! Provides:
//! - Prometheus metrics (install runs, restarts, readiness)
//! - Structured lifecycle logging with tracing

use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<InstallerMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct InstallerMetricsInner {
    installs: IntCounter,
    restarts: IntCounter,
    ready: IntGauge,
}

impl InstallerMetricsInner {
    fn new() -> Self {
        Self {
            installs: register_int_counter!(
                "msm_cni_installs_total",
                "Number of completed install phases"
            )
            .expect("Failed to register installs_total"),

            restarts: register_int_counter!(
                "msm_cni_restarts_total",
                "Number of install restarts caused by configuration drift"
            )
            .expect("Failed to register restarts_total"),

            ready: register_int_gauge!(
                "msm_cni_ready",
                "1 while the installed CNI configuration is verified"
            )
            .expect("Failed to register ready"),
        }
    }
}

/// Installer metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct InstallerMetrics {
    _private: (),
}

impl Default for InstallerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(InstallerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &InstallerMetricsInner {
        GLOBAL_METRICS.get_or_init(InstallerMetricsInner::new)
    }

    pub fn inc_installs(&self) {
        self.inner().installs.inc();
    }

    pub fn inc_restarts(&self) {
        self.inner().restarts.inc();
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner().ready.set(i64::from(ready));
    }

    pub fn installs(&self) -> u64 {
        self.inner().installs.get()
    }

    pub fn restarts(&self) -> u64 {
        self.inner().restarts.get()
    }
}

/// Structured logger for installer lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log installer startup
    pub fn log_startup(&self, version: &str, chained: bool) {
        info!(
            event = "installer_started",
            node = %self.node_name,
            version = %version,
            chained = chained,
            "CNI installer started"
        );
    }

    /// Log a completed install phase
    pub fn log_install_complete(&self, cni_config: &Path, kubeconfig: &Path) {
        info!(
            event = "install_complete",
            node = %self.node_name,
            cni_config = %cni_config.display(),
            kubeconfig = %kubeconfig.display(),
            "CNI configuration installed"
        );
    }

    /// Log a restart triggered by configuration drift
    pub fn log_restart(&self, reason: &str) {
        warn!(
            event = "installer_restarting",
            node = %self.node_name,
            reason = %reason,
            "Restarting install"
        );
    }

    /// Log installer shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "installer_shutdown",
            node = %self.node_name,
            reason = %reason,
            "CNI installer shutting down"
        );
    }

    /// Log cleanup result
    pub fn log_cleanup(&self, success: bool) {
        if success {
            info!(
                event = "cleanup_complete",
                node = %self.node_name,
                "Removed CNI configuration, kubeconfig and binaries"
            );
        } else {
            warn!(
                event = "cleanup_failed",
                node = %self.node_name,
                "Cleanup did not complete"
            );
        }
    }
}

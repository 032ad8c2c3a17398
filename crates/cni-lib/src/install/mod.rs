//! Node installer state machine
//!
//! `Installer::run` alternates between installing the plugin (binaries,
//! kubeconfig, CNI network config) and watching the mounted CNI directory.
//! Drift found while watching restarts the install; cancellation ends the run
//! normally; install I/O and watcher failures end it with an error.
//! `Installer::cleanup` undoes the install and is safe to call repeatedly.

mod binaries;
mod cni_config;
mod config;
mod kubeconfig;

pub use binaries::{copy_binaries, remove_binaries};
pub use cni_config::{
    count_plugin_entries, create_cni_config_file, get_default_cni_network, insert_cni_config,
    marshal_cni_config, read_cni_config_map, remove_cni_config, render_network_config,
    CniConfigMap,
};
pub use config::*;
pub use kubeconfig::create_kubeconfig_file;

use crate::fs::{atomic_write, exists, remove_if_exists, FsError};
use crate::health::ReadinessFlag;
use crate::observability::{InstallerMetrics, StructuredLogger};
use crate::watch::{wait_for_change_or_cancel, watch, WatchError, WatchEvents};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from the install phase, the validity check and cleanup
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid CNI config {path}: {reason}")]
    InvalidCniConfig { path: PathBuf, reason: String },

    #[error("{0}")]
    MissingEnvironment(String),

    #[error("service account token not found at {0}")]
    TokenMissing(PathBuf),

    #[error("CA file {0} does not exist")]
    CaFileMissing(PathBuf),

    #[error("invalid CNI network config template: {0}")]
    Template(String),

    #[error("no networks found in {0}")]
    NoNetworks(PathBuf),

    #[error("CNI config file {written} preempted by {default}")]
    Preempted { written: PathBuf, default: PathBuf },

    #[error("CNI config file {0} removed")]
    ConfigRemoved(PathBuf),

    #[error("expected exactly one msm-cni entry in {path}, found {found}")]
    PluginEntries { path: PathBuf, found: usize },

    #[error("CNI config file {path} modified, type is {found:?}")]
    ConfigModified { path: PathBuf, found: Option<String> },

    #[error("no CNI config has been written yet")]
    NotInstalled,
}

impl InstallError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        InstallError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the error only reports that the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InstallError::Watch(WatchError::Cancelled))
    }
}

/// Mutable state of a run, rewritten by every install phase
#[derive(Debug, Default)]
pub struct InstallerState {
    pub sa_token: String,
    pub kubeconfig_filepath: Option<PathBuf>,
    pub cni_config_filepath: Option<PathBuf>,
}

/// How a watch phase ended without an error
#[derive(Debug, PartialEq, Eq)]
enum WatchOutcome {
    Restart(String),
    Cancelled,
}

/// Verify the written CNI config is still the one the runtime will use
///
/// An explicit `cni_conf_name` downgrades preemption by another file to a
/// warning.
pub fn check_install(cfg: &InstallerConfig, cni_config_filepath: &Path) -> Result<(), InstallError> {
    let default_name = get_default_cni_network(&cfg.mounted_cni_net_dir)?;
    let default_path = cfg.mounted_cni_net_dir.join(default_name);

    if default_path != cni_config_filepath {
        if cfg.cni_conf_name.is_some() {
            warn!(
                written = %cni_config_filepath.display(),
                default = %default_path.display(),
                "CNI config file preempted by default network, keeping configured file name"
            );
        } else {
            return Err(InstallError::Preempted {
                written: cni_config_filepath.to_path_buf(),
                default: default_path,
            });
        }
    }

    if !exists(cni_config_filepath) {
        return Err(InstallError::ConfigRemoved(cni_config_filepath.to_path_buf()));
    }

    let map = read_cni_config_map(cni_config_filepath)?;
    if cfg.chained_cni_plugin {
        let found = count_plugin_entries(&map, cni_config_filepath)?;
        if found != 1 {
            return Err(InstallError::PluginEntries {
                path: cni_config_filepath.to_path_buf(),
                found,
            });
        }
    } else {
        let found = map.get("type").and_then(Value::as_str);
        if found != Some(PLUGIN_TYPE) {
            return Err(InstallError::ConfigModified {
                path: cni_config_filepath.to_path_buf(),
                found: found.map(str::to_string),
            });
        }
    }

    Ok(())
}

fn read_service_account_token(cfg: &InstallerConfig) -> Result<String, InstallError> {
    let path = cfg.service_account_token_path();
    match fs::read_to_string(&path) {
        Ok(token) => Ok(token.trim_end().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(InstallError::TokenMissing(path)),
        Err(e) => Err(InstallError::io(path, e)),
    }
}

/// Installs the plugin on this node and keeps it installed
pub struct Installer {
    cfg: InstallerConfig,
    ready: ReadinessFlag,
    state: InstallerState,
    metrics: InstallerMetrics,
    logger: StructuredLogger,
}

impl Installer {
    pub fn new(cfg: InstallerConfig, ready: ReadinessFlag) -> Self {
        let logger = StructuredLogger::new(cfg.k8s_node_name.clone());
        Self {
            cfg,
            ready,
            state: InstallerState::default(),
            metrics: InstallerMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.cfg
    }

    pub fn state(&self) -> &InstallerState {
        &self.state
    }

    /// Install, then watch, until cancelled or a fatal error occurs
    ///
    /// Cancellation is a normal shutdown and returns `Ok(())`. The readiness
    /// flag is false whenever this returns.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), InstallError> {
        loop {
            match self.install(cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    self.logger.log_shutdown("cancelled during install");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            match self.sleep_check_install(cancel).await? {
                WatchOutcome::Restart(reason) => {
                    self.metrics.inc_restarts();
                    self.logger.log_restart(&reason);
                }
                WatchOutcome::Cancelled => {
                    self.logger.log_shutdown("cancelled");
                    return Ok(());
                }
            }
        }
    }

    /// One install phase
    pub async fn install(&mut self, cancel: &CancellationToken) -> Result<(), InstallError> {
        let copied = copy_binaries(
            &self.cfg.cni_bin_source_dir,
            &self.cfg.cni_bin_target_dirs,
            self.cfg.update_cni_binaries,
            &self.cfg.skip_cni_binaries,
        )?;
        debug!(copied, "Binary install finished");

        self.state.sa_token = read_service_account_token(&self.cfg)?;

        let kubeconfig = create_kubeconfig_file(&self.cfg, &self.state.sa_token)?;
        self.state.kubeconfig_filepath = Some(kubeconfig.clone());

        let cni_config = create_cni_config_file(&self.cfg, cancel).await?;
        self.state.cni_config_filepath = Some(cni_config.clone());

        self.metrics.inc_installs();
        self.logger.log_install_complete(&cni_config, &kubeconfig);
        Ok(())
    }

    async fn sleep_check_install(
        &self,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, InstallError> {
        // Watch before the first check so no change slips in between
        let (watcher, mut events) = watch(&self.cfg.mounted_cni_net_dir)?;

        let outcome = self.watch_phase(&mut events, cancel).await;

        debug!(dir = %watcher.dir().display(), "Stopped watching CNI config directory");
        drop(watcher);
        outcome
    }

    /// Check and wait on `events`; readiness is cleared however this ends
    async fn watch_phase(
        &self,
        events: &mut WatchEvents,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, InstallError> {
        let outcome = self.check_loop(events, cancel).await;
        self.ready.set_not_ready();
        outcome
    }

    async fn check_loop(
        &self,
        events: &mut WatchEvents,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, InstallError> {
        let path = self
            .state
            .cni_config_filepath
            .as_deref()
            .ok_or(InstallError::NotInstalled)?;

        if let Err(e) = check_install(&self.cfg, path) {
            info!(reason = %e, "Invalid configuration");
            return Ok(WatchOutcome::Restart(e.to_string()));
        }

        if cancel.is_cancelled() {
            return Ok(WatchOutcome::Cancelled);
        }

        match events.has_pending() {
            Some(Ok(())) => {
                return Ok(WatchOutcome::Restart(
                    "CNI config directory changed".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e.into()),
            None => {}
        }

        self.ready.set_ready();
        info!(path = %path.display(), "CNI configuration verified, watching for changes");

        match wait_for_change_or_cancel(events, cancel).await {
            Ok(()) => Ok(WatchOutcome::Restart(
                "CNI config directory changed".to_string(),
            )),
            Err(WatchError::Cancelled) => Ok(WatchOutcome::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the plugin's CNI config entry, kubeconfig and binaries
    ///
    /// Stops at the first failing step.
    pub fn cleanup(&self) -> Result<(), InstallError> {
        let res = self.cleanup_steps();
        self.logger.log_cleanup(res.is_ok());
        res
    }

    fn cleanup_steps(&self) -> Result<(), InstallError> {
        info!("Cleaning up");

        if let Some(path) = &self.state.cni_config_filepath {
            if exists(path) {
                if self.cfg.chained_cni_plugin {
                    info!(path = %path.display(), "Removing msm-cni from CNI config plugin list");
                    let map = read_cni_config_map(path)?;
                    let list = remove_cni_config(map, path)?;
                    atomic_write(path, &marshal_cni_config(&list)?, CNI_CONFIG_MODE)?;
                } else {
                    info!(path = %path.display(), "Removing CNI config file");
                    remove_if_exists(path)?;
                }
            }
        }

        if let Some(path) = &self.state.kubeconfig_filepath {
            if remove_if_exists(path)? {
                info!(path = %path.display(), "Removed kubeconfig file");
            }
        }

        remove_binaries(&self.cfg.cni_bin_target_dirs, PLUGIN_BINARIES)
    }
}

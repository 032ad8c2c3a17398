//! msm-cni installer
//!
//! Runs as a DaemonSet on every node: installs the msm-cni plugin binaries,
//! kubeconfig and CNI network configuration, keeps them installed while the
//! pod lives and removes them on shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use cni_lib::{InstallError, Installer, ReadinessFlag, StructuredLogger};
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const INSTALLER_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_TYPE").map(|t| t == "json").unwrap_or(false) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Cancel `token` on SIGINT or SIGTERM
async fn shutdown_on_signal(token: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    token.cancel();
}

async fn run(args: config::InstallerArgs) -> Result<()> {
    let k8s = config::KubernetesEnv::load().context("failed to read KUBERNETES_* environment")?;
    let health_port = args.health_port;
    let cfg = args.into_config(k8s);

    let logger = StructuredLogger::new(cfg.k8s_node_name.clone());
    logger.log_startup(INSTALLER_VERSION, cfg.chained_cni_plugin);

    let ready = ReadinessFlag::new();
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn(api::serve(
        health_port,
        ready.clone(),
        server_shutdown.clone(),
    ));

    let mut installer = Installer::new(cfg, ready);
    let run_result = installer.run(&cancel).await;
    if let Err(e) = &run_result {
        error!(error = %e, "Installer run failed");
    }

    let cleanup_result = installer.cleanup();
    if let Err(e) = &cleanup_result {
        error!(error = %e, "Cleanup failed");
    }

    server_shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Health server failed"),
        Err(e) => warn!(error = %e, "Health server task failed"),
    }

    logger.log_shutdown("installer exiting");
    exit_result(run_result, cleanup_result)
}

/// Fold the run and cleanup outcomes into one error, keeping both causes
fn exit_result(
    run_result: Result<(), InstallError>,
    cleanup_result: Result<(), InstallError>,
) -> Result<()> {
    match (run_result, cleanup_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(run), Ok(())) => Err(anyhow::Error::new(run).context("installer run failed")),
        (Ok(()), Err(cleanup)) => Err(anyhow::Error::new(cleanup).context("cleanup failed")),
        (Err(run), Err(cleanup)) => Err(anyhow::Error::new(run).context(format!(
            "installer run failed, and cleanup failed: {}",
            cleanup
        ))),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = config::InstallerArgs::parse();
    init_tracing(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "msm-cni installer exiting with error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_exit_result_keeps_both_errors() {
        let err = exit_result(
            Err(InstallError::TokenMissing(PathBuf::from("/sa/token"))),
            Err(InstallError::CaFileMissing(PathBuf::from("/sa/ca.crt"))),
        )
        .unwrap_err();

        let text = format!("{:#}", err);
        assert!(text.contains("/sa/token"));
        assert!(text.contains("/sa/ca.crt"));
    }

    #[test]
    fn test_exit_result_single_failure() {
        assert!(exit_result(Ok(()), Ok(())).is_ok());

        let err = exit_result(
            Ok(()),
            Err(InstallError::ConfigRemoved(PathBuf::from("/etc/cni/net.d/x"))),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).starts_with("cleanup failed"));
    }
}

//! msm-cni plugin
//!
//! Invoked by the container runtime once per container: ADD redirects the
//! pod's traffic into the MSM sidecar proxy when the pod asks for it, every
//! other command is answered without touching the pod.

mod env;

use anyhow::{Context, Result};
use clap::{error::ErrorKind, Parser};
use cni_lib::cni::{
    version_info, CmdArgs, CniError, InterceptionPipeline, CURRENT_VERSION,
};
use env::{CniEnv, Command};
use serde::Deserialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fields read from stdin before the full configuration is parsed
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfHeader {
    #[serde(default)]
    cni_version: String,
    #[serde(default)]
    log_level: String,
}

/// Logs go to stderr; stdout carries the result
fn init_tracing(level: &str) {
    let level = if level.is_empty() { "info" } else { level };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .context("failed to read network configuration from stdin")?;
    Ok(buf)
}

fn print_json(doc: &impl serde::Serialize) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, doc).context("failed to write result")?;
    writeln!(out).context("failed to write result")?;
    Ok(())
}

/// Bind the `CNI_*` environment; unusable values are a CNI argument error
fn parse_env() -> Result<CniEnv, CniError> {
    CniEnv::try_parse().map_err(|e| match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
        _ => CniError::InvalidArgs(e.kind().to_string()),
    })
}

/// Run ADD on its own task so a panic becomes an error result
async fn add(args: CmdArgs) -> Result<Value, CniError> {
    let task = tokio::spawn(async move { InterceptionPipeline::new().cmd_add(&args).await });
    match task.await {
        Ok(res) => res,
        Err(e) if e.is_panic() => {
            error!(error = %e, "msm-cni cmdAdd panicked");
            Err(CniError::Internal(format!("cmdAdd panicked: {}", e)))
        }
        Err(e) => Err(CniError::Internal(e.to_string())),
    }
}

async fn dispatch(env: &CniEnv, stdin: Vec<u8>, version: &str) -> Result<Option<Value>, CniError> {
    let command = env.command()?;
    debug!(?command, "CNI command");

    match command {
        Command::Version => Ok(Some(version_info(version))),
        Command::Add => add(env.cmd_args(command, stdin)?).await.map(Some),
        Command::Del => {
            let args = env.cmd_args(command, stdin)?;
            InterceptionPipeline::new().cmd_del(&args).await.map(|()| None)
        }
        Command::Check | Command::Get => {
            let args = env.cmd_args(command, stdin)?;
            InterceptionPipeline::new().cmd_get(&args).await.map(Some)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let stdin = match read_stdin() {
        Ok(buf) => buf,
        Err(e) => {
            init_tracing("info");
            let err = CniError::Internal(format!("{:#}", e));
            let _ = print_json(&err.to_document(CURRENT_VERSION));
            return ExitCode::FAILURE;
        }
    };

    let header: ConfHeader = serde_json::from_slice(&stdin).unwrap_or_default();
    init_tracing(&header.log_level);

    let version = if header.cni_version.is_empty() {
        CURRENT_VERSION
    } else {
        header.cni_version.as_str()
    };

    let env = match parse_env() {
        Ok(env) => env,
        Err(e) => {
            error!(code = e.code(), error = %e, "msm-cni failed");
            let _ = print_json(&e.to_document(version));
            return ExitCode::FAILURE;
        }
    };

    match dispatch(&env, stdin, version).await {
        Ok(Some(result)) => match print_json(&result) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to print result");
                ExitCode::FAILURE
            }
        },
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.code(), error = %e, "msm-cni failed");
            let _ = print_json(&e.to_document(version));
            ExitCode::FAILURE
        }
    }
}

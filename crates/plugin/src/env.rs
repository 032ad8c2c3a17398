//! CNI runtime environment

use clap::Parser;
use cni_lib::cni::{CmdArgs, CniError};
use std::str::FromStr;

/// Operations of the CNI protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Get,
    Version,
}

impl FromStr for Command {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "GET" => Ok(Command::Get),
            "VERSION" => Ok(Command::Version),
            other => Err(CniError::UnknownCommand(other.to_string())),
        }
    }
}

/// CNI plugin redirecting pod traffic into the MSM sidecar proxy
///
/// Invoked by the container runtime; every input also binds to its `CNI_*`
/// environment variable.
#[derive(Debug, Parser)]
#[command(name = "msm-cni", version, about, long_about = None)]
pub struct CniEnv {
    #[arg(long, env = "CNI_COMMAND")]
    pub command: Option<String>,

    #[arg(long, env = "CNI_CONTAINERID")]
    pub container_id: Option<String>,

    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<String>,

    #[arg(long, env = "CNI_IFNAME")]
    pub ifname: Option<String>,

    #[arg(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    #[arg(long, env = "CNI_PATH")]
    pub path: Option<String>,
}

fn required(value: &Option<String>, var: &str) -> Result<String, CniError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(CniError::MissingEnvironment(var.to_string())),
    }
}

impl CniEnv {
    pub fn command(&self) -> Result<Command, CniError> {
        required(&self.command, "CNI_COMMAND")?.parse()
    }

    /// Collect the inputs of `command`, failing on a missing required variable
    ///
    /// DEL does not require a network namespace.
    pub fn cmd_args(&self, command: Command, stdin: Vec<u8>) -> Result<CmdArgs, CniError> {
        let container_id = required(&self.container_id, "CNI_CONTAINERID")?;
        let netns = match command {
            Command::Del => self.netns.clone().unwrap_or_default(),
            _ => required(&self.netns, "CNI_NETNS")?,
        };
        let ifname = required(&self.ifname, "CNI_IFNAME")?;
        let path = required(&self.path, "CNI_PATH")?;

        Ok(CmdArgs {
            container_id,
            netns,
            ifname,
            args: self.args.clone(),
            path,
            stdin,
        })
    }
}

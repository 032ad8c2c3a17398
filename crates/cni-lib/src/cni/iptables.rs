//! iptables backend: runs the helper inside the pod's network namespace
//!
//! The helper installs, in order, a RETURN for the excluded destination, a
//! RETURN for the excluded UID and the catch-all redirect to the proxy port.

use super::config::PluginSettings;
use super::error::CniError;
use super::intercept::{InterceptRuleMgr, InterceptRuleMgrCtor};
use super::redirect::Redirect;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info};

/// Helper executable, looked up in the configured bin dir
pub const IPTABLES_HELPER: &str = "msm-iptables";

const NSENTER: &str = "nsenter";

pub struct IptablesInterceptMgr {
    bin_dir: PathBuf,
}

impl IptablesInterceptMgr {
    pub fn new(settings: &PluginSettings) -> Self {
        Self {
            bin_dir: settings.bin_dir.clone(),
        }
    }

    pub fn ctor() -> InterceptRuleMgrCtor {
        Arc::new(|settings: &PluginSettings| {
            Box::new(IptablesInterceptMgr::new(settings)) as Box<dyn InterceptRuleMgr>
        })
    }

    /// Arguments passed to nsenter
    fn nsenter_args(&self, netns: &str, redirect: &Redirect) -> Vec<String> {
        vec![
            format!("--net={}", netns),
            // BusyBox nsenter needs the separator
            "--".to_string(),
            self.bin_dir.join(IPTABLES_HELPER).to_string_lossy().into_owned(),
            "-p".to_string(),
            redirect.target_port().to_string(),
            "-u".to_string(),
            redirect.no_redirect_uid().to_string(),
            "-m".to_string(),
            redirect.mode().to_string(),
            "-d".to_string(),
            redirect.no_redirect_dest().to_string(),
        ]
    }
}

#[async_trait]
impl InterceptRuleMgr for IptablesInterceptMgr {
    async fn program(&self, netns: &str, redirect: &Redirect) -> Result<(), CniError> {
        let args = self.nsenter_args(netns, redirect);
        info!(args = %args.join(" "), "Running nsenter");

        let output = Command::new(NSENTER)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| CniError::Program {
                netns: netns.to_string(),
                reason: format!("failed to run {}: {}", NSENTER, e),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            info!(out = %combined, "nsenter done");
            Ok(())
        } else {
            error!(status = %output.status, out = %combined, "nsenter failed");
            Err(CniError::Program {
                netns: netns.to_string(),
                reason: format!("{}: {}", output.status, combined.trim_end()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::kubernetes::PodInfo;

    #[test]
    fn test_nsenter_args() {
        let settings = PluginSettings {
            bin_dir: PathBuf::from("/host/opt/cni/bin"),
            ..Default::default()
        };
        let mgr = IptablesInterceptMgr::new(&settings);
        let redirect = Redirect::for_pod(&PodInfo::default());

        let args = mgr.nsenter_args("/var/run/netns/cni-42", &redirect);

        assert_eq!(
            args,
            vec![
                "--net=/var/run/netns/cni-42",
                "--",
                "/host/opt/cni/bin/msm-iptables",
                "-p",
                "8554",
                "-u",
                "1337",
                "-m",
                "REDIRECT",
                "-d",
                "127.0.0.0/8",
            ]
        );
    }
}

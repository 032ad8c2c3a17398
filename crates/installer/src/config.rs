//! Installer configuration

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use cni_lib::health::DEFAULT_HEALTH_PORT;
use cni_lib::install::{
    InstallerConfig, DEFAULT_CNI_NET_DIR, DEFAULT_KUBECONFIG_FILENAME, DEFAULT_LOG_LEVEL,
    DEFAULT_MOUNTED_CNI_NET_DIR,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Installs the msm-cni plugin on this node and keeps it installed
#[derive(Debug, Parser)]
#[command(name = "msm-cni-installer", version, about, long_about = None)]
pub struct InstallerArgs {
    /// Directory on the host where CNI network plugins are configured
    #[arg(long, env = "CNI_NET_DIR", default_value = DEFAULT_CNI_NET_DIR)]
    pub cni_net_dir: PathBuf,

    /// Directory in the container where CNI network plugins are configured
    #[arg(long, env = "MOUNTED_CNI_NET_DIR", default_value = DEFAULT_MOUNTED_CNI_NET_DIR)]
    pub mounted_cni_net_dir: PathBuf,

    /// Name of the CNI configuration file
    #[arg(long, env = "CNI_CONF_NAME")]
    pub cni_conf_name: Option<String>,

    /// Whether to install CNI plugin as a chained or standalone
    #[arg(long, env = "CHAINED_CNI_PLUGIN", default_value_t = true, action = ArgAction::Set)]
    pub chained_cni_plugin: bool,

    /// CNI configuration template as a string
    #[arg(long, env = "CNI_NETWORK_CONFIG", default_value = "")]
    pub cni_network_config: String,

    /// CNI configuration template as a file
    #[arg(long, env = "CNI_NETWORK_CONFIG_FILE")]
    pub cni_network_config_file: Option<PathBuf>,

    /// Log level for the installer and the generated plugin configuration
    #[arg(long, env = "LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Name of the kubeconfig file the plugin uses
    #[arg(long = "kubecfg-file-name", env = "KUBECFG_FILE_NAME", default_value = DEFAULT_KUBECONFIG_FILENAME)]
    pub kubeconfig_filename: String,

    /// File mode of the kubeconfig file, in octal
    #[arg(long, env = "KUBECONFIG_MODE", default_value = "600", value_parser = parse_octal_mode)]
    pub kubeconfig_mode: u32,

    /// CA file for the kubeconfig, defaults to the service account CA
    #[arg(long, env = "KUBE_CA_FILE")]
    pub kube_ca_file: Option<PathBuf>,

    /// Skip TLS verification in the generated kubeconfig
    #[arg(long, env = "SKIP_TLS_VERIFY", default_value_t = false, action = ArgAction::Set)]
    pub skip_tls_verify: bool,

    /// Binaries that should not be installed
    #[arg(long, env = "SKIP_CNI_BINARIES", value_delimiter = ',')]
    pub skip_cni_binaries: Vec<String>,

    /// Overwrite binaries already present in the target directories
    #[arg(long, env = "UPDATE_CNI_BINARIES", default_value_t = true, action = ArgAction::Set)]
    pub update_cni_binaries: bool,

    /// Port of the health and metrics server
    #[arg(long, env = "HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    pub health_port: u16,
}

fn parse_octal_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        Ok(_) => Err(format!("file mode {} out of range", s)),
        Err(e) => Err(format!("invalid octal file mode {:?}: {}", s, e)),
    }
}

/// Cluster endpoint from the pod environment (`KUBERNETES_*`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KubernetesEnv {
    #[serde(default)]
    pub service_host: String,
    #[serde(default)]
    pub service_port: String,
    #[serde(default)]
    pub service_protocol: String,
    #[serde(default)]
    pub node_name: String,
}

impl KubernetesEnv {
    /// Load from the process environment
    pub fn load() -> Result<Self> {
        Self::from_source(None)
    }

    /// Load from `source` instead of the process environment when given
    pub fn from_source(source: Option<HashMap<String, String>>) -> Result<Self> {
        Self::resolve(source, node_hostname)
    }

    fn resolve(
        source: Option<HashMap<String, String>>,
        hostname: impl FnOnce() -> Result<String>,
    ) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("KUBERNETES").source(source))
            .build()?;

        let mut env: KubernetesEnv = settings.try_deserialize()?;
        if env.node_name.is_empty() {
            env.node_name = hostname().context("KUBERNETES_NODE_NAME not set")?;
        }
        Ok(env)
    }
}

fn node_hostname() -> Result<String> {
    let name = hostname::get().context("failed to get hostname")?;
    name.into_string()
        .map_err(|h| anyhow!("hostname {:?} is not valid UTF-8", h))
}

impl InstallerArgs {
    pub fn into_config(self, k8s: KubernetesEnv) -> InstallerConfig {
        InstallerConfig {
            cni_net_dir: self.cni_net_dir,
            mounted_cni_net_dir: self.mounted_cni_net_dir,
            cni_conf_name: self.cni_conf_name.filter(|n| !n.is_empty()),
            chained_cni_plugin: self.chained_cni_plugin,
            cni_network_config: self.cni_network_config,
            cni_network_config_file: self.cni_network_config_file,
            log_level: self.log_level,
            kubeconfig_filename: self.kubeconfig_filename,
            kubeconfig_mode: self.kubeconfig_mode,
            kube_ca_file: self.kube_ca_file,
            skip_tls_verify: self.skip_tls_verify,
            k8s_service_protocol: k8s.service_protocol,
            k8s_service_host: k8s.service_host,
            k8s_service_port: k8s.service_port,
            k8s_node_name: k8s.node_name,
            update_cni_binaries: self.update_cni_binaries,
            skip_cni_binaries: self.skip_cni_binaries,
            ..InstallerConfig::default()
        }
    }
}

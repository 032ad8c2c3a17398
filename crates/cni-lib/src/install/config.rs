//! Installer run parameters

use std::path::PathBuf;

/// Plugin type written into (and looked for in) CNI network configuration
pub const PLUGIN_TYPE: &str = "msm-cni";

/// Binaries installed into, and removed from, every target directory
pub const PLUGIN_BINARIES: &[&str] = &["msm-cni", "msm-iptables"];

/// File name used for a standalone CNI config when none is configured
pub const STANDALONE_CONF_NAME: &str = "00-msm-cni.conf";

/// Mode of the generated CNI network configuration file
pub const CNI_CONFIG_MODE: u32 = 0o644;

pub const DEFAULT_CNI_NET_DIR: &str = "/etc/cni/net.d";
pub const DEFAULT_MOUNTED_CNI_NET_DIR: &str = "/host/etc/cni/net.d";
pub const DEFAULT_KUBECONFIG_FILENAME: &str = "ZZZ-msm-cni-kubeconfig";
pub const DEFAULT_KUBECONFIG_MODE: u32 = 0o600;
pub const DEFAULT_LOG_LEVEL: &str = "warn";
pub const CNI_BIN_DIR: &str = "/opt/cni/bin";
pub const HOST_CNI_BIN_DIR: &str = "/host/opt/cni/bin";
pub const SECONDARY_BIN_DIR: &str = "/host/secondary-bin-dir";
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Immutable installer configuration, built once at start-up
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// CNI config directory as seen by the host (referenced from generated config)
    pub cni_net_dir: PathBuf,
    /// The same directory as mounted into this container
    pub mounted_cni_net_dir: PathBuf,
    /// Explicit CNI config file name; disables the preemption check
    pub cni_conf_name: Option<String>,
    /// Insert into an existing plugin list instead of writing a standalone file
    pub chained_cni_plugin: bool,
    /// Inline CNI network config template
    pub cni_network_config: String,
    /// CNI network config template file, takes precedence over the inline one
    pub cni_network_config_file: Option<PathBuf>,
    /// Log level substituted into the template
    pub log_level: String,

    pub kubeconfig_filename: String,
    pub kubeconfig_mode: u32,
    /// CA bundle for the kubeconfig, defaults to the service-account one
    pub kube_ca_file: Option<PathBuf>,
    pub skip_tls_verify: bool,

    pub k8s_service_protocol: String,
    pub k8s_service_host: String,
    pub k8s_service_port: String,
    pub k8s_node_name: String,

    pub cni_bin_source_dir: PathBuf,
    pub cni_bin_target_dirs: Vec<PathBuf>,
    pub update_cni_binaries: bool,
    pub skip_cni_binaries: Vec<String>,

    /// Mounted service-account directory holding `token` and `ca.crt`
    pub service_account_dir: PathBuf,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            cni_net_dir: PathBuf::from(DEFAULT_CNI_NET_DIR),
            mounted_cni_net_dir: PathBuf::from(DEFAULT_MOUNTED_CNI_NET_DIR),
            cni_conf_name: None,
            chained_cni_plugin: true,
            cni_network_config: String::new(),
            cni_network_config_file: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            kubeconfig_filename: DEFAULT_KUBECONFIG_FILENAME.to_string(),
            kubeconfig_mode: DEFAULT_KUBECONFIG_MODE,
            kube_ca_file: None,
            skip_tls_verify: false,
            k8s_service_protocol: String::new(),
            k8s_service_host: String::new(),
            k8s_service_port: String::new(),
            k8s_node_name: String::new(),
            cni_bin_source_dir: PathBuf::from(CNI_BIN_DIR),
            cni_bin_target_dirs: vec![
                PathBuf::from(HOST_CNI_BIN_DIR),
                PathBuf::from(SECONDARY_BIN_DIR),
            ],
            update_cni_binaries: true,
            skip_cni_binaries: Vec::new(),
            service_account_dir: PathBuf::from(SERVICE_ACCOUNT_DIR),
        }
    }
}

impl InstallerConfig {
    /// Path of the generated kubeconfig inside this container
    pub fn mounted_kubeconfig_path(&self) -> PathBuf {
        self.mounted_cni_net_dir.join(&self.kubeconfig_filename)
    }

    /// Path of the generated kubeconfig as the plugin sees it on the host
    pub fn host_kubeconfig_path(&self) -> PathBuf {
        self.cni_net_dir.join(&self.kubeconfig_filename)
    }

    pub fn service_account_token_path(&self) -> PathBuf {
        self.service_account_dir.join("token")
    }

    pub fn ca_file(&self) -> PathBuf {
        self.kube_ca_file
            .clone()
            .unwrap_or_else(|| self.service_account_dir.join("ca.crt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installer_config_default() {
        let cfg = InstallerConfig::default();
        assert!(cfg.chained_cni_plugin);
        assert!(cfg.update_cni_binaries);
        assert_eq!(cfg.kubeconfig_mode, 0o600);
        assert_eq!(cfg.cni_bin_target_dirs.len(), 2);
        assert_eq!(
            cfg.mounted_kubeconfig_path(),
            PathBuf::from("/host/etc/cni/net.d/ZZZ-msm-cni-kubeconfig")
        );
        assert_eq!(
            cfg.host_kubeconfig_path(),
            PathBuf::from("/etc/cni/net.d/ZZZ-msm-cni-kubeconfig")
        );
    }

    #[test]
    fn test_ca_file_defaults_to_service_account() {
        let mut cfg = InstallerConfig::default();
        assert_eq!(
            cfg.ca_file(),
            PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt")
        );

        cfg.kube_ca_file = Some(PathBuf::from("/etc/ca.pem"));
        assert_eq!(cfg.ca_file(), PathBuf::from("/etc/ca.pem"));
    }
}

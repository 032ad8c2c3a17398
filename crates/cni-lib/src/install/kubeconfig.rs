//! Kubeconfig generation for the plugin

use super::{InstallError, InstallerConfig};
use crate::fs::{atomic_write, exists};
use base64::Engine;
use std::fs;
use std::path::PathBuf;
use tracing::info;

struct KubeconfigFields<'a> {
    protocol: &'a str,
    host: &'a str,
    port: &'a str,
    token: &'a str,
    tls_config: &'a str,
}

fn render(fields: &KubeconfigFields<'_>) -> String {
    format!(
        r#"# Kubeconfig file for MSM CNI plugin.
apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: {protocol}://[{host}]:{port}
    {tls_config}
users:
- name: msm-cni
  user:
    token: "{token}"
contexts:
- name: msm-cni-context
  context:
    cluster: local
    user: msm-cni
current-context: msm-cni-context
"#,
        protocol = fields.protocol,
        host = fields.host,
        port = fields.port,
        tls_config = fields.tls_config,
        token = fields.token,
    )
}

/// Render the kubeconfig and atomically write it into the mounted CNI dir
pub fn create_kubeconfig_file(
    cfg: &InstallerConfig,
    sa_token: &str,
) -> Result<PathBuf, InstallError> {
    if cfg.k8s_service_host.is_empty() {
        return Err(InstallError::MissingEnvironment(
            "KUBERNETES_SERVICE_HOST not set. Is this not running within a pod?".to_string(),
        ));
    }
    if cfg.k8s_service_port.is_empty() {
        return Err(InstallError::MissingEnvironment(
            "KUBERNETES_SERVICE_PORT not set. Is this not running within a pod?".to_string(),
        ));
    }

    let protocol = if cfg.k8s_service_protocol.is_empty() {
        "https"
    } else {
        cfg.k8s_service_protocol.as_str()
    };

    let ca_file = cfg.ca_file();
    let (tls_config, redacted_tls_config) = if cfg.skip_tls_verify {
        let tls = "insecure-skip-tls-verify: true".to_string();
        (tls.clone(), tls)
    } else {
        if !exists(&ca_file) {
            return Err(InstallError::CaFileMissing(ca_file));
        }
        let ca = fs::read(&ca_file).map_err(|e| InstallError::io(&ca_file, e))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(ca);
        (
            format!("certificate-authority-data: {}", encoded),
            format!(
                "certificate-authority-data: <CA cert from {}>",
                ca_file.display()
            ),
        )
    };

    let kubeconfig = render(&KubeconfigFields {
        protocol,
        host: &cfg.k8s_service_host,
        port: &cfg.k8s_service_port,
        token: sa_token,
        tls_config: &tls_config,
    });
    let printable = render(&KubeconfigFields {
        protocol,
        host: &cfg.k8s_service_host,
        port: &cfg.k8s_service_port,
        token: "<redacted>",
        tls_config: &redacted_tls_config,
    });

    let path = cfg.mounted_kubeconfig_path();
    info!(path = %path.display(), kubeconfig = %printable, "Writing kubeconfig file");
    atomic_write(&path, kubeconfig.as_bytes(), cfg.kubeconfig_mode)?;

    Ok(path)
}

//! Plugin network configuration and per-invocation arguments

use super::error::CniError;
use super::result::CniResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// Default directory holding the rule-programming helper
pub const DEFAULT_BIN_DIR: &str = "/opt/cni/bin";

/// Backend used when the configuration does not name one
pub const DEFAULT_INTERCEPT_TYPE: &str = "iptables";

/// Kubernetes section of the plugin configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConf {
    /// Overrides the API server URL from the kubeconfig
    #[serde(rename = "kubernetesAPIRoot", default)]
    pub api_root: String,
    #[serde(default, alias = "kubeconfig")]
    pub kube_config: String,
    /// Rule-programming backend name
    #[serde(default)]
    pub intercept_name: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub exclude_namespaces: Vec<String>,
    #[serde(default)]
    pub cni_bin_dir: String,
}

/// Network configuration passed on stdin
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default)]
    pub runtime_config: Option<Value>,
    #[serde(default)]
    pub prev_result: Option<Value>,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub log_type: String,
    #[serde(default)]
    pub kubernetes: KubernetesConf,
}

/// Parsed configuration with the chained result converted to the internal form
#[derive(Debug, Clone)]
pub struct ParsedConf {
    pub conf: PluginConf,
    pub prev_result: Option<CniResult>,
}

/// Parse the stdin configuration, converting any `prevResult`
pub fn parse_config(stdin: &[u8]) -> Result<ParsedConf, CniError> {
    let mut conf: PluginConf = serde_json::from_slice(stdin).map_err(CniError::Decode)?;

    let prev_result = match conf.prev_result.take() {
        Some(Value::Null) | None => None,
        Some(raw) => Some(CniResult::from_value(&conf.cni_version, raw)?),
    };

    Ok(ParsedConf { conf, prev_result })
}

/// Settings a single invocation runs with
///
/// Built from process defaults and then overridden by the network
/// configuration of that invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSettings {
    pub bin_dir: PathBuf,
    pub intercept_type: String,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from(DEFAULT_BIN_DIR),
            intercept_type: DEFAULT_INTERCEPT_TYPE.to_string(),
        }
    }
}

impl PluginSettings {
    pub fn with_overrides(&self, k8s: &KubernetesConf) -> Self {
        let mut settings = self.clone();
        if !k8s.cni_bin_dir.is_empty() {
            settings.bin_dir = PathBuf::from(&k8s.cni_bin_dir);
        }
        if !k8s.intercept_name.is_empty() {
            settings.intercept_type = k8s.intercept_name.clone();
        }
        settings
    }
}

/// Kubernetes identifiers from `CNI_ARGS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubernetesArgs {
    pub ignore_unknown: bool,
    pub ip: Option<IpAddr>,
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_infra_container_id: String,
}

impl KubernetesArgs {
    /// True when the runtime identified a Kubernetes pod
    pub fn is_kubernetes(&self) -> bool {
        !self.pod_name.is_empty() && !self.pod_namespace.is_empty()
    }
}

impl FromStr for KubernetesArgs {
    type Err = CniError;

    /// Parse `K1=V1;K2=V2`; unknown keys fail unless `IgnoreUnknown` is true
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut args = KubernetesArgs::default();
        if s.is_empty() {
            return Ok(args);
        }

        let mut pairs = Vec::new();
        for pair in s.split(';') {
            let kv: Vec<&str> = pair.split('=').collect();
            if kv.len() != 2 {
                return Err(CniError::InvalidArgs(format!("invalid pair {:?}", pair)));
            }
            pairs.push((kv[0], kv[1]));
        }

        // IgnoreUnknown applies regardless of where it appears
        for (key, value) in &pairs {
            if *key == "IgnoreUnknown" {
                args.ignore_unknown = parse_bool(value)?;
            }
        }

        for (key, value) in pairs {
            match key {
                "IgnoreUnknown" => {}
                "IP" => {
                    let ip = value.parse().map_err(|_| {
                        CniError::InvalidArgs(format!("invalid IP address {:?}", value))
                    })?;
                    args.ip = Some(ip);
                }
                "K8S_POD_NAME" => args.pod_name = value.to_string(),
                "K8S_POD_NAMESPACE" => args.pod_namespace = value.to_string(),
                "K8S_POD_INFRA_CONTAINER_ID" => args.pod_infra_container_id = value.to_string(),
                unknown if args.ignore_unknown => {
                    debug!(key = %unknown, "Ignoring unknown CNI argument");
                }
                unknown => {
                    return Err(CniError::InvalidArgs(format!("unknown args [{:?}]", unknown)));
                }
            }
        }

        Ok(args)
    }
}

fn parse_bool(value: &str) -> Result<bool, CniError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(CniError::InvalidArgs(format!(
            "boolean value {:?} is not valid",
            value
        ))),
    }
}

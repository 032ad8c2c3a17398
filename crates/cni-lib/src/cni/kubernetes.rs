//! Pod metadata lookup against the cluster API

use super::config::KubernetesConf;
use super::error::CniError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Snapshot of the pod fields interception decisions use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub containers: Vec<String>,
    pub init_containers: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl From<&Pod> for PodInfo {
    fn from(pod: &Pod) -> Self {
        let spec = pod.spec.as_ref();
        Self {
            containers: spec
                .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            init_containers: spec
                .and_then(|s| s.init_containers.as_ref())
                .map(|ics| ics.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            annotations: pod.metadata.annotations.clone().unwrap_or_default(),
        }
    }
}

/// Fetches pod metadata
#[async_trait]
pub trait PodLookup: Send + Sync {
    async fn pod_info(&self, namespace: &str, name: &str) -> Result<PodInfo, CniError>;
}

/// Creates a pod lookup from the plugin's Kubernetes configuration
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, k8s: &KubernetesConf) -> Result<Box<dyn PodLookup>, CniError>;
}

/// Build the client configuration
///
/// The kubeconfig named in the plugin configuration is used when set,
/// otherwise the environment is inferred. `kubernetesAPIRoot` replaces the
/// server URL either way.
pub async fn client_config(k8s: &KubernetesConf) -> Result<Config, CniError> {
    let mut config = if k8s.kube_config.is_empty() {
        Config::infer()
            .await
            .map_err(|e| CniError::KubeConfig(e.to_string()))?
    } else {
        let kubeconfig = Kubeconfig::read_from(&k8s.kube_config).map_err(|e| {
            CniError::KubeConfig(format!("failed to read {}: {}", k8s.kube_config, e))
        })?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| CniError::KubeConfig(format!("{}: {}", k8s.kube_config, e)))?
    };

    if !k8s.api_root.is_empty() {
        config.cluster_url = k8s.api_root.parse().map_err(|e| {
            CniError::KubeConfig(format!("invalid kubernetesAPIRoot {:?}: {}", k8s.api_root, e))
        })?;
    }

    info!(
        kubeconfig = %k8s.kube_config,
        server = %config.cluster_url,
        "Set up kubernetes client"
    );
    Ok(config)
}

/// Connects with a real `kube` client
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, k8s: &KubernetesConf) -> Result<Box<dyn PodLookup>, CniError> {
        let config = client_config(k8s).await?;
        let client = Client::try_from(config)?;
        Ok(Box::new(KubePodLookup::new(client)))
    }
}

pub struct KubePodLookup {
    client: Client,
}

impl KubePodLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLookup for KubePodLookup {
    async fn pod_info(&self, namespace: &str, name: &str) -> Result<PodInfo, CniError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get(name).await?;
        let info = PodInfo::from(&pod);
        debug!(namespace, name, ?info, "Fetched pod");
        Ok(info)
    }
}

/// Fixed-interval retry with an attempt cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

/// Look up a pod, retrying failed attempts at a fixed interval
pub async fn get_pod_info_with_retry(
    lookup: &dyn PodLookup,
    policy: &RetryPolicy,
    namespace: &str,
    name: &str,
) -> Result<PodInfo, CniError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match lookup.pod_info(namespace, name).await {
            Ok(info) => return Ok(info),
            Err(e) if attempt >= attempts => {
                return Err(CniError::PodLookup {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    attempts,
                    source: Box::new(e),
                })
            }
            Err(e) => {
                warn!(error = %e, retry = attempt, max = attempts, "Waiting for pod metadata");
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}

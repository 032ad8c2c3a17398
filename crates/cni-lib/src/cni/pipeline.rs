//! Per-invocation interception pipeline
//!
//! ADD parses the configuration and arguments, skips pods outside Kubernetes
//! or in excluded namespaces, looks the pod up (with retry), applies the
//! redirect policy and hands the redirect to the configured backend. The
//! result passes the previous plugin's result through unchanged.

use super::config::{parse_config, KubernetesArgs, KubernetesConf, PluginSettings};
use super::error::CniError;
use super::intercept::{default_registry, InterceptRuleRegistry};
use super::kubernetes::{get_pod_info_with_retry, ClusterConnector, KubeConnector, RetryPolicy};
use super::redirect::{decide, InterceptDecision};
use super::result::check_version;
use serde_json::Value;
use tracing::{error, info};

/// Inputs of one plugin invocation
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
    pub stdin: Vec<u8>,
}

pub struct InterceptionPipeline {
    registry: InterceptRuleRegistry,
    connector: Box<dyn ClusterConnector>,
    retry: RetryPolicy,
    defaults: PluginSettings,
}

impl Default for InterceptionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptionPipeline {
    pub fn new() -> Self {
        Self {
            registry: default_registry().clone(),
            connector: Box::new(KubeConnector),
            retry: RetryPolicy::default(),
            defaults: PluginSettings::default(),
        }
    }

    pub fn with_registry(mut self, registry: InterceptRuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_connector(mut self, connector: impl ClusterConnector + 'static) -> Self {
        self.connector = Box::new(connector);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_defaults(mut self, defaults: PluginSettings) -> Self {
        self.defaults = defaults;
        self
    }

    /// Handle ADD, returning the result document to print
    pub async fn cmd_add(&self, args: &CmdArgs) -> Result<Value, CniError> {
        let parsed = parse_config(&args.stdin)?;
        let conf = &parsed.conf;
        check_version(&conf.cni_version)?;
        info!(
            version = %conf.cni_version,
            prev_result = parsed.prev_result.is_some(),
            "CmdAdd config parsed"
        );

        let k8s_args: KubernetesArgs = args.args.parse()?;
        info!(args = %args.args, "Loaded k8s arguments");

        let settings = self.defaults.with_overrides(&conf.kubernetes);

        if !k8s_args.is_kubernetes() {
            info!("Pod is not running under Kubernetes");
        } else if conf
            .kubernetes
            .exclude_namespaces
            .iter()
            .any(|ns| *ns == k8s_args.pod_namespace)
        {
            info!(namespace = %k8s_args.pod_namespace, "Pod is excluded from msm-cni");
        } else {
            self.intercept(&conf.kubernetes, &k8s_args, &settings, &args.netns)
                .await?;
        }

        let result = parsed.prev_result.unwrap_or_default();
        result.to_value(&conf.cni_version)
    }

    async fn intercept(
        &self,
        k8s: &KubernetesConf,
        k8s_args: &KubernetesArgs,
        settings: &PluginSettings,
        netns: &str,
    ) -> Result<(), CniError> {
        let lookup = self.connector.connect(k8s).await.map_err(|e| {
            error!(error = %e, "Failed to create kubernetes client");
            e
        })?;

        let pod = get_pod_info_with_retry(
            lookup.as_ref(),
            &self.retry,
            &k8s_args.pod_namespace,
            &k8s_args.pod_name,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to get pod data");
            e
        })?;

        match decide(&pod) {
            InterceptDecision::NoContainers => {
                info!(pod = %k8s_args.pod_name, "Pod has no containers, skipping redirect");
            }
            InterceptDecision::NoSidecarAnnotation => {
                info!(pod = %k8s_args.pod_name, "Pod excluded - no sidecar annotation");
            }
            InterceptDecision::Redirect(redirect) => {
                info!(pod = %k8s_args.pod_name, containers = ?pod.containers, "Setting up redirect");
                match self.registry.build(settings) {
                    Some(mgr) => mgr.program(netns, &redirect).await?,
                    None => error!(
                        intercept_type = %settings.intercept_type,
                        "Pod redirect failed due to unavailable intercept rule manager"
                    ),
                }
            }
        }

        Ok(())
    }

    /// Handle DEL; all state lives in the pod's namespace and goes with it
    pub async fn cmd_del(&self, _args: &CmdArgs) -> Result<(), CniError> {
        Ok(())
    }

    /// Handle GET and CHECK
    pub async fn cmd_get(&self, _args: &CmdArgs) -> Result<Value, CniError> {
        info!("CmdGet not implemented");
        Err(CniError::NotImplemented("CmdGet"))
    }
}

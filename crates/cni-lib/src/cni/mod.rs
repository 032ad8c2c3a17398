//! The `msm-cni` plugin: configuration, pod lookup, redirect policy and
//! rule-programming backends

pub mod config;
pub mod error;
pub mod intercept;
pub mod iptables;
pub mod kubernetes;
pub mod pipeline;
pub mod redirect;
pub mod result;

pub use config::{parse_config, KubernetesArgs, KubernetesConf, PluginConf, PluginSettings};
pub use error::{CniError, ErrorDocument};
pub use intercept::{default_registry, InterceptRuleMgr, InterceptRuleRegistry};
pub use kubernetes::{ClusterConnector, KubeConnector, PodInfo, PodLookup, RetryPolicy};
pub use pipeline::{CmdArgs, InterceptionPipeline};
pub use redirect::{InterceptDecision, Redirect};
pub use result::{check_version, version_info, CniResult, CURRENT_VERSION, SUPPORTED_VERSIONS};

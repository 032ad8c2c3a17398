//! Rule-programming backends and their registry

use super::config::{PluginSettings, DEFAULT_INTERCEPT_TYPE};
use super::error::CniError;
use super::iptables::IptablesInterceptMgr;
use super::redirect::Redirect;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Programs traffic redirection inside a network namespace
#[async_trait]
pub trait InterceptRuleMgr: Send + Sync {
    async fn program(&self, netns: &str, redirect: &Redirect) -> Result<(), CniError>;
}

/// Builds a backend for one invocation
pub type InterceptRuleMgrCtor =
    Arc<dyn Fn(&PluginSettings) -> Box<dyn InterceptRuleMgr> + Send + Sync>;

/// Backend constructors by name
#[derive(Clone, Default)]
pub struct InterceptRuleRegistry {
    ctors: HashMap<String, InterceptRuleMgrCtor>,
}

impl InterceptRuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ctor` under `name`, replacing any earlier registration
    pub fn register(&mut self, name: impl Into<String>, ctor: InterceptRuleMgrCtor) {
        self.ctors.insert(name.into(), ctor);
    }

    pub fn get(&self, name: &str) -> Option<&InterceptRuleMgrCtor> {
        self.ctors.get(name)
    }

    /// Build the backend called `settings.intercept_type`, if there is one
    pub fn build(&self, settings: &PluginSettings) -> Option<Box<dyn InterceptRuleMgr>> {
        self.get(&settings.intercept_type).map(|ctor| ctor(settings))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Registry with the built-in backends
pub fn default_registry() -> &'static InterceptRuleRegistry {
    static REGISTRY: OnceLock<InterceptRuleRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = InterceptRuleRegistry::new();
        registry.register(DEFAULT_INTERCEPT_TYPE, IptablesInterceptMgr::ctor());
        registry
    })
}

//! CNI error type and the error document returned to the runtime

use serde::{Deserialize, Serialize};
use std::error::Error as _;
use thiserror::Error;

/// Well-known CNI error codes
pub mod codes {
    pub const INCOMPATIBLE_VERSION: u32 = 1;
    pub const INVALID_ENVIRONMENT: u32 = 4;
    pub const DECODING_FAILURE: u32 = 6;
    pub const INVALID_NETWORK_CONFIG: u32 = 7;
    pub const TRY_AGAIN_LATER: u32 = 11;
    pub const RULE_PROGRAMMING: u32 = 100;
    pub const NOT_IMPLEMENTED: u32 = 101;
    pub const INTERNAL: u32 = 102;
}

/// Errors of a single plugin invocation
#[derive(Debug, Error)]
pub enum CniError {
    #[error("incompatible CNI version {0}")]
    IncompatibleVersion(String),

    #[error("required environment variable {0} not set")]
    MissingEnvironment(String),

    #[error("unknown CNI_COMMAND {0:?}")]
    UnknownCommand(String),

    #[error("invalid CNI_ARGS: {0}")]
    InvalidArgs(String),

    #[error("failed to parse network configuration: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("could not parse prevResult: {0}")]
    InvalidResult(String),

    #[error("failed to set up kubernetes client: {0}")]
    KubeConfig(String),

    #[error("kubernetes API request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to get pod {namespace}/{name} after {attempts} attempts")]
    PodLookup {
        namespace: String,
        name: String,
        attempts: u32,
        #[source]
        source: Box<CniError>,
    },

    #[error("failed to program redirect rules in {netns}: {reason}")]
    Program { netns: String, reason: String },

    #[error("{0} not implemented")]
    NotImplemented(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CniError {
    /// CNI error code reported to the runtime
    pub fn code(&self) -> u32 {
        match self {
            CniError::IncompatibleVersion(_) => codes::INCOMPATIBLE_VERSION,
            CniError::MissingEnvironment(_)
            | CniError::UnknownCommand(_)
            | CniError::InvalidArgs(_) => codes::INVALID_ENVIRONMENT,
            CniError::Decode(_) | CniError::InvalidResult(_) => codes::DECODING_FAILURE,
            CniError::KubeConfig(_) => codes::INVALID_NETWORK_CONFIG,
            CniError::Kube(_) | CniError::PodLookup { .. } => codes::TRY_AGAIN_LATER,
            CniError::Program { .. } => codes::RULE_PROGRAMMING,
            CniError::NotImplemented(_) => codes::NOT_IMPLEMENTED,
            CniError::Internal(_) => codes::INTERNAL,
        }
    }

    /// Error document in the shape the runtime expects on stdout
    pub fn to_document(&self, cni_version: &str) -> ErrorDocument {
        ErrorDocument {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details: self.source().map(|s| s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDocument {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

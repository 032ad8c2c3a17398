//! Redirect policy for a workload

use super::kubernetes::PodInfo;
use std::fmt;

/// Annotation marking a pod for sidecar interception
pub const SIDECAR_ANNOTATION: &str = "sidecar.mediastreamingmesh.io/inject";

pub const DEFAULT_REDIRECT_TO_PORT: u16 = 8554;
pub const DEFAULT_NO_REDIRECT_UID: u32 = 1337;
pub const DEFAULT_NO_REDIRECT_DEST: &str = "127.0.0.0/8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    Redirect,
}

impl RedirectMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectMode::Redirect => "REDIRECT",
        }
    }
}

impl fmt::Display for RedirectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interception parameters for one workload
///
/// Only constructed complete; never modified after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    target_port: u16,
    mode: RedirectMode,
    no_redirect_uid: u32,
    no_redirect_dest: String,
}

impl Redirect {
    /// Redirect for `pod`; every pod currently gets the fixed defaults
    pub fn for_pod(_pod: &PodInfo) -> Self {
        Self {
            target_port: DEFAULT_REDIRECT_TO_PORT,
            mode: RedirectMode::Redirect,
            no_redirect_uid: DEFAULT_NO_REDIRECT_UID,
            no_redirect_dest: DEFAULT_NO_REDIRECT_DEST.to_string(),
        }
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn mode(&self) -> RedirectMode {
        self.mode
    }

    pub fn no_redirect_uid(&self) -> u32 {
        self.no_redirect_uid
    }

    pub fn no_redirect_dest(&self) -> &str {
        &self.no_redirect_dest
    }
}

/// Outcome of the redirect policy for one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptDecision {
    Redirect(Redirect),
    NoContainers,
    NoSidecarAnnotation,
}

/// Decide whether `pod` gets intercepted
///
/// The annotation only has to be present; its value is not inspected.
pub fn decide(pod: &PodInfo) -> InterceptDecision {
    if pod.containers.is_empty() {
        return InterceptDecision::NoContainers;
    }
    if !pod.annotations.contains_key(SIDECAR_ANNOTATION) {
        return InterceptDecision::NoSidecarAnnotation;
    }
    InterceptDecision::Redirect(Redirect::for_pod(pod))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(containers: &[&str], annotated: bool) -> PodInfo {
        let mut pod = PodInfo {
            containers: containers.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        };
        if annotated {
            pod.annotations
                .insert(SIDECAR_ANNOTATION.to_string(), "true".to_string());
        }
        pod
    }

    #[test]
    fn test_annotated_pod_is_redirected() {
        let decision = decide(&pod(&["rtsp-server"], true));

        let InterceptDecision::Redirect(redirect) = decision else {
            panic!("expected a redirect, got {:?}", decision);
        };
        assert_eq!(redirect.target_port(), 8554);
        assert_eq!(redirect.mode().as_str(), "REDIRECT");
        assert_eq!(redirect.no_redirect_uid(), 1337);
        assert_eq!(redirect.no_redirect_dest(), "127.0.0.0/8");
    }

    #[test]
    fn test_missing_annotation() {
        assert_eq!(
            decide(&pod(&["rtsp-server"], false)),
            InterceptDecision::NoSidecarAnnotation
        );
    }

    #[test]
    fn test_no_containers() {
        assert_eq!(decide(&pod(&[], true)), InterceptDecision::NoContainers);
    }
}

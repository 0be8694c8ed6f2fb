//! §7 error taxonomy: one `thiserror` enum per component boundary,
//! composed into [`ConnprobeError`] for the binaries.

use thiserror::Error;

/// Errors raised while constructing or inverting a [`crate::host::Host`].
#[derive(Debug, Error)]
pub enum HostError {
    #[error("identifier '{0}' does not match any known host grammar")]
    UnrecognizedIdentifier(String),

    #[error("label selector segment '{0}' is not a valid k=v pair")]
    MalformedLabelSelector(String),

    #[error("cannot invert a universal host (LocalHost/ExternalHost)")]
    InvertUniversalHost,
}

/// Errors raised while translating a `NetworkPolicy` into [`crate::rule::Rule`]s.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("NetworkPolicy {namespace}/{name} uses a matchExpressions selector, which is unsupported")]
    UnsupportedSelector { namespace: String, name: String },

    #[error("NetworkPolicy {0} has no podSelector")]
    MissingPodSelector(String),
}

/// Non-fatal, per-case outcome recorded instead of propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseError {
    /// No cluster port mapping could be found for a positive case.
    MissingPort,
    /// The sender side of a case cannot be materialized in-cluster
    /// (e.g. a `LocalHost`/`ExternalHost` sender).
    UnsupportedSender(String),
}

impl std::fmt::Display for CaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseError::MissingPort => write!(f, "no port mapping available"),
            CaseError::UnsupportedSender(reason) => {
                write!(f, "unsupported sender: {reason}")
            }
        }
    }
}

/// Fatal orchestrator-phase errors (P1-P7).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("daemon set did not become ready within the retry budget")]
    DaemonNotReady,

    #[error("cluster nodes disagree on, or do not report, a container runtime version")]
    AmbiguousRuntime,

    #[error("unsupported container runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("cannot choose a free port: {0}")]
    PortExhausted(String),

    #[error("yaml (de)serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Collector(#[from] CollectorError),
}

/// Fatal runner errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("unsupported container runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("failed to resolve network namespace for pod {namespace}/{pod}: {reason}")]
    NamespaceResolution {
        namespace: String,
        pod: String,
        reason: String,
    },

    #[error("failed to enter network namespace {0}: {1}")]
    NamespaceEntry(String, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Fatal collector errors (anything other than `NotFound` while polling).
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("result collection did not complete within the retry budget: {missing:?} runner(s) never reported")]
    Timeout { missing: Vec<String> },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level error type for the two binaries.
#[derive(Debug, Error)]
pub enum ConnprobeError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Config(#[from] anyhow::Error),
}
